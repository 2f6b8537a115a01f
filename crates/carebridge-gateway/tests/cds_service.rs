use std::sync::{Arc, Mutex};

use axum::Router;
use serde_json::{Value, json};

use carebridge_core::{DeliveryMode, Error, EventDispatcher, events::subscriber};
use carebridge_gateway::{Card, CdsHooksService, Gateway, cds_handler};

async fn serve(router: Router) -> (String, tokio::sync::oneshot::Sender<()>) {
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (format!("http://{addr}"), tx)
}

fn topics_sink(dispatcher: &EventDispatcher) -> Arc<Mutex<Vec<String>>> {
    let topics = Arc::new(Mutex::new(Vec::new()));
    let sink = topics.clone();
    dispatcher
        .subscribe(
            "cds.*",
            DeliveryMode::Sync,
            subscriber(move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event.topic.as_str().to_string());
                    Ok(())
                }
            }),
        )
        .unwrap();
    topics
}

fn hello_service(dispatcher: Arc<EventDispatcher>) -> Arc<CdsHooksService> {
    CdsHooksService::builder_with_dispatcher("cds", dispatcher)
        .hook(
            "patient-view",
            "alerts",
            cds_handler(|_request| async { Ok(vec![Card::info("Hello", "carebridge")]) }),
        )
        .unwrap()
        .build()
}

fn minimal_request(hook: &str) -> Value {
    json!({
        "hook": hook,
        "hookInstance": "d1577c69-dfbe-44ad-ba6d-3e05e953b2ea",
        "context": {"patientId": "123"}
    })
}

#[tokio::test]
async fn discovery_lists_registered_services() {
    let dispatcher = EventDispatcher::new_shared();
    let service = hello_service(dispatcher);
    let (base, shutdown) = serve(service.router()).await;

    let body: Value = reqwest::get(format!("{base}/cds-services"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let services = body["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["id"], "alerts");
    assert_eq!(services[0]["hook"], "patient-view");
    let _ = shutdown.send(());
}

#[tokio::test]
async fn hook_execution_returns_cards_and_emits_event() {
    let dispatcher = EventDispatcher::new_shared();
    let topics = topics_sink(&dispatcher);
    let service = hello_service(dispatcher);
    let (base, shutdown) = serve(service.router()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/cds-services/alerts"))
        .json(&minimal_request("patient-view"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["cards"][0]["summary"], "Hello");
    assert_eq!(body["cards"][0]["indicator"], "info");
    assert_eq!(body["cards"][0]["source"]["label"], "carebridge");

    let seen = topics.lock().unwrap().clone();
    assert_eq!(seen, vec!["cds.patient.view"]);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn unknown_service_id_is_404() {
    let dispatcher = EventDispatcher::new_shared();
    let service = hello_service(dispatcher);
    let (base, shutdown) = serve(service.router()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/cds-services/nope"))
        .json(&minimal_request("patient-view"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "NotRegisteredError");
    assert!(body["requestId"].is_string());
    let _ = shutdown.send(());
}

#[tokio::test]
async fn mismatched_hook_is_400_with_specific_failure() {
    let dispatcher = EventDispatcher::new_shared();
    let service = hello_service(dispatcher);
    let (base, shutdown) = serve(service.router()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/cds-services/alerts"))
        .json(&minimal_request("order-sign"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "InvalidArgumentError");
    assert!(body["detail"].as_str().unwrap().contains("order-sign"));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn missing_required_fields_are_400() {
    let dispatcher = EventDispatcher::new_shared();
    let service = hello_service(dispatcher);
    let (base, shutdown) = serve(service.router()).await;

    for body in [
        json!({"hookInstance": "h", "context": {}}),
        json!({"hook": "patient-view", "context": {}}),
        json!({"hook": "patient-view", "hookInstance": "h"}),
    ] {
        let response = reqwest::Client::new()
            .post(format!("{base}/cds-services/alerts"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "body: {body}");
    }
    let _ = shutdown.send(());
}

#[tokio::test]
async fn handler_failure_is_500_internal_and_emits_error_event() {
    let dispatcher = EventDispatcher::new_shared();
    let topics = topics_sink(&dispatcher);
    let service = CdsHooksService::builder_with_dispatcher("cds", dispatcher)
        .hook(
            "encounter-discharge",
            "discharge",
            cds_handler(|_request| async { Err(Error::internal("handler blew up")) }),
        )
        .unwrap()
        .build();
    let (base, shutdown) = serve(service.router()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/cds-services/discharge"))
        .json(&minimal_request("encounter-discharge"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "internal"}));

    let seen = topics.lock().unwrap().clone();
    assert_eq!(seen, vec!["cds.encounter.discharge.error"]);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn declared_hooks_with_no_cards_return_empty_list() {
    let dispatcher = EventDispatcher::new_shared();
    let service = CdsHooksService::builder_with_dispatcher("cds", dispatcher)
        .hook(
            "order-select",
            "order-watch",
            cds_handler(|_request| async { Ok(Vec::new()) }),
        )
        .unwrap()
        .build();
    let (base, shutdown) = serve(service.router()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/cds-services/order-watch"))
        .json(&minimal_request("order-select"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"cards": []}));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn gateway_status_reports_hooks() {
    let dispatcher = EventDispatcher::new_shared();
    let service = hello_service(dispatcher);

    let status = Gateway::status(&service).await;
    assert_eq!(status.name, "cds");
    assert_eq!(status.operations, vec!["patient-view:alerts"]);
    assert!(status.events_enabled);
    assert!(status.pool.is_none());
}
