use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use carebridge_client::{FhirClientPool, PoolConfig, SourceConfig};
use carebridge_core::{DeliveryMode, Error, EventDispatcher, Resource, events::subscriber};

fn connection_string(server: &MockServer) -> String {
    let base = server.uri();
    let host_port = base.strip_prefix("http://").unwrap();
    format!(
        "fhir+http://{host_port}/fhir?client_id=abc&client_secret=xyz&token_url={base}/token"
    )
}

fn topics_subscriber(
    dispatcher: &EventDispatcher,
    pattern: &str,
) -> Arc<Mutex<Vec<String>>> {
    let topics = Arc::new(Mutex::new(Vec::new()));
    let sink = topics.clone();
    dispatcher
        .subscribe(
            pattern,
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

async fn mount_token(server: &MockServer, token: &str, expected_posts: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "expires_in": 3600,
        })))
        .expect(expected_posts)
        .mount(server)
        .await;
}

#[tokio::test]
async fn read_with_client_credentials_fetches_token_once() {
    let server = MockServer::start().await;
    mount_token(&server, "tk1", 1).await;

    let patient = json!({"resourceType": "Patient", "id": "123", "active": true});
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/123"))
        .and(header("authorization", "Bearer tk1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(patient.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = EventDispatcher::new_shared();
    let topics = topics_subscriber(&dispatcher, "fhir.*");
    let pool = FhirClientPool::with_dispatcher(PoolConfig::default(), dispatcher.clone());
    pool.add_source("m", &connection_string(&server)).unwrap();

    let resource = pool.read("Patient", "123", Some("m")).await.unwrap();
    assert_eq!(resource.to_json(), patient);

    let seen = topics.lock().unwrap().clone();
    assert_eq!(seen, vec!["fhir.read", "fhir.patient.read"]);
}

#[tokio::test]
async fn forced_refresh_on_401_retries_exactly_once() {
    let server = MockServer::start().await;

    // Token endpoint hands out tk1 first, then tk2.
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tk1",
            "expires_in": 3600,
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_token(&server, "tk2", 1).await;

    Mock::given(method("GET"))
        .and(path("/fhir/Patient/123"))
        .and(header("authorization", "Bearer tk1"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": "invalid_token"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/123"))
        .and(header("authorization", "Bearer tk2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Patient", "id": "123"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = EventDispatcher::new_shared();
    let topics = topics_subscriber(&dispatcher, "fhir.*");
    let pool = FhirClientPool::with_dispatcher(PoolConfig::default(), dispatcher.clone());
    pool.add_source("m", &connection_string(&server)).unwrap();

    let resource = pool.read("Patient", "123", Some("m")).await.unwrap();
    assert_eq!(resource.id.as_deref(), Some("123"));

    // One success event pair, no error event.
    let seen = topics.lock().unwrap().clone();
    assert_eq!(seen, vec!["fhir.read", "fhir.patient.read"]);
}

#[tokio::test]
async fn second_401_surfaces_authentication_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tk", "expires_in": 3600,
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/123"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    pool.add_source("m", &connection_string(&server)).unwrap();

    let err = pool.read("Patient", "123", Some("m")).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)));
}

#[tokio::test]
async fn concurrent_requests_share_one_token_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "tk1", "expires_in": 3600}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p"))
        .and(header("authorization", "Bearer tk1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Patient", "id": "p"
        })))
        .expect(5)
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    pool.add_source("m", &connection_string(&server)).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(
            async move { pool.read("Patient", "p", None).await },
        ));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn jwt_assertion_posts_signed_client_assertion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(
            "client_assertion_type=urn%3Aietf%3Aparams%3Aoauth%3Aclient-assertion-type%3Ajwt-bearer",
        ))
        .and(body_string_contains("client_assertion="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tk-jwt", "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/1"))
        .and(header("authorization", "Bearer tk-jwt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Patient", "id": "1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let key_path = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/test_signing_key.pem"
    );
    let base = server.uri();
    let host_port = base.strip_prefix("http://").unwrap();
    let conn = format!(
        "fhir+http://{host_port}/fhir?client_id=abc&client_secret_path={key_path}&token_url={base}/token&use_jwt_assertion=true&audience={base}"
    );

    let pool = FhirClientPool::new(PoolConfig::default());
    pool.add_source("epic", &conn).unwrap();

    let resource = pool.read("Patient", "1", None).await.unwrap();
    assert_eq!(resource.id.as_deref(), Some("1"));
}

#[tokio::test]
async fn pool_cap_bounds_concurrent_connections() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"resourceType": "Patient", "id": "slow"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(5)
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig {
        max_connections: 2,
        ..PoolConfig::default()
    });
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("slow", base)).unwrap();

    // Sample the in-use gauge while the reads run.
    let violated = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let pool = pool.clone();
        let violated = violated.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                if pool.pool_status().in_use > 2 {
                    violated.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.read("Patient", "slow", None).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    let elapsed = started.elapsed();
    done.store(true, Ordering::SeqCst);
    sampler.await.unwrap();

    assert!(!violated.load(Ordering::SeqCst), "in-use exceeded the cap");
    // Five 200 ms reads through two slots take three waves.
    assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");
    assert!(pool.pool_status().total_connections <= 2);
}

#[tokio::test]
async fn server_error_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/1"))
        .respond_with(ResponseTemplate::new(503).append_header("retry-after", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Patient", "id": "1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    assert!(pool.read("Patient", "1", None).await.is_ok());
}

#[tokio::test]
async fn persistent_server_error_surfaces_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/1"))
        .respond_with(ResponseTemplate::new(503).append_header("retry-after", "0"))
        .expect(3) // initial + two retries
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    let err = pool.read("Patient", "1", None).await.unwrap_err();
    assert!(matches!(err, Error::Upstream { status: 503, .. }));
}

#[tokio::test]
async fn client_error_surfaces_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/1"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad id"))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = EventDispatcher::new_shared();
    let topics = topics_subscriber(&dispatcher, "fhir.*");
    let pool = FhirClientPool::with_dispatcher(PoolConfig::default(), dispatcher.clone());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    let err = pool.read("Patient", "1", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let seen = topics.lock().unwrap().clone();
    assert_eq!(seen, vec!["fhir.read.error"]);
}

#[tokio::test]
async fn read_missing_resource_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    let err = pool.read("Patient", "missing", None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn delete_missing_resource_returns_false() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Patient/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fhir/Patient/present"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    assert!(!pool.delete("Patient", "gone", None).await.unwrap());
    assert!(pool.delete("Patient", "present", None).await.unwrap());
}

#[tokio::test]
async fn malformed_body_maps_to_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    let err = pool.read("Patient", "1", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
}

#[tokio::test]
async fn create_copies_server_assigned_id() {
    let server = MockServer::start().await;
    let submitted = json!({
        "resourceType": "Patient",
        "active": true,
        "name": [{"family": "Doe"}]
    });
    let stored = json!({
        "resourceType": "Patient",
        "id": "srv-1",
        "meta": {"versionId": "1"},
        "active": true,
        "name": [{"family": "Doe"}]
    });

    Mock::given(method("POST"))
        .and(path("/fhir/Patient"))
        .respond_with(ResponseTemplate::new(201).set_body_json(stored.clone()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/srv-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stored.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    let created = pool
        .create(Resource::from_json(submitted.clone()).unwrap(), None)
        .await
        .unwrap();
    assert_eq!(created.id.as_deref(), Some("srv-1"));
    assert_eq!(created.version_id(), Some("1"));

    // read ∘ create returns the submitted resource plus id and versionId.
    let read_back = pool.read("Patient", "srv-1", None).await.unwrap();
    let mut stripped = read_back.to_json();
    let object = stripped.as_object_mut().unwrap();
    object.remove("id");
    object.remove("meta");
    assert_json_diff::assert_json_eq!(stripped, submitted);
}

#[tokio::test]
async fn update_of_read_resource_is_idempotent() {
    let server = MockServer::start().await;
    let stored = json!({
        "resourceType": "Patient",
        "id": "p1",
        "meta": {"versionId": "2"},
        "active": true
    });
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stored.clone()))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/fhir/Patient/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stored.clone()))
        .expect(2)
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    let first = pool.read("Patient", "p1", None).await.unwrap();
    let after_first = pool.update(first, None).await.unwrap();
    let second = pool.read("Patient", "p1", None).await.unwrap();
    let after_second = pool.update(second, None).await.unwrap();

    assert_eq!(after_first.version_id(), after_second.version_id());
}

#[tokio::test]
async fn update_without_id_is_rejected() {
    let pool = FhirClientPool::new(PoolConfig::default());
    pool.add_source_config(SourceConfig::new(
        "m",
        Url::parse("http://127.0.0.1:1/fhir").unwrap(),
    ))
    .unwrap();

    let resource = Resource::from_json(json!({"resourceType": "Patient"})).unwrap();
    let err = pool.update(resource, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn search_preserves_entry_order() {
    let server = MockServer::start().await;
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": 3,
        "entry": [
            {"resource": {"resourceType": "Observation", "id": "b"}},
            {"resource": {"resourceType": "Observation", "id": "a"}},
            {"resource": {"resourceType": "Observation", "id": "c"}}
        ]
    });
    Mock::given(method("GET"))
        .and(path("/fhir/Observation"))
        .and(query_param("patient", "123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bundle))
        .expect(1)
        .mount(&server)
        .await;

    let pool = FhirClientPool::new(PoolConfig::default());
    let base = Url::parse(&format!("{}/fhir", server.uri())).unwrap();
    pool.add_source_config(SourceConfig::new("m", base)).unwrap();

    let result = pool
        .search("Observation", &[("patient", "123")], None)
        .await
        .unwrap();
    let ids: Vec<&str> = result
        .resources()
        .map(|r| r.id.as_deref().unwrap())
        .collect();
    assert_eq!(ids, vec!["b", "a", "c"]);
}
