use std::sync::Arc;

use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use carebridge_client::FhirClientPool;
use carebridge_core::EventDispatcher;
use carebridge_gateway::{CdsHooksService, FhirGateway, NoteReaderService};

use crate::config::AppConfig;
use crate::host::HostApp;

/// Build the default host wiring from configuration: one dispatcher, one
/// client pool fed by the configured sources, and the three protocol
/// gateways with empty handler registries. Embedding applications that
/// register their own handlers assemble a [`HostApp`] directly instead.
pub fn build_default_host(
    config: &AppConfig,
) -> anyhow::Result<(Arc<EventDispatcher>, FhirClientPool, HostApp)> {
    let dispatcher = Arc::new(EventDispatcher::with_source(config.events.source.clone()));

    let pool =
        FhirClientPool::with_dispatcher(config.pool.to_pool_config(), dispatcher.clone());
    for (name, connection_string) in &config.sources {
        pool.add_source(name.clone(), connection_string)
            .map_err(|e| anyhow::anyhow!("source '{name}': {e}"))?;
    }

    let mut host = HostApp::new("carebridge", dispatcher.clone());
    host.register_gateway(
        FhirGateway::builder("fhir", pool.clone()).build(),
        Some("/fhir"),
    )
    .map_err(|e| anyhow::anyhow!("mounting fhir gateway: {e}"))?;
    host.register_service(
        CdsHooksService::builder_with_dispatcher("cds", dispatcher.clone()).build(),
        Some("/cds"),
    )
    .map_err(|e| anyhow::anyhow!("mounting cds service: {e}"))?;
    host.register_service(
        NoteReaderService::builder_with_dispatcher("notereader", dispatcher.clone()).build(),
        Some("/notereader"),
    )
    .map_err(|e| anyhow::anyhow!("mounting notereader service: {e}"))?;

    Ok((dispatcher, pool, host))
}

/// The composed HTTP process.
pub struct CarebridgeServer {
    config: AppConfig,
    host: Arc<HostApp>,
    pool: FhirClientPool,
}

impl CarebridgeServer {
    pub fn new(config: AppConfig, host: HostApp, pool: FhirClientPool) -> Self {
        Self {
            config,
            host: Arc::new(host),
            pool,
        }
    }

    /// The full application router, with tracing and compression layers.
    pub fn router(&self) -> Router {
        self.host
            .clone()
            .router()
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
    }

    pub fn host(&self) -> &Arc<HostApp> {
        &self.host
    }

    /// Serve until a shutdown signal arrives, then drain in-flight
    /// requests within the grace period, close the pool and cancel async
    /// event deliveries.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.addr();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "Carebridge host listening");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, self.router()).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let server_task = tokio::spawn(server.into_future());

        shutdown_signal().await;
        info!("Shutdown signal received, draining in-flight requests");
        let _ = shutdown_tx.send(());

        let grace = self.config.server.shutdown_grace();
        match tokio::time::timeout(grace, server_task).await {
            Ok(joined) => {
                joined??;
            }
            Err(_elapsed) => {
                warn!(?grace, "Grace period elapsed with requests still in flight");
            }
        }

        self.pool.close();
        self.host.dispatcher().shutdown();
        info!("Carebridge host stopped");
        Ok(())
    }
}

/// Resolves when SIGINT (ctrl-c) or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
