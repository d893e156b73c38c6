use crate::{
    config::ServerConfig, detection_loop::DetectionLoop, monitor::AvailabilityMonitor,
    pipeline::SubmissionPipeline, routes::api_routes, telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub pipeline: Arc<SubmissionPipeline>,
    pub monitor: Arc<AvailabilityMonitor>,
    pub detection_loop: Option<Arc<DetectionLoop>>,
    pub metrics: Arc<Metrics>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = Router::new()
            .merge(api_routes())
            .with_state(state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self, mut shutdown_rx: Receiver<()>) -> JoinHandle<anyhow::Result<()>> {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Starting console on {}", addr),
            Err(e) => tracing::warn!("Starting console on unknown address: {}", e),
        }

        let listener = self.listener;
        let router = self.router;
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            tracing::info!("Console server stopped");
            Ok(())
        })
    }
}
