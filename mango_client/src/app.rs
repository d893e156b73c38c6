use crate::api::{HttpInferenceApi, InferenceApi};
use crate::camera::DirectoryFrameSource;
use crate::config::Config;
use crate::detection_loop::DetectionLoop;
use crate::monitor::AvailabilityMonitor;
use crate::pipeline::SubmissionPipeline;
use crate::server::{HttpServer, SharedState};
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let api: Arc<dyn InferenceApi> = match HttpInferenceApi::new(&config.backend) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            tracing::error!("Failed to initialize backend client: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!("Using inference backend at {}", config.backend.base_url);

    let metrics = Arc::new(Metrics::new()?);

    let pipeline = Arc::new(SubmissionPipeline::new(
        api.clone(),
        &config.upload,
        config.backend.request_timeout(),
    ));

    let monitor = Arc::new(AvailabilityMonitor::new(
        api.clone(),
        &config.monitor,
        &config.backend,
    ));

    let detection_loop = match config.realtime.frames_dir.as_deref() {
        Some(dir) => {
            let source = match DirectoryFrameSource::new(
                dir,
                config.realtime.frame_width,
                config.realtime.frame_height,
            ) {
                Ok(source) => Arc::new(source),
                Err(e) => {
                    tracing::error!("Failed to initialize frame source: {:?}", e);
                    return Err(Box::new(e));
                }
            };
            let detection_loop =
                DetectionLoop::new(api.clone(), source, config.realtime.poll_interval())
                    .with_frame_size(config.realtime.frame_size())
                    .with_metrics(metrics.clone());
            Some(Arc::new(detection_loop))
        }
        None => {
            tracing::info!("No frames directory configured, real-time detection disabled");
            None
        }
    };

    let state = SharedState {
        pipeline: pipeline.clone(),
        monitor: monitor.clone(),
        detection_loop: detection_loop.clone(),
        metrics,
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();
    let monitor_shutdown_rx = shutdown_tx.subscribe();

    let monitor_handle = tokio::spawn(monitor.run(monitor_shutdown_rx));
    if let Some(detection_loop) = detection_loop.as_ref() {
        detection_loop.start();
    }
    let server_handle = server.run(server_shutdown_rx);

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    if let Some(detection_loop) = detection_loop.as_ref() {
        detection_loop.stop().await;
    }
    pipeline.teardown();
    let _ = monitor_handle.await;
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Console server failed: {:?}", e),
        Err(e) => tracing::error!("Console server task failed: {:?}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
