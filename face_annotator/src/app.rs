use crate::camera::OpenCvCameraOpener;
use crate::config::Config;
use crate::lifecycle::{Lifecycle, LifecycleEvent};
use crate::server::{HttpServer, SharedState};
use crate::session::{start_session, SessionSettings};
use crate::stream::Preview;
use crate::telemetry::Metrics;
use face_inference::OrtModelLoader;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new()?);
    metrics.install_global();
    let lifecycle = Arc::new(Lifecycle::new());
    let preview = Arc::new(Preview::new());

    let state = SharedState {
        lifecycle: lifecycle.clone(),
        preview: preview.clone(),
        metrics: metrics.clone(),
        video_stream_delay: config.camera.get_stream_delay_ms(),
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    let startup = start_session(
        OrtModelLoader::new(config.models.clone()),
        OpenCvCameraOpener::new(config.camera.clone()),
        SessionSettings::from(&config),
        lifecycle.clone(),
        preview,
        metrics,
    );

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut interrupted = false;

    let session = tokio::select! {
        result = startup => match result {
            Ok(session) => {
                tracing::info!("Annotating faces at {}", session.display());
                Some(session)
            }
            Err(e) => {
                tracing::error!("Startup failed, serving status only: {}", e);
                None
            }
        },
        _ = &mut signal => {
            interrupted = true;
            None
        }
    };

    if !interrupted {
        signal.await;
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    match session {
        Some(session) => session.shutdown().await,
        None => {
            if let Err(e) = lifecycle.apply(LifecycleEvent::Shutdown) {
                tracing::warn!("{}", e);
            }
        }
    }

    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = server_handle.await {
        tracing::error!("HTTP server error: {}", e);
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

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
