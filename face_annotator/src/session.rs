use crate::camera::{CameraError, CameraOpener, FrameSource};
use crate::config::{Config, PollingConfig};
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleEvent};
use crate::overlay::{OverlayCanvas, OverlayError, OverlayStyle};
use crate::prediction::{PollerExit, PollerSettings, PredictionPoller};
use crate::stream::Preview;
use crate::telemetry::Metrics;
use face_inference::{DisplaySize, ModelLoadError, ModelLoader};
use opencv::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::broadcast,
    task::{spawn_blocking, JoinError, JoinHandle},
    time::{sleep, timeout, Duration},
};

const FIRST_FRAME_RETRY: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Model loading failed: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("Camera failed: {0}")]
    Camera(#[from] CameraError),
    #[error("No frame from the camera within {0} ms")]
    FirstFrameTimeout(u64),
    #[error("Failed to create the overlay canvas: {0}")]
    Overlay(#[from] OverlayError),
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Startup task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub polling: PollingConfig,
    pub display: Option<DisplaySize>,
    pub style: OverlayStyle,
    pub first_frame_timeout: Duration,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            polling: config.polling.clone(),
            display: config.display,
            style: OverlayStyle::from(&config.overlay),
            first_frame_timeout: Duration::from_millis(config.camera.first_frame_timeout_ms),
        }
    }
}

/// A running detection session. Holds the only handles to the camera
/// besides the preview; both are released by [`Session::shutdown`].
/// Dropping the session without shutting it down still stops the poller.
pub struct Session {
    shutdown_tx: broadcast::Sender<()>,
    poller: JoinHandle<()>,
    preview: Arc<Preview>,
    lifecycle: Arc<Lifecycle>,
    display: DisplaySize,
}

impl Session {
    pub fn display(&self) -> DisplaySize {
        self.display
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.poller.await {
            tracing::warn!("Prediction poller ended abnormally: {}", e);
        }
        self.preview.detach();

        if let Err(e) = self.lifecycle.apply(LifecycleEvent::Shutdown) {
            tracing::warn!("{}", e);
        }
        tracing::info!("Session stopped");
    }
}

/// Loads the models, then opens the camera, waits for its first frame and
/// starts polling. Each failure is recorded on `lifecycle` before returning.
pub async fn start_session<L, O>(
    loader: L,
    opener: O,
    settings: SessionSettings,
    lifecycle: Arc<Lifecycle>,
    preview: Arc<Preview>,
    metrics: Arc<Metrics>,
) -> Result<Session, StartupError>
where
    L: ModelLoader,
    O: CameraOpener,
{
    lifecycle.apply(LifecycleEvent::LoadModels)?;
    let analyzer = match spawn_blocking(move || loader.load()).await? {
        Ok(analyzer) => Arc::new(analyzer),
        Err(e) => {
            lifecycle.apply(LifecycleEvent::ModelLoadFailed(e.to_string()))?;
            return Err(e.into());
        }
    };
    lifecycle.apply(LifecycleEvent::ModelsLoaded)?;

    lifecycle.apply(LifecycleEvent::StartCamera)?;
    let source: Arc<dyn FrameSource> = match spawn_blocking(move || opener.open()).await? {
        Ok(source) => Arc::new(source),
        Err(e) => {
            lifecycle.apply(LifecycleEvent::CameraFailed(e.to_string()))?;
            return Err(e.into());
        }
    };
    lifecycle.apply(LifecycleEvent::CameraOpened)?;

    let first_frame = timeout(settings.first_frame_timeout, poll_first_frame(source.clone()))
        .await
        .unwrap_or_else(|_| {
            Err(StartupError::FirstFrameTimeout(
                settings.first_frame_timeout.as_millis() as u64,
            ))
        });
    let frame_size = match first_frame {
        Ok(size) => size,
        Err(e) => {
            lifecycle.apply(LifecycleEvent::CameraFailed(e.to_string()))?;
            return Err(e);
        }
    };
    if frame_size != source.resolution() {
        tracing::debug!(
            "Camera reports {} but delivers {} frames",
            source.resolution(),
            frame_size
        );
    }

    let display = settings.display.unwrap_or(frame_size);
    let canvas = match OverlayCanvas::new(display, settings.style.font_scale) {
        Ok(canvas) => Arc::new(Mutex::new(canvas)),
        Err(e) => {
            lifecycle.apply(LifecycleEvent::CameraFailed(e.to_string()))?;
            return Err(e.into());
        }
    };
    preview.attach(source.clone(), canvas.clone());
    lifecycle.apply(LifecycleEvent::FirstFrame)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let poller = PredictionPoller::new(
        source,
        analyzer,
        canvas,
        PollerSettings::new(&settings.polling, display, settings.style),
        metrics,
    );
    let poller = tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move {
            if let PollerExit::Halted(reason) = poller.run(shutdown_rx).await {
                if let Err(e) = lifecycle.apply(LifecycleEvent::DetectionHalted(reason)) {
                    tracing::warn!("{}", e);
                }
            }
        }
    });

    Ok(Session {
        shutdown_tx,
        poller,
        preview,
        lifecycle,
        display,
    })
}

/// Size of the first frame the camera actually delivers.
async fn poll_first_frame(source: Arc<dyn FrameSource>) -> Result<DisplaySize, StartupError> {
    loop {
        let reader = source.clone();
        if let Some(frame) = spawn_blocking(move || reader.read_frame()).await?? {
            return Ok(DisplaySize::new(frame.cols() as u32, frame.rows() as u32));
        }
        sleep(FIRST_FRAME_RETRY).await;
    }
}
