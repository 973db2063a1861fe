use crate::camera::{CameraError, FrameSource};
use crate::config::PollingConfig;
use crate::overlay::{mat_to_rgb, render_detections, OverlayError, OverlayStyle, Surface};
use crate::telemetry::Metrics;
use face_inference::{resize_results, DisplaySize, FaceAnalyzer, InferenceError};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::broadcast,
    task::{spawn_blocking, JoinError},
    time::{interval, timeout, Duration, Instant, MissedTickBehavior},
};
use tracing::instrument;

/// How long shutdown waits for a cycle that is already running.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum TickError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("Frame conversion failed: {0}")]
    Frame(OverlayError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Overlay rendering failed: {0}")]
    Render(OverlayError),
    #[error("Blocking task failed: {0}")]
    Join(#[from] JoinError),
}

impl TickError {
    pub fn kind(&self) -> &'static str {
        match self {
            TickError::Camera(_) => "camera",
            TickError::Frame(_) => "frame",
            TickError::Inference(_) => "inference",
            TickError::Render(_) => "render",
            TickError::Join(_) => "join",
        }
    }
}

/// Why the polling loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerExit {
    Shutdown,
    Halted(String),
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub display: DisplaySize,
    pub style: OverlayStyle,
    pub interval: Duration,
    /// 0 keeps polling regardless of failures.
    pub max_consecutive_failures: u64,
}

impl PollerSettings {
    pub fn new(polling: &PollingConfig, display: DisplaySize, style: OverlayStyle) -> Self {
        Self {
            display,
            style,
            interval: Duration::from_millis(polling.interval_ms.max(1)),
            max_consecutive_failures: polling.max_consecutive_failures,
        }
    }
}

pub struct PredictionPoller<A, S> {
    source: Arc<dyn FrameSource>,
    analyzer: Arc<A>,
    surface: Arc<Mutex<S>>,
    settings: PollerSettings,
    metrics: Arc<Metrics>,
}

impl<A, S> PredictionPoller<A, S>
where
    A: FaceAnalyzer,
    S: Surface + Send + 'static,
{
    pub fn new(
        source: Arc<dyn FrameSource>,
        analyzer: Arc<A>,
        surface: Arc<Mutex<S>>,
        settings: PollerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            analyzer,
            surface,
            settings,
            metrics,
        }
    }

    /// Ticks until shutdown is signalled (or the sender is dropped), or until
    /// too many ticks fail in a row. One cycle runs at a time; ticks that
    /// come due meanwhile are dropped.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> PollerExit {
        let period = self.settings.interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = Instant::now();
        let mut completed: u64 = 0;
        let mut consecutive_failures: u64 = 0;

        tracing::info!(
            "Prediction polling started every {} ms at {}",
            period.as_millis(),
            self.settings.display
        );

        let exit = loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown_rx.recv() => break PollerExit::Shutdown,
            }

            let tick_started = Instant::now();
            let cycle = self.poll_and_predict();
            tokio::pin!(cycle);
            let result = tokio::select! {
                result = &mut cycle => Some(result),
                _ = shutdown_rx.recv() => None,
            };
            let Some(result) = result else {
                tracing::info!("Shutdown received during an inference cycle, letting it finish");
                if timeout(SHUTDOWN_GRACE, &mut cycle).await.is_err() {
                    tracing::warn!(
                        "Inference cycle still running after {} ms, detaching it",
                        SHUTDOWN_GRACE.as_millis()
                    );
                }
                break PollerExit::Shutdown;
            };
            let elapsed = tick_started.elapsed();

            match result {
                Ok(Some(faces)) => {
                    consecutive_failures = 0;
                    completed += 1;
                    self.metrics
                        .record_tick(elapsed.as_millis() as u64, faces);
                    let uptime = started.elapsed().as_secs_f64();
                    if uptime > 0.0 {
                        self.metrics.record_tick_rate(completed as f64 / uptime);
                    }
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    tracing::debug!("No frame available, tick skipped");
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.metrics.record_failure(err.kind());
                    tracing::error!(
                        "Error during polling ({} in a row): {}",
                        consecutive_failures,
                        err
                    );
                    let limit = self.settings.max_consecutive_failures;
                    if limit > 0 && consecutive_failures >= limit {
                        tracing::error!("Persistent failure detected. Exiting polling loop");
                        break PollerExit::Halted(err.to_string());
                    }
                }
            }

            let skipped = (elapsed.as_nanos() / period.as_nanos()) as u64;
            if skipped > 0 {
                tracing::debug!("Cycle took {} ms, {} ticks coalesced", elapsed.as_millis(), skipped);
                self.metrics.record_coalesced(skipped);
            }
        };

        tracing::info!("Prediction polling stopped after {} cycles", completed);
        exit
    }

    /// One cycle: read, analyze, rescale, redraw. `None` when the source had
    /// no frame to give.
    #[instrument(skip_all)]
    async fn poll_and_predict(&self) -> Result<Option<usize>, TickError> {
        let source = self.source.clone();
        let frame = spawn_blocking(move || -> Result<Option<RgbImage>, TickError> {
            match source.read_frame()? {
                Some(mat) => Ok(Some(mat_to_rgb(&mat).map_err(TickError::Frame)?)),
                None => Ok(None),
            }
        })
        .await??;

        let Some(frame) = frame else {
            return Ok(None);
        };
        let native = DisplaySize::new(frame.width(), frame.height());

        let analyzer = self.analyzer.clone();
        let detections = spawn_blocking(move || analyzer.analyze(&frame)).await??;
        let detections = resize_results(detections, native, self.settings.display);

        let mut surface = self.surface.lock();
        render_detections(&mut *surface, &detections, &self.settings.style)
            .map_err(TickError::Render)?;

        Ok(Some(detections.len()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{face, FakeAnalyzer};
    use super::*;
    use crate::camera::testing::StaticSource;
    use crate::overlay::testing::{DrawOp, RecordingSurface};
    use face_inference::FaceBox;
    use opencv::core::Mat;
    use std::sync::atomic::Ordering;
    use tokio::time::sleep;

    const NATIVE: DisplaySize = DisplaySize {
        width: 64,
        height: 48,
    };

    struct EmptySource;

    impl FrameSource for EmptySource {
        fn read_frame(&self) -> Result<Option<Mat>, CameraError> {
            Ok(None)
        }

        fn resolution(&self) -> DisplaySize {
            NATIVE
        }
    }

    fn settings(interval_ms: u64, max_consecutive_failures: u64) -> PollerSettings {
        PollerSettings {
            display: NATIVE,
            style: OverlayStyle::default(),
            interval: Duration::from_millis(interval_ms),
            max_consecutive_failures,
        }
    }

    fn poller(
        source: Arc<dyn FrameSource>,
        analyzer: Arc<FakeAnalyzer>,
        surface: Arc<Mutex<RecordingSurface>>,
        settings: PollerSettings,
    ) -> PredictionPoller<FakeAnalyzer, RecordingSurface> {
        PredictionPoller::new(
            source,
            analyzer,
            surface,
            settings,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    async fn run_for(
        poller: PredictionPoller<FakeAnalyzer, RecordingSurface>,
        duration: Duration,
    ) -> PollerExit {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(poller.run(shutdown_rx));
        sleep(duration).await;
        let _ = shutdown_tx.send(());
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_tick_count_matches_period() {
        let analyzer = Arc::new(FakeAnalyzer::default());
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let poller = poller(
            Arc::new(StaticSource::new(NATIVE)),
            analyzer.clone(),
            surface,
            settings(200, 0),
        );

        let exit = run_for(poller, Duration::from_millis(2000)).await;

        assert_eq!(exit, PollerExit::Shutdown);
        let calls = analyzer.calls();
        assert!((9..=11).contains(&calls), "{calls} inference calls");
    }

    #[tokio::test]
    async fn test_slow_inference_never_overlaps() {
        let analyzer = Arc::new(FakeAnalyzer {
            delay: Duration::from_millis(250),
            ..FakeAnalyzer::default()
        });
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let poller = poller(
            Arc::new(StaticSource::new(NATIVE)),
            analyzer.clone(),
            surface,
            settings(50, 0),
        );

        run_for(poller, Duration::from_millis(1100)).await;

        assert_eq!(analyzer.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(analyzer.calls() <= 5, "{} inference calls", analyzer.calls());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_cycle() {
        let analyzer = Arc::new(FakeAnalyzer {
            delay: Duration::from_millis(300),
            ..FakeAnalyzer::default()
        });
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let poller = poller(
            Arc::new(StaticSource::new(NATIVE)),
            analyzer.clone(),
            surface.clone(),
            settings(50, 0),
        );

        let exit = run_for(poller, Duration::from_millis(100)).await;

        assert_eq!(exit, PollerExit::Shutdown);
        assert_eq!(analyzer.calls(), 1);
        assert_eq!(analyzer.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(surface.lock().clears(), 1);
    }

    #[tokio::test]
    async fn test_failing_ticks_do_not_stop_polling() {
        let analyzer = Arc::new(FakeAnalyzer {
            fail: true,
            ..FakeAnalyzer::default()
        });
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let poller = poller(
            Arc::new(StaticSource::new(NATIVE)),
            analyzer.clone(),
            surface.clone(),
            settings(50, 0),
        );

        let exit = run_for(poller, Duration::from_millis(500)).await;

        assert_eq!(exit, PollerExit::Shutdown);
        assert!(analyzer.calls() >= 5, "{} inference calls", analyzer.calls());
        assert_eq!(surface.lock().clears(), 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_halts() {
        let analyzer = Arc::new(FakeAnalyzer {
            fail: true,
            ..FakeAnalyzer::default()
        });
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let poller = poller(
            Arc::new(StaticSource::new(NATIVE)),
            analyzer.clone(),
            surface,
            settings(20, 3),
        );
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let exit = timeout(Duration::from_secs(2), poller.run(shutdown_rx))
            .await
            .unwrap();

        assert!(matches!(exit, PollerExit::Halted(reason) if reason.contains("synthetic failure")));
        assert_eq!(analyzer.calls(), 3);
    }

    #[tokio::test]
    async fn test_each_cycle_clears_then_draws_rescaled_faces() {
        let analyzer = Arc::new(FakeAnalyzer::default());
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let mut settings = settings(50, 0);
        settings.display = DisplaySize::new(128, 96);
        let poller = poller(
            Arc::new(StaticSource::new(NATIVE)),
            analyzer.clone(),
            surface.clone(),
            settings,
        );

        run_for(poller, Duration::from_millis(300)).await;

        let surface = surface.lock();
        assert_eq!(surface.ops[0], DrawOp::Clear);
        assert!(surface.clears() >= 3);
        let frame = surface.last_frame().unwrap();
        assert_eq!(frame[0], DrawOp::Rect(FaceBox::new(16.0, 12.0, 32.0, 24.0)));
        assert_eq!(
            frame.last().unwrap(),
            &DrawOp::Text(face().age_gender_label(), 16, 7)
        );
    }

    #[tokio::test]
    async fn test_missing_frames_skip_inference() {
        let analyzer = Arc::new(FakeAnalyzer::default());
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let poller = poller(Arc::new(EmptySource), analyzer.clone(), surface.clone(), settings(20, 1));

        let exit = run_for(poller, Duration::from_millis(200)).await;

        assert_eq!(exit, PollerExit::Shutdown);
        assert_eq!(analyzer.calls(), 0);
        assert_eq!(surface.lock().clears(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_polling() {
        let analyzer = Arc::new(FakeAnalyzer::default());
        let surface = Arc::new(Mutex::new(RecordingSurface::default()));
        let poller = poller(
            Arc::new(StaticSource::new(NATIVE)),
            analyzer,
            surface,
            settings(20, 0),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        drop(shutdown_tx);

        let exit = timeout(Duration::from_secs(1), poller.run(shutdown_rx))
            .await
            .unwrap();

        assert_eq!(exit, PollerExit::Shutdown);
    }
}
