use crate::config::CameraConfig;
use face_inference::DisplaySize;
use opencv::{core::Mat, prelude::*, videoio};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    OpenCameraFailed(opencv::Error),
    #[error("Camera device {0} is unavailable or access was denied")]
    DeviceUnavailable(i32),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for CameraError {
    fn from(err: opencv::Error) -> Self {
        CameraError::OpenCvError(err)
    }
}

/// A live video stream the polling loop and the preview read frames from.
pub trait FrameSource: Send + Sync + 'static {
    /// The current frame, or `None` when the device has nothing to deliver.
    fn read_frame(&self) -> Result<Option<Mat>, CameraError>;

    fn resolution(&self) -> DisplaySize;
}

/// Acquires a [`FrameSource`]. Opening may block on the platform media API.
pub trait CameraOpener: Send + 'static {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, CameraError>;
}

#[derive(Debug)]
pub struct Camera {
    device_index: i32,
    capture: Mutex<videoio::VideoCapture>,
    resolution: DisplaySize,
}

impl Camera {
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let mut capture = videoio::VideoCapture::new(config.device_index, videoio::CAP_ANY)
            .map_err(CameraError::OpenCameraFailed)?;
        if !capture.is_opened()? {
            return Err(CameraError::DeviceUnavailable(config.device_index));
        }

        if let Some(width) = config.width {
            if !capture.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)? {
                tracing::warn!("Camera rejected requested width {}", width);
            }
        }
        if let Some(height) = config.height {
            if !capture.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)? {
                tracing::warn!("Camera rejected requested height {}", height);
            }
        }

        let resolution = DisplaySize::new(
            capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32,
            capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32,
        );
        tracing::info!(
            "Camera device {} opened at {}",
            config.device_index,
            resolution
        );

        Ok(Self {
            device_index: config.device_index,
            capture: Mutex::new(capture),
            resolution,
        })
    }
}

impl FrameSource for Camera {
    fn read_frame(&self) -> Result<Option<Mat>, CameraError> {
        let mut cam = self.capture.lock();
        let mut frame = Mat::default();
        if cam.read(&mut frame).map_err(CameraError::ReadFrameFailed)? && !frame.empty() {
            return Ok(Some(frame));
        }
        Ok(None)
    }

    fn resolution(&self) -> DisplaySize {
        self.resolution
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.capture.get_mut().release() {
            tracing::warn!("Failed to release camera {}: {}", self.device_index, e);
        } else {
            tracing::info!("Camera device {} released", self.device_index);
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenCvCameraOpener {
    config: CameraConfig,
}

impl OpenCvCameraOpener {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl CameraOpener for OpenCvCameraOpener {
    type Source = Camera;

    fn open(&self) -> Result<Camera, CameraError> {
        Camera::open(&self.config)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    pub fn blank_frame(size: DisplaySize) -> Mat {
        Mat::new_rows_cols_with_default(
            size.height as i32,
            size.width as i32,
            CV_8UC3,
            Scalar::all(0.0),
        )
        .unwrap()
    }

    /// Always delivers a black frame of a fixed size.
    pub struct StaticSource {
        pub size: DisplaySize,
        pub reads: Arc<AtomicUsize>,
    }

    impl StaticSource {
        pub fn new(size: DisplaySize) -> Self {
            Self {
                size,
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl FrameSource for StaticSource {
        fn read_frame(&self) -> Result<Option<Mat>, CameraError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(blank_frame(self.size)))
        }

        fn resolution(&self) -> DisplaySize {
            self.size
        }
    }

    /// Opens a [`StaticSource`], or fails like a missing device when `fail` is set.
    pub struct FakeOpener {
        pub size: DisplaySize,
        pub fail: bool,
        pub opens: Arc<AtomicUsize>,
    }

    impl FakeOpener {
        pub fn new(size: DisplaySize, fail: bool) -> Self {
            Self {
                size,
                fail,
                opens: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl CameraOpener for FakeOpener {
        type Source = StaticSource;

        fn open(&self) -> Result<StaticSource, CameraError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CameraError::DeviceUnavailable(0));
            }
            Ok(StaticSource::new(self.size))
        }
    }
}
