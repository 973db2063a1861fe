use crate::camera::{CameraError, FrameSource};
use crate::overlay::{encode_jpg, OverlayCanvas, OverlayError};
use bytes::Bytes;
use futures::stream;
use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{task::JoinError, time::sleep};
use tracing::instrument;

const FRAME_BOUNDARY: &str = "frame";

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("No camera is attached")]
    NotReady,
    #[error("Frame task failed: {0}")]
    Join(#[from] JoinError),
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

struct Attached {
    source: Arc<dyn FrameSource>,
    canvas: Arc<Mutex<OverlayCanvas>>,
}

/// The camera and overlay canvas of the running session, as seen by the
/// HTTP preview. Empty until the session attaches them.
#[derive(Default)]
pub struct Preview {
    attached: RwLock<Option<Attached>>,
}

impl Preview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, source: Arc<dyn FrameSource>, canvas: Arc<Mutex<OverlayCanvas>>) {
        *self.attached.write() = Some(Attached { source, canvas });
    }

    /// Releases the preview's handles on the camera and canvas.
    pub fn detach(&self) {
        self.attached.write().take();
    }

    pub fn is_attached(&self) -> bool {
        self.attached.read().is_some()
    }

    /// Reads a frame and returns it as JPEG with the overlay composited on
    /// top. Blocks on the camera.
    pub fn annotated_jpeg(&self) -> Result<Option<Vec<u8>>, VideoStreamError> {
        let (source, canvas) = {
            let attached = self.attached.read();
            let attached = attached.as_ref().ok_or(VideoStreamError::NotReady)?;
            (attached.source.clone(), attached.canvas.clone())
        };

        let Some(frame) = source.read_frame()? else {
            return Ok(None);
        };
        let composited = canvas.lock().composite(&frame)?;
        Ok(Some(encode_jpg(&composited)?))
    }
}

#[derive(Clone)]
pub struct VideoStream {
    pub preview: Arc<Preview>,
    pub video_stream_delay: u64,
}

impl VideoStream {
    pub fn new(preview: Arc<Preview>, video_stream_delay: u64) -> Self {
        Self {
            preview,
            video_stream_delay,
        }
    }

    /// Multipart JPEG parts; ends once the camera is detached.
    #[instrument(skip(self))]
    pub fn generate_stream(self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        let delay = Duration::from_millis(self.video_stream_delay);

        stream::unfold(self.preview, move |preview| async move {
            loop {
                sleep(delay).await;
                let reader = preview.clone();
                let frame = match tokio::task::spawn_blocking(move || reader.annotated_jpeg()).await
                {
                    Ok(frame) => frame,
                    Err(e) => Err(VideoStreamError::from(e)),
                };

                match frame {
                    Ok(Some(frame)) => return Some((Ok(multipart_part(&frame)), preview)),
                    Ok(None) => continue,
                    Err(VideoStreamError::NotReady) => {
                        tracing::info!("Camera detached, closing video stream");
                        return None;
                    }
                    Err(e) => {
                        tracing::error!("Error getting frame: {:?}", e);
                        return Some((Err(e), preview));
                    }
                }
            }
        })
    }
}

fn multipart_part(frame: &[u8]) -> Bytes {
    let part_header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        FRAME_BOUNDARY,
        frame.len()
    );
    let mut body = part_header.into_bytes();
    body.extend_from_slice(frame);
    body.extend_from_slice(b"\r\n");
    Bytes::from(body)
}
