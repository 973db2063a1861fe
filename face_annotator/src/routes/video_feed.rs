use crate::{
    server::SharedState,
    stream::{VideoStream, VideoStreamError},
};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::instrument;

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[instrument(skip(state))]
pub async fn video_feed(State(state): State<SharedState>) -> Result<Response, VideoStreamError> {
    if !state.preview.is_attached() {
        return Err(VideoStreamError::NotReady);
    }

    let stream = VideoStream::new(state.preview.clone(), state.video_stream_delay).generate_stream();

    let body = Body::from_stream(stream);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(body)
        .map_err(|e| VideoStreamError::HttpBuilderError(e.to_string()))?;

    Ok(response)
}

impl IntoResponse for VideoStreamError {
    fn into_response(self) -> Response {
        let status = match self {
            VideoStreamError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            VideoStreamError::Camera(_)
            | VideoStreamError::Overlay(_)
            | VideoStreamError::Join(_)
            | VideoStreamError::HttpBuilderError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
