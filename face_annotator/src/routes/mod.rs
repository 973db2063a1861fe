mod health;
mod metrics;
mod status;
mod video_feed;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub use health::healthcheck;
pub use metrics::metrics_handler;
pub use status::status;
pub use video_feed::video_feed;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/status", get(status))
        .route("/video_feed", get(video_feed))
        .route("/metrics", get(metrics_handler))
}
