use crate::{lifecycle::LifecycleState, server::SharedState};
use axum::{extract::State, response::Json};
use tracing::instrument;

#[instrument(skip(state))]
pub async fn status(State(state): State<SharedState>) -> Json<LifecycleState> {
    Json(state.lifecycle.current())
}
