//! HTTP request handlers.

use super::AppState;
use crate::scheduler::CycleState;

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json},
};
use serde::Serialize;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let text = state.live.metrics();
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        text.as_str().to_owned(),
    )
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub state: CycleState,
    pub progress_pct: f64,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.live.state();
    Json(StatusResponse {
        progress_pct: snapshot.progress_pct(),
        state: CycleState::clone(&snapshot),
    })
}

pub async fn handle_healthz() -> &'static str {
    "ok"
}
