use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::api::auth::auth_middleware;
use crate::api::{status_for, ApiResponse, AppState};
use crate::chaos::{ChaosResult, ChaosScenario};
use crate::config::Config;
use crate::recovery::FixType;

pub fn create_stream_router(config: Arc<Config>) -> Router<AppState> {
    let protected_routes = Router::new()
        .route("/breakers/:agent/:fix/reset", post(reset_breaker))
        .route("/chaos/:agent", post(inject_chaos))
        .route_layer(middleware::from_fn_with_state(config, auth_middleware));

    Router::new()
        .route("/stream/status", get(status_handler))
        .route("/stream", get(sse_handler))
        .merge(protected_routes)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
}

async fn status_handler() -> &'static str {
    "ok"
}

async fn reset_breaker(
    State(orchestrator): State<AppState>,
    Path((agent, fix)): Path<(String, String)>,
) -> (StatusCode, Json<ApiResponse<bool>>) {
    let fix: FixType = match fix.parse() {
        Ok(fix) => fix,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e))),
    };
    match orchestrator.reset_breaker(&agent, fix).await {
        Ok(existed) => (StatusCode::OK, Json(ApiResponse::success(existed))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn inject_chaos(
    State(orchestrator): State<AppState>,
    Path(agent): Path<String>,
    Json(scenario): Json<ChaosScenario>,
) -> (StatusCode, Json<ApiResponse<ChaosResult>>) {
    match orchestrator.inject_scenario(&agent, scenario).await {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::success(result))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

async fn sse_handler(State(orchestrator): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = orchestrator.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => yield Ok(Event::default().data(json)),
                    Err(e) => warn!("Failed to encode recovery event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber fell behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => {
                    debug!("Event channel closed, ending SSE stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)).text("keep-alive-text"))
}
