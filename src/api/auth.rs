use axum::{body::Body, extract::State, middleware::Next, response::Response};
use headers::{authorization::Bearer, Authorization, HeaderMapExt};
use http::{Request, StatusCode};
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;

/// Bearer-token check for mutating routes. Open when no token is configured.
pub async fn auth_middleware(
    State(config): State<Arc<Config>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(api_token) = &config.monitoring.api_token {
        let token = req
            .headers()
            .typed_get::<Authorization<Bearer>>()
            .map(|auth| auth.token().to_string());

        if token.as_deref() != Some(api_token.as_str()) {
            debug!("Rejected unauthenticated request to {}", req.uri().path());
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    Ok(next.run(req).await)
}
