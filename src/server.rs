use std::sync::Arc;
use axum::{routing::{get, post}, Router, Json};
use tower_http::cors::{CorsLayer, Any};
use serde::{Deserialize, Serialize};
use axum::http::StatusCode;
use tracing::{info, warn};
use crate::datalog::Engine;
use crate::error::FactbaseError;
use crate::interface::ScriptInterface;

#[derive(Deserialize)]
pub struct ScriptRequest {
    pub script: String,
}

#[derive(Serialize)]
pub struct ScriptResponse {
    pub status: String,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub col: Option<usize>,
}

/// Parse errors are the client's fault, rejected data is unprocessable,
/// anything else is on the server.
pub fn status_of(e: &FactbaseError) -> StatusCode {
    match e {
        FactbaseError::Parse { .. } => StatusCode::BAD_REQUEST,
        e if e.is_rejection() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(interface: Arc<ScriptInterface>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);
    Router::new()
        .route("/v1/health", get(|| async { "ok" }))
        .route("/v1/execute", post(move |Json(req): Json<ScriptRequest>| {
        let iface = Arc::clone(&interface);
        async move {
            // the engine is synchronous, so it runs on a blocking thread
            let started = std::time::Instant::now();
            let outcomes = tokio::task::spawn_blocking(move || {
                let engine = Engine::new(iface.database());
                engine.execute(&req.script)
            }).await.map_err(|e| {
                warn!(error=%e, "Join error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Join error")
            })?;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            match outcomes {
                Ok(outcomes) => {
                    info!(ms=elapsed_ms, outcomes=outcomes.len(), "script complete");
                    let body = ScriptResponse {
                        status: "ok".into(),
                        elapsed_ms,
                        outcomes: outcomes.iter().map(|o| o.to_json()).collect(),
                        error: None,
                        line: None,
                        col: None,
                    };
                    Ok::<_, (StatusCode, &'static str)>((StatusCode::OK, Json(body)))
                }
                Err(e) => {
                    let status = status_of(&e);
                    let (line, col) = match &e {
                        FactbaseError::Parse { line, col, .. } => (*line, *col),
                        _ => (None, None),
                    };
                    let msg = format!("{e}");
                    warn!(%msg, code=%status.as_u16(), "script error");
                    let body = ScriptResponse {
                        status: "error".into(),
                        elapsed_ms,
                        outcomes: Vec::new(),
                        error: Some(msg),
                        line,
                        col,
                    };
                    Ok::<_, (StatusCode, &'static str)>((status, Json(body)))
                }
            }
        }
    }))
    .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let parse = FactbaseError::Parse { message: "x".into(), line: Some(1), col: Some(1) };
        assert_eq!(status_of(&parse), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(&FactbaseError::UnknownAttribute(":user/nope".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(&FactbaseError::InvalidQuery("wildcard in predicate".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(&FactbaseError::Persistence("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
