use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use url::Url;

use crate::{
    app_state::AppState,
    error::PipelineError,
    models::{AnalyzeParams, AnalyzeResponse},
    neo4j_client,
};

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/analyze", post(analyze_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeParams>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, (StatusCode, Json<Value>)> {
    let Json(params) = payload.map_err(|e| {
        warn!("Cuerpo de /analyze inválido: {}", e.body_text());
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Cuerpo JSON inválido: {}", e.body_text())})),
        )
    })?;

    let request = state.pipeline.prepare(params).map_err(error_response)?;
    info!(idempotence_key = %request.idempotence_key, "Petición de análisis recibida");

    match state.pipeline.analyze(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => Err(error_response(e)),
    }
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (neo4j, llm) = tokio::join!(neo4j_client::health(&state.graph), state.pipeline.llm_health());
    if let Err(e) = &neo4j {
        error!("Error en el health check de Neo4j: {}", e);
    }
    if let Err(e) = &llm {
        error!("Error en el health check del LLM: {}", e);
    }

    let neo4j = match neo4j {
        Ok(()) => json!({ "status": "ok", "browser_url": browser_url(&state.config.neo4j_uri) }),
        Err(e) => json!({ "status": "error", "details": e.to_string() }),
    };
    let llm = match llm {
        Ok(()) => json!({
            "status": "ok",
            "provider": state.config.llm_provider.as_str(),
            "model": state.pipeline.model_name(),
        }),
        Err(e) => json!({
            "status": "error",
            "provider": state.config.llm_provider.as_str(),
            "details": e.to_string(),
        }),
    };
    health_report(neo4j, llm)
}

// --- Utilidades ---

/// 200 sólo si Neo4j y el LLM responden.
fn health_report(neo4j: Value, llm: Value) -> (StatusCode, Json<Value>) {
    let healthy = neo4j["status"] == "ok" && llm["status"] == "ok";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "neo4j": neo4j, "llm": llm })))
}

/// URL del Neo4j Browser (puerto 7474) en el mismo host que el Bolt.
fn browser_url(neo4j_uri: &str) -> String {
    let host = Url::parse(neo4j_uri)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    format!("http://{host}:7474")
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PipelineError::Extraction(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Materialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: PipelineError) -> (StatusCode, Json<Value>) {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Error en el análisis: {}", err);
    }
    (status, Json(json!({ "error": err.to_string() })))
}
