//! HTTP API for agentchain.
//!
//! Creating a chain only stores it; the scheduler running alongside the
//! server advances it. Every route is served both at the root and under
//! `/api`.

use agentchain_core::chain::{ChainId, ChainStatus};
use agentchain_core::error::Error;
use agentchain_orchestrator::ChainService;
use axum::{
    Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::Json,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorBody>)>;

/// Build the router with all chain routes.
pub fn build_router(service: ChainService) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/chains", get(list_chains_handler).post(create_chain_handler))
        .route("/chains/tree", get(chain_tree_handler))
        .route("/chains/{id}", get(get_chain_handler))
        .route("/agents", get(list_agents_handler))
        .with_state(service);

    // The UI dev server talks to us cross-origin.
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:5173"),
            HeaderValue::from_static("http://127.0.0.1:5173"),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` is cancelled.
pub async fn start(
    config: &agentchain_config::GatewayConfig,
    service: ChainService,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

// --- Request / response bodies ---

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct CreateChainRequest {
    #[serde(rename = "userMessage")]
    pub user_message: String,
    pub agent_name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateChainResponse {
    pub id: ChainId,
    pub status: ChainStatus,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(err: Error) -> (StatusCode, Json<ErrorBody>) {
    let status = match err {
        Error::ChainNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

/// Malformed bodies keep axum's status but get the same `{error}` shape.
fn rejection_response(rejection: JsonRejection) -> (StatusCode, Json<ErrorBody>) {
    (
        rejection.status(),
        Json(ErrorBody {
            error: rejection.body_text(),
        }),
    )
}

// --- Handlers ---

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn create_chain_handler(
    State(service): State<ChainService>,
    payload: Result<Json<CreateChainRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateChainResponse>)> {
    let Json(req) = payload.map_err(rejection_response)?;
    let chain = service
        .create_chain(&req.agent_name, &req.user_message)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateChainResponse {
            id: chain.id,
            status: chain.status,
            message: "Chain stored successfully",
        }),
    ))
}

async fn list_chains_handler(
    State(service): State<ChainService>,
) -> ApiResult<Json<serde_json::Value>> {
    let chains = service.list_chains().await.map_err(error_response)?;
    to_json(&chains)
}

async fn chain_tree_handler(
    State(service): State<ChainService>,
) -> ApiResult<Json<serde_json::Value>> {
    let tree = service.chain_tree().await.map_err(error_response)?;
    to_json(&tree)
}

async fn get_chain_handler(
    State(service): State<ChainService>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let chain = service.get_chain(ChainId(id)).await.map_err(error_response)?;
    to_json(&chain)
}

async fn list_agents_handler(
    State(service): State<ChainService>,
) -> ApiResult<Json<serde_json::Value>> {
    let agents = service.list_agents().await.map_err(error_response)?;
    to_json(&agents)
}

fn to_json<T: Serialize>(value: &T) -> ApiResult<Json<serde_json::Value>> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| error_response(Error::Serialization(e)))
}
