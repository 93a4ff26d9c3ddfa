use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use idres_api::{IdentifyRequest, IdentifyResponse, IdentityApi};
use idres_core::ReconcileError;
use serde::Serialize;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

const IDENTIFY_HINT: &str =
    "Use POST /identify with a JSON body containing email and/or phoneNumber.";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "idres-service")]
#[command(about = "HTTP service for contact identity resolution")]
struct Args {
    #[arg(long, default_value = "./idres.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn service_error(err: &anyhow::Error) -> ServiceError {
    if let Some(invalid) = err.downcast_ref::<ReconcileError>() {
        return ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: invalid.to_string(),
            status: StatusCode::BAD_REQUEST,
        };
    }

    tracing::error!("identify failed: {err:#}");
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: "persistence failure".to_string(),
        status: StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/identify", get(identify_hint).post(identify))
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { api: IdentityApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("idres-service listening on {}", args.bind);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn welcome() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Contact identity resolution service. POST /identify to reconcile an observation.",
    })
}

async fn identify_hint() -> Json<MessageResponse> {
    Json(MessageResponse { message: IDENTIFY_HINT })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn identify(
    State(state): State<ServiceState>,
    Json(request): Json<IdentifyRequest>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let response = state.api.identify(request).map_err(|err| service_error(&err))?;
    Ok(Json(response))
}
