//! HTTP surface of the operator.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use zkrollup_state::{
    Commitment, ProofError, ProofKind, PublicKey, RollupError, Seal, Signature, StateTransition,
    Transaction, TransitionProof,
};

use crate::config::OperatorConfig;
use crate::operator::{Operator, OperatorError, OperatorHandle, OperatorStatus};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub operator: OperatorHandle,
    pub config: OperatorConfig,
}

/// Build the router.
pub fn create_router(state: AppState) -> Router {
    let enable_cors = state.config.enable_cors;

    let rollup = Router::new()
        .route("/status", get(status))
        .route("/commitments", get(commitments))
        .route("/deposits", post(enqueue_deposit))
        .route("/deposits/process", post(process_deposit))
        .route("/transactions", post(submit_transaction))
        .route("/settle", post(settle));

    let router = Router::new()
        .route("/health", get(health))
        .nest("/rollup", rollup)
        .with_state(state);

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Start the operator and serve until ctrl-c.
pub async fn run_server(config: OperatorConfig) -> anyhow::Result<()> {
    let operator = Operator::start(&config)?;
    let app = create_router(AppState {
        operator: operator.clone(),
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stats = operator.stop().await?;
    tracing::info!(
        proofs_generated = stats.proofs_generated,
        proofs_verified = stats.proofs_verified,
        "server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

// === Request / response types ===

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub public_key: PublicKey,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DepositResponse {
    pub pending_deposits_commitment: Commitment,
}

#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    pub transaction: Transaction,
    pub signature: Signature,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettleRequest {
    /// Explicit proofs to settle. The operator's unsettled journal when absent.
    #[serde(default)]
    pub proofs: Option<Vec<TransitionProof>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitmentsResponse {
    pub account_db_commitment: Commitment,
    pub pending_deposits_commitment: Commitment,
}

/// A proof together with its summary fields.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProofResponse {
    pub kind: ProofKind,
    pub public_input: StateTransition,
    pub steps: u64,
    pub seal: Seal,
    pub proof: TransitionProof,
}

impl From<TransitionProof> for ProofResponse {
    fn from(proof: TransitionProof) -> Self {
        Self {
            kind: proof.kind(),
            public_input: proof.public_input(),
            steps: proof.steps(),
            seal: proof.seal(),
            proof,
        }
    }
}

// === Handlers ===

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "zkrollup-operator",
    }))
}

async fn status(State(state): State<AppState>) -> Result<Json<OperatorStatus>, ApiError> {
    Ok(Json(state.operator.snapshot().await?))
}

async fn commitments(State(state): State<AppState>) -> Result<Json<CommitmentsResponse>, ApiError> {
    let snapshot = state.operator.snapshot().await?.state;
    Ok(Json(CommitmentsResponse {
        account_db_commitment: snapshot.account_db_commitment,
        pending_deposits_commitment: snapshot.pending_deposits_commitment,
    }))
}

async fn enqueue_deposit(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> Result<Json<DepositResponse>, ApiError> {
    let pending_deposits_commitment = state
        .operator
        .enqueue_deposit(req.public_key, req.amount)
        .await?;
    Ok(Json(DepositResponse {
        pending_deposits_commitment,
    }))
}

async fn process_deposit(State(state): State<AppState>) -> Result<Json<ProofResponse>, ApiError> {
    let proof = state.operator.process_deposit().await?;
    Ok(Json(proof.into()))
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(req): Json<TransactionRequest>,
) -> Result<Json<ProofResponse>, ApiError> {
    let proof = state
        .operator
        .submit_transaction(req.transaction, req.signature)
        .await?;
    Ok(Json(proof.into()))
}

async fn settle(
    State(state): State<AppState>,
    Json(req): Json<SettleRequest>,
) -> Result<Json<ProofResponse>, ApiError> {
    let proof = match req.proofs {
        Some(proofs) => state.operator.settle_proofs(proofs).await?,
        None => state.operator.settle().await?,
    };
    Ok(Json(proof.into()))
}

// === Errors ===

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<OperatorError> for ApiError {
    fn from(err: OperatorError) -> Self {
        let status = match &err {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            OperatorError::Rollup(RollupError::Proof(ProofError::VerificationFailed(_))) => {
                StatusCode::BAD_REQUEST
            }
            OperatorError::Cancelled => StatusCode::CONFLICT,
            OperatorError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}
