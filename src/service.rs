use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::engine::{CoinEngine, EngineConfig};
use crate::error::{LedgerError, StorageError};
use crate::history::{HistoryPage, HistoryQuery};
use crate::models::{Account, Direction, LedgerEntry, Mutation, Reason};
use crate::operator_queue::{FailedEvent, OperatorQueue, QueueError};
use crate::persistence::FileJournal;
use crate::reconciler::{
    ReconcileOutcome, Reconciler, WebhookError, WebhookVerifier, DEFAULT_SIGNATURE_TOLERANCE_SECS,
    SIGNATURE_HEADER,
};
use crate::store::ConsistencyReport;

/// Header carrying the identity asserted by the upstream identity provider
pub const USER_HEADER: &str = "x-user-id";
pub const ADMIN_HEADER: &str = "x-admin-token";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Journal file; `None` keeps the ledger in memory only
    pub journal_path: Option<PathBuf>,
    pub operator_queue_path: Option<PathBuf>,
    pub webhook_secret: String,
    /// Admin routes answer 403 when unset
    pub admin_token: Option<String>,
    pub signature_tolerance_secs: i64,
    pub engine: EngineConfig,
}

impl ServiceConfig {
    pub fn in_memory(webhook_secret: impl Into<String>) -> Self {
        Self {
            journal_path: None,
            operator_queue_path: None,
            webhook_secret: webhook_secret.into(),
            admin_token: None,
            signature_tolerance_secs: DEFAULT_SIGNATURE_TOLERANCE_SECS,
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("ledger storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("operator queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct ServiceState {
    pub reconciler: Reconciler,
    pub admin_token: Option<String>,
}

impl ServiceState {
    pub fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            journal_path,
            operator_queue_path,
            webhook_secret,
            admin_token,
            signature_tolerance_secs,
            engine: engine_config,
        } = config;

        let engine = match &journal_path {
            Some(path) => CoinEngine::recover(Box::new(FileJournal::open(path)?), engine_config)?,
            None => CoinEngine::new(crate::store::LedgerStore::in_memory(), engine_config),
        };
        let operator_queue = match operator_queue_path {
            Some(path) => OperatorQueue::load(path)?,
            None => OperatorQueue::in_memory(),
        };
        let verifier = WebhookVerifier::new(webhook_secret, signature_tolerance_secs);

        Ok(Self {
            reconciler: Reconciler::new(engine, verifier, operator_queue),
            admin_token: admin_token.filter(|token| !token.is_empty()),
        })
    }

    pub fn engine(&self) -> &CoinEngine {
        self.reconciler.engine()
    }

    fn require_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Err(ApiError::forbidden("admin access is not configured"));
        };
        let presented = headers
            .get(ADMIN_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if presented.as_bytes() == expected.as_bytes() {
            Ok(())
        } else {
            Err(ApiError::forbidden("invalid admin token"))
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/webhooks/payments", post(payment_webhook))
        .route("/v1/balance", get(balance))
        .route("/v1/history", get(history))
        .route("/v1/spend", post(spend))
        .route("/v1/admin/mutations", post(admin_mutation))
        .route("/v1/admin/failed-events", get(failed_events))
        .route("/v1/admin/accounts/:user_id/archive", post(archive_account))
        .route("/v1/admin/accounts/:user_id/consistency", get(account_consistency))
        .with_state(state)
}

/// Identity of the caller, trusted as given by the identity provider
#[derive(Debug, Clone)]
pub struct Identity(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Identity(value.to_string()))
            .ok_or_else(|| ApiError::Http {
                status: StatusCode::UNAUTHORIZED,
                message: "missing user identity".to_string(),
            })
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

fn ledger_status(err: &LedgerError) -> (StatusCode, String) {
    match err {
        LedgerError::InvalidAmount { .. } | LedgerError::MissingExternalRef => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        LedgerError::InsufficientBalance { balance, requested, .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "not enough coins: balance {}, needed {}",
                balance, requested
            ),
        ),
        LedgerError::DuplicateExternalRef { .. }
        | LedgerError::ExternalRefConflict { .. }
        | LedgerError::ExternalRefMismatch { .. } => (StatusCode::CONFLICT, err.to_string()),
        LedgerError::AccountNotFound { .. } | LedgerError::EntryNotFound { .. } => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        LedgerError::AccountArchived { .. } => (StatusCode::FORBIDDEN, err.to_string()),
        LedgerError::LockTimeout { .. } | LedgerError::StorageUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "temporarily unavailable, please try again".to_string(),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retryable) = match &self {
            ApiError::Http { status, message } => (*status, message.clone(), false),
            ApiError::Ledger(err) => {
                let (status, message) = ledger_status(err);
                (status, message, err.is_retryable())
            }
            ApiError::Webhook(WebhookError::SignatureInvalid(err)) => {
                (StatusCode::BAD_REQUEST, err.to_string(), false)
            }
            ApiError::Webhook(WebhookError::Ledger(err)) => {
                let (status, message) = ledger_status(err);
                (status, message, err.is_retryable())
            }
            ApiError::Webhook(err @ WebhookError::OperatorQueue(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string(), true)
            }
        };

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        }

        (
            status,
            Json(serde_json::json!({ "error": message, "retryable": retryable })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    accounts: usize,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "coin-ledger",
        accounts: state.engine().store().user_ids().len(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    pub state: String,
    pub event_id: Option<String>,
    pub entry_id: Option<u64>,
    pub replayed: bool,
}

impl From<&ReconcileOutcome> for WebhookAck {
    fn from(outcome: &ReconcileOutcome) -> Self {
        let state = outcome.state().as_str().to_string();
        match outcome {
            ReconcileOutcome::Applied { entry, replayed } => Self {
                received: true,
                state,
                event_id: None,
                entry_id: Some(entry.id),
                replayed: *replayed,
            },
            ReconcileOutcome::Recorded { entry } => Self {
                received: true,
                state,
                event_id: None,
                entry_id: Some(entry.id),
                replayed: false,
            },
            ReconcileOutcome::Ignored { event_id, .. }
            | ReconcileOutcome::FailedApply { event_id, .. } => Self {
                received: true,
                state,
                event_id: Some(event_id.clone()).filter(|id| !id.is_empty()),
                entry_id: None,
                replayed: false,
            },
        }
    }
}

/// Balance mutation completes before the acknowledgement is sent
async fn payment_webhook(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let outcome = state.reconciler.handle(signature, &body).await?;
    Ok(Json(WebhookAck::from(&outcome)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub balance: i64,
}

impl From<Account> for BalanceResponse {
    fn from(account: Account) -> Self {
        Self {
            user_id: account.user_id,
            balance: account.balance,
        }
    }
}

async fn balance(
    State(state): State<ServiceState>,
    Identity(user_id): Identity,
) -> Result<Json<BalanceResponse>, ApiError> {
    Ok(Json(state.engine().balance(&user_id).await?.into()))
}

async fn history(
    State(state): State<ServiceState>,
    Identity(user_id): Identity,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryPage> {
    Json(state.engine().history(&user_id, query))
}

/// External reference for a caller-supplied idempotency key
///
/// Keys are scoped to the caller and the user, so they can never collide with
/// another user's keys or with payment-provider references.
fn client_ref(caller: &str, user_id: &str, key: &str) -> Option<String> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some(format!("{}:{}:{}", caller, user_id, key))
}

#[derive(Debug, Clone, Deserialize)]
struct SpendRequest {
    amount: i64,
    idempotency_key: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationResponse {
    pub entry: LedgerEntry,
    pub replayed: bool,
    pub balance: i64,
}

async fn spend(
    State(state): State<ServiceState>,
    Identity(user_id): Identity,
    Json(request): Json<SpendRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let key = request
        .idempotency_key
        .as_deref()
        .and_then(|key| client_ref("spend", &user_id, key));
    let mut mutation = Mutation::new(user_id, request.amount, Reason::Spend);
    if let Some(key) = key {
        mutation = mutation.with_external_ref(key);
    }
    if let Some(description) = request.description {
        mutation = mutation.with_description(description);
    }

    let posting = state.engine().post(Direction::Debit, mutation).await?;
    let balance = posting.entry.resulting_balance;
    Ok(Json(MutationResponse {
        replayed: posting.replayed,
        balance,
        entry: posting.entry,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct AdminMutationRequest {
    user_id: String,
    direction: Direction,
    amount: i64,
    reason: Reason,
    description: Option<String>,
    idempotency_key: Option<String>,
}

async fn admin_mutation(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AdminMutationRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    state.require_admin(&headers)?;

    if !matches!(
        request.reason,
        Reason::HomeworkReward | Reason::AdminAdjustment | Reason::Refund
    ) {
        return Err(ApiError::bad_request(format!(
            "reason {} is not available to admins",
            request.reason.as_str()
        )));
    }
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }

    let key = request
        .idempotency_key
        .as_deref()
        .and_then(|key| client_ref("admin", &request.user_id, key));
    let mut mutation = Mutation::new(request.user_id, request.amount, request.reason);
    if let Some(key) = key {
        mutation = mutation.with_external_ref(key);
    }
    if let Some(description) = request.description {
        mutation = mutation.with_description(description);
    }

    let posting = state.engine().post(request.direction, mutation).await?;
    info!(
        user_id = %posting.entry.user_id,
        entry_id = posting.entry.id,
        reason = posting.entry.reason.as_str(),
        "Admin mutation applied"
    );

    let balance = posting.entry.resulting_balance;
    Ok(Json(MutationResponse {
        replayed: posting.replayed,
        balance,
        entry: posting.entry,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct FailedEventsResponse {
    items: Vec<FailedEvent>,
}

async fn failed_events(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<FailedEventsResponse>, ApiError> {
    state.require_admin(&headers)?;
    let queue = state.reconciler.operator_queue();
    let items = queue.lock().await.list();
    Ok(Json(FailedEventsResponse { items }))
}

async fn archive_account(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    state.require_admin(&headers)?;
    Ok(Json(state.engine().archive(&user_id).await?))
}

async fn account_consistency(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<ConsistencyReport>, ApiError> {
    state.require_admin(&headers)?;
    state
        .engine()
        .check_consistency(&user_id)
        .map(Json)
        .ok_or_else(|| LedgerError::AccountNotFound { user_id }.into())
}
