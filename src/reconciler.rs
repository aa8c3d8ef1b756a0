use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::engine::{CoinEngine, Posting, Settlement};
use crate::error::LedgerError;
use crate::models::{
    CheckoutSession, Direction, EventKind, EventParseError, LedgerEntry, Mutation, ProviderEvent,
    Reason,
};
use crate::operator_queue::{FailureDetails, OperatorQueue, QueueError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp {timestamp} outside tolerance of {tolerance_secs}s")]
    Expired { timestamp: i64, tolerance_secs: i64 },
    #[error("signature does not match payload")]
    Mismatch,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook rejected: {0}")]
    SignatureInvalid(#[from] SignatureError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    OperatorQueue(#[from] QueueError),
}

impl WebhookError {
    /// True when the provider should redeliver the event
    pub fn is_retryable(&self) -> bool {
        match self {
            WebhookError::SignatureInvalid(_) => false,
            WebhookError::Ledger(err) => err.is_retryable(),
            WebhookError::OperatorQueue(_) => true,
        }
    }
}

/// HMAC-SHA256 webhook signatures
///
/// Header format is `t=<unix seconds>,v1=<hex digest>`, the digest being taken
/// over `"<t>.<raw body>"`. Several `v1` values may be present while the
/// provider rotates secrets; any match is accepted.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl AsRef<[u8]>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            tolerance_secs,
        }
    }

    fn mac(&self, timestamp: i64, body: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac
    }

    /// Header value for `body` signed at `timestamp`
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> String {
        let digest = self.mac(timestamp, body).finalize().into_bytes();
        format!("t={},v1={}", timestamp, hex::encode(digest))
    }

    pub fn verify(
        &self,
        header: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let header = header.ok_or(SignatureError::Missing)?;

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?)
                }
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if candidates.is_empty() {
            return Err(SignatureError::Malformed);
        }

        if (now.timestamp() - timestamp).abs() > self.tolerance_secs {
            return Err(SignatureError::Expired {
                timestamp,
                tolerance_secs: self.tolerance_secs,
            });
        }

        let matched = candidates.into_iter().any(|candidate| {
            hex::decode(candidate)
                .map(|digest| self.mac(timestamp, body).verify_slice(&digest).is_ok())
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

/// Lifecycle of one provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Received,
    Verified,
    Applied,
    Rejected,
    FailedApply,
    Ignored,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Received => "RECEIVED",
            EventState::Verified => "VERIFIED",
            EventState::Applied => "APPLIED",
            EventState::Rejected => "REJECTED",
            EventState::FailedApply => "FAILED_APPLY",
            EventState::Ignored => "IGNORED",
        }
    }
}

/// What happened to a verified event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Balance credited (or the earlier credit replayed)
    Applied { entry: LedgerEntry, replayed: bool },
    /// Pending purchase recorded, or a pending purchase marked failed
    Recorded { entry: LedgerEntry },
    Ignored { event_id: String, reason: String },
    FailedApply { event_id: String, reason: String },
}

impl ReconcileOutcome {
    pub fn state(&self) -> EventState {
        match self {
            ReconcileOutcome::Applied { .. } | ReconcileOutcome::Recorded { .. } => {
                EventState::Applied
            }
            ReconcileOutcome::Ignored { .. } => EventState::Ignored,
            ReconcileOutcome::FailedApply { .. } => EventState::FailedApply,
        }
    }
}

/// Turns payment-provider webhooks into ledger mutations
///
/// Holds no dedup store of its own: every credit carries an external
/// reference and the engine returns the recorded entry on redelivery.
#[derive(Clone)]
pub struct Reconciler {
    engine: CoinEngine,
    verifier: WebhookVerifier,
    operator_queue: Arc<Mutex<OperatorQueue>>,
}

impl Reconciler {
    pub fn new(engine: CoinEngine, verifier: WebhookVerifier, operator_queue: OperatorQueue) -> Self {
        Self {
            engine,
            verifier,
            operator_queue: Arc::new(Mutex::new(operator_queue)),
        }
    }

    pub fn engine(&self) -> &CoinEngine {
        &self.engine
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    pub fn operator_queue(&self) -> Arc<Mutex<OperatorQueue>> {
        self.operator_queue.clone()
    }

    pub async fn handle(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<ReconcileOutcome, WebhookError> {
        self.handle_at(signature, body, Utc::now()).await
    }

    /// Verify, parse and apply one delivery, as of `now`
    pub async fn handle_at(
        &self,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, WebhookError> {
        tracing::debug!(state = EventState::Received.as_str(), bytes = body.len(), "Webhook received");

        if let Err(err) = self.verifier.verify(signature, body, now) {
            warn!(state = EventState::Rejected.as_str(), error = %err, "Webhook rejected");
            return Err(err.into());
        }

        let event = match ProviderEvent::parse(body) {
            Ok(event) => event,
            Err(EventParseError::Envelope(err)) => {
                warn!(state = EventState::Ignored.as_str(), error = %err, "Unparseable webhook body");
                return Ok(ReconcileOutcome::Ignored {
                    event_id: String::new(),
                    reason: format!("unparseable body: {}", err),
                });
            }
            Err(EventParseError::Payload {
                event_id,
                kind,
                source,
            }) => {
                let reason = format!("malformed {} payload: {}", kind, source);
                return self
                    .fail(&event_id, &kind, reason, FailureDetails::default())
                    .await;
            }
        };

        info!(
            state = EventState::Verified.as_str(),
            event_id = %event.id,
            event_type = event.kind_name(),
            "Webhook verified"
        );

        let outcome = self.apply(&event).await?;

        match &outcome {
            ReconcileOutcome::Applied { entry, replayed } => info!(
                state = EventState::Applied.as_str(),
                event_id = %event.id,
                user_id = %entry.user_id,
                entry_id = entry.id,
                replayed,
                "Payment event applied"
            ),
            ReconcileOutcome::Recorded { entry } => info!(
                state = EventState::Applied.as_str(),
                event_id = %event.id,
                user_id = %entry.user_id,
                status = ?entry.status,
                "Payment event recorded"
            ),
            ReconcileOutcome::Ignored { reason, .. } => info!(
                state = EventState::Ignored.as_str(),
                event_id = %event.id,
                reason = %reason,
                "Payment event ignored"
            ),
            ReconcileOutcome::FailedApply { .. } => {}
        }

        Ok(outcome)
    }

    async fn apply(&self, event: &ProviderEvent) -> Result<ReconcileOutcome, WebhookError> {
        match &event.kind {
            EventKind::CheckoutCompleted(session) if session.is_paid() => {
                self.purchase(event, session, &event.id).await
            }
            EventKind::CheckoutCompleted(session) => self.open_pending(event, session).await,
            EventKind::AsyncPaymentSucceeded(session) => {
                match self.settle(session, Settlement::Completed).await {
                    Ok(posting) => Ok(ReconcileOutcome::Applied {
                        entry: posting.entry,
                        replayed: posting.replayed,
                    }),
                    // Success arrived before the session completion; credit it directly
                    // under the session id so a late completion finds it recorded.
                    Err(LedgerError::EntryNotFound { .. }) => {
                        self.purchase(event, session, &session.id).await
                    }
                    Err(err) => self.ledger_failure(event, session, err).await,
                }
            }
            EventKind::AsyncPaymentFailed(session) => {
                match self.settle(session, Settlement::Failed).await {
                    Ok(posting) => Ok(ReconcileOutcome::Recorded {
                        entry: posting.entry,
                    }),
                    Err(LedgerError::EntryNotFound { .. }) => Ok(ReconcileOutcome::Ignored {
                        event_id: event.id.clone(),
                        reason: format!("no pending purchase for session {}", session.id),
                    }),
                    Err(err) => self.ledger_failure(event, session, err).await,
                }
            }
            EventKind::Unrecognized(kind) => Ok(ReconcileOutcome::Ignored {
                event_id: event.id.clone(),
                reason: format!("unhandled event type {}", kind),
            }),
        }
    }

    /// Settle the pending purchase of `session`
    ///
    /// When the session names its user and coins, the entry recorded under
    /// the session id must be that exact purchase.
    async fn settle(
        &self,
        session: &CheckoutSession,
        outcome: Settlement,
    ) -> Result<Posting, LedgerError> {
        match (session.user_id(), session.coins()) {
            (Some(user_id), Some(coins)) => {
                let expected = Mutation::new(user_id, coins, Reason::Purchase)
                    .with_external_ref(&session.id);
                self.engine.settle_expected(&expected, outcome).await
            }
            _ => self.engine.settle(&session.id, outcome).await,
        }
    }

    /// Validated `(user_id, coins)` of a session whose account exists
    async fn purchase_target(
        &self,
        event: &ProviderEvent,
        session: &CheckoutSession,
    ) -> Result<Result<(String, i64), ReconcileOutcome>, WebhookError> {
        let (Some(user_id), Some(coins)) = (session.user_id(), session.coins()) else {
            let outcome = self
                .fail(
                    &event.id,
                    event.kind_name(),
                    "session metadata lacks user_id or coins",
                    details(session),
                )
                .await?;
            return Ok(Err(outcome));
        };

        match self.engine.store().read(user_id) {
            Some(account) if account.archived => {
                let err = LedgerError::AccountArchived {
                    user_id: user_id.to_string(),
                };
                Ok(Err(self.fail(&event.id, event.kind_name(), err.to_string(), details(session)).await?))
            }
            Some(_) => Ok(Ok((user_id.to_string(), coins))),
            None => {
                let err = LedgerError::AccountNotFound {
                    user_id: user_id.to_string(),
                };
                Ok(Err(self.fail(&event.id, event.kind_name(), err.to_string(), details(session)).await?))
            }
        }
    }

    async fn purchase(
        &self,
        event: &ProviderEvent,
        session: &CheckoutSession,
        external_ref: &str,
    ) -> Result<ReconcileOutcome, WebhookError> {
        let (user_id, coins) = match self.purchase_target(event, session).await? {
            Ok(target) => target,
            Err(outcome) => return Ok(outcome),
        };

        let mutation = Mutation::new(user_id, coins, Reason::Purchase)
            .with_external_ref(external_ref)
            .with_description(format!("checkout session {}", session.id));

        match self.engine.post(Direction::Credit, mutation).await {
            Ok(posting) => Ok(ReconcileOutcome::Applied {
                entry: posting.entry,
                replayed: posting.replayed,
            }),
            Err(err) => self.ledger_failure(event, session, err).await,
        }
    }

    async fn open_pending(
        &self,
        event: &ProviderEvent,
        session: &CheckoutSession,
    ) -> Result<ReconcileOutcome, WebhookError> {
        let (user_id, coins) = match self.purchase_target(event, session).await? {
            Ok(target) => target,
            Err(outcome) => return Ok(outcome),
        };

        let mutation = Mutation::new(user_id, coins, Reason::Purchase)
            .with_external_ref(&session.id)
            .with_description(format!("checkout session {} awaiting payment", session.id));

        match self.engine.open_pending(mutation).await {
            Ok(posting) => Ok(ReconcileOutcome::Recorded {
                entry: posting.entry,
            }),
            Err(err) => self.ledger_failure(event, session, err).await,
        }
    }

    /// Transient errors go back to the provider; the rest need an operator
    async fn ledger_failure(
        &self,
        event: &ProviderEvent,
        session: &CheckoutSession,
        err: LedgerError,
    ) -> Result<ReconcileOutcome, WebhookError> {
        if err.is_retryable() {
            warn!(event_id = %event.id, error = %err, "Payment event deferred for redelivery");
            return Err(err.into());
        }
        self.fail(&event.id, event.kind_name(), err.to_string(), details(session))
            .await
    }

    async fn fail(
        &self,
        event_id: &str,
        event_type: &str,
        reason: impl Into<String>,
        details: FailureDetails,
    ) -> Result<ReconcileOutcome, WebhookError> {
        let reason = reason.into();
        error!(
            state = EventState::FailedApply.as_str(),
            event_id,
            event_type,
            user_id = details.user_id.as_deref().unwrap_or(""),
            coins = details.coins,
            reason = %reason,
            "Payment event needs manual follow-up"
        );

        self.operator_queue
            .lock()
            .await
            .record(event_id, event_type, reason.clone(), details)
            .await?;

        Ok(ReconcileOutcome::FailedApply {
            event_id: event_id.to_string(),
            reason,
        })
    }
}

fn details(session: &CheckoutSession) -> FailureDetails {
    FailureDetails {
        user_id: session.user_id().map(str::to_string),
        coins: session.coins(),
        session_id: Some(session.id.clone()),
    }
}
