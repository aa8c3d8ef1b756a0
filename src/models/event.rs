use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const ASYNC_PAYMENT_FAILED: &str = "checkout.session.async_payment_failed";

/// Errors raised while turning a verified webhook body into a typed event
#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed '{kind}' payload for event {event_id}: {source}")]
    Payload {
        event_id: String,
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// Checkout session object carried by the card processor's events
///
/// Metadata values are strings on the wire, so `coins` is parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    pub fn user_id(&self) -> Option<&str> {
        self.metadata
            .get("user_id")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Coin amount purchased, if present and a whole number
    pub fn coins(&self) -> Option<i64> {
        self.metadata.get("coins")?.trim().parse().ok()
    }
}

/// Closed set of provider events the reconciler acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSession),
    AsyncPaymentSucceeded(CheckoutSession),
    AsyncPaymentFailed(CheckoutSession),
    Unrecognized(String),
}

/// A verified, parsed provider event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub id: String,
    pub kind: EventKind,
}

impl ProviderEvent {
    /// Parse a raw webhook body into a typed event
    pub fn parse(body: &[u8]) -> Result<Self, EventParseError> {
        let envelope: Envelope = serde_json::from_slice(body).map_err(EventParseError::Envelope)?;

        let session = |object: Option<EnvelopeData>| -> Result<CheckoutSession, EventParseError> {
            let object = object.map(|data| data.object).unwrap_or_default();
            serde_json::from_value(object).map_err(|source| EventParseError::Payload {
                event_id: envelope.id.clone(),
                kind: envelope.kind.clone(),
                source,
            })
        };

        let kind = match envelope.kind.as_str() {
            CHECKOUT_COMPLETED => EventKind::CheckoutCompleted(session(envelope.data)?),
            ASYNC_PAYMENT_SUCCEEDED => EventKind::AsyncPaymentSucceeded(session(envelope.data)?),
            ASYNC_PAYMENT_FAILED => EventKind::AsyncPaymentFailed(session(envelope.data)?),
            other => EventKind::Unrecognized(other.to_string()),
        };

        Ok(Self {
            id: envelope.id,
            kind,
        })
    }

    pub fn kind_name(&self) -> &str {
        match &self.kind {
            EventKind::CheckoutCompleted(_) => CHECKOUT_COMPLETED,
            EventKind::AsyncPaymentSucceeded(_) => ASYNC_PAYMENT_SUCCEEDED,
            EventKind::AsyncPaymentFailed(_) => ASYNC_PAYMENT_FAILED,
            EventKind::Unrecognized(kind) => kind,
        }
    }
}
