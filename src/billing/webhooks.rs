use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

type HmacSha256 = Hmac<Sha256>;

/// key: provider-event -> normalized provider callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Stable provider id; redeliveries carry the same value.
    pub id: String,
    pub kind: ProviderEventKind,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderEventKind {
    /// `payment_id` is the engine's payment id echoed back from the charge metadata. It
    /// resolves events that arrive before the charge call returned a reference.
    PaymentSucceeded {
        payment_reference: String,
        payment_id: Option<Uuid>,
    },
    PaymentFailed {
        payment_reference: String,
        payment_id: Option<Uuid>,
        reason: String,
    },
    SubscriptionCancelled {
        subscription_id: Uuid,
        reason: Option<String>,
    },
    Unknown(String),
}

impl ProviderEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderEventKind::PaymentSucceeded { .. } => "payment.succeeded",
            ProviderEventKind::PaymentFailed { .. } => "payment.failed",
            ProviderEventKind::SubscriptionCancelled { .. } => "subscription.cancelled",
            ProviderEventKind::Unknown(kind) => kind.as_str(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProviderEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    data: Value,
}

impl ProviderEvent {
    /// Parses the provider's JSON envelope:
    /// `{"id": "...", "type": "payment.succeeded", "created": 1700000000, "data": {...}}`.
    /// `received_at` stands in when the envelope carries no timestamp.
    pub fn from_json(payload: &[u8], received_at: DateTime<Utc>) -> EngineResult<Self> {
        let raw: RawProviderEvent = serde_json::from_slice(payload)?;
        if raw.id.trim().is_empty() {
            return Err(EngineError::Validation(
                "provider event is missing an id".to_string(),
            ));
        }

        let occurred_at = match raw.created {
            Some(seconds) => Utc
                .timestamp_opt(seconds, 0)
                .single()
                .ok_or_else(|| {
                    EngineError::Validation(format!("invalid event timestamp {seconds}"))
                })?,
            None => received_at,
        };

        let kind = match raw.kind.as_str() {
            "payment.succeeded" | "payment_intent.succeeded" | "invoice.paid" => {
                ProviderEventKind::PaymentSucceeded {
                    payment_reference: required_str(&raw.data, "payment_reference")?,
                    payment_id: echoed_payment_id(&raw.data)?,
                }
            }
            "payment.failed" | "payment_intent.payment_failed" | "invoice.payment_failed" => {
                ProviderEventKind::PaymentFailed {
                    payment_reference: required_str(&raw.data, "payment_reference")?,
                    payment_id: echoed_payment_id(&raw.data)?,
                    reason: optional_str(&raw.data, "reason")
                        .unwrap_or_else(|| "declined by provider".to_string()),
                }
            }
            "subscription.cancelled" | "customer.subscription.deleted" => {
                let subscription_id = required_str(&raw.data, "subscription_id")?;
                ProviderEventKind::SubscriptionCancelled {
                    subscription_id: Uuid::parse_str(&subscription_id).map_err(|err| {
                        EngineError::Validation(format!(
                            "invalid subscription id `{subscription_id}`: {err}"
                        ))
                    })?,
                    reason: optional_str(&raw.data, "reason"),
                }
            }
            other => ProviderEventKind::Unknown(other.to_string()),
        };

        Ok(ProviderEvent {
            id: raw.id,
            kind,
            occurred_at,
        })
    }
}

fn optional_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

/// Reads `payment_id` from the event data or from its `metadata` object.
fn echoed_payment_id(data: &Value) -> EngineResult<Option<Uuid>> {
    let raw = optional_str(data, "payment_id").or_else(|| {
        data.get("metadata")
            .and_then(|metadata| optional_str(metadata, "payment_id"))
    });
    raw.map(|value| {
        Uuid::parse_str(&value).map_err(|err| {
            EngineError::Validation(format!("invalid payment id `{value}`: {err}"))
        })
    })
    .transpose()
}

fn required_str(data: &Value, key: &str) -> EngineResult<String> {
    optional_str(data, key)
        .ok_or_else(|| EngineError::Validation(format!("provider event is missing `{key}`")))
}

/// key: provider-event-signature -> `t=<unix>,v1=<hex hmac-sha256 of "<t>.<payload>">`
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(EngineError::InvalidSignature)?;
    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        tracing::warn!(timestamp, "provider event signature outside tolerance");
        return Err(EngineError::InvalidSignature);
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| EngineError::InvalidSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(EngineError::InvalidSignature)
}

/// Produces a header `verify_signature` accepts. Used by provider simulators and tests.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> EngineResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| EngineError::InvalidSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={timestamp},v1={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}
