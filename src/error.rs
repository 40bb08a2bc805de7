use thiserror::Error;
use uuid::Uuid;

use crate::billing::models::{PaymentStatus, SubscriptionStatus};

/// key: engine-errors -> validation, billing, persistence
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    #[error("quota exceeded for `{privilege}`: requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        privilege: String,
        requested: i64,
        remaining: i64,
    },
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("refund of {requested} exceeds refundable amount {refundable}")]
    RefundExceedsPayment { requested: i64, refundable: i64 },
    #[error("provider event `{0}` already processed")]
    DuplicateWebhookEvent(String),
    #[error("subscription {subscription_id} was modified concurrently")]
    ConcurrencyConflict { subscription_id: Uuid },
    #[error("no usage period configured for `{privilege}`")]
    PeriodNotFound { privilege: String },
    #[error("subscription {0} not found")]
    SubscriptionNotFound(Uuid),
    #[error("payment {0} not found")]
    PaymentNotFound(String),
    #[error("plan {0} not found")]
    PlanNotFound(Uuid),
    #[error("privilege `{0}` not granted by plan")]
    PrivilegeNotFound(String),
    #[error("subscription is {status} and grants no entitlements")]
    SubscriptionInactive { status: SubscriptionStatus },
    #[error("payment {payment_id} is {status}")]
    InvalidPaymentState {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    #[error("unknown status value `{0}`")]
    InvalidStatus(String),
    #[error("provider event signature rejected")]
    InvalidSignature,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Errors worth another attempt against a fresh copy of the aggregate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrencyConflict { .. } | EngineError::Database(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::SubscriptionNotFound(_)
                | EngineError::PaymentNotFound(_)
                | EngineError::PlanNotFound(_)
                | EngineError::PrivilegeNotFound(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
