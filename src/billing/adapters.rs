use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChargeRequest {
    pub subscription_id: Uuid,
    /// Sent as `metadata.payment_id`; providers echo it on payment events.
    pub payment_id: Uuid,
    pub customer: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Stable per payment attempt so a provider can collapse resubmissions.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded { reference: String },
    /// Accepted by the provider; the result arrives later as a provider event.
    Processing { reference: String },
    Declined {
        reason: String,
        reference: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RefundOutcome {
    Succeeded { reference: String },
    Rejected { reason: String },
}

/// key: billing-adapter -> payment provider integration
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> EngineResult<ChargeOutcome>;
    async fn refund(&self, payment_reference: &str, amount_cents: i64)
        -> EngineResult<RefundOutcome>;
}

/// key: billing-adapter-stripe -> stub implementation
///
/// Accepts every charge and refund. Used when no real provider is wired in.
#[derive(Debug, Clone, Default)]
pub struct StripeLikeAdapter;

#[async_trait]
impl PaymentProvider for StripeLikeAdapter {
    async fn charge(&self, request: &ChargeRequest) -> EngineResult<ChargeOutcome> {
        tracing::debug!(
            payment = %request.payment_id,
            amount_cents = request.amount_cents,
            integration = "stubbed",
            "charge accepted"
        );
        Ok(ChargeOutcome::Succeeded {
            reference: format!("pi_{}", request.idempotency_key),
        })
    }

    async fn refund(
        &self,
        payment_reference: &str,
        amount_cents: i64,
    ) -> EngineResult<RefundOutcome> {
        tracing::debug!(
            payment_reference,
            amount_cents,
            integration = "stubbed",
            "refund accepted"
        );
        Ok(RefundOutcome::Succeeded {
            reference: format!("re_{}", Uuid::new_v4().simple()),
        })
    }
}
