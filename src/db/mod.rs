use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::billing::aggregate::SubscriptionAggregate;
use crate::billing::models::{PaymentStatus, PlanSnapshot, SubscriptionStatus};
use crate::error::EngineResult;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Thresholds the scheduler uses to select subscriptions needing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateQuery {
    pub now: DateTime<Utc>,
    /// Pending payments last attempted at or before this instant are stale.
    pub pending_before: DateTime<Utc>,
    /// Cancelled or suspended at or before this instant means the grace period elapsed.
    pub expire_before: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentLookup {
    Id(Uuid),
    Reference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentLocation {
    pub subscription_id: Uuid,
    pub payment_id: Uuid,
}

/// key: subscription-store -> aggregate persistence
///
/// `commit` is a compare-and-swap on `aggregate.version`: it fails with
/// `ConcurrencyConflict` when the stored version moved, and with
/// `DuplicateWebhookEvent` when `event_id` was already recorded. Either way nothing is
/// written. On success it returns the new version.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Soft-deleted subscriptions read as `SubscriptionNotFound`.
    async fn load(&self, subscription_id: Uuid) -> EngineResult<SubscriptionAggregate>;
    async fn insert(&self, aggregate: &SubscriptionAggregate) -> EngineResult<i64>;
    async fn commit(
        &self,
        aggregate: &SubscriptionAggregate,
        event_id: Option<&str>,
    ) -> EngineResult<i64>;
    async fn load_plan(&self, plan_id: Uuid) -> EngineResult<PlanSnapshot>;
    async fn save_plan(&self, plan: &PlanSnapshot) -> EngineResult<()>;
    async fn billing_candidates(&self, query: CandidateQuery) -> EngineResult<Vec<Uuid>>;
    async fn locate_payment(&self, lookup: &PaymentLookup)
        -> EngineResult<Option<PaymentLocation>>;
    async fn is_event_processed(&self, event_id: &str) -> EngineResult<bool>;
}

/// Same selection the Postgres query performs, for stores that filter in memory.
pub(crate) fn needs_attention(aggregate: &SubscriptionAggregate, query: &CandidateQuery) -> bool {
    let subscription = &aggregate.subscription;
    if subscription.deleted_at.is_some() {
        return false;
    }
    let billable = subscription.status.is_billable();
    let due = billable
        && subscription
            .next_billing_date
            .map_or(false, |next| next <= query.now);
    let stale = aggregate.payments.iter().any(|payment| {
        payment.status == PaymentStatus::Pending && payment.last_attempt_at <= query.pending_before
    });
    let retry = billable
        && aggregate.payments.iter().any(|payment| {
            payment.status == PaymentStatus::Failed
                && payment.next_retry_at.map_or(false, |at| at <= query.now)
        });
    let expiring = match subscription.status {
        SubscriptionStatus::Cancelled => subscription
            .cancelled_at
            .map_or(false, |at| at <= query.expire_before),
        SubscriptionStatus::Suspended => subscription
            .suspended_at
            .map_or(false, |at| at <= query.expire_before),
        _ => false,
    };
    due || stale || retry || expiring
}
