use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::billing::aggregate::SubscriptionAggregate;
use crate::billing::models::PlanSnapshot;
use crate::error::{EngineError, EngineResult};

use super::{
    needs_attention, CandidateQuery, PaymentLocation, PaymentLookup, SubscriptionStore,
};

/// key: memory-store -> DashMap-backed aggregate store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    subscriptions: DashMap<Uuid, SubscriptionAggregate>,
    plans: DashMap<Uuid, PlanSnapshot>,
    processed_events: DashMap<String, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(self, plan: PlanSnapshot) -> Self {
        self.plans.insert(plan.plan.id, plan);
        self
    }

    /// Raw view including soft-deleted rows.
    pub fn snapshot(&self, subscription_id: Uuid) -> Option<SubscriptionAggregate> {
        self.subscriptions
            .get(&subscription_id)
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn load(&self, subscription_id: Uuid) -> EngineResult<SubscriptionAggregate> {
        self.subscriptions
            .get(&subscription_id)
            .filter(|entry| entry.subscription.deleted_at.is_none())
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::SubscriptionNotFound(subscription_id))
    }

    async fn insert(&self, aggregate: &SubscriptionAggregate) -> EngineResult<i64> {
        match self.subscriptions.entry(aggregate.id()) {
            Entry::Occupied(_) => Err(EngineError::Validation(format!(
                "subscription {} already exists",
                aggregate.id()
            ))),
            Entry::Vacant(slot) => {
                let mut stored = aggregate.clone();
                stored.version = 1;
                slot.insert(stored);
                Ok(1)
            }
        }
    }

    async fn commit(
        &self,
        aggregate: &SubscriptionAggregate,
        event_id: Option<&str>,
    ) -> EngineResult<i64> {
        // Event slot first, then the subscription entry; both held until the write lands.
        let event_slot = match event_id {
            Some(event_id) => match self.processed_events.entry(event_id.to_string()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::DuplicateWebhookEvent(event_id.to_string()))
                }
                Entry::Vacant(slot) => Some(slot),
            },
            None => None,
        };

        let mut stored = self
            .subscriptions
            .get_mut(&aggregate.id())
            .ok_or(EngineError::SubscriptionNotFound(aggregate.id()))?;
        if stored.version != aggregate.version {
            return Err(EngineError::ConcurrencyConflict {
                subscription_id: aggregate.id(),
            });
        }

        let version = aggregate.version + 1;
        let mut next = aggregate.clone();
        next.version = version;
        *stored = next;
        if let Some(slot) = event_slot {
            slot.insert(aggregate.id());
        }
        Ok(version)
    }

    async fn load_plan(&self, plan_id: Uuid) -> EngineResult<PlanSnapshot> {
        self.plans
            .get(&plan_id)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::PlanNotFound(plan_id))
    }

    async fn save_plan(&self, plan: &PlanSnapshot) -> EngineResult<()> {
        self.plans.insert(plan.plan.id, plan.clone());
        Ok(())
    }

    async fn billing_candidates(&self, query: CandidateQuery) -> EngineResult<Vec<Uuid>> {
        let mut candidates: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .subscriptions
            .iter()
            .filter(|entry| needs_attention(entry.value(), &query))
            .map(|entry| (entry.subscription.created_at, *entry.key()))
            .collect();
        candidates.sort();
        Ok(candidates.into_iter().map(|(_, id)| id).collect())
    }

    async fn locate_payment(
        &self,
        lookup: &PaymentLookup,
    ) -> EngineResult<Option<PaymentLocation>> {
        let location = self.subscriptions.iter().find_map(|entry| {
            let payment = match lookup {
                PaymentLookup::Id(id) => entry.payments.iter().find(|payment| payment.id == *id),
                PaymentLookup::Reference(reference) => entry.payment_by_reference(reference),
            }?;
            Some(PaymentLocation {
                subscription_id: *entry.key(),
                payment_id: payment.id,
            })
        });
        Ok(location)
    }

    async fn is_event_processed(&self, event_id: &str) -> EngineResult<bool> {
        Ok(self.processed_events.contains_key(event_id))
    }
}
