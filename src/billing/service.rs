use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, StatusHistoryFilter};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{PaymentLookup, SubscriptionStore};
use crate::error::{EngineError, EngineResult};

use super::adapters::{PaymentProvider, RefundOutcome};
use super::aggregate::SubscriptionAggregate;
use super::entitlements::PrivilegeEntitlementTracker;
use super::ledger::{OutcomeDisposition, PaymentLedger, PaymentOutcome};
use super::models::{
    Actor, PlanSnapshot, StatusSnapshot, Subscription, SubscriptionStatus,
    SubscriptionStatusHistory,
};
use super::state_machine::SubscriptionStateMachine;
use super::webhooks::{verify_signature, ProviderEvent, ProviderEventKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    #[serde(default)]
    pub provider_customer_id: Option<String>,
    /// Start billing immediately even when the plan offers a trial.
    #[serde(default)]
    pub skip_trial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    Applied,
    Ignored,
    Duplicate,
}

/// key: billing-service -> subscription lifecycle facade
///
/// Every mutation runs under a per-subscription async lock and commits the whole
/// aggregate with a version check; provider calls happen outside the lock.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn PaymentProvider>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    state_machine: SubscriptionStateMachine,
    ledger: Arc<PaymentLedger>,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let state_machine = SubscriptionStateMachine::new(config.max_payment_attempts);
        let ledger = PaymentLedger::new(
            config.retry_schedule_days.clone(),
            config.max_payment_attempts,
        );
        Self {
            store,
            provider,
            clock,
            config: Arc::new(config),
            locks: Arc::new(DashMap::new()),
            state_machine,
            ledger: Arc::new(ledger),
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn SubscriptionStore {
        self.store.as_ref()
    }

    pub(crate) fn provider(&self) -> &dyn PaymentProvider {
        self.provider.as_ref()
    }

    pub(crate) fn state_machine(&self) -> &SubscriptionStateMachine {
        &self.state_machine
    }

    pub(crate) fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    fn lock_for(&self, subscription_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(subscription_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Load, apply, commit. A version conflict reloads and reapplies up to the configured
    /// bound. An error from `apply` discards the loaded copy, so nothing is written.
    pub(crate) async fn mutate<T, F>(
        &self,
        subscription_id: Uuid,
        event_id: Option<&str>,
        mut apply: F,
    ) -> EngineResult<(T, SubscriptionAggregate)>
    where
        F: FnMut(&mut SubscriptionAggregate, &PlanSnapshot) -> EngineResult<T>,
    {
        let lock = self.lock_for(subscription_id);
        let _guard = lock.lock().await;

        let mut conflicts = 0;
        loop {
            let mut aggregate = self.store.load(subscription_id).await?;
            let plan = self.store.load_plan(aggregate.subscription.plan_id).await?;
            let value = apply(&mut aggregate, &plan)?;

            match self.store.commit(&aggregate, event_id).await {
                Ok(version) => {
                    aggregate.version = version;
                    return Ok((value, aggregate));
                }
                Err(EngineError::ConcurrencyConflict { .. })
                    if conflicts < self.config.concurrency_retries =>
                {
                    conflicts += 1;
                    debug!(
                        subscription = %subscription_id,
                        conflicts,
                        "version conflict, reloading aggregate"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn create_subscription(
        &self,
        request: NewSubscription,
    ) -> EngineResult<SubscriptionAggregate> {
        let plan = self.store.load_plan(request.plan_id).await?;
        if !plan.plan.is_active {
            return Err(EngineError::Validation(format!(
                "plan `{}` is not available for new subscriptions",
                plan.plan.name
            )));
        }

        let now = self.clock.now();
        let trial_days = if request.skip_trial {
            0
        } else {
            plan.plan.trial_duration_in_days.max(0)
        };
        let (status, trial_end) = if trial_days > 0 {
            (
                SubscriptionStatus::Trial,
                Some(now + Duration::days(trial_days as i64)),
            )
        } else {
            (SubscriptionStatus::Active, None)
        };

        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            plan_id: plan.plan.id,
            billing_cycle_id: plan.billing_cycle.id,
            status,
            status_reason: Some("created".to_string()),
            current_price_cents: plan.plan.price_cents,
            currency: plan.plan.currency.clone(),
            start_date: now,
            // A trial is billed when it ends; otherwise the first period is due now.
            next_billing_date: Some(trial_end.unwrap_or(now)),
            last_billing_date: None,
            trial_start_date: trial_end.map(|_| now),
            trial_end_date: trial_end,
            failed_payment_attempts: 0,
            last_payment_date: None,
            last_payment_error: None,
            paused_at: None,
            resumed_date: None,
            cancelled_at: None,
            suspended_at: None,
            expired_at: None,
            deleted_at: None,
            provider_customer_id: request.provider_customer_id,
            created_at: now,
            updated_at: now,
        };

        let mut aggregate = SubscriptionAggregate::new(subscription);
        AuditTrail::record(
            &mut aggregate,
            None,
            status,
            Some("created".to_string()),
            Actor::User(request.user_id),
            now,
        );
        PrivilegeEntitlementTracker::materialize_all(&mut aggregate, &plan, now)?;
        aggregate.version = self.store.insert(&aggregate).await?;

        info!(
            subscription = %aggregate.id(),
            user = %request.user_id,
            plan = %plan.plan.name,
            %status,
            "subscription created"
        );
        Ok(aggregate)
    }

    /// Ends a trial early; the first charge becomes due immediately.
    pub async fn activate(&self, subscription_id: Uuid, actor: Actor) -> EngineResult<StatusSnapshot> {
        let now = self.clock.now();
        let (_, aggregate) = self
            .mutate(subscription_id, None, |aggregate, _| {
                self.state_machine.activate(aggregate, actor.clone(), now)?;
                let subscription = &mut aggregate.subscription;
                subscription.trial_end_date = Some(now);
                subscription.next_billing_date = Some(now);
                Ok(())
            })
            .await?;
        Ok(status_snapshot(&aggregate.subscription))
    }

    pub async fn pause(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
        actor: Actor,
    ) -> EngineResult<StatusSnapshot> {
        let now = self.clock.now();
        let (_, aggregate) = self
            .mutate(subscription_id, None, |aggregate, _| {
                self.state_machine
                    .pause(aggregate, reason.clone(), actor.clone(), now)
            })
            .await?;
        Ok(status_snapshot(&aggregate.subscription))
    }

    pub async fn resume(&self, subscription_id: Uuid, actor: Actor) -> EngineResult<StatusSnapshot> {
        let now = self.clock.now();
        let (_, aggregate) = self
            .mutate(subscription_id, None, |aggregate, _| {
                self.state_machine.resume(aggregate, actor.clone(), now)
            })
            .await?;
        Ok(status_snapshot(&aggregate.subscription))
    }

    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
        actor: Actor,
    ) -> EngineResult<StatusSnapshot> {
        let now = self.clock.now();
        let (_, aggregate) = self
            .mutate(subscription_id, None, |aggregate, _| {
                self.state_machine
                    .cancel(aggregate, reason.clone(), actor.clone(), now)
            })
            .await?;
        Ok(status_snapshot(&aggregate.subscription))
    }

    pub async fn suspend(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
        actor: Actor,
    ) -> EngineResult<StatusSnapshot> {
        let now = self.clock.now();
        let (_, aggregate) = self
            .mutate(subscription_id, None, |aggregate, _| {
                self.state_machine
                    .suspend(aggregate, reason.clone(), actor.clone(), now)
            })
            .await?;
        Ok(status_snapshot(&aggregate.subscription))
    }

    pub async fn mark_expired(
        &self,
        subscription_id: Uuid,
        actor: Actor,
    ) -> EngineResult<StatusSnapshot> {
        let now = self.clock.now();
        let (_, aggregate) = self
            .mutate(subscription_id, None, |aggregate, _| {
                self.state_machine.mark_expired(aggregate, actor.clone(), now)
            })
            .await?;
        Ok(status_snapshot(&aggregate.subscription))
    }

    /// Returns the allowance left after consuming `amount`.
    pub async fn consume(
        &self,
        subscription_id: Uuid,
        privilege: &str,
        amount: i64,
    ) -> EngineResult<i64> {
        let now = self.clock.now();
        let (remaining, _) = self
            .mutate(subscription_id, None, |aggregate, plan| {
                PrivilegeEntitlementTracker::consume(aggregate, plan, privilege, amount, now)
            })
            .await?;
        Ok(remaining)
    }

    pub async fn remaining(&self, subscription_id: Uuid, privilege: &str) -> EngineResult<i64> {
        let aggregate = self.store.load(subscription_id).await?;
        let plan = self.store.load_plan(aggregate.subscription.plan_id).await?;
        PrivilegeEntitlementTracker::remaining(&aggregate, &plan, privilege, self.clock.now())
    }

    pub async fn has_feature(&self, subscription_id: Uuid, privilege: &str) -> EngineResult<bool> {
        let aggregate = self.store.load(subscription_id).await?;
        if !aggregate.subscription.status.grants_entitlements() {
            return Ok(false);
        }
        let plan = self.store.load_plan(aggregate.subscription.plan_id).await?;
        Ok(PrivilegeEntitlementTracker::has_feature(
            &plan,
            privilege,
            self.clock.now(),
        ))
    }

    /// Administrative reset of one privilege's usage period.
    pub async fn reset_privilege(
        &self,
        subscription_id: Uuid,
        privilege: &str,
        actor: Actor,
    ) -> EngineResult<Uuid> {
        let now = self.clock.now();
        let (usage_id, _) = self
            .mutate(subscription_id, None, |aggregate, plan| {
                PrivilegeEntitlementTracker::reset(aggregate, plan, privilege, now)
            })
            .await?;
        info!(subscription = %subscription_id, privilege, %actor, "privilege reset");
        Ok(usage_id)
    }

    pub async fn get_status(&self, subscription_id: Uuid) -> EngineResult<StatusSnapshot> {
        let aggregate = self.store.load(subscription_id).await?;
        Ok(status_snapshot(&aggregate.subscription))
    }

    pub async fn get_subscription(&self, subscription_id: Uuid) -> EngineResult<SubscriptionAggregate> {
        self.store.load(subscription_id).await
    }

    pub async fn status_history(
        &self,
        subscription_id: Uuid,
        filter: &StatusHistoryFilter,
    ) -> EngineResult<Vec<SubscriptionStatusHistory>> {
        let aggregate = self.store.load(subscription_id).await?;
        Ok(AuditTrail::query(&aggregate.history, filter)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn apply_payment_outcome(
        &self,
        payment_id: Uuid,
        outcome: PaymentOutcome,
        actor: Actor,
    ) -> EngineResult<OutcomeDisposition> {
        let location = self
            .store
            .locate_payment(&PaymentLookup::Id(payment_id))
            .await?
            .ok_or_else(|| EngineError::PaymentNotFound(payment_id.to_string()))?;
        let now = self.clock.now();
        let (disposition, _) = self
            .mutate(location.subscription_id, None, |aggregate, plan| {
                self.apply_and_settle(
                    aggregate,
                    plan,
                    payment_id,
                    outcome.clone(),
                    actor.clone(),
                    now,
                )
            })
            .await?;
        Ok(disposition)
    }

    /// Reserves the refund under the subscription lock, asks the provider, then settles
    /// or releases the reservation. Concurrent refunds can never reserve more than the
    /// payment.
    pub async fn refund(
        &self,
        payment_id: Uuid,
        amount_cents: i64,
        reason: Option<String>,
    ) -> EngineResult<Uuid> {
        let location = self
            .store
            .locate_payment(&PaymentLookup::Id(payment_id))
            .await?
            .ok_or_else(|| EngineError::PaymentNotFound(payment_id.to_string()))?;

        let now = self.clock.now();
        let ((refund_id, reference), _) = self
            .mutate(location.subscription_id, None, |aggregate, _| {
                let refund_id = self.ledger.reserve_refund(
                    aggregate,
                    payment_id,
                    amount_cents,
                    reason.clone(),
                    now,
                )?;
                let reference = aggregate
                    .payment(payment_id)?
                    .provider_payment_intent_id
                    .clone()
                    .unwrap_or_else(|| payment_id.to_string());
                Ok((refund_id, reference))
            })
            .await?;

        let (provider_refund_id, failure) = match self.provider.refund(&reference, amount_cents).await
        {
            Ok(RefundOutcome::Succeeded { reference }) => (Some(reference), None),
            Ok(RefundOutcome::Rejected { reason }) => {
                warn!(payment = %payment_id, %reason, "provider rejected refund");
                (None, Some(EngineError::PaymentFailed(reason)))
            }
            Err(err) => {
                warn!(?err, payment = %payment_id, "provider refund call failed");
                (None, Some(err))
            }
        };

        let now = self.clock.now();
        let result = self
            .mutate(location.subscription_id, None, |aggregate, _| {
                self.ledger
                    .settle_refund(aggregate, refund_id, provider_refund_id.clone(), now)
            })
            .await;
        if let Err(err) = result {
            warn!(
                ?err,
                payment = %payment_id,
                refund = %refund_id,
                "refund outcome could not be recorded; reservation stays pending"
            );
            return Err(err);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(refund_id),
        }
    }

    /// Verifies (when a secret is configured) and parses a raw provider callback.
    pub async fn handle_provider_payload(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> EngineResult<EventDisposition> {
        let now = self.clock.now();
        if let Some(secret) = self.config.webhook_secret.as_deref() {
            let header = signature.ok_or(EngineError::InvalidSignature)?;
            verify_signature(payload, header, secret, self.config.webhook_tolerance_secs, now)?;
        }
        let event = ProviderEvent::from_json(payload, now)?;
        self.handle_provider_event(event).await
    }

    /// Applies a provider event at most once. The event id is committed together with its
    /// effect, so a redelivery racing the first delivery is still rejected.
    pub async fn handle_provider_event(&self, event: ProviderEvent) -> EngineResult<EventDisposition> {
        if self.store.is_event_processed(&event.id).await? {
            debug!(event = %event.id, kind = event.kind.as_str(), "duplicate provider event");
            return Ok(EventDisposition::Duplicate);
        }

        let now = self.clock.now();
        let result = match &event.kind {
            ProviderEventKind::PaymentSucceeded {
                payment_reference,
                payment_id,
            } => {
                self.apply_provider_outcome(
                    &event.id,
                    payment_reference,
                    *payment_id,
                    PaymentOutcome::Succeeded {
                        reference: Some(payment_reference.clone()),
                    },
                    now,
                )
                .await
            }
            ProviderEventKind::PaymentFailed {
                payment_reference,
                payment_id,
                reason,
            } => {
                self.apply_provider_outcome(
                    &event.id,
                    payment_reference,
                    *payment_id,
                    PaymentOutcome::Failed {
                        reason: reason.clone(),
                    },
                    now,
                )
                .await
            }
            ProviderEventKind::SubscriptionCancelled {
                subscription_id,
                reason,
            } => self
                .mutate(*subscription_id, Some(event.id.as_str()), |aggregate, _| {
                    match aggregate.subscription.status {
                        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {
                            Ok(EventDisposition::Ignored)
                        }
                        _ => {
                            self.state_machine.cancel(
                                aggregate,
                                reason
                                    .clone()
                                    .or_else(|| Some("cancelled by provider".to_string())),
                                Actor::Provider,
                                now,
                            )?;
                            Ok(EventDisposition::Applied)
                        }
                    }
                })
                .await
                .map(|(disposition, _)| disposition),
            ProviderEventKind::Unknown(kind) => {
                debug!(event = %event.id, kind = %kind, "unhandled provider event kind");
                Ok(EventDisposition::Ignored)
            }
        };

        match result {
            Err(EngineError::DuplicateWebhookEvent(id)) => {
                debug!(event = %id, "provider event committed concurrently");
                Ok(EventDisposition::Duplicate)
            }
            other => {
                if let Ok(disposition) = &other {
                    info!(
                        event = %event.id,
                        kind = event.kind.as_str(),
                        ?disposition,
                        "provider event handled"
                    );
                }
                other
            }
        }
    }

    /// Resolves the payment by the echoed payment id when present, so events racing the
    /// charge call still find it, and by provider reference otherwise.
    async fn apply_provider_outcome(
        &self,
        event_id: &str,
        payment_reference: &str,
        payment_id: Option<Uuid>,
        outcome: PaymentOutcome,
        now: DateTime<Utc>,
    ) -> EngineResult<EventDisposition> {
        let lookup = match payment_id {
            Some(id) => PaymentLookup::Id(id),
            None => PaymentLookup::Reference(payment_reference.to_string()),
        };
        let Some(location) = self.store.locate_payment(&lookup).await? else {
            warn!(
                event = %event_id,
                payment_reference,
                "provider event references an unknown payment"
            );
            return Ok(EventDisposition::Ignored);
        };

        let (disposition, _) = self
            .mutate(location.subscription_id, Some(event_id), |aggregate, plan| {
                if aggregate
                    .payment(location.payment_id)?
                    .provider_payment_intent_id
                    .is_none()
                {
                    self.ledger.record_reference(
                        aggregate,
                        location.payment_id,
                        payment_reference,
                        now,
                    )?;
                }
                self.apply_and_settle(
                    aggregate,
                    plan,
                    location.payment_id,
                    outcome.clone(),
                    Actor::Provider,
                    now,
                )
            })
            .await?;
        Ok(match disposition {
            OutcomeDisposition::Ignored => EventDisposition::Ignored,
            _ => EventDisposition::Applied,
        })
    }

    /// Applies a payment outcome and, when it settles the payment, closes out the billed
    /// period.
    pub(crate) fn apply_and_settle(
        &self,
        aggregate: &mut SubscriptionAggregate,
        plan: &PlanSnapshot,
        payment_id: Uuid,
        outcome: PaymentOutcome,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<OutcomeDisposition> {
        let disposition =
            self.ledger
                .apply_outcome(aggregate, &self.state_machine, payment_id, outcome, actor, now)?;
        if disposition == OutcomeDisposition::Paid {
            settle_period(aggregate, plan, payment_id, now)?;
        }
        Ok(disposition)
    }

    /// Hides the subscription from every operation and from the scheduler.
    pub async fn soft_delete(&self, subscription_id: Uuid, actor: Actor) -> EngineResult<()> {
        let now = self.clock.now();
        self.mutate(subscription_id, None, |aggregate, _| {
            aggregate.subscription.deleted_at = Some(now);
            aggregate.touch(now);
            Ok(())
        })
        .await?;
        info!(subscription = %subscription_id, %actor, "subscription soft-deleted");
        Ok(())
    }
}

/// Moves `NextBillingDate` past the paid period and rolls over usage periods that ended.
fn settle_period(
    aggregate: &mut SubscriptionAggregate,
    plan: &PlanSnapshot,
    payment_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let period_end = aggregate.payment(payment_id)?.billing_period_end;
    let subscription = &mut aggregate.subscription;
    if subscription.status.is_billable() {
        if let Some(next) = subscription.next_billing_date {
            if next < period_end {
                subscription.next_billing_date = Some(period_end);
            }
        }
    }
    PrivilegeEntitlementTracker::rollover_expired(aggregate, plan, now)?;
    PrivilegeEntitlementTracker::materialize_all(aggregate, plan, now)?;
    Ok(())
}

fn status_snapshot(subscription: &Subscription) -> StatusSnapshot {
    StatusSnapshot {
        subscription_id: subscription.id,
        status: subscription.status,
        status_reason: subscription.status_reason.clone(),
        next_billing_date: subscription.next_billing_date,
        failed_payment_attempts: subscription.failed_payment_attempts,
    }
}
