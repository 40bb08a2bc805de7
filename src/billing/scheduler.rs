use std::ops::AddAssign;

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::CandidateQuery;
use crate::error::EngineResult;

use super::adapters::{ChargeOutcome, ChargeRequest};
use super::aggregate::SubscriptionAggregate;
use super::ledger::{OutcomeDisposition, PaymentOutcome};
use super::models::{Actor, BillingPeriod, PaymentStatus, PlanSnapshot, SubscriptionStatus};
use super::service::BillingService;

/// What one tick did, summed over every subscription it touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub examined: usize,
    pub charges_attempted: usize,
    pub paid: usize,
    pub failed: usize,
    pub processing: usize,
    pub retried: usize,
    pub reconciled: usize,
    pub expired: usize,
    pub errors: usize,
}

impl AddAssign for TickReport {
    fn add_assign(&mut self, other: Self) {
        self.examined += other.examined;
        self.charges_attempted += other.charges_attempted;
        self.paid += other.paid;
        self.failed += other.failed;
        self.processing += other.processing;
        self.retried += other.retried;
        self.reconciled += other.reconciled;
        self.expired += other.expired;
        self.errors += other.errors;
    }
}

/// Charge prepared under the subscription lock and sent to the provider after it is
/// released.
#[derive(Debug, Clone)]
struct PendingCharge {
    payment_id: Uuid,
    request: ChargeRequest,
}

/// A billing action is due when the subscription is billable, its next billing date has
/// passed and no payment exists yet for the period starting on that date.
pub fn billing_due(aggregate: &SubscriptionAggregate, now: DateTime<Utc>) -> bool {
    let subscription = &aggregate.subscription;
    if subscription.deleted_at.is_some() || !subscription.status.is_billable() {
        return false;
    }
    let Some(next) = subscription.next_billing_date else {
        return false;
    };
    next <= now
        && !aggregate
            .payments
            .iter()
            .any(|payment| payment.billing_period_start == next)
}

/// key: billing-cycle-scheduler -> charges, retries, stale attempts, expiry
#[derive(Clone)]
pub struct BillingCycleScheduler {
    service: BillingService,
}

impl BillingCycleScheduler {
    pub fn new(service: BillingService) -> Self {
        Self { service }
    }

    /// Runs `tick` on a fixed cadence with time taken from the service clock.
    pub fn spawn(self, interval: TokioDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let now = self.service.clock().now();
                match self.tick(now).await {
                    Ok(report) => info!(?report, "billing tick finished"),
                    Err(err) => warn!(?err, "billing tick failed"),
                }
            }
        })
    }

    /// key: billing-cycle-scheduler -> tick handler
    ///
    /// Each subscription is processed and committed on its own; one failing subscription
    /// is counted in `errors` and does not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        let config = self.service.config();
        let query = CandidateQuery {
            now,
            pending_before: now - config.pending_timeout,
            expire_before: now - config.expiry_grace,
        };
        let candidates = self.service.store().billing_candidates(query).await?;
        debug!(candidates = candidates.len(), %now, "billing tick started");

        let reports: Vec<TickReport> = stream::iter(candidates)
            .map(|subscription_id| async move {
                match self.process_subscription(subscription_id, now).await {
                    Ok(report) => report,
                    Err(err) => {
                        warn!(
                            ?err,
                            subscription = %subscription_id,
                            "billing tick failed for subscription"
                        );
                        TickReport {
                            examined: 1,
                            errors: 1,
                            ..TickReport::default()
                        }
                    }
                }
            })
            .buffer_unordered(config.tick_concurrency.max(1))
            .collect()
            .await;

        let mut total = TickReport::default();
        for report in reports {
            total += report;
        }
        Ok(total)
    }

    pub async fn process_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<TickReport> {
        let (prepared, _) = self
            .service
            .mutate(subscription_id, None, |aggregate, plan| {
                self.prepare(aggregate, plan, now)
            })
            .await?;
        let (mut report, charge) = prepared;

        if let Some(charge) = charge {
            report += self.charge(subscription_id, charge).await?;
        }
        Ok(report)
    }

    /// First critical section: expiry, stale attempt reconciliation and creation of the
    /// next attempt, if any.
    fn prepare(
        &self,
        aggregate: &mut SubscriptionAggregate,
        plan: &PlanSnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<(TickReport, Option<PendingCharge>)> {
        let config = self.service.config();
        let ledger = self.service.ledger();
        let mut report = TickReport {
            examined: 1,
            ..TickReport::default()
        };

        if grace_elapsed(aggregate, config.expiry_grace, now) {
            self.service
                .state_machine()
                .mark_expired(aggregate, Actor::Scheduler, now)?;
            report.expired += 1;
        }

        for payment_id in ledger.stale_pending(aggregate, config.pending_timeout, now) {
            let disposition = self.service.apply_and_settle(
                aggregate,
                plan,
                payment_id,
                PaymentOutcome::Failed {
                    reason: "payment attempt timed out".to_string(),
                },
                Actor::Scheduler,
                now,
            )?;
            if disposition != OutcomeDisposition::Ignored {
                report.reconciled += 1;
            }
        }

        if !aggregate.subscription.status.is_billable() {
            return Ok((report, None));
        }

        let payment_id = if billing_due(aggregate, now) {
            let Some(start) = aggregate.subscription.next_billing_date else {
                return Ok((report, None));
            };
            let period = BillingPeriod {
                start,
                end: plan.billing_cycle.advance(start)?,
            };
            let amount = aggregate.subscription.current_price_cents;
            let payment_id = ledger.create_attempt(aggregate, amount, period, now)?;
            if amount == 0 {
                self.service.apply_and_settle(
                    aggregate,
                    plan,
                    payment_id,
                    PaymentOutcome::Succeeded { reference: None },
                    Actor::Scheduler,
                    now,
                )?;
                report.paid += 1;
                return Ok((report, None));
            }
            payment_id
        } else if let Some(payment_id) = ledger.due_retry(aggregate, now) {
            ledger.begin_retry(aggregate, payment_id, now)?;
            report.retried += 1;
            payment_id
        } else {
            return Ok((report, None));
        };

        let subscription = &aggregate.subscription;
        let payment = aggregate.payment(payment_id)?;
        let request = ChargeRequest {
            subscription_id: subscription.id,
            payment_id,
            customer: subscription
                .provider_customer_id
                .clone()
                .unwrap_or_else(|| subscription.user_id.to_string()),
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            idempotency_key: format!("{}-{}", payment_id.simple(), payment.attempt_count),
        };
        Ok((report, Some(PendingCharge { payment_id, request })))
    }

    /// Calls the provider without holding the lock, then records what is known.
    async fn charge(&self, subscription_id: Uuid, charge: PendingCharge) -> EngineResult<TickReport> {
        let mut report = TickReport {
            charges_attempted: 1,
            ..TickReport::default()
        };
        let timeout = self.service.config().charge_timeout;
        let response = time::timeout(timeout, self.service.provider().charge(&charge.request)).await;

        let (outcome, reference) = match response {
            Ok(Ok(ChargeOutcome::Succeeded { reference })) => (
                Some(PaymentOutcome::Succeeded {
                    reference: Some(reference.clone()),
                }),
                Some(reference),
            ),
            Ok(Ok(ChargeOutcome::Processing { reference })) => (None, Some(reference)),
            Ok(Ok(ChargeOutcome::Declined { reason, reference })) => {
                (Some(PaymentOutcome::Failed { reason }), reference)
            }
            Ok(Err(err)) => {
                warn!(?err, payment = %charge.payment_id, "payment provider call failed");
                (
                    Some(PaymentOutcome::Failed {
                        reason: err.to_string(),
                    }),
                    None,
                )
            }
            Err(_) => {
                warn!(
                    payment = %charge.payment_id,
                    timeout_secs = timeout.as_secs(),
                    "payment provider call timed out"
                );
                (
                    Some(PaymentOutcome::Failed {
                        reason: "payment provider timed out".to_string(),
                    }),
                    None,
                )
            }
        };

        let now = self.service.clock().now();
        let (disposition, _) = self
            .service
            .mutate(subscription_id, None, |aggregate, plan| {
                let payment = aggregate.payment(charge.payment_id)?;
                // An event may have settled the payment while the charge call was in flight.
                let unrecorded = payment.status == PaymentStatus::Pending
                    || payment.provider_payment_intent_id.is_none();
                if let (true, Some(reference)) = (unrecorded, reference.as_deref()) {
                    self.service.ledger().record_reference(
                        aggregate,
                        charge.payment_id,
                        reference,
                        now,
                    )?;
                }
                match &outcome {
                    Some(outcome) => self
                        .service
                        .apply_and_settle(
                            aggregate,
                            plan,
                            charge.payment_id,
                            outcome.clone(),
                            Actor::Scheduler,
                            now,
                        )
                        .map(Some),
                    None => Ok(None),
                }
            })
            .await?;

        match disposition {
            Some(OutcomeDisposition::Paid) => report.paid += 1,
            Some(OutcomeDisposition::Failed { .. }) => report.failed += 1,
            Some(OutcomeDisposition::Ignored) => {}
            None => {
                report.processing += 1;
                info!(
                    subscription = %subscription_id,
                    payment = %charge.payment_id,
                    reference = reference.as_deref().unwrap_or_default(),
                    "charge accepted, awaiting provider confirmation"
                );
            }
        }
        Ok(report)
    }
}

fn grace_elapsed(aggregate: &SubscriptionAggregate, grace: Duration, now: DateTime<Utc>) -> bool {
    let subscription = &aggregate.subscription;
    let since = match subscription.status {
        SubscriptionStatus::Cancelled => subscription.cancelled_at,
        SubscriptionStatus::Suspended => subscription.suspended_at,
        _ => None,
    };
    since.map_or(false, |at| at + grace <= now)
}
