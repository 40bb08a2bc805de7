use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::aggregate::SubscriptionAggregate;
use super::models::{
    Actor, BillingPeriod, PaymentRefund, PaymentStatus, RefundStatus, SubscriptionPayment,
};
use super::state_machine::SubscriptionStateMachine;

/// Result of a charge as far as the ledger is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentOutcome {
    Succeeded { reference: Option<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeDisposition {
    Paid,
    Failed { retry_scheduled: bool },
    /// Stale or redelivered outcome; nothing changed.
    Ignored,
}

/// key: payment-ledger -> attempts, outcomes, retries, refunds
#[derive(Debug, Clone)]
pub struct PaymentLedger {
    retry_schedule_days: Vec<i64>,
    max_attempts: i32,
}

impl PaymentLedger {
    pub fn new(retry_schedule_days: Vec<i64>, max_attempts: i32) -> Self {
        let retry_schedule_days = if retry_schedule_days.is_empty() {
            vec![1]
        } else {
            retry_schedule_days
        };
        Self {
            retry_schedule_days,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Backoff after the `attempt`-th failure (1-based); the last step repeats.
    pub fn retry_delay(&self, attempt: i32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.retry_schedule_days.len() - 1);
        Duration::days(self.retry_schedule_days[index])
    }

    pub fn create_attempt(
        &self,
        aggregate: &mut SubscriptionAggregate,
        amount_cents: i64,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> EngineResult<Uuid> {
        if amount_cents < 0 {
            return Err(EngineError::Validation(format!(
                "payment amount must not be negative, got {amount_cents}"
            )));
        }
        if period.end <= period.start {
            return Err(EngineError::Validation(
                "billing period must end after it starts".to_string(),
            ));
        }

        let payment = SubscriptionPayment {
            id: Uuid::new_v4(),
            subscription_id: aggregate.id(),
            amount_cents,
            currency: aggregate.subscription.currency.clone(),
            status: PaymentStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            last_attempt_at: now,
            billing_period_start: period.start,
            billing_period_end: period.end,
            provider_payment_intent_id: None,
            failure_reason: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = payment.id;
        aggregate.payments.push(payment);
        aggregate.subscription.last_billing_date = Some(period.start);
        aggregate.touch(now);

        tracing::info!(
            subscription = %aggregate.id(),
            payment = %id,
            amount_cents,
            period_start = %period.start,
            "payment attempt created"
        );
        Ok(id)
    }

    /// Moves a failed payment back to `Pending` for another charge.
    pub fn begin_retry(
        &self,
        aggregate: &mut SubscriptionAggregate,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let payment = aggregate.payment_mut(payment_id)?;
        if payment.status != PaymentStatus::Failed {
            return Err(EngineError::InvalidPaymentState {
                payment_id,
                status: payment.status,
            });
        }
        payment.status = PaymentStatus::Pending;
        payment.next_retry_at = None;
        payment.last_attempt_at = now;
        payment.updated_at = now;
        aggregate.touch(now);
        Ok(())
    }

    /// Stores the provider reference of an in-flight charge.
    pub fn record_reference(
        &self,
        aggregate: &mut SubscriptionAggregate,
        payment_id: Uuid,
        reference: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let payment = aggregate.payment_mut(payment_id)?;
        payment.provider_payment_intent_id = Some(reference.to_string());
        payment.updated_at = now;
        aggregate.touch(now);
        Ok(())
    }

    pub fn apply_outcome(
        &self,
        aggregate: &mut SubscriptionAggregate,
        state_machine: &SubscriptionStateMachine,
        payment_id: Uuid,
        outcome: PaymentOutcome,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<OutcomeDisposition> {
        let billable = aggregate.subscription.status.is_billable();
        let payment = aggregate.payment_mut(payment_id)?;
        let current = payment.status;

        match (current, outcome) {
            (PaymentStatus::Pending | PaymentStatus::Failed, PaymentOutcome::Succeeded { reference }) => {
                payment.status = PaymentStatus::Paid;
                payment.paid_at = Some(now);
                payment.next_retry_at = None;
                payment.failure_reason = None;
                payment.updated_at = now;
                if reference.is_some() {
                    payment.provider_payment_intent_id = reference;
                }
                tracing::info!(
                    subscription = %aggregate.subscription.id,
                    payment = %payment_id,
                    "payment settled"
                );
                state_machine.record_payment_success(aggregate, actor, now)?;
                Ok(OutcomeDisposition::Paid)
            }
            (PaymentStatus::Pending, PaymentOutcome::Failed { reason }) => {
                payment.status = PaymentStatus::Failed;
                payment.attempt_count += 1;
                payment.failure_reason = Some(reason.clone());
                payment.updated_at = now;
                let attempts = payment.attempt_count;
                // Retries only run while the subscription is billable.
                payment.next_retry_at = if billable && attempts < self.max_attempts {
                    Some(now + self.retry_delay(attempts))
                } else {
                    None
                };
                let retry_scheduled = payment.next_retry_at.is_some();
                tracing::warn!(
                    subscription = %aggregate.subscription.id,
                    payment = %payment_id,
                    attempts,
                    %reason,
                    "payment attempt failed"
                );
                state_machine.record_payment_failure(aggregate, &reason, actor, now)?;
                // Suspension stops retries; reflect it in the disposition.
                let retry_scheduled = retry_scheduled
                    && aggregate
                        .payment(payment_id)
                        .map(|payment| payment.next_retry_at.is_some())
                        .unwrap_or(false);
                Ok(OutcomeDisposition::Failed { retry_scheduled })
            }
            (status, outcome) => {
                tracing::debug!(
                    payment = %payment_id,
                    %status,
                    ?outcome,
                    "stale payment outcome ignored"
                );
                Ok(OutcomeDisposition::Ignored)
            }
        }
    }

    /// Amount not yet refunded or reserved by an in-flight refund. A fully refunded
    /// payment has nothing left.
    pub fn refundable_amount(
        &self,
        aggregate: &SubscriptionAggregate,
        payment_id: Uuid,
    ) -> EngineResult<i64> {
        let payment = aggregate.payment(payment_id)?;
        match payment.status {
            PaymentStatus::Paid | PaymentStatus::Refunded => {}
            status => return Err(EngineError::InvalidPaymentState { payment_id, status }),
        }
        Ok((payment.amount_cents - aggregate.reserved_refund_total(payment_id)).max(0))
    }

    /// Validates and reserves a refund as `Pending`. The reservation counts against the
    /// refundable amount until `settle_refund` resolves it.
    pub fn reserve_refund(
        &self,
        aggregate: &mut SubscriptionAggregate,
        payment_id: Uuid,
        amount_cents: i64,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<Uuid> {
        if amount_cents <= 0 {
            return Err(EngineError::Validation(format!(
                "refund amount must be positive, got {amount_cents}"
            )));
        }
        let refundable = self.refundable_amount(aggregate, payment_id)?;
        if amount_cents > refundable {
            return Err(EngineError::RefundExceedsPayment {
                requested: amount_cents,
                refundable,
            });
        }

        let refund = PaymentRefund {
            id: Uuid::new_v4(),
            payment_id,
            amount_cents,
            reason,
            status: RefundStatus::Pending,
            provider_refund_id: None,
            created_at: now,
        };
        let id = refund.id;
        aggregate.refunds.push(refund);
        aggregate.touch(now);

        tracing::info!(
            subscription = %aggregate.id(),
            payment = %payment_id,
            refund = %id,
            amount_cents,
            "refund reserved"
        );
        Ok(id)
    }

    /// Resolves a reserved refund. `Some(reference)` settles it and marks the payment
    /// `Refunded` once the settled refunds cover it; `None` releases the reservation.
    pub fn settle_refund(
        &self,
        aggregate: &mut SubscriptionAggregate,
        refund_id: Uuid,
        provider_refund_id: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<RefundStatus> {
        let refund = aggregate.refund_mut(refund_id)?;
        if refund.status != RefundStatus::Pending {
            return Ok(refund.status);
        }
        let payment_id = refund.payment_id;
        let status = match provider_refund_id {
            Some(reference) => {
                refund.provider_refund_id = Some(reference);
                RefundStatus::Succeeded
            }
            None => RefundStatus::Failed,
        };
        refund.status = status;

        if status == RefundStatus::Succeeded {
            let settled = aggregate.settled_refund_total(payment_id);
            let payment = aggregate.payment_mut(payment_id)?;
            if settled >= payment.amount_cents {
                payment.status = PaymentStatus::Refunded;
            }
            payment.updated_at = now;
        }
        aggregate.touch(now);

        tracing::info!(
            subscription = %aggregate.id(),
            payment = %payment_id,
            refund = %refund_id,
            status = status.as_str(),
            "refund settled"
        );
        Ok(status)
    }

    /// Pending payments whose attempt started before `now - timeout`.
    pub fn stale_pending(
        &self,
        aggregate: &SubscriptionAggregate,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Vec<Uuid> {
        aggregate
            .payments
            .iter()
            .filter(|payment| {
                payment.status == PaymentStatus::Pending && payment.last_attempt_at + timeout <= now
            })
            .map(|payment| payment.id)
            .collect()
    }

    /// The earliest failed payment whose retry is due.
    pub fn due_retry(&self, aggregate: &SubscriptionAggregate, now: DateTime<Utc>) -> Option<Uuid> {
        aggregate
            .payments
            .iter()
            .filter(|payment| {
                payment.status == PaymentStatus::Failed
                    && payment.next_retry_at.map_or(false, |at| at <= now)
            })
            .min_by_key(|payment| payment.next_retry_at)
            .map(|payment| payment.id)
    }
}
