//! Subscription status transitions.
//!
//! | From      | To        | Operation |
//! |-----------|-----------|-----------|
//! | Trial     | Active    | activate, payment success |
//! | Trial     | PastDue   | payment failure |
//! | Trial     | Cancelled | cancel |
//! | Active    | Paused    | pause |
//! | Paused    | Active    | resume |
//! | Active    | PastDue   | payment failure |
//! | PastDue   | Active    | payment success |
//! | PastDue   | Suspended | payment failure past the limit, suspend |
//! | Active, Paused | Suspended | suspend |
//! | Suspended | Active    | payment success |
//! | Active, Paused, PastDue, Suspended | Cancelled | cancel |
//! | Cancelled, Suspended | Expired | mark expired |

use chrono::{DateTime, Utc};

use crate::audit::AuditTrail;
use crate::error::{EngineError, EngineResult};

use super::aggregate::SubscriptionAggregate;
use super::models::{Actor, SubscriptionStatus};

use SubscriptionStatus::*;

pub fn allowed_transitions(from: SubscriptionStatus) -> &'static [SubscriptionStatus] {
    match from {
        Trial => &[Active, PastDue, Cancelled],
        Active => &[Paused, PastDue, Suspended, Cancelled],
        Paused => &[Active, Suspended, Cancelled],
        PastDue => &[Active, Suspended, Cancelled],
        Suspended => &[Active, Cancelled, Expired],
        Cancelled => &[Expired],
        Expired => &[],
    }
}

pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// key: subscription-state-machine
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionStateMachine {
    max_failed_payments: i32,
}

impl SubscriptionStateMachine {
    pub fn new(max_failed_payments: i32) -> Self {
        Self {
            max_failed_payments: max_failed_payments.max(1),
        }
    }

    pub fn max_failed_payments(&self) -> i32 {
        self.max_failed_payments
    }

    /// Validates, applies and records one transition. Nothing is touched when the
    /// transition is not allowed.
    fn transition(
        &self,
        aggregate: &mut SubscriptionAggregate,
        to: SubscriptionStatus,
        reason: Option<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let from = aggregate.subscription.status;
        if !can_transition(from, to) {
            return Err(EngineError::InvalidStateTransition { from, to });
        }

        let subscription = &mut aggregate.subscription;
        match to {
            Paused => subscription.paused_at = Some(now),
            Active if from == Paused => {
                if let Some(paused_at) = subscription.paused_at.take() {
                    let paused_for = now - paused_at;
                    if let Some(next) = subscription.next_billing_date {
                        subscription.next_billing_date = Some(next + paused_for);
                    }
                }
                subscription.resumed_date = Some(now);
            }
            Active => subscription.suspended_at = None,
            Suspended => subscription.suspended_at = Some(now),
            Cancelled => subscription.cancelled_at = Some(now),
            Expired => subscription.expired_at = Some(now),
            Trial | PastDue => {}
        }
        subscription.status = to;
        subscription.status_reason = reason.clone();
        subscription.updated_at = now;

        AuditTrail::record(aggregate, Some(from), to, reason, actor, now);
        Ok(())
    }

    pub fn activate(
        &self,
        aggregate: &mut SubscriptionAggregate,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if aggregate.subscription.status != Trial {
            return Err(EngineError::InvalidStateTransition {
                from: aggregate.subscription.status,
                to: Active,
            });
        }
        self.transition(aggregate, Active, Some("activated".to_string()), actor, now)
    }

    pub fn pause(
        &self,
        aggregate: &mut SubscriptionAggregate,
        reason: Option<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(aggregate, Paused, reason, actor, now)
    }

    pub fn resume(
        &self,
        aggregate: &mut SubscriptionAggregate,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if aggregate.subscription.status != Paused {
            return Err(EngineError::InvalidStateTransition {
                from: aggregate.subscription.status,
                to: Active,
            });
        }
        self.transition(aggregate, Active, Some("resumed".to_string()), actor, now)
    }

    pub fn cancel(
        &self,
        aggregate: &mut SubscriptionAggregate,
        reason: Option<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(aggregate, Cancelled, reason, actor, now)?;
        aggregate.subscription.next_billing_date = None;
        stop_retries(aggregate);
        Ok(())
    }

    pub fn suspend(
        &self,
        aggregate: &mut SubscriptionAggregate,
        reason: Option<String>,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(aggregate, Suspended, reason, actor, now)?;
        stop_retries(aggregate);
        Ok(())
    }

    pub fn mark_expired(
        &self,
        aggregate: &mut SubscriptionAggregate,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(aggregate, Expired, Some("grace period elapsed".to_string()), actor, now)?;
        aggregate.subscription.next_billing_date = None;
        stop_retries(aggregate);
        Ok(())
    }

    /// Counts the failure and moves the subscription towards suspension. Returns the new
    /// status when a transition happened.
    pub fn record_payment_failure(
        &self,
        aggregate: &mut SubscriptionAggregate,
        error: &str,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<SubscriptionStatus>> {
        let subscription = &mut aggregate.subscription;
        subscription.failed_payment_attempts += 1;
        subscription.last_payment_error = Some(error.to_string());
        subscription.updated_at = now;
        let failures = subscription.failed_payment_attempts;

        let target = match subscription.status {
            Trial | Active if failures >= self.max_failed_payments => Some(Suspended),
            Trial | Active => Some(PastDue),
            PastDue if failures >= self.max_failed_payments => Some(Suspended),
            _ => None,
        };

        match target {
            Some(Suspended) => {
                // Trial/Active reach Suspended through PastDue so the history stays a
                // sequence of allowed steps.
                if subscription.status != PastDue {
                    self.transition(
                        aggregate,
                        PastDue,
                        Some(format!("payment failed: {error}")),
                        actor.clone(),
                        now,
                    )?;
                }
                self.suspend(
                    aggregate,
                    Some(format!(
                        "payment failed {failures} times; last error: {error}"
                    )),
                    actor,
                    now,
                )?;
                Ok(Some(Suspended))
            }
            Some(status) => {
                self.transition(
                    aggregate,
                    status,
                    Some(format!("payment failed: {error}")),
                    actor,
                    now,
                )?;
                Ok(Some(status))
            }
            None => {
                if subscription.status == PastDue {
                    subscription.status_reason = Some(format!(
                        "payment failed {failures} of {} attempts: {error}",
                        self.max_failed_payments
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Clears the failure counters and returns the subscription to `Active` where the
    /// transition table allows it.
    pub fn record_payment_success(
        &self,
        aggregate: &mut SubscriptionAggregate,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<SubscriptionStatus>> {
        let subscription = &mut aggregate.subscription;
        subscription.failed_payment_attempts = 0;
        subscription.last_payment_error = None;
        subscription.last_payment_date = Some(now);
        subscription.updated_at = now;

        match subscription.status {
            Trial | PastDue | Suspended => {
                let reason = match subscription.status {
                    Trial => "trial converted",
                    _ => "payment recovered",
                };
                self.transition(aggregate, Active, Some(reason.to_string()), actor, now)?;
                Ok(Some(Active))
            }
            _ => Ok(None),
        }
    }
}

fn stop_retries(aggregate: &mut SubscriptionAggregate) {
    for payment in aggregate.payments.iter_mut() {
        payment.next_retry_at = None;
    }
}
