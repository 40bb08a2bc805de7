use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

use super::models::{
    PaymentRefund, RefundStatus, Subscription, SubscriptionPayment, SubscriptionStatusHistory,
    UserSubscriptionPrivilegeUsage,
};

/// key: subscription-aggregate -> consistency boundary
///
/// Everything that must change together with a subscription. Stores load and commit the
/// aggregate as a unit; `version` is the optimistic-concurrency token the commit checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionAggregate {
    pub subscription: Subscription,
    pub usages: Vec<UserSubscriptionPrivilegeUsage>,
    pub payments: Vec<SubscriptionPayment>,
    pub refunds: Vec<PaymentRefund>,
    pub history: Vec<SubscriptionStatusHistory>,
    pub version: i64,
}

impl SubscriptionAggregate {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            usages: Vec::new(),
            payments: Vec::new(),
            refunds: Vec::new(),
            history: Vec::new(),
            version: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.subscription.id
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.subscription.updated_at = now;
    }

    pub fn payment(&self, payment_id: Uuid) -> EngineResult<&SubscriptionPayment> {
        self.payments
            .iter()
            .find(|payment| payment.id == payment_id)
            .ok_or_else(|| EngineError::PaymentNotFound(payment_id.to_string()))
    }

    pub fn payment_mut(&mut self, payment_id: Uuid) -> EngineResult<&mut SubscriptionPayment> {
        self.payments
            .iter_mut()
            .find(|payment| payment.id == payment_id)
            .ok_or_else(|| EngineError::PaymentNotFound(payment_id.to_string()))
    }

    pub fn payment_by_reference(&self, reference: &str) -> Option<&SubscriptionPayment> {
        self.payments
            .iter()
            .find(|payment| payment.provider_payment_intent_id.as_deref() == Some(reference))
    }

    /// Sum of refunds still holding part of the payment: settled plus in flight.
    pub fn reserved_refund_total(&self, payment_id: Uuid) -> i64 {
        self.refunds
            .iter()
            .filter(|refund| refund.payment_id == payment_id && refund.status.holds_amount())
            .map(|refund| refund.amount_cents)
            .sum()
    }

    pub fn settled_refund_total(&self, payment_id: Uuid) -> i64 {
        self.refunds
            .iter()
            .filter(|refund| {
                refund.payment_id == payment_id && refund.status == RefundStatus::Succeeded
            })
            .map(|refund| refund.amount_cents)
            .sum()
    }

    pub fn refund_mut(&mut self, refund_id: Uuid) -> EngineResult<&mut PaymentRefund> {
        self.refunds
            .iter_mut()
            .find(|refund| refund.id == refund_id)
            .ok_or_else(|| EngineError::Validation(format!("refund {refund_id} not found")))
    }

    /// Most recent usage row per plan privilege.
    pub fn latest_usage(&self, plan_privilege_id: Uuid) -> Option<&UserSubscriptionPrivilegeUsage> {
        self.usages
            .iter()
            .filter(|usage| usage.plan_privilege_id == plan_privilege_id)
            .max_by_key(|usage| usage.usage_period_start)
    }

    pub fn current_usage_index(&self, plan_privilege_id: Uuid, now: DateTime<Utc>) -> Option<usize> {
        self.usages.iter().position(|usage| {
            usage.plan_privilege_id == plan_privilege_id
                && usage.reset_at.is_none()
                && usage.contains(now)
        })
    }
}
