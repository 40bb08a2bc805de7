use std::fmt;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// key: subscription-status -> closed lifecycle states
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Paused,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 7] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Paused,
        SubscriptionStatus::Suspended,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Parses persisted values, including the legacy spellings and integer codes
    /// older rows were written with.
    pub fn parse(value: &str) -> EngineResult<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let status = match normalized.as_str() {
            "trial" | "trialing" | "0" => SubscriptionStatus::Trial,
            "active" | "1" => SubscriptionStatus::Active,
            "past_due" | "pastdue" | "2" => SubscriptionStatus::PastDue,
            "paused" | "3" => SubscriptionStatus::Paused,
            "suspended" | "4" => SubscriptionStatus::Suspended,
            "cancelled" | "canceled" | "5" => SubscriptionStatus::Cancelled,
            "expired" | "6" => SubscriptionStatus::Expired,
            _ => return Err(EngineError::InvalidStatus(value.to_string())),
        };
        Ok(status)
    }

    /// Statuses in which privileges may be consumed.
    pub fn grants_entitlements(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }

    /// Statuses the scheduler charges for.
    pub fn is_billable(&self) -> bool {
        self.grants_entitlements()
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> EngineResult<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let status = match normalized.as_str() {
            "pending" | "0" => PaymentStatus::Pending,
            "paid" | "succeeded" | "1" => PaymentStatus::Paid,
            "failed" | "2" => PaymentStatus::Failed,
            "refunded" | "3" => PaymentStatus::Refunded,
            _ => return Err(EngineError::InvalidStatus(value.to_string())),
        };
        Ok(status)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeType {
    /// Metered counter consumed against an allowance.
    Quota,
    /// On/off capability; granted when the plan value is positive.
    Feature,
}

impl PrivilegeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegeType::Quota => "quota",
            PrivilegeType::Feature => "feature",
        }
    }

    pub fn parse(value: &str) -> EngineResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "quota" | "counter" | "0" => Ok(PrivilegeType::Quota),
            "feature" | "flag" | "1" => Ok(PrivilegeType::Feature),
            _ => Err(EngineError::InvalidStatus(value.to_string())),
        }
    }
}

/// Who caused a status change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Actor {
    User(Uuid),
    Admin(String),
    Scheduler,
    Provider,
}

impl Actor {
    pub fn parse(value: &str) -> Self {
        if let Some(id) = value.strip_prefix("user:") {
            if let Ok(id) = Uuid::parse_str(id) {
                return Actor::User(id);
            }
        }
        if let Some(name) = value.strip_prefix("admin:") {
            return Actor::Admin(name.to_string());
        }
        match value {
            "provider" => Actor::Provider,
            _ => Actor::Scheduler,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::Admin(name) => write!(f, "admin:{name}"),
            Actor::Scheduler => f.write_str("scheduler"),
            Actor::Provider => f.write_str("provider"),
        }
    }
}

/// key: billing-cycle-model -> MasterBillingCycles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasterBillingCycle {
    pub id: Uuid,
    pub name: String,
    pub duration_days: i32,
    pub duration_months: i32,
    pub provider_interval: String,
    pub provider_interval_count: i32,
}

impl MasterBillingCycle {
    pub fn monthly() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "Monthly".to_string(),
            duration_days: 0,
            duration_months: 1,
            provider_interval: "month".to_string(),
            provider_interval_count: 1,
        }
    }

    pub fn days(days: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: format!("Every {days} days"),
            duration_days: days,
            duration_months: 0,
            provider_interval: "day".to_string(),
            provider_interval_count: days,
        }
    }

    /// Moves `from` forward by one cycle: calendar months first, then days.
    pub fn advance(&self, from: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
        if self.duration_days < 0
            || self.duration_months < 0
            || (self.duration_days == 0 && self.duration_months == 0)
        {
            return Err(EngineError::Validation(format!(
                "billing cycle `{}` has no duration",
                self.name
            )));
        }
        from.checked_add_months(Months::new(self.duration_months as u32))
            .and_then(|date| date.checked_add_signed(Duration::days(self.duration_days as i64)))
            .ok_or_else(|| {
                EngineError::Validation(format!("billing cycle `{}` overflows", self.name))
            })
    }
}

/// key: plan-model -> SubscriptionPlans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: String,
    pub trial_duration_in_days: i32,
    pub billing_cycle_id: Uuid,
    pub features: Vec<String>,
    pub is_active: bool,
    pub is_marketing_visible: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

/// key: privilege-model -> Privileges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Privilege {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub privilege_type: PrivilegeType,
}

/// key: plan-privilege-model -> SubscriptionPlanPrivileges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlanPrivilege {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub privilege_id: Uuid,
    pub value: i64,
    pub usage_period_id: Uuid,
    pub effective_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl SubscriptionPlanPrivilege {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.effective_date <= now && self.expiration_date.map_or(true, |end| now < end)
    }
}

/// key: subscription-model -> Subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle_id: Uuid,
    pub status: SubscriptionStatus,
    pub status_reason: Option<String>,
    pub current_price_cents: i64,
    pub currency: String,
    pub start_date: DateTime<Utc>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub last_billing_date: Option<DateTime<Utc>>,
    pub trial_start_date: Option<DateTime<Utc>>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub failed_payment_attempts: i32,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub last_payment_error: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_date: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub provider_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// key: usage-model -> UserSubscriptionPrivilegeUsages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSubscriptionPrivilegeUsage {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub plan_privilege_id: Uuid,
    pub privilege_id: Uuid,
    pub used_value: i64,
    pub allowed_value: i64,
    pub usage_period_start: DateTime<Utc>,
    pub usage_period_end: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserSubscriptionPrivilegeUsage {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.usage_period_start <= now && now < self.usage_period_end
    }

    pub fn remaining(&self) -> i64 {
        (self.allowed_value - self.used_value).max(0)
    }
}

/// key: status-history-model -> SubscriptionStatusHistories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatusHistory {
    pub id: Uuid,
    pub subscription_id: Uuid,
    /// `None` only for the row written when the subscription is created.
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: SubscriptionStatus,
    pub reason: Option<String>,
    pub actor: Actor,
    pub changed_at: DateTime<Utc>,
}

/// key: payment-model -> SubscriptionPayments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPayment {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: DateTime<Utc>,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub provider_payment_intent_id: Option<String>,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A refund is reserved as `Pending` before the provider is asked, then settled.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Succeeded => "succeeded",
            RefundStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> EngineResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RefundStatus::Pending),
            "succeeded" => Ok(RefundStatus::Succeeded),
            "failed" => Ok(RefundStatus::Failed),
            _ => Err(EngineError::InvalidStatus(value.to_string())),
        }
    }

    /// Pending and succeeded refunds both hold part of the payment.
    pub fn holds_amount(&self) -> bool {
        !matches!(self, RefundStatus::Failed)
    }
}

/// key: refund-model -> PaymentRefunds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRefund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub provider_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Plan privilege joined with its privilege and reset cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPrivilegeDefinition {
    pub binding: SubscriptionPlanPrivilege,
    pub privilege: Privilege,
    pub usage_cycle: MasterBillingCycle,
}

/// key: plan-snapshot -> catalog view used by one aggregate operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan: SubscriptionPlan,
    pub billing_cycle: MasterBillingCycle,
    pub privileges: Vec<PlanPrivilegeDefinition>,
}

impl PlanSnapshot {
    pub fn privilege(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<&PlanPrivilegeDefinition> {
        self.privileges
            .iter()
            .find(|definition| {
                definition.privilege.name == name && definition.binding.is_effective(now)
            })
            .ok_or_else(|| EngineError::PrivilegeNotFound(name.to_string()))
    }

    pub fn by_binding(&self, plan_privilege_id: Uuid) -> Option<&PlanPrivilegeDefinition> {
        self.privileges
            .iter()
            .find(|definition| definition.binding.id == plan_privilege_id)
    }
}

/// key: status-snapshot -> GetStatus contract
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub subscription_id: Uuid,
    pub status: SubscriptionStatus,
    pub status_reason: Option<String>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub failed_payment_attempts: i32,
}
