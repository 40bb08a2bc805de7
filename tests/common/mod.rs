#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use subscription_engine::billing::{
    BillingCycleScheduler, BillingService, ChargeOutcome, ChargeRequest, MasterBillingCycle,
    NewSubscription, PaymentProvider, PlanPrivilegeDefinition, PlanSnapshot, Privilege,
    PrivilegeType, RefundOutcome, SubscriptionPlan, SubscriptionPlanPrivilege,
};
use subscription_engine::clock::ManualClock;
use subscription_engine::config::EngineConfig;
use subscription_engine::db::MemoryStore;
use subscription_engine::error::EngineResult;

pub const CONSULTATIONS: &str = "consultations";
pub const PRIORITY_SUPPORT: &str = "priority_support";

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
}

/// Monthly plan granting 3 consultations per month and a priority-support flag.
pub fn plan(price_cents: i64, trial_days: i32) -> PlanSnapshot {
    let cycle = MasterBillingCycle::monthly();
    let plan_id = Uuid::new_v4();
    let quota = Privilege {
        id: Uuid::new_v4(),
        name: CONSULTATIONS.to_string(),
        description: Some("Consultations per month".to_string()),
        privilege_type: PrivilegeType::Quota,
    };
    let feature = Privilege {
        id: Uuid::new_v4(),
        name: PRIORITY_SUPPORT.to_string(),
        description: None,
        privilege_type: PrivilegeType::Feature,
    };
    let binding = |privilege: &Privilege, value: i64| SubscriptionPlanPrivilege {
        id: Uuid::new_v4(),
        plan_id,
        privilege_id: privilege.id,
        value,
        usage_period_id: cycle.id,
        effective_date: epoch() - chrono::Duration::days(365),
        expiration_date: None,
    };

    PlanSnapshot {
        plan: SubscriptionPlan {
            id: plan_id,
            name: "Care Plus".to_string(),
            description: None,
            price_cents,
            currency: "usd".to_string(),
            trial_duration_in_days: trial_days,
            billing_cycle_id: cycle.id,
            features: vec!["consultations".to_string()],
            is_active: true,
            is_marketing_visible: true,
            version: 1,
            created_at: epoch(),
        },
        billing_cycle: cycle.clone(),
        privileges: vec![
            PlanPrivilegeDefinition {
                binding: binding(&quota, 3),
                privilege: quota.clone(),
                usage_cycle: cycle.clone(),
            },
            PlanPrivilegeDefinition {
                binding: binding(&feature, 1),
                privilege: feature.clone(),
                usage_cycle: cycle.clone(),
            },
        ],
    }
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(ChargeOutcome),
    Fail(String),
    Stall(std::time::Duration),
}

/// Provider that replays scripted charge responses and succeeds once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    refunds: Mutex<VecDeque<RefundOutcome>>,
    refund_delay: Mutex<Option<std::time::Duration>>,
    pub charges: Mutex<Vec<ChargeRequest>>,
    pub refund_calls: Mutex<Vec<(String, i64)>>,
}

impl ScriptedProvider {
    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn decline(&self, reason: &str) {
        self.push(Scripted::Respond(ChargeOutcome::Declined {
            reason: reason.to_string(),
            reference: None,
        }));
    }

    pub fn push_refund(&self, outcome: RefundOutcome) {
        self.refunds.lock().unwrap().push_back(outcome);
    }

    /// Holds every refund call open for `delay` before answering.
    pub fn slow_refunds(&self, delay: std::time::Duration) {
        *self.refund_delay.lock().unwrap() = Some(delay);
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    async fn charge(&self, request: &ChargeRequest) -> EngineResult<ChargeOutcome> {
        self.charges.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Scripted::Respond(outcome)) => Ok(outcome),
            Some(Scripted::Fail(message)) => Err(
                subscription_engine::error::EngineError::PaymentFailed(message),
            ),
            Some(Scripted::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(ChargeOutcome::Succeeded {
                    reference: format!("pi_late_{}", request.payment_id.simple()),
                })
            }
            None => Ok(ChargeOutcome::Succeeded {
                reference: format!("pi_{}", request.idempotency_key),
            }),
        }
    }

    async fn refund(&self, payment_reference: &str, amount_cents: i64) -> EngineResult<RefundOutcome> {
        self.refund_calls
            .lock()
            .unwrap()
            .push((payment_reference.to_string(), amount_cents));
        let delay = *self.refund_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.refunds.lock().unwrap().pop_front();
        Ok(outcome.unwrap_or_else(|| RefundOutcome::Succeeded {
            reference: format!("re_{}", Uuid::new_v4().simple()),
        }))
    }
}

pub struct Harness {
    pub service: BillingService,
    pub scheduler: BillingCycleScheduler,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub clock: ManualClock,
    pub plan: PlanSnapshot,
}

impl Harness {
    pub fn new(plan: PlanSnapshot) -> Self {
        Self::with_config(plan, EngineConfig::default())
    }

    pub fn with_config(plan: PlanSnapshot, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new().with_plan(plan.clone()));
        let provider = Arc::new(ScriptedProvider::default());
        let clock = ManualClock::new(epoch());
        let service = BillingService::new(
            store.clone(),
            provider.clone(),
            Arc::new(clock.clone()),
            config,
        );
        Self {
            scheduler: BillingCycleScheduler::new(service.clone()),
            service,
            store,
            provider,
            clock,
            plan,
        }
    }

    pub async fn subscribe(&self) -> Uuid {
        self.service
            .create_subscription(NewSubscription {
                user_id: Uuid::new_v4(),
                plan_id: self.plan.plan.id,
                provider_customer_id: Some("cus_test".to_string()),
                skip_trial: false,
            })
            .await
            .unwrap()
            .id()
    }

    pub fn now(&self) -> DateTime<Utc> {
        use subscription_engine::clock::Clock;
        self.clock.now()
    }
}
