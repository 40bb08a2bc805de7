pub mod adapters;
pub mod aggregate;
pub mod entitlements;
pub mod ledger;
pub mod models;
pub mod reconciliation;
pub mod scheduler;
pub mod service;
pub mod state_machine;
pub mod webhooks;

pub use adapters::{
    ChargeOutcome, ChargeRequest, PaymentProvider, RefundOutcome, StripeLikeAdapter,
};
pub use aggregate::SubscriptionAggregate;
pub use entitlements::PrivilegeEntitlementTracker;
pub use ledger::{OutcomeDisposition, PaymentLedger, PaymentOutcome};
pub use models::{
    Actor, BillingPeriod, MasterBillingCycle, PaymentRefund, PaymentStatus,
    PlanPrivilegeDefinition, PlanSnapshot, Privilege, PrivilegeType, RefundStatus, StatusSnapshot,
    Subscription, SubscriptionPayment, SubscriptionPlan, SubscriptionPlanPrivilege,
    SubscriptionStatus, SubscriptionStatusHistory, UserSubscriptionPrivilegeUsage,
};
pub use reconciliation::{start_reconciliation_worker, ReconciliationHandle, ReconciliationJob};
pub use scheduler::{billing_due, BillingCycleScheduler, TickReport};
pub use service::{BillingService, EventDisposition, NewSubscription};
pub use state_machine::{allowed_transitions, can_transition, SubscriptionStateMachine};
pub use webhooks::{sign_payload, verify_signature, ProviderEvent, ProviderEventKind};
