pub mod audit;
pub mod billing;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod telemetry;

pub use billing::{
    BillingCycleScheduler, BillingService, EventDisposition, NewSubscription, PaymentProvider,
    ProviderEvent, StripeLikeAdapter, SubscriptionAggregate, SubscriptionStatus, TickReport,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use db::{MemoryStore, PgStore, SubscriptionStore};
pub use error::{EngineError, EngineResult};
