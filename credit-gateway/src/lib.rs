pub mod actuator;
pub mod billing;
pub mod config;
pub mod metering;
pub mod metrics_server;
pub mod observability;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use reconcile::{ReconcileOutcome, ReconciliationEngine};
pub use scheduler::{MeteringLoop, Scheduler, SchedulerError};
pub use store::{CacheError, LocalCacheStore, SharedCache};
