pub mod domain;
pub mod ledger;

pub use domain::{CreditAccount, ConsumptionLog, LogTimestamp, RemotePatch, RemoteRecord};
pub use ledger::{LedgerError, RtdbClient};
