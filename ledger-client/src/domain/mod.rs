pub mod credit_account;
pub mod remote_record;

pub use credit_account::{clamp_credit, ConsumptionLog, CreditAccount, Deduction, LogTimestamp};
pub use remote_record::{RemotePatch, RemoteRecord};
