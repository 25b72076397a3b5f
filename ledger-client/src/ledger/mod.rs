pub mod rtdb;

pub use rtdb::RtdbClient;

/// Failures talking to the remote ledger.
///
/// None of these are fatal to the gateway: a failed fetch means "no
/// information this tick" and a failed update is simply retried by the
/// next reconciliation.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger rejected request with status {status}")]
    Rejected { status: u16 },
    #[error("malformed ledger record: {0}")]
    Malformed(String),
    #[error("invalid ledger configuration: {0}")]
    Config(String),
}

impl LedgerError {
    /// Whether retrying later has a realistic chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
