use ledger_client::{LedgerError, RemotePatch, RemoteRecord, RtdbClient};

/// Access to the authoritative account record.
///
/// Implementations must bound both calls with a timeout. A fetch error is
/// "no information this tick", never a zero or empty record.
#[async_trait::async_trait]
pub trait RemoteLedger: Send + Sync {
    async fn fetch(&self) -> Result<RemoteRecord, LedgerError>;

    async fn update(&self, patch: &RemotePatch) -> Result<(), LedgerError>;
}

#[async_trait::async_trait]
impl RemoteLedger for RtdbClient {
    async fn fetch(&self) -> Result<RemoteRecord, LedgerError> {
        RtdbClient::fetch(self).await
    }

    async fn update(&self, patch: &RemotePatch) -> Result<(), LedgerError> {
        RtdbClient::update(self, patch).await
    }
}
