use anyhow::Result;
use credit_gateway::{config::AppConfig, observability, LocalCacheStore};

/// Reinstates the primary cache file from its backup.
///
/// Meant to be run by an operator with the gateway stopped.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let store = LocalCacheStore::new(&cfg.cache.path, &cfg.cache.backup_path, &cfg.room_id);

    if let Ok(current) = store.read().await {
        tracing::warn!(
            credit = current.current_credit,
            "primary cache is readable; it will be replaced by the backup"
        );
    }

    let account = store.restore().await?;
    tracing::info!(
        room = %cfg.room_id,
        credit = account.current_credit,
        entries = account.power_consumption.len(),
        "cache restored from backup"
    );
    println!("{}", account.current_credit);
    Ok(())
}
