use std::sync::Arc;

use anyhow::Result;
use credit_gateway::{
    actuator::{ActuatorController, LogRelay, Relay, SysfsGpioRelay},
    config::{ActuatorKind, AppConfig, MeterKind},
    metering::PzemMeter,
    metrics_server, observability,
    scheduler::{MeteringLoop, MeteringSettings, Scheduler},
    LocalCacheStore, ReconciliationEngine,
};
use ledger_client::RtdbClient;
use time::UtcOffset;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    // The local offset can only be queried soundly while the process is
    // still single-threaded, i.e. before the runtime starts.
    let utc_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(utc_offset))
}

async fn run(utc_offset: UtcOffset) -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;
    let shutdown = CancellationToken::new();

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr, shutdown.clone())?;
    }

    let relay: Box<dyn Relay> = match cfg.actuator.kind {
        ActuatorKind::SysfsGpio => {
            let path = cfg
                .actuator
                .value_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("actuator.value_path is required for sysfs_gpio"))?;
            Box::new(SysfsGpioRelay::new(path, cfg.actuator.active_low))
        }
        ActuatorKind::Log => Box::new(LogRelay),
    };
    let actuator = Arc::new(ActuatorController::new(relay));

    // The account is provisioned out of band; refuse to run without it rather
    // than inventing an empty one.
    let store = LocalCacheStore::new(&cfg.cache.path, &cfg.cache.backup_path, &cfg.room_id);
    let account = match store.load().await {
        Ok(account) => account,
        Err(e) => {
            actuator.fail_safe().await;
            return Err(e.into());
        }
    };
    tracing::info!(
        room = %cfg.room_id,
        credit = account.current_credit,
        price = account.electricity_price,
        %utc_offset,
        "local account loaded"
    );
    actuator.apply(account.current_credit).await;
    let cache = store.into_shared();

    let ledger = RtdbClient::new(
        &cfg.ledger.database_url,
        &cfg.room_id,
        cfg.ledger.auth_token.clone(),
        cfg.ledger_timeout(),
    )?;

    let meter = match cfg.meter.kind {
        MeterKind::ModbusRtu => PzemMeter::new(&cfg.meter.device_path, cfg.meter.slave_address, cfg.meter_timeout()),
    };

    let scheduler = Scheduler {
        metering: MeteringLoop::new(
            meter,
            cache.clone(),
            actuator.clone(),
            MeteringSettings {
                tariff: cfg.tariff(),
                period: cfg.metering_period(),
                read_timeout: cfg.meter_timeout(),
                utc_offset,
            },
        ),
        reconciliation: ReconciliationEngine::new(ledger, cache),
        actuator,
        metering_period: cfg.metering_period(),
        reconcile_period: cfg.reconcile_period(),
    };

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    scheduler.run(shutdown).await?;
    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("interrupt received, shutting down"),
        _ = terminate => tracing::info!("terminate received, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
