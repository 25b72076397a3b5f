use std::{sync::Arc, time::Duration};

use ledger_client::domain::{Deduction, LogTimestamp};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    actuator::{ActuatorController, RelayState},
    billing::{self, Tariff},
    metering::PowerMeter,
    reconcile::{ReconcileOutcome, ReconciliationEngine},
    remote::RemoteLedger,
    store::{CacheError, SharedCache},
};

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("{task} loop lost local state: {source}")]
    StateLost {
        task: &'static str,
        #[source]
        source: CacheError,
    },
    #[error("{task} loop did not finish: {reason}")]
    Join { task: &'static str, reason: String },
}

/// A fixed-cadence loop body. Errors returned from `tick` are fatal.
#[async_trait::async_trait]
pub trait PeriodicTask: Send + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&mut self) -> Result<(), CacheError>;
}

/// Runs `task` every `period` until `shutdown` is cancelled.
///
/// Cancellation is only observed between ticks, so a tick that has started
/// always completes its critical section and commits its write.
pub async fn run_task<T: PeriodicTask>(
    mut task: T,
    period: Duration,
    shutdown: CancellationToken,
) -> Result<(), SchedulerError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        if let Err(source) = task.tick().await {
            tracing::error!(task = task.name(), error = %source, "fatal local state error, shutting down");
            shutdown.cancel();
            return Err(SchedulerError::StateLost {
                task: task.name(),
                source,
            });
        }
    }

    tracing::info!(task = task.name(), "loop stopped");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct MeteringSettings {
    pub tariff: Tariff,
    /// Nominal interval between samples; each good sample bills this long.
    pub period: Duration,
    /// Upper bound on one meter read.
    pub read_timeout: Duration,
    /// Offset applied to consumption log timestamps.
    pub utc_offset: UtcOffset,
}

/// What one metering tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeteringOutcome {
    pub power_w: Option<f64>,
    pub deduction: Option<Deduction>,
    pub relay: RelayState,
}

/// Samples the meter, charges the account and re-drives the relay.
pub struct MeteringLoop<M> {
    meter: M,
    cache: SharedCache,
    actuator: Arc<ActuatorController>,
    settings: MeteringSettings,
}

impl<M: PowerMeter> MeteringLoop<M> {
    pub fn new(meter: M, cache: SharedCache, actuator: Arc<ActuatorController>, settings: MeteringSettings) -> Self {
        Self {
            meter,
            cache,
            actuator,
            settings,
        }
    }

    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.settings.utc_offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }

    pub async fn tick_at(&mut self, now: PrimitiveDateTime) -> Result<MeteringOutcome, CacheError> {
        metrics::counter!("metering_ticks_total").increment(1);

        let power_w = tokio::time::timeout(self.settings.read_timeout, self.meter.read())
            .await
            .unwrap_or(None);
        match power_w {
            Some(p) => metrics::gauge!("last_power_watts").set(p),
            None => metrics::counter!("metering_device_faults_total").increment(1),
        }

        let (credit, deduction) = {
            let store = self.cache.lock().await;
            let mut account = store.load().await?;
            let deduction = power_w.and_then(|p| {
                billing::apply_sample(
                    &mut account,
                    p,
                    self.settings.period,
                    &self.settings.tariff,
                    LogTimestamp::new(now),
                )
            });

            match deduction {
                Some(d) => match store.write(&account).await {
                    Ok(()) => (d.credit_after, Some(d)),
                    Err(e) => {
                        metrics::counter!("cache_write_failures_total").increment(1);
                        tracing::error!(error = %e, "failed to persist deduction");
                        (d.credit_before, None)
                    }
                },
                None => (account.current_credit, None),
            }
        };

        if let Some(d) = &deduction {
            metrics::counter!("metering_deductions_total").increment(1);
            metrics::gauge!("current_credit").set(d.credit_after);
            tracing::debug!(
                consumption = d.consumption,
                charged = d.charged,
                credit = d.credit_after,
                "credit deducted"
            );
        }

        let relay = self.actuator.apply(credit).await;
        Ok(MeteringOutcome {
            power_w,
            deduction,
            relay,
        })
    }

    pub async fn tick_now(&mut self) -> Result<MeteringOutcome, CacheError> {
        let now = self.now();
        self.tick_at(now).await
    }
}

#[async_trait::async_trait]
impl<M: PowerMeter + 'static> PeriodicTask for MeteringLoop<M> {
    fn name(&self) -> &'static str {
        "metering"
    }

    async fn tick(&mut self) -> Result<(), CacheError> {
        self.tick_now().await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl<L: RemoteLedger + 'static> PeriodicTask for ReconciliationEngine<L> {
    fn name(&self) -> &'static str {
        "reconciliation"
    }

    async fn tick(&mut self) -> Result<(), CacheError> {
        if let ReconcileOutcome::Committed(r) = ReconciliationEngine::tick(self).await? {
            if !r.credit_pushed {
                tracing::debug!(corrected = r.corrected, "credit push pending");
            }
        }
        Ok(())
    }
}

/// Runs metering and reconciliation side by side over the shared cache.
pub struct Scheduler<M, L> {
    pub metering: MeteringLoop<M>,
    pub reconciliation: ReconciliationEngine<L>,
    pub actuator: Arc<ActuatorController>,
    pub metering_period: Duration,
    pub reconcile_period: Duration,
}

impl<M, L> Scheduler<M, L>
where
    M: PowerMeter + 'static,
    L: RemoteLedger + 'static,
{
    /// Runs both loops until `shutdown` is cancelled or either loop hits a
    /// fatal error. The relay is opened on every exit path.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        // Seed the snapshot before metering can deduct anything.
        if let Err(source) = self.reconciliation.prime().await {
            tracing::error!(error = %source, "fatal local state error before start, shutting down");
            shutdown.cancel();
            self.actuator.fail_safe().await;
            return Err(SchedulerError::StateLost {
                task: "reconciliation",
                source,
            });
        }

        let metering = tokio::spawn(run_task(self.metering, self.metering_period, shutdown.clone()));
        let reconciliation = tokio::spawn(run_task(
            self.reconciliation,
            self.reconcile_period,
            shutdown.clone(),
        ));

        let (metering, reconciliation) = tokio::join!(metering, reconciliation);
        shutdown.cancel();
        self.actuator.fail_safe().await;

        let metering = metering.map_err(|e| SchedulerError::Join {
            task: "metering",
            reason: e.to_string(),
        })?;
        let reconciliation = reconciliation.map_err(|e| SchedulerError::Join {
            task: "reconciliation",
            reason: e.to_string(),
        })?;
        metering?;
        reconciliation
    }
}
