use ledger_client::domain::clamp_credit;
use ledger_client::{RemotePatch, RemoteRecord};

use crate::{
    remote::RemoteLedger,
    store::{CacheError, SharedCache},
};

/// Result of one reconciliation tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The remote fetch failed; nothing was written.
    RemoteUnavailable,
    /// The corrected account could not be persisted locally; engine state and
    /// the remote ledger were left untouched.
    CacheWriteFailed,
    Committed(Reconciliation),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    pub local: f64,
    pub remote: f64,
    pub baseline: f64,
    pub consumed: f64,
    pub corrected: f64,
    pub credit_pushed: bool,
    pub log_pushed: bool,
}

/// Corrects a diverged remote credit for consumption recorded locally since
/// `baseline`.
///
/// Returns `(corrected, consumed)`:
/// - equal values need no correction;
/// - local at or below the baseline means only consumption happened locally,
///   so that consumption is subtracted from the remote value (which may carry
///   a top-up on top);
/// - otherwise the remote value is taken as is.
///
/// The corrected credit is floored at zero.
pub fn corrected_credit(remote: f64, local: f64, baseline: f64) -> (f64, f64) {
    if remote == local {
        return (clamp_credit(remote), 0.0);
    }
    if baseline >= local {
        let consumed = baseline - local;
        (clamp_credit(remote - consumed), consumed)
    } else {
        (clamp_credit(remote), 0.0)
    }
}

/// Keeps the local cache and the remote ledger converged.
///
/// Local consumption is told apart from remote top-ups by comparing the
/// local credit against `snapshot`, the local value the remote is known to
/// agree with. The snapshot lives only in memory and is seeded by the first
/// successful local read after start, whether or not the remote answers.
pub struct ReconciliationEngine<L> {
    ledger: L,
    cache: SharedCache,
    /// Credit last agreed with the remote (the corrected value written by the
    /// last committed tick), not the raw local read.
    snapshot: Option<f64>,
    /// Remote credit at the time of a credit push that was not acknowledged.
    unconfirmed: Option<f64>,
}

impl<L: RemoteLedger> ReconciliationEngine<L> {
    pub fn new(ledger: L, cache: SharedCache) -> Self {
        Self {
            ledger,
            cache,
            snapshot: None,
            unconfirmed: None,
        }
    }

    pub fn snapshot(&self) -> Option<f64> {
        self.snapshot
    }

    /// Seeds the snapshot from the local cache if no read has done so yet.
    ///
    /// Consumption recorded after this point is subtracted from the remote
    /// on the first successful fetch, even if the remote was down since start.
    pub async fn prime(&mut self) -> Result<(), CacheError> {
        if self.snapshot.is_none() {
            let local = self.cache.lock().await.load().await?.current_credit;
            tracing::debug!(local, "reconciliation snapshot seeded");
            self.snapshot = Some(local);
        }
        Ok(())
    }

    /// Baseline for this tick. After an unacknowledged push the remote
    /// either shows the value we sent (it landed) or still reflects the
    /// pre-push value, which then still contains the consumption.
    fn baseline(&self, remote: f64, local: f64) -> f64 {
        let snapshot = self.snapshot.unwrap_or(local);
        match self.unconfirmed {
            Some(before) if remote != snapshot => before,
            _ => snapshot,
        }
    }

    /// Runs one reconciliation tick.
    ///
    /// Only an unrecoverable local cache is returned as an error, including
    /// when the remote is down and the snapshot still has to be seeded.
    pub async fn tick(&mut self) -> Result<ReconcileOutcome, CacheError> {
        metrics::counter!("reconcile_ticks_total").increment(1);

        let remote = match self.ledger.fetch().await {
            Ok(remote) => remote,
            Err(e) => {
                metrics::counter!("reconcile_remote_unavailable_total").increment(1);
                tracing::warn!(error = %e, "remote ledger unavailable, skipping reconciliation");
                self.prime().await?;
                return Ok(ReconcileOutcome::RemoteUnavailable);
            }
        };

        let (local, baseline, consumed, corrected, log) = {
            let store = self.cache.lock().await;
            let mut account = store.load().await?;
            let local = account.current_credit;
            let baseline = self.baseline(remote.current_credit, local);
            let (corrected, consumed) = corrected_credit(remote.current_credit, local, baseline);

            account.set_credit(corrected);
            refresh_tariff(&mut account, &remote);

            if let Err(e) = store.write(&account).await {
                metrics::counter!("cache_write_failures_total").increment(1);
                tracing::error!(error = %e, "failed to persist reconciled account");
                return Ok(ReconcileOutcome::CacheWriteFailed);
            }

            if account.has_credit() && account.below_critical_level() {
                tracing::warn!(
                    credit = account.current_credit,
                    critical = account.credit_critical_level,
                    "credit below critical level"
                );
            }
            (local, baseline, consumed, corrected, account.power_consumption)
        };

        metrics::gauge!("current_credit").set(corrected);
        if corrected != local {
            metrics::counter!("reconcile_corrections_total").increment(1);
            tracing::info!(local, remote = remote.current_credit, consumed, corrected, "local credit corrected");
        }

        let credit_pushed = self.push(RemotePatch::credit(corrected), "credit").await;
        let log_pushed = self.push(RemotePatch::consumption(log), "consumption log").await;

        self.snapshot = Some(corrected);
        self.unconfirmed = if credit_pushed || remote.current_credit == corrected {
            None
        } else {
            Some(remote.current_credit)
        };

        let outcome = Reconciliation {
            local,
            remote: remote.current_credit,
            baseline,
            consumed,
            corrected,
            credit_pushed,
            log_pushed,
        };
        tracing::debug!(?outcome, "reconciliation committed");
        Ok(ReconcileOutcome::Committed(outcome))
    }

    async fn push(&self, patch: RemotePatch, what: &'static str) -> bool {
        match self.ledger.update(&patch).await {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("ledger_update_failures_total").increment(1);
                tracing::warn!(error = %e, field = what, "ledger update failed, will retry next tick");
                false
            }
        }
    }
}

fn refresh_tariff(account: &mut ledger_client::CreditAccount, remote: &RemoteRecord) {
    if let Some(price) = remote.electricity_price.filter(|p| p.is_finite() && *p >= 0.0) {
        account.electricity_price = price;
    }
    if let Some(level) = remote.credit_critical_level.filter(|l| l.is_finite()) {
        account.credit_critical_level = level;
    }
}
