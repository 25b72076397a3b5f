//! In-memory stand-ins for the ledger, meter and relay.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use ledger_client::{domain::ConsumptionLog, LedgerError, RemotePatch, RemoteRecord};

use crate::{actuator::ActuatorError, actuator::Relay, metering::PowerMeter, remote::RemoteLedger};

#[derive(Debug)]
struct LedgerState {
    credit: f64,
    electricity_price: Option<f64>,
    credit_critical_level: Option<f64>,
    consumption: Option<ConsumptionLog>,
    fetch_available: bool,
    update_available: bool,
    fetches: usize,
    updates: Vec<RemotePatch>,
}

/// Remote ledger held in memory, with switches to simulate outages.
#[derive(Clone)]
pub struct FakeLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl FakeLedger {
    pub fn new(credit: f64, electricity_price: f64, credit_critical_level: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                credit,
                electricity_price: Some(electricity_price),
                credit_critical_level: Some(credit_critical_level),
                consumption: None,
                fetch_available: true,
                update_available: true,
                fetches: 0,
                updates: Vec::new(),
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut LedgerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    /// Operator top-up applied directly on the remote node.
    pub fn top_up(&self, amount: f64) {
        self.with(|s| s.credit += amount);
    }

    pub fn set_price(&self, price: f64) {
        self.with(|s| s.electricity_price = Some(price));
    }

    pub fn set_fetch_available(&self, available: bool) {
        self.with(|s| s.fetch_available = available);
    }

    pub fn set_update_available(&self, available: bool) {
        self.with(|s| s.update_available = available);
    }

    pub fn credit(&self) -> f64 {
        self.with(|s| s.credit)
    }

    pub fn consumption(&self) -> Option<ConsumptionLog> {
        self.with(|s| s.consumption.clone())
    }

    pub fn fetches(&self) -> usize {
        self.with(|s| s.fetches)
    }

    pub fn updates(&self) -> Vec<RemotePatch> {
        self.with(|s| s.updates.clone())
    }
}

#[async_trait::async_trait]
impl RemoteLedger for FakeLedger {
    async fn fetch(&self) -> Result<RemoteRecord, LedgerError> {
        self.with(|s| {
            s.fetches += 1;
            if !s.fetch_available {
                return Err(LedgerError::Unavailable("simulated outage".to_string()));
            }
            Ok(RemoteRecord {
                current_credit: s.credit,
                electricity_price: s.electricity_price,
                credit_critical_level: s.credit_critical_level,
            })
        })
    }

    async fn update(&self, patch: &RemotePatch) -> Result<(), LedgerError> {
        self.with(|s| {
            if !s.update_available {
                return Err(LedgerError::Unavailable("simulated outage".to_string()));
            }
            if let Some(credit) = patch.current_credit {
                s.credit = credit;
            }
            if let Some(log) = &patch.power_consumption {
                s.consumption = Some(log.clone());
            }
            s.updates.push(patch.clone());
            Ok(())
        })
    }
}

/// Meter replaying a fixed script of readings, then repeating `then`.
#[derive(Clone, Default)]
pub struct ScriptedMeter {
    readings: Arc<Mutex<VecDeque<Option<f64>>>>,
    then: Option<f64>,
}

impl ScriptedMeter {
    /// Reports a device fault once the script runs out.
    pub fn new(readings: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self {
            readings: Arc::new(Mutex::new(readings.into_iter().collect())),
            then: None,
        }
    }

    pub fn repeating(power_w: f64) -> Self {
        Self {
            then: Some(power_w),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl PowerMeter for ScriptedMeter {
    async fn read(&mut self) -> Option<f64> {
        match self.readings.lock().unwrap().pop_front() {
            Some(reading) => reading,
            None => self.then,
        }
    }
}

/// Relay that remembers every level it was driven to.
#[derive(Clone, Default)]
pub struct RecordingRelay {
    history: Arc<Mutex<Vec<bool>>>,
}

impl RecordingRelay {
    pub fn history(&self) -> Vec<bool> {
        self.history.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<bool> {
        self.history.lock().unwrap().last().copied()
    }
}

#[async_trait::async_trait]
impl Relay for RecordingRelay {
    async fn set(&self, enabled: bool) -> Result<(), ActuatorError> {
        self.history.lock().unwrap().push(enabled);
        Ok(())
    }
}
