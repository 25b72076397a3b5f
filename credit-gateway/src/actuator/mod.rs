use std::path::PathBuf;

/// Relay position gating the power path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Enabled,
    Disabled,
}

impl RelayState {
    /// Level-triggered policy: power flows only while credit is strictly positive.
    pub fn for_credit(credit: f64) -> Self {
        if credit > 0.0 {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ActuatorError {
    #[error("failed to drive relay via {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single binary output line.
#[async_trait::async_trait]
pub trait Relay: Send + Sync {
    async fn set(&self, enabled: bool) -> Result<(), ActuatorError>;
}

/// Relay wired to a GPIO exported through sysfs (`/sys/class/gpio/gpioN/value`).
pub struct SysfsGpioRelay {
    value_path: PathBuf,
    active_low: bool,
}

impl SysfsGpioRelay {
    pub fn new(value_path: impl Into<PathBuf>, active_low: bool) -> Self {
        Self {
            value_path: value_path.into(),
            active_low,
        }
    }
}

#[async_trait::async_trait]
impl Relay for SysfsGpioRelay {
    async fn set(&self, enabled: bool) -> Result<(), ActuatorError> {
        let level = if enabled != self.active_low { b"1" } else { b"0" };
        tokio::fs::write(&self.value_path, level)
            .await
            .map_err(|source| ActuatorError::Io {
                path: self.value_path.clone(),
                source,
            })
    }
}

/// Relay stand-in for bench setups without hardware.
#[derive(Default)]
pub struct LogRelay;

#[async_trait::async_trait]
impl Relay for LogRelay {
    async fn set(&self, enabled: bool) -> Result<(), ActuatorError> {
        tracing::debug!(enabled, "relay set");
        Ok(())
    }
}

/// Drives the relay from the current credit sign.
///
/// Stateless: every call re-derives the output from the credit it is given.
pub struct ActuatorController {
    relay: Box<dyn Relay>,
}

impl ActuatorController {
    pub fn new(relay: Box<dyn Relay>) -> Self {
        Self { relay }
    }

    /// Sets the relay for `credit` and returns the commanded state. A failed
    /// write is logged; the next tick tries again.
    pub async fn apply(&self, credit: f64) -> RelayState {
        let state = RelayState::for_credit(credit);
        self.drive(state).await;
        state
    }

    /// Opens the relay regardless of credit.
    pub async fn fail_safe(&self) {
        tracing::warn!("relay forced off");
        self.drive(RelayState::Disabled).await;
    }

    async fn drive(&self, state: RelayState) {
        let enabled = state.is_enabled();
        metrics::gauge!("relay_enabled").set(if enabled { 1.0 } else { 0.0 });
        if let Err(e) = self.relay.set(enabled).await {
            metrics::counter!("relay_write_failures_total").increment(1);
            tracing::error!(error = %e, enabled, "relay write failed");
        }
    }
}
