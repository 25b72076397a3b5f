use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::billing::Tariff;

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub backup_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub database_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_ledger_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    /// PZEM-004T style meter on a Modbus RTU serial line.
    ModbusRtu,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    #[serde(default = "default_meter_kind")]
    pub kind: MeterKind,
    pub device_path: PathBuf,
    #[serde(default = "default_slave_address")]
    pub slave_address: u8,
    #[serde(default = "default_meter_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_metering_period_ms")]
    pub period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TariffConfig {
    /// Watt-seconds in one billed consumption unit (3 600 000 for kWh).
    #[serde(default = "default_watt_seconds_per_unit")]
    pub watt_seconds_per_unit: f64,
    /// Decimal places kept on each metered consumption amount.
    #[serde(default = "default_precision")]
    pub precision: u32,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            watt_seconds_per_unit: default_watt_seconds_per_unit(),
            precision: default_precision(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    SysfsGpio,
    /// No hardware; relay transitions are only logged.
    Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    pub kind: ActuatorKind,
    #[serde(default)]
    pub value_path: Option<PathBuf>,
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_period_ms")]
    pub period_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            period_ms: default_reconcile_period_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub room_id: String,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub meter: MeterConfig,
    #[serde(default)]
    pub tariff: TariffConfig,
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_ledger_timeout_ms() -> u64 {
    5_000
}

fn default_meter_kind() -> MeterKind {
    MeterKind::ModbusRtu
}

fn default_slave_address() -> u8 {
    1
}

fn default_meter_timeout_ms() -> u64 {
    2_000
}

fn default_metering_period_ms() -> u64 {
    1_000
}

fn default_watt_seconds_per_unit() -> f64 {
    3_600_000.0
}

fn default_precision() -> u32 {
    7
}

fn default_reconcile_period_ms() -> u64 {
    250
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        let cfg = Self::from_toml(&contents)?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.room_id.trim().is_empty() {
            anyhow::bail!("room_id must not be empty");
        }
        if self.cache.path == self.cache.backup_path {
            anyhow::bail!("cache.path and cache.backup_path must differ");
        }
        if self.meter.period_ms == 0 || self.reconcile.period_ms == 0 {
            anyhow::bail!("loop periods must be positive");
        }
        if self.meter.timeout_ms == 0 || self.ledger.timeout_ms == 0 {
            anyhow::bail!("timeouts must be positive");
        }
        let unit = self.tariff.watt_seconds_per_unit;
        if !unit.is_finite() || unit <= 0.0 {
            anyhow::bail!("tariff.watt_seconds_per_unit must be positive, got {unit}");
        }
        if self.actuator.kind == ActuatorKind::SysfsGpio && self.actuator.value_path.is_none() {
            anyhow::bail!("actuator.value_path is required for sysfs_gpio");
        }
        Ok(())
    }

    pub fn metering_period(&self) -> Duration {
        Duration::from_millis(self.meter.period_ms)
    }

    pub fn meter_timeout(&self) -> Duration {
        Duration::from_millis(self.meter.timeout_ms)
    }

    pub fn reconcile_period(&self) -> Duration {
        Duration::from_millis(self.reconcile.period_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger.timeout_ms)
    }

    pub fn tariff(&self) -> Tariff {
        Tariff {
            watt_seconds_per_unit: self.tariff.watt_seconds_per_unit,
            precision: self.tariff.precision,
        }
    }
}
