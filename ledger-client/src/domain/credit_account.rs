use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{format_description::FormatItem, macros::format_description, PrimitiveDateTime};

/// Key format used by the on-device cache and the remote ledger for
/// consumption entries, e.g. `03-14-2024 17:05:09`.
const LOG_KEY_FORMAT: &[FormatItem<'static>] =
    format_description!("[month]-[day]-[year] [hour]:[minute]:[second]");

/// Floors a credit value at zero. Non-finite input is treated as zero.
pub fn clamp_credit(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Second-resolution wall-clock timestamp keying a consumption entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogTimestamp(PrimitiveDateTime);

impl LogTimestamp {
    /// Truncates `at` to whole seconds.
    pub fn new(at: PrimitiveDateTime) -> Self {
        Self(at.replace_nanosecond(0).unwrap_or(at))
    }

    pub fn parse(s: &str) -> Result<Self, time::error::Parse> {
        PrimitiveDateTime::parse(s, LOG_KEY_FORMAT).map(Self)
    }

    pub fn datetime(&self) -> PrimitiveDateTime {
        self.0
    }
}

impl From<PrimitiveDateTime> for LogTimestamp {
    fn from(at: PrimitiveDateTime) -> Self {
        Self::new(at)
    }
}

impl fmt::Display for LogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.format(LOG_KEY_FORMAT).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl Serialize for LogTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = self
            .0
            .format(LOG_KEY_FORMAT)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&s)
    }
}

impl<'de> Deserialize<'de> for LogTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        LogTimestamp::parse(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid consumption timestamp {s:?}: {e}")))
    }
}

/// Time-ordered consumption entries. Amounts are always finite and non-negative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<LogTimestamp, f64>", into = "BTreeMap<LogTimestamp, f64>")]
pub struct ConsumptionLog(BTreeMap<LogTimestamp, f64>);

impl ConsumptionLog {
    /// Adds `amount` to the entry for `at`. Non-positive or non-finite
    /// amounts are ignored and `false` is returned.
    pub fn record(&mut self, at: LogTimestamp, amount: f64) -> bool {
        if !amount.is_finite() || amount <= 0.0 {
            return false;
        }
        *self.0.entry(at).or_insert(0.0) += amount;
        true
    }

    pub fn get(&self, at: &LogTimestamp) -> Option<f64> {
        self.0.get(at).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LogTimestamp, &f64)> {
        self.0.iter()
    }
}

impl TryFrom<BTreeMap<LogTimestamp, f64>> for ConsumptionLog {
    type Error = String;

    fn try_from(entries: BTreeMap<LogTimestamp, f64>) -> Result<Self, Self::Error> {
        if let Some((at, amount)) = entries.iter().find(|(_, v)| !v.is_finite() || **v < 0.0) {
            return Err(format!("consumption entry {at} is invalid: {amount}"));
        }
        Ok(Self(entries))
    }
}

impl From<ConsumptionLog> for BTreeMap<LogTimestamp, f64> {
    fn from(log: ConsumptionLog) -> Self {
        log.0
    }
}

/// One prepaid account as mirrored in the on-device cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreditAccount {
    pub current_credit: f64,
    pub electricity_price: f64,
    pub credit_critical_level: f64,
    #[serde(default)]
    pub power_consumption: ConsumptionLog,
}

/// Outcome of charging one metered amount against an account.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deduction {
    pub consumption: f64,
    pub charged: f64,
    pub credit_before: f64,
    pub credit_after: f64,
}

impl CreditAccount {
    pub fn new(current_credit: f64, electricity_price: f64, credit_critical_level: f64) -> Self {
        Self {
            current_credit: clamp_credit(current_credit),
            electricity_price,
            credit_critical_level,
            power_consumption: ConsumptionLog::default(),
        }
    }

    pub fn set_credit(&mut self, value: f64) {
        self.current_credit = clamp_credit(value);
    }

    pub fn has_credit(&self) -> bool {
        self.current_credit > 0.0
    }

    pub fn below_critical_level(&self) -> bool {
        self.current_credit <= self.credit_critical_level
    }

    /// Logs `consumption` at `at` and deducts its price from the credit,
    /// flooring at zero. Returns `None` when nothing was consumed.
    pub fn charge(&mut self, consumption: f64, at: LogTimestamp) -> Option<Deduction> {
        if !self.power_consumption.record(at, consumption) {
            return None;
        }
        let credit_before = self.current_credit;
        let charged = consumption * self.electricity_price;
        self.set_credit(credit_before - charged);
        Some(Deduction {
            consumption,
            charged,
            credit_before,
            credit_after: self.current_credit,
        })
    }

    /// Rejects values no writer of this account should ever have produced.
    pub fn check(&self) -> Result<(), String> {
        if !self.current_credit.is_finite() || self.current_credit < 0.0 {
            return Err(format!("CurrentCredit is invalid: {}", self.current_credit));
        }
        if !self.electricity_price.is_finite() || self.electricity_price < 0.0 {
            return Err(format!("ElectricityPrice is invalid: {}", self.electricity_price));
        }
        if !self.credit_critical_level.is_finite() {
            return Err(format!(
                "CreditCriticalLevel is invalid: {}",
                self.credit_critical_level
            ));
        }
        Ok(())
    }
}
