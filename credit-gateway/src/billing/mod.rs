use std::time::Duration;

use ledger_client::domain::{CreditAccount, Deduction, LogTimestamp};

/// How metered power is turned into billed consumption units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tariff {
    pub watt_seconds_per_unit: f64,
    pub precision: u32,
}

impl Tariff {
    /// One unit per kilowatt-hour, rounded to 7 decimals.
    pub const KWH: Tariff = Tariff {
        watt_seconds_per_unit: 3_600_000.0,
        precision: 7,
    };
}

impl Default for Tariff {
    fn default() -> Self {
        Self::KWH
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision.min(15) as i32);
    (value * scale).round() / scale
}

/// Consumption units drawn at `power_w` over `period`.
///
/// Rules:
/// - non-finite or non-positive power bills nothing.
/// - the result is rounded to the tariff precision and never negative.
pub fn consumption_for(power_w: f64, period: Duration, tariff: &Tariff) -> f64 {
    if !power_w.is_finite() || power_w <= 0.0 {
        return 0.0;
    }
    let energy_ws = power_w * period.as_secs_f64();
    round_to(energy_ws / tariff.watt_seconds_per_unit, tariff.precision).max(0.0)
}

/// Charges one metering sample against `account`.
///
/// Returns `None` when the sample rounds to zero consumption, in which case
/// the account is left untouched (no log entry, no deduction).
pub fn apply_sample(
    account: &mut CreditAccount,
    power_w: f64,
    period: Duration,
    tariff: &Tariff,
    at: LogTimestamp,
) -> Option<Deduction> {
    let consumption = consumption_for(power_w, period, tariff);
    account.charge(consumption, at)
}
