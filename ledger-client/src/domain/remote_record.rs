use serde::{Deserialize, Serialize};

use super::credit_account::ConsumptionLog;

/// The remote ledger's view of one account node.
///
/// Only `CurrentCredit` is required; the tariff fields may be absent on a
/// freshly provisioned node, in which case the local values stay in force.
/// Any remote `PowerConsumption` is ignored: the device is its only writer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteRecord {
    pub current_credit: f64,
    #[serde(default)]
    pub electricity_price: Option<f64>,
    #[serde(default)]
    pub credit_critical_level: Option<f64>,
}

/// Merge-patch body: only the populated fields are sent, everything else on
/// the remote node is left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_credit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_consumption: Option<ConsumptionLog>,
}

impl RemotePatch {
    pub fn credit(value: f64) -> Self {
        Self {
            current_credit: Some(value),
            ..Default::default()
        }
    }

    pub fn consumption(log: ConsumptionLog) -> Self {
        Self {
            power_consumption: Some(log),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_credit.is_none() && self.power_consumption.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_patch_serializes_only_credit() {
        let body = serde_json::to_value(RemotePatch::credit(8.0)).unwrap();
        assert_eq!(body, serde_json::json!({"CurrentCredit": 8.0}));
    }

    #[test]
    fn remote_record_tolerates_missing_tariff_fields() {
        let rec: RemoteRecord =
            serde_json::from_str(r#"{"CurrentCredit": 18, "PowerConsumption": {}}"#).unwrap();
        assert_eq!(rec.current_credit, 18.0);
        assert!(rec.electricity_price.is_none());
        assert!(rec.credit_critical_level.is_none());
    }

    #[test]
    fn remote_record_requires_credit() {
        assert!(serde_json::from_str::<RemoteRecord>(r#"{"ElectricityPrice": 2.0}"#).is_err());
    }
}
