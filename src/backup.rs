use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::ledger::StockLedger;
use crate::model::{Product, UsageRecord};

pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("could not read or write backup file: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid backup format: {0}")]
    InvalidFormat(String),
}

/// The self-describing backup envelope. Field names are camelCase on
/// the wire so files round-trip between installations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub data: BackupData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    pub products: Vec<Product>,
    /// Older backups may predate usage history; treat absence as empty.
    #[serde(default)]
    pub usage_records: Vec<UsageRecord>,
}

impl Backup {
    /// Snapshot the ledger's inventory. Vineyards and license state are
    /// not part of the backup payload.
    pub fn capture(ledger: &StockLedger) -> Self {
        Backup {
            version: BACKUP_VERSION.to_string(),
            timestamp: Utc::now(),
            platform: std::env::consts::OS.to_string(),
            data: BackupData {
                products: ledger.products().to_vec(),
                usage_records: ledger.usage_records().to_vec(),
            },
        }
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), BackupError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self, BackupError> {
        let text = fs::read_to_string(path)?;
        parse_backup(&text)
    }

    /// Default export file name, stamped to the minute.
    pub fn default_file_name(at: DateTime<Utc>) -> String {
        format!("spray-stock-backup-{}.json", at.format("%d-%m-%Y-%H-%M"))
    }
}

/// Validate and decode a backup document. Every check runs before any
/// value is handed back, so a caller either gets a complete backup or
/// an error and an untouched ledger.
pub fn parse_backup(text: &str) -> Result<Backup, BackupError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    for field in ["version", "timestamp", "data"] {
        if value.get(field).is_none() {
            return Err(BackupError::InvalidFormat(format!(
                "missing required field '{field}'"
            )));
        }
    }
    match value["data"].get("products") {
        Some(products) if products.is_array() => {}
        Some(_) => {
            return Err(BackupError::InvalidFormat(
                "'data.products' must be an array".into(),
            ))
        }
        None => {
            return Err(BackupError::InvalidFormat(
                "missing required field 'data.products'".into(),
            ))
        }
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, ProductData, Unit};
    use uuid::Uuid;

    fn ledger_with_history() -> StockLedger {
        let mut ledger = StockLedger::new();
        let a = ledger
            .add_product(ProductData {
                name: "A".into(),
                category: Category::PowderyMildew,
                quantity: 200.0,
                unit: Unit::Liter,
                active_ingredient: "Sulfur".into(),
                dosage_per_hundred_lt: 10.0,
            })
            .unwrap();
        ledger
            .add_product(ProductData {
                name: "B".into(),
                category: Category::DownyMildew,
                quantity: 300.0,
                unit: Unit::Kilogram,
                active_ingredient: "Copper".into(),
                dosage_per_hundred_lt: 20.0,
            })
            .unwrap();
        ledger
            .record_usage(Uuid::new_v4(), "East slope", 100.0, &[a.id])
            .unwrap();
        ledger
    }

    #[test]
    fn backup_round_trips_into_a_fresh_ledger() {
        let source = ledger_with_history();
        let backup = Backup::capture(&source);
        let json = serde_json::to_string_pretty(&backup).unwrap();

        let parsed = parse_backup(&json).unwrap();
        let mut restored = StockLedger::new();
        restored.replace_inventory(parsed.data.products, parsed.data.usage_records);

        assert_eq!(restored.products(), source.products());
        assert_eq!(restored.usage_records(), source.usage_records());
    }

    #[test]
    fn backup_envelope_carries_version_and_platform() {
        let backup = Backup::capture(&ledger_with_history());
        let json = serde_json::to_value(&backup).unwrap();
        assert_eq!(json["version"], BACKUP_VERSION);
        assert!(json["timestamp"].is_string());
        assert!(json["data"]["usageRecords"].is_array());
    }

    #[test]
    fn missing_usage_records_default_to_empty() {
        let backup = Backup::capture(&ledger_with_history());
        let mut json = serde_json::to_value(&backup).unwrap();
        json["data"].as_object_mut().unwrap().remove("usageRecords");

        let parsed = parse_backup(&json.to_string()).unwrap();
        assert_eq!(parsed.data.products.len(), 2);
        assert!(parsed.data.usage_records.is_empty());
    }

    #[test]
    fn missing_envelope_fields_are_rejected() {
        let backup = Backup::capture(&ledger_with_history());
        for field in ["version", "timestamp", "data"] {
            let mut json = serde_json::to_value(&backup).unwrap();
            json.as_object_mut().unwrap().remove(field);
            let err = parse_backup(&json.to_string()).unwrap_err();
            assert!(matches!(err, BackupError::InvalidFormat(_)), "{field}");
        }
    }

    #[test]
    fn non_array_products_are_rejected() {
        let text = r#"{"version":"1.0","timestamp":"2026-03-01T10:00:00Z",
                       "platform":"linux","data":{"products":42}}"#;
        assert!(matches!(
            parse_backup(text),
            Err(BackupError::InvalidFormat(_))
        ));
    }

    #[test]
    fn garbage_input_is_rejected() {
        assert!(matches!(parse_backup("not json"), Err(BackupError::Json(_))));
    }

    #[test]
    fn default_file_name_is_stamped_to_the_minute() {
        let at = "2026-03-01T10:05:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            Backup::default_file_name(at),
            "spray-stock-backup-01-03-2026-10-05.json"
        );
    }
}
