use rusqlite::types::Type;
use rusqlite::{params, Connection, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ledger::StockLedger;
use crate::license::LicenseState;
use crate::model::{Coordinate, ParcelInfo, Product, UsageProduct, UsageRecord, Vineyard};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;

        // seq preserves insertion order; display order depends on it.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS products (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                quantity REAL NOT NULL,
                unit TEXT NOT NULL,
                active_ingredient TEXT NOT NULL,
                dosage_per_hundred_lt REAL NOT NULL,
                last_updated TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                date TEXT NOT NULL,
                vineyard_id TEXT NOT NULL,
                vineyard_name TEXT NOT NULL,
                total_water_amount REAL NOT NULL,
                products_json TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vineyards (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                area REAL NOT NULL,
                block TEXT NOT NULL,
                parcel TEXT NOT NULL,
                grape_type TEXT NOT NULL,
                coordinates_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS license_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state_json TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Rebuild the full in-memory ledger from disk. Collection order is
    /// the original insertion order.
    pub fn load_ledger(&self) -> Result<StockLedger> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, name, category, quantity, unit, active_ingredient,
                    dosage_per_hundred_lt, last_updated
             FROM products ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Product {
                id: parse_uuid(row.get(0)?, 0)?,
                name: row.get(1)?,
                category: enum_from_text(row.get(2)?, 2)?,
                quantity: row.get(3)?,
                unit: enum_from_text(row.get(4)?, 4)?,
                active_ingredient: row.get(5)?,
                dosage_per_hundred_lt: row.get(6)?,
                last_updated: parse_datetime(row.get(7)?, 7)?,
            })
        })?;
        let mut products = Vec::new();
        for r in rows {
            products.push(r?);
        }

        let mut stmt = conn.prepare(
            "SELECT id, date, vineyard_id, vineyard_name, total_water_amount, products_json
             FROM usage_records ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let products_json: String = row.get(5)?;
            let entries: Vec<UsageProduct> =
                serde_json::from_str(&products_json).map_err(|e| conversion_err(5, e))?;
            Ok(UsageRecord {
                id: parse_uuid(row.get(0)?, 0)?,
                date: parse_datetime(row.get(1)?, 1)?,
                vineyard_id: parse_uuid(row.get(2)?, 2)?,
                vineyard_name: row.get(3)?,
                total_water_amount: row.get(4)?,
                products: entries,
            })
        })?;
        let mut usage_records = Vec::new();
        for r in rows {
            usage_records.push(r?);
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, area, block, parcel, grape_type, coordinates_json,
                    created_at, updated_at
             FROM vineyards ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let coordinates_json: String = row.get(6)?;
            let coordinates: Vec<Coordinate> =
                serde_json::from_str(&coordinates_json).map_err(|e| conversion_err(6, e))?;
            Ok(Vineyard {
                id: parse_uuid(row.get(0)?, 0)?,
                name: row.get(1)?,
                area: row.get(2)?,
                parcel_info: ParcelInfo {
                    block: row.get(3)?,
                    parcel: row.get(4)?,
                },
                coordinates,
                grape_type: row.get(5)?,
                created_at: parse_datetime(row.get(7)?, 7)?,
                updated_at: parse_datetime(row.get(8)?, 8)?,
            })
        })?;
        let mut vineyards = Vec::new();
        for r in rows {
            vineyards.push(r?);
        }

        Ok(StockLedger::from_parts(products, usage_records, vineyards))
    }

    /// Flush the whole ledger. Data is bounded (tens to low thousands
    /// of rows), so a rewrite inside one transaction is cheaper than
    /// diffing.
    pub fn save_ledger(&self, ledger: &StockLedger) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM products", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO products (id, name, category, quantity, unit,
                                       active_ingredient, dosage_per_hundred_lt, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for p in ledger.products() {
                stmt.execute(params![
                    p.id.to_string(),
                    p.name,
                    enum_to_text(&p.category)?,
                    p.quantity,
                    enum_to_text(&p.unit)?,
                    p.active_ingredient,
                    p.dosage_per_hundred_lt,
                    p.last_updated.to_rfc3339(),
                ])?;
            }
        }

        tx.execute("DELETE FROM usage_records", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO usage_records (id, date, vineyard_id, vineyard_name,
                                            total_water_amount, products_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in ledger.usage_records() {
                let products_json = serde_json::to_string(&r.products)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    r.id.to_string(),
                    r.date.to_rfc3339(),
                    r.vineyard_id.to_string(),
                    r.vineyard_name,
                    r.total_water_amount,
                    products_json,
                ])?;
            }
        }

        tx.execute("DELETE FROM vineyards", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO vineyards (id, name, area, block, parcel, grape_type,
                                        coordinates_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for v in ledger.vineyards() {
                let coordinates_json = serde_json::to_string(&v.coordinates)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    v.id.to_string(),
                    v.name,
                    v.area,
                    v.parcel_info.block,
                    v.parcel_info.parcel,
                    v.grape_type,
                    coordinates_json,
                    v.created_at.to_rfc3339(),
                    v.updated_at.to_rfc3339(),
                ])?;
            }
        }

        tx.commit()
    }

    // --- License state ---

    pub fn load_license(&self) -> Result<Option<LicenseState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT state_json FROM license_state WHERE id = 1")?;
        let mut rows = stmt.query_map([], |row| {
            let json: String = row.get(0)?;
            serde_json::from_str::<LicenseState>(&json).map_err(|e| conversion_err(0, e))
        })?;
        match rows.next() {
            Some(state) => Ok(Some(state?)),
            None => Ok(None),
        }
    }

    pub fn save_license(&self, state: &LicenseState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(state)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        conn.execute(
            "INSERT INTO license_state (id, state_json) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET state_json = excluded.state_json",
            params![json],
        )?;
        Ok(())
    }

    pub fn clear_license(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM license_state", [])?;
        Ok(())
    }
}

// Enum fields are stored under their wire names ("L", "PowderyMildew")
// so the TEXT columns and the backup JSON agree.
fn enum_to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(rusqlite::Error::ToSqlConversionFailure(
            format!("expected string-encoded enum, got {other}").into(),
        )),
        Err(e) => Err(rusqlite::Error::ToSqlConversionFailure(Box::new(e))),
    }
}

fn enum_from_text<T: DeserializeOwned>(text: String, column: usize) -> Result<T> {
    serde_json::from_value(Value::String(text)).map_err(|e| conversion_err(column, e))
}

fn parse_uuid(text: String, column: usize) -> Result<Uuid> {
    Uuid::parse_str(&text).map_err(|e| conversion_err(column, e))
}

fn parse_datetime(text: String, column: usize) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(column, e))
}

fn conversion_err<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, ProductData, Unit, VineyardData};
    use tempfile::NamedTempFile;

    fn sample_data(name: &str) -> ProductData {
        ProductData {
            name: name.into(),
            category: Category::GrayMold,
            quantity: 500.0,
            unit: Unit::Gram,
            active_ingredient: "Cyprodinil".into(),
            dosage_per_hundred_lt: 40.0,
        }
    }

    #[test]
    fn ledger_round_trips_through_sqlite() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::open(file.path()).unwrap();

        let mut ledger = StockLedger::new();
        let a = ledger.add_product(sample_data("A")).unwrap();
        ledger.add_product(sample_data("B")).unwrap();
        let vy = ledger
            .add_vineyard(VineyardData {
                name: "East slope".into(),
                parcel_info: ParcelInfo {
                    block: "104".into(),
                    parcel: "7".into(),
                },
                coordinates: vec![
                    Coordinate { lat: 0.0, lng: 0.0 },
                    Coordinate { lat: 0.0, lng: 0.01 },
                    Coordinate { lat: 0.01, lng: 0.0 },
                ],
                grape_type: "Sultana".into(),
            })
            .unwrap();
        ledger.record_usage(vy.id, &vy.name, 100.0, &[a.id]).unwrap();

        db.save_ledger(&ledger).unwrap();
        let reloaded = db.load_ledger().unwrap();

        // rfc3339 keeps nanosecond precision, so full equality holds.
        assert_eq!(reloaded, ledger);
        let names: Vec<_> = reloaded.products().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn save_is_a_full_rewrite() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::open(file.path()).unwrap();

        let mut ledger = StockLedger::new();
        let a = ledger.add_product(sample_data("A")).unwrap();
        db.save_ledger(&ledger).unwrap();

        ledger.delete_product(a.id).unwrap();
        ledger.add_product(sample_data("C")).unwrap();
        db.save_ledger(&ledger).unwrap();

        let reloaded = db.load_ledger().unwrap();
        let names: Vec<_> = reloaded.products().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["C"]);
    }

    #[test]
    fn empty_database_loads_an_empty_ledger() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::open(file.path()).unwrap();
        let ledger = db.load_ledger().unwrap();
        assert!(ledger.products().is_empty());
        assert!(ledger.usage_records().is_empty());
        assert!(ledger.vineyards().is_empty());
    }

    #[test]
    fn corrupt_timestamp_reports_its_column() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::open(file.path()).unwrap();

        let mut ledger = StockLedger::new();
        ledger.add_product(sample_data("A")).unwrap();
        db.save_ledger(&ledger).unwrap();

        let conn = Connection::open(file.path()).unwrap();
        conn.execute("UPDATE products SET last_updated = 'not-a-date'", [])
            .unwrap();

        // last_updated is the eighth selected column.
        match db.load_ledger() {
            Err(rusqlite::Error::FromSqlConversionFailure(column, _, _)) => {
                assert_eq!(column, 7)
            }
            other => panic!("expected a conversion failure, got {other:?}"),
        }
    }

    #[test]
    fn license_state_round_trips_and_clears() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::open(file.path()).unwrap();
        assert!(db.load_license().unwrap().is_none());

        let state = LicenseState::activated_now(
            "ABCD-EFGH-IJKL-MNOP".into(),
            "fingerprint".into(),
            None,
        );
        db.save_license(&state).unwrap();
        assert_eq!(db.load_license().unwrap(), Some(state.clone()));

        // Upsert keeps a single row.
        db.save_license(&state).unwrap();
        db.clear_license().unwrap();
        assert!(db.load_license().unwrap().is_none());
    }
}
