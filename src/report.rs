use serde::Serialize;
use std::io::Write;

use crate::ledger::StockLedger;
use crate::model::Product;

/// One line of the stock report: the raw product fields plus the three
/// derived coverage metrics, precomputed so consumers never redo the
/// arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockReportRow {
    pub name: String,
    pub category: String,
    pub quantity: f64,
    pub unit: String,
    pub dosage_per_hundred_lt: f64,
    pub coverage_for_one_taral: f64,
    pub total_water_coverage: f64,
    pub taral_count: f64,
}

impl StockReportRow {
    fn from_product(p: &Product) -> Self {
        StockReportRow {
            name: p.name.clone(),
            category: p.category.to_string(),
            quantity: p.quantity,
            unit: p.unit.to_string(),
            dosage_per_hundred_lt: p.dosage_per_hundred_lt,
            coverage_for_one_taral: p.coverage_for_one_taral(),
            total_water_coverage: p.total_water_coverage(),
            taral_count: p.taral_count(),
        }
    }
}

/// Report rows in product collection order. Read-only over the ledger.
pub fn stock_report(ledger: &StockLedger) -> Vec<StockReportRow> {
    ledger.products().iter().map(StockReportRow::from_product).collect()
}

/// Serialize the stock report as CSV with a header row.
pub fn write_stock_report_csv<W: Write>(ledger: &StockLedger, out: W) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    for row in stock_report(ledger) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
