use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One "Taral" — the operator's standard treatment volume, in liters of
/// spray water.
pub const TARAL_LT: f64 = 1600.0;

/// Stock unit of a product. Abbreviations match the labels the dosage
/// tables use (L/KG/ML/GR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Unit {
    #[serde(rename = "L")]
    Liter,
    #[serde(rename = "KG")]
    Kilogram,
    #[serde(rename = "ML")]
    Milliliter,
    #[serde(rename = "GR")]
    Gram,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::Liter => "L",
            Unit::Kilogram => "KG",
            Unit::Milliliter => "ML",
            Unit::Gram => "GR",
        };
        f.pad(s)
    }
}

/// Target pest or disease a product is applied against. Fixed set; the
/// category is descriptive only and plays no part in the arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Category {
    PowderyMildew,
    GrayMold,
    DownyMildew,
    RedSpiderMite,
    Mealybug,
    LarvalWorm,
    LiveWorm,
    DeadArm,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::PowderyMildew => "Powdery mildew",
            Category::GrayMold => "Gray mold",
            Category::DownyMildew => "Downy mildew",
            Category::RedSpiderMite => "Red spider mite",
            Category::Mealybug => "Mealybug",
            Category::LarvalWorm => "Worm (larva)",
            Category::LiveWorm => "Worm (live)",
            Category::DeadArm => "Dead arm",
        };
        f.pad(s)
    }
}

/// A chemical product currently held in stock. `quantity` is expressed
/// in `unit`; `dosage_per_hundred_lt` is the amount of product (same
/// unit) required per 100 liters of spray water.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub category: Category,
    pub quantity: f64,
    pub unit: Unit,
    pub active_ingredient: String,
    pub dosage_per_hundred_lt: f64,
    pub last_updated: DateTime<Utc>,
}

/// Product fields supplied by the caller on create/update; id and
/// timestamp are assigned by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductData {
    pub name: String,
    pub category: Category,
    pub quantity: f64,
    pub unit: Unit,
    pub active_ingredient: String,
    pub dosage_per_hundred_lt: f64,
}

/// Per-product snapshot inside a usage record. Name and unit are copied
/// at record-creation time so the record stays readable after the live
/// product is renamed or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageProduct {
    pub product_id: Uuid,
    pub product_name: String,
    pub calculated_usage: f64,
    pub unit: Unit,
}

/// One spraying event. Immutable once created; there is no update or
/// delete path for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub vineyard_id: Uuid,
    pub vineyard_name: String,
    pub total_water_amount: f64,
    pub products: Vec<UsageProduct>,
}

/// Cadastral reference of a vineyard parcel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParcelInfo {
    pub block: String,
    pub parcel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

/// A field under treatment. `area` is derived from the boundary
/// polygon, never supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vineyard {
    pub id: Uuid,
    pub name: String,
    pub area: f64,
    pub parcel_info: ParcelInfo,
    pub coordinates: Vec<Coordinate>,
    pub grape_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied vineyard fields; id, area and timestamps are managed
/// by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VineyardData {
    pub name: String,
    pub parcel_info: ParcelInfo,
    pub coordinates: Vec<Coordinate>,
    pub grape_type: String,
}

// --- Coverage arithmetic ---
//
// All derived quantities are closed-form functions of (quantity,
// dosage_per_hundred_lt, water amount). They live here, and only here,
// so every display and report site agrees on the numbers.

/// Amount of product needed to treat one Taral of spray water.
pub fn coverage_for_one_taral(dosage_per_hundred_lt: f64) -> f64 {
    (TARAL_LT / 100.0) * dosage_per_hundred_lt
}

/// Liters of spray water the current stock can support.
pub fn total_water_coverage(quantity: f64, dosage_per_hundred_lt: f64) -> f64 {
    (quantity / dosage_per_hundred_lt) * 100.0
}

/// Number of full-Taral treatments the current stock can support.
pub fn taral_count(quantity: f64, dosage_per_hundred_lt: f64) -> f64 {
    total_water_coverage(quantity, dosage_per_hundred_lt) / TARAL_LT
}

/// Amount of product consumed by `total_water_lt` liters of spray water.
pub fn usage_for_water(total_water_lt: f64, dosage_per_hundred_lt: f64) -> f64 {
    (total_water_lt / 100.0) * dosage_per_hundred_lt
}

impl Product {
    pub fn coverage_for_one_taral(&self) -> f64 {
        coverage_for_one_taral(self.dosage_per_hundred_lt)
    }

    pub fn total_water_coverage(&self) -> f64 {
        total_water_coverage(self.quantity, self.dosage_per_hundred_lt)
    }

    pub fn taral_count(&self) -> f64 {
        taral_count(self.quantity, self.dosage_per_hundred_lt)
    }

    /// Stock cannot cover one full Taral at this product's dosage rate.
    pub fn is_low_stock(&self) -> bool {
        self.quantity < self.coverage_for_one_taral()
    }
}

/// Approximate polygon area in m² from lat/lng vertices (shoelace
/// formula with a flat degree-to-meter factor). Degenerate polygons
/// (fewer than 3 vertices) have zero area.
pub fn polygon_area_m2(coordinates: &[Coordinate]) -> f64 {
    if coordinates.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 0..coordinates.len() {
        let j = (i + 1) % coordinates.len();
        area += coordinates[i].lat * coordinates[j].lng;
        area -= coordinates[j].lat * coordinates[i].lng;
    }
    ((area.abs() / 2.0) * 111_319.9).round()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_derivation() {
        // quantity=150, dosage=50: stock supports 300 Lt of water,
        // which is 0.1875 of a Taral.
        assert_eq!(total_water_coverage(150.0, 50.0), 300.0);
        assert_eq!(taral_count(150.0, 50.0), 0.1875);
        assert_eq!(coverage_for_one_taral(50.0), 800.0);
    }

    #[test]
    fn usage_is_proportional_to_water() {
        assert_eq!(usage_for_water(1600.0, 50.0), 800.0);
        assert_eq!(usage_for_water(100.0, 25.0), 25.0);
    }

    #[test]
    fn low_stock_threshold_is_sixteen_times_dosage() {
        let mut p = product_with(79.9, 5.0);
        assert!(p.is_low_stock());
        p.quantity = 80.0; // exactly 16 * 5.0 is not low
        assert!(!p.is_low_stock());
    }

    #[test]
    fn degenerate_polygon_has_zero_area() {
        let two = vec![
            Coordinate { lat: 38.42, lng: 27.14 },
            Coordinate { lat: 38.43, lng: 27.15 },
        ];
        assert_eq!(polygon_area_m2(&two), 0.0);
        assert_eq!(polygon_area_m2(&[]), 0.0);
    }

    #[test]
    fn polygon_area_is_positive_regardless_of_winding() {
        let square = vec![
            Coordinate { lat: 0.0, lng: 0.0 },
            Coordinate { lat: 0.0, lng: 0.01 },
            Coordinate { lat: 0.01, lng: 0.01 },
            Coordinate { lat: 0.01, lng: 0.0 },
        ];
        let reversed: Vec<_> = square.iter().rev().copied().collect();
        let a = polygon_area_m2(&square);
        assert!(a > 0.0);
        assert_eq!(a, polygon_area_m2(&reversed));
    }

    #[test]
    fn product_serde_uses_wire_names() {
        let p = product_with(10.0, 2.0);
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("dosagePerHundredLt").is_some());
        assert!(json.get("activeIngredient").is_some());
        assert_eq!(json["unit"], "L");
    }

    fn product_with(quantity: f64, dosage: f64) -> Product {
        Product {
            id: Uuid::new_v4(),
            name: "Thiovit Jet".into(),
            category: Category::PowderyMildew,
            quantity,
            unit: Unit::Liter,
            active_ingredient: "Sulfur".into(),
            dosage_per_hundred_lt: dosage,
            last_updated: Utc::now(),
        }
    }
}
