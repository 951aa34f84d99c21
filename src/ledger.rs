use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    polygon_area_m2, usage_for_water, Product, ProductData, UsageProduct, UsageRecord, Unit,
    Vineyard, VineyardData,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("no product with id {0}")]
    ProductNotFound(Uuid),

    #[error("no vineyard with id {0}")]
    VineyardNotFound(Uuid),

    #[error("insufficient stock of '{name}': {required:.2} needed, {available:.2} available")]
    InsufficientStock {
        name: String,
        required: f64,
        available: f64,
    },
}

/// Water volume per calendar month, first-encountered month order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    pub month: String,
    pub total_water: f64,
}

/// Cumulative consumption of one product name across all records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUsageTotal {
    pub name: String,
    pub total_usage: f64,
    pub unit: Unit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub monthly_usage: Vec<MonthlyUsage>,
    pub top_products: Vec<ProductUsageTotal>,
}

/// The authoritative stock state: product list, usage history and the
/// vineyard registry. All mutation goes through the methods below;
/// collections are never edited directly, which keeps id uniqueness and
/// the deduction invariants enforceable in one place.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLedger {
    products: Vec<Product>,
    usage_records: Vec<UsageRecord>,
    vineyards: Vec<Vineyard>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted collections, preserving order.
    pub fn from_parts(
        products: Vec<Product>,
        usage_records: Vec<UsageRecord>,
        vineyards: Vec<Vineyard>,
    ) -> Self {
        Self {
            products,
            usage_records,
            vineyards,
        }
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn usage_records(&self) -> &[UsageRecord] {
        &self.usage_records
    }

    pub fn vineyards(&self) -> &[Vineyard] {
        &self.vineyards
    }

    // --- Products ---

    pub fn add_product(&mut self, data: ProductData) -> Result<Product, LedgerError> {
        let data = validated(data)?;
        let product = Product {
            id: Uuid::new_v4(),
            name: data.name,
            category: data.category,
            quantity: data.quantity,
            unit: data.unit,
            active_ingredient: data.active_ingredient,
            dosage_per_hundred_lt: data.dosage_per_hundred_lt,
            last_updated: Utc::now(),
        };
        info!("product added: {} ({})", product.name, product.id);
        self.products.push(product.clone());
        Ok(product)
    }

    /// Full field replacement; only the id survives from the previous
    /// version.
    pub fn update_product(&mut self, id: Uuid, data: ProductData) -> Result<Product, LedgerError> {
        let data = validated(data)?;
        let product = self
            .products
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(LedgerError::ProductNotFound(id))?;
        product.name = data.name;
        product.category = data.category;
        product.quantity = data.quantity;
        product.unit = data.unit;
        product.active_ingredient = data.active_ingredient;
        product.dosage_per_hundred_lt = data.dosage_per_hundred_lt;
        product.last_updated = Utc::now();
        info!("product updated: {} ({})", product.name, product.id);
        Ok(product.clone())
    }

    /// No cascade: usage records referencing the product keep their
    /// denormalized snapshot and stay valid as history.
    pub fn delete_product(&mut self, id: Uuid) -> Result<(), LedgerError> {
        let before = self.products.len();
        self.products.retain(|p| p.id != id);
        if self.products.len() == before {
            return Err(LedgerError::ProductNotFound(id));
        }
        info!("product deleted: {id}");
        Ok(())
    }

    pub fn product(&self, id: Uuid) -> Option<&Product> {
        self.products.iter().find(|p| p.id == id)
    }

    // --- Usage ---

    /// Record one spraying event and deduct stock, all-or-nothing: if
    /// any selected product lacks stock for its share, nothing changes.
    pub fn record_usage(
        &mut self,
        vineyard_id: Uuid,
        vineyard_name: &str,
        total_water_amount: f64,
        selected_product_ids: &[Uuid],
    ) -> Result<UsageRecord, LedgerError> {
        if total_water_amount <= 0.0 {
            return Err(LedgerError::Validation(
                "water amount must be positive".into(),
            ));
        }
        if selected_product_ids.is_empty() {
            return Err(LedgerError::Validation(
                "at least one product must be selected".into(),
            ));
        }

        // Selection is treated as a set; a duplicated id must not
        // deduct twice.
        let mut ids: Vec<Uuid> = Vec::with_capacity(selected_product_ids.len());
        for &id in selected_product_ids {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        // Check every product before touching any quantity.
        let mut entries: Vec<UsageProduct> = Vec::with_capacity(ids.len());
        let mut positions: Vec<usize> = Vec::with_capacity(ids.len());
        for id in &ids {
            let pos = self
                .products
                .iter()
                .position(|p| p.id == *id)
                .ok_or(LedgerError::ProductNotFound(*id))?;
            let product = &self.products[pos];
            let usage = usage_for_water(total_water_amount, product.dosage_per_hundred_lt);
            if usage > product.quantity {
                return Err(LedgerError::InsufficientStock {
                    name: product.name.clone(),
                    required: usage,
                    available: product.quantity,
                });
            }
            entries.push(UsageProduct {
                product_id: *id,
                product_name: product.name.clone(),
                calculated_usage: usage,
                unit: product.unit,
            });
            positions.push(pos);
        }

        let record = UsageRecord {
            id: Uuid::new_v4(),
            date: Utc::now(),
            vineyard_id,
            vineyard_name: vineyard_name.to_string(),
            total_water_amount,
            products: entries,
        };

        // Apply record and deductions together; no fallible step may
        // run between them.
        self.usage_records.push(record.clone());
        for (entry, &pos) in record.products.iter().zip(&positions) {
            let product = &mut self.products[pos];
            product.quantity -= entry.calculated_usage;
            product.last_updated = record.date;
        }

        info!(
            "usage recorded: {} Lt on '{}', {} product(s)",
            total_water_amount,
            vineyard_name,
            record.products.len()
        );
        Ok(record)
    }

    /// Products whose stock cannot cover one Taral of treatment, in
    /// collection order.
    pub fn low_stock_products(&self) -> Vec<&Product> {
        self.products.iter().filter(|p| p.is_low_stock()).collect()
    }

    /// Monthly water totals plus the five most-consumed products.
    /// Months appear in first-encountered record order; product totals
    /// sort descending with ties kept in first-encountered order.
    pub fn usage_stats(&self) -> UsageStats {
        let mut monthly_usage: Vec<MonthlyUsage> = Vec::new();
        for record in &self.usage_records {
            let month = record.date.format("%B %Y").to_string();
            match monthly_usage.iter_mut().find(|m| m.month == month) {
                Some(m) => m.total_water += record.total_water_amount,
                None => monthly_usage.push(MonthlyUsage {
                    month,
                    total_water: record.total_water_amount,
                }),
            }
        }

        let mut totals: Vec<ProductUsageTotal> = Vec::new();
        for record in &self.usage_records {
            for entry in &record.products {
                match totals.iter_mut().find(|t| t.name == entry.product_name) {
                    Some(t) => t.total_usage += entry.calculated_usage,
                    None => totals.push(ProductUsageTotal {
                        name: entry.product_name.clone(),
                        total_usage: entry.calculated_usage,
                        unit: entry.unit,
                    }),
                }
            }
        }
        // sort_by is stable, so equal totals keep accumulation order.
        totals.sort_by(|a, b| b.total_usage.total_cmp(&a.total_usage));
        totals.truncate(5);

        UsageStats {
            monthly_usage,
            top_products: totals,
        }
    }

    /// Replace products and usage history wholesale (backup restore).
    /// Vineyards are not part of the backup payload and are untouched.
    pub fn replace_inventory(&mut self, products: Vec<Product>, usage_records: Vec<UsageRecord>) {
        info!(
            "inventory replaced: {} product(s), {} usage record(s)",
            products.len(),
            usage_records.len()
        );
        self.products = products;
        self.usage_records = usage_records;
    }

    // --- Vineyards ---

    pub fn add_vineyard(&mut self, data: VineyardData) -> Result<Vineyard, LedgerError> {
        if data.name.trim().is_empty() {
            return Err(LedgerError::Validation("vineyard name is required".into()));
        }
        let now = Utc::now();
        let vineyard = Vineyard {
            id: Uuid::new_v4(),
            name: data.name,
            area: polygon_area_m2(&data.coordinates),
            parcel_info: data.parcel_info,
            coordinates: data.coordinates,
            grape_type: data.grape_type,
            created_at: now,
            updated_at: now,
        };
        info!("vineyard added: {} ({})", vineyard.name, vineyard.id);
        self.vineyards.push(vineyard.clone());
        Ok(vineyard)
    }

    /// Replaces all caller fields, recomputes the area and keeps the
    /// original creation timestamp.
    pub fn update_vineyard(
        &mut self,
        id: Uuid,
        data: VineyardData,
    ) -> Result<Vineyard, LedgerError> {
        if data.name.trim().is_empty() {
            return Err(LedgerError::Validation("vineyard name is required".into()));
        }
        let vineyard = self
            .vineyards
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(LedgerError::VineyardNotFound(id))?;
        vineyard.name = data.name;
        vineyard.area = polygon_area_m2(&data.coordinates);
        vineyard.parcel_info = data.parcel_info;
        vineyard.coordinates = data.coordinates;
        vineyard.grape_type = data.grape_type;
        vineyard.updated_at = Utc::now();
        Ok(vineyard.clone())
    }

    pub fn delete_vineyard(&mut self, id: Uuid) -> Result<(), LedgerError> {
        let before = self.vineyards.len();
        self.vineyards.retain(|v| v.id != id);
        if self.vineyards.len() == before {
            return Err(LedgerError::VineyardNotFound(id));
        }
        info!("vineyard deleted: {id}");
        Ok(())
    }

    pub fn vineyard(&self, id: Uuid) -> Option<&Vineyard> {
        self.vineyards.iter().find(|v| v.id == id)
    }
}

/// Boundary validation shared by create and update. Trims the text
/// fields rather than rejecting padded input.
fn validated(mut data: ProductData) -> Result<ProductData, LedgerError> {
    data.name = data.name.trim().to_string();
    data.active_ingredient = data.active_ingredient.trim().to_string();
    if data.name.is_empty() {
        return Err(LedgerError::Validation("product name is required".into()));
    }
    if data.active_ingredient.is_empty() {
        return Err(LedgerError::Validation(
            "active ingredient is required".into(),
        ));
    }
    if data.quantity <= 0.0 {
        return Err(LedgerError::Validation("quantity must be positive".into()));
    }
    if data.dosage_per_hundred_lt <= 0.0 {
        return Err(LedgerError::Validation("dosage must be positive".into()));
    }
    Ok(data)
}
