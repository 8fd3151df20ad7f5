//! Maps spoken product references onto catalog entries.
//!
//! Matching is a first-hit heuristic: an exact case-insensitive name wins,
//! otherwise the first product whose name contains the spoken one (or is
//! contained in it). Ambiguous hits are not surfaced.

use shared::{BillItem, LineItem, Product, UNKNOWN_SKU};

pub fn find_product<'a>(spoken: &str, catalog: &'a [Product]) -> Option<&'a Product> {
    let wanted = spoken.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }

    catalog
        .iter()
        .find(|product| product.name.trim().to_lowercase() == wanted)
        .or_else(|| {
            catalog.iter().find(|product| {
                let name = product.name.trim().to_lowercase();
                !name.is_empty() && (name.contains(&wanted) || wanted.contains(&name))
            })
        })
}

pub fn reconcile(item: &LineItem, catalog: &[Product], default_unit: &str) -> BillItem {
    let quantity = item.billable_quantity();

    match find_product(&item.product_name, catalog) {
        Some(product) => BillItem {
            sku: product.sku.clone(),
            name: product.name.clone(),
            quantity,
            unit_price: product.price,
            unit: first_non_empty(&[&product.unit, &item.unit], default_unit),
        },
        None => BillItem {
            sku: UNKNOWN_SKU.to_string(),
            name: item.product_name.trim().to_string(),
            quantity,
            unit_price: item.estimated_price.unwrap_or(0.0),
            unit: first_non_empty(&[&item.unit], default_unit),
        },
    }
}

pub fn reconcile_all(items: &[LineItem], catalog: &[Product], default_unit: &str) -> Vec<BillItem> {
    items
        .iter()
        .map(|item| reconcile(item, catalog, default_unit))
        .collect()
}

fn first_non_empty(candidates: &[&str], fallback: &str) -> String {
    candidates
        .iter()
        .map(|unit| unit.trim())
        .find(|unit| !unit.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
