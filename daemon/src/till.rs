use anyhow::{Context, Result};
use log::{debug, info};
use shared::{Bill, BillStatus, LineItem, PaymentMode, Product};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::reconcile::reconcile_all;

static BILL_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_bill_id(now: SystemTime) -> String {
    let millis = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let seq = BILL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("BILL-{}-{}", millis, seq)
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    products: Vec<Product>,
}

impl Catalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    /// Reads a YAML list of products.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let products: Vec<Product> = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid catalog {}", path.display()))?;
        info!("Loaded {} products from {}", products.len(), path.display());
        Ok(Self::new(products))
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    #[cfg(test)]
    pub fn find_by_sku(&self, sku: &str) -> Option<&Product> {
        self.products.iter().find(|product| product.sku == sku)
    }

    /// Returns the new stock level, or `None` for an unknown sku.
    pub fn decrement(&mut self, sku: &str, units: u32) -> Option<u32> {
        let product = self.products.iter_mut().find(|product| product.sku == sku)?;
        product.stock = product.stock.saturating_sub(units);
        Some(product.stock)
    }
}

/// Committed bills. Entries only leave through `void`.
#[derive(Debug, Default)]
pub struct Ledger {
    bills: Vec<Bill>,
}

impl Ledger {
    pub fn record(&mut self, bill: Bill) {
        self.bills.push(bill);
    }

    /// Newest first.
    pub fn bills(&self) -> Vec<Bill> {
        self.bills.iter().rev().cloned().collect()
    }

    pub fn void(&mut self, id: &str) -> Option<Bill> {
        let index = self.bills.iter().position(|bill| bill.id == id)?;
        Some(self.bills.remove(index))
    }
}

pub struct Till {
    catalog: Catalog,
    ledger: Ledger,
    default_unit: String,
}

impl Till {
    pub fn new(catalog: Catalog, default_unit: &str) -> Self {
        Self {
            catalog,
            ledger: Ledger::default(),
            default_unit: default_unit.to_string(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn void(&mut self, id: &str) -> Option<Bill> {
        let voided = self.ledger.void(id);
        if voided.is_some() {
            info!("Voided bill {}", id);
        }
        voided
    }

    /// Commits a sale. Nothing happens for an empty list.
    pub fn finalize(&mut self, items: &[LineItem], payment_mode: PaymentMode) -> Option<Bill> {
        if items.is_empty() {
            debug!("finalize with nothing pending ignored");
            return None;
        }

        let bill_items = reconcile_all(items, self.catalog.products(), &self.default_unit);

        let mut sold: HashMap<&str, f64> = HashMap::new();
        for item in bill_items.iter().filter(|item| !item.is_unknown()) {
            *sold.entry(item.sku.as_str()).or_default() += item.quantity;
        }
        for (sku, quantity) in sold {
            // Stock is counted in whole units; a part unit sold opens a new one.
            let units = quantity.ceil().min(u32::MAX as f64) as u32;
            if let Some(left) = self.catalog.decrement(sku, units) {
                debug!("{} stock now {}", sku, left);
            }
        }

        let total: f64 = bill_items.iter().map(|item| item.line_total()).sum();
        let date = SystemTime::now();
        let bill = Bill {
            id: next_bill_id(date),
            date,
            items: bill_items,
            total,
            payment_mode,
            status: BillStatus::for_payment(payment_mode),
        };

        info!(
            "Recorded bill {} with {} items, total {:.2} ({:?})",
            bill.id,
            bill.items.len(),
            bill.total,
            bill.payment_mode
        );
        self.ledger.record(bill.clone());
        debug!("ledger holds {} bills", self.ledger.bills.len());
        Some(bill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::UNKNOWN_SKU;
    use std::collections::HashSet;

    fn product(sku: &str, name: &str, stock: u32, price: f64) -> Product {
        Product {
            sku: sku.to_string(),
            name: name.to_string(),
            category: "Grocery".to_string(),
            stock,
            price,
            unit: "pcs".to_string(),
        }
    }

    fn till() -> Till {
        Till::new(
            Catalog::new(vec![
                product("STP-RIC-HMT-25", "HMT Kolam Rice 25kg", 10, 1350.0),
                product("SPC-SAL-TAT-1", "Tata Salt 1kg", 1, 28.0),
                product("STP-SUG-1", "Madhur Sugar 1kg", 5, 52.0),
            ]),
            "pcs",
        )
    }

    #[test]
    fn rice_and_salt_sale() {
        let mut till = till();
        let items = vec![
            LineItem::new("Rice", 2.0, "kg"),
            LineItem::new("Salt", 1.0, "pkt").with_price(28.0),
        ];

        let bill = till.finalize(&items, PaymentMode::Cash).unwrap();

        assert_eq!(bill.items[0].sku, "STP-RIC-HMT-25");
        assert_eq!(bill.items[0].unit_price, 1350.0);
        assert_eq!(bill.items[1].sku, "SPC-SAL-TAT-1");
        assert_eq!(bill.items[1].unit_price, 28.0);
        assert_eq!(bill.total, 2728.0);
        assert_eq!(bill.status, BillStatus::Paid);
        assert_eq!(till.catalog().find_by_sku("STP-RIC-HMT-25").unwrap().stock, 8);
        assert_eq!(till.catalog().find_by_sku("SPC-SAL-TAT-1").unwrap().stock, 0);
        assert_eq!(till.ledger().bills().len(), 1);
    }

    #[test]
    fn empty_sale_changes_nothing() {
        let mut till = till();
        let before: Vec<Product> = till.catalog().products().to_vec();
        assert!(till.finalize(&[], PaymentMode::Cash).is_none());
        assert!(till.ledger().bills().is_empty());
        assert_eq!(till.catalog().products(), before.as_slice());
    }

    #[test]
    fn repeated_sku_decrements_summed_quantity_floored_at_zero() {
        let mut till = till();
        let items = vec![
            LineItem::new("Sugar", 2.0, "kg"),
            LineItem::new("madhur sugar 1kg", 2.0, "kg"),
            LineItem::new("Salt", 3.0, "pkt"),
        ];
        let bill = till.finalize(&items, PaymentMode::Credit).unwrap();

        assert_eq!(till.catalog().find_by_sku("STP-SUG-1").unwrap().stock, 1);
        assert_eq!(till.catalog().find_by_sku("SPC-SAL-TAT-1").unwrap().stock, 0);
        let expected: f64 = bill.items.iter().map(|i| i.quantity * i.unit_price).sum();
        assert_eq!(bill.total, expected);
        assert_eq!(bill.status, BillStatus::Pending);
    }

    #[test]
    fn unknown_items_are_billed_but_touch_no_stock() {
        let mut till = till();
        let before: Vec<Product> = till.catalog().products().to_vec();
        let bill = till
            .finalize(&[LineItem::new("Parle-G", 4.0, "").with_price(10.0)], PaymentMode::Cash)
            .unwrap();

        assert_eq!(bill.items[0].sku, UNKNOWN_SKU);
        assert_eq!(bill.total, 40.0);
        assert_eq!(till.catalog().products(), before.as_slice());
    }

    #[test]
    fn bill_ids_are_unique() {
        let mut till = till();
        let ids: HashSet<String> = (0..50)
            .filter_map(|_| till.finalize(&[LineItem::new("Rice", 1.0, "")], PaymentMode::Cash))
            .map(|bill| bill.id)
            .collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn void_removes_the_bill_entirely() {
        let mut till = till();
        let first = till.finalize(&[LineItem::new("Rice", 1.0, "")], PaymentMode::Cash).unwrap();
        let second = till.finalize(&[LineItem::new("Salt", 1.0, "")], PaymentMode::Cash).unwrap();

        assert_eq!(till.ledger().bills()[0].id, second.id);
        assert_eq!(till.void(&first.id).unwrap().id, first.id);
        assert!(till.ledger().bills().iter().all(|bill| bill.id != first.id));
        assert!(till.void(&first.id).is_none());
        assert_eq!(till.ledger().bills().len(), 1);
    }

    #[test]
    fn catalog_loads_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        fs::write(
            &path,
            "- sku: SPC-SAL-TAT-1\n  name: Tata Salt 1kg\n  category: Spices\n  stock: 12\n  price: 28\n  unit: pcs\n",
        )
        .unwrap();

        let catalog = Catalog::load(&path).unwrap();
        assert_eq!(catalog.products().len(), 1);
        assert_eq!(catalog.find_by_sku("SPC-SAL-TAT-1").unwrap().stock, 12);
    }
}
