use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Sku given to bill items that matched nothing in the catalog.
pub const UNKNOWN_SKU: &str = "UNKNOWN";

/// Unit used when neither the speaker nor the catalog names one.
pub const DEFAULT_UNIT: &str = "pcs";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    RecordSale,
    FinalizeSale,
    StockCheck,
    Error,
}

impl Intent {
    /// Maps the extractor's intent label. Anything unrecognised is an `Error` turn.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "record_sale" => Intent::RecordSale,
            "finalize_sale" => Intent::FinalizeSale,
            "stock_check" => Intent::StockCheck,
            _ => Intent::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    #[default]
    Cash,
    Credit,
}

impl PaymentMode {
    /// "udhaar" is how store credit is asked for at the counter.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(PaymentMode::Cash),
            "credit" | "udhaar" | "udhar" => Some(PaymentMode::Credit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Paid,
    Pending,
}

impl BillStatus {
    pub fn for_payment(mode: PaymentMode) -> Self {
        match mode {
            PaymentMode::Cash => BillStatus::Paid,
            PaymentMode::Credit => BillStatus::Pending,
        }
    }
}

/// One item as heard by the extractor, not yet checked against the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub product_name: String,
    pub quantity: f64,
    pub unit: String,
    pub estimated_price: Option<f64>,
}

impl LineItem {
    pub fn new(product_name: impl Into<String>, quantity: f64, unit: impl Into<String>) -> Self {
        Self {
            product_name: product_name.into(),
            quantity,
            unit: unit.into(),
            estimated_price: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.estimated_price = Some(price);
        self
    }

    /// Quantity to bill; anything that is not a positive finite number counts as one.
    pub fn billable_quantity(&self) -> f64 {
        sanitize_quantity(self.quantity)
    }
}

pub fn sanitize_quantity(quantity: f64) -> f64 {
    if quantity.is_finite() && quantity > 0.0 {
        quantity
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub stock: u32,
    pub price: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillItem {
    pub sku: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub unit: String,
}

impl BillItem {
    pub fn line_total(&self) -> f64 {
        self.quantity * self.unit_price
    }

    pub fn is_unknown(&self) -> bool {
        self.sku == UNKNOWN_SKU
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bill {
    pub id: String,
    pub date: SystemTime,
    pub items: Vec<BillItem>,
    pub total: f64,
    pub payment_mode: PaymentMode,
    pub status: BillStatus,
}

/// Structured reading of one utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionResult {
    pub message: String,
    pub intent: Intent,
    pub items: Vec<LineItem>,
    pub payment_mode: Option<PaymentMode>,
}

impl ExtractionResult {
    pub const FALLBACK_MESSAGE: &'static str =
        "Sorry, I didn't catch that. Could you say it again?";

    /// What the session sees when the extractor could not be reached or understood.
    pub fn fallback() -> Self {
        Self {
            message: Self::FALLBACK_MESSAGE.to_string(),
            intent: Intent::Error,
            items: Vec::new(),
            payment_mode: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    Listening,
    Processing,
    AwaitingUser,
    PermissionDenied,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: CaptureState,
    pub transcript: String,
    pub pending: Vec<LineItem>,
    pub last_intent: Intent,
    pub assistant_message: Option<String>,
    pub busy: bool,
}
