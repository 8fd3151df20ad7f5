use shared::{ExtractionResult, Intent, LineItem, PaymentMode};

/// What the controller should do after a turn has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Continue,
    Finalize,
}

/// Items heard so far in the open session, in speaking order.
#[derive(Debug, Default)]
pub struct PendingSale {
    items: Vec<LineItem>,
    last_intent: Intent,
    payment_mode: Option<PaymentMode>,
}

impl PendingSale {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repeated products are kept as separate entries.
    pub fn apply(&mut self, result: &ExtractionResult) -> TurnOutcome {
        if let Some(mode) = result.payment_mode {
            self.payment_mode = Some(mode);
        }

        if result.intent == Intent::FinalizeSale {
            return TurnOutcome::Finalize;
        }

        if !result.items.is_empty() {
            self.items.extend(result.items.iter().cloned());
            self.last_intent = result.intent;
        }

        TurnOutcome::Continue
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last_intent(&self) -> Intent {
        self.last_intent
    }

    pub fn payment_mode(&self) -> PaymentMode {
        self.payment_mode.unwrap_or_default()
    }

    /// Hands over everything accumulated and leaves the sale empty.
    pub fn take(&mut self) -> (Vec<LineItem>, PaymentMode) {
        let mode = self.payment_mode();
        let items = std::mem::take(&mut self.items);
        self.clear();
        (items, mode)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
