use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::ReceiptGuesses;

/// Supplier, keyed by its normalized name
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Supplier {
    pub id: Uuid,
    pub name: String,
    pub normalized_key: String,
}

/// Payer, keyed by (type, normalized label)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payer {
    pub id: Uuid,
    pub payer_type: String,
    pub label: String,
    pub normalized_label: String,
}

/// Expense row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Expense {
    pub id: Uuid,
    pub receipt_id: Option<Uuid>,
    pub supplier_id: Uuid,
    pub payer_id: Uuid,
    pub purchased_at: DateTime<Utc>,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub is_posted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Expense line item
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExpenseItem {
    pub id: Uuid,
    pub expense_id: Uuid,
    pub position: i32,
    pub raw_label: String,
    pub article_id: Option<Uuid>,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: BigDecimal,
}

/// Reviewed field values submitted for approval/posting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewData {
    pub supplier_id: Option<Uuid>,
    pub supplier_name: Option<String>,
    pub payer_id: Option<Uuid>,
    pub payer_label: Option<String>,
    pub payer_type: Option<String>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub total_amount: Option<BigDecimal>,
    pub currency: Option<String>,
    #[serde(default)]
    pub items: Vec<ReviewItem>,
    /// Fill missing header fields from the receipt's extraction guesses
    #[serde(default)]
    pub use_guesses: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewItem {
    pub raw_label: Option<String>,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: Option<BigDecimal>,
}

/// Field-level validation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupplierRef {
    Id(Uuid),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayerRef {
    Id(Uuid),
    New { payer_type: String, label: String },
}

/// Review data that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedReview {
    pub supplier: SupplierRef,
    pub payer: PayerRef,
    pub purchased_at: DateTime<Utc>,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub items: Vec<ValidatedItem>,
}

#[derive(Debug, Clone)]
pub struct ValidatedItem {
    pub raw_label: String,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: BigDecimal,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl ReviewData {
    /// Nothing submitted at all
    pub fn is_empty(&self) -> bool {
        self.supplier_id.is_none()
            && self.supplier_name.is_none()
            && self.payer_id.is_none()
            && self.payer_label.is_none()
            && self.payer_type.is_none()
            && self.purchased_at.is_none()
            && self.total_amount.is_none()
            && self.currency.is_none()
            && self.items.is_empty()
            && !self.use_guesses
    }

    /// Fill absent header fields from extraction guesses. Explicit review values win.
    pub fn merge_guesses(mut self, guesses: &ReceiptGuesses) -> Self {
        if self.supplier_id.is_none() && non_blank(&self.supplier_name).is_none() {
            self.supplier_name = guesses.supplier_name.clone();
        }
        if self.total_amount.is_none() {
            self.total_amount = guesses.total_amount.clone();
        }
        if self.currency.is_none() {
            self.currency = guesses.currency.clone();
        }
        if self.purchased_at.is_none() {
            self.purchased_at = guesses.purchased_at;
        }
        self
    }

    /// Check every field a valid expense needs. Returns all problems at once.
    pub fn validate(
        &self,
        default_currency: &str,
        default_payer_type: Option<&str>,
    ) -> Result<ValidatedReview, Vec<FieldError>> {
        let mut errors = Vec::new();

        let supplier = match (self.supplier_id, non_blank(&self.supplier_name)) {
            (Some(id), _) => Some(SupplierRef::Id(id)),
            (None, Some(name)) => Some(SupplierRef::Name(name)),
            (None, None) => {
                errors.push(FieldError::new("supplier", "supplier_id or supplier_name is required"));
                None
            }
        };

        let payer = match (self.payer_id, non_blank(&self.payer_label)) {
            (Some(id), _) => Some(PayerRef::Id(id)),
            (None, Some(label)) => {
                let payer_type = non_blank(&self.payer_type)
                    .or_else(|| default_payer_type.map(str::to_string))
                    .unwrap_or_else(|| "other".to_string())
                    .to_lowercase();
                Some(PayerRef::New { payer_type, label })
            }
            (None, None) => {
                errors.push(FieldError::new("payer", "payer_id or payer_label is required"));
                None
            }
        };

        if self.purchased_at.is_none() {
            errors.push(FieldError::new("purchased_at", "purchase timestamp is required"));
        }

        match &self.total_amount {
            None => errors.push(FieldError::new("total_amount", "total amount is required")),
            Some(total) if *total < BigDecimal::zero() => {
                errors.push(FieldError::new("total_amount", "total amount must not be negative"))
            }
            Some(_) => {}
        }

        let currency = non_blank(&self.currency)
            .unwrap_or_else(|| default_currency.to_string())
            .to_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            errors.push(FieldError::new("currency", "currency must be a three-letter code"));
        }

        let mut items = Vec::with_capacity(self.items.len());
        for (idx, item) in self.items.iter().enumerate() {
            let label = non_blank(&item.raw_label);
            if label.is_none() {
                errors.push(FieldError::new(format!("items[{}].raw_label", idx), "label is required"));
            }
            if item.line_total.is_none() {
                errors.push(FieldError::new(format!("items[{}].line_total", idx), "line total is required"));
            }
            if matches!(&item.quantity, Some(q) if *q < BigDecimal::zero()) {
                errors.push(FieldError::new(format!("items[{}].quantity", idx), "quantity must not be negative"));
            }
            if matches!(&item.unit_price, Some(p) if *p < BigDecimal::zero()) {
                errors.push(FieldError::new(format!("items[{}].unit_price", idx), "unit price must not be negative"));
            }
            if let (Some(raw_label), Some(line_total)) = (label, item.line_total.clone()) {
                items.push(ValidatedItem {
                    raw_label,
                    quantity: item.quantity.clone(),
                    unit_price: item.unit_price.clone(),
                    line_total,
                });
            }
        }

        match (supplier, payer, self.purchased_at, self.total_amount.clone()) {
            (Some(supplier), Some(payer), Some(purchased_at), Some(total_amount)) if errors.is_empty() => {
                Ok(ValidatedReview {
                    supplier,
                    payer,
                    purchased_at,
                    total_amount,
                    currency,
                    items,
                })
            }
            _ => Err(errors),
        }
    }
}

/// Result of approve-and-post
#[derive(Debug, Clone, Serialize)]
pub struct PostOutcome {
    pub expense: Expense,
    pub items: Vec<ExpenseItem>,
    pub price_observations: usize,
    pub already_posted: bool,
}
