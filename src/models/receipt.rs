use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Receipt lifecycle status (PG enum `receipt_status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "receipt_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Uploaded,
    Parsing,
    Parsed,
    Extracting,
    Extracted,
    ReviewRequired,
    Approved,
    Posted,
    Failed,
}

impl ReceiptStatus {
    pub const ALL: [ReceiptStatus; 9] = [
        ReceiptStatus::Uploaded,
        ReceiptStatus::Parsing,
        ReceiptStatus::Parsed,
        ReceiptStatus::Extracting,
        ReceiptStatus::Extracted,
        ReceiptStatus::ReviewRequired,
        ReceiptStatus::Approved,
        ReceiptStatus::Posted,
        ReceiptStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Uploaded => "uploaded",
            ReceiptStatus::Parsing => "parsing",
            ReceiptStatus::Parsed => "parsed",
            ReceiptStatus::Extracting => "extracting",
            ReceiptStatus::Extracted => "extracted",
            ReceiptStatus::ReviewRequired => "review_required",
            ReceiptStatus::Approved => "approved",
            ReceiptStatus::Posted => "posted",
            ReceiptStatus::Failed => "failed",
        }
    }

    /// Terminal for automatic processing. `failed` can still be re-entered by a manual retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReceiptStatus::Posted | ReceiptStatus::Failed)
    }

    /// Claimed by a worker and mid-pipeline
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ReceiptStatus::Parsing | ReceiptStatus::Parsed | ReceiptStatus::Extracting
        )
    }

    /// States from which approve-and-post may proceed
    pub fn is_postable(&self) -> bool {
        matches!(
            self,
            ReceiptStatus::Extracted | ReceiptStatus::ReviewRequired | ReceiptStatus::Approved
        )
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receipt row
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Receipt {
    pub id: Uuid,
    pub storage_key: String,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub file_hash: String,
    pub duplicate_seq: i32,
    pub status: ReceiptStatus,
    pub parsed_text: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
    pub supplier_guess: Option<String>,
    pub total_guess: Option<BigDecimal>,
    pub currency_guess: Option<String>,
    pub purchased_at_guess: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub card_last4: Option<String>,
    pub review_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub retry_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expense_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Receipt {
    pub fn guesses(&self) -> ReceiptGuesses {
        ReceiptGuesses {
            supplier_name: self.supplier_guess.clone(),
            total_amount: self.total_guess.clone(),
            currency: self.currency_guess.clone(),
            purchased_at: self.purchased_at_guess,
        }
    }
}

/// Best-effort guesses taken from an extraction, before human confirmation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptGuesses {
    pub supplier_name: Option<String>,
    pub total_amount: Option<BigDecimal>,
    pub currency: Option<String>,
    pub purchased_at: Option<DateTime<Utc>>,
}

/// Payment hints printed on the receipt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentHints {
    pub method: Option<String>,
    pub card_last4: Option<String>,
}

impl PaymentHints {
    /// Keep only the last four digits of whatever card text the provider returned
    pub fn mask_card(raw: &str) -> Option<String> {
        let digits: Vec<char> = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        let start = digits.len().saturating_sub(4);
        Some(digits[start..].iter().collect())
    }
}

/// Outcome of an upload through the dedup gate
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub receipt_id: Uuid,
    pub status: ReceiptStatus,
    pub duplicate: bool,
}

/// Status view returned to pollers
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptView {
    pub id: Uuid,
    pub status: ReceiptStatus,
    pub file_hash: String,
    pub duplicate_seq: i32,
    pub original_filename: Option<String>,
    pub guesses: ReceiptGuesses,
    pub payment: PaymentHints,
    pub raw_payload: Option<serde_json::Value>,
    pub review_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub retry_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub expense_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Receipt> for ReceiptView {
    fn from(r: Receipt) -> Self {
        Self {
            id: r.id,
            status: r.status,
            file_hash: r.file_hash,
            duplicate_seq: r.duplicate_seq,
            original_filename: r.original_filename,
            guesses: ReceiptGuesses {
                supplier_name: r.supplier_guess,
                total_amount: r.total_guess,
                currency: r.currency_guess,
                purchased_at: r.purchased_at_guess,
            },
            payment: PaymentHints {
                method: r.payment_method,
                card_last4: r.card_last4,
            },
            raw_payload: r.raw_payload,
            review_data: r.review_data,
            error_message: r.error_message,
            error_details: r.error_details,
            retry_count: r.retry_count,
            next_attempt_at: r.next_attempt_at,
            expense_id: r.expense_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_card_keeps_last_four_digits() {
        assert_eq!(PaymentHints::mask_card("**** **** **** 1234"), Some("1234".to_string()));
        assert_eq!(PaymentHints::mask_card("VISA 4111111111111111"), Some("1111".to_string()));
        assert_eq!(PaymentHints::mask_card("xx87"), Some("87".to_string()));
        assert_eq!(PaymentHints::mask_card("none"), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(ReceiptStatus::Posted.is_terminal());
        assert!(ReceiptStatus::Failed.is_terminal());
        assert!(!ReceiptStatus::ReviewRequired.is_terminal());
        assert!(ReceiptStatus::Extracting.is_in_flight());
        assert!(ReceiptStatus::Approved.is_postable());
        assert!(!ReceiptStatus::Failed.is_postable());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ReceiptStatus::ReviewRequired).unwrap();
        assert_eq!(json, "\"review_required\"");
        assert_eq!(ReceiptStatus::ReviewRequired.to_string(), "review_required");
    }
}
