use crate::models::{PaymentHints, Receipt, ReceiptGuesses, ReceiptStatus};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;
use uuid::Uuid;

/// Columns written alongside a status change. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct ReceiptUpdate {
    pub parsed_text: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
    pub guesses: Option<ReceiptGuesses>,
    pub payment: Option<PaymentHints>,
    pub review_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub clear_error: bool,
    pub retry_count: Option<i32>,
    /// `Some(None)` clears the schedule
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    /// Only set while the stored link is still empty
    pub expense_id: Option<Uuid>,
}

/// New receipt row
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub id: Uuid,
    pub storage_key: String,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub file_hash: String,
    pub duplicate_seq: i32,
}

pub async fn get_receipt(pool: &PgPool, receipt_id: Uuid) -> Result<Option<Receipt>, sqlx::Error> {
    sqlx::query_as::<_, Receipt>("SELECT * FROM receipts WHERE id = $1")
        .bind(receipt_id)
        .fetch_optional(pool)
        .await
}

/// Original (non-override) receipt for a content hash
pub async fn find_by_hash(pool: &PgPool, file_hash: &str) -> Result<Option<Receipt>, sqlx::Error> {
    sqlx::query_as::<_, Receipt>(
        r#"
        SELECT * FROM receipts
        WHERE file_hash = $1
        ORDER BY duplicate_seq ASC
        LIMIT 1
        "#,
    )
    .bind(file_hash)
    .fetch_optional(pool)
    .await
}

/// Next disambiguator for an explicit duplicate upload
pub async fn next_duplicate_seq(pool: &PgPool, file_hash: &str) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar::<_, i32>(
        "SELECT COALESCE(MAX(duplicate_seq) + 1, 0) FROM receipts WHERE file_hash = $1",
    )
    .bind(file_hash)
    .fetch_one(pool)
    .await
}

/// Insert a receipt in status `uploaded`. Fails with a unique violation on (hash, seq).
pub async fn insert_receipt(pool: &PgPool, receipt: &NewReceipt) -> Result<Receipt, sqlx::Error> {
    sqlx::query_as::<_, Receipt>(
        r#"
        INSERT INTO receipts (id, storage_key, original_filename, mime_type, file_hash, duplicate_seq, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'uploaded')
        RETURNING *
        "#,
    )
    .bind(receipt.id)
    .bind(&receipt.storage_key)
    .bind(&receipt.original_filename)
    .bind(&receipt.mime_type)
    .bind(&receipt.file_hash)
    .bind(receipt.duplicate_seq)
    .fetch_one(pool)
    .await
}

const CLAIMABLE: &str = r#"
    (
        status = 'uploaded'
        OR (status = 'failed' AND next_attempt_at IS NOT NULL AND next_attempt_at <= now())
        OR (status IN ('parsing', 'parsed', 'extracting') AND claimed_at < $1)
    )
"#;

/// Receipts the worker may claim, oldest first
pub async fn list_claimable(
    pool: &PgPool,
    stale_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let sql = format!(
        "SELECT id FROM receipts WHERE {} ORDER BY created_at ASC LIMIT $2",
        CLAIMABLE
    );
    sqlx::query_scalar::<_, Uuid>(&sql)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Atomically move a claimable receipt to `parsing`. `None` means someone else has it.
pub async fn claim_receipt(
    pool: &PgPool,
    receipt_id: Uuid,
    stale_before: DateTime<Utc>,
) -> Result<Option<Receipt>, sqlx::Error> {
    let sql = format!(
        r#"
        UPDATE receipts
        SET status = 'parsing', claimed_at = now(), updated_at = now()
        WHERE id = $2 AND {}
        RETURNING *
        "#,
        CLAIMABLE
    );
    sqlx::query_as::<_, Receipt>(&sql)
        .bind(stale_before)
        .bind(receipt_id)
        .fetch_optional(pool)
        .await
}

/// Status-gated update: applies only while the row is still in `from`
pub async fn update_receipt<'e, E>(
    executor: E,
    receipt_id: Uuid,
    from: ReceiptStatus,
    to: ReceiptStatus,
    update: &ReceiptUpdate,
) -> Result<Option<Receipt>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let guesses = update.guesses.clone().unwrap_or_default();
    let payment = update.payment.clone().unwrap_or_default();
    let (set_next_attempt, next_attempt_at) = match update.next_attempt_at {
        Some(at) => (true, at),
        None => (false, None),
    };

    sqlx::query_as::<_, Receipt>(
        r#"
        UPDATE receipts SET
            status = $3,
            parsed_text = COALESCE($4, parsed_text),
            raw_payload = COALESCE($5, raw_payload),
            supplier_guess = CASE WHEN $6 THEN $7 ELSE supplier_guess END,
            total_guess = CASE WHEN $6 THEN $8 ELSE total_guess END,
            currency_guess = CASE WHEN $6 THEN $9 ELSE currency_guess END,
            purchased_at_guess = CASE WHEN $6 THEN $10 ELSE purchased_at_guess END,
            payment_method = CASE WHEN $11 THEN $12 ELSE payment_method END,
            card_last4 = CASE WHEN $11 THEN $13 ELSE card_last4 END,
            review_data = COALESCE($14, review_data),
            error_message = CASE WHEN $15 THEN NULL ELSE COALESCE($16, error_message) END,
            error_details = CASE WHEN $15 THEN NULL ELSE COALESCE($17, error_details) END,
            retry_count = COALESCE($18, retry_count),
            next_attempt_at = CASE WHEN $19 THEN $20 ELSE next_attempt_at END,
            expense_id = COALESCE(expense_id, $21),
            claimed_at = CASE WHEN $22 THEN now() ELSE NULL END,
            updated_at = now()
        WHERE id = $1 AND status = $2
        RETURNING *
        "#,
    )
    .bind(receipt_id)
    .bind(from)
    .bind(to)
    .bind(&update.parsed_text)
    .bind(&update.raw_payload)
    .bind(update.guesses.is_some())
    .bind(guesses.supplier_name)
    .bind(guesses.total_amount)
    .bind(guesses.currency)
    .bind(guesses.purchased_at)
    .bind(update.payment.is_some())
    .bind(payment.method)
    .bind(payment.card_last4)
    .bind(&update.review_data)
    .bind(update.clear_error)
    .bind(&update.error_message)
    .bind(&update.error_details)
    .bind(update.retry_count)
    .bind(set_next_attempt)
    .bind(next_attempt_at)
    .bind(update.expense_id)
    .bind(to.is_in_flight())
    .fetch_optional(executor)
    .await
}

/// Row-lock a receipt for the posting transaction
pub async fn lock_receipt<'e, E>(executor: E, receipt_id: Uuid) -> Result<Option<Receipt>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Receipt>("SELECT * FROM receipts WHERE id = $1 FOR UPDATE")
        .bind(receipt_id)
        .fetch_optional(executor)
        .await
}
