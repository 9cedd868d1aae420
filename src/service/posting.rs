//! Review and approve-and-post.
//!
//! Posting materializes the expense, its items and their price observations, and
//! moves the receipt to `posted`, all in one transaction. Two guards make it
//! idempotent: the receipt row is locked and its status re-checked inside the
//! transaction, and the database allows one live posted expense per receipt.

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::db::{self, ReceiptUpdate};
use crate::error::{is_unique_violation, AppError, AppResult};
use crate::models::{
    Expense, ExpenseItem, FieldError, Payer, PayerRef, PostOutcome, Receipt, ReceiptStatus,
    ReviewData, Supplier, SupplierRef, ValidatedReview,
};
use crate::service::article_resolver::{self, normalize_key, ObservationSource};
use crate::service::state_machine;

pub struct PostingService {
    pool: PgPool,
    default_currency: String,
}

impl PostingService {
    pub fn new(pool: PgPool, default_currency: impl Into<String>) -> Self {
        Self {
            pool,
            default_currency: default_currency.into(),
        }
    }

    /// Validate review data against the receipt it is for. An empty body falls
    /// back to the draft stored by `approve`.
    fn validated(&self, receipt: &Receipt, review: ReviewData) -> AppResult<(ValidatedReview, ReviewData)> {
        let review = match (&receipt.review_data, review.is_empty()) {
            (Some(draft), true) => serde_json::from_value(draft.clone())
                .map_err(|e| AppError::Internal(format!("stored review draft is unreadable: {}", e)))?,
            _ => review,
        };
        let (review, payer_hint) = if review.use_guesses {
            (review.merge_guesses(&receipt.guesses()), receipt.payment_method.as_deref())
        } else {
            (review, None)
        };
        let validated = review
            .validate(&self.default_currency, payer_hint)
            .map_err(AppError::Validation)?;
        Ok((validated, review))
    }

    async fn receipt(&self, receipt_id: Uuid) -> AppResult<Receipt> {
        db::get_receipt(&self.pool, receipt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("receipt {}", receipt_id)))
    }

    /// Store reviewed values as the draft and move the receipt to `approved` without posting
    pub async fn approve(&self, receipt_id: Uuid, review: ReviewData) -> AppResult<Receipt> {
        let receipt = self.receipt(receipt_id).await?;
        state_machine::check_transition(receipt.status, ReceiptStatus::Approved)?;
        let (_, review) = self.validated(&receipt, review)?;
        let update = ReceiptUpdate {
            review_data: Some(serde_json::to_value(&review).map_err(|e| AppError::Internal(e.to_string()))?),
            ..Default::default()
        };
        let approved =
            state_machine::transition(&self.pool, receipt_id, receipt.status, ReceiptStatus::Approved, &update).await?;
        tracing::info!(receipt_id = %receipt_id, "receipt approved");
        Ok(approved)
    }

    /// Post a reviewed receipt. A repeated call returns the existing expense whatever its body.
    pub async fn approve_and_post(&self, receipt_id: Uuid, review: ReviewData) -> AppResult<PostOutcome> {
        let receipt = self.receipt(receipt_id).await?;
        if receipt.status == ReceiptStatus::Posted {
            return self.existing_outcome(&receipt).await;
        }
        ensure_postable(&receipt)?;
        let (validated, review) = self.validated(&receipt, review)?;

        let mut tx = self.pool.begin().await?;

        let receipt = db::lock_receipt(&mut *tx, receipt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("receipt {}", receipt_id)))?;
        if receipt.status == ReceiptStatus::Posted {
            tx.rollback().await?;
            return self.existing_outcome(&receipt).await;
        }
        ensure_postable(&receipt)?;

        let supplier = resolve_supplier(&mut tx, &validated.supplier).await?;
        let payer = resolve_payer(&mut tx, &validated.payer).await?;

        let expense = Expense {
            id: Uuid::new_v4(),
            receipt_id: Some(receipt_id),
            supplier_id: supplier.id,
            payer_id: payer.id,
            purchased_at: validated.purchased_at,
            total_amount: validated.total_amount.clone(),
            currency: validated.currency.clone(),
            is_posted: true,
            deleted_at: None,
            created_at: Utc::now(),
        };
        let expense = match db::insert_expense(&mut *tx, &expense).await {
            Ok(expense) => expense,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                tracing::warn!(receipt_id = %receipt_id, "receipt already has a posted expense");
                let receipt = self.receipt(receipt_id).await?;
                return self.existing_outcome(&receipt).await;
            }
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::with_capacity(validated.items.len());
        let mut price_observations = 0;
        for (position, line) in validated.items.iter().enumerate() {
            let resolution = article_resolver::resolve(&mut tx, supplier.id, &line.raw_label).await?;
            let item = ExpenseItem {
                id: Uuid::new_v4(),
                expense_id: expense.id,
                position: position as i32,
                raw_label: line.raw_label.clone(),
                article_id: resolution.article_id(),
                quantity: line.quantity.clone(),
                unit_price: line.unit_price.clone(),
                line_total: line.line_total.clone(),
            };
            let item = db::insert_expense_item(&mut *tx, &item).await?;

            if let Some(article_id) = item.article_id {
                let source = ObservationSource {
                    expense_item_id: item.id,
                    supplier_id: supplier.id,
                    observed_at: expense.purchased_at,
                    currency: &expense.currency,
                    quantity: item.quantity.as_ref(),
                    unit_price: item.unit_price.as_ref(),
                    line_total: &item.line_total,
                };
                if article_resolver::record_price_observation(&mut tx, &source, article_id).await? {
                    price_observations += 1;
                }
            }
            items.push(item);
        }

        let update = ReceiptUpdate {
            review_data: Some(serde_json::to_value(&review).map_err(|e| AppError::Internal(e.to_string()))?),
            expense_id: Some(expense.id),
            ..Default::default()
        };
        let posted =
            state_machine::transition(&mut *tx, receipt_id, receipt.status, ReceiptStatus::Posted, &update).await?;
        if posted.expense_id != Some(expense.id) {
            return Err(AppError::Conflict(format!(
                "receipt {} is already linked to expense {:?}",
                receipt_id, posted.expense_id
            )));
        }

        tx.commit().await?;

        let unmapped = items.iter().filter(|i| i.article_id.is_none()).count();
        tracing::info!(
            receipt_id = %receipt_id,
            expense_id = %expense.id,
            items = items.len(),
            unmapped,
            price_observations,
            "receipt posted"
        );

        Ok(PostOutcome {
            expense,
            items,
            price_observations,
            already_posted: false,
        })
    }

    async fn existing_outcome(&self, receipt: &Receipt) -> AppResult<PostOutcome> {
        let expense = match receipt.expense_id {
            Some(expense_id) => db::get_expense(&self.pool, expense_id).await?,
            None => db::find_posted_expense(&self.pool, receipt.id).await?,
        }
        .ok_or_else(|| AppError::Internal(format!("receipt {} is posted but has no expense", receipt.id)))?;
        let items = db::list_expense_items(&self.pool, expense.id).await?;
        tracing::info!(receipt_id = %receipt.id, expense_id = %expense.id, "receipt already posted");
        Ok(PostOutcome {
            expense,
            items,
            price_observations: 0,
            already_posted: true,
        })
    }
}

fn ensure_postable(receipt: &Receipt) -> AppResult<()> {
    if receipt.status.is_postable() {
        return Ok(());
    }
    Err(AppError::Conflict(format!(
        "receipt {} is {}; only extracted, review_required or approved receipts can be posted",
        receipt.id, receipt.status
    )))
}

async fn resolve_supplier(conn: &mut PgConnection, supplier: &SupplierRef) -> AppResult<Supplier> {
    match supplier {
        SupplierRef::Id(id) => db::get_supplier(&mut *conn, *id).await?.ok_or_else(|| {
            AppError::Validation(vec![FieldError::new("supplier_id", "unknown supplier")])
        }),
        SupplierRef::Name(name) => {
            let key = normalize_key(name);
            if key.is_empty() {
                return Err(AppError::Validation(vec![FieldError::new(
                    "supplier_name",
                    "supplier name has no usable characters",
                )]));
            }
            Ok(db::find_or_create_supplier(&mut *conn, name, &key).await?)
        }
    }
}

async fn resolve_payer(conn: &mut PgConnection, payer: &PayerRef) -> AppResult<Payer> {
    match payer {
        PayerRef::Id(id) => db::get_payer(&mut *conn, *id)
            .await?
            .ok_or_else(|| AppError::Validation(vec![FieldError::new("payer_id", "unknown payer")])),
        PayerRef::New { payer_type, label } => {
            let key = normalize_key(label);
            if key.is_empty() {
                return Err(AppError::Validation(vec![FieldError::new(
                    "payer_label",
                    "payer label has no usable characters",
                )]));
            }
            Ok(db::find_or_create_payer(&mut *conn, payer_type, label, &key).await?)
        }
    }
}
