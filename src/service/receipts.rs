use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{self, ReceiptUpdate};
use crate::error::{AppError, AppResult};
use crate::models::{Receipt, ReceiptStatus, ReceiptView};
use crate::service::state_machine;

/// Receipt lookup and manual retry
pub struct ReceiptService {
    pool: PgPool,
}

impl ReceiptService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, receipt_id: Uuid) -> AppResult<Receipt> {
        db::get_receipt(&self.pool, receipt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("receipt {}", receipt_id)))
    }

    pub async fn view(&self, receipt_id: Uuid) -> AppResult<ReceiptView> {
        Ok(self.get(receipt_id).await?.into())
    }

    /// Put a failed receipt back in the queue with a fresh failure budget.
    /// The last error stays visible until the next run replaces it.
    pub async fn retry(&self, receipt_id: Uuid) -> AppResult<Receipt> {
        let receipt = self.get(receipt_id).await?;
        if receipt.status != ReceiptStatus::Failed {
            return Err(AppError::Conflict(format!(
                "receipt {} is {}; only failed receipts can be retried",
                receipt_id, receipt.status
            )));
        }
        let update = ReceiptUpdate {
            retry_count: Some(0),
            next_attempt_at: Some(None),
            ..Default::default()
        };
        let receipt =
            state_machine::transition(&self.pool, receipt_id, ReceiptStatus::Failed, ReceiptStatus::Uploaded, &update)
                .await?;
        tracing::info!(receipt_id = %receipt_id, "manual retry requested");
        Ok(receipt)
    }
}
