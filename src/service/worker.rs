//! Background processing worker.
//!
//! Polls for claimable receipts on a fixed interval and drives each one through
//! parse -> extract. A receipt is only worked on after an atomic claim
//! (conditional UPDATE to `parsing`); a lost claim is skipped silently. Stale
//! claims left behind by a crashed worker become claimable again after
//! `stale_claim_after`.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{self, ReceiptUpdate};
use crate::error::AppResult;
use crate::models::{PaymentHints, Receipt, ReceiptGuesses, ReceiptStatus};
use crate::service::extraction_client::{ExtractionClient, ExtractionFailure};
use crate::service::review_policy::ReviewPolicy;
use crate::service::state_machine;
use crate::service::storage::{Storage, StorageError};

/// Automatic retry schedule for failed receipts
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub delays: Vec<Duration>,
    /// failed runs after which only a manual retry helps
    pub max_failures: u32,
}

/// Where a receipt stands after a failed run
#[derive(Debug, Clone, PartialEq)]
pub struct FailureDisposition {
    pub retry_count: i32,
    /// `None`: stays failed until a manual retry
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl RetrySchedule {
    pub fn after_failure(&self, previous_failures: i32, retryable: bool, now: DateTime<Utc>) -> FailureDisposition {
        let retry_count = previous_failures.saturating_add(1);
        if !retryable || self.delays.is_empty() || retry_count >= self.max_failures as i32 {
            return FailureDisposition {
                retry_count,
                next_attempt_at: None,
            };
        }
        let idx = (retry_count as usize - 1).min(self.delays.len() - 1);
        let delay = chrono::Duration::from_std(self.delays[idx]).unwrap_or_else(|_| chrono::Duration::zero());
        FailureDisposition {
            retry_count,
            next_attempt_at: Some(now + delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub concurrency: usize,
    pub parse_step: bool,
    pub stale_claim_after: Duration,
    pub schedule: RetrySchedule,
}

impl WorkerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        let worker = &config.worker;
        Self {
            poll_interval: Duration::from_secs(worker.poll_interval_secs.max(1)),
            batch_size: worker.batch_size.max(1),
            concurrency: worker.concurrency.max(1),
            parse_step: config.extraction.parse_step,
            stale_claim_after: Duration::from_secs(worker.stale_claim_secs),
            schedule: RetrySchedule {
                delays: worker.retry_delays_secs.iter().copied().map(Duration::from_secs).collect(),
                max_failures: worker.max_failures,
            },
        }
    }
}

/// A pipeline step that failed for this receipt
#[derive(Debug)]
struct StepFailure {
    at: ReceiptStatus,
    message: String,
    details: Value,
    raw_payload: Option<Value>,
    retryable: bool,
}

impl StepFailure {
    fn extraction(at: ReceiptStatus, failure: ExtractionFailure) -> Self {
        Self {
            at,
            message: failure.to_string(),
            details: failure.details(),
            raw_payload: None,
            retryable: failure.error.is_retryable(),
        }
    }
}

pub struct ProcessingWorker {
    pool: PgPool,
    storage: Arc<dyn Storage>,
    client: Arc<ExtractionClient>,
    policy: Arc<dyn ReviewPolicy>,
    config: WorkerConfig,
}

impl ProcessingWorker {
    pub fn new(
        pool: PgPool,
        storage: Arc<dyn Storage>,
        client: Arc<ExtractionClient>,
        policy: Arc<dyn ReviewPolicy>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            storage,
            client,
            policy,
            config,
        }
    }

    /// Poll until the shutdown flag flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "processing worker started: poll every {:?}, batch {}, concurrency {}",
            self.config.poll_interval,
            self.config.batch_size,
            self.config.concurrency
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.tick().await {
                Ok(0) => {}
                Ok(processed) => tracing::info!("worker tick processed {} receipt(s)", processed),
                Err(e) => tracing::error!("worker tick failed: {}", e),
            }
        }
        tracing::info!("processing worker stopped");
    }

    /// One scheduling pass. Returns how many receipts this worker actually claimed.
    pub async fn tick(&self) -> AppResult<usize> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.config.stale_claim_after).unwrap_or_else(|_| chrono::Duration::zero());
        let ids = db::list_claimable(&self.pool, stale_before, self.config.batch_size).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let processed = AtomicUsize::new(0);
        futures::stream::iter(ids)
            .for_each_concurrent(self.config.concurrency, |receipt_id| {
                let processed = &processed;
                async move {
                    match self.process(receipt_id, stale_before).await {
                        Ok(Some(_)) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::error!(receipt_id = %receipt_id, "processing aborted: {}", e),
                    }
                }
            })
            .await;
        Ok(processed.into_inner())
    }

    /// Claim and drive one receipt. `None` when the claim was lost.
    pub async fn process(&self, receipt_id: Uuid, stale_before: DateTime<Utc>) -> AppResult<Option<Receipt>> {
        let Some(receipt) = db::claim_receipt(&self.pool, receipt_id, stale_before).await? else {
            tracing::debug!(receipt_id = %receipt_id, "receipt already claimed, skipping");
            return Ok(None);
        };
        tracing::info!(receipt_id = %receipt_id, retry_count = receipt.retry_count, "receipt claimed");

        match self.drive(&receipt).await? {
            Ok(done) => Ok(Some(done)),
            Err(failure) => self.fail(&receipt, failure).await.map(Some),
        }
    }

    async fn drive(&self, receipt: &Receipt) -> AppResult<Result<Receipt, StepFailure>> {
        let bytes = match self.storage.get(&receipt.storage_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(Err(StepFailure {
                    at: ReceiptStatus::Parsing,
                    message: format!("stored file unavailable: {}", e),
                    details: json!({ "operation": "load", "class": "storage", "message": e.to_string() }),
                    raw_payload: None,
                    retryable: matches!(e, StorageError::Io(_)),
                }))
            }
        };
        let mime_type = receipt.mime_type.as_deref().unwrap_or("application/octet-stream");

        // parse: reuse text from an earlier run when there is one
        let parsed_text = match (self.config.parse_step, &receipt.parsed_text) {
            (false, _) => None,
            (true, Some(text)) => Some(text.clone()),
            (true, None) => match self.client.parse(&bytes, mime_type).await {
                Ok(text) => Some(text),
                Err(failure) => return Ok(Err(StepFailure::extraction(ReceiptStatus::Parsing, failure))),
            },
        };

        let update = ReceiptUpdate {
            parsed_text: parsed_text.clone(),
            ..Default::default()
        };
        state_machine::transition(&self.pool, receipt.id, ReceiptStatus::Parsing, ReceiptStatus::Parsed, &update)
            .await?;
        state_machine::transition(
            &self.pool,
            receipt.id,
            ReceiptStatus::Parsed,
            ReceiptStatus::Extracting,
            &ReceiptUpdate::default(),
        )
        .await?;

        let extracted = match &parsed_text {
            Some(text) => self.client.extract_text(text).await,
            None => self.client.extract_document(&bytes, mime_type).await,
        };
        let payload = match extracted {
            Ok(payload) => payload,
            Err(failure) => return Ok(Err(StepFailure::extraction(ReceiptStatus::Extracting, failure))),
        };

        let extraction = match self.client.schema().validate(&payload) {
            Ok(extraction) => extraction,
            Err(rejection) => {
                return Ok(Err(StepFailure {
                    at: ReceiptStatus::Extracting,
                    message: rejection.to_string(),
                    details: json!({
                        "operation": "validate",
                        "class": "schema_rejected",
                        "schema": self.client.schema().id(),
                        "message": rejection.0,
                    }),
                    raw_payload: Some(payload),
                    retryable: false,
                }))
            }
        };

        let review_reason = self.policy.review_reason(&extraction);
        let mut update = ReceiptUpdate {
            raw_payload: Some(payload),
            guesses: Some(ReceiptGuesses {
                supplier_name: extraction.supplier_name.clone(),
                total_amount: extraction.total_amount.clone(),
                currency: extraction.currency.clone(),
                purchased_at: extraction.purchased_at,
            }),
            payment: Some(PaymentHints {
                method: extraction.payment_method.clone(),
                card_last4: extraction.card_last4.as_deref().and_then(PaymentHints::mask_card),
            }),
            clear_error: true,
            next_attempt_at: Some(None),
            ..Default::default()
        };
        let to = match &review_reason {
            Some(reason) => {
                update.clear_error = false;
                update.error_message = Some(format!("review required: {}", reason));
                update.error_details = Some(json!({
                    "review_reason": reason,
                    "missing_required": extraction.missing_required,
                    "issues": extraction.issues,
                    "confidence": extraction.confidence,
                }));
                ReceiptStatus::ReviewRequired
            }
            None => ReceiptStatus::Extracted,
        };

        let done = state_machine::transition(&self.pool, receipt.id, ReceiptStatus::Extracting, to, &update).await?;
        tracing::info!(
            receipt_id = %receipt.id,
            status = %done.status,
            items = extraction.items.len(),
            "receipt extracted"
        );
        Ok(Ok(done))
    }

    async fn fail(&self, receipt: &Receipt, failure: StepFailure) -> AppResult<Receipt> {
        let disposition = self
            .config
            .schedule
            .after_failure(receipt.retry_count, failure.retryable, Utc::now());
        let update = ReceiptUpdate {
            raw_payload: failure.raw_payload,
            error_message: Some(failure.message.clone()),
            error_details: Some(failure.details),
            retry_count: Some(disposition.retry_count),
            next_attempt_at: Some(disposition.next_attempt_at),
            ..Default::default()
        };
        let failed =
            state_machine::transition(&self.pool, receipt.id, failure.at, ReceiptStatus::Failed, &update).await?;

        match disposition.next_attempt_at {
            Some(at) => tracing::warn!(
                receipt_id = %receipt.id,
                retry_count = disposition.retry_count,
                next_attempt_at = %at,
                "receipt processing failed, will retry: {}",
                failure.message
            ),
            None => tracing::error!(
                receipt_id = %receipt.id,
                retry_count = disposition.retry_count,
                "receipt processing failed, manual retry required: {}",
                failure.message
            ),
        }
        Ok(failed)
    }
}
