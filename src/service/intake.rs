//! Upload intake: content hashing and the dedup gate.

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{self, NewReceipt};
use crate::error::{is_unique_violation, AppError, AppResult};
use crate::models::{Receipt, UploadOutcome};
use crate::service::storage::Storage;

/// Attempts at picking a fresh disambiguator when overrides race each other
const OVERRIDE_INSERT_ATTEMPTS: usize = 3;

/// Hex-encoded SHA-256 of the file content
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Dedup gate verdict for one upload
#[derive(Debug, Clone)]
pub enum DedupDecision {
    /// First time this content is seen
    New { file_hash: String },
    /// Already uploaded; no new row
    Duplicate { file_hash: String, existing: Box<Receipt> },
    /// Already uploaded, but the caller asked for another row
    Override { file_hash: String, duplicate_seq: i32 },
}

/// Content-hash lookup ahead of any processing. Creates nothing.
pub struct DedupGate {
    pool: PgPool,
}

impl DedupGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn check(&self, bytes: &[u8], allow_duplicate: bool) -> Result<DedupDecision, sqlx::Error> {
        let file_hash = content_hash(bytes);
        self.check_hash(file_hash, allow_duplicate).await
    }

    async fn check_hash(&self, file_hash: String, allow_duplicate: bool) -> Result<DedupDecision, sqlx::Error> {
        let Some(existing) = db::find_by_hash(&self.pool, &file_hash).await? else {
            return Ok(DedupDecision::New { file_hash });
        };
        if !allow_duplicate {
            return Ok(DedupDecision::Duplicate {
                file_hash,
                existing: Box::new(existing),
            });
        }
        let duplicate_seq = db::next_duplicate_seq(&self.pool, &file_hash).await?;
        Ok(DedupDecision::Override { file_hash, duplicate_seq })
    }
}

/// Upload request body and metadata
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub allow_duplicate: bool,
}

/// Accepts uploads; processing happens later in the worker
pub struct IntakeService {
    pool: PgPool,
    storage: Arc<dyn Storage>,
    gate: DedupGate,
}

impl IntakeService {
    pub fn new(pool: PgPool, storage: Arc<dyn Storage>) -> Self {
        Self {
            gate: DedupGate::new(pool.clone()),
            pool,
            storage,
        }
    }

    pub async fn upload(&self, request: UploadRequest) -> AppResult<UploadOutcome> {
        if request.bytes.is_empty() {
            return Err(AppError::BadRequest("upload body is empty".to_string()));
        }

        let mut decision = self.gate.check(&request.bytes, request.allow_duplicate).await?;
        let mut storage_key: Option<String> = None;

        for _ in 0..OVERRIDE_INSERT_ATTEMPTS {
            let (file_hash, duplicate_seq) = match &decision {
                DedupDecision::Duplicate { existing, .. } => {
                    if let Some(key) = storage_key.take() {
                        self.discard_object(&key).await;
                    }
                    tracing::info!(
                        receipt_id = %existing.id,
                        file_hash = %existing.file_hash,
                        "duplicate upload rejected"
                    );
                    return Ok(UploadOutcome {
                        receipt_id: existing.id,
                        status: existing.status,
                        duplicate: true,
                    });
                }
                DedupDecision::New { file_hash } => (file_hash.clone(), 0),
                DedupDecision::Override { file_hash, duplicate_seq } => (file_hash.clone(), *duplicate_seq),
            };

            let key = match storage_key.take() {
                Some(key) => key,
                None => self.storage.put(&request.bytes).await?,
            };

            let new_receipt = NewReceipt {
                id: Uuid::new_v4(),
                storage_key: key.clone(),
                original_filename: request.filename.clone(),
                mime_type: request.mime_type.clone(),
                file_hash: file_hash.clone(),
                duplicate_seq,
            };

            match db::insert_receipt(&self.pool, &new_receipt).await {
                Ok(receipt) => {
                    tracing::info!(
                        receipt_id = %receipt.id,
                        file_hash = %receipt.file_hash,
                        duplicate_seq = receipt.duplicate_seq,
                        "receipt uploaded"
                    );
                    return Ok(UploadOutcome {
                        receipt_id: receipt.id,
                        status: receipt.status,
                        duplicate: false,
                    });
                }
                Err(e) if is_unique_violation(&e) => {
                    // a concurrent upload of the same content won the insert
                    storage_key = Some(key);
                    decision = self.gate.check_hash(file_hash, request.allow_duplicate).await?;
                }
                Err(e) => {
                    self.discard_object(&key).await;
                    return Err(e.into());
                }
            }
        }

        if let Some(key) = storage_key {
            self.discard_object(&key).await;
        }
        Err(AppError::Conflict(
            "could not register upload: concurrent uploads of the same content".to_string(),
        ))
    }

    async fn discard_object(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            tracing::warn!(storage_key = %key, "failed to remove orphaned upload: {}", e);
        }
    }
}
