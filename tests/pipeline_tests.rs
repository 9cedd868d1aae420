//! End-to-end pipeline scenarios against a real Postgres.
//!
//! Set `TEST_DATABASE_URL` to run them; without it every test returns early.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use bigdecimal::BigDecimal;
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use receipt_ingest::db;
use receipt_ingest::models::{
    ReceiptStatus, Resolution, ReviewData, ReviewItem, CONFIRMED_CONFIDENCE, RECEIPT_SCHEMA_V1,
};
use receipt_ingest::service::article_resolver::{self, normalize_key};
use receipt_ingest::service::{
    ArticleService, ArticleTarget, CompositePolicy, ExtractSource, ExtractionClient, ExtractionProvider,
    IntakeService, MemoryStorage, PostingService, ProcessingWorker, ProviderError, ReceiptService, RetryConfig,
    RetrySchedule, Storage, UploadRequest, WorkerConfig,
};
use receipt_ingest::{router, AppError, AppState};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.expect("connect to TEST_DATABASE_URL");
    db::run_migrations(&pool).await.expect("migrations");
    Some(pool)
}

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

/// Bytes no other test run will produce
fn unique_file() -> Vec<u8> {
    format!("%PDF-1.4 receipt {}", Uuid::new_v4()).into_bytes()
}

/// Extraction provider with one canned behaviour
struct MockProvider {
    parse_text: Option<String>,
    extract: Result<Value, ProviderError>,
    calls: AtomicU32,
}

impl MockProvider {
    fn returning(payload: Value) -> Self {
        Self {
            parse_text: Some("BINGO\nMilk 1L 2.50\nTOTAL 42.50".to_string()),
            extract: Ok(payload),
            calls: AtomicU32::new(0),
        }
    }

    fn failing(error: ProviderError) -> Self {
        Self {
            parse_text: Some("unreadable".to_string()),
            extract: Err(error),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ExtractionProvider for MockProvider {
    async fn parse(&self, document: &Path, _mime_type: &str) -> Result<String, ProviderError> {
        assert!(document.exists());
        self.parse_text
            .clone()
            .ok_or_else(|| ProviderError::MalformedInput("no text".to_string()))
    }

    async fn extract(&self, _source: ExtractSource<'_>, schema: &Value) -> Result<Value, ProviderError> {
        assert_eq!(schema["$id"], "receipt/v1");
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.extract.clone()
    }
}

struct Harness {
    pool: PgPool,
    intake: IntakeService,
    receipts: ReceiptService,
    posting: PostingService,
    articles: ArticleService,
    storage: Arc<MemoryStorage>,
}

impl Harness {
    fn new(pool: PgPool) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        Self {
            intake: IntakeService::new(pool.clone(), storage.clone()),
            receipts: ReceiptService::new(pool.clone()),
            posting: PostingService::new(pool.clone(), "EUR"),
            articles: ArticleService::new(pool.clone()),
            storage,
            pool,
        }
    }

    fn worker(&self, provider: Arc<MockProvider>) -> ProcessingWorker {
        let client = ExtractionClient::new(
            provider,
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                request_timeout: Duration::from_secs(5),
            },
            None,
            RECEIPT_SCHEMA_V1,
        );
        let storage: Arc<dyn Storage> = self.storage.clone();
        ProcessingWorker::new(
            self.pool.clone(),
            storage,
            Arc::new(client),
            Arc::new(CompositePolicy::standard(None)),
            WorkerConfig {
                poll_interval: Duration::from_secs(1),
                batch_size: 10,
                concurrency: 2,
                parse_step: true,
                stale_claim_after: Duration::from_secs(300),
                schedule: RetrySchedule {
                    delays: vec![Duration::ZERO],
                    max_failures: 3,
                },
            },
        )
    }

    async fn upload(&self, bytes: Vec<u8>, allow_duplicate: bool) -> receipt_ingest::models::UploadOutcome {
        self.intake
            .upload(UploadRequest {
                bytes,
                filename: Some("receipt.pdf".to_string()),
                mime_type: Some("application/pdf".to_string()),
                allow_duplicate,
            })
            .await
            .unwrap()
    }

    /// Upload a fresh file and run it through extraction
    async fn extracted(&self, payload: Value) -> Uuid {
        let worker = self.worker(Arc::new(MockProvider::returning(payload)));
        let upload = self.upload(unique_file(), false).await;
        let receipt = worker.process(upload.receipt_id, stale_before()).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Extracted);
        upload.receipt_id
    }

    fn app(&self) -> axum::Router {
        let storage: Arc<dyn Storage> = self.storage.clone();
        router(AppState {
            intake: Arc::new(IntakeService::new(self.pool.clone(), storage)),
            receipts: Arc::new(ReceiptService::new(self.pool.clone())),
            posting: Arc::new(PostingService::new(self.pool.clone(), "EUR")),
            articles: Arc::new(ArticleService::new(self.pool.clone())),
        })
    }
}

fn cash_review(supplier_name: &str, items: Vec<ReviewItem>) -> ReviewData {
    ReviewData {
        supplier_name: Some(supplier_name.to_string()),
        payer_label: Some("Cash".to_string()),
        payer_type: Some("cash".to_string()),
        purchased_at: Some(Utc::now()),
        total_amount: Some(dec("42.50")),
        items,
        ..Default::default()
    }
}

fn package_item(label: &str, line_total: &str) -> ReviewItem {
    ReviewItem {
        raw_label: Some(label.to_string()),
        quantity: None,
        unit_price: None,
        line_total: Some(dec(line_total)),
    }
}

fn stale_before() -> chrono::DateTime<Utc> {
    Utc::now() - ChronoDuration::minutes(5)
}

fn bingo_payload(supplier: &str) -> Value {
    json!({
        "supplier_name": supplier,
        "total_amount": "42.50",
        "currency": "eur",
        "purchased_at": "2026-03-14T10:30:00Z",
        "payment_method": "Card",
        "card_last4": "**** 4242",
        "items": [{ "label": "Milk 1L", "quantity": 1, "line_total": "2.50" }]
    })
}

#[tokio::test]
async fn test_duplicate_upload_returns_first_receipt() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool);
    let bytes = unique_file();

    let first = harness.upload(bytes.clone(), false).await;
    assert!(!first.duplicate);
    assert_eq!(first.status, ReceiptStatus::Uploaded);

    let second = harness.upload(bytes.clone(), false).await;
    assert!(second.duplicate);
    assert_eq!(second.receipt_id, first.receipt_id);
    assert_eq!(harness.storage.len(), 1);

    let forced = harness.upload(bytes, true).await;
    assert!(!forced.duplicate);
    assert_ne!(forced.receipt_id, first.receipt_id);
    let forced = harness.receipts.get(forced.receipt_id).await.unwrap();
    assert_eq!(forced.duplicate_seq, 1);
}

#[tokio::test]
async fn test_repeated_server_errors_end_in_failed() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool);
    let provider = Arc::new(MockProvider::failing(ProviderError::Server {
        status: 500,
        body: "upstream exploded".to_string(),
    }));
    let worker = harness.worker(provider.clone());
    let upload = harness.upload(unique_file(), false).await;

    for run in 1..=3 {
        let receipt = worker.process(upload.receipt_id, stale_before()).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert_eq!(receipt.retry_count, run);
        assert_eq!(receipt.next_attempt_at.is_some(), run < 3);
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 9);

    let receipt = harness.receipts.get(upload.receipt_id).await.unwrap();
    assert_eq!(receipt.retry_count, 3);
    assert!(receipt.error_message.as_deref().unwrap().contains("500"));
    assert_eq!(receipt.error_details.as_ref().unwrap()["class"], "server_error");
    // text from the parse step survives for the next attempt
    assert!(receipt.parsed_text.is_some());

    // exhausted: only a manual retry brings it back
    assert!(worker.process(upload.receipt_id, stale_before()).await.unwrap().is_none());
    let retried = harness.receipts.retry(upload.receipt_id).await.unwrap();
    assert_eq!(retried.status, ReceiptStatus::Uploaded);
    assert_eq!(retried.retry_count, 0);
    assert!(matches!(
        harness.receipts.retry(upload.receipt_id).await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_missing_total_requires_review() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool);
    let mut payload = bingo_payload("Bingo");
    payload.as_object_mut().unwrap().remove("total_amount");
    let worker = harness.worker(Arc::new(MockProvider::returning(payload)));
    let upload = harness.upload(unique_file(), false).await;

    let receipt = worker.process(upload.receipt_id, stale_before()).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::ReviewRequired);
    assert_eq!(receipt.supplier_guess.as_deref(), Some("Bingo"));
    assert!(receipt.total_guess.is_none());
    assert!(receipt.raw_payload.is_some());
    assert!(receipt.error_message.as_deref().unwrap().contains("total_amount"));
}

#[tokio::test]
async fn test_complete_extraction_is_extracted() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool);
    let worker = harness.worker(Arc::new(MockProvider::returning(bingo_payload("Bingo"))));
    let upload = harness.upload(unique_file(), false).await;

    let receipt = worker.process(upload.receipt_id, stale_before()).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Extracted);
    assert_eq!(receipt.total_guess, Some(dec("42.50")));
    assert_eq!(receipt.currency_guess.as_deref(), Some("EUR"));
    assert_eq!(receipt.card_last4.as_deref(), Some("4242"));
    assert!(receipt.claimed_at.is_none());
    assert!(receipt.error_message.is_none());

    // a second claim of the same receipt finds nothing to do
    assert!(worker.process(upload.receipt_id, stale_before()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_post_resolves_alias_and_is_idempotent() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool.clone());
    let supplier_name = format!("Bingo {}", Uuid::new_v4());
    let article_name = format!("Milk {}", Uuid::new_v4());

    let supplier = db::find_or_create_supplier(&pool, &supplier_name, &normalize_key(&supplier_name))
        .await
        .unwrap();
    let article = db::find_or_create_article(&pool, &article_name, &normalize_key(&article_name))
        .await
        .unwrap();
    harness
        .articles
        .confirm_alias(supplier.id, "Milk 1L", article.id)
        .await
        .unwrap();

    let worker = harness.worker(Arc::new(MockProvider::returning(bingo_payload(&supplier_name))));
    let upload = harness.upload(unique_file(), false).await;
    worker.process(upload.receipt_id, stale_before()).await.unwrap().unwrap();

    let review = ReviewData {
        supplier_name: Some(supplier_name.clone()),
        payer_label: Some("Cash".to_string()),
        payer_type: Some("cash".to_string()),
        purchased_at: Some(Utc::now()),
        total_amount: Some(dec("42.50")),
        items: vec![ReviewItem {
            raw_label: Some("Milk 1L".to_string()),
            quantity: Some(dec("1")),
            unit_price: None,
            line_total: Some(dec("2.50")),
        }],
        ..Default::default()
    };

    let posted = harness
        .posting
        .approve_and_post(upload.receipt_id, review.clone())
        .await
        .unwrap();
    assert!(!posted.already_posted);
    assert_eq!(posted.expense.total_amount, dec("42.50"));
    assert_eq!(posted.expense.supplier_id, supplier.id);
    assert_eq!(posted.items.len(), 1);
    assert_eq!(posted.items[0].article_id, Some(article.id));
    assert_eq!(posted.price_observations, 1);

    let prices = harness.articles.price_history(article.id, 10).await.unwrap();
    assert_eq!(prices.len(), 1);
    assert_eq!(prices[0].unit_price, dec("2.50"));
    assert_eq!(prices[0].price_basis, "derived");

    let again = harness
        .posting
        .approve_and_post(upload.receipt_id, review)
        .await
        .unwrap();
    assert!(again.already_posted);
    assert_eq!(again.expense.id, posted.expense.id);
    assert_eq!(again.items.len(), 1);

    // the body of a repeat does not matter once the receipt is posted
    let bare = harness
        .posting
        .approve_and_post(upload.receipt_id, ReviewData::default())
        .await
        .unwrap();
    assert!(bare.already_posted);
    assert_eq!(bare.expense.id, posted.expense.id);

    let receipt = harness.receipts.get(upload.receipt_id).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Posted);
    assert_eq!(receipt.expense_id, Some(posted.expense.id));
    assert!(matches!(
        harness.receipts.retry(upload.receipt_id).await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_confirmed_alias_resolves_deterministically() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool.clone());
    let supplier_name = format!("Corner Shop {}", Uuid::new_v4());
    let supplier = db::find_or_create_supplier(&pool, &supplier_name, &normalize_key(&supplier_name))
        .await
        .unwrap();
    let article_name = format!("Bread {}", Uuid::new_v4());
    let article = db::find_or_create_article(&pool, &article_name, &normalize_key(&article_name))
        .await
        .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let before = article_resolver::resolve(&mut conn, supplier.id, "Brd. Wholegrain").await.unwrap();
    assert_eq!(before.article_id(), None);

    harness
        .articles
        .confirm_alias(supplier.id, "Brd. Wholegrain", article.id)
        .await
        .unwrap();

    for label in ["Brd. Wholegrain", "  BRD WHOLEGRAIN ", "brd, wholegrain!"] {
        let resolution = article_resolver::resolve(&mut conn, supplier.id, label).await.unwrap();
        assert_eq!(resolution.article_id(), Some(article.id), "label {:?}", label);
    }
}

#[tokio::test]
async fn test_approved_draft_is_posted_from_empty_body() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool);
    let supplier_name = format!("Bingo {}", Uuid::new_v4());
    let receipt_id = harness.extracted(bingo_payload(&supplier_name)).await;

    let review = cash_review(&supplier_name, vec![package_item("Bag", "0.10")]);
    let approved = harness.posting.approve(receipt_id, review).await.unwrap();
    assert_eq!(approved.status, ReceiptStatus::Approved);
    assert!(approved.review_data.is_some());

    let posted = harness
        .posting
        .approve_and_post(receipt_id, ReviewData::default())
        .await
        .unwrap();
    assert!(!posted.already_posted);
    assert_eq!(posted.expense.total_amount, dec("42.50"));
    assert_eq!(posted.items.len(), 1);
    assert_eq!(posted.items[0].raw_label, "Bag");
}

#[tokio::test]
async fn test_stale_claim_is_recovered() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool.clone());
    let worker = harness.worker(Arc::new(MockProvider::returning(bingo_payload("Bingo"))));
    let upload = harness.upload(unique_file(), false).await;

    // a worker died mid-extraction a moment ago: still owned
    sqlx::query("UPDATE receipts SET status = 'extracting', claimed_at = now() WHERE id = $1")
        .bind(upload.receipt_id)
        .execute(&pool)
        .await
        .unwrap();
    assert!(worker.process(upload.receipt_id, stale_before()).await.unwrap().is_none());

    // and an hour ago: up for grabs
    sqlx::query("UPDATE receipts SET claimed_at = now() - interval '1 hour' WHERE id = $1")
        .bind(upload.receipt_id)
        .execute(&pool)
        .await
        .unwrap();
    let recovered = worker.process(upload.receipt_id, stale_before()).await.unwrap().unwrap();
    assert_eq!(recovered.status, ReceiptStatus::Extracted);
    assert!(recovered.claimed_at.is_none());
}

#[tokio::test]
async fn test_concurrent_claims_process_once() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool);
    let provider = Arc::new(MockProvider::returning(bingo_payload("Bingo")));
    let worker = harness.worker(provider.clone());
    let upload = harness.upload(unique_file(), false).await;

    let cutoff = stale_before();
    let (a, b) = tokio::join!(
        worker.process(upload.receipt_id, cutoff),
        worker.process(upload.receipt_id, cutoff)
    );
    let processed = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
    assert_eq!(processed, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_posting_unprocessed_receipt_conflicts() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool.clone());
    let review = cash_review("Bingo", vec![]);

    let uploaded = harness.upload(unique_file(), false).await;
    let result = harness.posting.approve_and_post(uploaded.receipt_id, review.clone()).await;
    assert!(matches!(result, Err(AppError::Conflict(_))), "{:?}", result.err());

    let worker = harness.worker(Arc::new(MockProvider::failing(ProviderError::MalformedInput(
        "not a receipt".to_string(),
    ))));
    let failed = harness.upload(unique_file(), false).await;
    let receipt = worker.process(failed.receipt_id, stale_before()).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failed);
    assert!(receipt.next_attempt_at.is_none());

    let result = harness.posting.approve_and_post(failed.receipt_id, review).await;
    assert!(matches!(result, Err(AppError::Conflict(_))), "{:?}", result.err());

    for receipt_id in [uploaded.receipt_id, failed.receipt_id] {
        assert!(db::find_posted_expense(&pool, receipt_id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_exact_article_match_learns_alias() {
    let Some(pool) = test_pool().await else { return };
    let supplier_name = format!("Market {}", Uuid::new_v4());
    let supplier = db::find_or_create_supplier(&pool, &supplier_name, &normalize_key(&supplier_name))
        .await
        .unwrap();
    let article_name = format!("Oat Drink {}", Uuid::new_v4());
    let article = db::find_or_create_article(&pool, &article_name, &normalize_key(&article_name))
        .await
        .unwrap();

    let label = format!("  {}. ", article_name.to_uppercase());
    let mut conn = pool.acquire().await.unwrap();
    let first = article_resolver::resolve(&mut conn, supplier.id, &label).await.unwrap();
    assert_eq!(first, Resolution::ExactMatch(article.id));

    let alias = db::find_alias(&mut *conn, supplier.id, &normalize_key(&label))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alias.article_id, article.id);
    assert_eq!(alias.confidence, CONFIRMED_CONFIDENCE);

    let second = article_resolver::resolve(&mut conn, supplier.id, &label).await.unwrap();
    assert_eq!(second, Resolution::Alias(article.id));
}

#[tokio::test]
async fn test_map_item_backfills_same_label() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool.clone());
    let supplier_name = format!("Bingo {}", Uuid::new_v4());
    let label = format!("Mystery Box {}", Uuid::new_v4());
    let receipt_id = harness.extracted(bingo_payload(&supplier_name)).await;

    let review = cash_review(
        &supplier_name,
        vec![
            package_item(&label, "3.00"),
            package_item(&format!("{}!", label.to_uppercase()), "4.00"),
        ],
    );
    let posted = harness.posting.approve_and_post(receipt_id, review).await.unwrap();
    assert!(posted.items.iter().all(|i| i.article_id.is_none()));
    assert_eq!(posted.price_observations, 0);

    let target = ArticleTarget {
        article_id: None,
        article_name: Some(format!("Mystery {}", Uuid::new_v4())),
    };
    let outcome = harness.articles.map_item(posted.items[0].id, target.clone()).await.unwrap();
    assert_eq!(outcome.mapped_item_ids.len(), 2);
    assert_eq!(outcome.price_observations, 2);
    assert_eq!(outcome.alias.confidence, CONFIRMED_CONFIDENCE);

    let items = db::list_expense_items(&pool, posted.expense.id).await.unwrap();
    assert!(items.iter().all(|i| i.article_id == Some(outcome.article.id)));

    let prices = harness.articles.price_history(outcome.article.id, 10).await.unwrap();
    assert_eq!(prices.len(), 2);
    assert!(prices.iter().all(|p| p.price_basis == "package" && p.quantity.is_none()));

    let again = harness.articles.map_item(posted.items[1].id, target).await;
    assert!(matches!(again, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn test_incomplete_review_is_rejected_with_field_errors() {
    let Some(pool) = test_pool().await else { return };
    let harness = Harness::new(pool);
    let receipt_id = harness.extracted(bingo_payload("Bingo")).await;

    let review = json!({
        "supplier_name": "Bingo",
        "items": [{ "raw_label": "Milk 1L", "quantity": "1" }]
    });
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/receipts/{}/post", receipt_id))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(review.to_string()))
        .unwrap();
    let response = harness.app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
    let fields: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["payer", "purchased_at", "total_amount", "items[0].line_total"]);

    let receipt = harness.receipts.get(receipt_id).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Extracted);
}
