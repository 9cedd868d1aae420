use receipt_ingest::models::RECEIPT_SCHEMA_V1;
use receipt_ingest::service::{
    ArticleService, CompositePolicy, ExtractionClient, HttpExtractionProvider, IntakeService, LocalDirStorage,
    PostingService, ProcessingWorker, ReceiptService, RetryConfig, Storage, WorkerConfig,
};
use receipt_ingest::{create_pool, router, run_migrations, AppConfig, AppState};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // local-time log format
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    let config = AppConfig::load()?;
    info!(
        "Starting receipt-ingest on {}:{}, extraction provider {}",
        config.server.host, config.server.port, config.extraction.base_url
    );

    let pool = create_pool(&config.database).await?;
    run_migrations(&pool).await?;
    info!("Database pool created, migrations applied");

    let storage: Arc<dyn Storage> = Arc::new(LocalDirStorage::new(&config.storage.root).await?);
    let provider = Arc::new(HttpExtractionProvider::new(
        config.extraction.base_url.clone(),
        config.extraction.api_key.clone(),
    )?);
    let client = Arc::new(ExtractionClient::new(
        provider,
        RetryConfig::from_config(&config.extraction),
        config.extraction.staging_dir.clone(),
        RECEIPT_SCHEMA_V1,
    ));
    let policy = Arc::new(CompositePolicy::standard(config.review.min_confidence));

    let worker = Arc::new(ProcessingWorker::new(
        pool.clone(),
        storage.clone(),
        client,
        policy,
        WorkerConfig::from_config(&config),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let state = AppState {
        intake: Arc::new(IntakeService::new(pool.clone(), storage)),
        receipts: Arc::new(ReceiptService::new(pool.clone())),
        posting: Arc::new(PostingService::new(pool.clone(), config.default_currency.clone())),
        articles: Arc::new(ArticleService::new(pool)),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/receipts              - upload");
    info!("  GET  /api/receipts/:id          - status");
    info!("  POST /api/receipts/:id/post     - approve and post");
    info!("  GET  /api/unmapped-items        - unmapped queue");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    worker_handle.await?;
    info!("Stopped");
    Ok(())
}
