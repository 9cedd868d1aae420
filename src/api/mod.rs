pub mod handlers;

pub use handlers::*;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;

use crate::service::{ArticleService, IntakeService, PostingService, ReceiptService};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<IntakeService>,
    pub receipts: Arc<ReceiptService>,
    pub posting: Arc<PostingService>,
    pub articles: Arc<ArticleService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/receipts", post(upload_receipt))
        .route("/api/receipts/:id", get(get_receipt))
        .route("/api/receipts/:id/retry", post(retry_receipt))
        .route("/api/receipts/:id/approve", post(approve_receipt))
        .route("/api/receipts/:id/post", post(post_receipt))
        .route("/api/unmapped-items", get(unmapped_items))
        .route("/api/expense-items/:id/article", post(map_item))
        .route("/api/aliases", post(confirm_alias))
        .route("/api/articles/:id/prices", get(price_history))
        .layer(ServiceBuilder::new())
        .with_state(state)
}
