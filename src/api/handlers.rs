use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::AppResult;
use crate::models::{ReceiptView, ReviewData};
use crate::service::{ArticleTarget, UploadRequest};

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;

/// Response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

fn respond<T: Serialize>(status: StatusCode, message: impl Into<String>, data: T) -> Response {
    let body = ApiResponse {
        success: true,
        message: message.into(),
        data,
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    #[serde(default)]
    pub allow_duplicate: bool,
    pub filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

impl ListParams {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

/// Body of `POST /api/aliases`
#[derive(Debug, Deserialize)]
pub struct ConfirmAliasRequest {
    pub supplier_id: Uuid,
    pub raw_label: String,
    pub article_id: Uuid,
}

/// Health check
pub async fn health_check() -> &'static str {
    "OK"
}

/// Upload one receipt file (raw body)
pub async fn upload_receipt(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let outcome = state
        .intake
        .upload(UploadRequest {
            bytes: body.to_vec(),
            filename: params.filename,
            mime_type,
            allow_duplicate: params.allow_duplicate,
        })
        .await?;

    if outcome.duplicate {
        Ok(respond(StatusCode::OK, "Duplicate of an existing receipt", outcome))
    } else {
        Ok(respond(StatusCode::CREATED, "Receipt uploaded", outcome))
    }
}

pub async fn get_receipt(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Response> {
    let view = state.receipts.view(id).await?;
    Ok(respond(StatusCode::OK, format!("Receipt is {}", view.status), view))
}

/// Manual retry of a failed receipt
pub async fn retry_receipt(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Response> {
    let receipt = state.receipts.retry(id).await?;
    Ok(respond(StatusCode::OK, "Receipt queued for retry", ReceiptView::from(receipt)))
}

pub async fn approve_receipt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(review): Json<ReviewData>,
) -> AppResult<Response> {
    let receipt = state.posting.approve(id, review).await?;
    Ok(respond(StatusCode::OK, "Receipt approved", ReceiptView::from(receipt)))
}

/// Approve and post; repeats return the existing expense
pub async fn post_receipt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(review): Json<ReviewData>,
) -> AppResult<Response> {
    let outcome = state.posting.approve_and_post(id, review).await?;
    if outcome.already_posted {
        Ok(respond(StatusCode::OK, "Receipt was already posted", outcome))
    } else {
        let message = format!(
            "Posted expense with {} item(s), {} price observation(s)",
            outcome.items.len(),
            outcome.price_observations
        );
        Ok(respond(StatusCode::CREATED, message, outcome))
    }
}

pub async fn unmapped_items(State(state): State<AppState>, Query(params): Query<ListParams>) -> AppResult<Response> {
    let groups = state.articles.unmapped_queue(params.limit()).await?;
    Ok(respond(StatusCode::OK, format!("{} unmapped label group(s)", groups.len()), groups))
}

/// Map one unmapped item to an article
pub async fn map_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(target): Json<ArticleTarget>,
) -> AppResult<Response> {
    let outcome = state.articles.map_item(id, target).await?;
    let message = format!("Mapped {} item(s) to {}", outcome.mapped_item_ids.len(), outcome.article.name);
    Ok(respond(StatusCode::OK, message, outcome))
}

pub async fn confirm_alias(
    State(state): State<AppState>,
    Json(req): Json<ConfirmAliasRequest>,
) -> AppResult<Response> {
    let outcome = state
        .articles
        .confirm_alias(req.supplier_id, &req.raw_label, req.article_id)
        .await?;
    let message = format!("Alias confirmed, {} waiting item(s) mapped", outcome.mapped_item_ids.len());
    Ok(respond(StatusCode::OK, message, outcome))
}

/// Price observations for an article, newest first
pub async fn price_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListParams>,
) -> AppResult<Response> {
    let observations = state.articles.price_history(id, params.limit()).await?;
    Ok(respond(StatusCode::OK, format!("{} observation(s)", observations.len()), observations))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_limit_is_clamped() {
        assert_eq!(ListParams { limit: None }.limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(ListParams { limit: Some(0) }.limit(), 1);
        assert_eq!(ListParams { limit: Some(50_000) }.limit(), MAX_LIST_LIMIT);
    }
}
