//! Article resolution and price observations.
//!
//! Raw labels resolve through (supplier, normalized label) aliases first, then an
//! exact match on the article key. Anything else stays unmapped and waits in the
//! queue for a human. Confirmed mappings are written as confidence-100 aliases.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::db::{self, ItemContext};
use crate::error::{AppError, AppResult};
use crate::models::{
    Article, ArticleAlias, PriceBasis, PriceObservation, Resolution, UnmappedGroup, UnmappedItem,
    CONFIRMED_CONFIDENCE,
};

/// Trim, case-fold, strip punctuation, collapse whitespace
pub fn normalize_key(raw: &str) -> String {
    let folded: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Price recorded for one resolved item
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedPrice {
    pub unit_price: BigDecimal,
    /// `None` for package prices, so the stored row says which case applied
    pub quantity: Option<BigDecimal>,
    pub basis: PriceBasis,
}

/// Printed unit price, else line_total / quantity, else the whole line as one package
pub fn derive_price(
    quantity: Option<&BigDecimal>,
    unit_price: Option<&BigDecimal>,
    line_total: &BigDecimal,
) -> DerivedPrice {
    let quantity = quantity.filter(|q| !q.is_zero());
    if let Some(unit_price) = unit_price {
        return DerivedPrice {
            unit_price: unit_price.clone(),
            quantity: quantity.cloned(),
            basis: PriceBasis::Unit,
        };
    }
    match quantity {
        Some(q) => DerivedPrice {
            unit_price: line_total / q,
            quantity: Some(q.clone()),
            basis: PriceBasis::Derived,
        },
        None => DerivedPrice {
            unit_price: line_total.clone(),
            quantity: None,
            basis: PriceBasis::Package,
        },
    }
}

/// Resolve one raw label for a supplier
pub async fn resolve(conn: &mut PgConnection, supplier_id: Uuid, raw_label: &str) -> Result<Resolution, sqlx::Error> {
    let key = normalize_key(raw_label);
    if key.is_empty() {
        return Ok(Resolution::Unmapped);
    }

    if let Some(alias) = db::find_alias(&mut *conn, supplier_id, &key).await? {
        return Ok(Resolution::Alias(alias.article_id));
    }

    if let Some(article) = db::find_article_by_key(&mut *conn, &key).await? {
        db::insert_alias_if_absent(&mut *conn, supplier_id, &key, article.id, CONFIRMED_CONFIDENCE).await?;
        tracing::debug!(supplier_id = %supplier_id, label = %key, article_id = %article.id, "alias learned from exact match");
        return Ok(Resolution::ExactMatch(article.id));
    }

    Ok(Resolution::Unmapped)
}

/// Inputs for a price observation
#[derive(Debug, Clone)]
pub struct ObservationSource<'a> {
    pub expense_item_id: Uuid,
    pub supplier_id: Uuid,
    pub observed_at: DateTime<Utc>,
    pub currency: &'a str,
    pub quantity: Option<&'a BigDecimal>,
    pub unit_price: Option<&'a BigDecimal>,
    pub line_total: &'a BigDecimal,
}

impl<'a> From<&'a ItemContext> for ObservationSource<'a> {
    fn from(ctx: &'a ItemContext) -> Self {
        Self {
            expense_item_id: ctx.item_id,
            supplier_id: ctx.supplier_id,
            observed_at: ctx.purchased_at,
            currency: &ctx.currency,
            quantity: ctx.quantity.as_ref(),
            unit_price: ctx.unit_price.as_ref(),
            line_total: &ctx.line_total,
        }
    }
}

/// Insert the observation for a resolved item. `false` when it already existed.
pub async fn record_price_observation(
    conn: &mut PgConnection,
    source: &ObservationSource<'_>,
    article_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let price = derive_price(source.quantity, source.unit_price, source.line_total);
    let observation = PriceObservation {
        id: Uuid::new_v4(),
        article_id,
        supplier_id: source.supplier_id,
        expense_item_id: Some(source.expense_item_id),
        observed_at: source.observed_at,
        unit_price: price.unit_price,
        quantity: price.quantity,
        price_basis: price.basis.as_str().to_string(),
        currency: source.currency.to_string(),
    };
    Ok(db::insert_price_observation(&mut *conn, &observation).await? > 0)
}

/// Group unmapped items by supplier phrasing, keeping first-seen order
pub fn group_unmapped(items: Vec<UnmappedItem>) -> Vec<UnmappedGroup> {
    let mut groups: IndexMap<(Uuid, String), UnmappedGroup> = IndexMap::new();
    for item in items {
        let key = normalize_key(&item.raw_label);
        groups
            .entry((item.supplier_id, key.clone()))
            .or_insert_with(|| UnmappedGroup {
                supplier_id: item.supplier_id,
                supplier_name: item.supplier_name.clone(),
                normalized_label: key,
                sample_label: item.raw_label.clone(),
                item_ids: Vec::new(),
            })
            .item_ids
            .push(item.item_id);
    }
    groups.into_values().collect()
}

/// Target of a human mapping
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleTarget {
    pub article_id: Option<Uuid>,
    /// Find-or-create by normalized name when no id is given
    pub article_name: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MappingOutcome {
    pub alias: ArticleAlias,
    pub article: Article,
    /// Unmapped items (including the one mapped) that now point at the article
    pub mapped_item_ids: Vec<Uuid>,
    pub price_observations: usize,
}

/// Human-facing article operations
pub struct ArticleService {
    pool: PgPool,
}

impl ArticleService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn unmapped_queue(&self, limit: i64) -> AppResult<Vec<UnmappedGroup>> {
        let items = db::list_unmapped_items(&self.pool, limit).await?;
        Ok(group_unmapped(items))
    }

    pub async fn price_history(&self, article_id: Uuid, limit: i64) -> AppResult<Vec<PriceObservation>> {
        if db::get_article(&self.pool, article_id).await?.is_none() {
            return Err(AppError::NotFound(format!("article {}", article_id)));
        }
        Ok(db::list_price_observations(&self.pool, article_id, limit).await?)
    }

    /// Confirm (supplier, raw label) -> article and map every waiting item with that label
    pub async fn confirm_alias(&self, supplier_id: Uuid, raw_label: &str, article_id: Uuid) -> AppResult<MappingOutcome> {
        let key = normalize_key(raw_label);
        if key.is_empty() {
            return Err(AppError::BadRequest("raw_label has no usable characters".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        if db::get_supplier(&mut *tx, supplier_id).await?.is_none() {
            return Err(AppError::NotFound(format!("supplier {}", supplier_id)));
        }
        let article = db::get_article(&mut *tx, article_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("article {}", article_id)))?;

        let outcome = confirm_within(&mut tx, supplier_id, &key, article, None).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Map one unmapped item; learns the alias for its label
    pub async fn map_item(&self, item_id: Uuid, target: ArticleTarget) -> AppResult<MappingOutcome> {
        let mut tx = self.pool.begin().await?;

        let item = db::lock_item_context(&mut *tx, item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("expense item {}", item_id)))?;
        if item.article_id.is_some() {
            return Err(AppError::Conflict(format!("expense item {} is already mapped", item_id)));
        }

        let article = match (target.article_id, target.article_name.as_deref().map(str::trim)) {
            (Some(article_id), _) => db::get_article(&mut *tx, article_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("article {}", article_id)))?,
            (None, Some(name)) if !normalize_key(name).is_empty() => {
                db::find_or_create_article(&mut *tx, name, &normalize_key(name)).await?
            }
            _ => {
                return Err(AppError::BadRequest(
                    "article_id or a non-empty article_name is required".to_string(),
                ))
            }
        };

        let key = normalize_key(&item.raw_label);
        if key.is_empty() {
            return Err(AppError::BadRequest(format!("expense item {} has an empty label", item_id)));
        }
        let outcome = confirm_within(&mut tx, item.supplier_id, &key, article, Some(item)).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

/// Write the confirmed alias and map waiting items with the same label
async fn confirm_within(
    conn: &mut PgConnection,
    supplier_id: Uuid,
    key: &str,
    article: Article,
    first: Option<ItemContext>,
) -> AppResult<MappingOutcome> {
    let alias = db::upsert_alias(&mut *conn, supplier_id, key, article.id, CONFIRMED_CONFIDENCE).await?;

    let mut pending: Vec<ItemContext> = first.into_iter().collect();
    for ctx in db::lock_unmapped_items_for_supplier(&mut *conn, supplier_id).await? {
        if normalize_key(&ctx.raw_label) == key && !pending.iter().any(|p| p.item_id == ctx.item_id) {
            pending.push(ctx);
        }
    }

    let mut mapped_item_ids = Vec::with_capacity(pending.len());
    let mut price_observations = 0;
    for ctx in &pending {
        db::set_item_article(&mut *conn, ctx.item_id, article.id).await?;
        if record_price_observation(&mut *conn, &ObservationSource::from(ctx), article.id).await? {
            price_observations += 1;
        }
        mapped_item_ids.push(ctx.item_id);
    }

    tracing::info!(
        supplier_id = %supplier_id,
        label = %key,
        article_id = %article.id,
        mapped_items = mapped_item_ids.len(),
        "article alias confirmed"
    );

    Ok(MappingOutcome {
        alias,
        article,
        mapped_item_ids,
        price_observations,
    })
}
