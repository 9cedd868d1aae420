use crate::db::queries_posting::ItemContext;
use crate::models::{Article, ArticleAlias, PriceObservation, UnmappedItem};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn find_alias<'e, E>(
    executor: E,
    supplier_id: Uuid,
    normalized_label: &str,
) -> Result<Option<ArticleAlias>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, ArticleAlias>(
        r#"
        SELECT id, supplier_id, normalized_label, article_id, confidence, updated_at
        FROM article_aliases
        WHERE supplier_id = $1 AND normalized_label = $2
        "#,
    )
    .bind(supplier_id)
    .bind(normalized_label)
    .fetch_optional(executor)
    .await
}

pub async fn find_article_by_key<'e, E>(executor: E, normalized_key: &str) -> Result<Option<Article>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Article>("SELECT id, name, normalized_key FROM articles WHERE normalized_key = $1")
        .bind(normalized_key)
        .fetch_optional(executor)
        .await
}

pub async fn get_article<'e, E>(executor: E, article_id: Uuid) -> Result<Option<Article>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Article>("SELECT id, name, normalized_key FROM articles WHERE id = $1")
        .bind(article_id)
        .fetch_optional(executor)
        .await
}

pub async fn find_or_create_article<'e, E>(
    executor: E,
    name: &str,
    normalized_key: &str,
) -> Result<Article, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Article>(
        r#"
        INSERT INTO articles (id, name, normalized_key)
        VALUES ($1, $2, $3)
        ON CONFLICT (normalized_key) DO UPDATE SET normalized_key = EXCLUDED.normalized_key
        RETURNING id, name, normalized_key
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(normalized_key)
    .fetch_one(executor)
    .await
}

/// Learned shortcut; never replaces an existing alias
pub async fn insert_alias_if_absent<'e, E>(
    executor: E,
    supplier_id: Uuid,
    normalized_label: &str,
    article_id: Uuid,
    confidence: i16,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO article_aliases (id, supplier_id, normalized_label, article_id, confidence)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (supplier_id, normalized_label) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(supplier_id)
    .bind(normalized_label)
    .bind(article_id)
    .bind(confidence)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// User-confirmed alias; overwrites whatever was there
pub async fn upsert_alias<'e, E>(
    executor: E,
    supplier_id: Uuid,
    normalized_label: &str,
    article_id: Uuid,
    confidence: i16,
) -> Result<ArticleAlias, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, ArticleAlias>(
        r#"
        INSERT INTO article_aliases (id, supplier_id, normalized_label, article_id, confidence)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (supplier_id, normalized_label) DO UPDATE
            SET article_id = EXCLUDED.article_id,
                confidence = EXCLUDED.confidence,
                updated_at = now()
        RETURNING id, supplier_id, normalized_label, article_id, confidence, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(supplier_id)
    .bind(normalized_label)
    .bind(article_id)
    .bind(confidence)
    .fetch_one(executor)
    .await
}

/// Record one observation per expense item; a second insert for the same item is ignored
pub async fn insert_price_observation<'e, E>(executor: E, obs: &PriceObservation) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO price_observations
            (id, article_id, supplier_id, expense_item_id, observed_at, unit_price, quantity, price_basis, currency)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (expense_item_id) DO NOTHING
        "#,
    )
    .bind(obs.id)
    .bind(obs.article_id)
    .bind(obs.supplier_id)
    .bind(obs.expense_item_id)
    .bind(obs.observed_at)
    .bind(&obs.unit_price)
    .bind(&obs.quantity)
    .bind(&obs.price_basis)
    .bind(&obs.currency)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Price history for an article, newest first
pub async fn list_price_observations(
    pool: &PgPool,
    article_id: Uuid,
    limit: i64,
) -> Result<Vec<PriceObservation>, sqlx::Error> {
    sqlx::query_as::<_, PriceObservation>(
        r#"
        SELECT id, article_id, supplier_id, expense_item_id, observed_at, unit_price, quantity,
               price_basis, currency
        FROM price_observations
        WHERE article_id = $1
        ORDER BY observed_at DESC, created_at DESC
        LIMIT $2
        "#,
    )
    .bind(article_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Posted items without an article, oldest purchase first
pub async fn list_unmapped_items(pool: &PgPool, limit: i64) -> Result<Vec<UnmappedItem>, sqlx::Error> {
    sqlx::query_as::<_, UnmappedItem>(
        r#"
        SELECT ei.id AS item_id, ei.expense_id, e.supplier_id, s.name AS supplier_name,
               ei.raw_label, ei.quantity, ei.unit_price, ei.line_total, e.purchased_at
        FROM expense_items ei
        INNER JOIN expenses e ON e.id = ei.expense_id
        INNER JOIN suppliers s ON s.id = e.supplier_id
        WHERE ei.article_id IS NULL
          AND e.is_posted
          AND e.deleted_at IS NULL
        ORDER BY e.purchased_at ASC, ei.position ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Unmapped items of one supplier, row-locked, for alias backfill
pub async fn lock_unmapped_items_for_supplier<'e, E>(
    executor: E,
    supplier_id: Uuid,
) -> Result<Vec<ItemContext>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, ItemContext>(
        r#"
        SELECT ei.id AS item_id, ei.raw_label, ei.article_id, ei.quantity, ei.unit_price, ei.line_total,
               e.supplier_id, e.purchased_at, e.currency
        FROM expense_items ei
        INNER JOIN expenses e ON e.id = ei.expense_id
        WHERE e.supplier_id = $1
          AND ei.article_id IS NULL
          AND e.is_posted
          AND e.deleted_at IS NULL
        FOR UPDATE OF ei
        "#,
    )
    .bind(supplier_id)
    .fetch_all(executor)
    .await
}
