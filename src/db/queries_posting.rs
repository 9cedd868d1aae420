use crate::models::{Expense, ExpenseItem, Payer, Supplier};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

/// Supplier by normalized key, created on first use
pub async fn find_or_create_supplier<'e, E>(
    executor: E,
    name: &str,
    normalized_key: &str,
) -> Result<Supplier, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Supplier>(
        r#"
        INSERT INTO suppliers (id, name, normalized_key)
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

pub async fn get_supplier<'e, E>(executor: E, supplier_id: Uuid) -> Result<Option<Supplier>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Supplier>("SELECT id, name, normalized_key FROM suppliers WHERE id = $1")
        .bind(supplier_id)
        .fetch_optional(executor)
        .await
}

/// Payer by (type, normalized label), created on first use
pub async fn find_or_create_payer<'e, E>(
    executor: E,
    payer_type: &str,
    label: &str,
    normalized_label: &str,
) -> Result<Payer, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Payer>(
        r#"
        INSERT INTO payers (id, payer_type, label, normalized_label)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (payer_type, normalized_label) DO UPDATE SET normalized_label = EXCLUDED.normalized_label
        RETURNING id, payer_type, label, normalized_label
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(payer_type)
    .bind(label)
    .bind(normalized_label)
    .fetch_one(executor)
    .await
}

pub async fn get_payer<'e, E>(executor: E, payer_id: Uuid) -> Result<Option<Payer>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Payer>("SELECT id, payer_type, label, normalized_label FROM payers WHERE id = $1")
        .bind(payer_id)
        .fetch_optional(executor)
        .await
}

pub async fn insert_expense<'e, E>(executor: E, expense: &Expense) -> Result<Expense, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Expense>(
        r#"
        INSERT INTO expenses (id, receipt_id, supplier_id, payer_id, purchased_at, total_amount, currency, is_posted)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, receipt_id, supplier_id, payer_id, purchased_at, total_amount, currency,
                  is_posted, deleted_at, created_at
        "#,
    )
    .bind(expense.id)
    .bind(expense.receipt_id)
    .bind(expense.supplier_id)
    .bind(expense.payer_id)
    .bind(expense.purchased_at)
    .bind(&expense.total_amount)
    .bind(&expense.currency)
    .bind(expense.is_posted)
    .fetch_one(executor)
    .await
}

pub async fn insert_expense_item<'e, E>(executor: E, item: &ExpenseItem) -> Result<ExpenseItem, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, ExpenseItem>(
        r#"
        INSERT INTO expense_items (id, expense_id, position, raw_label, article_id, quantity, unit_price, line_total)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, expense_id, position, raw_label, article_id, quantity, unit_price, line_total
        "#,
    )
    .bind(item.id)
    .bind(item.expense_id)
    .bind(item.position)
    .bind(&item.raw_label)
    .bind(item.article_id)
    .bind(&item.quantity)
    .bind(&item.unit_price)
    .bind(&item.line_total)
    .fetch_one(executor)
    .await
}

/// The live posted expense for a receipt, if any
pub async fn find_posted_expense<'e, E>(executor: E, receipt_id: Uuid) -> Result<Option<Expense>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Expense>(
        r#"
        SELECT id, receipt_id, supplier_id, payer_id, purchased_at, total_amount, currency,
               is_posted, deleted_at, created_at
        FROM expenses
        WHERE receipt_id = $1 AND is_posted AND deleted_at IS NULL
        "#,
    )
    .bind(receipt_id)
    .fetch_optional(executor)
    .await
}

pub async fn get_expense<'e, E>(executor: E, expense_id: Uuid) -> Result<Option<Expense>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Expense>(
        r#"
        SELECT id, receipt_id, supplier_id, payer_id, purchased_at, total_amount, currency,
               is_posted, deleted_at, created_at
        FROM expenses
        WHERE id = $1
        "#,
    )
    .bind(expense_id)
    .fetch_optional(executor)
    .await
}

pub async fn list_expense_items<'e, E>(executor: E, expense_id: Uuid) -> Result<Vec<ExpenseItem>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, ExpenseItem>(
        r#"
        SELECT id, expense_id, position, raw_label, article_id, quantity, unit_price, line_total
        FROM expense_items
        WHERE expense_id = $1
        ORDER BY position ASC
        "#,
    )
    .bind(expense_id)
    .fetch_all(executor)
    .await
}

/// An item together with the expense header fields a price observation needs
#[derive(Debug, Clone, FromRow)]
pub struct ItemContext {
    pub item_id: Uuid,
    pub raw_label: String,
    pub article_id: Option<Uuid>,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: BigDecimal,
    pub supplier_id: Uuid,
    pub purchased_at: DateTime<Utc>,
    pub currency: String,
}

/// Item plus header, row-locked for a mapping update
pub async fn lock_item_context<'e, E>(executor: E, item_id: Uuid) -> Result<Option<ItemContext>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, ItemContext>(
        r#"
        SELECT ei.id AS item_id, ei.raw_label, ei.article_id, ei.quantity, ei.unit_price, ei.line_total,
               e.supplier_id, e.purchased_at, e.currency
        FROM expense_items ei
        INNER JOIN expenses e ON e.id = ei.expense_id
        WHERE ei.id = $1 AND e.is_posted AND e.deleted_at IS NULL
        FOR UPDATE OF ei
        "#,
    )
    .bind(item_id)
    .fetch_optional(executor)
    .await
}

pub async fn set_item_article<'e, E>(executor: E, item_id: Uuid, article_id: Uuid) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query("UPDATE expense_items SET article_id = $2 WHERE id = $1")
        .bind(item_id)
        .bind(article_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
