use std::{collections::HashMap, str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;
use uuid::Uuid;

use menu_core::{
    MenuItem, Order, OrderLine, OrderStatus, PaymentStatus, StaffMember, UserDetails,
};

const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Every pooled connection gets foreign keys, WAL and a busy timeout so
    /// concurrent order transactions queue on the write lock instead of failing.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the menu catalog tables.
    pub fn catalog(&self) -> CatalogRepository {
        CatalogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the per-day stock ledger.
    pub fn inventory(&self) -> InventoryRepository {
        InventoryRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for order headers and line items.
    pub fn orders(&self) -> OrderRepository {
        OrderRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for staff sessions.
    pub fn staff_sessions(&self) -> StaffSessionRepository {
        StaffSessionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A stored value could not be converted into its domain type.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {column} value '{value}'")]
pub struct DecodeError {
    pub column: &'static str,
    pub value: String,
}

fn parse_decimal(column: &'static str, raw: &str) -> Result<Decimal, DecodeError> {
    Decimal::from_str(raw).map_err(|_| DecodeError {
        column,
        value: raw.to_string(),
    })
}

fn sqlite_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    sqlite_code(err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        sqlite_code(err).as_deref(),
        Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Repository over `categories` and `menu_items`.
#[derive(Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    /// Categories left-joined with their items, using the static daily quantity.
    pub async fn list_menu_rows(&self) -> Result<Vec<MenuRow>, CatalogError> {
        let rows = sqlx::query_as::<_, MenuRow>(
            r#"
SELECT c.id AS category_id,
       c.name AS category_name,
       m.id AS item_id,
       m.name AS item_name,
       m.description,
       m.price,
       m.image_url,
       m.prep_time,
       m.available_qty,
       m.is_available,
       NULL AS current_stock
  FROM categories AS c
  LEFT JOIN menu_items AS m
    ON m.category_id = c.id
 ORDER BY c.display_order, c.name, m.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Same join as [`Self::list_menu_rows`] plus the given day's live stock.
    /// Items without a ledger record for the day fall back to the catalog quantity.
    pub async fn list_menu_rows_with_stock(&self, day: &str) -> Result<Vec<MenuRow>, CatalogError> {
        let rows = sqlx::query_as::<_, MenuRow>(
            r#"
SELECT c.id AS category_id,
       c.name AS category_name,
       m.id AS item_id,
       m.name AS item_name,
       m.description,
       m.price,
       m.image_url,
       m.prep_time,
       m.available_qty,
       m.is_available,
       COALESCE(di.current_stock, m.available_qty) AS current_stock
  FROM categories AS c
  LEFT JOIN menu_items AS m
    ON m.category_id = c.id
  LEFT JOIN daily_inventory AS di
    ON di.menu_item_id = m.id
   AND di.date = ?
 ORDER BY c.display_order, c.name, m.name
            "#,
        )
        .bind(day)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Loads a single catalog item.
    pub async fn fetch_item(&self, item_id: &str) -> Result<MenuItemRecord, CatalogError> {
        sqlx::query_as::<_, MenuItemRecord>(
            "SELECT id, category_id, name, description, price, image_url, prep_time, available_qty, is_available \
             FROM menu_items WHERE id = ?",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CatalogError::NotFound)
    }

    /// Reads the cached availability flag inside an open transaction.
    /// `None` means the item does not exist.
    pub async fn fetch_availability(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        item_id: &str,
    ) -> Result<Option<bool>, CatalogError> {
        let flag = sqlx::query_scalar::<_, bool>("SELECT is_available FROM menu_items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(flag)
    }

    /// Overwrites the availability flag.
    pub async fn set_availability(&self, item_id: &str, is_available: bool) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE menu_items SET is_available = ? WHERE id = ?")
            .bind(is_available)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound);
        }
        Ok(())
    }

    /// Inserts a product and returns its generated id.
    pub async fn create_product(&self, item: &NewMenuItem<'_>) -> Result<String, CatalogError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO menu_items \
             (id, category_id, name, description, price, image_url, prep_time, available_qty, is_available) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(item.category_id)
        .bind(item.name)
        .bind(item.description)
        .bind(item.price.to_string())
        .bind(item.image_url)
        .bind(item.prep_time)
        .bind(item.available_qty)
        .bind(item.is_available.unwrap_or(true))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                CatalogError::UnknownCategory
            } else {
                CatalogError::Database(err)
            }
        })?;

        Ok(id)
    }

    /// Replaces the editable fields of a product. A `None` category keeps
    /// the current one.
    pub async fn update_product(&self, item_id: &str, item: &NewMenuItem<'_>) -> Result<(), CatalogError> {
        let result = sqlx::query(
            "UPDATE menu_items \
             SET category_id = COALESCE(?, category_id), name = ?, description = ?, price = ?, \
                 image_url = ?, prep_time = ?, available_qty = ?, is_available = COALESCE(?, is_available) \
             WHERE id = ?",
        )
        .bind(item.category_id)
        .bind(item.name)
        .bind(item.description)
        .bind(item.price.to_string())
        .bind(item.image_url)
        .bind(item.prep_time)
        .bind(item.available_qty)
        .bind(item.is_available)
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                CatalogError::UnknownCategory
            } else {
                CatalogError::Database(err)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound);
        }
        Ok(())
    }

    /// Deletes a product. Products referenced by past orders are kept.
    pub async fn delete_product(&self, item_id: &str) -> Result<(), CatalogError> {
        let result = sqlx::query("DELETE FROM menu_items WHERE id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    CatalogError::InUse
                } else {
                    CatalogError::Database(err)
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound);
        }
        Ok(())
    }

    /// Creates a category at the end of the display order.
    pub async fn create_category(&self, name: &str) -> Result<String, CatalogError> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(CatalogError::InvalidName);
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO categories (id, name, slug, display_order) \
             VALUES (?, ?, ?, (SELECT COALESCE(MAX(display_order), 0) + 1 FROM categories))",
        )
        .bind(&id)
        .bind(name.trim())
        .bind(&slug)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                CatalogError::DuplicateCategory(slug.clone())
            } else {
                CatalogError::Database(err)
            }
        })?;

        Ok(id)
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Fields accepted when creating or updating a product.
pub struct NewMenuItem<'a> {
    pub category_id: Option<&'a str>,
    pub name: &'a str,
    pub description: &'a str,
    pub price: Decimal,
    pub image_url: &'a str,
    pub prep_time: &'a str,
    pub available_qty: i64,
    /// `None` keeps the stored flag on update and means available on insert.
    pub is_available: Option<bool>,
}

/// Row of the category/item join. Item columns are `NULL` for empty categories.
#[derive(Debug, sqlx::FromRow)]
pub struct MenuRow {
    pub category_id: String,
    pub category_name: String,
    pub item_id: Option<String>,
    pub item_name: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub image_url: Option<String>,
    pub prep_time: Option<String>,
    pub available_qty: Option<i64>,
    pub is_available: Option<bool>,
    pub current_stock: Option<i64>,
}

impl MenuRow {
    /// Converts the item half of the row. `current_stock`, when present,
    /// replaces the static quantity.
    pub fn item(&self) -> Result<Option<MenuItem>, DecodeError> {
        let Some(item_id) = self.item_id.clone() else {
            return Ok(None);
        };
        let price = parse_decimal("menu_items.price", self.price.as_deref().unwrap_or_default())?;
        let static_qty = self.available_qty.unwrap_or_default();

        Ok(Some(MenuItem {
            id: item_id,
            name: self.item_name.clone().unwrap_or_default(),
            description: self.description.clone().unwrap_or_default(),
            price,
            image: self.image_url.clone().unwrap_or_default(),
            prep_time: self.prep_time.clone().unwrap_or_default(),
            available_qty: self.current_stock.unwrap_or(static_qty),
            is_available: self.is_available.unwrap_or(false),
            category_id: Some(self.category_id.clone()),
            is_low_stock: None,
        }))
    }
}

/// Raw `menu_items` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MenuItemRecord {
    pub id: String,
    pub category_id: Option<String>,
    pub name: String,
    pub description: String,
    pub price: String,
    pub image_url: String,
    pub prep_time: String,
    pub available_qty: i64,
    pub is_available: bool,
}

impl MenuItemRecord {
    pub fn into_domain(self) -> Result<MenuItem, DecodeError> {
        let price = parse_decimal("menu_items.price", &self.price)?;
        Ok(MenuItem {
            id: self.id,
            name: self.name,
            description: self.description,
            price,
            image: self.image_url,
            prep_time: self.prep_time,
            available_qty: self.available_qty,
            is_available: self.is_available,
            category_id: self.category_id,
            is_low_stock: None,
        })
    }
}

/// Errors raised by catalog reads and writes.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("menu item not found")]
    NotFound,
    #[error("category does not exist")]
    UnknownCategory,
    #[error("category '{0}' already exists")]
    DuplicateCategory(String),
    #[error("category name must contain letters or digits")]
    InvalidName,
    #[error("menu item is referenced by existing orders")]
    InUse,
    #[error("failed to decode catalog row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Per-item, per-day stock counters.
///
/// All stock mutation goes through single SQL statements evaluated by
/// SQLite; nothing here reads a counter and writes it back.
#[derive(Clone)]
pub struct InventoryRepository {
    pool: SqlitePool,
}

impl InventoryRepository {
    /// Creates the day's baseline in its own transaction. See
    /// [`Self::ensure_baseline_in`].
    pub async fn ensure_baseline(
        &self,
        day: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, InventoryError> {
        let mut tx = self.pool.begin().await?;
        let created = self.ensure_baseline_in(&mut tx, day, now).await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Inserts a record for every catalog item that has none for `day`, with
    /// `initial_stock = current_stock = available_qty`. Existing records are
    /// never touched, so a day's consumed stock cannot be reset.
    ///
    /// Items whose most recent earlier record ended exhausted get their
    /// availability flag restored when the new baseline is positive.
    /// Returns the number of records created.
    pub async fn ensure_baseline_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        day: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, InventoryError> {
        // The WHERE clause keeps SQLite from parsing ON CONFLICT as a join constraint.
        let created: Vec<String> = sqlx::query_scalar(
            "INSERT INTO daily_inventory (menu_item_id, date, initial_stock, current_stock, updated_at) \
             SELECT id, ?, available_qty, available_qty, ? FROM menu_items WHERE 1 = 1 \
             ON CONFLICT(menu_item_id, date) DO NOTHING \
             RETURNING menu_item_id",
        )
        .bind(day)
        .bind(to_rfc3339(now))
        .fetch_all(&mut **tx)
        .await?;

        for item_id in &created {
            sqlx::query(
                "UPDATE menu_items SET is_available = 1 \
                 WHERE id = ? AND is_available = 0 AND available_qty > 0 \
                   AND (SELECT current_stock FROM daily_inventory \
                         WHERE menu_item_id = ? AND date < ? \
                         ORDER BY date DESC LIMIT 1) <= 0",
            )
            .bind(item_id)
            .bind(item_id)
            .bind(day)
            .execute(&mut **tx)
            .await?;
        }

        Ok(created.len() as u64)
    }

    /// Takes `quantity` units from the day's counter and returns what is left.
    ///
    /// The subtraction and the sufficiency check are one conditional UPDATE,
    /// so two transactions racing for the last unit cannot both succeed and
    /// the counter never goes below zero.
    pub async fn decrement(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        item_id: &str,
        day: &str,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }

        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE daily_inventory \
             SET current_stock = current_stock - ?, updated_at = ? \
             WHERE menu_item_id = ? AND date = ? AND current_stock >= ? \
             RETURNING current_stock",
        )
        .bind(quantity)
        .bind(to_rfc3339(now))
        .bind(item_id)
        .bind(day)
        .bind(quantity)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(remaining) = remaining {
            return Ok(remaining);
        }

        let current: Option<i64> = sqlx::query_scalar(
            "SELECT current_stock FROM daily_inventory WHERE menu_item_id = ? AND date = ?",
        )
        .bind(item_id)
        .bind(day)
        .fetch_optional(&mut **tx)
        .await?;

        match current {
            Some(remaining) => Err(InventoryError::Exhausted {
                item_id: item_id.to_string(),
                requested: quantity,
                remaining,
            }),
            None => Err(InventoryError::MissingRecord {
                item_id: item_id.to_string(),
            }),
        }
    }

    /// Clears `is_available` when the day's stock is at or below zero.
    /// Returns `true` when the flag flipped. Never sets the flag to `true`.
    pub async fn sync_availability(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        item_id: &str,
        day: &str,
    ) -> Result<bool, InventoryError> {
        let result = sqlx::query(
            "UPDATE menu_items SET is_available = 0 \
             WHERE id = ? AND is_available = 1 \
               AND (SELECT current_stock FROM daily_inventory \
                     WHERE menu_item_id = ? AND date = ?) <= 0",
        )
        .bind(item_id)
        .bind(item_id)
        .bind(day)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Adds stock to the day's counter without touching the availability flag.
    pub async fn restock(
        &self,
        item_id: &str,
        day: &str,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }

        let mut tx = self.pool.begin().await?;
        self.ensure_baseline_in(&mut tx, day, now).await?;
        let current: Option<i64> = sqlx::query_scalar(
            "UPDATE daily_inventory \
             SET current_stock = current_stock + ?, updated_at = ? \
             WHERE menu_item_id = ? AND date = ? \
             RETURNING current_stock",
        )
        .bind(quantity)
        .bind(to_rfc3339(now))
        .bind(item_id)
        .bind(day)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            return Err(InventoryError::MissingRecord {
                item_id: item_id.to_string(),
            });
        };
        tx.commit().await?;
        Ok(current)
    }

    /// Loads the record for one item and day.
    pub async fn fetch(
        &self,
        item_id: &str,
        day: &str,
    ) -> Result<Option<DailyInventoryRecord>, InventoryError> {
        let record = sqlx::query_as::<_, DailyInventoryRecord>(
            "SELECT menu_item_id, date, initial_stock, current_stock, updated_at \
             FROM daily_inventory WHERE menu_item_id = ? AND date = ?",
        )
        .bind(item_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Lists all records for a day.
    pub async fn list_for_day(&self, day: &str) -> Result<Vec<DailyInventoryRecord>, InventoryError> {
        let rows = sqlx::query_as::<_, DailyInventoryRecord>(
            "SELECT menu_item_id, date, initial_stock, current_stock, updated_at \
             FROM daily_inventory WHERE date = ? ORDER BY menu_item_id",
        )
        .bind(day)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// One item's stock for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DailyInventoryRecord {
    pub menu_item_id: String,
    pub date: String,
    pub initial_stock: i64,
    pub current_stock: i64,
    pub updated_at: DateTime<Utc>,
}

/// Errors raised by the stock ledger.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("no stock record for item {item_id}")]
    MissingRecord { item_id: String },
    #[error("insufficient stock for item {item_id}: requested {requested}, remaining {remaining}")]
    Exhausted {
        item_id: String,
        requested: i64,
        remaining: i64,
    },
    #[error("quantity must be positive (got {0})")]
    InvalidQuantity(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for order headers and their line items.
#[derive(Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Begins a SQLite transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Inserts the order header.
    pub async fn insert_header(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order: &Order,
    ) -> Result<(), OrderStoreError> {
        sqlx::query(
            "INSERT INTO orders \
             (id, session_id, table_id, cust_name, cust_phone, cust_email, payment_method, \
              payment_status, stripe_session_id, status, total_amount, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&order.id)
        .bind(&order.session_id)
        .bind(&order.table_id)
        .bind(non_empty(&order.user_details.name))
        .bind(non_empty(&order.user_details.phone))
        .bind(non_empty(&order.user_details.email))
        .bind(&order.payment_method)
        .bind(order.payment_status.as_str())
        .bind(order.stripe_session_id.as_deref())
        .bind(order.status.as_str())
        .bind(order.total.to_string())
        .bind(to_rfc3339(order.created_at))
        .execute(&mut **tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                OrderStoreError::Duplicate
            } else {
                OrderStoreError::Database(err)
            }
        })?;

        Ok(())
    }

    /// Appends a line item snapshot.
    pub async fn insert_line(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order_id: &str,
        line: &OrderLine,
    ) -> Result<(), OrderStoreError> {
        sqlx::query(
            "INSERT INTO order_items (order_id, menu_item_id, name, quantity, price) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(order_id)
        .bind(&line.item_id)
        .bind(&line.name)
        .bind(line.quantity)
        .bind(line.price.to_string())
        .execute(&mut **tx)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                OrderStoreError::UnknownItem(line.item_id.clone())
            } else {
                OrderStoreError::Database(err)
            }
        })?;

        Ok(())
    }

    /// Loads an order with its line items.
    pub async fn fetch(&self, order_id: &str) -> Result<Order, OrderStoreError> {
        let header = sqlx::query_as::<_, OrderRow>(&format!("{ORDER_COLUMNS} WHERE id = ?"))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OrderStoreError::NotFound)?;

        let lines = sqlx::query_as::<_, OrderLineRow>(
            "SELECT order_id, menu_item_id, name, quantity, price \
             FROM order_items WHERE order_id = ? ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        let lines = lines
            .into_iter()
            .map(OrderLineRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        header.into_domain(lines)
    }

    /// Lists orders oldest first, optionally restricted to one status.
    pub async fn list(&self, status: Option<OrderStatus>) -> Result<Vec<Order>, OrderStoreError> {
        let status = status.map(OrderStatus::as_str);
        let headers = sqlx::query_as::<_, OrderRow>(&format!(
            "{ORDER_COLUMNS} WHERE (? IS NULL OR status = ?) ORDER BY created_at ASC, id ASC"
        ))
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        let line_rows = sqlx::query_as::<_, OrderLineRow>(
            "SELECT oi.order_id, oi.menu_item_id, oi.name, oi.quantity, oi.price \
             FROM order_items AS oi \
             JOIN orders AS o ON o.id = oi.order_id \
             WHERE (? IS NULL OR o.status = ?) \
             ORDER BY oi.id",
        )
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        let mut lines_by_order: HashMap<String, Vec<OrderLine>> = HashMap::new();
        for row in line_rows {
            let order_id = row.order_id.clone();
            lines_by_order
                .entry(order_id)
                .or_default()
                .push(row.into_domain()?);
        }

        headers
            .into_iter()
            .map(|header| {
                let lines = lines_by_order.remove(&header.id).unwrap_or_default();
                header.into_domain(lines)
            })
            .collect()
    }

    /// Returns the current status, or `NotFound`.
    pub async fn fetch_status(&self, order_id: &str) -> Result<OrderStatus, OrderStoreError> {
        let raw: String = sqlx::query_scalar("SELECT status FROM orders WHERE id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OrderStoreError::NotFound)?;

        OrderStatus::from_str(&raw).map_err(|_| {
            OrderStoreError::Decode(DecodeError {
                column: "orders.status",
                value: raw,
            })
        })
    }

    /// Moves the order from `expected` to `next`. Returns `false` when the
    /// stored status is no longer `expected`.
    pub async fn update_status(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, OrderStoreError> {
        let result = sqlx::query("UPDATE orders SET status = ? WHERE id = ? AND status = ?")
            .bind(next.as_str())
            .bind(order_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

const ORDER_COLUMNS: &str = "SELECT id, session_id, table_id, cust_name, cust_phone, cust_email, \
     payment_method, payment_status, stripe_session_id, status, total_amount, created_at FROM orders";

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: String,
    session_id: String,
    table_id: String,
    cust_name: Option<String>,
    cust_phone: Option<String>,
    cust_email: Option<String>,
    payment_method: String,
    payment_status: String,
    stripe_session_id: Option<String>,
    status: String,
    total_amount: String,
    created_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_domain(self, items: Vec<OrderLine>) -> Result<Order, OrderStoreError> {
        let status = OrderStatus::from_str(&self.status).map_err(|_| DecodeError {
            column: "orders.status",
            value: self.status.clone(),
        })?;
        let payment_status =
            PaymentStatus::from_str(&self.payment_status).map_err(|_| DecodeError {
                column: "orders.payment_status",
                value: self.payment_status.clone(),
            })?;
        let total = parse_decimal("orders.total_amount", &self.total_amount)?;

        Ok(Order {
            id: self.id,
            session_id: self.session_id,
            table_id: self.table_id,
            user_details: UserDetails {
                name: self.cust_name.unwrap_or_default(),
                phone: self.cust_phone.unwrap_or_default(),
                email: self.cust_email.unwrap_or_default(),
            },
            payment_method: self.payment_method,
            payment_status,
            stripe_session_id: self.stripe_session_id,
            status,
            items,
            total,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderLineRow {
    order_id: String,
    menu_item_id: String,
    name: String,
    quantity: i64,
    price: String,
}

impl OrderLineRow {
    fn into_domain(self) -> Result<OrderLine, DecodeError> {
        Ok(OrderLine {
            price: parse_decimal("order_items.price", &self.price)?,
            item_id: self.menu_item_id,
            name: self.name,
            quantity: self.quantity,
        })
    }
}

/// Errors raised while persisting or reading orders.
#[derive(Debug, Error)]
pub enum OrderStoreError {
    #[error("order not found")]
    NotFound,
    #[error("order already exists")]
    Duplicate,
    #[error("menu item {0} does not exist")]
    UnknownItem(String),
    #[error("failed to decode order row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for opaque staff session tokens.
#[derive(Clone)]
pub struct StaffSessionRepository {
    pool: SqlitePool,
}

impl StaffSessionRepository {
    /// Opens a session for an active staff member and returns its token.
    pub async fn create(&self, staff_id: &str, now: DateTime<Utc>) -> Result<String, SessionError> {
        let token = Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT INTO staff_sessions (id, staff_id, login_at, is_active) \
             SELECT ?, id, ?, 1 FROM staff WHERE id = ? AND is_active = 1",
        )
        .bind(&token)
        .bind(to_rfc3339(now))
        .bind(staff_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionError::UnknownStaff);
        }
        Ok(token)
    }

    /// Resolves a token to its staff member. Ended sessions and deactivated
    /// staff are rejected.
    pub async fn validate(&self, token: &str) -> Result<StaffMember, SessionError> {
        let row = sqlx::query(
            "SELECT s.id, s.name, s.email, s.role, s.job_title \
               FROM staff_sessions AS ss \
               JOIN staff AS s ON s.id = ss.staff_id \
              WHERE ss.id = ? AND ss.is_active = 1 AND s.is_active = 1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SessionError::Invalid)?;

        Ok(StaffMember {
            id: row.get("id"),
            name: row.get("name"),
            email: row.get("email"),
            role: row.get("role"),
            job_title: row.get("job_title"),
        })
    }

    /// Ends a session.
    pub async fn end(&self, token: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        let result = sqlx::query(
            "UPDATE staff_sessions SET logout_at = ?, is_active = 0 WHERE id = ? AND is_active = 1",
        )
        .bind(to_rfc3339(now))
        .bind(token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionError::Invalid);
        }
        Ok(())
    }

    /// Lists staff members holding at least one active session.
    pub async fn list_active(&self) -> Result<Vec<StaffMember>, SessionError> {
        let rows = sqlx::query(
            "SELECT DISTINCT s.id, s.name, s.email, s.role, s.job_title \
               FROM staff AS s \
               JOIN staff_sessions AS ss ON ss.staff_id = s.id \
              WHERE ss.is_active = 1 AND s.is_active = 1 \
              ORDER BY s.name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StaffMember {
                id: row.get("id"),
                name: row.get("name"),
                email: row.get("email"),
                role: row.get("role"),
                job_title: row.get("job_title"),
            })
            .collect())
    }
}

/// Errors raised by session lookups.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is missing or no longer active")]
    Invalid,
    #[error("staff member does not exist or is inactive")]
    UnknownStaff,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
