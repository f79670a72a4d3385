use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use menu_core::{Cart, CartError, Order, OrderLine, OrderStatus, PaymentStatus};
use menu_storage::{CatalogError, Database, InventoryError, OrderStoreError};

use crate::day::BusinessCalendar;
use crate::notification::NotificationDispatcher;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Turns carts into committed orders.
///
/// The header, every line snapshot and every stock decrement share one
/// SQLite transaction. The confirmation message is spawned only after commit.
#[derive(Clone)]
pub struct OrderExecutor {
    database: Database,
    calendar: BusinessCalendar,
    notifier: NotificationDispatcher,
}

/// A committed order and the handle of its detached confirmation task.
#[derive(Debug)]
pub struct PlacedOrder {
    pub order: Order,
    pub notification: JoinHandle<()>,
}

impl OrderExecutor {
    pub fn new(
        database: Database,
        calendar: BusinessCalendar,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            database,
            calendar,
            notifier,
        }
    }

    pub async fn place_order(&self, cart: &Cart) -> Result<PlacedOrder, PlaceOrderError> {
        let started = Instant::now();
        let result = self.commit_order(cart).await;
        histogram!("order_place_seconds").record(started.elapsed().as_secs_f64());

        let order = match result {
            Ok(order) => order,
            Err(err) => {
                counter!("orders_failed_total", "reason" => err.reason()).increment(1);
                match &err {
                    PlaceOrderError::Database(_)
                    | PlaceOrderError::Inventory(_)
                    | PlaceOrderError::Store(_)
                    | PlaceOrderError::Catalog(_) => {
                        error!(stage = "order", session_id = %cart.session_id, error = %err, "order transaction failed");
                    }
                    _ => {
                        warn!(stage = "order", session_id = %cart.session_id, reason = err.reason(), error = %err, "order rejected");
                    }
                }
                return Err(err);
            }
        };

        counter!("orders_placed_total").increment(1);
        info!(
            stage = "order",
            order_id = %order.id,
            table_id = %order.table_id,
            lines = order.items.len(),
            total = %order.total,
            "order placed"
        );

        let notification = self.notifier.dispatch(order.clone());
        Ok(PlacedOrder {
            order,
            notification,
        })
    }

    async fn commit_order(&self, cart: &Cart) -> Result<Order, PlaceOrderError> {
        let total = cart.validate()?;
        let now = self.calendar.now();
        let day = self.calendar.day_of(now);

        let order = Order {
            id: Uuid::new_v4().to_string(),
            session_id: cart.session_id.clone(),
            table_id: cart.table_id.clone(),
            user_details: cart.user_details.clone(),
            payment_method: cart.payment_method.clone(),
            payment_status: PaymentStatus::Pending,
            stripe_session_id: None,
            status: OrderStatus::Pending,
            items: cart.items.iter().map(OrderLine::from).collect(),
            total,
            created_at: now,
        };

        let mut tx = self.database.orders().begin().await?;
        match self.write_order(&mut tx, &order, &day, now).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(order)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(stage = "order", order_id = %order.id, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn write_order(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        order: &Order,
        day: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PlaceOrderError> {
        let catalog = self.database.catalog();
        let inventory = self.database.inventory();
        let orders = self.database.orders();

        // First statement is a write so the transaction takes the lock up front.
        let created = inventory.ensure_baseline_in(tx, day, now).await?;
        if created > 0 {
            info!(stage = "inventory", day, created, "daily inventory baseline created");
        }

        orders.insert_header(tx, order).await?;

        for line in &order.items {
            match catalog.fetch_availability(tx, &line.item_id).await? {
                None => return Err(PlaceOrderError::UnknownItem(line.item_id.clone())),
                Some(false) => return Err(PlaceOrderError::ItemUnavailable(line.item_id.clone())),
                Some(true) => {}
            }

            orders.insert_line(tx, &order.id, line).await?;
            let remaining = inventory
                .decrement(tx, &line.item_id, day, line.quantity, now)
                .await?;
            debug!(stage = "inventory", item_id = %line.item_id, day, remaining, "stock decremented");

            if inventory.sync_availability(tx, &line.item_id, day).await? {
                counter!("inventory_exhausted_total").increment(1);
                info!(stage = "inventory", item_id = %line.item_id, day, "item sold out for the day");
            }
        }

        Ok(())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Order, OrderStoreError> {
        self.database.orders().fetch(order_id).await
    }
}

#[derive(Debug, Error)]
pub enum PlaceOrderError {
    #[error("invalid order: {0}")]
    Invalid(#[from] CartError),
    #[error("menu item {0} does not exist")]
    UnknownItem(String),
    #[error("menu item {0} is not available")]
    ItemUnavailable(String),
    #[error("insufficient stock for {item_id}: requested {requested}, remaining {remaining}")]
    StockExhausted {
        item_id: String,
        requested: i64,
        remaining: i64,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("inventory error: {0}")]
    Inventory(InventoryError),
    #[error("order store error: {0}")]
    Store(OrderStoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl PlaceOrderError {
    /// Metric label for the failure.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "validation",
            Self::UnknownItem(_) => "unknown_item",
            Self::ItemUnavailable(_) => "unavailable",
            Self::StockExhausted { .. } => "stock_exhausted",
            Self::Database(_) | Self::Inventory(_) | Self::Store(_) | Self::Catalog(_) => {
                "persistence"
            }
        }
    }
}

impl From<InventoryError> for PlaceOrderError {
    fn from(value: InventoryError) -> Self {
        match value {
            InventoryError::Exhausted {
                item_id,
                requested,
                remaining,
            } => Self::StockExhausted {
                item_id,
                requested,
                remaining,
            },
            InventoryError::MissingRecord { item_id } => Self::UnknownItem(item_id),
            other => Self::Inventory(other),
        }
    }
}

impl From<OrderStoreError> for PlaceOrderError {
    fn from(value: OrderStoreError) -> Self {
        match value {
            OrderStoreError::UnknownItem(item_id) => Self::UnknownItem(item_id),
            other => Self::Store(other),
        }
    }
}

impl From<PlaceOrderError> for ProblemResponse {
    fn from(value: PlaceOrderError) -> Self {
        match value {
            PlaceOrderError::Invalid(err) => {
                ProblemResponse::bad_request("invalid_order", err.to_string())
            }
            PlaceOrderError::UnknownItem(_) => ProblemResponse::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "unknown_item",
                value.to_string(),
            ),
            PlaceOrderError::ItemUnavailable(_) => {
                ProblemResponse::conflict("item_unavailable", value.to_string())
            }
            PlaceOrderError::StockExhausted { .. } => {
                ProblemResponse::conflict("stock_exhausted", value.to_string())
            }
            _ => ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "order_failed",
                "order failed",
            ),
        }
    }
}

pub async fn place(
    State(state): State<AppState>,
    Json(cart): Json<Cart>,
) -> Result<(StatusCode, Json<Order>), ProblemResponse> {
    let placed = state.orders().place_order(&cart).await?;
    Ok((StatusCode::CREATED, Json(placed.order)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<Order>, ProblemResponse> {
    match state.orders().get_order(&order_id).await {
        Ok(order) => Ok(Json(order)),
        Err(OrderStoreError::NotFound) => Err(ProblemResponse::not_found(
            "order_not_found",
            format!("order {order_id} does not exist"),
        )),
        Err(err) => {
            error!(stage = "order", order_id = %order_id, error = %err, "failed to load order");
            Err(ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "order_lookup_failed",
                "failed to load order",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    use chrono::TimeZone;
    use httpmock::prelude::*;
    use menu_core::{CartLine, UserDetails};
    use menu_notify::{MessageTemplate, WhatsAppClient};
    use rust_decimal::Decimal;
    use url::Url;

    const DAY: &str = "2024-01-01";

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn calendar() -> BusinessCalendar {
        BusinessCalendar::new("UTC")
            .expect("tz")
            .with_clock(Arc::new(fixed_now))
    }

    fn template() -> MessageTemplate {
        MessageTemplate {
            restaurant_name: "The Menu Restaurant".into(),
            menu_link: "https://menu.example.com".into(),
        }
    }

    async fn seed(database: &Database, items: &[(&str, i64)]) {
        sqlx::query(
            "INSERT INTO categories (id, name, slug, display_order) VALUES ('c-1', 'Mains', 'mains', 1)",
        )
        .execute(database.pool())
        .await
        .expect("insert category");
        for (id, qty) in items {
            sqlx::query(
                "INSERT INTO menu_items (id, category_id, name, price, available_qty, is_available) \
                 VALUES (?, 'c-1', ?, '5.00', ?, 1)",
            )
            .bind(id)
            .bind(format!("Item {id}"))
            .bind(qty)
            .execute(database.pool())
            .await
            .expect("insert item");
        }
    }

    async fn memory_database(items: &[(&str, i64)]) -> Database {
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");
        seed(&database, items).await;
        database
    }

    fn executor(database: &Database) -> OrderExecutor {
        OrderExecutor::new(
            database.clone(),
            calendar(),
            NotificationDispatcher::disabled(template()),
        )
    }

    fn cart(lines: &[(&str, i64)]) -> Cart {
        let items: Vec<CartLine> = lines
            .iter()
            .map(|(id, quantity)| CartLine {
                item_id: id.to_string(),
                name: format!("Item {id}"),
                price: Decimal::new(500, 2),
                quantity: *quantity,
            })
            .collect();
        let total = items.iter().filter_map(CartLine::line_total).sum();
        Cart {
            session_id: "session-1".into(),
            table_id: "table-4".into(),
            user_details: UserDetails {
                name: "Ana".into(),
                phone: "+15551112222".into(),
                email: "ana@example.com".into(),
            },
            payment_method: "cash".into(),
            items,
            total,
        }
    }

    async fn stock(database: &Database, item_id: &str) -> i64 {
        database
            .inventory()
            .fetch(item_id, DAY)
            .await
            .expect("fetch record")
            .expect("record exists")
            .current_stock
    }

    async fn available(database: &Database, item_id: &str) -> bool {
        database
            .catalog()
            .fetch_item(item_id)
            .await
            .expect("item")
            .is_available
    }

    async fn open_day(database: &Database) {
        database
            .inventory()
            .ensure_baseline(DAY, fixed_now())
            .await
            .expect("baseline");
    }

    async fn order_rows(database: &Database) -> (i64, i64) {
        let headers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(database.pool())
            .await
            .expect("count orders");
        let lines: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM order_items")
            .fetch_one(database.pool())
            .await
            .expect("count lines");
        (headers, lines)
    }

    #[tokio::test]
    async fn order_within_stock_is_committed() {
        let database = memory_database(&[("A", 3)]).await;
        let executor = executor(&database);

        let placed = executor.place_order(&cart(&[("A", 2)])).await.expect("order");
        placed.notification.await.expect("notification task");

        assert_eq!(placed.order.status, OrderStatus::Pending);
        assert_eq!(placed.order.payment_status, PaymentStatus::Pending);
        assert_eq!(placed.order.total, Decimal::new(1000, 2));
        assert_eq!(stock(&database, "A").await, 1);
        assert!(available(&database, "A").await);

        let stored = executor.get_order(&placed.order.id).await.expect("stored");
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].quantity, 2);
        assert_eq!(stored.user_details.email, "ana@example.com");
    }

    #[tokio::test]
    async fn order_beyond_stock_is_rejected_without_side_effects() {
        let database = memory_database(&[("A", 1)]).await;
        let executor = executor(&database);
        open_day(&database).await;

        let err = executor.place_order(&cart(&[("A", 2)])).await.unwrap_err();
        assert!(matches!(
            err,
            PlaceOrderError::StockExhausted { requested: 2, remaining: 1, .. }
        ));

        assert_eq!(stock(&database, "A").await, 1);
        assert!(available(&database, "A").await);
        assert_eq!(order_rows(&database).await, (0, 0));
    }

    #[tokio::test]
    async fn later_line_failure_rolls_back_earlier_lines() {
        let database = memory_database(&[("A", 5), ("B", 1)]).await;
        let executor = executor(&database);
        open_day(&database).await;

        let err = executor
            .place_order(&cart(&[("A", 2), ("B", 3)]))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "stock_exhausted");

        assert_eq!(stock(&database, "A").await, 5);
        assert_eq!(stock(&database, "B").await, 1);
        assert_eq!(order_rows(&database).await, (0, 0));
    }

    #[tokio::test]
    async fn exhausting_stock_flips_availability() {
        let database = memory_database(&[("A", 2)]).await;
        let executor = executor(&database);

        executor.place_order(&cart(&[("A", 2)])).await.expect("order");
        assert_eq!(stock(&database, "A").await, 0);
        assert!(!available(&database, "A").await);

        let err = executor.place_order(&cart(&[("A", 1)])).await.unwrap_err();
        assert!(matches!(err, PlaceOrderError::ItemUnavailable(id) if id == "A"));
    }

    #[tokio::test]
    async fn unknown_item_aborts_order() {
        let database = memory_database(&[("A", 5)]).await;
        let executor = executor(&database);
        open_day(&database).await;

        let err = executor
            .place_order(&cart(&[("A", 1), ("ghost", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, PlaceOrderError::UnknownItem(id) if id == "ghost"));
        assert_eq!(stock(&database, "A").await, 5);
        assert_eq!(order_rows(&database).await, (0, 0));
    }

    #[tokio::test]
    async fn rejected_first_order_of_the_day_leaves_no_baseline() {
        let database = memory_database(&[("A", 1)]).await;
        let executor = executor(&database);

        let err = executor.place_order(&cart(&[("A", 2)])).await.unwrap_err();
        assert_eq!(err.reason(), "stock_exhausted");

        let record = database.inventory().fetch("A", DAY).await.expect("fetch record");
        assert!(record.is_none());
        assert_eq!(order_rows(&database).await, (0, 0));
    }

    #[tokio::test]
    async fn invalid_cart_never_touches_the_store() {
        let database = memory_database(&[("A", 5)]).await;
        let executor = executor(&database);

        let mut bad_total = cart(&[("A", 1)]);
        bad_total.total = Decimal::new(1, 0);
        let err = executor.place_order(&bad_total).await.unwrap_err();
        assert!(matches!(err, PlaceOrderError::Invalid(CartError::TotalMismatch { .. })));

        let err = executor.place_order(&cart(&[])).await.unwrap_err();
        assert!(matches!(err, PlaceOrderError::Invalid(CartError::Empty)));

        let records = database.inventory().list_for_day(DAY).await.expect("records");
        assert!(records.is_empty());
    }

    async fn file_database(dir: &tempfile::TempDir, items: &[(&str, i64)]) -> Database {
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("orders.db").display()
        );
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");
        seed(&database, items).await;
        database
    }

    async fn race(executor: &OrderExecutor, takers: usize) -> usize {
        let mut tasks = Vec::with_capacity(takers);
        for _ in 0..takers {
            let executor = executor.clone();
            tasks.push(tokio::spawn(async move {
                executor.place_order(&cart(&[("A", 1)])).await
            }));
        }

        let mut succeeded = 0;
        for task in tasks {
            match task.await.expect("task") {
                Ok(_) => succeeded += 1,
                Err(err) => assert!(
                    matches!(
                        err,
                        PlaceOrderError::StockExhausted { .. } | PlaceOrderError::ItemUnavailable(_)
                    ),
                    "unexpected failure: {err}"
                ),
            }
        }
        succeeded
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_consume_exact_stock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let database = file_database(&dir, &[("A", 8)]).await;
        let executor = executor(&database);

        assert_eq!(race(&executor, 8).await, 8);
        assert_eq!(stock(&database, "A").await, 0);
        assert!(!available(&database, "A").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_never_oversell() {
        let dir = tempfile::tempdir().expect("tempdir");
        let database = file_database(&dir, &[("A", 7)]).await;
        let executor = executor(&database);

        assert_eq!(race(&executor, 8).await, 7);
        assert_eq!(stock(&database, "A").await, 0);
        assert_eq!(order_rows(&database).await, (7, 7));
    }

    #[tokio::test]
    async fn failing_provider_does_not_affect_the_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/Accounts/AC1/Messages.json");
                then.status(500).body("provider down");
            })
            .await;

        let database = memory_database(&[("A", 3)]).await;
        let client = WhatsAppClient::new(
            "AC1",
            "token",
            "+15550000000",
            Url::parse(&server.url("/api/")).expect("url"),
            reqwest::Client::new(),
        );
        let executor = OrderExecutor::new(
            database.clone(),
            calendar(),
            NotificationDispatcher::with_client(client, template()),
        );

        let placed = executor.place_order(&cart(&[("A", 1)])).await.expect("order");
        placed.notification.await.expect("notification task");

        let stored = executor.get_order(&placed.order.id).await.expect("stored");
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(stock(&database, "A").await, 2);
    }

    #[tokio::test]
    async fn hanging_provider_does_not_delay_the_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/Accounts/AC1/Messages.json");
                then.status(201).delay(Duration::from_secs(3));
            })
            .await;

        let database = memory_database(&[("A", 3)]).await;
        let client = WhatsAppClient::new(
            "AC1",
            "token",
            "+15550000000",
            Url::parse(&server.url("/api/")).expect("url"),
            reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("client"),
        );
        let executor = OrderExecutor::new(
            database.clone(),
            calendar(),
            NotificationDispatcher::with_client(client, template()),
        );

        let started = Instant::now();
        let placed = executor.place_order(&cart(&[("A", 1)])).await.expect("order");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!placed.notification.is_finished());
        placed.notification.abort();

        let stored = executor.get_order(&placed.order.id).await.expect("stored");
        assert_eq!(stored.status, OrderStatus::Pending);
    }
}
