use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;

use menu_storage::Database;

use crate::day::BusinessCalendar;
use crate::menu::{self, MenuCatalog};
use crate::notification::NotificationDispatcher;
use crate::order::{self, OrderExecutor};
use crate::{staff, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    calendar: BusinessCalendar,
    orders: OrderExecutor,
    catalog: MenuCatalog,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        calendar: BusinessCalendar,
        notifier: NotificationDispatcher,
        restaurant_name: &str,
        low_stock_threshold: i64,
    ) -> Self {
        let orders = OrderExecutor::new(storage.clone(), calendar.clone(), notifier);
        let catalog = MenuCatalog::new(
            storage.clone(),
            calendar.clone(),
            restaurant_name,
            low_stock_threshold,
        );
        Self {
            metrics,
            storage,
            calendar,
            orders,
            catalog,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    pub fn orders(&self) -> &OrderExecutor {
        &self.orders
    }

    pub fn catalog(&self) -> &MenuCatalog {
        &self.catalog
    }
}

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/menu", get(menu::get_menu))
        .route("/orders", post(order::place))
        .route("/orders/:id", get(order::fetch))
        .route("/staff/menu", get(staff::staff_menu))
        .route("/staff/menu/:id", get(staff::get_menu_item))
        .route("/staff/menu/:id/toggle", put(staff::toggle_availability))
        .route("/staff/menu/:id/stock", put(staff::restock))
        .route("/staff/orders", get(staff::list_orders))
        .route("/staff/orders/:id/status", put(staff::update_order_status))
        .route("/staff/logout", post(staff::logout))
        .route("/staff/active", get(staff::active_staff))
        .route("/products", post(staff::create_product))
        .route(
            "/products/:id",
            put(staff::update_product).delete(staff::delete_product),
        )
        .route("/categories", post(staff::create_category));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::http::Request;
    use chrono::{DateTime, TimeZone, Utc};
    use http_body_util::BodyExt;
    use menu_notify::MessageTemplate;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TOKEN: &str = "session-token-1";

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    async fn setup_state() -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");

        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        sqlx::query(
            "INSERT INTO categories (id, name, slug, display_order) VALUES ('c-1', 'Mains', 'mains', 1)",
        )
        .execute(database.pool())
        .await
        .expect("insert category");
        sqlx::query(
            "INSERT INTO menu_items (id, category_id, name, price, available_qty, is_available) VALUES \
             ('A', 'c-1', 'Soup', '5.00', 3, 1), ('B', 'c-1', 'Pie', '4.00', 1, 1)",
        )
        .execute(database.pool())
        .await
        .expect("insert items");
        sqlx::query(
            "INSERT INTO staff (id, name, email, role, is_active, created_at) \
             VALUES ('st-1', 'Sam', 'sam@example.com', 'staff', 1, '2024-01-01T00:00:00Z')",
        )
        .execute(database.pool())
        .await
        .expect("insert staff");
        sqlx::query(
            "INSERT INTO staff_sessions (id, staff_id, login_at, is_active) \
             VALUES (?, 'st-1', '2024-01-01T08:00:00Z', 1)",
        )
        .bind(TOKEN)
        .execute(database.pool())
        .await
        .expect("insert session");

        let calendar = BusinessCalendar::new("UTC")
            .expect("tz")
            .with_clock(Arc::new(fixed_now));
        let notifier = NotificationDispatcher::disabled(MessageTemplate {
            restaurant_name: "Test Kitchen".into(),
            menu_link: "https://menu.example.com".into(),
        });
        AppState::new(metrics, database, calendar, notifier, "Test Kitchen", 5)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn cart(item: &str, quantity: i64, price: f64) -> Value {
        json!({
            "sessionId": "s-1",
            "tableId": "t-2",
            "userDetails": { "name": "Ana", "phone": "", "email": "" },
            "paymentMethod": "cash",
            "items": [{ "id": item, "name": "Soup", "price": price, "quantity": quantity }],
            "total": price * quantity as f64
        })
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(setup_state().await);
        let (status, _) = send(&app, get_request("/healthz", None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(setup_state().await);

        let response = app
            .oneshot(get_request("/metrics", None))
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn public_menu_lists_categories() {
        let app = app_router(setup_state().await);
        let (status, body) = send(&app, get_request("/api/menu", None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["restaurantName"], "Test Kitchen");
        assert_eq!(body["categories"][0]["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn placing_an_order_returns_created_order() {
        let app = app_router(setup_state().await);

        let (status, body) =
            send(&app, json_request("POST", "/api/orders", None, cart("A", 2, 5.0))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["paymentStatus"], "pending");
        assert_eq!(body["total"], 10.0);

        let id = body["id"].as_str().expect("order id").to_string();
        let (status, fetched) = send(&app, get_request(&format!("/api/orders/{id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["items"][0]["quantity"], 2);
    }

    #[tokio::test]
    async fn order_errors_map_to_problem_responses() {
        let app = app_router(setup_state().await);

        let (status, body) =
            send(&app, json_request("POST", "/api/orders", None, cart("B", 2, 4.0))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "stock_exhausted");

        let (status, body) =
            send(&app, json_request("POST", "/api/orders", None, cart("ghost", 1, 1.0))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["type"], "unknown_item");

        let mut bad = cart("A", 1, 5.0);
        bad["total"] = json!(99);
        let (status, body) = send(&app, json_request("POST", "/api/orders", None, bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_order");

        let (status, _) = send(&app, get_request("/api/orders/missing", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn staff_routes_require_a_session() {
        let app = app_router(setup_state().await);

        let (status, body) = send(&app, get_request("/api/staff/orders", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "missing_session");

        let (status, body) = send(&app, get_request("/api/staff/orders", Some("bogus"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "invalid_session");

        let (status, body) = send(&app, get_request("/api/staff/menu", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["categories"][0]["items"][0]["isLowStock"], true);
    }

    #[tokio::test]
    async fn status_updates_follow_the_lifecycle() {
        let app = app_router(setup_state().await);
        let (_, order) =
            send(&app, json_request("POST", "/api/orders", None, cart("A", 1, 5.0))).await;
        let id = order["id"].as_str().expect("order id").to_string();
        let uri = format!("/api/staff/orders/{id}/status");

        let (status, body) = send(
            &app,
            json_request("PUT", &uri, Some(TOKEN), json!({ "status": "preparing" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "preparing");

        let (status, body) = send(
            &app,
            json_request("PUT", &uri, Some(TOKEN), json!({ "status": "pending" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "invalid_transition");

        let (status, body) = send(
            &app,
            json_request("PUT", &uri, Some(TOKEN), json!({ "status": "served" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_status");

        let (status, body) =
            send(&app, get_request("/api/staff/orders?status=preparing", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn toggle_on_is_refused_while_sold_out() {
        let app = app_router(setup_state().await);
        let (status, _) =
            send(&app, json_request("POST", "/api/orders", None, cart("B", 1, 4.0))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/api/staff/menu/B/toggle",
                Some(TOKEN),
                json!({ "isAvailable": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "stock_exhausted");

        let (status, body) = send(
            &app,
            json_request("PUT", "/api/staff/menu/B/stock", Some(TOKEN), json!({ "quantity": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentStock"], 2);

        // restock alone leaves the item switched off
        let (_, item) = send(&app, get_request("/api/staff/menu/B", Some(TOKEN))).await;
        assert_eq!(item["isAvailable"], false);

        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/api/staff/menu/B/toggle",
                Some(TOKEN),
                json!({ "isAvailable": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isAvailable"], true);
    }

    #[tokio::test]
    async fn toggle_rejects_malformed_body() {
        let app = app_router(setup_state().await);

        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/api/staff/menu/A/toggle",
                Some(TOKEN),
                json!({ "isAvailable": "no" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_body");
        let (_, item) = send(&app, get_request("/api/staff/menu/A", Some(TOKEN))).await;
        assert_eq!(item["isAvailable"], true);

        let request = Request::builder()
            .method("PUT")
            .uri("/api/staff/menu/A/toggle")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isAvailable"], false);
    }

    #[tokio::test]
    async fn product_edit_cannot_re_enable_sold_out_item() {
        let app = app_router(setup_state().await);
        let (status, _) =
            send(&app, json_request("POST", "/api/orders", None, cart("B", 1, 4.0))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            &app,
            json_request(
                "PUT",
                "/api/products/B",
                Some(TOKEN),
                json!({ "name": "Pie", "price": 4.5, "availableQty": 1 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, item) = send(&app, get_request("/api/staff/menu/B", Some(TOKEN))).await;
        assert_eq!(item["name"], "Pie");
        assert_eq!(item["isAvailable"], false);

        let (status, body) = send(
            &app,
            json_request(
                "PUT",
                "/api/products/B",
                Some(TOKEN),
                json!({ "name": "Pie", "price": 4.5, "availableQty": 1, "isAvailable": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "stock_exhausted");
        let (_, item) = send(&app, get_request("/api/staff/menu/B", Some(TOKEN))).await;
        assert_eq!(item["isAvailable"], false);
    }

    #[tokio::test]
    async fn logout_ends_the_session() {
        let app = app_router(setup_state().await);

        let (status, body) = send(&app, get_request("/api/staff/active", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "Sam");

        let (status, _) = send(
            &app,
            json_request("POST", "/api/staff/logout", Some(TOKEN), Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, get_request("/api/staff/active", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn product_and_category_management() {
        let app = app_router(setup_state().await);

        let (status, category) = send(
            &app,
            json_request("POST", "/api/categories", Some(TOKEN), json!({ "name": "Drinks" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let category_id = category["id"].as_str().expect("category id").to_string();

        let (status, product) = send(
            &app,
            json_request(
                "POST",
                "/api/products",
                Some(TOKEN),
                json!({
                    "name": "Lemonade",
                    "price": 3.5,
                    "availableQty": 12,
                    "categoryId": category_id
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let product_id = product["id"].as_str().expect("product id").to_string();

        let (status, _) = send(
            &app,
            json_request(
                "PUT",
                &format!("/api/products/{product_id}"),
                Some(TOKEN),
                json!({ "name": "Lemonade", "price": 4.0, "availableQty": 10 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, item) = send(
            &app,
            get_request(&format!("/api/staff/menu/{product_id}"), Some(TOKEN)),
        )
        .await;
        assert_eq!(item["price"], 4.0);
        assert_eq!(item["categoryId"], category_id.as_str());

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/products/{product_id}"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            &app,
            json_request("POST", "/api/products", Some(TOKEN), json!({ "name": " ", "price": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_product");
    }
}
