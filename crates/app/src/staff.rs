use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use menu_core::{MenuData, MenuItem, Order, OrderStatus, StaffMember, StatusTransitionError};
use menu_storage::{CatalogError, InventoryError, NewMenuItem, OrderStoreError, SessionError};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Resolves the caller's session token. Accepts `Authorization: Bearer <token>`
/// and the bare token.
pub async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<StaffMember, ProblemResponse> {
    let token = session_token(headers).ok_or_else(|| {
        ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "missing_session",
            "staff session token is required",
        )
    })?;

    state
        .storage()
        .staff_sessions()
        .validate(token)
        .await
        .map_err(|err| match err {
            SessionError::Invalid | SessionError::UnknownStaff => ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "invalid_session",
                "staff session is not active",
            ),
            SessionError::Database(err) => {
                error!(stage = "staff", error = %err, "failed to validate session");
                internal_error("failed to validate session")
            }
        })
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match raw.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => raw,
    };
    (!token.is_empty()).then_some(token)
}

fn internal_error(detail: &'static str) -> ProblemResponse {
    ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
}

fn catalog_problem(err: CatalogError, item_id: &str) -> ProblemResponse {
    match err {
        CatalogError::NotFound => ProblemResponse::not_found(
            "item_not_found",
            format!("menu item {item_id} does not exist"),
        ),
        CatalogError::UnknownCategory => ProblemResponse::bad_request(
            "unknown_category",
            "category does not exist",
        ),
        CatalogError::DuplicateCategory(_) => {
            ProblemResponse::conflict("duplicate_category", err.to_string())
        }
        CatalogError::InvalidName => {
            ProblemResponse::bad_request("invalid_name", err.to_string())
        }
        CatalogError::InUse => {
            ProblemResponse::conflict("item_in_use", err.to_string())
        }
        other => {
            error!(stage = "staff", item_id, error = %other, "catalog operation failed");
            internal_error("catalog operation failed")
        }
    }
}

pub async fn staff_menu(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MenuData>, ProblemResponse> {
    require_session(&state, &headers).await?;
    let menu = state.catalog().get_menu_with_stock().await?;
    Ok(Json(menu))
}

pub async fn get_menu_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
) -> Result<Json<MenuItem>, ProblemResponse> {
    require_session(&state, &headers).await?;
    let record = state
        .storage()
        .catalog()
        .fetch_item(&item_id)
        .await
        .map_err(|err| catalog_problem(err, &item_id))?;
    let item = record
        .into_domain()
        .map_err(|err| catalog_problem(err.into(), &item_id))?;
    Ok(Json(item))
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderListQuery {
    #[serde(default)]
    status: Option<String>,
}

pub async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<Vec<Order>>, ProblemResponse> {
    require_session(&state, &headers).await?;

    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_status(raw)?),
    };

    let orders = state.storage().orders().list(status).await.map_err(|err| {
        error!(stage = "staff", error = %err, "failed to list orders");
        internal_error("failed to list orders")
    })?;
    Ok(Json(orders))
}

fn parse_status(raw: &str) -> Result<OrderStatus, ProblemResponse> {
    raw.parse::<OrderStatus>().map_err(|err| {
        ProblemResponse::bad_request("invalid_status", err.to_string())
    })
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusUpdateResponse {
    id: String,
    status: OrderStatus,
}

pub async fn update_order_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<StatusUpdateResponse>, ProblemResponse> {
    let staff = require_session(&state, &headers).await?;
    let requested = parse_status(&request.status)?;
    let orders = state.storage().orders();

    let current = orders.fetch_status(&order_id).await.map_err(|err| match err {
        OrderStoreError::NotFound => ProblemResponse::not_found(
            "order_not_found",
            format!("order {order_id} does not exist"),
        ),
        other => {
            error!(stage = "staff", order_id = %order_id, error = %other, "failed to load order status");
            internal_error("failed to load order status")
        }
    })?;

    let next = current
        .transition(requested)
        .map_err(|err: StatusTransitionError| {
            ProblemResponse::conflict("invalid_transition", err.to_string())
        })?;

    let applied = orders
        .update_status(&order_id, current, next)
        .await
        .map_err(|err| {
            error!(stage = "staff", order_id = %order_id, error = %err, "failed to update order status");
            internal_error("failed to update order status")
        })?;
    if !applied {
        return Err(ProblemResponse::conflict(
            "status_changed",
            "order status changed concurrently; reload and retry",
        ));
    }

    info!(stage = "staff", order_id = %order_id, from = %current, to = %next, staff_id = %staff.id, "order status updated");
    Ok(Json(StatusUpdateResponse {
        id: order_id,
        status: next,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleRequest {
    is_available: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleResponse {
    id: String,
    is_available: bool,
}

/// Sets the availability flag, or flips it when the body is empty. Turning an
/// item on is refused while today's stock is exhausted.
pub async fn toggle_availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
    body: Bytes,
) -> Result<Json<ToggleResponse>, ProblemResponse> {
    let staff = require_session(&state, &headers).await?;
    let requested = parse_toggle_body(&body)?;
    let catalog = state.storage().catalog();

    let item = catalog
        .fetch_item(&item_id)
        .await
        .map_err(|err| catalog_problem(err, &item_id))?;
    let target = requested.unwrap_or(!item.is_available);

    if target {
        ensure_stock_remaining(&state, &item_id, item.available_qty).await?;
    }

    catalog
        .set_availability(&item_id, target)
        .await
        .map_err(|err| catalog_problem(err, &item_id))?;
    info!(stage = "staff", item_id = %item_id, is_available = target, staff_id = %staff.id, "availability updated");

    Ok(Json(ToggleResponse {
        id: item_id,
        is_available: target,
    }))
}

fn parse_toggle_body(body: &[u8]) -> Result<Option<bool>, ProblemResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice::<ToggleRequest>(body)
        .map(|request| Some(request.is_available))
        .map_err(|err| ProblemResponse::bad_request("invalid_body", err.to_string()))
}

/// Refuses with `stock_exhausted` unless the item has stock left today.
/// `fallback_qty` is used when no ledger record exists for the day.
async fn ensure_stock_remaining(
    state: &AppState,
    item_id: &str,
    fallback_qty: i64,
) -> Result<(), ProblemResponse> {
    let now = state.calendar().now();
    let day = state.calendar().day_of(now);
    let inventory = state.storage().inventory();
    if let Err(err) = inventory.ensure_baseline(&day, now).await {
        error!(stage = "staff", item_id = %item_id, error = %err, "failed to prepare inventory");
        return Err(internal_error("failed to load stock"));
    }
    let remaining = inventory
        .fetch(item_id, &day)
        .await
        .map_err(|err| {
            error!(stage = "staff", item_id = %item_id, error = %err, "failed to load stock");
            internal_error("failed to load stock")
        })?
        .map(|record| record.current_stock)
        .unwrap_or(fallback_qty);
    if remaining <= 0 {
        return Err(ProblemResponse::conflict(
            "stock_exhausted",
            format!("menu item {item_id} has no stock left today"),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RestockRequest {
    quantity: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestockResponse {
    id: String,
    current_stock: i64,
}

pub async fn restock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
    Json(request): Json<RestockRequest>,
) -> Result<Json<RestockResponse>, ProblemResponse> {
    let staff = require_session(&state, &headers).await?;
    let now = state.calendar().now();
    let day = state.calendar().day_of(now);

    let current_stock = state
        .storage()
        .inventory()
        .restock(&item_id, &day, request.quantity, now)
        .await
        .map_err(|err| match err {
            InventoryError::InvalidQuantity(_) => {
                ProblemResponse::bad_request("invalid_quantity", err.to_string())
            }
            InventoryError::MissingRecord { .. } => ProblemResponse::not_found(
                "item_not_found",
                format!("menu item {item_id} does not exist"),
            ),
            other => {
                error!(stage = "staff", item_id = %item_id, error = %other, "restock failed");
                internal_error("restock failed")
            }
        })?;

    info!(stage = "inventory", item_id = %item_id, day = %day, added = request.quantity, current_stock, staff_id = %staff.id, "item restocked");
    Ok(Json(RestockResponse {
        id: item_id,
        current_stock,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
    #[serde(default)]
    image: String,
    #[serde(default)]
    prep_time: String,
    #[serde(default)]
    available_qty: i64,
    #[serde(default)]
    is_available: Option<bool>,
    #[serde(default)]
    category_id: Option<String>,
}

impl ProductRequest {
    fn validate(&self) -> Result<(), ProblemResponse> {
        if self.name.trim().is_empty() {
            return Err(ProblemResponse::bad_request(
                "invalid_product",
                "name must not be empty",
            ));
        }
        if self.price.is_sign_negative() && !self.price.is_zero() {
            return Err(ProblemResponse::bad_request(
                "invalid_product",
                "price must not be negative",
            ));
        }
        if self.available_qty < 0 {
            return Err(ProblemResponse::bad_request(
                "invalid_product",
                "availableQty must not be negative",
            ));
        }
        Ok(())
    }

    fn as_new_item(&self) -> NewMenuItem<'_> {
        NewMenuItem {
            category_id: self
                .category_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty()),
            name: self.name.trim(),
            description: &self.description,
            price: self.price,
            image_url: &self.image,
            prep_time: &self.prep_time,
            available_qty: self.available_qty,
            is_available: self.is_available,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    id: String,
}

pub async fn create_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ProductRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ProblemResponse> {
    require_session(&state, &headers).await?;
    request.validate()?;

    let id = state
        .storage()
        .catalog()
        .create_product(&request.as_new_item())
        .await
        .map_err(|err| catalog_problem(err, "new"))?;
    info!(stage = "staff", item_id = %id, name = %request.name, "product created");
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

pub async fn update_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
    Json(request): Json<ProductRequest>,
) -> Result<StatusCode, ProblemResponse> {
    require_session(&state, &headers).await?;
    request.validate()?;

    let catalog = state.storage().catalog();
    if request.is_available == Some(true) {
        let item = catalog
            .fetch_item(&item_id)
            .await
            .map_err(|err| catalog_problem(err, &item_id))?;
        ensure_stock_remaining(&state, &item_id, item.available_qty).await?;
    }

    catalog
        .update_product(&item_id, &request.as_new_item())
        .await
        .map_err(|err| catalog_problem(err, &item_id))?;
    info!(stage = "staff", item_id = %item_id, "product updated");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(item_id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    require_session(&state, &headers).await?;
    state
        .storage()
        .catalog()
        .delete_product(&item_id)
        .await
        .map_err(|err| catalog_problem(err, &item_id))?;
    info!(stage = "staff", item_id = %item_id, "product deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CategoryRequest {
    name: String,
}

pub async fn create_category(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CategoryRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ProblemResponse> {
    require_session(&state, &headers).await?;
    let id = state
        .storage()
        .catalog()
        .create_category(&request.name)
        .await
        .map_err(|err| catalog_problem(err, "new"))?;
    info!(stage = "staff", category_id = %id, "category created");
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ProblemResponse> {
    let staff = require_session(&state, &headers).await?;
    let Some(token) = session_token(&headers) else {
        return Err(internal_error("session token disappeared"));
    };

    match state
        .storage()
        .staff_sessions()
        .end(token, state.calendar().now())
        .await
    {
        Ok(()) => {
            info!(stage = "staff", staff_id = %staff.id, "staff logged out");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(SessionError::Invalid) => {
            warn!(stage = "staff", staff_id = %staff.id, "session already ended");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(err) => {
            error!(stage = "staff", error = %err, "failed to end session");
            Err(internal_error("failed to end session"))
        }
    }
}

pub async fn active_staff(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<StaffMember>>, ProblemResponse> {
    require_session(&state, &headers).await?;
    let staff = state
        .storage()
        .staff_sessions()
        .list_active()
        .await
        .map_err(|err| {
            error!(stage = "staff", error = %err, "failed to list active staff");
            internal_error("failed to list active staff")
        })?;
    Ok(Json(staff))
}
