use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use thiserror::Error;
use tracing::error;

use menu_core::{Category, MenuData};
use menu_storage::{CatalogError, Database, InventoryError, MenuRow};

use crate::day::BusinessCalendar;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Read side of the catalog. Every call goes to the database; nothing is
/// cached between requests.
#[derive(Clone)]
pub struct MenuCatalog {
    database: Database,
    calendar: BusinessCalendar,
    restaurant_name: Arc<str>,
    low_stock_threshold: i64,
}

impl MenuCatalog {
    pub fn new(
        database: Database,
        calendar: BusinessCalendar,
        restaurant_name: impl Into<Arc<str>>,
        low_stock_threshold: i64,
    ) -> Self {
        Self {
            database,
            calendar,
            restaurant_name: restaurant_name.into(),
            low_stock_threshold,
        }
    }

    /// Customer menu with the static daily quantity.
    pub async fn get_menu(&self) -> Result<MenuData, MenuError> {
        let rows = self.database.catalog().list_menu_rows().await?;
        Ok(MenuData {
            restaurant_name: self.restaurant_name.to_string(),
            categories: group_rows(&rows, None)?,
        })
    }

    /// Staff menu with today's remaining stock and the low-stock indicator.
    pub async fn get_menu_with_stock(&self) -> Result<MenuData, MenuError> {
        let now = self.calendar.now();
        let day = self.calendar.day_of(now);
        self.database.inventory().ensure_baseline(&day, now).await?;

        let rows = self
            .database
            .catalog()
            .list_menu_rows_with_stock(&day)
            .await?;
        Ok(MenuData {
            restaurant_name: self.restaurant_name.to_string(),
            categories: group_rows(&rows, Some(self.low_stock_threshold))?,
        })
    }
}

/// Folds the ordered join rows into categories. Rows arrive grouped by
/// category; a category row without an item yields an empty list.
fn group_rows(rows: &[MenuRow], low_stock_threshold: Option<i64>) -> Result<Vec<Category>, CatalogError> {
    let mut categories: Vec<Category> = Vec::new();
    for row in rows {
        let starts_new = categories
            .last()
            .map_or(true, |category| category.id != row.category_id);
        if starts_new {
            categories.push(Category {
                id: row.category_id.clone(),
                name: row.category_name.clone(),
                items: Vec::new(),
            });
        }

        if let Some(mut item) = row.item()? {
            if let Some(threshold) = low_stock_threshold {
                item.is_low_stock = Some(item.available_qty <= threshold);
            }
            if let Some(category) = categories.last_mut() {
                category.items.push(item);
            }
        }
    }
    Ok(categories)
}

#[derive(Debug, Error)]
pub enum MenuError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
}

impl From<MenuError> for ProblemResponse {
    fn from(value: MenuError) -> Self {
        error!(stage = "menu", error = %value, "failed to load menu");
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "menu_unavailable",
            "failed to load menu",
        )
    }
}

pub async fn get_menu(State(state): State<AppState>) -> Result<Json<MenuData>, ProblemResponse> {
    let menu = state.catalog().get_menu().await?;
    Ok(Json(menu))
}
