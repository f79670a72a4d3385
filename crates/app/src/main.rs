mod day;
mod menu;
mod notification;
mod order;
mod problem;
mod router;
mod staff;
mod telemetry;

use std::net::SocketAddr;

use tracing::info;

use menu_notify::MessageTemplate;
use menu_storage::Database;
use menu_util::{load_env_file, AppConfig};

use crate::day::BusinessCalendar;
use crate::notification::NotificationDispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "app", database_url = %config.database_url, "database ready");

    let calendar = BusinessCalendar::new(&config.timezone)?;
    let notifier = NotificationDispatcher::from_config(
        &config.notify,
        MessageTemplate {
            restaurant_name: config.restaurant_name.clone(),
            menu_link: config.menu_link.clone(),
        },
    )?;

    let state = router::AppState::new(
        metrics,
        database,
        calendar,
        notifier,
        &config.restaurant_name,
        config.low_stock_threshold,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), timezone = %config.timezone, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
