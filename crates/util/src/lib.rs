pub mod config;

use std::{env, net::SocketAddr};

pub use config::{AppConfig, ConfigError, Environment, NotifyConfig, TwilioCredentials};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Loads environment variables from `.env` when available.
///
/// Missing files are ignored so the function is safe in production builds
/// where dotenv files are not deployed.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Returns the address the HTTP server should bind to.
///
/// `APP_BIND_ADDR` wins when set. Otherwise a bare `PORT` binds every
/// interface on that port, and [`DEFAULT_BIND_ADDR`] is the final fallback.
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    if let Ok(value) = env::var("APP_BIND_ADDR") {
        return value.parse();
    }
    if let Ok(port) = env::var("PORT") {
        return format!("0.0.0.0:{port}").parse();
    }
    DEFAULT_BIND_ADDR.parse()
}
