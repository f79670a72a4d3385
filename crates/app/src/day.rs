use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Maps instants onto the restaurant's calendar days. The inventory ledger is
/// keyed by these day strings.
#[derive(Clone)]
pub struct BusinessCalendar {
    tz: Tz,
    clock: Clock,
}

impl BusinessCalendar {
    pub fn new(timezone: &str) -> Result<Self, InvalidTimezone> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| InvalidTimezone(timezone.to_string()))?;
        Ok(Self {
            tz,
            clock: Arc::new(Utc::now),
        })
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Local `%Y-%m-%d` day containing `at`.
    pub fn day_of(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.tz).format("%Y-%m-%d").to_string()
    }

    pub fn today(&self) -> String {
        self.day_of(self.now())
    }
}

#[derive(Debug, Error)]
#[error("unknown timezone '{0}'")]
pub struct InvalidTimezone(pub String);
