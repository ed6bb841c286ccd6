//! Runtime configuration, loaded from the environment.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;

/// Tunable limits for the intake workflow.
#[derive(Debug, Clone)]
pub struct IntakePolicy {
    /// Maximum application attempts per user within [`Self::attempt_window`].
    pub max_attempts: u32,
    /// Rolling window over which attempts are counted.
    pub attempt_window: Duration,
    /// Minimum account age before a user may apply.
    pub min_account_age: Duration,
    /// How long a pending application may sit unanswered before the sweeper
    /// expires it.
    pub pending_timeout: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_window: Duration::hours(1),
            min_account_age: Duration::days(7),
            pending_timeout: Duration::hours(1),
            sweep_interval: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub policy: IntakePolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `DB_PATH` defaults to `data/bot.db`. Policy overrides are optional;
    /// unset variables fall back to the defaults above.
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/bot.db"));

        let mut policy = IntakePolicy::default();
        if let Some(n) = read_optional_u32("MAX_APPLICATION_ATTEMPTS")? {
            policy.max_attempts = n;
        }
        if let Some(mins) = read_optional_u32("APPLICATION_ATTEMPT_WINDOW_MINUTES")? {
            policy.attempt_window = Duration::minutes(i64::from(mins));
        }
        if let Some(days) = read_optional_u32("MIN_ACCOUNT_AGE_DAYS")? {
            policy.min_account_age = Duration::days(i64::from(days));
        }
        if let Some(mins) = read_optional_u32("PENDING_TIMEOUT_MINUTES")? {
            policy.pending_timeout = Duration::minutes(i64::from(mins));
        }
        if let Some(mins) = read_optional_u32("SWEEP_INTERVAL_MINUTES")? {
            policy.sweep_interval = Duration::minutes(i64::from(mins));
        }

        Ok(Self { db_path, policy })
    }
}

fn read_optional_u32(name: &str) -> Result<Option<u32>> {
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("{name} must be a non-negative integer, got {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = IntakePolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_window, Duration::hours(1));
        assert_eq!(policy.min_account_age, Duration::days(7));
        assert_eq!(policy.pending_timeout, Duration::hours(1));
        assert_eq!(policy.sweep_interval, Duration::minutes(30));
    }
}
