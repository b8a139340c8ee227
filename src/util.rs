//! Shared helpers: tracing/dotenv initialization, the millisecond clock
//! abstraction, and environment-variable parsing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Supports an explicit env file via ENV_FILE or DOTENV_PATH, falling back to
/// standard `.env` discovery. Safe to call more than once; later calls are
/// no-ops.
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
    tracing::debug!("tracing initialized (env source: {})", env_source);
}

/// Milliseconds since the Unix epoch.
pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Source of wall-clock time, in epoch milliseconds.
///
/// Token expiry, key rotation, and refresh decisions all read the clock
/// through this trait so that the protocol timeline can be driven precisely
/// in tests.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        now_epoch_millis()
    }
}

/// A manually advanced clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Parse a boolean-ish environment variable ("1", "true", "yes", "on").
pub fn env_truthy(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Read a non-empty trimmed string environment variable.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a u64 environment variable, ignoring unparsable values.
pub fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

/// Split a semicolon-delimited environment list into trimmed entries.
pub fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|v| {
        v.split(';')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn env_list_splits_on_semicolons() {
        std::env::set_var("TRUSTRING_TEST_LIST", "localhost;127.0.0.1; ::1 ;");
        let list = env_list("TRUSTRING_TEST_LIST").unwrap();
        assert_eq!(list, vec!["localhost", "127.0.0.1", "::1"]);
        std::env::remove_var("TRUSTRING_TEST_LIST");
    }

    #[test]
    fn env_truthy_accepts_common_forms() {
        std::env::set_var("TRUSTRING_TEST_BOOL", "Yes");
        assert!(env_truthy("TRUSTRING_TEST_BOOL", false));
        std::env::set_var("TRUSTRING_TEST_BOOL", "0");
        assert!(!env_truthy("TRUSTRING_TEST_BOOL", true));
        std::env::remove_var("TRUSTRING_TEST_BOOL");
        assert!(env_truthy("TRUSTRING_TEST_BOOL", true));
    }
}
