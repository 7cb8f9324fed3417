//! Rotating credential pool.
//!
//! Cookies are loaded once from a JSON file and handed out to sessions
//! under a rotation strategy. Transient platform failures accumulate per
//! cookie until it is evicted; a permanent failure disables it outright.
//! Evicted cookies are never rehabilitated within a run.

use std::path::Path;
use std::sync::RwLock;

use rand::Rng;
use serde::Deserialize;
use tracing::warn;

/// Transient failures tolerated before a cookie is evicted.
pub const DEFAULT_MAX_FAILS: u32 = 3;

/// Platform response codes that indicate a credential problem.
///
/// -101: not logged in, -352: risk control rejection, -412: request blocked.
const CREDENTIAL_ERROR_CODES: [i64; 3] = [-101, -352, -412];

pub fn is_credential_error(code: i64) -> bool {
    CREDENTIAL_ERROR_CODES.contains(&code)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieItem {
    pub value: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip)]
    pub valid: bool,
    #[serde(skip)]
    pub fail_count: u32,
    #[serde(skip)]
    pub max_fails: u32,
}

impl CookieItem {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            name: String::new(),
            enabled: true,
            valid: true,
            fail_count: 0,
            max_fails: DEFAULT_MAX_FAILS,
        }
    }

    fn usable(&self) -> bool {
        self.enabled && self.valid
    }

    /// Record a transient failure; returns true when the cookie was evicted.
    fn mark_failed(&mut self) -> bool {
        self.fail_count += 1;
        if self.fail_count >= self.max_fails {
            self.valid = false;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    Random,
}

#[derive(Debug, Deserialize)]
struct CookieFile {
    #[serde(default)]
    cookies: Vec<CookieItem>,
    #[serde(default)]
    settings: CookieSettings,
}

#[derive(Debug, Default, Deserialize)]
struct CookieSettings {
    strategy: Option<RotationStrategy>,
    #[serde(default)]
    #[allow(dead_code)]
    validate_on_load: bool,
}

#[derive(Debug)]
struct PoolInner {
    cookies: Vec<CookieItem>,
    index: usize,
}

/// Pool status snapshot for logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub total: usize,
    pub enabled: usize,
    pub valid: usize,
    pub strategy: RotationStrategy,
}

#[derive(Debug)]
pub struct CookiePool {
    strategy: RotationStrategy,
    inner: RwLock<PoolInner>,
}

impl CookiePool {
    /// Load the pool from a credential file. A missing or unparsable file
    /// yields an empty pool so the crawler can still run anonymously.
    pub fn from_file(path: &Path) -> Self {
        let (items, strategy) = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<CookieFile>(&data) {
                Ok(file) => (
                    file.cookies,
                    file.settings.strategy.unwrap_or(RotationStrategy::RoundRobin),
                ),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse cookie file");
                    (Vec::new(), RotationStrategy::RoundRobin)
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read cookie file");
                (Vec::new(), RotationStrategy::RoundRobin)
            }
        };
        Self::from_items(items, strategy)
    }

    /// Build a pool from in-memory items, dropping disabled or empty
    /// entries.
    pub fn from_items(items: Vec<CookieItem>, strategy: RotationStrategy) -> Self {
        let cookies = items
            .into_iter()
            .filter(|c| c.enabled && !c.value.is_empty())
            .map(|mut c| {
                c.valid = true;
                c.fail_count = 0;
                if c.max_fails == 0 {
                    c.max_fails = DEFAULT_MAX_FAILS;
                }
                c
            })
            .collect();
        Self {
            strategy,
            inner: RwLock::new(PoolInner { cookies, index: 0 }),
        }
    }

    /// Next usable cookie value under the configured strategy, or the
    /// empty string when the pool is exhausted.
    pub fn get(&self) -> String {
        let mut inner = self.inner.write().expect("cookie pool lock poisoned");
        let usable: Vec<usize> = inner
            .cookies
            .iter()
            .enumerate()
            .filter(|(_, c)| c.usable())
            .map(|(i, _)| i)
            .collect();
        if usable.is_empty() {
            return String::new();
        }

        let pick = match self.strategy {
            RotationStrategy::Random => usable[rand::thread_rng().gen_range(0..usable.len())],
            RotationStrategy::RoundRobin => {
                let slot = inner.index % usable.len();
                inner.index = slot + 1;
                usable[slot]
            }
        };
        inner.cookies[pick].value.clone()
    }

    /// Mark a cookie failed. Permanent failures disable the cookie;
    /// transient ones count toward eviction.
    pub fn mark_invalid(&self, value: &str, permanent: bool) {
        let mut inner = self.inner.write().expect("cookie pool lock poisoned");
        if let Some(cookie) = inner.cookies.iter_mut().find(|c| c.value == value) {
            if permanent {
                cookie.valid = false;
                cookie.enabled = false;
                warn!(name = %cookie.name, "cookie permanently disabled");
            } else if cookie.mark_failed() {
                warn!(name = %cookie.name, fails = cookie.fail_count, "cookie evicted");
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.read().expect("cookie pool lock poisoned");
        let total = inner.cookies.len();
        let mut enabled = 0;
        let mut valid = 0;
        for cookie in &inner.cookies {
            if cookie.enabled {
                enabled += 1;
                if cookie.valid {
                    valid += 1;
                }
            }
        }
        PoolStatus {
            total,
            enabled,
            valid,
            strategy: self.strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(values: &[&str], strategy: RotationStrategy) -> CookiePool {
        CookiePool::from_items(values.iter().map(|v| CookieItem::new(*v)).collect(), strategy)
    }

    #[test]
    fn round_robin_cycles_through_usable_cookies() {
        let pool = pool(&["c1", "c2", "c3"], RotationStrategy::RoundRobin);
        assert_eq!(pool.get(), "c1");
        assert_eq!(pool.get(), "c2");
        assert_eq!(pool.get(), "c3");
        assert_eq!(pool.get(), "c1");
    }

    #[test]
    fn random_strategy_returns_a_member() {
        let pool = pool(&["c1", "c2"], RotationStrategy::Random);
        for _ in 0..10 {
            let value = pool.get();
            assert!(value == "c1" || value == "c2");
        }
    }

    #[test]
    fn three_transient_failures_evict_a_cookie() {
        let pool = pool(&["only"], RotationStrategy::RoundRobin);
        for _ in 0..3 {
            pool.mark_invalid("only", false);
        }
        assert_eq!(pool.get(), "");
        assert_eq!(pool.status().valid, 0);
    }

    #[test]
    fn two_failures_keep_a_cookie_usable() {
        let pool = pool(&["only"], RotationStrategy::RoundRobin);
        pool.mark_invalid("only", false);
        pool.mark_invalid("only", false);
        assert_eq!(pool.get(), "only");
    }

    #[test]
    fn permanent_failure_disables_immediately() {
        let pool = pool(&["c1", "c2"], RotationStrategy::RoundRobin);
        pool.mark_invalid("c1", true);
        let status = pool.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.enabled, 1);
        assert_eq!(status.valid, 1);
        assert_eq!(pool.get(), "c2");
        assert_eq!(pool.get(), "c2");
    }

    #[test]
    fn eviction_shrinks_the_rotation() {
        let pool = pool(&["c1", "c2", "c3"], RotationStrategy::RoundRobin);
        for _ in 0..3 {
            pool.mark_invalid("c2", false);
        }
        assert_eq!(pool.get(), "c1");
        assert_eq!(pool.get(), "c3");
        assert_eq!(pool.get(), "c1");
    }

    #[test]
    fn disabled_entries_are_dropped_at_load() {
        let file: CookieFile = serde_json::from_str(
            r#"{
                "cookies": [
                    {"value": "a", "name": "a", "enabled": true},
                    {"value": "b", "name": "b", "enabled": false},
                    {"value": "", "name": "empty", "enabled": true}
                ],
                "settings": {"strategy": "round_robin", "validate_on_load": false}
            }"#,
        )
        .unwrap();
        let pool = CookiePool::from_items(
            file.cookies,
            file.settings.strategy.unwrap_or(RotationStrategy::RoundRobin),
        );
        assert_eq!(pool.status().total, 1);
        assert_eq!(pool.get(), "a");
    }

    #[test]
    fn credential_error_codes() {
        assert!(is_credential_error(-101));
        assert!(is_credential_error(-352));
        assert!(is_credential_error(-412));
        assert!(!is_credential_error(0));
        assert!(!is_credential_error(-404));
    }
}
