//! WBI request signing.
//!
//! Signed endpoints require a `w_rid` parameter: the MD5 of the sorted
//! query string with a "mixin key" appended. The mixin key is derived from
//! two URLs served by the nav endpoint via a fixed permutation table and
//! cached for an hour.

use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use tokio::sync::Mutex;
use tracing::debug;

use super::Session;

/// Permutation applied to `img_key ++ sub_key` to produce the mixin key.
const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22,
    25, 54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// Signing key used when the nav endpoint cannot be reached.
pub const FALLBACK_MIXIN_KEY: &str = "ea1db124af3c7062474693fa704f4ff8";

pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(3600);

/// Apply the permutation table and truncate to 32 characters.
pub fn mixin_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out: Vec<u8> = MIXIN_KEY_ENC_TAB
        .iter()
        .filter_map(|&i| bytes.get(i).copied())
        .collect();
    out.truncate(32);
    String::from_utf8_lossy(&out).into_owned()
}

pub fn md5_hex(text: &str) -> String {
    hex::encode(Md5::digest(text.as_bytes()))
}

/// Sign an already-assembled query string.
pub fn sign_query(query: &str, mixin_key: &str) -> String {
    md5_hex(&format!("{query}{mixin_key}"))
}

/// Sign a parameter list: insert `wts`, sort keys lexicographically, join
/// `k=v` pairs with `&` and hash with the mixin key appended. Values must
/// already be URL-encoded where applicable.
pub fn sign_params(params: &[(&str, String)], mixin_key: &str, wts: i64) -> String {
    let mut all: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    all.push(("wts".to_string(), wts.to_string()));
    all.sort_by(|a, b| a.0.cmp(&b.0));
    let query = all
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    sign_query(&query, mixin_key)
}

#[derive(Debug)]
struct CachedKey {
    key: String,
    expires_at: Instant,
}

/// Mixin key cache shared by all sessions.
///
/// The cache lock is held across the refresh fetch so concurrent callers
/// cause at most one nav request per TTL epoch.
#[derive(Debug)]
pub struct WbiSigner {
    ttl: Duration,
    cache: Mutex<Option<CachedKey>>,
}

impl Default for WbiSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl WbiSigner {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_KEY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current mixin key, refreshed through `session` when the cached one
    /// expired. A failed refresh falls back to the baked-in key without
    /// caching it, so the next caller retries the fetch.
    pub async fn mixin_key_for(&self, session: &Session) -> String {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.expires_at {
                return cached.key.clone();
            }
        }

        match session.fetch_wbi_keys().await {
            Ok((img_key, sub_key)) => {
                let key = mixin_key(&format!("{img_key}{sub_key}"));
                *cache = Some(CachedKey {
                    key: key.clone(),
                    expires_at: Instant::now() + self.ttl,
                });
                key
            }
            Err(e) => {
                debug!(error = %e, "wbi key fetch failed, signing with fallback key");
                FALLBACK_MIXIN_KEY.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEYS: &str = "7cd084941338484aae1ad9425b84077c4932caff0ff746eab6f01bf08b70ac45";

    #[test]
    fn permutation_produces_known_mixin_key() {
        let key = mixin_key(SAMPLE_KEYS);
        assert_eq!(key.len(), 32);
        assert_eq!(key, "ea1db124af3c7062474693fa704f4ff8");
        assert_eq!(mixin_key(SAMPLE_KEYS), key);
    }

    #[test]
    fn short_input_truncates_without_panicking() {
        let key = mixin_key("abc");
        assert!(key.len() <= 32);
    }

    #[test]
    fn sign_params_sorts_keys_and_appends_wts() {
        let key = "testkey";
        let wts = 1_700_000_000;
        let params = [("type", "1".to_string()), ("oid", "5".to_string())];
        let w_rid = sign_params(&params, key, wts);
        let expected = md5_hex(&format!("oid=5&type=1&wts={wts}{key}"));
        assert_eq!(w_rid, expected);
    }

    #[test]
    fn signing_is_deterministic() {
        let key = mixin_key(SAMPLE_KEYS);
        let params = [("oid", "5".to_string()), ("type", "1".to_string())];
        let first = sign_params(&params, &key, 42);
        let second = sign_params(&params, &key, 42);
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
