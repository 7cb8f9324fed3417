//! HTTP sessions and typed wrappers over the platform web API.
//!
//! One [`Session`] per worker: it binds a cookie from the pool at
//! construction, carries the default headers and consults the shared rate
//! limiter before every call. Responses use the common JSON envelope
//! `{code, message, data}`; a non-zero code becomes a typed error after
//! the cookie pool has been told about credential failures.

pub mod wbi;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, REFERER};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::cookie::{self, CookiePool};
use crate::ratelimit::TokenBucket;
use wbi::WbiSigner;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// Fixed parameters of the signed main-comment endpoint.
const COMMENT_MODE: u32 = 2;
const COMMENT_PLAT: u32 = 1;
const COMMENT_TYPE: u32 = 1;
const COMMENT_WEB_LOCATION: u32 = 1315875;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("platform error {code}: {message}")]
    Platform { code: i64, message: String },
    #[error("missing field in response: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: f64,
    pub max_delay: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: 1.0,
            max_delay: 30.0,
        }
    }
}

/// Shared dependencies injected into every session.
#[derive(Debug)]
pub struct ApiContext {
    pub base_url: String,
    pub portal_url: String,
    pub user_agent: String,
    pub limiter: Arc<TokenBucket>,
    pub cookies: Arc<CookiePool>,
    pub signer: Arc<WbiSigner>,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug)]
pub struct SearchPage {
    pub videos: Vec<Value>,
    pub num_pages: i64,
}

#[derive(Debug)]
pub struct MainCommentsPage {
    pub replies: Vec<Value>,
    pub next_cursor: String,
    pub is_end: bool,
}

#[derive(Debug)]
pub struct ReplyPage {
    pub replies: Vec<Value>,
    pub total: i64,
}

/// One worker's HTTP identity: a client with default headers and the
/// cookie it was born with.
pub struct Session {
    ctx: Arc<ApiContext>,
    client: reqwest::Client,
    cookie: String,
}

impl Session {
    /// Build a session and warm it up with one request to the portal page.
    /// Warm-up failures are tolerated; the platform only uses it to set
    /// implicit server-side state.
    pub async fn connect(ctx: Arc<ApiContext>) -> Result<Self, ApiError> {
        let cookie = ctx.cookies.get();

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        if let Ok(referer) = HeaderValue::from_str(&ctx.portal_url) {
            headers.insert(REFERER, referer);
        }
        if !cookie.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.insert(COOKIE, value);
            }
        }

        let client = reqwest::Client::builder()
            .user_agent(ctx.user_agent.as_str())
            .default_headers(headers)
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let session = Self {
            ctx,
            client,
            cookie,
        };
        if let Err(e) = session.client.get(&session.ctx.portal_url).send().await {
            debug!(error = %e, "portal warm-up request failed");
        }
        Ok(session)
    }

    /// The cookie value this session attaches to requests.
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Fetch a URL and unwrap the JSON envelope. Credential-error codes
    /// mark this session's cookie failed before the error surfaces.
    async fn get_data(&self, url: &str) -> Result<Value, ApiError> {
        let body = self.client.get(url).send().await?.text().await?;
        let envelope: Envelope = serde_json::from_str(&body)?;
        if envelope.code != 0 {
            if cookie::is_credential_error(envelope.code) && !self.cookie.is_empty() {
                self.ctx.cookies.mark_invalid(&self.cookie, false);
            }
            return Err(ApiError::Platform {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    /// Run `op` with exponential backoff. Every attempt independently
    /// acquires a rate-limit token; after the retries are exhausted the
    /// last error surfaces.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let retry = &self.ctx.retry;
        let mut last_err = None;
        for attempt in 0..=retry.max_retries {
            self.ctx.limiter.acquire(1.0, true).await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < retry.max_retries {
                        let jitter: f64 = rand::thread_rng().gen();
                        let delay = (retry.base_delay * f64::from(1u32 << attempt) + jitter)
                            .min(retry.max_delay);
                        debug!(attempt, delay, error = %e, "retrying api call");
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    pub async fn search_videos(
        &self,
        keyword: &str,
        page: usize,
        page_size: usize,
    ) -> Result<SearchPage, ApiError> {
        self.with_retry(|| self.search_once(keyword, page, page_size))
            .await
    }

    async fn search_once(
        &self,
        keyword: &str,
        page: usize,
        page_size: usize,
    ) -> Result<SearchPage, ApiError> {
        let url = format!(
            "{}/x/web-interface/search/type?page={}&page_size={}&keyword={}&search_type=video&order=",
            self.ctx.base_url,
            page,
            page_size,
            urlencoding::encode(keyword),
        );
        let data = self.get_data(&url).await?;
        let videos = data
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let num_pages = data.get("numPages").and_then(Value::as_i64).unwrap_or(0);
        Ok(SearchPage { videos, num_pages })
    }

    pub async fn video_detail(&self, bvid: &str) -> Result<Value, ApiError> {
        self.with_retry(|| self.video_detail_once(bvid)).await
    }

    async fn video_detail_once(&self, bvid: &str) -> Result<Value, ApiError> {
        let url = format!("{}/x/web-interface/view?bvid={bvid}", self.ctx.base_url);
        self.get_data(&url).await
    }

    /// Resolve a BVID to its numeric AID through the detail endpoint.
    pub async fn video_aid(&self, bvid: &str) -> Result<i64, ApiError> {
        let detail = self.video_detail(bvid).await?;
        detail
            .get("aid")
            .and_then(Value::as_i64)
            .ok_or(ApiError::MissingField("aid"))
    }

    pub async fn main_comments(
        &self,
        oid: i64,
        cursor: &str,
    ) -> Result<MainCommentsPage, ApiError> {
        self.with_retry(|| self.main_comments_once(oid, cursor))
            .await
    }

    /// One page of root comments through the signed endpoint.
    ///
    /// The signature is computed over the fully URL-encoded
    /// `pagination_str`, while the request URL restores `:` to its literal
    /// form; when the cursor is empty an empty `seek_rpid=` participates in
    /// both. The upstream checks the bytes exactly, so none of this is
    /// negotiable.
    async fn main_comments_once(
        &self,
        oid: i64,
        cursor: &str,
    ) -> Result<MainCommentsPage, ApiError> {
        let pagination = format!(r#"{{"offset":"{cursor}"}}"#);
        let encoded = urlencoding::encode(&pagination).into_owned();

        let mixin_key = self.ctx.signer.mixin_key_for(self).await;
        let wts = unix_now();

        let sign_input = if cursor.is_empty() {
            format!(
                "mode={COMMENT_MODE}&oid={oid}&pagination_str={encoded}&plat={COMMENT_PLAT}&seek_rpid=&type={COMMENT_TYPE}&web_location={COMMENT_WEB_LOCATION}&wts={wts}"
            )
        } else {
            format!(
                "mode={COMMENT_MODE}&oid={oid}&pagination_str={encoded}&plat={COMMENT_PLAT}&type={COMMENT_TYPE}&web_location={COMMENT_WEB_LOCATION}&wts={wts}"
            )
        };
        let w_rid = wbi::sign_query(&sign_input, &mixin_key);

        let pagination_url = encoded.replace("%3A", ":");
        let url = if cursor.is_empty() {
            format!(
                "{}/x/v2/reply/wbi/main?oid={oid}&type={COMMENT_TYPE}&mode={COMMENT_MODE}&pagination_str={pagination_url}&plat={COMMENT_PLAT}&seek_rpid=&web_location={COMMENT_WEB_LOCATION}&w_rid={w_rid}&wts={wts}",
                self.ctx.base_url,
            )
        } else {
            format!(
                "{}/x/v2/reply/wbi/main?oid={oid}&type={COMMENT_TYPE}&mode={COMMENT_MODE}&pagination_str={pagination_url}&plat={COMMENT_PLAT}&web_location={COMMENT_WEB_LOCATION}&w_rid={w_rid}&wts={wts}",
                self.ctx.base_url,
            )
        };

        let data = self.get_data(&url).await?;
        let replies = data
            .get("replies")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let cursor_info = data.get("cursor");
        let mut is_end = cursor_info
            .and_then(|c| c.get("is_end"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let next_cursor = cursor_info
            .and_then(|c| c.pointer("/pagination_reply/next_offset"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        // An exhausted offset means there is no further page regardless of
        // what is_end claims.
        if next_cursor.is_empty() {
            is_end = true;
        }
        Ok(MainCommentsPage {
            replies,
            next_cursor,
            is_end,
        })
    }

    pub async fn comment_replies(
        &self,
        oid: i64,
        root: i64,
        page: usize,
        page_size: usize,
    ) -> Result<ReplyPage, ApiError> {
        self.with_retry(|| self.comment_replies_once(oid, root, page, page_size))
            .await
    }

    async fn comment_replies_once(
        &self,
        oid: i64,
        root: i64,
        page: usize,
        page_size: usize,
    ) -> Result<ReplyPage, ApiError> {
        let url = format!(
            "{}/x/v2/reply/reply?oid={oid}&type={COMMENT_TYPE}&root={root}&ps={page_size}&pn={page}",
            self.ctx.base_url,
        );
        let data = self.get_data(&url).await?;
        let replies = data
            .get("replies")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = data
            .pointer("/page/count")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(ReplyPage { replies, total })
    }

    pub async fn user_card(&self, mid: &str) -> Result<Value, ApiError> {
        self.with_retry(|| self.user_card_once(mid)).await
    }

    async fn user_card_once(&self, mid: &str) -> Result<Value, ApiError> {
        let url = format!(
            "{}/x/web-interface/card?mid={mid}&photo=true",
            self.ctx.base_url,
        );
        self.get_data(&url).await
    }

    /// Fetch the two signing keys from the nav endpoint.
    ///
    /// The envelope code is deliberately ignored: logged-out sessions get a
    /// non-zero code but the key URLs are still present.
    pub(crate) async fn fetch_wbi_keys(&self) -> Result<(String, String), ApiError> {
        self.ctx.limiter.acquire(1.0, true).await;
        let url = format!("{}/x/web-interface/nav", self.ctx.base_url);
        let body = self.client.get(&url).send().await?.text().await?;
        let value: Value = serde_json::from_str(&body)?;
        let img_url = value
            .pointer("/data/wbi_img/img_url")
            .and_then(Value::as_str)
            .unwrap_or("");
        let sub_url = value
            .pointer("/data/wbi_img/sub_url")
            .and_then(Value::as_str)
            .unwrap_or("");
        if img_url.is_empty() || sub_url.is_empty() {
            return Err(ApiError::MissingField("wbi_img"));
        }
        Ok((key_stem(img_url), key_stem(sub_url)))
    }
}

/// Filename stem of a key URL: the last path segment up to the first dot.
fn key_stem(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or("")
        .split('.')
        .next()
        .unwrap_or("")
        .to_string()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_stem_takes_filename_before_first_dot() {
        assert_eq!(
            key_stem("https://i0.example.com/bfs/wbi/7cd084941338484a.png"),
            "7cd084941338484a"
        );
        assert_eq!(key_stem("abc.tar.gz"), "abc");
        assert_eq!(key_stem(""), "");
    }

    #[test]
    fn envelope_defaults_tolerate_missing_fields() {
        let envelope: Envelope = serde_json::from_str(r#"{"code": -101}"#).unwrap();
        assert_eq!(envelope.code, -101);
        assert_eq!(envelope.message, "");
        assert!(envelope.data.is_null());
    }
}
