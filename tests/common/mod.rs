//! Shared fixtures for the integration tests: an in-memory bus sink and a
//! config pointing the crawler at a wiremock server.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use bili_claw::config::Config;
use bili_claw::sink::MessageSink;

/// Records every message instead of talking to a broker.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<(String, String, Value)>>,
}

impl MemorySink {
    pub fn messages(&self) -> Vec<(String, String, Value)> {
        self.messages.lock().unwrap().clone()
    }

    /// `(key, value)` pairs sent to one topic, in send order.
    pub fn topic_messages(&self, topic: &str) -> Vec<(String, Value)> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let value: Value = serde_json::from_slice(payload)?;
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), key.to_string(), value));
        Ok(())
    }
}

/// Fails every send to one topic; everything else is recorded.
#[derive(Debug)]
pub struct FailingSink {
    pub fail_topic: &'static str,
    pub inner: MemorySink,
}

impl FailingSink {
    pub fn new(fail_topic: &'static str) -> Self {
        Self {
            fail_topic,
            inner: MemorySink::default(),
        }
    }
}

#[async_trait]
impl MessageSink for FailingSink {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        if topic == self.fail_topic {
            bail!("bus unavailable for {topic}");
        }
        self.inner.send(topic, key, payload).await
    }
}

/// Crawler config targeting a mock server, with records kept in a temp dir.
pub fn test_config(server_uri: &str, record_dir: &Path) -> Config {
    Config {
        record_dir: record_dir.to_string_lossy().into_owned(),
        cookie_config_path: record_dir
            .join("cookies.json")
            .to_string_lossy()
            .into_owned(),
        api_base_url: server_uri.trim_end_matches('/').to_string(),
        portal_url: server_uri.to_string(),
        ..Config::for_testing()
    }
}

/// Wrap endpoint data in the platform's JSON envelope.
pub fn ok_body(data: Value) -> Value {
    json!({"code": 0, "message": "0", "data": data})
}
