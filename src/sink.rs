//! Message bus sink.
//!
//! Records leave the crawler as `(topic, key, value)` triples. The bus is
//! abstracted behind [`MessageSink`] so the pipeline can be exercised
//! against an in-memory sink; production uses a Kafka producer configured
//! from the environment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::Value;

use crate::storage::{RecordKind, RecordStore};

pub const TOPIC_VIDEO: &str = "claw_video";
pub const TOPIC_COMMENT: &str = "claw_comment";
pub const TOPIC_ACCOUNT: &str = "claw_account";

pub fn topic_for(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Video => TOPIC_VIDEO,
        RecordKind::Comment => TOPIC_COMMENT,
        RecordKind::Account => TOPIC_ACCOUNT,
    }
}

/// An opaque writer accepting `(topic, key, value)` triples.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// Kafka-backed sink. Bootstrap servers come from the
/// `KAFKA_BOOTSTRAP_SERVERS` environment variable (`localhost:9092` when
/// unset).
pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn from_env() -> Result<Self> {
        let servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| "localhost:9092".to_string());
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .set("message.timeout.ms", "10000")
            .set("partitioner", "murmur2_random")
            .create()
            .context("failed to create kafka producer")?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl MessageSink for KafkaSink {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.producer
            .send(
                FutureRecord::to(topic).key(key).payload(payload),
                Duration::from_secs(10),
            )
            .await
            .map_err(|(e, _)| anyhow!("kafka delivery to {topic} failed: {e}"))?;
        Ok(())
    }
}

/// Couples the sink with the record store: an ID is appended to the
/// emitted set only after the bus accepted the record, so a failed send
/// leaves the item eligible for re-emission.
pub struct Emitter {
    sink: Arc<dyn MessageSink>,
    store: Arc<RecordStore>,
}

impl Emitter {
    pub fn new(sink: Arc<dyn MessageSink>, store: Arc<RecordStore>) -> Self {
        Self { sink, store }
    }

    pub async fn emit(&self, kind: RecordKind, key: &str, value: &Value) -> Result<()> {
        let payload = serde_json::to_vec(value).context("failed to serialize record")?;
        self.sink.send(topic_for(kind), key, &payload).await?;
        self.store.record_emitted(kind, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_match_record_kinds() {
        assert_eq!(topic_for(RecordKind::Video), "claw_video");
        assert_eq!(topic_for(RecordKind::Comment), "claw_comment");
        assert_eq!(topic_for(RecordKind::Account), "claw_account");
    }
}
