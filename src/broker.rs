//! Durable broker client: Redis Streams with consumer-group semantics.
//!
//! Three priority streams feed one consumer group (`processor-workers`): realtime,
//! legacy (drained only, never written to), and backfill. A dead-letter stream
//! receives entries that exhausted delivery attempts. Mirrors the push/consume/ack/dlq
//! split of the original's `RedisQueue` / `RedisConsumer` / `DeadLetterQueue` classes,
//! collapsed into one client since all three shared a single Redis connection anyway.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::models::StreamEntry;

pub const STREAM_REALTIME: &str = "telegram:messages:realtime";
pub const STREAM_BACKFILL: &str = "telegram:messages:backfill";
pub const STREAM_LEGACY: &str = "telegram:messages";
pub const STREAM_DLQ: &str = "telegram:messages:dlq";

const PRIORITY_STREAMS: [&str; 2] = [STREAM_REALTIME, STREAM_BACKFILL];

pub struct Broker {
    conn: ConnectionManager,
    config: BrokerConfig,
}

/// One entry read off a priority stream, tagged with where it came from so ack/reject
/// know which stream to XACK against without re-checking every stream.
pub struct Delivery {
    pub stream: String,
    pub id: String,
    pub entry: StreamEntry,
}

impl Broker {
    pub async fn connect(config: &BrokerConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let broker = Self {
            conn,
            config: config.clone(),
        };
        broker.ensure_consumer_groups().await?;
        Ok(broker)
    }

    async fn ensure_consumer_groups(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        for stream in PRIORITY_STREAMS.iter().chain([&STREAM_LEGACY]) {
            let _: Result<(), _> = conn
                .xgroup_create_mkstream(*stream, &self.config.consumer_group, "0")
                .await;
        }
        Ok(())
    }

    /// Push a message onto the realtime or backfill stream, trimmed to `max_stream_length`
    /// (approximate MAXLEN, same as the original's `xadd(..., approximate=True)`).
    pub async fn push(&self, is_backfilled: bool, entry: &StreamEntry) -> Result<String, BrokerError> {
        let stream = if is_backfilled { STREAM_BACKFILL } else { STREAM_REALTIME };
        let fields = entry_to_fields(entry);
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                stream,
                redis::streams::StreamMaxlen::Approx(self.config.max_stream_length as usize),
                "*",
                &fields,
            )
            .await?;
        Ok(id)
    }

    /// Read from the priority streams in order (auto-claim first, then realtime, then
    /// backfill one-at-a-time), matching the original's read-priority loop.
    pub async fn read_next(&self, consumer: &str) -> Result<Vec<Delivery>, BrokerError> {
        let claimed = self.auto_claim(consumer).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.config.consumer_group, consumer)
            .count(10)
            .block(1000);
        let reply: StreamReadReply = conn
            .xread_options(&[STREAM_REALTIME], &[">"], &opts)
            .await
            .unwrap_or_default();
        let deliveries = parse_reply(STREAM_REALTIME, reply)?;
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }

        let legacy_opts = StreamReadOptions::default()
            .group(&self.config.consumer_group, consumer)
            .count(10)
            .block(0);
        let legacy_reply: StreamReadReply = conn
            .xread_options(&[STREAM_LEGACY], &[">"], &legacy_opts)
            .await
            .unwrap_or_default();
        let deliveries = parse_reply(STREAM_LEGACY, legacy_reply)?;
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }

        let backfill_opts = StreamReadOptions::default()
            .group(&self.config.consumer_group, consumer)
            .count(1)
            .block(0);
        let backfill_reply: StreamReadReply = conn
            .xread_options(&[STREAM_BACKFILL], &[">"], &backfill_opts)
            .await
            .unwrap_or_default();
        parse_reply(STREAM_BACKFILL, backfill_reply)
    }

    async fn auto_claim(&self, consumer: &str) -> Result<Vec<Delivery>, BrokerError> {
        let min_idle: Duration = humantime::parse_duration(&self.config.auto_claim_min_idle).unwrap_or(Duration::from_secs(300));
        let mut conn = self.conn.clone();
        let mut out = Vec::new();
        for stream in PRIORITY_STREAMS.iter().chain([&STREAM_LEGACY]) {
            let result: redis::RedisResult<redis::streams::StreamAutoClaimReply> = conn
                .xautoclaim(*stream, &self.config.consumer_group, consumer, min_idle.as_millis() as u64, "0")
                .await;
            if let Ok(reply) = result {
                for claimed in reply.claimed {
                    match fields_to_entry(&claimed.map) {
                        Ok(entry) => out.push(Delivery {
                            stream: (*stream).to_string(),
                            id: claimed.id,
                            entry,
                        }),
                        Err(e) => warn!(error = %e, id = %claimed.id, "dropping unparseable claimed entry"),
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn ack(&self, stream: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i32 = conn.xack(stream, &self.config.consumer_group, &[id]).await?;
        Ok(())
    }

    async fn delivery_count(&self, stream: &str, id: &str) -> Result<u32, BrokerError> {
        let mut conn = self.conn.clone();
        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(stream, &self.config.consumer_group, id, id, 1)
            .await?;
        Ok(pending.ids.first().map(|p| p.times_delivered).unwrap_or(1))
    }

    /// Reject a delivery: routes to the DLQ once delivery count exceeds `max_retries`,
    /// otherwise just acks so the broker's own redelivery (via idle time) picks it up
    /// again — matching the original's `reject()`.
    pub async fn reject(&self, delivery: &Delivery, error: &str) -> Result<(), BrokerError> {
        let count = self.delivery_count(&delivery.stream, &delivery.id).await.unwrap_or(1);
        if count >= self.config.max_retries {
            self.send_to_dlq(delivery, error, count).await?;
            self.ack(&delivery.stream, &delivery.id).await?;
            warn!(stream = %delivery.stream, id = %delivery.id, count, "routed to dead-letter queue");
        }
        Ok(())
    }

    /// Route a delivery straight to the DLQ and ack it, bypassing the retry-count gate
    /// `reject()` applies. For permanent failures (e.g. an unknown channel) where
    /// redelivery can never succeed, so there is no point waiting out `max_retries`.
    pub async fn dead_letter_now(&self, delivery: &Delivery, error: &str) -> Result<(), BrokerError> {
        let count = self.delivery_count(&delivery.stream, &delivery.id).await.unwrap_or(1);
        self.send_to_dlq(delivery, error, count).await?;
        self.ack(&delivery.stream, &delivery.id).await?;
        warn!(stream = %delivery.stream, id = %delivery.id, "routed to dead-letter queue immediately, permanent error");
        Ok(())
    }

    async fn send_to_dlq(&self, delivery: &Delivery, error: &str, retry_count: u32) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(&delivery.entry).unwrap_or_default();
        let mut fields: Vec<(&str, String)> = vec![
            ("original_stream_id", delivery.id.clone()),
            ("original_stream", delivery.stream.clone()),
            ("message_payload_json", payload),
            ("error", error.to_string()),
            ("retry_count", retry_count.to_string()),
            ("failed_at", Utc::now().to_rfc3339()),
        ];
        fields.retain(|(_, v)| !v.is_empty());
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd_maxlen(
                STREAM_DLQ,
                redis::streams::StreamMaxlen::Approx(self.config.max_dlq_length as usize),
                "*",
                &fields,
            )
            .await?;
        Ok(())
    }

    /// Remove consumers that have been idle past `stale_consumer_idle` with nothing
    /// pending, and force-remove ones idle past `stale_consumer_force_idle` even with
    /// pending entries (those get reclaimed by auto-claim from another consumer).
    pub async fn cleanup_stale_consumers(&self) -> Result<(), BrokerError> {
        let idle_threshold = humantime::parse_duration(&self.config.stale_consumer_idle).unwrap_or(Duration::from_secs(300));
        let force_threshold =
            humantime::parse_duration(&self.config.stale_consumer_force_idle).unwrap_or(Duration::from_secs(3000));
        let mut conn = self.conn.clone();

        for stream in PRIORITY_STREAMS.iter().chain([&STREAM_LEGACY]) {
            let consumers: redis::RedisResult<Vec<redis::streams::StreamConsumerInfo>> =
                conn.xinfo_consumers(*stream, &self.config.consumer_group).await;
            let Ok(consumers) = consumers else { continue };
            for consumer in consumers {
                let idle = Duration::from_millis(consumer.idle as u64);
                if idle > force_threshold || (idle > idle_threshold && consumer.pending == 0) {
                    let _: Result<(), _> = conn
                        .xgroup_delconsumer(*stream, &self.config.consumer_group, &consumer.name)
                        .await;
                    info!(stream = %stream, consumer = %consumer.name, idle_secs = idle.as_secs(), "removed stale consumer");
                }
            }
        }
        Ok(())
    }

    pub async fn queue_depths(&self) -> Result<HashMap<String, u64>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut out = HashMap::new();
        for stream in [STREAM_REALTIME, STREAM_BACKFILL, STREAM_LEGACY, STREAM_DLQ] {
            let len: u64 = conn.xlen(stream).await.unwrap_or(0);
            out.insert(stream.to_string(), len);
        }
        Ok(out)
    }
}

/// Consumer name = `worker-{hostname}-{pid}`, stable across reconnects from the same
/// process so pending entries from a previous connection are recognized as ours.
pub fn new_consumer_name() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname_fallback().unwrap_or_else(|| Uuid::new_v4().to_string())
    });
    format!("worker-{}-{}", hostname, std::process::id())
}

fn hostname_fallback() -> Option<String> {
    std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_string())
}

fn entry_to_fields(entry: &StreamEntry) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("message_id", entry.message_id.clone()),
        ("channel_id", entry.channel_id.to_string()),
        ("telegram_message_id", entry.telegram_message_id.to_string()),
        ("telegram_date", entry.telegram_date.to_rfc3339()),
        ("ingested_at", entry.ingested_at.to_rfc3339()),
        ("source_account", entry.source_account.clone()),
        ("trace_id", entry.trace_id.clone()),
        ("is_backfilled", entry.is_backfilled.to_string()),
        ("has_comments", entry.has_comments.to_string()),
    ];
    if let Some(ref c) = entry.content {
        fields.push(("content", c.clone()));
    }
    if let Some(ref m) = entry.media_type {
        fields.push(("media_type", m.clone()));
    }
    if let Some(ref u) = entry.media_url {
        fields.push(("media_url", u.clone()));
    }
    if let Some(g) = entry.grouped_id {
        fields.push(("grouped_id", g.to_string()));
    }
    if let Some(c) = entry.media_count {
        fields.push(("media_count", c.to_string()));
    }
    if !entry.album_message_ids.is_empty() {
        fields.push((
            "album_message_ids",
            serde_json::to_string(&entry.album_message_ids).unwrap_or_default(),
        ));
    }
    if !entry.album_media.is_empty() {
        fields.push(("album_media", serde_json::to_string(&entry.album_media).unwrap_or_default()));
    }
    if let Some(v) = entry.views {
        fields.push(("views", v.to_string()));
    }
    if let Some(f) = entry.forwards {
        fields.push(("forwards", f.to_string()));
    }
    if let Some(a) = entry.author_user_id {
        fields.push(("author_user_id", a.to_string()));
    }
    if let Some(r) = entry.replied_to_message_id {
        fields.push(("replied_to_message_id", r.to_string()));
    }
    if let Some(f) = entry.forward_from_channel_id {
        fields.push(("forward_from_channel_id", f.to_string()));
    }
    if let Some(f) = entry.forward_from_message_id {
        fields.push(("forward_from_message_id", f.to_string()));
    }
    if let Some(d) = entry.forward_date {
        fields.push(("forward_date", d.to_rfc3339()));
    }
    if let Some(c) = entry.comments_count {
        fields.push(("comments_count", c.to_string()));
    }
    if let Some(l) = entry.linked_chat_id {
        fields.push(("linked_chat_id", l.to_string()));
    }
    fields
}

fn fields_to_entry(map: &HashMap<String, redis::Value>) -> Result<StreamEntry, BrokerError> {
    let get = |key: &str| -> Option<String> {
        map.get(key).and_then(|v| match v {
            redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
            redis::Value::SimpleString(s) => Some(s.clone()),
            _ => None,
        })
    };
    let required = |key: &str| -> Result<String, BrokerError> {
        get(key).ok_or_else(|| BrokerError::MalformedEntry {
            id: key.to_string(),
            message: format!("missing required field '{key}'"),
        })
    };

    let channel_id: i64 = required("channel_id")?
        .parse()
        .map_err(|_| BrokerError::MalformedEntry {
            id: "channel_id".to_string(),
            message: "not an integer".to_string(),
        })?;
    let telegram_message_id: i64 = required("telegram_message_id")?
        .parse()
        .map_err(|_| BrokerError::MalformedEntry {
            id: "telegram_message_id".to_string(),
            message: "not an integer".to_string(),
        })?;
    let telegram_date = chrono::DateTime::parse_from_rfc3339(&required("telegram_date")?)
        .map_err(|e| BrokerError::MalformedEntry {
            id: "telegram_date".to_string(),
            message: e.to_string(),
        })?
        .with_timezone(&Utc);
    let ingested_at = chrono::DateTime::parse_from_rfc3339(&required("ingested_at")?)
        .map_err(|e| BrokerError::MalformedEntry {
            id: "ingested_at".to_string(),
            message: e.to_string(),
        })?
        .with_timezone(&Utc);

    Ok(StreamEntry {
        message_id: required("message_id")?,
        channel_id,
        telegram_message_id,
        content: get("content"),
        media_type: get("media_type"),
        media_url: get("media_url"),
        telegram_date,
        ingested_at,
        grouped_id: get("grouped_id").and_then(|v| v.parse().ok()),
        media_count: get("media_count").and_then(|v| v.parse().ok()),
        album_message_ids: get("album_message_ids")
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default(),
        album_media: get("album_media").and_then(|v| serde_json::from_str(&v).ok()).unwrap_or_default(),
        views: get("views").and_then(|v| v.parse().ok()),
        forwards: get("forwards").and_then(|v| v.parse().ok()),
        author_user_id: get("author_user_id").and_then(|v| v.parse().ok()),
        replied_to_message_id: get("replied_to_message_id").and_then(|v| v.parse().ok()),
        forward_from_channel_id: get("forward_from_channel_id").and_then(|v| v.parse().ok()),
        forward_from_message_id: get("forward_from_message_id").and_then(|v| v.parse().ok()),
        forward_date: get("forward_date").and_then(|v| chrono::DateTime::parse_from_rfc3339(&v).ok().map(|d| d.with_timezone(&Utc))),
        has_comments: get("has_comments").map(|v| v == "true").unwrap_or(false),
        comments_count: get("comments_count").and_then(|v| v.parse().ok()),
        linked_chat_id: get("linked_chat_id").and_then(|v| v.parse().ok()),
        source_account: get("source_account").unwrap_or_default(),
        is_backfilled: get("is_backfilled").map(|v| v == "true").unwrap_or(false),
        trace_id: get("trace_id").unwrap_or_default(),
    })
}

fn parse_reply(stream: &str, reply: StreamReadReply) -> Result<Vec<Delivery>, BrokerError> {
    let mut out = Vec::new();
    for stream_key in reply.keys {
        for id_entry in stream_key.ids {
            match fields_to_entry(&id_entry.map) {
                Ok(entry) => out.push(Delivery {
                    stream: stream.to_string(),
                    id: id_entry.id,
                    entry,
                }),
                Err(e) => warn!(error = %e, id = %id_entry.id, "dropping unparseable stream entry"),
            }
        }
    }
    Ok(out)
}
