use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Channel {
    pub id: i64,
    pub telegram_id: i64,
    pub access_hash: Option<i64>,
    pub username: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub folder: Option<String>,
    pub rule: String,
    pub active: bool,
    pub removed_at: Option<DateTime<Utc>>,
    pub source_account: String,
    pub backfill_status: String,
    pub backfill_from_date: Option<DateTime<Utc>>,
    pub backfill_messages_fetched: i64,
    pub backfill_completed_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Discriminated replacement for the original's runtime class-name dispatch
/// (`message.media.__class__.__name__`). `Document` is refined further by MIME
/// sniffing into `Video`/`Audio`/`Image` before being written to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Geo,
    Contact,
    Venue,
    Webpage,
    Poll,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Geo => "geo",
            MediaKind::Contact => "contact",
            MediaKind::Venue => "venue",
            MediaKind::Webpage => "webpage",
            MediaKind::Poll => "poll",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            "geo" => Some(Self::Geo),
            "contact" => Some(Self::Contact),
            "venue" => Some(Self::Venue),
            "webpage" => Some(Self::Webpage),
            "poll" => Some(Self::Poll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub telegram_message_id: i64,
    pub content: Option<String>,
    pub content_translated: Option<String>,
    pub language_detected: Option<String>,
    pub translation_provider: Option<String>,
    pub translation_cost_usd: Option<f64>,
    pub translation_timestamp: Option<DateTime<Utc>>,
    pub telegram_date: DateTime<Utc>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub grouped_id: Option<i64>,
    pub media_type: Option<String>,
    pub entities: serde_json::Value,
    pub author_user_id: Option<i64>,
    pub replied_to_message_id: Option<i64>,
    pub forward_from_channel_id: Option<i64>,
    pub forward_from_message_id: Option<i64>,
    pub forward_date: Option<DateTime<Utc>>,
    pub has_comments: bool,
    pub comments_count: Option<i64>,
    pub linked_chat_id: Option<i64>,
    pub content_hash: String,
    pub metadata_hash: String,
    pub hash_algorithm: String,
    pub hash_version: i32,
    pub hash_generated_at: DateTime<Utc>,
    pub is_backfilled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A fully-assembled message ready to be persisted, as handed off by the processor
/// pipeline after entity extraction, translation, and media archival have run.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel_id: i64,
    pub telegram_message_id: i64,
    pub content: Option<String>,
    pub content_translated: Option<String>,
    pub language_detected: Option<String>,
    pub translation_provider: Option<String>,
    pub translation_cost_usd: Option<f64>,
    pub telegram_date: DateTime<Utc>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub grouped_id: Option<i64>,
    pub media_type: Option<String>,
    pub entities: serde_json::Value,
    pub author_user_id: Option<i64>,
    pub replied_to_message_id: Option<i64>,
    pub forward_from_channel_id: Option<i64>,
    pub forward_from_message_id: Option<i64>,
    pub forward_date: Option<DateTime<Utc>>,
    pub has_comments: bool,
    pub comments_count: Option<i64>,
    pub linked_chat_id: Option<i64>,
    pub content_hash: String,
    pub metadata_hash: String,
    pub is_backfilled: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct MediaFile {
    pub id: i64,
    pub content_hash: String,
    pub s3_key: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageMedia {
    pub id: i64,
    pub message_id: i64,
    pub media_id: i64,
    pub position: i32,
}

/// One already-downloaded album member, staged to a local path by the listener/backfill
/// stage before the entry is enqueued. `media_type` is the `MediaKind::as_str()` value.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StagedMedia {
    pub local_path: String,
    pub media_type: Option<String>,
}

/// A raw stream entry as read from the broker, before routing/ack/nack decisions.
/// Field set mirrors the original's `ProcessedMessage` (all values arrive as
/// broker strings and are parsed on the way in).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamEntry {
    /// Synthetic tracing id (UUID), distinct from `telegram_message_id` — used for
    /// DLQ correlation and idempotency bookkeeping, never for the relational unique key.
    pub message_id: String,
    pub channel_id: i64,
    pub telegram_message_id: i64,
    pub content: Option<String>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub telegram_date: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub grouped_id: Option<i64>,
    pub media_count: Option<i32>,
    /// All member ids of this entry's `grouped_id` — an album is always one `StreamEntry`,
    /// anchored at its caption-bearing member (or first member) via `telegram_message_id`.
    #[serde(default)]
    pub album_message_ids: Vec<i64>,
    /// Ordered, already-staged media for an album entry, one per member that downloaded
    /// successfully. Empty for single-message entries, which use `media_url` instead.
    #[serde(default)]
    pub album_media: Vec<StagedMedia>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub author_user_id: Option<i64>,
    pub replied_to_message_id: Option<i64>,
    pub forward_from_channel_id: Option<i64>,
    pub forward_from_message_id: Option<i64>,
    pub forward_date: Option<DateTime<Utc>>,
    pub has_comments: bool,
    pub comments_count: Option<i64>,
    pub linked_chat_id: Option<i64>,
    pub source_account: String,
    pub is_backfilled: bool,
    pub trace_id: String,
}

/// A batch channel-join request: a CSV of candidate URLs/usernames progresses
/// `uploading -> validating -> ready -> processing -> completed | cancelled`.
#[derive(Debug, Clone, FromRow)]
pub struct ImportJob {
    pub id: uuid::Uuid,
    pub target_folder: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One candidate channel within an `ImportJob`. Validation and joining are
/// separate state transitions so an operator can review before any joins happen.
#[derive(Debug, Clone, FromRow)]
pub struct ImportCandidate {
    pub id: i64,
    pub import_job_id: uuid::Uuid,
    pub input_value: String,
    pub status: String,
    pub telegram_id: Option<i64>,
    pub access_hash: Option<i64>,
    pub title: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
