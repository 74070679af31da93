//! At-least-once processor pipeline: consumes `StreamEntry` values off the broker,
//! runs them through entity extraction, translation, media archival, and hashing,
//! then persists via insert-if-absent store operations so redelivery is harmless.
//!
//! Mirrors the original's `message_processor.py` stage order; a worker pool of
//! `processor.workers` tasks share one `Broker`/`PgPool`/`ObjectStore`.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{self, Broker, Delivery};
use crate::config::Config;
use crate::entity_extractor;
use crate::error::Outcome;
use crate::hashing::{self, MessageHashInput};
use crate::models::{NewMessage, StreamEntry};
use crate::object_store::ObjectStore;
use crate::store;
use crate::translation::{self, NoopTranslator, Translator};

pub struct Processor {
    broker: Arc<Broker>,
    pool: PgPool,
    object_store: Arc<ObjectStore>,
    translator: Arc<dyn Translator>,
    config: Arc<Config>,
}

impl Processor {
    pub fn new(broker: Arc<Broker>, pool: PgPool, object_store: Arc<ObjectStore>, config: Arc<Config>) -> Self {
        Self {
            broker,
            pool,
            object_store,
            translator: Arc::new(NoopTranslator),
            config,
        }
    }

    /// Spawn `processor.workers` consumer loops plus a stale-consumer sweeper, all
    /// cancellable from the same token.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut handles = Vec::new();
        for _ in 0..self.config.processor.workers {
            let this = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { this.worker_loop(cancel).await }));
        }

        let sweep_broker = self.broker.clone();
        let sweep_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(e) = sweep_broker.cleanup_stale_consumers().await {
                            warn!(error = %e, "stale consumer cleanup failed");
                        }
                    }
                }
            }
        }));

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(&self, cancel: CancellationToken) {
        let consumer = broker::new_consumer_name();
        info!(consumer = %consumer, "processor worker starting");
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let deliveries = match self.broker.read_next(&consumer).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "broker read failed, backing off");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            for delivery in deliveries {
                self.process_one(&delivery).await;
            }
        }
    }

    /// Acks on success or a phantom no-op, routes permanent failures straight to the
    /// DLQ regardless of delivery count, flood-waits in place before leaving the entry
    /// for redelivery, and otherwise defers to the broker's own retry-then-DLQ policy.
    async fn process_one(&self, delivery: &Delivery) {
        match self.handle(delivery).await {
            Outcome::Ok(()) => {
                if let Err(e) = self.broker.ack(&delivery.stream, &delivery.id).await {
                    warn!(error = %e, id = %delivery.id, "ack failed");
                }
            }
            Outcome::FloodWait(wait) => {
                warn!(id = %delivery.id, wait = ?wait, "flood wait while processing, leaving entry for redelivery");
                tokio::time::sleep(wait).await;
            }
            Outcome::Transient(e) => {
                error!(error = %e, id = %delivery.id, channel_id = delivery.entry.channel_id, "processing failed, will retry");
                if let Err(reject_err) = self.broker.reject(delivery, &e.to_string()).await {
                    warn!(error = %reject_err, id = %delivery.id, "reject failed");
                }
            }
            Outcome::Permanent(e) => {
                error!(error = %e, id = %delivery.id, channel_id = delivery.entry.channel_id, "permanent failure, dead-lettering immediately");
                if let Err(dlq_err) = self.broker.dead_letter_now(delivery, &e.to_string()).await {
                    warn!(error = %dlq_err, id = %delivery.id, "dead-letter routing failed");
                }
            }
        }
    }

    async fn handle(&self, delivery: &Delivery) -> Outcome<()> {
        let entry = &delivery.entry;

        let has_content = entry.content.as_deref().is_some_and(|c| !c.trim().is_empty());
        let has_media = entry.media_url.is_some() || !entry.album_media.is_empty();
        if !has_content && !has_media {
            info!(id = %delivery.id, channel_id = entry.channel_id, "phantom entry (no content, no media), skipping");
            return Outcome::Ok(());
        }

        let channel = match store::get_channel_by_id(&self.pool, entry.channel_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                return Outcome::Permanent(anyhow::anyhow!("message for unknown channel_id {}", entry.channel_id));
            }
            Err(e) => return Outcome::Transient(e.into()),
        };

        let entities = entry
            .content
            .as_deref()
            .map(|text| entity_extractor::extract(text, channel.username.as_deref()))
            .unwrap_or_else(|| serde_json::json!({}));

        let (content_translated, language_detected, translation_provider, translation_cost_usd) = self.maybe_translate(entry).await;

        let hash_input = MessageHashInput {
            telegram_message_id: entry.telegram_message_id,
            channel_id: entry.channel_id,
            telegram_date: entry.telegram_date,
            content: entry.content.as_deref(),
            sender_id: entry.author_user_id,
            forward_from_id: entry.forward_from_channel_id,
            forward_from_name: None,
            forward_date: entry.forward_date,
        };
        let hashes = hashing::generate_hashes(&hash_input);

        let new_message = NewMessage {
            channel_id: channel.id,
            telegram_message_id: hash_input.telegram_message_id,
            content: entry.content.clone(),
            content_translated,
            language_detected,
            translation_provider,
            translation_cost_usd,
            telegram_date: entry.telegram_date,
            views: entry.views,
            forwards: entry.forwards,
            grouped_id: entry.grouped_id,
            media_type: entry.media_type.clone(),
            entities,
            author_user_id: entry.author_user_id,
            replied_to_message_id: entry.replied_to_message_id,
            forward_from_channel_id: entry.forward_from_channel_id,
            forward_from_message_id: entry.forward_from_message_id,
            forward_date: entry.forward_date,
            has_comments: entry.has_comments,
            comments_count: entry.comments_count,
            linked_chat_id: entry.linked_chat_id,
            content_hash: hashes.content_hash,
            metadata_hash: hashes.metadata_hash,
            is_backfilled: entry.is_backfilled,
        };

        let (message_id, inserted) = match store::insert_message_if_absent(&self.pool, &new_message).await {
            Ok(v) => v,
            Err(e) => return Outcome::Transient(e.into()),
        };

        if !inserted {
            info!(message_id, "duplicate delivery, message already stored, not re-linking media");
        } else if let Err(e) = self.archive_entry_media(message_id, entry).await {
            return Outcome::Transient(e);
        }

        if let Err(e) = store::update_last_message(&self.pool, channel.id, entry.telegram_date).await {
            return Outcome::Transient(e.into());
        }

        Outcome::Ok(())
    }

    /// Detect the entry's source language and only invoke the translation adapter when
    /// it's confidently known and differs from the configured target — an unknown or
    /// already-matching language is stored as-is, with `content_translated` left `None`.
    async fn maybe_translate(
        &self,
        entry: &StreamEntry,
    ) -> (Option<String>, Option<String>, Option<String>, Option<f64>) {
        if !self.config.translation.enabled {
            return (None, None, None, None);
        }
        let Some(text) = entry.content.as_deref().filter(|t| !t.trim().is_empty()) else {
            return (None, None, None, None);
        };

        let detected = translation::detect_language(text);
        let target = &self.config.translation.target_language;
        let should_translate = matches!(&detected, Some(lang) if lang != target);
        if !should_translate {
            return (None, detected, None, None);
        }

        match self.translator.translate(text, target).await {
            Ok(result) => (
                Some(result.translated_text),
                result.source_language.or(detected),
                Some(result.provider),
                result.cost_usd,
            ),
            Err(e) => {
                warn!(error = %e, "translation failed, storing untranslated");
                (None, detected, None, None)
            }
        }
    }

    /// Archive every media item carried by this entry: an album's ordered `album_media`
    /// list, or a single message's `media_url`. Per-file read/classify failures are
    /// logged and skipped (a partially-archived album is still a valid archive), but
    /// store/object-store errors propagate so the caller can retry the whole entry.
    async fn archive_entry_media(&self, message_id: i64, entry: &StreamEntry) -> anyhow::Result<()> {
        if !entry.album_media.is_empty() {
            for (position, staged) in entry.album_media.iter().enumerate() {
                if let Some(media_id) = self.archive_media_file(&staged.local_path, staged.media_type.as_deref()).await? {
                    store::link_message_media(&self.pool, message_id, media_id, position as i32).await?;
                }
            }
        } else if let Some(ref url) = entry.media_url {
            if let Some(media_id) = self.archive_media_file(url, entry.media_type.as_deref()).await? {
                store::link_message_media(&self.pool, message_id, media_id, 0).await?;
            }
        }
        Ok(())
    }

    /// Reads, hashes, and content-addressed-uploads one staged media file, returning its
    /// `media_files.id`, or `None` if the file could not be read (the download may have
    /// failed upstream, or the file was already cleaned up) — logged, not fatal.
    async fn archive_media_file(&self, local_path: &str, mime_type: Option<&str>) -> anyhow::Result<Option<i64>> {
        let bytes = match tokio::fs::read(local_path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, local_path, "could not read staged media, skipping archival");
                return Ok(None);
            }
        };
        let content_hash = hashing::hash_bytes(&bytes);
        let ext = extension_for_mime(mime_type);
        let key = ObjectStore::storage_key(&content_hash, ext.as_deref());
        let len = bytes.len() as i64;
        self.object_store.put_if_absent(&key, bytes, mime_type).await?;
        let media_id = store::insert_media_if_absent(&self.pool, &content_hash, &key, mime_type, len).await?;
        let _ = tokio::fs::remove_file(local_path).await;
        Ok(Some(media_id))
    }
}

fn extension_for_mime(mime_type: Option<&str>) -> Option<String> {
    mime_type.and_then(|m| m.split('/').nth(1)).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_for_mime_splits_on_slash() {
        assert_eq!(extension_for_mime(Some("image/jpeg")), Some("jpeg".to_string()));
        assert_eq!(extension_for_mime(Some("video/mp4")), Some("mp4".to_string()));
    }

    #[test]
    fn extension_for_mime_none_when_absent() {
        assert_eq!(extension_for_mime(None), None);
    }
}
