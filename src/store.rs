//! Relational store operations: channel reconciliation, message/media persistence,
//! and the read-side queries backfill and gap detection rely on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Channel, ImportCandidate, ImportJob, MediaFile, Message, NewMessage};

/// Discovered channel, as produced by folder/dialog-filter enumeration, before
/// reconciliation against the stored set.
pub struct DiscoveredChannel {
    pub telegram_id: i64,
    pub access_hash: Option<i64>,
    pub username: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub folder: String,
    pub rule: String,
    pub source_account: String,
}

/// Three-step reconciliation: mark all channels for this folder inactive, then
/// upsert the discovered set as active, then stamp `removed_at` on rows that just
/// transitioned inactive. Runs in one transaction so a crash mid-reconciliation
/// never leaves the table with every channel marked inactive.
///
/// `initial_backfill_status` seeds `backfill_status` for channels inserted for the
/// first time only — an existing channel's backfill state is never touched by
/// reconciliation, just its active/metadata columns. Returns the Telegram ids of
/// channels that were newly inserted by this call (as opposed to updated).
pub async fn sync_channels(
    pool: &PgPool,
    folder: &str,
    discovered: &[DiscoveredChannel],
    initial_backfill_status: &str,
) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await.context("starting reconciliation transaction")?;

    sqlx::query("UPDATE channels SET active = FALSE, updated_at = now() WHERE folder = $1 AND active = TRUE")
        .bind(folder)
        .execute(&mut *tx)
        .await
        .context("marking channels inactive")?;

    let mut newly_inserted = Vec::new();
    for channel in discovered {
        let row: (bool,) = sqlx::query_as(
            "INSERT INTO channels
                (telegram_id, access_hash, username, name, description, folder, rule, active, source_account, backfill_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9, now(), now())
             ON CONFLICT (telegram_id) DO UPDATE SET
                access_hash = excluded.access_hash,
                username = excluded.username,
                name = excluded.name,
                description = excluded.description,
                folder = excluded.folder,
                rule = excluded.rule,
                active = TRUE,
                removed_at = NULL,
                updated_at = now()
             RETURNING (xmax = 0)",
        )
        .bind(channel.telegram_id)
        .bind(channel.access_hash)
        .bind(&channel.username)
        .bind(&channel.name)
        .bind(&channel.description)
        .bind(&channel.folder)
        .bind(&channel.rule)
        .bind(&channel.source_account)
        .bind(initial_backfill_status)
        .fetch_one(&mut *tx)
        .await
        .context("upserting discovered channel")?;

        if row.0 {
            newly_inserted.push(channel.telegram_id);
        }
    }

    sqlx::query(
        "UPDATE channels SET removed_at = now() WHERE folder = $1 AND active = FALSE AND removed_at IS NULL",
    )
    .bind(folder)
    .execute(&mut *tx)
    .await
    .context("stamping removed_at on newly-inactive channels")?;

    tx.commit().await.context("committing reconciliation transaction")?;
    Ok(newly_inserted)
}

pub async fn get_active_channels(pool: &PgPool) -> Result<Vec<Channel>> {
    sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE active = TRUE ORDER BY id")
        .fetch_all(pool)
        .await
        .context("listing active channels")
}

pub async fn get_channel_by_id(pool: &PgPool, channel_id: i64) -> Result<Option<Channel>> {
    sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = $1")
        .bind(channel_id)
        .fetch_optional(pool)
        .await
        .context("looking up channel by id")
}

pub async fn get_channel_by_telegram_id(pool: &PgPool, telegram_id: i64) -> Result<Option<Channel>> {
    sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE telegram_id = $1")
        .bind(telegram_id)
        .fetch_optional(pool)
        .await
        .context("looking up channel by telegram_id")
}

/// Channels ready to (re)start a backfill: freshly discovered (`pending`) or
/// recovering from a flood-wait pause.
pub async fn get_backfillable_channels(pool: &PgPool) -> Result<Vec<Channel>> {
    sqlx::query_as::<_, Channel>(
        "SELECT * FROM channels WHERE active = TRUE AND backfill_status IN ('pending', 'paused') ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("listing backfillable channels")
}

pub async fn set_backfill_status(pool: &PgPool, channel_id: i64, status: &str) -> Result<()> {
    sqlx::query("UPDATE channels SET backfill_status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(channel_id)
        .execute(pool)
        .await
        .context("updating backfill status")?;
    Ok(())
}

pub async fn update_backfill_progress(pool: &PgPool, channel_id: i64, messages_fetched_delta: i64) -> Result<()> {
    sqlx::query(
        "UPDATE channels SET backfill_messages_fetched = backfill_messages_fetched + $1, updated_at = now() WHERE id = $2",
    )
    .bind(messages_fetched_delta)
    .bind(channel_id)
    .execute(pool)
    .await
    .context("updating backfill progress")?;
    Ok(())
}

pub async fn complete_backfill(pool: &PgPool, channel_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE channels SET backfill_status = 'completed', backfill_completed_at = now(), updated_at = now() WHERE id = $1",
    )
    .bind(channel_id)
    .execute(pool)
    .await
    .context("completing backfill")?;
    Ok(())
}

pub async fn update_last_message(pool: &PgPool, channel_id: i64, telegram_date: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE channels SET last_message_at = GREATEST(COALESCE(last_message_at, $2), $2), updated_at = now() WHERE id = $1",
    )
    .bind(channel_id)
    .bind(telegram_date)
    .execute(pool)
    .await
    .context("updating last_message_at")?;
    Ok(())
}

/// Channels whose `last_message_at` is older than `threshold_hours` ago, ordered by
/// gap size descending and capped at `max_channels`, mirroring `detect_message_gaps()`.
pub async fn detect_gaps(pool: &PgPool, threshold_hours: i32, max_channels: i64) -> Result<Vec<Channel>> {
    sqlx::query_as::<_, Channel>(
        "SELECT * FROM channels
         WHERE active = TRUE
           AND backfill_status = 'completed'
           AND last_message_at IS NOT NULL
           AND last_message_at < now() - make_interval(hours => $1)
         ORDER BY last_message_at ASC
         LIMIT $2",
    )
    .bind(threshold_hours)
    .bind(max_channels)
    .fetch_all(pool)
    .await
    .context("detecting channel gaps")
}

/// Insert a message if it doesn't already exist for `(channel_id, telegram_message_id)`.
/// Returns the row id whether the insert happened or the row already existed, so
/// callers can always attach media regardless of which branch ran.
pub async fn insert_message_if_absent(pool: &PgPool, message: &NewMessage) -> Result<(i64, bool)> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO messages
            (channel_id, telegram_message_id, content, content_translated, language_detected,
             translation_provider, translation_cost_usd, telegram_date, views, forwards, grouped_id,
             media_type, entities, author_user_id, replied_to_message_id, forward_from_channel_id,
             forward_from_message_id, forward_date, has_comments, comments_count, linked_chat_id,
             content_hash, metadata_hash, is_backfilled, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, now(), now())
         ON CONFLICT (channel_id, telegram_message_id) DO NOTHING
         RETURNING id",
    )
    .bind(message.channel_id)
    .bind(message.telegram_message_id)
    .bind(&message.content)
    .bind(&message.content_translated)
    .bind(&message.language_detected)
    .bind(&message.translation_provider)
    .bind(message.translation_cost_usd)
    .bind(message.telegram_date)
    .bind(message.views)
    .bind(message.forwards)
    .bind(message.grouped_id)
    .bind(&message.media_type)
    .bind(&message.entities)
    .bind(message.author_user_id)
    .bind(message.replied_to_message_id)
    .bind(message.forward_from_channel_id)
    .bind(message.forward_from_message_id)
    .bind(message.forward_date)
    .bind(message.has_comments)
    .bind(message.comments_count)
    .bind(message.linked_chat_id)
    .bind(&message.content_hash)
    .bind(&message.metadata_hash)
    .bind(message.is_backfilled)
    .fetch_optional(pool)
    .await
    .context("inserting message")?;

    match inserted {
        Some((id,)) => Ok((id, true)),
        None => {
            let (id,): (i64,) = sqlx::query_as(
                "SELECT id FROM messages WHERE channel_id = $1 AND telegram_message_id = $2",
            )
            .bind(message.channel_id)
            .bind(message.telegram_message_id)
            .fetch_one(pool)
            .await
            .context("looking up existing message")?;
            Ok((id, false))
        }
    }
}

pub async fn get_message_by_telegram_id(pool: &PgPool, channel_id: i64, telegram_message_id: i64) -> Result<Option<Message>> {
    sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE channel_id = $1 AND telegram_message_id = $2")
        .bind(channel_id)
        .bind(telegram_message_id)
        .fetch_optional(pool)
        .await
        .context("looking up message")
}

pub async fn find_media_by_hash(pool: &PgPool, content_hash: &str) -> Result<Option<MediaFile>> {
    sqlx::query_as::<_, MediaFile>("SELECT * FROM media_files WHERE content_hash = $1")
        .bind(content_hash)
        .fetch_optional(pool)
        .await
        .context("looking up media by content hash")
}

/// Insert a media_files row if absent (the object store upload itself is insert-if-absent
/// too; this is the relational-side half of that dedup). Returns the row id either way.
pub async fn insert_media_if_absent(pool: &PgPool, content_hash: &str, s3_key: &str, mime_type: Option<&str>, file_size: i64) -> Result<i64> {
    let inserted: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO media_files (content_hash, s3_key, mime_type, file_size, created_at)
         VALUES ($1, $2, $3, $4, now())
         ON CONFLICT (content_hash) DO NOTHING
         RETURNING id",
    )
    .bind(content_hash)
    .bind(s3_key)
    .bind(mime_type)
    .bind(file_size)
    .fetch_optional(pool)
    .await
    .context("inserting media file")?;

    match inserted {
        Some((id,)) => Ok(id),
        None => {
            let (id,): (i64,) = sqlx::query_as("SELECT id FROM media_files WHERE content_hash = $1")
                .bind(content_hash)
                .fetch_one(pool)
                .await
                .context("looking up existing media file")?;
            Ok(id)
        }
    }
}

pub async fn link_message_media(pool: &PgPool, message_id: i64, media_id: i64, position: i32) -> Result<()> {
    sqlx::query(
        "INSERT INTO message_media (message_id, media_id, position) VALUES ($1, $2, $3)
         ON CONFLICT (message_id, media_id) DO NOTHING",
    )
    .bind(message_id)
    .bind(media_id)
    .bind(position)
    .execute(pool)
    .await
    .context("linking message to media")?;
    Ok(())
}

/// Create an import job with one pending candidate per CSV row, already deduplicated
/// by the caller.
pub async fn create_import_job(pool: &PgPool, target_folder: &str, inputs: &[String]) -> Result<uuid::Uuid> {
    let job_id = uuid::Uuid::new_v4();
    let mut tx = pool.begin().await.context("starting import job creation")?;

    sqlx::query("INSERT INTO import_jobs (id, target_folder, status) VALUES ($1, $2, 'uploading')")
        .bind(job_id)
        .bind(target_folder)
        .execute(&mut *tx)
        .await
        .context("inserting import job")?;

    for input in inputs {
        sqlx::query("INSERT INTO import_job_channels (import_job_id, input_value, status) VALUES ($1, $2, 'pending')")
            .bind(job_id)
            .bind(input)
            .execute(&mut *tx)
            .await
            .context("inserting import candidate")?;
    }

    tx.commit().await.context("committing import job creation")?;
    Ok(job_id)
}

pub async fn get_import_job(pool: &PgPool, job_id: uuid::Uuid) -> Result<Option<ImportJob>> {
    sqlx::query_as::<_, ImportJob>("SELECT * FROM import_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("looking up import job")
}

pub async fn set_import_job_status(pool: &PgPool, job_id: uuid::Uuid, status: &str) -> Result<()> {
    sqlx::query("UPDATE import_jobs SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(job_id)
        .execute(pool)
        .await
        .context("updating import job status")?;
    Ok(())
}

pub async fn get_import_candidates(pool: &PgPool, job_id: uuid::Uuid, status: &str) -> Result<Vec<ImportCandidate>> {
    sqlx::query_as::<_, ImportCandidate>("SELECT * FROM import_job_channels WHERE import_job_id = $1 AND status = $2 ORDER BY id")
        .bind(job_id)
        .bind(status)
        .fetch_all(pool)
        .await
        .context("listing import candidates")
}

pub async fn mark_candidate_validated(
    pool: &PgPool,
    candidate_id: i64,
    telegram_id: i64,
    access_hash: i64,
    title: &str,
    status: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE import_job_channels
         SET status = $1, telegram_id = $2, access_hash = $3, title = $4, updated_at = now()
         WHERE id = $5",
    )
    .bind(status)
    .bind(telegram_id)
    .bind(access_hash)
    .bind(title)
    .bind(candidate_id)
    .execute(pool)
    .await
    .context("marking candidate validated")?;
    Ok(())
}

pub async fn mark_candidate_failed(pool: &PgPool, candidate_id: i64, status: &str, reason: &str) -> Result<()> {
    sqlx::query("UPDATE import_job_channels SET status = $1, failure_reason = $2, updated_at = now() WHERE id = $3")
        .bind(status)
        .bind(reason)
        .bind(candidate_id)
        .execute(pool)
        .await
        .context("marking candidate failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_channel_carries_required_fields() {
        let d = DiscoveredChannel {
            telegram_id: 1,
            access_hash: Some(2),
            username: None,
            name: "test".to_string(),
            description: None,
            folder: "archive".to_string(),
            rule: "archive".to_string(),
            source_account: "default".to_string(),
        };
        assert_eq!(d.telegram_id, 1);
    }
}
