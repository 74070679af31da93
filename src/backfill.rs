//! Per-channel historical backfill: walks a channel's message history oldest-first
//! and enqueues each reassembled post to the backfill priority stream.
//!
//! State machine: `pending -> in_progress -> {completed | failed | paused}`. A paused
//! channel (from a flood-wait) is resumed from its last backfilled message on the next
//! discovery tick or operator-triggered run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use grammers_client::Client;
use grammers_tl_types as tl;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::album::{self, AlbumMember, ReassembledAlbum};
use crate::broker::Broker;
use crate::config::{BackfillConfig, Config};
use crate::media_archiver;
use crate::models::{StagedMedia, StreamEntry};
use crate::store;

const CHECKPOINT_EVERY: u32 = 100;
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Background loop: periodically scans for channels in `pending`/`paused`
/// backfill state and runs them to completion, one at a time.
pub async fn run_loop(client: Client, pool: PgPool, broker: Arc<Broker>, config: Arc<Config>, cancel: CancellationToken) {
    if !config.backfill.enabled {
        info!("backfill disabled by config");
        return;
    }

    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("backfill loop shutting down");
                return;
            }
            _ = tick.tick() => {
                let channels = match store::get_backfillable_channels(&pool).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "failed to list backfillable channels");
                        continue;
                    }
                };

                for channel in channels {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let Some(access_hash) = channel.access_hash else {
                        warn!(channel_id = channel.id, "channel has no cached access_hash, skipping backfill");
                        continue;
                    };
                    let configured_start = channel
                        .backfill_from_date
                        .unwrap_or_else(|| config.backfill_start_date().unwrap_or_else(Utc::now));
                    let from_date = match resume_from_date(&pool, channel.id, configured_start).await {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(channel_id = channel.id, error = %e, "failed to resolve backfill resume point");
                            continue;
                        }
                    };

                    if let Err(e) = backfill_channel(
                        &client,
                        &pool,
                        &broker,
                        &config.backfill,
                        channel.id,
                        channel.telegram_id,
                        access_hash,
                        from_date,
                    )
                    .await
                    {
                        warn!(channel_id = channel.id, error = %e, "backfill run failed");
                    }
                }
            }
        }
    }
}

pub async fn backfill_channel(
    client: &Client,
    pool: &PgPool,
    broker: &Broker,
    config: &BackfillConfig,
    channel_id: i64,
    telegram_id: i64,
    access_hash: i64,
    from_date: DateTime<Utc>,
) -> Result<()> {
    store::set_backfill_status(pool, channel_id, "in_progress").await?;
    info!(channel_id, from_date = %from_date.to_rfc3339(), "starting backfill");

    let input_channel = tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
        channel_id: telegram_id,
        access_hash,
    });

    let mut fetched_since_checkpoint: u32 = 0;
    let mut current_album: Option<(i64, Vec<AlbumMember>)> = None;
    let batch_size = config.batch_size.max(1);
    let delay = Duration::from_millis(config.delay_ms);
    let mut since_pace = 0u32;

    let mut iter = client.iter_messages(input_channel).offset_date(from_date.timestamp() as i32);

    loop {
        let message = match iter.next().await {
            Ok(Some(m)) => m,
            Ok(None) => break,
            Err(e) => {
                if let Some(wait) = flood_wait_seconds(&e) {
                    warn!(channel_id, wait, "flood wait during backfill, pausing channel");
                    if let Some((grouped_id, members)) = current_album.take() {
                        flush_album(broker, channel_id, grouped_id, members, true).await;
                    }
                    store::set_backfill_status(pool, channel_id, "paused").await?;
                    return Ok(());
                }
                warn!(channel_id, error = %e, "backfill failed");
                store::set_backfill_status(pool, channel_id, "failed").await?;
                return Err(e.into());
            }
        };

        let grouped_id = message.grouped_id();

        match (grouped_id, &mut current_album) {
            (Some(gid), Some((current_gid, members))) if *current_gid == gid => {
                members.push(to_album_member(client, &message).await);
            }
            (Some(gid), _) => {
                if let Some((prev_gid, members)) = current_album.take() {
                    fetched_since_checkpoint += flush_album(broker, channel_id, prev_gid, members, true).await;
                }
                current_album = Some((gid, vec![to_album_member(client, &message).await]));
            }
            (None, _) => {
                if let Some((prev_gid, members)) = current_album.take() {
                    fetched_since_checkpoint += flush_album(broker, channel_id, prev_gid, members, true).await;
                }
                let entry = single_message_entry(client, channel_id, &message, true).await;
                let _ = broker.push(true, &entry).await;
                fetched_since_checkpoint += 1;
            }
        }

        since_pace += 1;
        if since_pace >= batch_size {
            since_pace = 0;
            tokio::time::sleep(delay).await;
        }

        if fetched_since_checkpoint >= CHECKPOINT_EVERY {
            store::update_backfill_progress(pool, channel_id, fetched_since_checkpoint as i64).await?;
            fetched_since_checkpoint = 0;
        }
    }

    if let Some((grouped_id, members)) = current_album.take() {
        fetched_since_checkpoint += flush_album(broker, channel_id, grouped_id, members, true).await;
    }
    if fetched_since_checkpoint > 0 {
        store::update_backfill_progress(pool, channel_id, fetched_since_checkpoint as i64).await?;
    }

    store::complete_backfill(pool, channel_id).await?;
    info!(channel_id, "backfill completed");
    Ok(())
}

/// Resume a paused/interrupted backfill from the most recently backfilled message,
/// falling back to the channel's original configured start date.
pub async fn resume_from_date(pool: &PgPool, channel_id: i64, configured_start: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let channel = store::get_channel_by_id(pool, channel_id).await.context("looking up channel for resume")?;
    Ok(channel.and_then(|c| c.last_message_at).unwrap_or(configured_start))
}

async fn to_album_member(client: &Client, message: &grammers_client::types::Message) -> AlbumMember {
    let staged = match message.media() {
        Some(m) => {
            let kind = media_archiver::classify(&m);
            match kind {
                Some(k) => media_archiver::stage_media(client, &m).await.map(|p| (k, p)),
                None => None,
            }
        }
        None => None,
    };
    AlbumMember {
        telegram_message_id: message.id() as i64,
        telegram_date: message.date(),
        caption: Some(message.text().to_string()).filter(|s| !s.is_empty()),
        media: staged,
    }
}

/// Flush a completed album as a single `StreamEntry` anchored on its primary member,
/// carrying every successfully-staged member's media in order. Returns the number of
/// members flushed, for checkpoint accounting (one album still counts as N messages).
async fn flush_album(broker: &Broker, channel_id: i64, grouped_id: i64, members: Vec<AlbumMember>, is_backfilled: bool) -> u32 {
    let count = members.len() as u32;
    let album = album::assemble(grouped_id, members);
    let entry = album_entry(channel_id, &album, is_backfilled);
    let _ = broker.push(is_backfilled, &entry).await;
    count
}

fn album_entry(channel_id: i64, album: &ReassembledAlbum, is_backfilled: bool) -> StreamEntry {
    let primary = album
        .members
        .iter()
        .find(|m| m.telegram_message_id == album.primary_member_id)
        .unwrap_or(&album.members[0]);

    let album_media: Vec<StagedMedia> = album
        .members
        .iter()
        .filter_map(|m| m.media.as_ref())
        .map(|(kind, path)| StagedMedia {
            local_path: path.display().to_string(),
            media_type: Some(kind.as_str().to_string()),
        })
        .collect();
    let media_type = album_media.first().and_then(|m| m.media_type.clone());

    StreamEntry {
        message_id: Uuid::new_v4().to_string(),
        channel_id,
        telegram_message_id: album.primary_member_id,
        content: album.caption.clone(),
        media_type,
        media_url: None,
        telegram_date: primary.telegram_date,
        ingested_at: Utc::now(),
        grouped_id: Some(album.grouped_id),
        media_count: Some(album.members.len() as i32),
        album_message_ids: album.member_ids.clone(),
        album_media,
        views: None,
        forwards: None,
        author_user_id: None,
        replied_to_message_id: None,
        forward_from_channel_id: None,
        forward_from_message_id: None,
        forward_date: None,
        has_comments: false,
        comments_count: None,
        linked_chat_id: None,
        source_account: String::new(),
        is_backfilled,
        trace_id: Uuid::new_v4().to_string(),
    }
}

async fn single_message_entry(client: &Client, channel_id: i64, message: &grammers_client::types::Message, is_backfilled: bool) -> StreamEntry {
    let media = message.media();
    let media_kind = media.as_ref().and_then(media_archiver::classify);
    let media_url = match &media {
        Some(m) => media_archiver::stage_media(client, m).await.map(|p| p.display().to_string()),
        None => None,
    };
    StreamEntry {
        message_id: Uuid::new_v4().to_string(),
        channel_id,
        telegram_message_id: message.id() as i64,
        content: Some(message.text().to_string()).filter(|s| !s.is_empty()),
        media_type: media_kind.map(|k| k.as_str().to_string()),
        media_url,
        telegram_date: message.date(),
        ingested_at: Utc::now(),
        grouped_id: None,
        media_count: None,
        album_message_ids: Vec::new(),
        views: message.view_count().map(|v| v as i64),
        forwards: message.forward_count().map(|f| f as i64),
        author_user_id: message.sender().map(|s| s.id()),
        replied_to_message_id: message.reply_to_message_id().map(|id| id as i64),
        forward_from_channel_id: None,
        forward_from_message_id: None,
        forward_date: None,
        has_comments: false,
        comments_count: None,
        linked_chat_id: None,
        source_account: String::new(),
        is_backfilled,
        trace_id: Uuid::new_v4().to_string(),
    }
}

fn flood_wait_seconds(err: &grammers_mtsender::InvocationError) -> Option<u32> {
    match err {
        grammers_mtsender::InvocationError::Rpc(rpc) if rpc.name == "FLOOD_WAIT" => rpc.value,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn album_entry_anchors_on_the_caption_bearing_member() {
        let members = vec![
            AlbumMember {
                telegram_message_id: 1,
                telegram_date: Utc::now(),
                caption: None,
                media: None,
            },
            AlbumMember {
                telegram_message_id: 2,
                telegram_date: Utc::now(),
                caption: Some("a caption".to_string()),
                media: None,
            },
        ];
        let album = album::assemble(55, members);
        assert_eq!(album.caption.as_deref(), Some("a caption"));
        assert_eq!(album.member_ids, vec![1, 2]);
        assert_eq!(album.primary_member_id, 2);

        let entry = album_entry(10, &album, true);
        assert_eq!(entry.telegram_message_id, 2);
        assert_eq!(entry.content.as_deref(), Some("a caption"));
        assert_eq!(entry.album_message_ids, vec![1, 2]);
        assert!(entry.album_media.is_empty());
    }
}
