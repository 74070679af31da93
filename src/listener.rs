//! Live update listener: the real-time counterpart to backfill. Subscribes to the
//! account's update stream and turns each arriving message into the same kind of
//! `StreamEntry` backfill produces, reassembling albums with `album::AlbumBuffer`
//! instead of backfill's ordered-iterator buffering (grammers has no aggregated
//! "album" update — see album.rs for why).

use std::sync::Arc;

use chrono::Utc;
use grammers_client::Client;
use grammers_client::client::UpdatesConfiguration;
use grammers_client::update::{Message as UpdateMessage, Update};
use grammers_session::updates::UpdatesLike;
use grammers_tl_types as tl;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::album::{self, AlbumBuffer, AlbumMember, PushOutcome, ReassembledAlbum, SWEEP_INTERVAL_DEFAULT};
use crate::broker::Broker;
use crate::config::Config;
use crate::discovery;
use crate::media_archiver;
use crate::models::{StagedMedia, StreamEntry};
use crate::store;

pub async fn listener_loop(
    client: Client,
    pool: PgPool,
    broker: Arc<Broker>,
    config: Arc<Config>,
    updates_rx: mpsc::UnboundedReceiver<UpdatesLike>,
    cancel: CancellationToken,
) {
    info!("Telegram listener started");

    let albums = Arc::new(AlbumBuffer::new());
    {
        let albums = albums.clone();
        let broker = broker.clone();
        let client = client.clone();
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { sweep_loop(albums, broker, client, pool, cancel).await });
    }

    let mut update_stream = client.stream_updates(updates_rx, UpdatesConfiguration::default());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Telegram listener shutting down");
                update_stream.sync_update_state();
                break;
            }
            update = update_stream.next() => {
                match update {
                    Ok(Update::NewMessage(msg)) if !msg.outgoing() => {
                        handle_message(&msg, &client, &pool, &broker, &albums).await;
                    }
                    Ok(Update::Raw(raw)) => {
                        handle_raw_update(&raw, &client, &pool, &config).await;
                    }
                    Ok(_) => {
                        // MessageEdited, MessageDeleted, etc. — not archived yet.
                    }
                    Err(e) => error!(error = %e, "error receiving Telegram update"),
                }
            }
        }
    }

    info!("Telegram listener stopped");
}

async fn handle_message(msg: &UpdateMessage, client: &Client, pool: &PgPool, broker: &Arc<Broker>, albums: &Arc<AlbumBuffer>) {
    let chat_id = msg.peer_id().bare_id();

    let channel = match store::get_channel_by_telegram_id(pool, chat_id).await {
        Ok(Some(c)) if c.active => c,
        Ok(_) => return,
        Err(e) => {
            warn!(error = %e, chat_id, "failed to look up channel for incoming message");
            return;
        }
    };

    match msg.grouped_id() {
        Some(grouped_id) => {
            let member = to_album_member(client, msg).await;
            match albums.push(channel.id, grouped_id, member).await {
                PushOutcome::Buffered => {
                    let albums = albums.clone();
                    let broker = broker.clone();
                    let scheduled_at = Instant::now();
                    tokio::spawn(async move {
                        if let Some(album) = albums.try_debounce_flush(channel.id, grouped_id, scheduled_at).await {
                            emit_album(&broker, channel.id, &album, false).await;
                        }
                    });
                }
                PushOutcome::Overflow(album) => {
                    emit_album(broker, channel.id, &album, false).await;
                }
            }
        }
        None => {
            let entry = single_message_entry(client, channel.id, msg, false).await;
            let _ = broker.push(false, &entry).await;
        }
    }
}

async fn handle_raw_update(raw: &tl::enums::Update, client: &Client, pool: &PgPool, config: &Arc<Config>) {
    let is_dialog_filter_update = matches!(raw, tl::enums::Update::DialogFilter(_) | tl::enums::Update::DialogFilterOrder(_));
    if !is_dialog_filter_update {
        return;
    }

    info!("detected folder change, re-running discovery out of cycle");
    match discovery::discover_once(client, pool, config).await {
        Ok(Some(folder)) => info!(folder, "discovery re-run after folder change"),
        Ok(None) => warn!("discovery re-run after folder change matched no folder"),
        Err(e) => error!(error = %e, "discovery re-run after folder change failed"),
    }
}

/// Periodically sweep the album buffer for groups the debounce path missed (a member
/// arrived, then nothing more for a full `STALE_TIMEOUT`). Incomplete-looking groups
/// get one remote range-read attempt to recover any members the update stream dropped,
/// before falling back to whatever was buffered.
async fn sweep_loop(albums: Arc<AlbumBuffer>, broker: Arc<Broker>, client: Client, pool: PgPool, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL_DEFAULT);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                for swept in albums.sweep().await {
                    let members = if swept.looks_incomplete {
                        match try_remote_fill(&client, &pool, swept.channel_id, swept.grouped_id, &swept.members).await {
                            Some(filled) => filled,
                            None => {
                                warn!(channel_id = swept.channel_id, grouped_id = swept.grouped_id, "remote range-read did not recover more members, flushing partial group");
                                swept.members
                            }
                        }
                    } else {
                        swept.members
                    };
                    let album = album::assemble(swept.grouped_id, members);
                    emit_album(&broker, swept.channel_id, &album, false).await;
                }
            }
        }
    }
}

/// Last-resort recovery for a swept group that looks incomplete: re-fetch a small
/// window of message ids around the known members via `get_messages_by_id` and keep
/// whichever of them share the group's `grouped_id`. Returns `None` if the lookup
/// failed or recovered no more members than were already buffered.
async fn try_remote_fill(client: &Client, pool: &PgPool, channel_id: i64, grouped_id: i64, members: &[AlbumMember]) -> Option<Vec<AlbumMember>> {
    let channel = store::get_channel_by_id(pool, channel_id).await.ok().flatten()?;
    let access_hash = channel.access_hash?;
    let input_channel = tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
        channel_id: channel.telegram_id,
        access_hash,
    });

    let known_min = members.iter().map(|m| m.telegram_message_id).min()?;
    let known_max = members.iter().map(|m| m.telegram_message_id).max()?;
    // Albums are rarely more than 10 items; pad a couple ids on either side in case
    // the first/last member never made it through the update stream at all.
    let window: Vec<i32> = ((known_min - 2).max(1)..=(known_max + 2)).map(|id| id as i32).collect();

    let fetched = match client.get_messages_by_id(input_channel, &window).await {
        Ok(msgs) => msgs,
        Err(e) => {
            warn!(error = %e, channel_id, grouped_id, "remote range-read for incomplete album failed");
            return None;
        }
    };

    let mut rebuilt = Vec::new();
    for msg in fetched.into_iter().flatten() {
        if msg.grouped_id() == Some(grouped_id) {
            rebuilt.push(to_album_member_from_message(client, &msg).await);
        }
    }

    if rebuilt.len() > members.len() {
        info!(channel_id, grouped_id, before = members.len(), after = rebuilt.len(), "recovered additional album members via remote range-read");
        Some(rebuilt)
    } else {
        None
    }
}

async fn emit_album(broker: &Broker, channel_id: i64, album: &ReassembledAlbum, is_backfilled: bool) {
    let entry = album_entry(channel_id, album, is_backfilled);
    let _ = broker.push(is_backfilled, &entry).await;
}

async fn to_album_member(client: &Client, msg: &UpdateMessage) -> AlbumMember {
    let staged = match msg.media() {
        Some(m) => stage_album_media(client, &m).await,
        None => None,
    };
    AlbumMember {
        telegram_message_id: msg.id() as i64,
        telegram_date: msg.date(),
        caption: Some(msg.text().to_string()).filter(|s| !s.is_empty()),
        media: staged,
    }
}

async fn to_album_member_from_message(client: &Client, msg: &grammers_client::types::Message) -> AlbumMember {
    let staged = match msg.media() {
        Some(m) => stage_album_media(client, &m).await,
        None => None,
    };
    AlbumMember {
        telegram_message_id: msg.id() as i64,
        telegram_date: msg.date(),
        caption: Some(msg.text().to_string()).filter(|s| !s.is_empty()),
        media: staged,
    }
}

async fn stage_album_media(client: &Client, media: &grammers_client::types::Media) -> Option<(crate::models::MediaKind, std::path::PathBuf)> {
    let kind = media_archiver::classify(media)?;
    let path = media_archiver::stage_media(client, media).await?;
    Some((kind, path))
}

/// Build the single `StreamEntry` representing a whole album, anchored at its
/// `primary_member_id` and carrying every successfully-staged member's media in order.
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

async fn single_message_entry(client: &Client, channel_id: i64, msg: &UpdateMessage, is_backfilled: bool) -> StreamEntry {
    let media = msg.media();
    let media_kind = media.as_ref().and_then(media_archiver::classify);
    let media_url = match &media {
        Some(m) => media_archiver::stage_media(client, m).await.map(|p| p.display().to_string()),
        None => None,
    };
    StreamEntry {
        message_id: Uuid::new_v4().to_string(),
        channel_id,
        telegram_message_id: msg.id() as i64,
        content: Some(msg.text().to_string()).filter(|s| !s.is_empty()),
        media_type: media_kind.map(|k| k.as_str().to_string()),
        media_url,
        telegram_date: msg.date(),
        ingested_at: Utc::now(),
        grouped_id: None,
        media_count: None,
        album_message_ids: Vec::new(),
        views: msg.view_count().map(|v| v as i64),
        forwards: msg.forward_count().map(|f| f as i64),
        author_user_id: msg.sender().map(|s| s.id()),
        replied_to_message_id: msg.reply_to_message_id().map(|id| id as i64),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::AlbumMember;

    fn member(id: i64, caption: Option<&str>) -> AlbumMember {
        AlbumMember {
            telegram_message_id: id,
            telegram_date: Utc::now(),
            caption: caption.map(|s| s.to_string()),
            media: None,
        }
    }

    #[test]
    fn album_entry_is_one_entry_carrying_the_caption_and_all_member_ids() {
        let members = vec![member(1, None), member(2, Some("hello"))];
        let album = album::assemble(9, members);
        let entry = album_entry(10, &album, false);
        assert_eq!(entry.content.as_deref(), Some("hello"));
        assert_eq!(entry.grouped_id, Some(9));
        assert_eq!(entry.telegram_message_id, 2);
        assert_eq!(entry.album_message_ids, vec![1, 2]);
    }
}
