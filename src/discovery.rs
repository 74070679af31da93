//! Folder-driven channel discovery and gap detection.
//!
//! Enumerates the user's dialog filters, picks the one folder matching the configured
//! pattern, and reconciles its member channels against the stored set. A background
//! loop re-runs this every few minutes and, separately, scans for channels that have
//! gone quiet longer than expected and schedules backfills to fill the gap.

use std::time::Duration;

use anyhow::{Context, Result};
use grammers_client::Client;
use grammers_tl_types as tl;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, folder_matches_pattern};
use crate::store::{self, DiscoveredChannel};

const SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Run one discovery cycle: list dialog filters, find the configured folder, and
/// reconcile its channel set into the store. Returns the matched folder's title, if any.
pub async fn discover_once(client: &Client, pool: &PgPool, config: &Config) -> Result<Option<String>> {
    let request = tl::functions::messages::GetDialogFilters {};
    let result = match client.invoke(&request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to list dialog filters, preserving last known channel set");
            return Ok(None);
        }
    };

    let filters = match result {
        tl::enums::messages::DialogFilters::Filters(f) => f.filters,
    };

    let pattern = &config.archiver.folder_archive_all_pattern;
    let matched = filters.iter().find_map(|f| {
        let (title, include_peers) = match f {
            tl::enums::DialogFilter::Filter(df) => (extract_title(&df.title), &df.include_peers),
            tl::enums::DialogFilter::Chatlist(df) => (extract_title(&df.title), &df.include_peers),
            _ => return None,
        };
        let title = title?;
        folder_matches_pattern(&title, pattern).then(|| (title, include_peers.clone()))
    });

    let Some((folder_title, include_peers)) = matched else {
        warn!(pattern = %pattern, "no folder matched the configured pattern");
        return Ok(None);
    };

    let mut discovered = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for peer in &include_peers {
        let tl::enums::InputPeer::Channel(c) = peer else { continue };
        // last wins on duplicate telegram_id within one folder listing
        if !seen.insert(c.channel_id) {
            continue;
        }
        let (name, username) = resolve_channel_name(client, c.channel_id, c.access_hash).await;
        discovered.push(DiscoveredChannel {
            telegram_id: c.channel_id,
            access_hash: Some(c.access_hash),
            username,
            name: name.unwrap_or_else(|| c.channel_id.to_string()),
            description: None,
            folder: folder_title.clone(),
            rule: folder_title.clone(),
            source_account: config.telegram.source_account.clone(),
        });
    }

    // Only channels inserted for the first time get seeded per `backfill.mode`; an
    // already-known channel's backfill state is never touched by reconciliation.
    let initial_backfill_status = if config.backfill.enabled && config.backfill.mode == "on_discovery" {
        "pending"
    } else {
        "none"
    };

    info!(folder = %folder_title, channels = discovered.len(), "reconciling discovered channels");
    let newly_inserted = store::sync_channels(pool, &folder_title, &discovered, initial_backfill_status)
        .await
        .context("syncing discovered channels")?;

    if !newly_inserted.is_empty() {
        info!(count = newly_inserted.len(), status = initial_backfill_status, "seeded backfill status for newly discovered channels");
    }

    Ok(Some(folder_title))
}

async fn resolve_channel_name(client: &Client, channel_id: i64, access_hash: i64) -> (Option<String>, Option<String>) {
    let request = tl::functions::channels::GetChannels {
        id: vec![tl::enums::InputChannel::Channel(tl::types::InputChannel {
            channel_id,
            access_hash,
        })],
    };
    let chats = match client.invoke(&request).await {
        Ok(tl::enums::messages::Chats::Chats(c)) => c.chats,
        Ok(tl::enums::messages::Chats::Slice(c)) => c.chats,
        Err(e) => {
            warn!(channel_id, error = %e, "failed to resolve channel name");
            return (None, None);
        }
    };
    for chat in chats {
        if let tl::enums::Chat::Channel(ch) = chat
            && ch.id == channel_id
        {
            return (Some(ch.title), ch.username);
        }
    }
    (None, None)
}

fn extract_title(title: &tl::enums::TextWithEntities) -> Option<String> {
    match title {
        tl::enums::TextWithEntities::Entities(t) => Some(t.text.clone()),
    }
}

/// Detect channels whose last message is older than the configured threshold and
/// queue them for a gap-filling backfill, capped at `max_channels_per_check`.
pub async fn detect_and_queue_gaps(pool: &PgPool, config: &Config) -> Result<usize> {
    if !config.gap_detection.enabled {
        return Ok(0);
    }
    let gaps = store::detect_gaps(
        pool,
        config.gap_detection.threshold_hours as i32,
        config.gap_detection.max_channels_per_check as i64,
    )
    .await
    .context("detecting gaps")?;

    if gaps.is_empty() {
        return Ok(0);
    }

    info!(count = gaps.len(), "queuing gap-filling backfills");
    for channel in &gaps {
        store::set_backfill_status(pool, channel.id, "pending").await?;
    }
    Ok(gaps.len())
}

/// Background loop: periodic discovery sync plus gap detection, interleaved the way
/// the reference implementation's `start_background_sync()` does.
pub async fn run_loop(client: Client, pool: PgPool, config: std::sync::Arc<Config>, cancel: CancellationToken) {
    let gap_interval = humantime::parse_duration(&config.gap_detection.check_interval).unwrap_or(SYNC_INTERVAL);
    let mut sync_tick = tokio::time::interval(SYNC_INTERVAL);
    let mut gap_tick = tokio::time::interval(gap_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("discovery loop shutting down");
                return;
            }
            _ = sync_tick.tick() => {
                if let Err(e) = discover_once(&client, &pool, &config).await {
                    warn!(error = %e, "discovery cycle failed");
                }
            }
            _ = gap_tick.tick() => {
                if let Err(e) = detect_and_queue_gaps(&pool, &config).await {
                    warn!(error = %e, "gap detection cycle failed");
                }
            }
        }
    }
}
