//! Album reassembly. grammers has no aggregated "album" update, so a grouped-id's
//! arrival stream is debounced: once no further member arrives within a short window,
//! the group is flushed as if it were the library's aggregated event. A 30s sweeper
//! catches groups the debounce missed (wide inter-member gaps) and falls back to a
//! remote range-read when a swept group still looks incomplete. See §4.3.1.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::MediaKind;

const DEBOUNCE: Duration = Duration::from_millis(800);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const STALE_TIMEOUT: Duration = Duration::from_secs(60);
/// Overflow cap on distinct pending grouped-ids. Past this, new groups are flushed
/// as soon as a second member arrives instead of growing the buffer unboundedly.
const MAX_PENDING_GROUPS: usize = 10_000;

pub struct AlbumMember {
    pub telegram_message_id: i64,
    pub telegram_date: DateTime<Utc>,
    pub caption: Option<String>,
    /// Staged download path, set once the member's media has been fetched. `None` if
    /// the member carried no media or the download failed (logged, not fatal).
    pub media: Option<(MediaKind, PathBuf)>,
}

pub struct ReassembledAlbum {
    pub grouped_id: i64,
    pub caption: Option<String>,
    pub member_ids: Vec<i64>,
    /// The member a `StreamEntry` for this album is anchored on: the caption-bearing
    /// member if one exists, else the first member in iteration order.
    pub primary_member_id: i64,
    pub members: Vec<AlbumMember>,
}

struct PendingGroup {
    channel_id: i64,
    members: Vec<AlbumMember>,
    last_arrival: Instant,
}

/// Per-channel buffer of in-flight grouped-ids, keyed by `(channel_id, grouped_id)`.
pub struct AlbumBuffer {
    groups: Mutex<HashMap<(i64, i64), PendingGroup>>,
}

impl AlbumBuffer {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Add a member to a group's buffer. Returns `Some(album)` if the group should be
    /// flushed immediately: either the debounce window elapsed with no further arrival
    /// observed by the caller's next poll, or the buffer is at capacity and must
    /// overflow-flush rather than grow further.
    pub async fn push(&self, channel_id: i64, grouped_id: i64, member: AlbumMember) -> PushOutcome {
        let mut groups = self.groups.lock().await;
        let overflowing = groups.len() >= MAX_PENDING_GROUPS && !groups.contains_key(&(channel_id, grouped_id));

        let entry = groups.entry((channel_id, grouped_id)).or_insert_with(|| PendingGroup {
            channel_id,
            members: Vec::new(),
            last_arrival: Instant::now(),
        });
        entry.members.push(member);
        entry.last_arrival = Instant::now();

        if overflowing {
            warn!(channel_id, grouped_id, "album buffer at capacity, flushing via overflow path");
            let group = groups.remove(&(channel_id, grouped_id)).unwrap();
            return PushOutcome::Overflow(assemble(grouped_id, group.members));
        }

        PushOutcome::Buffered
    }

    /// Called by a debounce task per group: if no new member has arrived since it was
    /// scheduled, remove and return the group for emission as the "primary path".
    pub async fn try_debounce_flush(&self, channel_id: i64, grouped_id: i64, scheduled_at: Instant) -> Option<ReassembledAlbum> {
        tokio::time::sleep(DEBOUNCE).await;
        let mut groups = self.groups.lock().await;
        let still_quiescent = groups
            .get(&(channel_id, grouped_id))
            .map(|g| g.last_arrival <= scheduled_at + DEBOUNCE)
            .unwrap_or(false);
        if !still_quiescent {
            return None;
        }
        let group = groups.remove(&(channel_id, grouped_id))?;
        Some(assemble(grouped_id, group.members))
    }

    /// Sweep for groups whose most recent arrival is older than `STALE_TIMEOUT`.
    /// Groups that look incomplete (one member, or no non-empty caption) are returned
    /// separately so the caller can attempt a remote range-read before falling back
    /// to what was buffered.
    pub async fn sweep(&self) -> Vec<SweptGroup> {
        let mut groups = self.groups.lock().await;
        let now = Instant::now();
        let stale: Vec<(i64, i64)> = groups
            .iter()
            .filter(|(_, g)| now.duration_since(g.last_arrival) >= STALE_TIMEOUT)
            .map(|(k, _)| *k)
            .collect();

        let mut out = Vec::new();
        for key in stale {
            if let Some(group) = groups.remove(&key) {
                let looks_incomplete =
                    group.members.len() == 1 || !group.members.iter().any(|m| m.caption.as_deref().is_some_and(|c| !c.is_empty()));
                out.push(SweptGroup {
                    channel_id: group.channel_id,
                    grouped_id: key.1,
                    members: group.members,
                    looks_incomplete,
                });
            }
        }
        out
    }

    pub async fn cancel(&self, channel_id: i64, grouped_id: i64) {
        self.groups.lock().await.remove(&(channel_id, grouped_id));
    }
}

impl Default for AlbumBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub enum PushOutcome {
    Buffered,
    Overflow(ReassembledAlbum),
}

pub struct SweptGroup {
    pub channel_id: i64,
    pub grouped_id: i64,
    pub members: Vec<AlbumMember>,
    pub looks_incomplete: bool,
}

/// Pick the primary caption: the first non-empty member text in iteration order,
/// per the caption invariant in §4.3 — the caption may live on any member. The same
/// member anchors the album's `telegram_message_id` once emitted as a `StreamEntry`.
pub fn assemble(grouped_id: i64, members: Vec<AlbumMember>) -> ReassembledAlbum {
    let caption_bearer = members.iter().find(|m| m.caption.as_deref().is_some_and(|c| !c.is_empty()));
    let caption = caption_bearer.and_then(|m| m.caption.clone());
    let primary_member_id = caption_bearer
        .or_else(|| members.first())
        .map(|m| m.telegram_message_id)
        .unwrap_or_default();
    let member_ids = members.iter().map(|m| m.telegram_message_id).collect();
    debug!(grouped_id, count = members.len(), "assembled album");
    ReassembledAlbum {
        grouped_id,
        caption,
        member_ids,
        primary_member_id,
        members,
    }
}

pub const SWEEP_INTERVAL_DEFAULT: Duration = SWEEP_INTERVAL;

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64, caption: Option<&str>) -> AlbumMember {
        AlbumMember {
            telegram_message_id: id,
            telegram_date: Utc::now(),
            caption: caption.map(|s| s.to_string()),
            media: None,
        }
    }

    #[test]
    fn assemble_picks_first_non_empty_caption_regardless_of_order() {
        let members = vec![member(3, None), member(1, Some("")), member(2, Some("caption here"))];
        let album = assemble(42, members);
        assert_eq!(album.caption.as_deref(), Some("caption here"));
        assert_eq!(album.member_ids, vec![3, 1, 2]);
        assert_eq!(album.primary_member_id, 2);
    }

    #[test]
    fn assemble_falls_back_to_first_member_when_no_caption() {
        let members = vec![member(7, None), member(8, None)];
        let album = assemble(43, members);
        assert_eq!(album.primary_member_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn push_then_debounce_flush_returns_album_if_quiescent() {
        let buffer = AlbumBuffer::new();
        let scheduled_at = Instant::now();
        buffer.push(1, 99, member(10, Some("hi"))).await;
        let result = buffer.try_debounce_flush(1, 99, scheduled_at).await;
        assert!(result.is_some());
        assert_eq!(result.unwrap().member_ids, vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_flags_single_member_groups_as_incomplete() {
        let buffer = AlbumBuffer::new();
        buffer.push(1, 7, member(5, None)).await;
        tokio::time::advance(STALE_TIMEOUT + Duration::from_secs(1)).await;
        let swept = buffer.sweep().await;
        assert_eq!(swept.len(), 1);
        assert!(swept[0].looks_incomplete);
    }
}
