//! Folder import pipeline: a CSV of channel URLs/usernames is validated against
//! Telegram in small batches, then the accepted candidates are joined one at a
//! time with a jittered delay and folded into the target folder's include-list.
//!
//! Lifecycle: `uploading -> validating -> ready -> processing -> completed | cancelled`.
//! Per-candidate: `pending -> (validated | validation_failed | already_member) ->
//! (joined | join_failed | already_member)`.

use std::time::Duration;

use anyhow::{Context, Result};
use grammers_client::Client;
use grammers_mtsender::InvocationError;
use grammers_tl_types as tl;
use rand::Rng;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store;

const VALIDATE_BATCH_SIZE: usize = 10;
const VALIDATE_BATCH_DELAY: Duration = Duration::from_secs(5);
const JOIN_DELAY_MIN_SECS: u64 = 30;
const JOIN_DELAY_MAX_SECS: u64 = 60;
const FLOOD_BACKOFF_MULTIPLIER: f64 = 1.5;
const MAX_FOLDER_PEERS: usize = 100;
const MIN_FOLDER_ID: i32 = 2;
const MAX_FOLDER_ID: i32 = 255;

/// Create a new import job with one pending candidate per (deduplicated) CSV row.
pub async fn create_job(pool: &PgPool, target_folder: &str, inputs: Vec<String>) -> Result<Uuid> {
    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<String> = inputs.into_iter().filter(|i| seen.insert(i.clone())).collect();
    store::create_import_job(pool, target_folder, &deduped).await
}

/// Validate every pending candidate in a job, in batches of `VALIDATE_BATCH_SIZE`
/// with a pause between batches to stay flood-wait-safe.
pub async fn validate_job(client: &Client, pool: &PgPool, job_id: Uuid) -> Result<()> {
    store::set_import_job_status(pool, job_id, "validating").await?;
    let pending = store::get_import_candidates(pool, job_id, "pending").await?;

    info!(job_id = %job_id, count = pending.len(), "validating import candidates");

    for batch in pending.chunks(VALIDATE_BATCH_SIZE) {
        for candidate in batch {
            match resolve_candidate(client, &candidate.input_value).await {
                Ok(Some(resolved)) => {
                    let status = if resolved.already_member { "already_member" } else { "validated" };
                    store::mark_candidate_validated(
                        pool,
                        candidate.id,
                        resolved.telegram_id,
                        resolved.access_hash,
                        &resolved.title,
                        status,
                    )
                    .await?;
                }
                Ok(None) => {
                    store::mark_candidate_failed(pool, candidate.id, "validation_failed", "channel not found").await?;
                }
                Err(InvocationError::Rpc(rpc)) if rpc.name == "FLOOD_WAIT" => {
                    let wait = rpc.value.unwrap_or(0) as f64 * FLOOD_BACKOFF_MULTIPLIER;
                    warn!(job_id = %job_id, wait, "flood wait during validation, backing off");
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    store::mark_candidate_failed(pool, candidate.id, "validation_failed", "rate limited").await?;
                }
                Err(e) => {
                    store::mark_candidate_failed(pool, candidate.id, "validation_failed", &e.to_string()).await?;
                }
            }
        }
        tokio::time::sleep(VALIDATE_BATCH_DELAY).await;
    }

    store::set_import_job_status(pool, job_id, "ready").await?;
    Ok(())
}

/// Join every validated candidate one at a time, with a jittered inter-join delay,
/// then fold each newly-joined channel into the target folder's include-list.
pub async fn process_job(client: &Client, pool: &PgPool, job_id: Uuid) -> Result<()> {
    let Some(job) = store::get_import_job(pool, job_id).await? else {
        anyhow::bail!("import job {job_id} not found");
    };
    store::set_import_job_status(pool, job_id, "processing").await?;

    let validated = store::get_import_candidates(pool, job_id, "validated").await?;
    info!(job_id = %job_id, count = validated.len(), "joining validated candidates");

    for candidate in validated {
        let (Some(telegram_id), Some(access_hash)) = (candidate.telegram_id, candidate.access_hash) else {
            store::mark_candidate_failed(pool, candidate.id, "join_failed", "missing resolved peer").await?;
            continue;
        };
        let channel = tl::enums::InputChannel::Channel(tl::types::InputChannel {
            channel_id: telegram_id,
            access_hash,
        });

        match join_with_retry(client, channel.clone()).await {
            Ok(()) => {
                if let Err(e) = add_to_folder(client, &job.target_folder, telegram_id, access_hash).await {
                    warn!(job_id = %job_id, telegram_id, error = %e, "joined but failed to wire into folder");
                }
                store::mark_candidate_validated(
                    pool,
                    candidate.id,
                    telegram_id,
                    access_hash,
                    candidate.title.as_deref().unwrap_or_default(),
                    "joined",
                )
                .await?;
            }
            Err(e) => {
                store::mark_candidate_failed(pool, candidate.id, "join_failed", &e.to_string()).await?;
            }
        }

        let delay = rand::rng().random_range(JOIN_DELAY_MIN_SECS..=JOIN_DELAY_MAX_SECS);
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }

    store::set_import_job_status(pool, job_id, "completed").await?;
    info!(job_id = %job_id, "import job completed");
    Ok(())
}

struct ResolvedCandidate {
    telegram_id: i64,
    access_hash: i64,
    title: String,
    already_member: bool,
}

async fn resolve_candidate(client: &Client, input: &str) -> Result<Option<ResolvedCandidate>, InvocationError> {
    let username = normalize_username(input);
    let request = tl::functions::contacts::ResolveUsername { username };
    let tl::enums::contacts::ResolvedPeer::Peer(resolved) = client.invoke(&request).await?;

    for chat in resolved.chats {
        if let tl::enums::Chat::Channel(ch) = chat {
            let Some(access_hash) = ch.access_hash else { continue };
            return Ok(Some(ResolvedCandidate {
                telegram_id: ch.id,
                access_hash,
                title: ch.title,
                already_member: !ch.left,
            }));
        }
    }
    Ok(None)
}

/// Strip a `t.me/` URL or leading `@` down to a bare username.
fn normalize_username(input: &str) -> String {
    input
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("t.me/")
        .trim_start_matches('@')
        .to_string()
}

async fn join_with_retry(client: &Client, channel: tl::enums::InputChannel) -> Result<(), InvocationError> {
    let request = tl::functions::channels::JoinChannel { channel };
    match client.invoke(&request).await {
        Ok(_) => Ok(()),
        Err(InvocationError::Rpc(rpc)) if rpc.name == "FLOOD_WAIT" => {
            let wait = rpc.value.unwrap_or(0) as f64 * FLOOD_BACKOFF_MULTIPLIER;
            warn!(wait, "flood wait during join, retrying once");
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            client.invoke(&request).await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Add a newly-joined channel to the target folder's include-list, creating the
/// folder (with the next free id in 2..=255) if it doesn't exist yet.
async fn add_to_folder(client: &Client, folder_title: &str, telegram_id: i64, access_hash: i64) -> Result<()> {
    let list_request = tl::functions::messages::GetDialogFilters {};
    let filters = match client.invoke(&list_request).await.context("listing dialog filters")? {
        tl::enums::messages::DialogFilters::Filters(f) => f.filters,
    };

    let peer = tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
        channel_id: telegram_id,
        access_hash,
    });

    let existing = filters.iter().find_map(|f| match f {
        tl::enums::DialogFilter::Filter(df) if filter_title(&df.title).as_deref() == Some(folder_title) => {
            Some((df.id, df.clone()))
        }
        _ => None,
    });

    let (id, mut updated) = match existing {
        Some((id, df)) => (id, df),
        None => {
            let used_ids: std::collections::HashSet<i32> = filters
                .iter()
                .map(|f| match f {
                    tl::enums::DialogFilter::Filter(df) => df.id,
                    tl::enums::DialogFilter::Chatlist(df) => df.id,
                    tl::enums::DialogFilter::Default => 0,
                })
                .collect();
            let next_id = (MIN_FOLDER_ID..=MAX_FOLDER_ID)
                .find(|id| !used_ids.contains(id))
                .context("no free dialog filter id available (2..=255 all in use)")?;
            (
                next_id,
                tl::types::DialogFilter {
                    contacts: false,
                    non_contacts: false,
                    groups: false,
                    broadcasts: false,
                    bots: false,
                    exclude_muted: false,
                    exclude_read: false,
                    exclude_archived: false,
                    id: next_id,
                    title: tl::enums::TextWithEntities::Entities(tl::types::TextWithEntities {
                        text: folder_title.to_string(),
                        entities: Vec::new(),
                    }),
                    emoticon: None,
                    color: None,
                    pinned_peers: Vec::new(),
                    include_peers: Vec::new(),
                    exclude_peers: Vec::new(),
                },
            )
        }
    };

    let already_included = updated.include_peers.iter().any(|p| matches!(p, tl::enums::InputPeer::Channel(c) if c.channel_id == telegram_id));
    if already_included {
        return Ok(());
    }
    if updated.pinned_peers.len() + updated.include_peers.len() >= MAX_FOLDER_PEERS {
        anyhow::bail!("folder '{folder_title}' already holds {MAX_FOLDER_PEERS} peers");
    }
    updated.include_peers.push(peer);

    let request = tl::functions::messages::UpdateDialogFilter {
        id,
        filter: Some(tl::enums::DialogFilter::Filter(updated)),
    };
    client.invoke(&request).await.context("updating dialog filter")?;
    Ok(())
}

fn filter_title(title: &tl::enums::TextWithEntities) -> Option<String> {
    match title {
        tl::enums::TextWithEntities::Entities(t) => Some(t.text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_username_strips_url_and_at_sign() {
        assert_eq!(normalize_username("https://t.me/somechannel"), "somechannel");
        assert_eq!(normalize_username("@somechannel"), "somechannel");
        assert_eq!(normalize_username("somechannel"), "somechannel");
    }
}
