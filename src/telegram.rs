//! Connection, login, and peer-cache plumbing around the grammers client. Folder
//! enumeration and channel reconciliation live in discovery.rs; this module owns
//! only what's specific to holding a live MTProto connection.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use grammers_client::{Client, SenderPool, SignInError};
use grammers_mtsender::ConnectionParams;
use grammers_session::types::PeerId;
use grammers_session::updates::UpdatesLike;
use grammers_tl_types as tl;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::TelegramError;
use crate::models::Channel;
use crate::tg_session::PgSession;

/// Holds a connected grammers client and its background runner handle.
pub struct TgConnection {
    pub client: Client,
    pub updates_rx: mpsc::UnboundedReceiver<UpdatesLike>,
    pub runner_handle: tokio::task::JoinHandle<()>,
}

/// Create a grammers Client connected to Telegram, loading its session from the
/// database so a restart resumes the same MTProto auth key and update cursor.
pub async fn connect(config: &Config, pool: &PgPool) -> Result<TgConnection> {
    let api_id = config
        .telegram
        .api_id
        .ok_or_else(|| TelegramError::Connection("api_id not configured".to_string()))?;

    info!("loading Telegram session from database");

    let session = Arc::new(
        PgSession::load(pool.clone())
            .await
            .map_err(|e| TelegramError::Connection(format!("failed to load session: {e}")))?,
    );

    let sender_pool = SenderPool::with_configuration(
        session as Arc<PgSession>,
        api_id,
        ConnectionParams {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_model: "telegram-archiver".to_string(),
            ..Default::default()
        },
    );

    let SenderPool {
        runner,
        handle: fat_handle,
        updates,
    } = sender_pool;

    let client = Client::new(fat_handle);

    let runner_handle = tokio::spawn(async move {
        runner.run().await;
    });

    Ok(TgConnection {
        client,
        updates_rx: updates,
        runner_handle,
    })
}

/// Interactive login flow (phone -> code -> optional 2FA).
pub async fn login(client: &Client, config: &Config) -> Result<()> {
    let api_hash = config
        .telegram
        .api_hash
        .as_deref()
        .ok_or_else(|| TelegramError::Connection("api_hash not configured".to_string()))?;

    if client.is_authorized().await.unwrap_or(false) {
        let me = client.get_me().await.context("getting current user")?;
        println!(
            "Already logged in as {} (@{})",
            me.full_name(),
            me.username().unwrap_or("no username")
        );
        return Ok(());
    }

    print!("Phone number (with country code, e.g. +380...): ");
    std::io::stdout().flush()?;
    let mut phone = String::new();
    std::io::stdin().read_line(&mut phone)?;
    let phone = phone.trim().to_string();

    let masked_phone = if phone.len() > 4 {
        format!(
            "{}****{}",
            &phone[..phone.len() - 4].chars().take(4).collect::<String>(),
            &phone[phone.len() - 4..]
        )
    } else {
        "****".to_string()
    };
    info!(phone = %masked_phone, "requesting login code");
    let token = client.request_login_code(&phone, api_hash).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("API_ID_INVALID") || msg.contains("CONNECTION_API_ID_INVALID") {
            anyhow::anyhow!(
                "invalid Telegram API credentials. Check [telegram].api_id and api_hash in config.toml \
                     (get valid credentials at https://my.telegram.org)"
            )
        } else {
            anyhow::anyhow!(e).context("requesting login code")
        }
    })?;

    println!("Login code sent via Telegram.");
    print!("Enter code: ");
    std::io::stdout().flush()?;
    let mut code = String::new();
    std::io::stdin().read_line(&mut code)?;
    let code = code.trim();

    match client.sign_in(&token, code).await {
        Ok(user) => {
            println!(
                "Logged in as {} (@{})",
                user.full_name(),
                user.username().unwrap_or("no username")
            );
        }
        Err(SignInError::PasswordRequired(password_token)) => {
            let hint = password_token.hint().unwrap_or("none");
            println!("Two-factor authentication required (hint: {hint})");
            let password = rpassword::prompt_password_stdout("Enter 2FA password: ").context("reading 2FA password")?;

            let user = client
                .check_password(password_token, password.as_bytes())
                .await
                .map_err(|e| anyhow::anyhow!("2FA check failed: {e:?}"))?;

            println!(
                "Logged in as {} (@{})",
                user.full_name(),
                user.username().unwrap_or("no username")
            );
        }
        Err(SignInError::InvalidCode) => {
            anyhow::bail!("invalid verification code");
        }
        Err(other) => {
            anyhow::bail!("sign-in failed: {other:?}");
        }
    }

    Ok(())
}

/// Print session/connection status.
pub async fn status(client: &Client) -> Result<()> {
    match client.is_authorized().await {
        Ok(true) => {
            let me = client.get_me().await.context("getting current user")?;
            println!("Status: Connected");
            println!("  Name: {}", me.full_name());
            if let Some(username) = me.username() {
                println!("  Username: @{username}");
            }
            if let Some(phone) = me.phone() {
                println!("  Phone: {phone}");
            }
        }
        Ok(false) => {
            println!("Status: Not authorized");
            println!("  Run 'archiver tg login' to authenticate.");
        }
        Err(e) => {
            println!("Status: Connection error");
            println!("  Error: {e}");
        }
    }
    Ok(())
}

/// Ensure every active channel's peer is present in the access-hash cache.
///
/// Channels discovered via dialog filters arrive with a valid access_hash already
/// (see discovery.rs), but a restart or a manually-inserted channel row may lack one.
/// Without it, `getHistory`/`iter_messages` on supergroups fails with CHANNEL_INVALID.
/// Warms the cache by iterating dialogs, on which grammers auto-caches peers via the
/// `Session` trait.
pub async fn ensure_peer_cache(client: &Client, pool: &PgPool, channels: &[Channel]) -> Result<()> {
    let mut uncached_ids: Vec<i64> = Vec::new();

    for channel in channels {
        let channel_api_id = PeerId::channel(channel.telegram_id).bot_api_dialog_id();
        let found = sqlx::query_scalar::<_, i32>("SELECT 1 FROM tg_peer_info WHERE peer_id = $1 LIMIT 1")
            .bind(channel_api_id)
            .fetch_optional(pool)
            .await
            .context("checking peer cache")?;

        if found.is_none() {
            uncached_ids.push(channel.telegram_id);
        }
    }

    if uncached_ids.is_empty() {
        return Ok(());
    }

    info!(uncached = uncached_ids.len(), "warming peer cache via dialog iteration");

    let mut dialogs = client.iter_dialogs();
    while let Some(_dialog) = dialogs.next().await.context("iterating dialogs for peer cache")? {
        // grammers auto-caches peers from the getDialogs API responses.
    }

    for telegram_id in &uncached_ids {
        let channel_api_id = PeerId::channel(*telegram_id).bot_api_dialog_id();
        let found = sqlx::query_scalar::<_, i32>("SELECT 1 FROM tg_peer_info WHERE peer_id = $1 LIMIT 1")
            .bind(channel_api_id)
            .fetch_optional(pool)
            .await
            .context("verifying peer cache")?;

        if found.is_none() {
            warn!(
                telegram_id,
                "peer not found after dialog iteration — is this account still a member?"
            );
        }
    }

    Ok(())
}

/// Cache the access hash from an InputPeer into tg_peer_info. Folder definitions
/// contain InputPeers with valid access_hashes that grammers' raw `invoke` doesn't
/// auto-cache, so discovery stages new channels through this before any history read.
pub async fn cache_input_peer(pool: &PgPool, peer: &tl::enums::InputPeer) {
    let (peer_id, access_hash) = match peer {
        tl::enums::InputPeer::Channel(c) => (PeerId::channel(c.channel_id), c.access_hash),
        tl::enums::InputPeer::User(u) => (PeerId::user(u.user_id), u.access_hash),
        _ => return,
    };

    let bot_api_id = peer_id.bot_api_dialog_id();
    if let Err(e) = sqlx::query(
        "INSERT INTO tg_peer_info (peer_id, hash) VALUES ($1, $2)
         ON CONFLICT (peer_id) DO UPDATE SET hash = COALESCE(excluded.hash, tg_peer_info.hash)",
    )
    .bind(bot_api_id)
    .bind(access_hash)
    .execute(pool)
    .await
    {
        warn!(error = %e, peer_id = bot_api_id, "failed to cache input peer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_phone_keeps_last_four_digits() {
        let phone = "+15551234567";
        let masked = format!(
            "{}****{}",
            &phone[..phone.len() - 4].chars().take(4).collect::<String>(),
            &phone[phone.len() - 4..]
        );
        assert!(masked.ends_with("4567"));
        assert!(masked.contains("****"));
    }

    #[test]
    fn bot_api_dialog_id_is_deterministic_per_channel() {
        let a = PeerId::channel(123).bot_api_dialog_id();
        let b = PeerId::channel(123).bot_api_dialog_id();
        let c = PeerId::channel(456).bot_api_dialog_id();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
