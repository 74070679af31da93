//! Authenticity hashing for archived messages and content-addressing for media blobs.
//!
//! Every persisted message carries two digests: `content_hash` binds the message's
//! editable fields (content, who it came from), and `metadata_hash` additionally binds
//! structural facts (channel, telegram id, date) so a moved or re-keyed row can still be
//! detected as altered. Both are SHA-256 over a fixed, versioned field order — changing
//! that order is a breaking change and must bump `HASH_VERSION`.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

pub const HASH_ALGORITHM: &str = "sha256";
pub const HASH_VERSION: i32 = 1;

pub struct MessageHashInput<'a> {
    pub telegram_message_id: i64,
    pub channel_id: i64,
    pub telegram_date: DateTime<Utc>,
    pub content: Option<&'a str>,
    pub sender_id: Option<i64>,
    pub forward_from_id: Option<i64>,
    pub forward_from_name: Option<&'a str>,
    pub forward_date: Option<DateTime<Utc>>,
}

pub struct MessageHashes {
    pub content_hash: String,
    pub metadata_hash: String,
}

/// Generate the pair of authenticity hashes for a message. `content_hash` covers only
/// the fields a forwarder could plausibly reproduce; `metadata_hash` folds in
/// `content_hash` plus the structural fields that pin the message to its channel and
/// position, so two messages with identical text in different channels hash differently.
pub fn generate_hashes(input: &MessageHashInput) -> MessageHashes {
    let mut content_hasher = Sha256::new();
    content_hasher.update(input.content.unwrap_or("").as_bytes());
    content_hasher.update(input.sender_id.unwrap_or(0).to_le_bytes());
    content_hasher.update(input.forward_from_id.unwrap_or(0).to_le_bytes());
    content_hasher.update(input.forward_from_name.unwrap_or("").as_bytes());
    content_hasher.update(
        input
            .forward_date
            .map(|d| d.timestamp())
            .unwrap_or(0)
            .to_le_bytes(),
    );
    let content_hash = hex::encode(content_hasher.finalize());

    let mut metadata_hasher = Sha256::new();
    metadata_hasher.update(content_hash.as_bytes());
    metadata_hasher.update(input.telegram_message_id.to_le_bytes());
    metadata_hasher.update(input.channel_id.to_le_bytes());
    metadata_hasher.update(input.telegram_date.timestamp().to_le_bytes());
    let metadata_hash = hex::encode(metadata_hasher.finalize());

    MessageHashes {
        content_hash,
        metadata_hash,
    }
}

/// Stream-hash media bytes for content-addressed storage. Used before upload so the
/// storage key is known ahead of the PUT and a duplicate upload never happens twice.
pub async fn hash_reader<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        bytes.as_ref().iter().fold(String::new(), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_hashes_identically() {
        let date = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let input = MessageHashInput {
            telegram_message_id: 42,
            channel_id: 7,
            telegram_date: date,
            content: Some("hello"),
            sender_id: Some(99),
            forward_from_id: None,
            forward_from_name: None,
            forward_date: None,
        };
        let a = generate_hashes(&input);
        let b = generate_hashes(&input);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.metadata_hash, b.metadata_hash);
    }

    #[test]
    fn different_channel_changes_metadata_hash_only() {
        let date = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let base = MessageHashInput {
            telegram_message_id: 42,
            channel_id: 7,
            telegram_date: date,
            content: Some("hello"),
            sender_id: Some(99),
            forward_from_id: None,
            forward_from_name: None,
            forward_date: None,
        };
        let moved = MessageHashInput {
            channel_id: 8,
            ..base_copy(&base)
        };
        let a = generate_hashes(&base);
        let b = generate_hashes(&moved);
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.metadata_hash, b.metadata_hash);
    }

    fn base_copy<'a>(input: &MessageHashInput<'a>) -> MessageHashInput<'a> {
        MessageHashInput {
            telegram_message_id: input.telegram_message_id,
            channel_id: input.channel_id,
            telegram_date: input.telegram_date,
            content: input.content,
            sender_id: input.sender_id,
            forward_from_id: input.forward_from_id,
            forward_from_name: input.forward_from_name,
            forward_date: input.forward_date,
        }
    }
}
