//! Media type normalization and archival. Replaces the original's runtime
//! `media.__class__.__name__` dispatch with the `MediaKind` discriminated enum;
//! `Document` is refined further by MIME-type sniffing, matching `get_media_type()`'s
//! two-step classification.

use std::io::Write;

use grammers_client::types::Media;
use grammers_client::Client;
use tracing::warn;

use crate::models::MediaKind;

/// Classify a message's media into a `MediaKind`, refining documents and stickers
/// by MIME type. `message.media()` already drops media kinds grammers doesn't model
/// (e.g. service-only placeholders), surfacing those as `None` here too.
pub fn classify(media: &Media) -> Option<MediaKind> {
    match media {
        Media::Photo(_) => Some(MediaKind::Photo),
        Media::Contact(_) => Some(MediaKind::Contact),
        Media::Document(doc) => Some(doc.mime_type().map(refine_document).unwrap_or(MediaKind::Document)),
        Media::Sticker(sticker) => Some(sticker.document.mime_type().map(refine_document).unwrap_or(MediaKind::Document)),
        _ => None,
    }
}

/// Download a message's media to a temp file so the processor can pick it up,
/// hash it, and upload it content-addressed. Returns the staged path, or `None`
/// if the download failed (logged, not fatal — the message is still archived
/// without media rather than dropped entirely).
pub async fn stage_media(client: &Client, media: &Media) -> Option<std::path::PathBuf> {
    let mut file = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "failed to create temp file for media download");
            return None;
        }
    };

    let mut download = client.iter_download(media);
    loop {
        match download.next().await {
            Ok(Some(chunk)) => {
                if let Err(e) = file.write_all(&chunk) {
                    warn!(error = %e, "failed writing downloaded media chunk");
                    return None;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "media download failed");
                return None;
            }
        }
    }

    let (_, path) = match file.keep() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "failed to persist downloaded media temp file");
            return None;
        }
    };
    Some(path)
}

fn refine_document(mime_type: &str) -> MediaKind {
    if mime_type.contains("video") {
        MediaKind::Video
    } else if mime_type.contains("audio") {
        MediaKind::Audio
    } else if mime_type.contains("image") {
        MediaKind::Photo
    } else {
        MediaKind::Document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refines_video_mime() {
        assert_eq!(refine_document("video/mp4"), MediaKind::Video);
    }

    #[test]
    fn refines_audio_mime() {
        assert_eq!(refine_document("audio/ogg"), MediaKind::Audio);
    }

    #[test]
    fn unrecognized_mime_stays_document() {
        assert_eq!(refine_document("application/pdf"), MediaKind::Document);
    }
}
