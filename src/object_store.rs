//! S3-compatible object store client for content-addressed media blobs.
//!
//! Keys use a two-level hex-prefix fanout on the SHA-256 content hash so no single
//! prefix accumulates millions of objects. Upload is insert-if-absent: a HEAD check
//! before PUT avoids re-uploading bytes that are already stored, and upload always
//! happens before the corresponding `media_files` row is inserted so a crash between
//! the two leaves an orphan blob (harmless) rather than a dangling row.

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use crate::config::ObjectStoreConfig;
use crate::error::ObjectStoreError;

pub struct ObjectStore {
    client: Client,
    bucket: String,
}

impl ObjectStore {
    pub async fn connect(config: &ObjectStoreConfig) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).endpoint_url(&config.endpoint);
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "tg-archiver-config",
            ));
        }
        loader = loader.region(aws_config::Region::new(config.region.clone()));
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    /// Build the content-addressed key: `{hh}/{hh}/{64-hex}[.ext]`.
    pub fn storage_key(content_hash: &str, ext: Option<&str>) -> String {
        let prefix1 = &content_hash[0..2];
        let prefix2 = &content_hash[2..4];
        match ext {
            Some(ext) => format!("{prefix1}/{prefix2}/{content_hash}.{ext}"),
            None => format!("{prefix1}/{prefix2}/{content_hash}"),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(ObjectStoreError::Head {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Upload only if not already present. Returns `true` if bytes were actually written.
    pub async fn put_if_absent(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<bool, ObjectStoreError> {
        if self.exists(key).await? {
            debug!(key, "media blob already present, skipping upload");
            return Ok(false);
        }

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));
        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }
        request.send().await.map_err(|e| ObjectStoreError::Put {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        Ok(true)
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Get {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        let bytes = output.body.collect().await.map_err(|e| ObjectStoreError::Get {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(bytes.into_bytes().to_vec())
    }
}

fn is_not_found<E: std::fmt::Debug>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    format!("{err:?}").contains("NotFound") || format!("{err:?}").contains("404")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_has_two_level_fanout() {
        let hash = "abcdef0123456789".repeat(4);
        let key = ObjectStore::storage_key(&hash, Some("jpg"));
        assert!(key.starts_with("ab/cd/"));
        assert!(key.ends_with(".jpg"));
    }

    #[test]
    fn storage_key_without_extension() {
        let hash = "0011223344556677".repeat(4);
        let key = ObjectStore::storage_key(&hash, None);
        assert_eq!(key, format!("00/11/{hash}"));
    }
}
