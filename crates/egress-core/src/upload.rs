use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Body;
use tokio::fs::File;
use url::Url;

use crate::errors::{EgressError, Result};
use crate::request::UploadTarget;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage upload contract. Implementations must be safe to call serially
/// from the segment upload worker and concurrently from other sinks.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `local` to `storage_path`; returns the object's final location.
    async fn upload(&self, local: &Path, storage_path: &str, mime: &str) -> Result<String>;
}

pub fn from_target(target: &UploadTarget) -> Result<Arc<dyn Uploader>> {
    match target {
        UploadTarget::Http { base_url } => Ok(Arc::new(HttpUploader::new(base_url)?)),
        UploadTarget::Prefix { dir } => Ok(Arc::new(PrefixUploader {
            root: dir.clone().into(),
        })),
    }
}

/// PUTs objects to `<base_url>/<storage_path>`.
pub struct HttpUploader {
    base: Url,
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| EgressError::invalid_url(base_url, e.to_string()))?;
        Ok(Self {
            base,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, local: &Path, storage_path: &str, mime: &str) -> Result<String> {
        let url = self
            .base
            .join(storage_path)
            .map_err(|e| EgressError::invalid_url(storage_path, e.to_string()))?;

        let upload = async {
            let file = File::open(local).await?;
            self.client
                .put(url.clone())
                .header("Content-Type", mime)
                .body(Body::from(file))
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, EgressError>(())
        };

        match tokio::time::timeout(UPLOAD_TIMEOUT, upload).await {
            Ok(Ok(())) => {
                debug!("uploaded {} -> {}", local.display(), url);
                Ok(url.to_string())
            }
            Ok(Err(e)) => Err(EgressError::Upload {
                path: storage_path.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(EgressError::Upload {
                path: storage_path.to_string(),
                reason: "timed out".to_string(),
            }),
        }
    }
}

/// Copies objects under a mounted storage prefix.
pub struct PrefixUploader {
    root: std::path::PathBuf,
}

#[async_trait]
impl Uploader for PrefixUploader {
    async fn upload(&self, local: &Path, storage_path: &str, _mime: &str) -> Result<String> {
        let dest = self.root.join(storage_path.trim_start_matches('/'));
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| EgressError::Upload {
                path: storage_path.to_string(),
                reason: e.to_string(),
            })?;
        debug!("copied {} -> {}", local.display(), dest.display());
        Ok(dest.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_uploader_copies_and_reports_location() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let local = src_dir.path().join("seg_0.ts");
        tokio::fs::write(&local, b"segment data").await.unwrap();

        let uploader = PrefixUploader {
            root: dst_dir.path().to_path_buf(),
        };
        let location = uploader
            .upload(&local, "live/seg_0.ts", "video/mp2t")
            .await
            .unwrap();

        let copied = dst_dir.path().join("live/seg_0.ts");
        assert_eq!(location, copied.to_string_lossy());
        assert_eq!(tokio::fs::read(copied).await.unwrap(), b"segment data");
    }

    #[tokio::test]
    async fn test_prefix_uploader_missing_source_is_an_upload_error() {
        let dst_dir = tempfile::tempdir().unwrap();
        let uploader = PrefixUploader {
            root: dst_dir.path().to_path_buf(),
        };
        let err = uploader
            .upload(Path::new("/nonexistent/seg.ts"), "seg.ts", "video/mp2t")
            .await
            .unwrap_err();
        assert!(matches!(err, EgressError::Upload { .. }));
    }
}
