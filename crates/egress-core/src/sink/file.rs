use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::config::FileConfig;
use crate::errors::{EgressError, Result};
use crate::info::{EgressInfo, FileResult};
use crate::upload::{self, Uploader};

/// Local container file, optionally uploaded after EOS together with a JSON
/// manifest describing the job.
pub struct FileSink {
    conf: FileConfig,
    uploader: Option<Arc<dyn Uploader>>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    egress_id: &'a str,
    room_id: &'a str,
    room_name: &'a str,
    started_at: i64,
    ended_at: i64,
    filename: &'a str,
    duration_ns: i64,
    size: u64,
}

impl FileSink {
    pub fn new(conf: &FileConfig) -> Result<Self> {
        let uploader = match &conf.upload {
            Some(target) => Some(upload::from_target(target)?),
            None => None,
        };
        Ok(Self {
            conf: conf.clone(),
            uploader,
        })
    }

    pub fn local_filepath(&self) -> &std::path::Path {
        &self.conf.local_filepath
    }

    /// Finalize after the muxer has flushed: stat, upload, emit the result.
    /// File egress has a single output, so any failure here is fatal.
    pub async fn close(&mut self, info: &EgressInfo, duration_ns: i64) -> Result<FileResult> {
        let metadata = tokio::fs::metadata(&self.conf.local_filepath).await?;
        let mut result = FileResult {
            filename: self.conf.storage_filepath.clone(),
            duration_ns,
            size: metadata.len(),
            location: self.conf.local_filepath.to_string_lossy().to_string(),
        };

        if let Some(uploader) = &self.uploader {
            result.location = uploader
                .upload(
                    &self.conf.local_filepath,
                    &self.conf.storage_filepath,
                    self.conf.output_type.mime(),
                )
                .await?;

            if !self.conf.disable_manifest {
                self.upload_manifest(uploader.as_ref(), info, &result).await?;
            }
        }

        info!(
            "file egress complete: {} [{} bytes]",
            result.filename, result.size
        );
        Ok(result)
    }

    async fn upload_manifest(
        &self,
        uploader: &dyn Uploader,
        info: &EgressInfo,
        result: &FileResult,
    ) -> Result<()> {
        let manifest = Manifest {
            egress_id: &info.egress_id,
            room_id: &info.room_id,
            room_name: &info.room_name,
            started_at: info.started_at,
            ended_at: info.ended_at,
            filename: &result.filename,
            duration_ns: result.duration_ns,
            size: result.size,
        };
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| EgressError::Internal(e.to_string()))?;

        let local = self.conf.local_filepath.with_extension("json");
        tokio::fs::write(&local, body).await?;
        uploader
            .upload(&local, &self.conf.manifest_filepath(), "application/json")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EgressRequest, RoomCompositeRequest, UploadTarget};
    use crate::types::OutputType;

    fn info() -> EgressInfo {
        EgressInfo::new(
            "EG_file".to_string(),
            "RM_1".to_string(),
            EgressRequest::RoomComposite(RoomCompositeRequest::default()),
        )
    }

    #[tokio::test]
    async fn test_close_reports_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.mp4");
        tokio::fs::write(&local, vec![0u8; 2048]).await.unwrap();

        let conf = FileConfig {
            output_type: OutputType::Mp4,
            storage_filepath: "out.mp4".to_string(),
            local_filepath: local.clone(),
            disable_manifest: true,
            upload: None,
        };
        let mut sink = FileSink::new(&conf).unwrap();
        let result = sink.close(&info(), 5_000_000_000).await.unwrap();
        assert_eq!(result.filename, "out.mp4");
        assert_eq!(result.size, 2048);
        assert_eq!(result.duration_ns, 5_000_000_000);
        assert_eq!(result.location, local.to_string_lossy());
    }

    #[tokio::test]
    async fn test_close_uploads_file_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.mp4");
        tokio::fs::write(&local, vec![0u8; 128]).await.unwrap();

        let conf = FileConfig {
            output_type: OutputType::Mp4,
            storage_filepath: "recordings/out.mp4".to_string(),
            local_filepath: local,
            disable_manifest: false,
            upload: Some(UploadTarget::Prefix {
                dir: storage.path().to_string_lossy().to_string(),
            }),
        };
        let mut sink = FileSink::new(&conf).unwrap();
        let result = sink.close(&info(), 0).await.unwrap();

        assert!(storage.path().join("recordings/out.mp4").exists());
        assert!(storage.path().join("recordings/out.json").exists());
        assert_eq!(
            result.location,
            storage
                .path()
                .join("recordings/out.mp4")
                .to_string_lossy()
        );
    }
}
