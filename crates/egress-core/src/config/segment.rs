use std::fs;
use std::path::PathBuf;

use chrono::Local;

use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::info::SegmentsResult;
use crate::request::{SegmentSuffix, SegmentedFileOutput, UploadTarget};
use crate::types::{OutputType, KNOWN_EXTENSIONS};
use crate::util::{clean_filepath, string_replace};

const DEFAULT_SEGMENT_DURATION: u32 = 6;

#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub output_type: OutputType,
    /// Where segments and the playlist are written before upload
    pub local_dir: PathBuf,
    /// Storage prefix for uploaded objects, empty or ending in `/`
    pub storage_dir: String,
    pub playlist_filename: String,
    pub segment_prefix: String,
    pub suffix: SegmentSuffix,
    /// Seconds per segment
    pub segment_duration: u32,
    pub disable_manifest: bool,
    pub upload: Option<UploadTarget>,
}

impl PipelineConfig {
    pub(crate) fn segment_config(&mut self, output: &SegmentedFileOutput) -> Result<SegmentConfig> {
        let (identifier, replacements) = self.filename_info();

        let mut playlist_path = string_replace(&clean_filepath(&output.playlist_name), &replacements);
        let mut prefix = string_replace(&output.filename_prefix, &replacements);

        if playlist_path.is_empty() || playlist_path.ends_with('/') {
            let generated = if prefix.is_empty() {
                format!("{}-{}", identifier, Local::now().format("%Y-%m-%dT%H%M%S"))
            } else {
                prefix.clone()
            };
            playlist_path = format!("{playlist_path}{generated}.m3u8");
        } else if !playlist_path.ends_with(".m3u8") {
            if let Some(ext_idx) = playlist_path.rfind('.') {
                if KNOWN_EXTENSIONS.contains(&&playlist_path[ext_idx..]) {
                    playlist_path.truncate(ext_idx);
                }
            }
            playlist_path.push_str(".m3u8");
        }

        let (storage_dir, playlist_filename) = match playlist_path.rfind('/') {
            Some(idx) => (
                playlist_path[..=idx].to_string(),
                playlist_path[idx + 1..].to_string(),
            ),
            None => (String::new(), playlist_path.clone()),
        };

        if prefix.is_empty() {
            prefix = playlist_filename
                .strip_suffix(".m3u8")
                .unwrap_or(&playlist_filename)
                .to_string();
        }

        let local_dir = if output.upload.is_some() {
            self.base.local_output_dir.join(&self.info.egress_id)
        } else if storage_dir.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&storage_dir)
        };
        fs::create_dir_all(&local_dir)?;

        let duration = if output.segment_duration == 0 {
            DEFAULT_SEGMENT_DURATION
        } else {
            output.segment_duration
        };
        // keyframes must line up with segment boundaries
        if self.video.key_frame_interval == 0.0 {
            self.video.key_frame_interval = duration as f64;
        }

        self.info.segments = Some(SegmentsResult {
            playlist_name: playlist_path.clone(),
            ..SegmentsResult::default()
        });

        Ok(SegmentConfig {
            output_type: OutputType::Hls,
            local_dir,
            storage_dir,
            playlist_filename,
            segment_prefix: prefix,
            suffix: output.filename_suffix,
            segment_duration: duration,
            disable_manifest: output.disable_manifest,
            upload: output.upload.clone(),
        })
    }
}

impl SegmentConfig {
    pub fn local_playlist_path(&self) -> PathBuf {
        self.local_dir.join(&self.playlist_filename)
    }

    pub fn storage_playlist_path(&self) -> String {
        format!("{}{}", self.storage_dir, self.playlist_filename)
    }
}
