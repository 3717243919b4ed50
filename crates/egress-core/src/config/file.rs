use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::config::{BaseConfig, PipelineConfig};
use crate::errors::Result;
use crate::request::{DirectFileOutput, EncodedFileOutput, EncodedFileType, UploadTarget};
use crate::types::{OutputType, KNOWN_EXTENSIONS};
use crate::util::{clean_filepath, string_replace};

#[derive(Debug, Clone)]
pub struct FileConfig {
    pub output_type: OutputType,
    /// User-facing path, after templating and extension fixup
    pub storage_filepath: String,
    /// Where the muxer actually writes
    pub local_filepath: PathBuf,
    pub disable_manifest: bool,
    pub upload: Option<UploadTarget>,
}

impl PipelineConfig {
    pub(crate) fn encoded_file_config(&mut self, output: &EncodedFileOutput) -> Result<FileConfig> {
        let output_type = match output.file_type {
            EncodedFileType::DefaultFiletype => OutputType::UnknownFile,
            EncodedFileType::Mp4 => OutputType::Mp4,
            EncodedFileType::Ogg => OutputType::Ogg,
        };
        self.build_file_config(
            output_type,
            &output.filepath,
            output.disable_manifest,
            output.upload.clone(),
        )
    }

    pub(crate) fn direct_file_config(&mut self, output: &DirectFileOutput) -> Result<FileConfig> {
        self.build_file_config(
            OutputType::UnknownFile,
            &output.filepath,
            output.disable_manifest,
            output.upload.clone(),
        )
    }

    fn build_file_config(
        &mut self,
        output_type: OutputType,
        filepath: &str,
        disable_manifest: bool,
        upload: Option<UploadTarget>,
    ) -> Result<FileConfig> {
        let mut conf = FileConfig {
            output_type,
            storage_filepath: clean_filepath(filepath),
            local_filepath: PathBuf::new(),
            disable_manifest,
            upload,
        };

        let (identifier, replacements) = self.filename_info();
        if conf.output_type != OutputType::UnknownFile {
            let base = self.base.clone();
            conf.update_filepath(&base, &self.info.egress_id, &identifier, &replacements)?;
        } else {
            // container not yet known; the extension is fixed up once the
            // output type has been resolved
            conf.storage_filepath = string_replace(&conf.storage_filepath, &replacements);
        }
        Ok(conf)
    }
}

impl FileConfig {
    /// Apply template replacements and normalize the extension, then derive
    /// the local write location (direct, or under the scratch dir when the
    /// file is uploaded afterwards).
    pub fn update_filepath(
        &mut self,
        base: &BaseConfig,
        egress_id: &str,
        identifier: &str,
        replacements: &HashMap<String, String>,
    ) -> Result<()> {
        self.storage_filepath = string_replace(&self.storage_filepath, replacements);

        let ext = self.output_type.extension();
        if self.storage_filepath.is_empty() || self.storage_filepath.ends_with('/') {
            self.storage_filepath = format!(
                "{}{}-{}{}",
                self.storage_filepath,
                identifier,
                Local::now().format("%Y-%m-%dT%H%M%S"),
                ext
            );
        } else if !self.storage_filepath.ends_with(ext) {
            if let Some(ext_idx) = self.storage_filepath.rfind('.') {
                if KNOWN_EXTENSIONS.contains(&&self.storage_filepath[ext_idx..]) {
                    self.storage_filepath.truncate(ext_idx);
                }
            }
            self.storage_filepath.push_str(ext);
        }

        let storage_path = Path::new(&self.storage_filepath);
        if self.upload.is_none() {
            if let Some(dir) = storage_path.parent() {
                if !dir.as_os_str().is_empty() {
                    fs::create_dir_all(dir)?;
                }
            }
            self.local_filepath = PathBuf::from(&self.storage_filepath);
        } else {
            let tmp_dir = base.local_output_dir.join(egress_id);
            fs::create_dir_all(&tmp_dir)?;
            let filename = storage_path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| self.storage_filepath.clone());
            self.local_filepath = tmp_dir.join(filename);
        }
        Ok(())
    }

    pub fn manifest_filepath(&self) -> String {
        match self.storage_filepath.rfind('.') {
            Some(idx) => format!("{}.json", &self.storage_filepath[..idx]),
            None => format!("{}.json", self.storage_filepath),
        }
    }
}
