use std::path::{Path, PathBuf};

use anyhow::Result;
use config::Config;
use serde::{Deserialize, Serialize};

use egress_core::config::BaseConfig;

/// Service-level configuration, layered from a yaml file and `EGRESS_`
/// environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base url of the room-composite template page
    #[serde(default)]
    pub template_base: String,

    /// Default signaling url handed to handlers
    #[serde(default)]
    pub ws_url: String,

    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,

    /// Scratch directory for files pending upload; os temp when unset
    #[serde(default)]
    pub local_output_dir: Option<PathBuf>,

    /// Webhook receiving status updates
    #[serde(default)]
    pub info_url: String,
}

impl ServiceConfig {
    pub fn load(path: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("EGRESS"))
            .build()?;
        Ok(builder.try_deserialize()?)
    }

    /// Per-handler realization, serialized into the subprocess arguments.
    pub fn base_config(&self, handler_id: &str, tmp_dir: &Path) -> BaseConfig {
        BaseConfig {
            handler_id: handler_id.to_string(),
            tmp_dir: tmp_dir.to_path_buf(),
            template_base: self.template_base.clone(),
            ws_url: self.ws_url.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            local_output_dir: self
                .local_output_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            info_url: self.info_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_yaml_and_derive_base_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "template_base: https://recorder.example.com\nws_url: wss://rtc.example.com\n",
        )
        .unwrap();

        let conf = ServiceConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(conf.template_base, "https://recorder.example.com");
        assert_eq!(conf.ws_url, "wss://rtc.example.com");

        let tmp = dir.path().join("EGH_1");
        let base = conf.base_config("EGH_1", &tmp);
        assert_eq!(base.handler_id, "EGH_1");
        assert_eq!(base.tmp_dir, tmp);
        assert_eq!(base.local_output_dir, std::env::temp_dir());

        // the serialized form must survive the subprocess boundary
        let yaml = serde_yaml::to_string(&base).unwrap();
        let parsed: BaseConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.handler_id, base.handler_id);
        assert_eq!(parsed.template_base, base.template_base);
    }
}
