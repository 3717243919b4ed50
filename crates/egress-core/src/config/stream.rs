use url::Url;

use crate::errors::{EgressError, Result};
use crate::types::OutputType;
use crate::util::redact_stream_key;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub output_type: OutputType,
    pub urls: Vec<String>,
}

impl StreamConfig {
    pub fn new(output_type: OutputType, urls: &[String]) -> Result<Self> {
        if urls.is_empty() {
            return Err(EgressError::invalid_input("stream urls"));
        }
        Ok(Self {
            output_type,
            urls: urls.to_vec(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    pub url: String,
}

impl WebsocketConfig {
    pub fn new(url: &str) -> Result<Self> {
        validate_stream_url(url, OutputType::Raw)?;
        Ok(Self {
            url: url.to_string(),
        })
    }
}

/// Validate a live output url for its protocol; returns the redacted form
/// safe for logging and status updates.
pub fn validate_stream_url(raw: &str, output_type: OutputType) -> Result<String> {
    match output_type {
        OutputType::Rtmp => redact_stream_key(raw).ok_or_else(|| {
            EgressError::invalid_url(
                raw,
                "rtmp urls must be of format rtmp(s)://{host}(/{path})/{app}/{stream_key}( live=1)",
            )
        }),
        OutputType::Raw => {
            let parsed = Url::parse(raw)
                .map_err(|e| EgressError::invalid_url(raw, e.to_string()))?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return Err(EgressError::invalid_url(raw, "invalid scheme"));
            }
            Ok(raw.to_string())
        }
        _ => Err(EgressError::invalid_input("stream output type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtmp_url_validation() {
        let redacted =
            validate_stream_url("rtmp://live.example.com/app/secret", OutputType::Rtmp).unwrap();
        assert_eq!(redacted, "rtmp://live.example.com/app/{redacted}");

        assert!(validate_stream_url("rtmp://live.example.com/app", OutputType::Rtmp).is_err());
        assert!(validate_stream_url("http://live.example.com/app/key", OutputType::Rtmp).is_err());
    }

    #[test]
    fn test_websocket_url_validation() {
        assert!(validate_stream_url("ws://collector:9090/audio", OutputType::Raw).is_ok());
        assert!(validate_stream_url("wss://collector/audio", OutputType::Raw).is_ok());
        assert!(validate_stream_url("https://collector/audio", OutputType::Raw).is_err());
    }
}
