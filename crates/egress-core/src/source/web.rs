use url::form_urlencoded;

use crate::config::PipelineConfig;
use crate::errors::{EgressError, Result};
use crate::types::SourceType;

/// Screen-capture source over a rendered web page. The headless browser is a
/// collaborator; this side owns the page url and the capture surface the
/// compositor elements read from.
pub struct WebSource {
    page_url: String,
}

impl WebSource {
    pub fn new(conf: &PipelineConfig) -> Result<Self> {
        debug_assert_eq!(conf.source.source_type, SourceType::Web);
        Ok(Self {
            page_url: build_page_url(conf)?,
        })
    }

    pub fn page_url(&self) -> &str {
        &self.page_url
    }
}

/// For room composite the template page is parameterized with layout, token
/// and signaling url; a plain web egress loads its url verbatim.
fn build_page_url(conf: &PipelineConfig) -> Result<String> {
    if !conf.source.web.web_url.is_empty() {
        return Ok(conf.source.web.web_url.clone());
    }

    let base = conf.source.web.base_url.trim_end_matches('/');
    if base.is_empty() {
        return Err(EgressError::invalid_input("template base url"));
    }
    let params = form_urlencoded::Serializer::new(String::new())
        .append_pair("layout", &conf.source.web.layout)
        .append_pair("token", &conf.source.token)
        .append_pair("url", &conf.source.ws_url)
        .finish();
    Ok(format!("{base}/#/?{params}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseConfig;
    use crate::request::{
        EgressRequest, EncodedFileOutput, EncodedFileType, RoomCompositeRequest,
        StartEgressRequest, WebRequest,
    };

    fn base() -> BaseConfig {
        BaseConfig {
            template_base: "https://recorder.example.com/".to_string(),
            ws_url: "wss://rtc.example.com".to_string(),
            local_output_dir: std::env::temp_dir(),
            ..BaseConfig::default()
        }
    }

    #[test]
    fn test_room_composite_url_is_templated() {
        let req = StartEgressRequest {
            egress_id: "EG_1".to_string(),
            room_id: String::new(),
            token: "tok".to_string(),
            ws_url: String::new(),
            request: EgressRequest::RoomComposite(RoomCompositeRequest {
                room_name: "demo".to_string(),
                layout: "speaker-dark".to_string(),
                file_outputs: vec![EncodedFileOutput {
                    file_type: EncodedFileType::Mp4,
                    filepath: "out.mp4".to_string(),
                    ..EncodedFileOutput::default()
                }],
                ..RoomCompositeRequest::default()
            }),
        };
        let conf = PipelineConfig::from_request(base(), &req).unwrap();
        let source = WebSource::new(&conf).unwrap();
        assert_eq!(
            source.page_url(),
            "https://recorder.example.com/#/?layout=speaker-dark&token=tok&url=wss%3A%2F%2Frtc.example.com"
        );
    }

    #[test]
    fn test_web_url_is_used_verbatim() {
        let req = StartEgressRequest {
            egress_id: "EG_1".to_string(),
            room_id: String::new(),
            token: String::new(),
            ws_url: String::new(),
            request: EgressRequest::Web(WebRequest {
                url: "https://example.com/live?x=1".to_string(),
                file_outputs: vec![EncodedFileOutput {
                    file_type: EncodedFileType::Mp4,
                    filepath: "out.mp4".to_string(),
                    ..EncodedFileOutput::default()
                }],
                ..WebRequest::default()
            }),
        };
        let conf = PipelineConfig::from_request(base(), &req).unwrap();
        let source = WebSource::new(&conf).unwrap();
        assert_eq!(source.page_url(), "https://example.com/live?x=1");
    }
}
