use serde::{Deserialize, Serialize};

use crate::util::redact_stream_key;

/// Job descriptor delivered by the dispatcher. Immutable once received; the
/// copy echoed in status updates has stream keys redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartEgressRequest {
    pub egress_id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ws_url: String,
    pub request: EgressRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressRequest {
    RoomComposite(RoomCompositeRequest),
    Web(WebRequest),
    TrackComposite(TrackCompositeRequest),
    Track(TrackRequest),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomCompositeRequest {
    pub room_name: String,
    #[serde(default)]
    pub layout: String,
    #[serde(default)]
    pub audio_only: bool,
    #[serde(default)]
    pub video_only: bool,
    #[serde(default)]
    pub custom_base_url: String,
    #[serde(default)]
    pub file_outputs: Vec<EncodedFileOutput>,
    #[serde(default)]
    pub stream_outputs: Vec<StreamOutput>,
    #[serde(default)]
    pub segment_outputs: Vec<SegmentedFileOutput>,
    #[serde(default)]
    pub options: Option<EncodingOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRequest {
    pub url: String,
    #[serde(default)]
    pub audio_only: bool,
    #[serde(default)]
    pub video_only: bool,
    #[serde(default)]
    pub await_start_signal: bool,
    #[serde(default)]
    pub file_outputs: Vec<EncodedFileOutput>,
    #[serde(default)]
    pub stream_outputs: Vec<StreamOutput>,
    #[serde(default)]
    pub segment_outputs: Vec<SegmentedFileOutput>,
    #[serde(default)]
    pub options: Option<EncodingOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackCompositeRequest {
    pub room_name: String,
    #[serde(default)]
    pub audio_track_id: String,
    #[serde(default)]
    pub video_track_id: String,
    #[serde(default)]
    pub file_outputs: Vec<EncodedFileOutput>,
    #[serde(default)]
    pub stream_outputs: Vec<StreamOutput>,
    #[serde(default)]
    pub segment_outputs: Vec<SegmentedFileOutput>,
    #[serde(default)]
    pub options: Option<EncodingOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRequest {
    pub room_name: String,
    pub track_id: String,
    pub output: TrackOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackOutput {
    File(DirectFileOutput),
    WebsocketUrl(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodedFileOutput {
    #[serde(default)]
    pub file_type: EncodedFileType,
    #[serde(default)]
    pub filepath: String,
    #[serde(default)]
    pub disable_manifest: bool,
    #[serde(default)]
    pub upload: Option<UploadTarget>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodedFileType {
    /// Container chosen from the codec intersection
    #[default]
    DefaultFiletype,
    Mp4,
    Ogg,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectFileOutput {
    #[serde(default)]
    pub filepath: String,
    #[serde(default)]
    pub disable_manifest: bool,
    #[serde(default)]
    pub upload: Option<UploadTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOutput {
    #[serde(default)]
    pub protocol: StreamProtocol,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    #[default]
    Rtmp,
    RawWebsocket,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentedFileOutput {
    #[serde(default)]
    pub filename_prefix: String,
    #[serde(default)]
    pub playlist_name: String,
    /// Segment length in seconds; 0 selects the default
    #[serde(default)]
    pub segment_duration: u32,
    #[serde(default)]
    pub filename_suffix: SegmentSuffix,
    #[serde(default)]
    pub disable_manifest: bool,
    #[serde(default)]
    pub upload: Option<UploadTarget>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSuffix {
    #[default]
    Index,
    Timestamp,
}

/// Invocation contract for storage uploads. Cloud-provider clients live
/// behind this; only the addressing shape is fixed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTarget {
    /// PUT each object to `<base_url>/<storage_path>`
    Http { base_url: String },
    /// Copy each object under a mounted storage prefix
    Prefix { dir: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingOptions {
    Preset(EncodingOptionsPreset),
    Advanced(AdvancedEncodingOptions),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingOptionsPreset {
    H264720p30,
    H264720p60,
    H2641080p30,
    H2641080p60,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvancedEncodingOptions {
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
    #[serde(default)]
    pub depth: Option<i32>,
    #[serde(default)]
    pub framerate: Option<i32>,
    #[serde(default)]
    pub audio_codec: Option<crate::types::AudioCodec>,
    #[serde(default)]
    pub audio_bitrate: Option<i32>,
    #[serde(default)]
    pub audio_frequency: Option<i32>,
    #[serde(default)]
    pub video_codec: Option<crate::types::VideoCodec>,
    #[serde(default)]
    pub video_bitrate: Option<i32>,
    #[serde(default)]
    pub key_frame_interval: Option<f64>,
    #[serde(default)]
    pub profile: Option<crate::types::VideoProfile>,
}

impl StartEgressRequest {
    /// Copy safe to log and to echo in status updates: stream keys elided.
    pub fn redacted(&self) -> Self {
        let mut clone = self.clone();
        match &mut clone.request {
            EgressRequest::RoomComposite(r) => redact_stream_outputs(&mut r.stream_outputs),
            EgressRequest::Web(r) => redact_stream_outputs(&mut r.stream_outputs),
            EgressRequest::TrackComposite(r) => redact_stream_outputs(&mut r.stream_outputs),
            EgressRequest::Track(_) => {}
        }
        clone
    }
}

fn redact_stream_outputs(outputs: &mut [StreamOutput]) {
    for output in outputs {
        for url in &mut output.urls {
            if let Some(redacted) = redact_stream_key(url) {
                *url = redacted;
            }
        }
    }
}
