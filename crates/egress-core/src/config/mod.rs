use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::errors::{EgressError, Result};
use crate::info::EgressInfo;
use crate::request::{
    AdvancedEncodingOptions, EgressRequest, EncodedFileOutput, EncodingOptions,
    EncodingOptionsPreset, SegmentedFileOutput, StartEgressRequest, StreamOutput, StreamProtocol,
    TrackOutput,
};
use crate::types::{
    compatible_audio_codecs, compatible_video_codecs, default_audio_codec, default_video_codec,
    file_type_compatible_with, AudioCodec, EgressType, OutputType, SourceType, VideoCodec,
    VideoProfile, ALL_OUTPUT_AUDIO_CODECS, ALL_OUTPUT_VIDEO_CODECS,
    AUDIO_ONLY_FILE_OUTPUT_TYPES, AUDIO_VIDEO_FILE_OUTPUT_TYPES, VIDEO_ONLY_FILE_OUTPUT_TYPES,
};
use crate::util::{string_replace, unix_nanos_now};

mod file;
mod segment;
mod stream;

pub use file::FileConfig;
pub use segment::SegmentConfig;
pub use stream::{validate_stream_url, StreamConfig, WebsocketConfig};

const WEB_LATENCY_NS: u64 = 2_000_000_000;
const SDK_LATENCY_NS: u64 = 3_000_000_000;

/// Static per-process configuration handed to the handler subprocess as YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseConfig {
    #[serde(default)]
    pub handler_id: String,
    #[serde(default)]
    pub tmp_dir: PathBuf,
    /// Base url of the room-composite template page
    #[serde(default)]
    pub template_base: String,
    /// Default signaling url when the request does not carry one
    #[serde(default)]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Scratch directory for files pending upload
    #[serde(default)]
    pub local_output_dir: PathBuf,
    /// Webhook receiving status updates; empty drops them
    #[serde(default)]
    pub info_url: String,
}

#[derive(Debug, Clone)]
pub struct SourceParams {
    pub source_type: SourceType,
    /// Input buffering in nanoseconds
    pub latency_ns: u64,
    pub token: String,
    pub ws_url: String,
    pub web: WebSourceParams,
    pub sdk: SdkSourceParams,
}

#[derive(Debug, Clone, Default)]
pub struct WebSourceParams {
    pub await_start_signal: bool,
    pub layout: String,
    pub base_url: String,
    pub web_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct SdkSourceParams {
    pub track_id: String,
    pub audio_track_id: String,
    pub video_track_id: String,
    /// Capture source of the joined track, e.g. "camera" or "microphone"
    pub track_source: String,
    /// "audio" or "video"
    pub track_type: String,
}

/// One subscribed track, reported by the realtime-media SDK when the room
/// connection is up. Input to the post-join finalization.
#[derive(Debug, Clone, Default)]
pub struct TrackJoin {
    pub track_id: String,
    pub track_source: String,
    pub track_type: String,
    pub audio_codec: Option<AudioCodec>,
    pub video_codec: Option<VideoCodec>,
}

#[derive(Debug, Clone)]
pub struct AudioParams {
    pub enabled: bool,
    pub transcoding: bool,
    pub codec: Option<AudioCodec>,
    /// kbps
    pub bitrate: i32,
    pub frequency: i32,
}

#[derive(Debug, Clone)]
pub struct VideoParams {
    pub enabled: bool,
    pub transcoding: bool,
    pub codec: Option<VideoCodec>,
    pub profile: VideoProfile,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
    pub framerate: i32,
    /// kbps
    pub bitrate: i32,
    /// seconds between keyframes; 0 lets the encoder choose
    pub key_frame_interval: f64,
}

#[derive(Debug, Clone)]
pub enum OutputConfig {
    File(FileConfig),
    Stream(StreamConfig),
    Segments(SegmentConfig),
    Websocket(WebsocketConfig),
}

impl OutputConfig {
    pub fn output_type(&self) -> OutputType {
        match self {
            OutputConfig::File(f) => f.output_type,
            OutputConfig::Stream(s) => s.output_type,
            OutputConfig::Segments(s) => s.output_type,
            OutputConfig::Websocket(_) => OutputType::Raw,
        }
    }
}

/// Per-job realization of a request. Built once at handler start, mutated
/// only during validation and, for track egress, once after the SDK reports
/// the joined track codecs. Read-only everywhere else.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base: BaseConfig,
    pub info: EgressInfo,
    pub source: SourceParams,
    pub audio: AudioParams,
    pub video: VideoParams,
    pub outputs: BTreeMap<EgressType, OutputConfig>,
}

impl PipelineConfig {
    pub fn from_request(base: BaseConfig, request: &StartEgressRequest) -> Result<Self> {
        if request.egress_id.is_empty() {
            return Err(EgressError::invalid_input("egress_id"));
        }

        let redacted = request.redacted();
        let mut p = PipelineConfig {
            base,
            info: EgressInfo::new(
                request.egress_id.clone(),
                request.room_id.clone(),
                redacted.request,
            ),
            source: SourceParams {
                source_type: SourceType::Web,
                latency_ns: WEB_LATENCY_NS,
                token: String::new(),
                ws_url: String::new(),
                web: WebSourceParams::default(),
                sdk: SdkSourceParams::default(),
            },
            audio: AudioParams {
                enabled: false,
                transcoding: false,
                codec: None,
                bitrate: 128,
                frequency: 44100,
            },
            video: VideoParams {
                enabled: false,
                transcoding: false,
                codec: None,
                profile: VideoProfile::Main,
                width: 1920,
                height: 1080,
                depth: 24,
                framerate: 30,
                bitrate: 4500,
                key_frame_interval: 0.0,
            },
            outputs: BTreeMap::new(),
        };

        let mut connection_info_required = true;
        match &request.request {
            EgressRequest::RoomComposite(req) => {
                p.source.source_type = SourceType::Web;
                p.source.latency_ns = WEB_LATENCY_NS;
                p.source.web.await_start_signal = true;
                p.source.web.layout = req.layout.clone();
                p.source.web.base_url = if req.custom_base_url.is_empty() {
                    p.base.template_base.clone()
                } else {
                    req.custom_base_url.clone()
                };
                validate_http_url(&p.source.web.base_url, "template base url")?;

                p.info.room_name = req.room_name.clone();
                p.set_composite_tracks(req.audio_only, req.video_only)?;
                p.apply_options(req.options.as_ref())?;
                p.update_encoded_outputs(
                    &req.file_outputs,
                    &req.stream_outputs,
                    &req.segment_outputs,
                )?;
            }
            EgressRequest::Web(req) => {
                connection_info_required = false;
                p.source.source_type = SourceType::Web;
                p.source.latency_ns = WEB_LATENCY_NS;
                p.source.web.await_start_signal = req.await_start_signal;
                p.source.web.web_url = req.url.clone();
                validate_http_url(&req.url, "web url")?;

                p.set_composite_tracks(req.audio_only, req.video_only)?;
                p.apply_options(req.options.as_ref())?;
                p.update_encoded_outputs(
                    &req.file_outputs,
                    &req.stream_outputs,
                    &req.segment_outputs,
                )?;
            }
            EgressRequest::TrackComposite(req) => {
                p.source.source_type = SourceType::Sdk;
                p.source.latency_ns = SDK_LATENCY_NS;
                p.info.room_name = req.room_name.clone();

                if !req.audio_track_id.is_empty() {
                    p.audio.enabled = true;
                    p.audio.transcoding = true;
                    p.source.sdk.audio_track_id = req.audio_track_id.clone();
                }
                if !req.video_track_id.is_empty() {
                    p.video.enabled = true;
                    p.video.transcoding = true;
                    p.source.sdk.video_track_id = req.video_track_id.clone();
                }
                if !p.audio.enabled && !p.video.enabled {
                    return Err(EgressError::invalid_input(
                        "audio_track_id or video_track_id",
                    ));
                }

                p.apply_options(req.options.as_ref())?;
                p.update_encoded_outputs(
                    &req.file_outputs,
                    &req.stream_outputs,
                    &req.segment_outputs,
                )?;
            }
            EgressRequest::Track(req) => {
                p.source.source_type = SourceType::Sdk;
                p.source.latency_ns = SDK_LATENCY_NS;
                p.info.room_name = req.room_name.clone();

                if req.track_id.is_empty() {
                    return Err(EgressError::invalid_input("track_id"));
                }
                p.source.sdk.track_id = req.track_id.clone();

                match &req.output {
                    TrackOutput::File(f) => {
                        let conf = p.direct_file_config(f)?;
                        p.outputs.insert(EgressType::File, OutputConfig::File(conf));
                    }
                    TrackOutput::WebsocketUrl(url) => {
                        let conf = WebsocketConfig::new(url)?;
                        p.audio.enabled = true;
                        p.audio.codec = Some(AudioCodec::RawAudio);
                        p.outputs
                            .insert(EgressType::Websocket, OutputConfig::Websocket(conf));
                    }
                }
            }
        }

        if connection_info_required {
            if p.info.room_name.is_empty() {
                return Err(EgressError::invalid_input("room_name"));
            }
            if !request.token.is_empty() {
                p.source.token = request.token.clone();
            } else if p.base.api_key.is_empty() || p.base.api_secret.is_empty() {
                return Err(EgressError::invalid_input("token or api key/secret"));
            }
            if !request.ws_url.is_empty() {
                p.source.ws_url = request.ws_url.clone();
            } else if p.base.ws_url.is_empty() {
                return Err(EgressError::invalid_input("ws_url"));
            } else {
                p.source.ws_url = p.base.ws_url.clone();
            }
        }

        // Track egress resolves its output format after join, when the SDK
        // has reported the actual track codec
        if p.source.sdk.track_id.is_empty() {
            p.validate_and_update_output_params()?;
        }

        Ok(p)
    }

    fn set_composite_tracks(&mut self, audio_only: bool, video_only: bool) -> Result<()> {
        if !video_only {
            self.audio.enabled = true;
            self.audio.transcoding = true;
        }
        if !audio_only {
            self.video.enabled = true;
            self.video.transcoding = true;
        }
        if !self.audio.enabled && !self.video.enabled {
            return Err(EgressError::invalid_input("audio_only and video_only"));
        }
        Ok(())
    }

    fn apply_options(&mut self, options: Option<&EncodingOptions>) -> Result<()> {
        match options {
            Some(EncodingOptions::Preset(preset)) => {
                self.apply_preset(*preset);
                Ok(())
            }
            Some(EncodingOptions::Advanced(advanced)) => self.apply_advanced(advanced),
            None => Ok(()),
        }
    }

    fn apply_preset(&mut self, preset: EncodingOptionsPreset) {
        let (width, height, framerate, bitrate) = match preset {
            EncodingOptionsPreset::H264720p30 => (1280, 720, 30, 3000),
            EncodingOptionsPreset::H264720p60 => (1280, 720, 60, 4500),
            EncodingOptionsPreset::H2641080p30 => (1920, 1080, 30, 4500),
            EncodingOptionsPreset::H2641080p60 => (1920, 1080, 60, 6000),
        };
        self.video.codec = Some(VideoCodec::H264);
        self.video.width = width;
        self.video.height = height;
        self.video.framerate = framerate;
        self.video.bitrate = bitrate;
        self.audio.bitrate = 128;
        self.audio.frequency = 44100;
    }

    fn apply_advanced(&mut self, advanced: &AdvancedEncodingOptions) -> Result<()> {
        if let Some(w) = advanced.width {
            if w <= 0 {
                return Err(EgressError::invalid_input("width"));
            }
            self.video.width = w;
        }
        if let Some(h) = advanced.height {
            if h <= 0 {
                return Err(EgressError::invalid_input("height"));
            }
            self.video.height = h;
        }
        if let Some(d) = advanced.depth {
            self.video.depth = d;
        }
        if let Some(f) = advanced.framerate {
            if f <= 0 {
                return Err(EgressError::invalid_input("framerate"));
            }
            self.video.framerate = f;
        }
        if let Some(c) = advanced.audio_codec {
            self.audio.codec = Some(c);
        }
        if let Some(b) = advanced.audio_bitrate {
            self.audio.bitrate = b;
        }
        if let Some(f) = advanced.audio_frequency {
            self.audio.frequency = f;
        }
        if let Some(c) = advanced.video_codec {
            self.video.codec = Some(c);
        }
        if let Some(b) = advanced.video_bitrate {
            self.video.bitrate = b;
        }
        if let Some(k) = advanced.key_frame_interval {
            self.video.key_frame_interval = k;
        }
        if let Some(p) = advanced.profile {
            self.video.profile = p;
        }
        Ok(())
    }

    fn update_encoded_outputs(
        &mut self,
        files: &[EncodedFileOutput],
        streams: &[StreamOutput],
        segments: &[SegmentedFileOutput],
    ) -> Result<()> {
        if files.len() > 1 {
            return Err(EgressError::invalid_input("multiple file outputs"));
        }
        if streams.len() > 1 {
            return Err(EgressError::invalid_input("multiple stream outputs"));
        }
        if segments.len() > 1 {
            return Err(EgressError::invalid_input("multiple segment outputs"));
        }

        if let Some(file) = files.first() {
            let conf = self.encoded_file_config(file)?;
            self.outputs.insert(EgressType::File, OutputConfig::File(conf));
        }
        if let Some(stream) = streams.first() {
            let conf = self.stream_config(stream)?;
            self.outputs
                .insert(EgressType::Stream, OutputConfig::Stream(conf));
        }
        if let Some(segment) = segments.first() {
            let conf = self.segment_config(segment)?;
            self.outputs
                .insert(EgressType::Segments, OutputConfig::Segments(conf));
        }

        if self.outputs.is_empty() {
            return Err(EgressError::invalid_input("output"));
        }
        Ok(())
    }

    fn stream_config(&mut self, output: &StreamOutput) -> Result<StreamConfig> {
        let output_type = match output.protocol {
            StreamProtocol::Rtmp => {
                self.audio.codec = Some(AudioCodec::Aac);
                self.video.codec = Some(VideoCodec::H264);
                OutputType::Rtmp
            }
            StreamProtocol::RawWebsocket => {
                self.audio.codec = Some(AudioCodec::RawAudio);
                OutputType::Raw
            }
        };

        // streaming wants regular keyframes for url joins mid-stream
        if self.video.key_frame_interval == 0.0 {
            self.video.key_frame_interval = 4.0;
        }

        let conf = StreamConfig::new(output_type, &output.urls)?;
        for url in &conf.urls {
            let redacted = validate_stream_url(url, output_type)?;
            self.info.streams.push(crate::info::StreamResult {
                url: redacted,
                state: crate::info::StreamState::Active,
                started_at: 0,
                ended_at: 0,
            });
        }
        Ok(conf)
    }

    /// Identifier and replacement map for filename templating.
    pub fn filename_info(&self) -> (String, HashMap<String, String>) {
        let now = Local::now();
        let time = now.format("%Y-%m-%dT%H%M%S").to_string();
        let utc = now.format("%Y%m%d%H%M%S%3f").to_string();

        if !self.info.room_name.is_empty() {
            let mut replacements = HashMap::new();
            replacements.insert("{room_name}".to_string(), self.info.room_name.clone());
            replacements.insert("{room_id}".to_string(), self.info.room_id.clone());
            replacements.insert("{time}".to_string(), time);
            replacements.insert("{utc}".to_string(), utc);
            (self.info.room_name.clone(), replacements)
        } else {
            let mut replacements = HashMap::new();
            replacements.insert("{time}".to_string(), time);
            replacements.insert("{utc}".to_string(), utc);
            ("web".to_string(), replacements)
        }
    }

    /// The single post-join mutation for SDK-sourced jobs: record the joined
    /// track identity, re-run filename templating with the track tokens, and
    /// resolve outputs against the codecs the SDK actually delivered.
    pub fn apply_track_join(&mut self, tracks: &[TrackJoin]) -> Result<()> {
        debug_assert_eq!(self.source.source_type, SourceType::Sdk);

        let mut audio_codec = None;
        let mut video_codec = None;
        for track in tracks {
            audio_codec = audio_codec.or(track.audio_codec);
            video_codec = video_codec.or(track.video_codec);
        }

        let (identifier, mut replacements) = self.filename_info();
        if !self.source.sdk.track_id.is_empty() {
            let track = tracks
                .iter()
                .find(|t| t.track_id == self.source.sdk.track_id)
                .ok_or_else(|| {
                    EgressError::invalid_input(format!(
                        "track {} was not subscribed",
                        self.source.sdk.track_id
                    ))
                })?;
            self.source.sdk.track_source = track.track_source.clone();
            self.source.sdk.track_type = track.track_type.clone();

            replacements.insert("{track_id}".to_string(), track.track_id.clone());
            replacements.insert("{track_source}".to_string(), track.track_source.clone());
            replacements.insert("{track_type}".to_string(), track.track_type.clone());
        }
        self.update_info_from_sdk(&identifier, &replacements)?;

        self.on_track_codecs(audio_codec, video_codec)
    }

    /// Re-run templating once track details are known.
    fn update_info_from_sdk(
        &mut self,
        identifier: &str,
        replacements: &HashMap<String, String>,
    ) -> Result<()> {
        let base = self.base.clone();
        let egress_id = self.info.egress_id.clone();
        for (egress_type, output) in self.outputs.iter_mut() {
            match (egress_type, output) {
                (EgressType::File, OutputConfig::File(f)) => {
                    f.update_filepath(&base, &egress_id, identifier, replacements)?;
                }
                (EgressType::Segments, OutputConfig::Segments(s)) => {
                    s.local_dir =
                        PathBuf::from(string_replace(&s.local_dir.to_string_lossy(), replacements));
                    s.storage_dir = string_replace(&s.storage_dir, replacements);
                    s.playlist_filename = string_replace(&s.playlist_filename, replacements);
                    s.segment_prefix = string_replace(&s.segment_prefix, replacements);
                }
                _ => {}
            }
        }
        if let Some(segments) = &mut self.info.segments {
            segments.playlist_name = string_replace(&segments.playlist_name, replacements);
        }
        Ok(())
    }

    /// Pin the codecs the SDK delivered, then resolve outputs against them.
    fn on_track_codecs(
        &mut self,
        audio: Option<AudioCodec>,
        video: Option<VideoCodec>,
    ) -> Result<()> {
        if let Some(codec) = audio {
            self.audio.enabled = true;
            if self.audio.codec.is_none() {
                self.audio.codec = Some(codec);
            }
        }
        if let Some(codec) = video {
            self.video.enabled = true;
            if self.video.codec.is_none() {
                self.video.codec = Some(codec);
            }
        }
        if !self.audio.enabled && !self.video.enabled {
            return Err(EgressError::invalid_input("track"));
        }
        self.validate_and_update_output_params()
    }

    /// Codec and output-type resolution across all outputs.
    pub fn validate_and_update_output_params(&mut self) -> Result<()> {
        let (compatible_audio, compatible_video) = self.compatible_codec_sets()?;

        self.update_unknown_file_type(&compatible_audio, &compatible_video)?;

        if self.audio.enabled {
            self.audio.codec = self
                .outputs
                .values()
                .filter_map(|o| default_audio_codec(o.output_type()))
                .find(|c| compatible_audio.contains(c))
                .or_else(|| compatible_audio.first().copied());
        }
        if self.video.enabled {
            self.video.codec = self
                .outputs
                .values()
                .filter_map(|o| default_video_codec(o.output_type()))
                .find(|c| compatible_video.contains(c))
                .or_else(|| compatible_video.first().copied());
        }
        Ok(())
    }

    fn compatible_codec_sets(&self) -> Result<(Vec<AudioCodec>, Vec<VideoCodec>)> {
        let mut audio: Vec<AudioCodec> = if self.audio.enabled {
            match self.audio.codec {
                Some(c) => vec![c],
                None => ALL_OUTPUT_AUDIO_CODECS.to_vec(),
            }
        } else {
            Vec::new()
        };
        let mut video: Vec<VideoCodec> = if self.video.enabled {
            match self.video.codec {
                Some(c) => vec![c],
                None => ALL_OUTPUT_VIDEO_CODECS.to_vec(),
            }
        } else {
            Vec::new()
        };

        for output in self.outputs.values() {
            let output_type = output.output_type();
            if self.audio.enabled {
                let compat = compatible_audio_codecs(output_type);
                audio.retain(|c| compat.contains(c));
                if audio.is_empty() {
                    return Err(match self.audio.codec {
                        Some(c) => EgressError::Incompatible {
                            output: output_type,
                            codec: c.to_string(),
                        },
                        None => EgressError::NoCompatibleCodec,
                    });
                }
            }
            if self.video.enabled {
                // raw and ogg outputs carry no video at all
                let compat = compatible_video_codecs(output_type);
                if compat.is_empty() {
                    continue;
                }
                video.retain(|c| compat.contains(c));
                if video.is_empty() {
                    return Err(match self.video.codec {
                        Some(c) => EgressError::Incompatible {
                            output: output_type,
                            codec: c.to_string(),
                        },
                        None => EgressError::NoCompatibleCodec,
                    });
                }
            }
        }
        Ok((audio, video))
    }

    fn update_unknown_file_type(
        &mut self,
        compatible_audio: &[AudioCodec],
        compatible_video: &[VideoCodec],
    ) -> Result<()> {
        let needs_type = matches!(
            self.outputs.get(&EgressType::File),
            Some(OutputConfig::File(f)) if f.output_type == OutputType::UnknownFile
        );
        if !needs_type {
            return Ok(());
        }

        let resolved = if !self.video.enabled {
            file_type_compatible_with(AUDIO_ONLY_FILE_OUTPUT_TYPES, Some(compatible_audio), None)
        } else if !self.audio.enabled {
            file_type_compatible_with(VIDEO_ONLY_FILE_OUTPUT_TYPES, None, Some(compatible_video))
        } else {
            file_type_compatible_with(
                AUDIO_VIDEO_FILE_OUTPUT_TYPES,
                Some(compatible_audio),
                Some(compatible_video),
            )
        }
        .ok_or(EgressError::NoCompatibleFileOutputType)?;

        let (identifier, replacements) = self.filename_info();
        let base = self.base.clone();
        let egress_id = self.info.egress_id.clone();
        if let Some(OutputConfig::File(f)) = self.outputs.get_mut(&EgressType::File) {
            f.output_type = resolved;
            f.update_filepath(&base, &egress_id, &identifier, &replacements)?;
        }
        Ok(())
    }

    pub fn file_config(&self) -> Option<&FileConfig> {
        match self.outputs.get(&EgressType::File) {
            Some(OutputConfig::File(f)) => Some(f),
            _ => None,
        }
    }

    pub fn stream_output(&self) -> Option<&StreamConfig> {
        match self.outputs.get(&EgressType::Stream) {
            Some(OutputConfig::Stream(s)) => Some(s),
            _ => None,
        }
    }

    pub fn segment_output(&self) -> Option<&SegmentConfig> {
        match self.outputs.get(&EgressType::Segments) {
            Some(OutputConfig::Segments(s)) => Some(s),
            _ => None,
        }
    }

    /// Mark the job start used for duration accounting.
    pub fn mark_started(&mut self) {
        if self.info.started_at == 0 {
            self.info.started_at = unix_nanos_now();
        }
    }
}

fn validate_http_url(raw: &str, field: &'static str) -> Result<()> {
    match url::Url::parse(raw) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
        _ => Err(EgressError::invalid_input(field)),
    }
}

#[cfg(test)]
mod tests;
