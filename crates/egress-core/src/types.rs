use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Output categories an egress can fan out to. Ordering matters: outputs are
/// stored in a BTreeMap keyed by this enum, so iteration is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressType {
    File,
    Stream,
    Websocket,
    Segments,
}

impl Display for EgressType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EgressType::File => write!(f, "file"),
            EgressType::Stream => write!(f, "stream"),
            EgressType::Websocket => write!(f, "websocket"),
            EgressType::Segments => write!(f, "segments"),
        }
    }
}

/// Container or protocol an output is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Mp4,
    Ogg,
    WebM,
    Rtmp,
    /// Raw PCM frames over a websocket
    Raw,
    Hls,
    /// File output whose container is resolved from the codec intersection
    UnknownFile,
}

impl OutputType {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputType::Mp4 => ".mp4",
            OutputType::Ogg => ".ogg",
            OutputType::WebM => ".webm",
            OutputType::Hls => ".m3u8",
            OutputType::Rtmp | OutputType::Raw | OutputType::UnknownFile => "",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            OutputType::Mp4 => "video/mp4",
            OutputType::Ogg => "audio/ogg",
            OutputType::WebM => "video/webm",
            OutputType::Hls => "application/x-mpegurl",
            OutputType::Rtmp => "video/x-flv",
            OutputType::Raw | OutputType::UnknownFile => "application/octet-stream",
        }
    }
}

impl Display for OutputType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputType::Mp4 => write!(f, "mp4"),
            OutputType::Ogg => write!(f, "ogg"),
            OutputType::WebM => write!(f, "webm"),
            OutputType::Rtmp => write!(f, "rtmp"),
            OutputType::Raw => write!(f, "raw"),
            OutputType::Hls => write!(f, "hls"),
            OutputType::UnknownFile => write!(f, "unknown file"),
        }
    }
}

/// File extensions recognized when fixing up a user-supplied filepath
pub const KNOWN_EXTENSIONS: &[&str] = &[".mp4", ".ogg", ".webm", ".ts", ".m3u8"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Opus,
    RawAudio,
}

impl Display for AudioCodec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioCodec::Aac => write!(f, "aac"),
            AudioCodec::Opus => write!(f, "opus"),
            AudioCodec::RawAudio => write!(f, "raw audio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
}

impl Display for VideoCodec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::Vp8 => write!(f, "vp8"),
            VideoCodec::Vp9 => write!(f, "vp9"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoProfile {
    Baseline,
    Main,
    High,
}

impl Display for VideoProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoProfile::Baseline => write!(f, "baseline"),
            VideoProfile::Main => write!(f, "main"),
            VideoProfile::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Web,
    Sdk,
}

/// All audio codecs an encoder graph can produce
pub const ALL_OUTPUT_AUDIO_CODECS: &[AudioCodec] = &[AudioCodec::Aac, AudioCodec::Opus];

/// All video codecs an encoder graph can produce
pub const ALL_OUTPUT_VIDEO_CODECS: &[VideoCodec] =
    &[VideoCodec::H264, VideoCodec::Vp8, VideoCodec::Vp9];

/// Audio codecs each output type can carry
pub fn compatible_audio_codecs(output: OutputType) -> &'static [AudioCodec] {
    match output {
        OutputType::Mp4 => &[AudioCodec::Aac],
        OutputType::Ogg => &[AudioCodec::Opus],
        OutputType::WebM => &[AudioCodec::Opus],
        OutputType::Rtmp => &[AudioCodec::Aac],
        OutputType::Raw => &[AudioCodec::RawAudio],
        OutputType::Hls => &[AudioCodec::Aac],
        OutputType::UnknownFile => ALL_OUTPUT_AUDIO_CODECS,
    }
}

/// Video codecs each output type can carry
pub fn compatible_video_codecs(output: OutputType) -> &'static [VideoCodec] {
    match output {
        OutputType::Mp4 => &[VideoCodec::H264],
        OutputType::Ogg => &[],
        OutputType::WebM => &[VideoCodec::Vp8, VideoCodec::Vp9],
        OutputType::Rtmp => &[VideoCodec::H264],
        OutputType::Raw => &[],
        OutputType::Hls => &[VideoCodec::H264],
        OutputType::UnknownFile => ALL_OUTPUT_VIDEO_CODECS,
    }
}

pub fn default_audio_codec(output: OutputType) -> Option<AudioCodec> {
    match output {
        OutputType::Mp4 | OutputType::Rtmp | OutputType::Hls => Some(AudioCodec::Aac),
        OutputType::Ogg | OutputType::WebM => Some(AudioCodec::Opus),
        OutputType::Raw => Some(AudioCodec::RawAudio),
        OutputType::UnknownFile => None,
    }
}

pub fn default_video_codec(output: OutputType) -> Option<VideoCodec> {
    match output {
        OutputType::Mp4 | OutputType::Rtmp | OutputType::Hls => Some(VideoCodec::H264),
        OutputType::WebM => Some(VideoCodec::Vp8),
        OutputType::Ogg | OutputType::Raw | OutputType::UnknownFile => None,
    }
}

/// File types usable for an audio-only egress, in preference order
pub const AUDIO_ONLY_FILE_OUTPUT_TYPES: &[OutputType] = &[OutputType::Ogg, OutputType::Mp4];

/// File types usable for a video-only egress, in preference order
pub const VIDEO_ONLY_FILE_OUTPUT_TYPES: &[OutputType] = &[OutputType::Mp4, OutputType::WebM];

/// File types usable for an audio+video egress, in preference order
pub const AUDIO_VIDEO_FILE_OUTPUT_TYPES: &[OutputType] = &[OutputType::Mp4, OutputType::WebM];

/// First file type from `candidates` whose compatibility sets intersect the
/// given codec sets. A `None` set is not constrained.
pub fn file_type_compatible_with(
    candidates: &[OutputType],
    audio: Option<&[AudioCodec]>,
    video: Option<&[VideoCodec]>,
) -> Option<OutputType> {
    candidates.iter().copied().find(|ot| {
        let audio_ok = audio.map_or(true, |set| {
            set.iter().any(|c| compatible_audio_codecs(*ot).contains(c))
        });
        let video_ok = video.map_or(true, |set| {
            set.iter().any(|c| compatible_video_codecs(*ot).contains(c))
        });
        audio_ok && video_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_resolution() {
        // opus-only audio resolves to ogg
        let ot = file_type_compatible_with(
            AUDIO_ONLY_FILE_OUTPUT_TYPES,
            Some(&[AudioCodec::Opus]),
            None,
        );
        assert_eq!(ot, Some(OutputType::Ogg));

        // aac audio resolves to mp4
        let ot = file_type_compatible_with(
            AUDIO_ONLY_FILE_OUTPUT_TYPES,
            Some(&[AudioCodec::Aac]),
            None,
        );
        assert_eq!(ot, Some(OutputType::Mp4));

        // vp8 + opus resolves to webm
        let ot = file_type_compatible_with(
            AUDIO_VIDEO_FILE_OUTPUT_TYPES,
            Some(&[AudioCodec::Opus]),
            Some(&[VideoCodec::Vp8]),
        );
        assert_eq!(ot, Some(OutputType::WebM));

        // raw audio has no file container
        let ot = file_type_compatible_with(
            AUDIO_ONLY_FILE_OUTPUT_TYPES,
            Some(&[AudioCodec::RawAudio]),
            None,
        );
        assert_eq!(ot, None);
    }

    #[test]
    fn test_output_ordering_is_stable() {
        let mut types = vec![
            EgressType::Segments,
            EgressType::File,
            EgressType::Websocket,
            EgressType::Stream,
        ];
        types.sort();
        assert_eq!(
            types,
            vec![
                EgressType::File,
                EgressType::Stream,
                EgressType::Websocket,
                EgressType::Segments,
            ]
        );
    }
}
