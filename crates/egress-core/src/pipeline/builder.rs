use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use crate::config::{OutputConfig, PipelineConfig};
use crate::errors::{EgressError, Result};
use crate::source::{sdk, SdkSource, Source, WebSource};
use crate::types::{AudioCodec, EgressType, OutputType, SourceType, VideoCodec, VideoProfile};

pub const PIPELINE_NAME: &str = "pipeline";

/// The instantiated media graph plus the attachment points the controller
/// and sinks bind to.
pub struct BuiltPipeline {
    pub pipeline: gst::Pipeline,
    pub source: Source,
    /// Encoded (or raw, for websocket egress) audio fan-out
    pub audio_tee: Option<gst::Element>,
    /// Encoded video fan-out
    pub video_tee: Option<gst::Element>,
    /// Split-muxer of the segment output
    pub splitmux: Option<gst::Element>,
    /// Muxed flv fan-out feeding the per-url stream branches
    pub stream_tee: Option<gst::Element>,
    /// Raw audio tap of a websocket egress
    pub ws_appsink: Option<gst_app::AppSink>,
}

pub fn build(conf: &PipelineConfig) -> Result<BuiltPipeline> {
    // track egress resolves its codecs post-join via apply_track_join; a
    // config with no enabled media cannot produce a graph
    if !conf.audio.enabled && !conf.video.enabled {
        return Err(EgressError::invalid_input("no enabled tracks"));
    }

    gst::init()?;
    let pipeline = gst::Pipeline::with_name(PIPELINE_NAME);

    let (source, audio_in, video_in) = build_source(conf, &pipeline)?;

    let audio_tee = match (conf.audio.enabled, audio_in) {
        (true, Some(input)) => Some(build_audio_chain(conf, &pipeline, &input)?),
        _ => None,
    };
    let video_tee = match (conf.video.enabled, video_in) {
        (true, Some(input)) => Some(build_video_chain(conf, &pipeline, &input)?),
        _ => None,
    };

    let mut built = BuiltPipeline {
        pipeline,
        source,
        audio_tee,
        video_tee,
        splitmux: None,
        stream_tee: None,
        ws_appsink: None,
    };

    for (egress_type, output) in &conf.outputs {
        match (egress_type, output) {
            (EgressType::File, OutputConfig::File(f)) => {
                build_file_output(&mut built, f.output_type, &f.local_filepath)?;
            }
            (EgressType::Stream, OutputConfig::Stream(_)) => {
                build_stream_output(&mut built)?;
            }
            (EgressType::Segments, OutputConfig::Segments(s)) => {
                build_segment_output(&mut built, s.segment_duration)?;
            }
            (EgressType::Websocket, OutputConfig::Websocket(_)) => {
                build_websocket_output(&mut built)?;
            }
            _ => return Err(EgressError::Internal("mismatched output config".to_string())),
        }
    }

    Ok(built)
}

fn build_source(
    conf: &PipelineConfig,
    pipeline: &gst::Pipeline,
) -> Result<(Source, Option<gst::Element>, Option<gst::Element>)> {
    match conf.source.source_type {
        SourceType::Web => {
            let source = WebSource::new(conf)?;
            let audio = if conf.audio.enabled {
                let src = gst::ElementFactory::make("pulsesrc").build()?;
                pipeline.add(&src)?;
                Some(src)
            } else {
                None
            };
            let video = if conf.video.enabled {
                let src = gst::ElementFactory::make("ximagesrc")
                    .property("use-damage", false)
                    .property("show-pointer", false)
                    .build()?;
                pipeline.add(&src)?;
                Some(src)
            } else {
                None
            };
            Ok((Source::Web(source), audio, video))
        }
        SourceType::Sdk => {
            let latency = gst::ClockTime::from_nseconds(conf.source.latency_ns);
            let audio = if conf.audio.enabled {
                let caps = gst::Caps::builder("audio/x-raw")
                    .field("format", "S16LE")
                    .field("rate", 48_000i32)
                    .field("channels", 2i32)
                    .field("layout", "interleaved")
                    .build();
                let src = gst_app::AppSrc::builder()
                    .name(sdk::AUDIO_APP_SOURCE)
                    .caps(&caps)
                    .format(gst::Format::Time)
                    .is_live(true)
                    .build();
                src.set_latency(gst::ClockTime::ZERO, latency);
                pipeline.add(&src)?;
                Some(src)
            } else {
                None
            };
            let video = if conf.video.enabled {
                let caps = gst::Caps::builder("video/x-raw")
                    .field("format", "I420")
                    .field("width", conf.video.width)
                    .field("height", conf.video.height)
                    .field("framerate", gst::Fraction::new(conf.video.framerate, 1))
                    .build();
                let src = gst_app::AppSrc::builder()
                    .name(sdk::VIDEO_APP_SOURCE)
                    .caps(&caps)
                    .format(gst::Format::Time)
                    .is_live(true)
                    .build();
                src.set_latency(gst::ClockTime::ZERO, latency);
                pipeline.add(&src)?;
                Some(src)
            } else {
                None
            };

            let audio_el = audio.as_ref().map(|s| s.clone().upcast::<gst::Element>());
            let video_el = video.as_ref().map(|s| s.clone().upcast::<gst::Element>());
            Ok((Source::Sdk(SdkSource::new(audio, video)), audio_el, video_el))
        }
    }
}

fn build_audio_chain(
    conf: &PipelineConfig,
    pipeline: &gst::Pipeline,
    input: &gst::Element,
) -> Result<gst::Element> {
    let queue = input_queue(conf.source.latency_ns)?;
    let convert = gst::ElementFactory::make("audioconvert").build()?;
    let resample = gst::ElementFactory::make("audioresample").build()?;

    let mut elements = vec![queue, convert, resample];

    match conf.audio.codec {
        Some(AudioCodec::Aac) => {
            elements.push(audio_capsfilter("F32LE", conf.audio.frequency)?);
            let enc = gst::ElementFactory::make("avenc_aac")
                .property("bitrate", conf.audio.bitrate * 1000)
                .build()?;
            elements.push(enc);
            let parse = gst::ElementFactory::make("aacparse").build()?;
            elements.push(parse);
        }
        Some(AudioCodec::Opus) => {
            elements.push(audio_capsfilter("S16LE", conf.audio.frequency)?);
            let enc = gst::ElementFactory::make("opusenc")
                .property("bitrate", conf.audio.bitrate * 1000)
                .build()?;
            elements.push(enc);
        }
        // websocket egress forwards signed 16-bit stereo untouched
        Some(AudioCodec::RawAudio) | None => {
            elements.push(audio_capsfilter("S16LE", 48_000)?);
        }
    }

    let tee = gst::ElementFactory::make("tee")
        .name("audio_tee")
        .property("allow-not-linked", true)
        .build()?;
    elements.push(tee.clone());

    pipeline.add_many(&elements)?;
    input.link(&elements[0])?;
    gst::Element::link_many(&elements)?;
    Ok(tee)
}

fn build_video_chain(
    conf: &PipelineConfig,
    pipeline: &gst::Pipeline,
    input: &gst::Element,
) -> Result<gst::Element> {
    let queue = input_queue(conf.source.latency_ns)?;
    let convert = gst::ElementFactory::make("videoconvert").build()?;
    let scale = gst::ElementFactory::make("videoscale").build()?;
    let rate = gst::ElementFactory::make("videorate").build()?;
    let caps = gst::Caps::builder("video/x-raw")
        .field("format", "I420")
        .field("width", conf.video.width)
        .field("height", conf.video.height)
        .field("framerate", gst::Fraction::new(conf.video.framerate, 1))
        .build();
    let capsfilter = gst::ElementFactory::make("capsfilter")
        .property("caps", &caps)
        .build()?;

    let mut elements = vec![queue, convert, scale, rate, capsfilter];

    match conf.video.codec {
        Some(VideoCodec::H264) | None => {
            let keyint = (conf.video.framerate as f64
                * if conf.video.key_frame_interval > 0.0 {
                    conf.video.key_frame_interval
                } else {
                    2.0
                })
            .round() as u32;
            let enc = gst::ElementFactory::make("x264enc")
                .property("bitrate", conf.video.bitrate as u32)
                .property("key-int-max", keyint)
                .property("byte-stream", false)
                .property_from_str("speed-preset", "veryfast")
                .property_from_str("tune", "zerolatency")
                .build()?;
            elements.push(enc);

            let profile = match conf.video.profile {
                VideoProfile::Baseline => "constrained-baseline",
                VideoProfile::Main => "main",
                VideoProfile::High => "high",
            };
            let h264_caps = gst::Caps::builder("video/x-h264")
                .field("profile", profile)
                .build();
            let profile_filter = gst::ElementFactory::make("capsfilter")
                .property("caps", &h264_caps)
                .build()?;
            elements.push(profile_filter);
            elements.push(gst::ElementFactory::make("h264parse").build()?);
        }
        Some(VideoCodec::Vp8) => {
            let enc = gst::ElementFactory::make("vp8enc")
                .property("target-bitrate", conf.video.bitrate * 1000)
                .property("deadline", 1i64)
                .build()?;
            elements.push(enc);
        }
        Some(VideoCodec::Vp9) => {
            let enc = gst::ElementFactory::make("vp9enc")
                .property("target-bitrate", conf.video.bitrate * 1000)
                .property("deadline", 1i64)
                .build()?;
            elements.push(enc);
        }
    }

    let tee = gst::ElementFactory::make("tee")
        .name("video_tee")
        .property("allow-not-linked", true)
        .build()?;
    elements.push(tee.clone());

    pipeline.add_many(&elements)?;
    input.link(&elements[0])?;
    gst::Element::link_many(&elements)?;
    Ok(tee)
}

fn build_file_output(
    built: &mut BuiltPipeline,
    output_type: OutputType,
    local_filepath: &std::path::Path,
) -> Result<()> {
    let mux = match output_type {
        OutputType::Mp4 => gst::ElementFactory::make("mp4mux")
            .property("faststart", true)
            .build()?,
        OutputType::Ogg => gst::ElementFactory::make("oggmux").build()?,
        OutputType::WebM => gst::ElementFactory::make("webmmux").build()?,
        other => {
            return Err(EgressError::Internal(format!(
                "no file muxer for {other}"
            )))
        }
    };
    let filesink = gst::ElementFactory::make("filesink")
        .property("location", local_filepath.to_string_lossy().as_ref())
        .property("sync", false)
        .build()?;

    built.pipeline.add_many([&mux, &filesink])?;
    mux.link(&filesink)?;
    link_tees_to_mux(built, &mux)?;
    Ok(())
}

fn build_stream_output(built: &mut BuiltPipeline) -> Result<()> {
    let mux = gst::ElementFactory::make("flvmux")
        .name("stream_mux")
        .property("streamable", true)
        .build()?;
    let tee = gst::ElementFactory::make("tee")
        .name("stream_tee")
        .property("allow-not-linked", true)
        .build()?;

    built.pipeline.add_many([&mux, &tee])?;
    mux.link(&tee)?;
    link_tees_to_mux(built, &mux)?;
    built.stream_tee = Some(tee);
    Ok(())
}

fn build_segment_output(built: &mut BuiltPipeline, segment_duration: u32) -> Result<()> {
    let splitmux = gst::ElementFactory::make("splitmuxsink")
        .name("splitmuxsink")
        .property("max-size-time", segment_duration as u64 * 1_000_000_000)
        .property("send-keyframe-requests", true)
        .property("muxer-factory", "mpegtsmux")
        .build()?;
    built.pipeline.add(&splitmux)?;

    if let Some(video_tee) = &built.video_tee {
        let queue = output_queue()?;
        built.pipeline.add(&queue)?;
        link_tee_to(video_tee, &queue)?;
        let pad = splitmux
            .request_pad_simple("video")
            .ok_or_else(|| EgressError::Pipeline("splitmuxsink has no video pad".to_string()))?;
        link_static_to(&queue, &pad)?;
    }
    if let Some(audio_tee) = &built.audio_tee {
        let queue = output_queue()?;
        built.pipeline.add(&queue)?;
        link_tee_to(audio_tee, &queue)?;
        let pad = splitmux
            .request_pad_simple("audio_%u")
            .ok_or_else(|| EgressError::Pipeline("splitmuxsink has no audio pad".to_string()))?;
        link_static_to(&queue, &pad)?;
    }

    built.splitmux = Some(splitmux);
    Ok(())
}

fn build_websocket_output(built: &mut BuiltPipeline) -> Result<()> {
    let audio_tee = built
        .audio_tee
        .as_ref()
        .ok_or_else(|| EgressError::Internal("websocket egress without audio".to_string()))?
        .clone();

    let queue = output_queue()?;
    let appsink = gst::ElementFactory::make("appsink")
        .name("websocket_sink")
        .property("sync", false)
        .build()?;
    built.pipeline.add_many([&queue, &appsink])?;
    link_tee_to(&audio_tee, &queue)?;
    queue.link(&appsink)?;

    built.ws_appsink = Some(
        appsink
            .downcast::<gst_app::AppSink>()
            .map_err(|_| EgressError::Pipeline("appsink downcast failed".to_string()))?,
    );
    Ok(())
}

/// Hook both media tees into a muxer, requesting whichever pad template the
/// muxer exposes for the media type.
fn link_tees_to_mux(built: &BuiltPipeline, mux: &gst::Element) -> Result<()> {
    if let Some(audio_tee) = &built.audio_tee {
        let queue = output_queue()?;
        built.pipeline.add(&queue)?;
        link_tee_to(audio_tee, &queue)?;
        let pad = request_mux_pad(mux, "audio")?;
        link_static_to(&queue, &pad)?;
    }
    if let Some(video_tee) = &built.video_tee {
        let queue = output_queue()?;
        built.pipeline.add(&queue)?;
        link_tee_to(video_tee, &queue)?;
        let pad = request_mux_pad(mux, "video")?;
        link_static_to(&queue, &pad)?;
    }
    Ok(())
}

fn request_mux_pad(mux: &gst::Element, media: &str) -> Result<gst::Pad> {
    for template in [format!("{media}_%u"), media.to_string(), "sink_%u".to_string()] {
        if let Some(pad) = mux.request_pad_simple(&template) {
            return Ok(pad);
        }
    }
    Err(EgressError::Pipeline(format!(
        "muxer {} exposes no {media} pad",
        mux.name()
    )))
}

fn link_tee_to(tee: &gst::Element, downstream: &gst::Element) -> Result<()> {
    let tee_pad = tee
        .request_pad_simple("src_%u")
        .ok_or_else(|| EgressError::Pipeline("no tee pad available".to_string()))?;
    let sink_pad = downstream
        .static_pad("sink")
        .ok_or_else(|| EgressError::Pipeline("downstream has no sink pad".to_string()))?;
    tee_pad
        .link(&sink_pad)
        .map_err(|e| EgressError::Pipeline(format!("tee link failed: {e:?}")))?;
    Ok(())
}

fn link_static_to(upstream: &gst::Element, pad: &gst::Pad) -> Result<()> {
    let src_pad = upstream
        .static_pad("src")
        .ok_or_else(|| EgressError::Pipeline("upstream has no src pad".to_string()))?;
    src_pad
        .link(pad)
        .map_err(|e| EgressError::Pipeline(format!("pad link failed: {e:?}")))?;
    Ok(())
}

fn audio_capsfilter(format: &str, rate: i32) -> Result<gst::Element> {
    let caps = gst::Caps::builder("audio/x-raw")
        .field("format", format)
        .field("rate", rate)
        .field("channels", 2i32)
        .build();
    Ok(gst::ElementFactory::make("capsfilter")
        .property("caps", &caps)
        .build()?)
}

fn input_queue(latency_ns: u64) -> Result<gst::Element> {
    Ok(gst::ElementFactory::make("queue")
        .property("max-size-time", latency_ns)
        .property("max-size-buffers", 0u32)
        .property("max-size-bytes", 0u32)
        .build()?)
}

fn output_queue() -> Result<gst::Element> {
    Ok(gst::ElementFactory::make("queue").build()?)
}
