use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info};

use crate::config::{SourceParams, TrackJoin};
use crate::errors::{EgressError, Result};
use crate::util::unix_nanos_now;

/// Element names the bus watch matches against for per-track timing events.
pub const AUDIO_APP_SOURCE: &str = "audio_app_src";
pub const VIDEO_APP_SOURCE: &str = "video_app_src";

/// Bus message carrying the wall clock of the first pushed sample, consumed
/// by the segment sink for program-date-time anchoring.
pub const FIRST_SAMPLE_METADATA: &str = "FirstSampleMetadata";
pub const FIRST_SAMPLE_START_DATE: &str = "start-date";

/// Connection surface of the realtime-media SDK. An implementation joins the
/// room with the job's token, subscribes to the named tracks, and reports
/// them; the handler finalizes the pipeline config from that report before
/// the graph is built. Sample delivery happens afterwards through
/// [SdkSource].
#[async_trait]
pub trait SdkClient: Send + Sync {
    async fn join(&self, source: &SourceParams) -> Result<Vec<TrackJoin>>;
}

/// Deployment without an SDK bridge: SDK-sourced jobs fail up front instead
/// of building a pipeline that can never receive samples.
#[derive(Default)]
pub struct NullSdkClient;

#[async_trait]
impl SdkClient for NullSdkClient {
    async fn join(&self, _source: &SourceParams) -> Result<Vec<TrackJoin>> {
        Err(EgressError::NotSupported("realtime sdk client"))
    }
}

/// Per-track feed from the realtime-media SDK. The SDK itself is a
/// collaborator: it subscribes to the named tracks and pushes decoded
/// samples here.
pub struct SdkSource {
    audio_src: Option<gst_app::AppSrc>,
    video_src: Option<gst_app::AppSrc>,
    /// Wall clock of the first frame, anchors the job's `updated_at`
    start_time: Arc<AtomicI64>,
}

impl SdkSource {
    pub fn new(audio_src: Option<gst_app::AppSrc>, video_src: Option<gst_app::AppSrc>) -> Self {
        Self {
            audio_src,
            video_src,
            start_time: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Wall clock (unix nanos) of the first sample, 0 until one arrived.
    pub fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::Acquire)
    }

    pub fn push_audio_sample(&self, data: &[u8], pts_ns: u64) -> Result<()> {
        match &self.audio_src {
            Some(src) => self.push(src, data, pts_ns),
            None => Err(EgressError::NotSupported("audio track")),
        }
    }

    pub fn push_video_sample(&self, data: &[u8], pts_ns: u64) -> Result<()> {
        match &self.video_src {
            Some(src) => self.push(src, data, pts_ns),
            None => Err(EgressError::NotSupported("video track")),
        }
    }

    fn push(&self, src: &gst_app::AppSrc, data: &[u8], pts_ns: u64) -> Result<()> {
        self.mark_first_sample(src);

        let mut buffer = gst::Buffer::with_size(data.len())?;
        {
            let buffer = buffer.get_mut().ok_or_else(|| {
                EgressError::Pipeline("buffer not writable".to_string())
            })?;
            buffer.set_pts(gst::ClockTime::from_nseconds(pts_ns));
            let mut map = buffer.map_writable()?;
            map.copy_from_slice(data);
        }
        src.push_buffer(buffer)
            .map_err(|e| EgressError::Pipeline(format!("appsrc rejected buffer: {e:?}")))?;
        Ok(())
    }

    /// First sample: record the start time and post it on the bus for the
    /// segment sink's date anchoring.
    fn mark_first_sample(&self, src: &gst_app::AppSrc) {
        let now = unix_nanos_now();
        if self
            .start_time
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let structure = gst::Structure::builder(FIRST_SAMPLE_METADATA)
                .field(FIRST_SAMPLE_START_DATE, now)
                .build();
            let _ = src.post_message(gst::message::Element::new(structure));
        }
    }

    /// Bus reported the named input element playing; track timing only.
    pub fn playing(&self, name: &str) {
        info!("{name} playing");
    }

    /// The track stopped feeding (remote mute, unsubscribe, or negotiation
    /// failure): flush the matching input with EOS.
    pub fn stream_stopped(&self, name: &str) {
        debug!("stream stopped: {name}");
        let src = match name {
            AUDIO_APP_SOURCE => self.audio_src.as_ref(),
            VIDEO_APP_SOURCE => self.video_src.as_ref(),
            _ => None,
        };
        if let Some(src) = src {
            let _ = src.end_of_stream();
        }
    }

    /// Graceful end: EOS into every input.
    pub fn send_eos(&self) {
        if let Some(src) = &self.audio_src {
            let _ = src.end_of_stream();
        }
        if let Some(src) = &self.video_src {
            let _ = src.end_of_stream();
        }
    }
}
