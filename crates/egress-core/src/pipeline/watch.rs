use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::MessageView;
use log::{debug, info, warn};

use crate::errors::EgressError;
use crate::pipeline::{Pipeline, PIPELINE_NAME};
use crate::sink::SinkKind;
use crate::source::{sdk, Source};
use crate::types::EgressType;

const MSG_CLOCK_PROBLEM: &str = "clock problem";
const MSG_STREAMING_NOT_NEGOTIATED: &str = "not negotiated";
const MSG_MUXER: &str = "muxer";
const MSG_FRAGMENT_OPENED: &str = "splitmuxsink-fragment-opened";
const MSG_FRAGMENT_CLOSED: &str = "splitmuxsink-fragment-closed";

const FRAGMENT_LOCATION: &str = "location";
const FRAGMENT_RUNNING_TIME: &str = "running-time";

const ELEMENT_RTMP_SINK: &str = "GstRtmp2Sink";
const ELEMENT_APP_SRC: &str = "GstAppSrc";
const ELEMENT_SPLIT_MUX_SINK: &str = "GstSplitMuxSink";

pub(crate) enum Flow {
    Continue,
    Stop,
}

impl Pipeline {
    /// Single dispatch point for framework bus messages; runs on the owning
    /// run-loop task, so every mutation here is single-threaded.
    pub(crate) fn handle_message(&mut self, msg: gst::Message) -> Flow {
        match msg.view() {
            MessageView::Eos(..) => {
                info!("EOS received, stopping pipeline");
                self.eos_deadline = None;
                Flow::Stop
            }
            MessageView::Warning(w) => {
                let text = w.error().to_string();
                let debug_info = w.debug().map(|d| d.to_string()).unwrap_or_default();
                if text.contains(MSG_CLOCK_PROBLEM) {
                    self.fatal(EgressError::Pipeline(text));
                    return Flow::Stop;
                }
                warn!("pipeline warning: {text} ({debug_info})");
                Flow::Continue
            }
            MessageView::Error(e) => {
                let text = e.error().to_string();
                let debug_info = e.debug().map(|d| d.to_string()).unwrap_or_default();
                let (src_name, src_type) = message_source(&msg);
                self.handle_error_message(&src_type, &src_name, &text, &debug_info)
            }
            MessageView::StateChanged(sc) => {
                if sc.current() == gst::State::Playing {
                    let (src_name, _) = message_source(&msg);
                    self.handle_playing_element(&src_name);
                }
                Flow::Continue
            }
            MessageView::Element(e) => {
                let Some(structure) = e.structure() else {
                    return Flow::Continue;
                };
                match structure.name().as_str() {
                    MSG_FRAGMENT_OPENED => {
                        self.rearm_eos_timer();
                        match fragment_params(structure) {
                            Ok((location, running_time)) => {
                                debug!("fragment opened: {location} at {running_time}");
                                if let Err(err) = self.segment_sink_op(|sink| {
                                    sink.start_segment(&location, running_time)
                                }) {
                                    self.fatal(err);
                                    return Flow::Stop;
                                }
                            }
                            Err(err) => {
                                self.fatal(err);
                                return Flow::Stop;
                            }
                        }
                    }
                    MSG_FRAGMENT_CLOSED => {
                        self.rearm_eos_timer();
                        match fragment_params(structure) {
                            Ok((location, running_time)) => {
                                debug!("fragment closed: {location} at {running_time}");
                                if let Err(err) = self.segment_sink_op(|sink| {
                                    sink.enqueue_segment_upload(&location, running_time)
                                }) {
                                    self.fatal(err);
                                    return Flow::Stop;
                                }
                            }
                            Err(err) => {
                                self.fatal(err);
                                return Flow::Stop;
                            }
                        }
                    }
                    sdk::FIRST_SAMPLE_METADATA => {
                        if let Ok(start_date) =
                            structure.get::<i64>(sdk::FIRST_SAMPLE_START_DATE)
                        {
                            debug!("first sample at {start_date}");
                            let date = chrono::DateTime::from_timestamp_nanos(start_date);
                            let _ = self.segment_sink_op(|sink| {
                                sink.update_start_date(date);
                                Ok(())
                            });
                        }
                    }
                    _ => {}
                }
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    /// Decide whether a bus error is demotable (remove one sink, keep going)
    /// or fatal.
    fn handle_error_message(
        &mut self,
        src_type: &str,
        src_name: &str,
        text: &str,
        debug_info: &str,
    ) -> Flow {
        match src_type {
            ELEMENT_RTMP_SINK => {
                // bad uri or lost connection: remove just that url
                match self.remove_failed_stream(src_name) {
                    Ok(()) => Flow::Continue,
                    Err(err) => {
                        warn!("rtmp output not found: {src_name}");
                        self.fatal(err);
                        Flow::Stop
                    }
                }
            }
            ELEMENT_APP_SRC if debug_info.contains(MSG_STREAMING_NOT_NEGOTIATED) => {
                // downstream refused the track; stop just that feed
                debug!("streaming stopped: {src_name}");
                if let Source::Sdk(sdk_source) = &self.source {
                    sdk_source.stream_stopped(src_name);
                }
                Flow::Continue
            }
            ELEMENT_SPLIT_MUX_SINK
                if self.closed.load(std::sync::atomic::Ordering::Acquire)
                    && debug_info.contains(MSG_MUXER) =>
            {
                // the split-muxer races EOS when it never saw media; harmless
                debug!("split-muxer failure after EOS, suppressed");
                Flow::Continue
            }
            _ => {
                self.fatal(EgressError::Pipeline(format!("{text} ({debug_info})")));
                Flow::Stop
            }
        }
    }

    fn handle_playing_element(&mut self, src_name: &str) {
        match src_name {
            sdk::AUDIO_APP_SOURCE | sdk::VIDEO_APP_SOURCE => {
                if let Source::Sdk(sdk_source) = &self.source {
                    sdk_source.playing(src_name);
                }
            }
            PIPELINE_NAME => self.on_playing(),
            _ => {}
        }
    }

    fn segment_sink_op<F>(&mut self, op: F) -> Result<(), EgressError>
    where
        F: FnOnce(&crate::sink::SegmentSink) -> Result<(), EgressError>,
    {
        match self.sinks.get(&EgressType::Segments) {
            Some(SinkKind::Segments(sink)) => op(sink),
            _ => Err(EgressError::Internal(
                "fragment event without segment sink".to_string(),
            )),
        }
    }
}

fn message_source(msg: &gst::Message) -> (String, String) {
    match msg.src() {
        Some(src) => (src.name().to_string(), src.type_().name().to_string()),
        None => (String::new(), String::new()),
    }
}

fn fragment_params(structure: &gst::StructureRef) -> Result<(String, u64), EgressError> {
    let location = structure
        .get::<String>(FRAGMENT_LOCATION)
        .map_err(|_| EgressError::Pipeline("invalid type for location".to_string()))?;
    let running_time = if let Ok(t) = structure.get::<u64>(FRAGMENT_RUNNING_TIME) {
        t
    } else if let Ok(t) = structure.get::<gst::ClockTime>(FRAGMENT_RUNNING_TIME) {
        t.nseconds()
    } else {
        return Err(EgressError::Pipeline(
            "invalid type for running time".to_string(),
        ));
    };
    Ok((location, running_time))
}
