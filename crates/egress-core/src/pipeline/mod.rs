use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use gstreamer as gst;
use gstreamer::glib::prelude::ToValue;
use gstreamer::prelude::*;
use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::{OutputConfig, PipelineConfig};
use crate::errors::{EgressError, Result};
use crate::info::{EgressInfo, EgressStatus, StreamState};
use crate::sink::{FileSink, SegmentSink, SinkKind, StreamSink, WebsocketWriter};
use crate::source::Source;
use crate::types::{EgressType, SourceType};
use crate::util::unix_nanos_now;

pub mod builder;
mod watch;

pub use builder::PIPELINE_NAME;

/// Bounded wait for a clean EOS before the pipeline is force-stopped.
/// Re-armed by fragment events so it never fires during healthy segment
/// production.
pub const EOS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Building,
    Starting,
    Playing,
    Ending,
    Terminated,
}

enum ControlMessage {
    SendEos,
    GetInfo {
        reply: oneshot::Sender<EgressInfo>,
    },
    UpdateStream {
        add: Vec<String>,
        remove: Vec<String>,
        reply: oneshot::Sender<Result<EgressInfo>>,
    },
}

/// Cheap clone used by RPC tasks. Mutators post intents to the run loop and
/// never block on I/O themselves.
#[derive(Clone)]
pub struct PipelineHandle {
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    closed: Arc<AtomicBool>,
    gst_pipeline: gst::Pipeline,
}

impl PipelineHandle {
    /// Initiate graceful end-of-stream. Idempotent: only the first call
    /// arms the EOS safety timer.
    pub fn send_eos(&self) {
        let _ = self.control_tx.send(ControlMessage::SendEos);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the job's current status.
    pub async fn info(&self) -> Result<EgressInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(ControlMessage::GetInfo { reply: reply_tx })
            .map_err(|_| EgressError::PipelineClosed)?;
        reply_rx.await.map_err(|_| EgressError::PipelineClosed)
    }

    /// Add and/or remove urls on the live stream output.
    pub async fn update_stream(
        &self,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<EgressInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(ControlMessage::UpdateStream {
                add,
                remove,
                reply: reply_tx,
            })
            .map_err(|_| EgressError::PipelineClosed)?;
        reply_rx.await.map_err(|_| EgressError::PipelineClosed)?
    }

    /// Graph snapshot in graphviz dot form; safe from any thread.
    pub fn debug_dot(&self) -> String {
        self.gst_pipeline
            .debug_to_dot_data(gst::DebugGraphDetails::all())
            .to_string()
    }
}

/// Owns the media graph for one egress job and translates framework bus
/// events into job-level state transitions.
pub struct Pipeline {
    pub(crate) conf: PipelineConfig,
    pub(crate) gst_pipeline: gst::Pipeline,
    pub(crate) source: Source,
    pub(crate) sinks: BTreeMap<EgressType, SinkKind>,

    state: PipelineState,
    reached_playing: bool,
    /// Set once EOS has been issued; gates the split-muxer error suppression
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) eos_deadline: Option<Instant>,
    pub(crate) error: Option<EgressError>,

    control_rx: Option<mpsc::UnboundedReceiver<ControlMessage>>,
    failure_rx: Option<mpsc::UnboundedReceiver<EgressError>>,
    info_tx: mpsc::UnboundedSender<EgressInfo>,
}

impl Pipeline {
    /// Build the media graph and bind the configured sinks. Errors here are
    /// classified by [EgressError::is_user_error] for the handler.
    pub fn new(
        conf: PipelineConfig,
        info_tx: mpsc::UnboundedSender<EgressInfo>,
    ) -> Result<(Self, PipelineHandle)> {
        let built = builder::build(&conf)?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let mut sinks = BTreeMap::new();
        for (egress_type, output) in &conf.outputs {
            match (egress_type, output) {
                (EgressType::File, OutputConfig::File(f)) => {
                    sinks.insert(EgressType::File, SinkKind::File(FileSink::new(f)?));
                }
                (EgressType::Stream, OutputConfig::Stream(s)) => {
                    let tee = built.stream_tee.clone().ok_or_else(|| {
                        EgressError::Internal("stream output without mux tee".to_string())
                    })?;
                    let sink = StreamSink::new(built.pipeline.clone(), tee, s)?;
                    sinks.insert(EgressType::Stream, SinkKind::Stream(sink));
                }
                (EgressType::Segments, OutputConfig::Segments(s)) => {
                    let result = conf.info.segments.clone().unwrap_or_default();
                    let sink = SegmentSink::new(s, result, failure_tx.clone())?;

                    let splitmux = built.splitmux.clone().ok_or_else(|| {
                        EgressError::Internal("segment output without split-muxer".to_string())
                    })?;
                    let namer = sink.namer();
                    splitmux.connect("format-location", false, move |_args| {
                        Some(namer.next().to_string_lossy().to_string().to_value())
                    });

                    sinks.insert(EgressType::Segments, SinkKind::Segments(sink));
                }
                (EgressType::Websocket, OutputConfig::Websocket(w)) => {
                    let appsink = built.ws_appsink.clone().ok_or_else(|| {
                        EgressError::Internal("websocket output without appsink".to_string())
                    })?;
                    let writer = WebsocketWriter::spawn(w.url.clone());
                    writer.attach(appsink);
                    sinks.insert(EgressType::Websocket, SinkKind::Websocket(writer));
                }
                _ => return Err(EgressError::Internal("mismatched output config".to_string())),
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let handle = PipelineHandle {
            control_tx,
            closed: closed.clone(),
            gst_pipeline: built.pipeline.clone(),
        };
        let pipeline = Self {
            conf,
            gst_pipeline: built.pipeline,
            source: built.source,
            sinks,
            state: PipelineState::Building,
            reached_playing: false,
            closed,
            eos_deadline: None,
            error: None,
            control_rx: Some(control_rx),
            failure_rx: Some(failure_rx),
            info_tx,
        };
        Ok((pipeline, handle))
    }

    pub fn info(&self) -> &EgressInfo {
        &self.conf.info
    }

    /// Drive the pipeline until natural end, EOS-driven end, or fatal
    /// failure. Always returns a terminal [EgressInfo].
    pub async fn run(mut self) -> EgressInfo {
        if let Err(e) = self.start() {
            error!("failed to start pipeline: {e}");
            self.error = Some(e);
            return self.finalize().await;
        }

        let Some(bus) = self.gst_pipeline.bus() else {
            self.error = Some(EgressError::Pipeline("pipeline has no bus".to_string()));
            return self.finalize().await;
        };
        let mut bus_stream = bus.stream();
        let mut control_rx = self.control_rx.take().expect("run called once");
        let mut failure_rx = self.failure_rx.take().expect("run called once");

        loop {
            let eos_deadline = self.eos_deadline;
            let eos_timer = async move {
                match eos_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = bus_stream.next() => match msg {
                    Some(msg) => {
                        if let watch::Flow::Stop = self.handle_message(msg) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(err) = failure_rx.recv() => {
                    self.fatal(err);
                    break;
                }
                Some(cmd) = control_rx.recv() => match cmd {
                    ControlMessage::SendEos => self.send_eos(),
                    ControlMessage::GetInfo { reply } => {
                        let _ = reply.send(self.conf.info.clone());
                    }
                    ControlMessage::UpdateStream { add, remove, reply } => {
                        let result = self.update_stream(add, remove);
                        let _ = reply.send(result.map(|_| self.conf.info.clone()));
                    }
                },
                _ = eos_timer => {
                    warn!("EOS not received before timeout, force stopping");
                    self.eos_deadline = None;
                    break;
                }
            }
        }

        self.finalize().await
    }

    fn start(&mut self) -> Result<()> {
        self.state = PipelineState::Starting;
        self.emit_update();
        self.gst_pipeline.set_state(gst::State::Playing)?;
        Ok(())
    }

    /// Root element reached the play state: the job is live.
    pub(crate) fn on_playing(&mut self) {
        if self.state != PipelineState::Starting {
            return;
        }
        self.state = PipelineState::Playing;
        self.reached_playing = true;
        self.conf.mark_started();

        match self.conf.source.source_type {
            SourceType::Sdk => {
                let start = self.source.sdk().map(|s| s.start_time()).unwrap_or(0);
                if start > 0 {
                    self.conf.info.touch_at(start);
                }
            }
            SourceType::Web => {}
        }
        self.conf.info.advance(EgressStatus::Active);
        self.emit_update();
        info!("pipeline playing");
    }

    /// Graceful end-of-stream. Idempotent; the first call arms the safety
    /// timer.
    pub(crate) fn send_eos(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("sending EOS to pipeline");
        self.state = PipelineState::Ending;
        self.conf.info.advance(EgressStatus::Ending);
        self.emit_update();
        self.eos_deadline = Some(Instant::now() + EOS_TIMEOUT);

        match &self.source {
            Source::Sdk(sdk) => sdk.send_eos(),
            Source::Web(_) => {
                self.gst_pipeline.send_event(gst::event::Eos::new());
            }
        }
    }

    /// Fatal failure: record the first error and stop immediately.
    pub(crate) fn fatal(&mut self, err: EgressError) {
        error!("pipeline failure: {err}");
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.eos_deadline = None;
    }

    fn update_stream(&mut self, add: Vec<String>, remove: Vec<String>) -> Result<()> {
        let Some(SinkKind::Stream(sink)) = self.sinks.get_mut(&EgressType::Stream) else {
            return Err(EgressError::NotSupported("stream output"));
        };

        for url in &add {
            sink.add_stream(url)?;
            let redacted = crate::util::redact_stream_key(url).unwrap_or_else(|| url.clone());
            self.conf.info.streams.push(crate::info::StreamResult {
                url: redacted,
                state: StreamState::Active,
                started_at: unix_nanos_now(),
                ended_at: 0,
            });
        }
        let mut drained = false;
        for url in &remove {
            drained = sink.remove_stream(url)?;
            let redacted = crate::util::redact_stream_key(url).unwrap_or_else(|| url.clone());
            mark_stream(&mut self.conf.info, &redacted, StreamState::Finished);
        }
        if drained {
            self.on_streams_drained(None);
        }
        self.emit_update();
        Ok(())
    }

    /// Bus reported an error on one stream sink element: remove just that
    /// url. Not fatal to the job unless nothing is left to produce.
    pub(crate) fn remove_failed_stream(&mut self, element_name: &str) -> Result<()> {
        let Some(SinkKind::Stream(sink)) = self.sinks.get_mut(&EgressType::Stream) else {
            return Err(EgressError::StreamNotFound(element_name.to_string()));
        };
        let Some(url) = sink.url_for_element(element_name).map(str::to_string) else {
            return Err(EgressError::StreamNotFound(element_name.to_string()));
        };

        warn!("removing failed stream {element_name}");
        let drained = sink.remove_stream(&url)?;
        let redacted = crate::util::redact_stream_key(&url).unwrap_or(url);
        mark_stream(&mut self.conf.info, &redacted, StreamState::Failed);
        self.emit_update();

        if drained {
            self.on_streams_drained(Some(redacted));
        }
        Ok(())
    }

    /// The stream output lost its last url. With other outputs the job keeps
    /// going; alone, it ends FAILED.
    fn on_streams_drained(&mut self, failed_url: Option<String>) {
        if self.sinks.len() > 1 {
            return;
        }
        let err = match failed_url {
            Some(url) => EgressError::Pipeline(format!("all streams failed, last was {url}")),
            None => EgressError::Pipeline("all streams removed".to_string()),
        };
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.send_eos();
    }

    pub(crate) fn emit_update(&self) {
        let _ = self.info_tx.send(self.conf.info.clone());
    }

    /// Tear down in order: stop the graph, then finalize every sink, then
    /// produce the terminal info exactly once.
    async fn finalize(mut self) -> EgressInfo {
        self.state = PipelineState::Terminated;
        if let Err(e) = self.gst_pipeline.set_state(gst::State::Null) {
            warn!("failed to stop pipeline: {e}");
        }

        let ended = unix_nanos_now();
        let duration = if self.conf.info.started_at > 0 {
            ended - self.conf.info.started_at
        } else {
            0
        };

        let info_snapshot = self.conf.info.clone();
        let sinks = std::mem::take(&mut self.sinks);
        for (_egress_type, sink) in sinks {
            match sink {
                SinkKind::File(mut file) => match file.close(&info_snapshot, duration).await {
                    Ok(result) => self.conf.info.file = Some(result),
                    Err(e) => {
                        error!("file egress failed: {e}");
                        if self.error.is_none() {
                            self.error = Some(e);
                        }
                    }
                },
                SinkKind::Segments(mut segments) => match segments.close().await {
                    Ok(result) => self.conf.info.segments = Some(result),
                    Err(e) => {
                        error!("segment egress failed: {e}");
                        if self.error.is_none() {
                            self.error = Some(e);
                        }
                    }
                },
                SinkKind::Stream(mut stream) => {
                    if let Err(e) = stream.close().await {
                        warn!("stream egress teardown: {e}");
                    }
                    for result in &mut self.conf.info.streams {
                        if result.state == StreamState::Active {
                            result.state = StreamState::Finished;
                            result.ended_at = ended;
                        }
                    }
                }
                SinkKind::Websocket(writer) => {
                    writer.close().await;
                }
            }
        }

        let status = if self.error.is_some() {
            EgressStatus::Failed
        } else if !self.reached_playing && self.closed.load(Ordering::Acquire) {
            // killed before ever going live
            EgressStatus::Aborted
        } else {
            EgressStatus::Complete
        };
        self.conf.info.finish(status, self.error.as_ref());
        self.conf.info.clone()
    }

    /// Debug snapshot of the graph (collaborator surface for the socket rpc).
    pub fn debug_dot(&self) -> String {
        self.gst_pipeline
            .debug_to_dot_data(gst::DebugGraphDetails::all())
            .to_string()
    }

    pub(crate) fn rearm_eos_timer(&mut self) {
        if self.eos_deadline.is_some() {
            self.eos_deadline = Some(Instant::now() + EOS_TIMEOUT);
        }
    }
}

fn mark_stream(info: &mut EgressInfo, redacted_url: &str, state: StreamState) {
    for stream in &mut info.streams {
        if stream.url == redacted_url && stream.state == StreamState::Active {
            stream.state = state;
            stream.ended_at = unix_nanos_now();
        }
    }
}
