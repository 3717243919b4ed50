use std::collections::HashMap;

use gstreamer as gst;
use gstreamer::prelude::*;
use log::{info, warn};
use uuid::Uuid;

use crate::config::{validate_stream_url, StreamConfig};
use crate::errors::{EgressError, Result};
use crate::sink::websocket::WebsocketWriter;
use crate::types::OutputType;

/// Live fan-out to one or more stream urls. Each url is bound to exactly one
/// dynamic sink element hanging off the mux tee; the binding table is what
/// the bus error handler consults to kill a single failing url.
pub struct StreamSink {
    pipeline: gst::Pipeline,
    tee: gst::Element,
    output_type: OutputType,
    bindings: StreamBindings,
    branches: HashMap<String, StreamBranch>,
}

struct StreamBranch {
    queue: gst::Element,
    sink: gst::Element,
    tee_pad: gst::Pad,
    /// Writer task backing a raw-websocket branch
    ws: Option<WebsocketWriter>,
}

impl StreamSink {
    pub fn new(
        pipeline: gst::Pipeline,
        tee: gst::Element,
        conf: &StreamConfig,
    ) -> Result<Self> {
        let mut sink = Self {
            pipeline,
            tee,
            output_type: conf.output_type,
            bindings: StreamBindings::default(),
            branches: HashMap::new(),
        };
        for url in &conf.urls {
            sink.add_stream(url)?;
        }
        Ok(sink)
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    /// Attach a new url to the live pipeline.
    pub fn add_stream(&mut self, url: &str) -> Result<()> {
        validate_stream_url(url, self.output_type)?;
        if self.bindings.contains_url(url) {
            return Err(EgressError::invalid_url(url, "stream already exists"));
        }

        let id = Uuid::new_v4().simple().to_string();
        let queue = gst::ElementFactory::make("queue")
            .name(format!("stream_queue_{id}"))
            .build()?;

        let (element, ws) = match self.output_type {
            OutputType::Rtmp => {
                let rtmp = gst::ElementFactory::make("rtmp2sink")
                    .name(format!("rtmp_sink_{id}"))
                    .property("location", url)
                    .build()?;
                (rtmp, None)
            }
            OutputType::Raw => {
                let appsink = gst::ElementFactory::make("appsink")
                    .name(format!("ws_sink_{id}"))
                    .build()?;
                let writer = WebsocketWriter::spawn(url.to_string());
                writer.attach(
                    appsink
                        .clone()
                        .downcast::<gstreamer_app::AppSink>()
                        .map_err(|_| EgressError::Pipeline("appsink downcast failed".to_string()))?,
                );
                (appsink, Some(writer))
            }
            other => {
                warn!("unsupported stream protocol {other}");
                return Err(EgressError::invalid_input("stream output type"));
            }
        };

        self.pipeline.add_many([&queue, &element])?;
        queue.link(&element)?;

        let tee_pad = self
            .tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| EgressError::Pipeline("no tee pad available".to_string()))?;
        let queue_pad = queue
            .static_pad("sink")
            .ok_or_else(|| EgressError::Pipeline("queue has no sink pad".to_string()))?;
        tee_pad
            .link(&queue_pad)
            .map_err(|e| EgressError::Pipeline(format!("failed to link stream branch: {e:?}")))?;

        queue.sync_state_with_parent()?;
        element.sync_state_with_parent()?;

        self.bindings.bind(element.name().to_string(), url);
        self.branches.insert(
            url.to_string(),
            StreamBranch {
                queue,
                sink: element,
                tee_pad,
                ws,
            },
        );
        info!("added stream {}", self.redacted(url));
        Ok(())
    }

    /// Detach a url; returns true when this was the last one ("drained").
    pub fn remove_stream(&mut self, url: &str) -> Result<bool> {
        let branch = self
            .branches
            .remove(url)
            .ok_or_else(|| EgressError::StreamNotFound(self.redacted(url)))?;
        self.bindings.unbind_url(url);

        if let Some(queue_pad) = branch.queue.static_pad("sink") {
            if let Err(e) = branch.tee_pad.unlink(&queue_pad) {
                warn!("failed to unlink stream branch: {e}");
            }
        }
        self.tee.release_request_pad(&branch.tee_pad);
        if let Err(e) = branch.queue.set_state(gst::State::Null) {
            warn!("failed to stop stream queue: {e}");
        }
        if let Err(e) = branch.sink.set_state(gst::State::Null) {
            warn!("failed to stop stream sink: {e}");
        }
        if let Err(e) = self.pipeline.remove_many([&branch.queue, &branch.sink]) {
            warn!("failed to remove stream branch: {e}");
        }
        if let Some(ws) = branch.ws {
            ws.finish();
        }

        info!("removed stream {}", self.redacted(url));
        Ok(self.branches.is_empty())
    }

    /// Url bound to a sink element, for the bus error handler.
    pub fn url_for_element(&self, element_name: &str) -> Option<&str> {
        self.bindings.url_for_element(element_name)
    }

    pub fn urls(&self) -> Vec<String> {
        self.bindings.urls.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub async fn close(&mut self) -> Result<()> {
        for url in self.urls() {
            if let Some(branch) = self.branches.remove(&url) {
                if let Some(ws) = branch.ws {
                    ws.close().await;
                }
            }
        }
        Ok(())
    }

    fn redacted(&self, url: &str) -> String {
        crate::util::redact_stream_key(url).unwrap_or_else(|| url.to_string())
    }
}

/// Url <-> element bookkeeping, kept separate from the gst plumbing so the
/// removal policy is testable on its own.
#[derive(Default)]
pub struct StreamBindings {
    urls: Vec<String>,
    by_element: HashMap<String, String>,
}

impl StreamBindings {
    pub fn bind(&mut self, element_name: String, url: &str) {
        self.urls.push(url.to_string());
        self.by_element.insert(element_name, url.to_string());
    }

    pub fn unbind_url(&mut self, url: &str) {
        self.urls.retain(|u| u != url);
        self.by_element.retain(|_, u| u != url);
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.urls.iter().any(|u| u == url)
    }

    pub fn url_for_element(&self, element_name: &str) -> Option<&str> {
        self.by_element.get(element_name).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_remove_leaves_set_unchanged() {
        let mut bindings = StreamBindings::default();
        bindings.bind("rtmp_sink_a".to_string(), "rtmp://host/app/one");

        let before = bindings.urls.clone();
        bindings.bind("rtmp_sink_b".to_string(), "rtmp://host/app/two");
        bindings.unbind_url("rtmp://host/app/two");
        assert_eq!(bindings.urls, before);
        assert!(bindings.url_for_element("rtmp_sink_b").is_none());
    }

    #[test]
    fn test_element_lookup() {
        let mut bindings = StreamBindings::default();
        bindings.bind("rtmp_sink_a".to_string(), "rtmp://host/app/one");
        bindings.bind("rtmp_sink_b".to_string(), "rtmp://host/app/two");

        assert_eq!(
            bindings.url_for_element("rtmp_sink_b"),
            Some("rtmp://host/app/two")
        );
        assert_eq!(bindings.url_for_element("rtmp_sink_c"), None);

        bindings.unbind_url("rtmp://host/app/one");
        assert_eq!(bindings.url_for_element("rtmp_sink_a"), None);
        assert!(!bindings.is_empty());
        bindings.unbind_url("rtmp://host/app/two");
        assert!(bindings.is_empty());
    }
}
