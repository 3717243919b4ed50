use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::errors::{EgressError, Result};
use crate::info::EgressInfo;

/// Control-plane requests addressed to a running handler, keyed by its
/// egress-id topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerRpc {
    UpdateStream {
        #[serde(default)]
        add_output_urls: Vec<String>,
        #[serde(default)]
        remove_output_urls: Vec<String>,
    },
    StopEgress,
}

pub struct RpcRequest {
    pub request: HandlerRpc,
    pub reply: oneshot::Sender<Result<EgressInfo>>,
}

/// Message-bus RPC seam. The dispatcher's transport is a collaborator; the
/// handler only depends on subscribe/request semantics.
#[async_trait]
pub trait RpcBus: Send + Sync {
    /// Subscribe to a topic; at most one subscriber per topic.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<RpcRequest>>;

    /// Send a request to the topic's subscriber and await its reply.
    async fn request(&self, topic: &str, request: HandlerRpc) -> Result<EgressInfo>;
}

/// In-process bus: topics map straight onto channels. Used by the manager
/// surface (which bridges its external transport onto this) and by tests.
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, mpsc::UnboundedSender<RpcRequest>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RpcBus for LocalBus {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<RpcRequest>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        if topics.contains_key(topic) {
            return Err(EgressError::Internal(format!(
                "topic {topic} already subscribed"
            )));
        }
        topics.insert(topic.to_string(), tx);
        Ok(rx)
    }

    async fn request(&self, topic: &str, request: HandlerRpc) -> Result<EgressInfo> {
        let tx = {
            let topics = self.topics.lock().expect("bus lock poisoned");
            topics.get(topic).cloned()
        }
        .ok_or(EgressError::EgressNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RpcRequest {
            request,
            reply: reply_tx,
        })
        .map_err(|_| EgressError::EgressNotFound)?;
        reply_rx.await.map_err(|_| EgressError::PipelineClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EgressRequest, RoomCompositeRequest};

    #[tokio::test]
    async fn test_request_reaches_subscriber_and_reply_returns() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("EG_1").await.unwrap();

        let server = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert!(matches!(req.request, HandlerRpc::StopEgress));
            let info = EgressInfo::new(
                "EG_1".to_string(),
                String::new(),
                EgressRequest::RoomComposite(RoomCompositeRequest::default()),
            );
            req.reply.send(Ok(info)).unwrap();
        });

        let info = bus.request("EG_1", HandlerRpc::StopEgress).await.unwrap();
        assert_eq!(info.egress_id, "EG_1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_found() {
        let bus = LocalBus::new();
        let err = bus.request("EG_missing", HandlerRpc::StopEgress).await;
        assert!(matches!(err, Err(EgressError::EgressNotFound)));
    }

    #[tokio::test]
    async fn test_double_subscribe_rejected() {
        let bus = LocalBus::new();
        let _rx = bus.subscribe("EG_1").await.unwrap();
        assert!(bus.subscribe("EG_1").await.is_err());
    }
}
