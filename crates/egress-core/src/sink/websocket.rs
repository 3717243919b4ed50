use futures_util::{SinkExt, StreamExt};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

enum WsCommand {
    Data(Vec<u8>),
    Eos,
}

/// Forwards raw audio samples as binary frames over a websocket. The socket
/// is opened on the first sample and closed cleanly on EOS or when the
/// remote hangs up.
pub struct WebsocketWriter {
    tx: mpsc::UnboundedSender<WsCommand>,
    task: Option<JoinHandle<()>>,
}

impl WebsocketWriter {
    pub fn spawn(url: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(url, rx));
        Self {
            tx,
            task: Some(task),
        }
    }

    /// Wire an appsink's sample flow into this writer. Runs on the streaming
    /// thread, so it only moves bytes onto the channel.
    pub fn attach(&self, appsink: gst_app::AppSink) {
        let tx = self.tx.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    if tx.send(WsCommand::Data(map.as_slice().to_vec())).is_err() {
                        return Err(gst::FlowError::Eos);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .eos(move |_| {})
                .build(),
        );
    }

    /// Push a sample directly, for sinks not fed through an appsink.
    pub fn push(&self, data: Vec<u8>) {
        let _ = self.tx.send(WsCommand::Data(data));
    }

    /// Signal EOS without waiting for the writer to drain.
    pub fn finish(&self) {
        let _ = self.tx.send(WsCommand::Eos);
    }

    /// Signal EOS and wait for the close handshake.
    pub async fn close(mut self) {
        let _ = self.tx.send(WsCommand::Eos);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn write_loop(url: String, mut rx: mpsc::UnboundedReceiver<WsCommand>) {
    let mut socket: Option<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > = None;

    loop {
        let cmd = match &mut socket {
            // until connected there is nothing to select against
            None => rx.recv().await,
            Some(ws) => {
                tokio::select! {
                    cmd = rx.recv() => cmd,
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            info!("websocket closed by remote");
                            return;
                        }
                        // inbound data frames are not part of the contract
                        Some(Ok(_)) => continue,
                    },
                }
            }
        };

        match cmd {
            Some(WsCommand::Data(data)) => {
                if socket.is_none() {
                    match tokio_tungstenite::connect_async(url.as_str()).await {
                        Ok((ws, _)) => {
                            debug!("websocket connected: {url}");
                            socket = Some(ws);
                        }
                        Err(e) => {
                            warn!("websocket connect failed: {e}");
                            return;
                        }
                    }
                }
                if let Some(ws) = &mut socket {
                    if let Err(e) = ws.send(Message::Binary(data.into())).await {
                        warn!("websocket send failed: {e}");
                        return;
                    }
                }
            }
            Some(WsCommand::Eos) | None => {
                if let Some(mut ws) = socket.take() {
                    let _ = ws.close(None).await;
                }
                return;
            }
        }
    }
}
