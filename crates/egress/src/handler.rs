use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use egress_core::bus::{HandlerRpc, RpcBus, RpcRequest};
use egress_core::config::PipelineConfig;
use egress_core::errors::EgressError;
use egress_core::info::{EgressInfo, EgressStatus, InfoClient};
use egress_core::pipeline::{Pipeline, PipelineHandle};
use egress_core::source::SdkClient;
use egress_core::types::SourceType;

use crate::ipc::{self, IpcContext};

/// Bound on how long the SDK may take to report the subscribed tracks.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Owns one egress job inside its dedicated process: the pipeline, both RPC
/// endpoints, and the status update stream.
pub struct Handler {
    pipeline: PipelineHandle,
    run_task: JoinHandle<EgressInfo>,
    updates_task: JoinHandle<()>,
    rpc_task: JoinHandle<()>,
    ipc_task: JoinHandle<()>,
    info_client: Arc<dyn InfoClient>,
}

impl Handler {
    /// Construction failures classified as user errors have already produced
    /// a terminal FAILED update when this returns Err; fatal errors have not.
    pub async fn new(
        mut conf: PipelineConfig,
        bus: Arc<dyn RpcBus>,
        info_client: Arc<dyn InfoClient>,
        sdk: Arc<dyn SdkClient>,
    ) -> Result<Self, EgressError> {
        // SDK-sourced jobs finalize their outputs only once the join has
        // reported the actual track codecs
        if conf.source.source_type == SourceType::Sdk {
            if let Err(e) = join_tracks(&mut conf, sdk.as_ref()).await {
                if e.is_user_error() {
                    let mut info = conf.info.clone();
                    info.finish(EgressStatus::Failed, Some(&e));
                    if let Err(send_err) = info_client.update_egress_info(&info).await {
                        error!("failed to send update: {send_err}");
                    }
                }
                return Err(e);
            }
        }

        let egress_id = conf.info.egress_id.clone();
        let tmp_dir = conf.base.tmp_dir.clone();
        let failed_info = conf.info.clone();

        let (info_tx, mut info_rx) = mpsc::unbounded_channel();
        let (pipeline, handle) = match Pipeline::new(conf, info_tx) {
            Ok(built) => built,
            Err(e) => {
                if e.is_user_error() {
                    let mut info = failed_info;
                    info.finish(EgressStatus::Failed, Some(&e));
                    if let Err(send_err) = info_client.update_egress_info(&info).await {
                        error!("failed to send update: {send_err}");
                    }
                }
                return Err(e);
            }
        };

        // intermediate updates flow straight from the controller
        let updates_client = info_client.clone();
        let updates_task = tokio::spawn(async move {
            while let Some(info) = info_rx.recv().await {
                if info.is_finished() {
                    // terminal update is owned by the run loop
                    continue;
                }
                if let Err(e) = updates_client.update_egress_info(&info).await {
                    error!("failed to send update: {e}");
                }
            }
        });

        let rpc_rx = bus.subscribe(&egress_id).await?;
        let rpc_task = tokio::spawn(serve_bus(rpc_rx, handle.clone()));

        let ipc_ctx = IpcContext {
            egress_id,
            bus,
            pipeline: handle.clone(),
        };
        let ipc_task = tokio::spawn(async move {
            if let Err(e) = ipc::serve(ipc::socket_address(&tmp_dir), ipc_ctx).await {
                error!("handler rpc server failed: {e}");
            }
        });

        let run_task = tokio::spawn(pipeline.run());

        Ok(Self {
            pipeline: handle,
            run_task,
            updates_task,
            rpc_task,
            ipc_task,
            info_client,
        })
    }

    /// Block until the job finishes. A kill signal turns into EOS; the run
    /// loop produces the single terminal update.
    pub async fn run(self) -> Result<EgressInfo> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let mut run_task = self.run_task;
        let info = loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("kill signal received, sending EOS");
                    self.pipeline.send_eos();
                }
                _ = sigterm.recv() => {
                    info!("termination requested, sending EOS");
                    self.pipeline.send_eos();
                }
                result = &mut run_task => {
                    break result?;
                }
            }
        };

        send_terminal_update(self.info_client.as_ref(), &info).await;
        self.rpc_task.abort();
        self.ipc_task.abort();
        self.updates_task.abort();
        Ok(info)
    }
}

/// Await the SDK's track report and apply the post-join finalization, so the
/// encoder graph is built against the codecs actually being delivered.
async fn join_tracks(conf: &mut PipelineConfig, sdk: &dyn SdkClient) -> Result<(), EgressError> {
    let tracks = tokio::time::timeout(SUBSCRIBE_TIMEOUT, sdk.join(&conf.source))
        .await
        .map_err(|_| {
            EgressError::Pipeline("timed out waiting for track subscription".to_string())
        })??;
    info!("subscribed to {} track(s)", tracks.len());
    conf.apply_track_join(&tracks)
}

async fn serve_bus(
    mut rpc_rx: mpsc::UnboundedReceiver<RpcRequest>,
    pipeline: PipelineHandle,
) {
    while let Some(req) = rpc_rx.recv().await {
        let result = match req.request {
            HandlerRpc::UpdateStream {
                add_output_urls,
                remove_output_urls,
            } => pipeline.update_stream(add_output_urls, remove_output_urls).await,
            HandlerRpc::StopEgress => {
                pipeline.send_eos();
                pipeline.info().await
            }
        };
        if req.reply.send(result).is_err() {
            warn!("rpc caller went away before the reply");
        }
    }
}

async fn send_terminal_update(client: &dyn InfoClient, info: &EgressInfo) {
    match info.status {
        EgressStatus::Failed => warn!(
            "egress {} failed: {}",
            info.egress_id,
            if info.error.is_empty() { "unknown" } else { &info.error }
        ),
        EgressStatus::Aborted => warn!("egress {} aborted", info.egress_id),
        _ => info!("egress {} completed", info.egress_id),
    }
    if let Err(e) = client.update_egress_info(info).await {
        error!("failed to send terminal update: {e}");
    }
}
