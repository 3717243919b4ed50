use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{error, info, warn};
use uuid::Uuid;

use egress_core::info::{EgressInfo, EgressStatus, InfoClient};
use egress_core::request::StartEgressRequest;

use crate::ipc::IpcClient;
use crate::settings::ServiceConfig;

const HANDLER_VERSION: i32 = 1;

/// Launches one handler subprocess per egress job, tracks liveness, and
/// routes control RPC to the right socket. The dispatcher daemon around this
/// is an external collaborator.
pub struct ProcessManager {
    conf: ServiceConfig,
    info_client: Arc<dyn InfoClient>,
    active: Arc<Mutex<HashMap<String, ActiveHandler>>>,
}

#[derive(Clone)]
struct ActiveHandler {
    handler_id: String,
    client: IpcClient,
}

impl ProcessManager {
    pub fn new(conf: ServiceConfig, info_client: Arc<dyn InfoClient>) -> Self {
        Self {
            conf,
            info_client,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a handler for the request and watch it until exit. A non-zero
    /// exit without a prior terminal update is reported as an internal
    /// failure on the job's behalf.
    pub async fn launch_handler(&self, request: &StartEgressRequest) -> Result<()> {
        let handler_id = format!("EGH_{}", Uuid::new_v4().simple());
        let tmp_dir = std::env::temp_dir().join(&handler_id);

        let base = self.conf.base_config(&handler_id, &tmp_dir);
        let conf_yaml = serde_yaml::to_string(&base).context("could not marshal config")?;
        let req_json = serde_json::to_string(request).context("could not marshal request")?;

        let mut child = tokio::process::Command::new(handler_binary())
            .arg("run-handler")
            .arg("--config")
            .arg(&conf_yaml)
            .arg("--request")
            .arg(&req_json)
            .arg("--version")
            .arg(HANDLER_VERSION.to_string())
            .current_dir("/")
            .spawn()
            .context("could not launch handler process")?;

        info!(
            "launched handler {handler_id} for egress {}",
            request.egress_id
        );
        {
            let mut active = self.active.lock().expect("manager lock poisoned");
            active.insert(
                request.egress_id.clone(),
                ActiveHandler {
                    handler_id,
                    client: IpcClient::new(&tmp_dir),
                },
            );
        }

        let egress_id = request.egress_id.clone();
        let request = request.clone();
        let active = self.active.clone();
        let info_client = self.info_client.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!("handler for {egress_id} exited with {status}");
                    synthesize_failure(info_client.as_ref(), &request).await;
                }
                Err(e) => {
                    error!("failed to wait on handler for {egress_id}: {e}");
                    synthesize_failure(info_client.as_ref(), &request).await;
                }
            }
            active
                .lock()
                .expect("manager lock poisoned")
                .remove(&egress_id);
            let _ = std::fs::remove_dir_all(&tmp_dir);
        });

        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.active.lock().expect("manager lock poisoned").is_empty()
    }

    pub fn list_egress(&self) -> Vec<String> {
        self.active
            .lock()
            .expect("manager lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Active egress id -> handler id, for the dispatcher's status surface.
    pub fn status(&self) -> HashMap<String, String> {
        self.active
            .lock()
            .expect("manager lock poisoned")
            .iter()
            .map(|(egress_id, h)| (egress_id.clone(), h.handler_id.clone()))
            .collect()
    }

    fn client(&self, egress_id: &str) -> Result<IpcClient> {
        self.active
            .lock()
            .expect("manager lock poisoned")
            .get(egress_id)
            .map(|h| h.client.clone())
            .context("egress not found")
    }

    pub async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo> {
        self.client(egress_id)?.stop_egress().await
    }

    pub async fn update_stream(
        &self,
        egress_id: &str,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<EgressInfo> {
        self.client(egress_id)?.update_stream(add, remove).await
    }

    pub async fn get_pipeline_dot(&self, egress_id: &str) -> Result<String> {
        self.client(egress_id)?.get_pipeline_dot().await
    }
}

/// Fatal exits never emitted a terminal update themselves; the manager
/// produces one so the job cannot disappear silently.
async fn synthesize_failure(client: &dyn InfoClient, request: &StartEgressRequest) {
    let mut info = EgressInfo::new(
        request.egress_id.clone(),
        request.room_id.clone(),
        request.redacted().request,
    );
    info.error = "internal error".to_string();
    info.finish(EgressStatus::Failed, None);
    if let Err(e) = client.update_egress_info(&info).await {
        error!("failed to report handler failure: {e}");
    }
}

fn handler_binary() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("egress"))
}
