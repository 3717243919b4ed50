use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use egress_core::bus::LocalBus;
use egress_core::config::{BaseConfig, PipelineConfig};
use egress_core::info::{InfoClient, NullInfoClient, WebhookInfoClient};
use egress_core::request::StartEgressRequest;
use egress_core::source::{NullSdkClient, SdkClient};

use egress::handler::Handler;
use egress::manager::ProcessManager;
use egress::settings::ServiceConfig;

#[derive(Parser, Debug)]
#[command(name = "egress", about = "Room media egress service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch one egress job as a supervised subprocess and wait for it.
    /// The production dispatcher drives the same manager surface.
    Start {
        /// Service config yaml
        #[arg(long, default_value = "config.yaml")]
        config: String,
        /// StartEgressRequest json, inline or @file
        #[arg(long)]
        request: String,
    },
    /// Run a single egress job in this process (spawned by the manager)
    RunHandler {
        /// Serialized handler base config (yaml)
        #[arg(long)]
        config: String,
        /// Serialized StartEgressRequest (json)
        #[arg(long)]
        request: String,
        #[arg(long, default_value_t = 1)]
        version: i32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init();

    let args = Args::parse();
    let result = match args.command {
        Command::Start { config, request } => run_start(&config, &request).await,
        Command::RunHandler {
            config,
            request,
            version,
        } => run_handler(&config, &request, version).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_start(config_path: &str, request_arg: &str) -> Result<ExitCode> {
    let conf = ServiceConfig::load(config_path)?;
    let request_json = match request_arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading request file {path}"))?,
        None => request_arg.to_string(),
    };
    let request: StartEgressRequest =
        serde_json::from_str(&request_json).context("could not parse request")?;

    let info_client = make_info_client(&conf.info_url);
    let manager = ProcessManager::new(conf, info_client);
    manager.launch_handler(&request).await?;
    info!("active handlers: {:?}", manager.status());

    // wait for the job; forward our own shutdown as a stop, dump pipeline
    // graphs on SIGUSR1
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigusr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("stopping egress {}", request.egress_id);
                if let Err(e) = manager.stop_egress(&request.egress_id).await {
                    warn!("stop failed: {e}");
                }
            }
            _ = sigusr1.recv() => {
                for egress_id in manager.list_egress() {
                    match manager.get_pipeline_dot(&egress_id).await {
                        Ok(dot) => info!("pipeline graph for {egress_id}:\n{dot}"),
                        Err(e) => warn!("could not fetch pipeline graph for {egress_id}: {e}"),
                    }
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                if manager.is_idle() {
                    info!("egress {} finished", request.egress_id);
                    return Ok(ExitCode::SUCCESS);
                }
            }
        }
    }
}

/// Per-job subprocess entrypoint. Exit code semantics: user errors produce a
/// terminal FAILED update and exit 0; fatal errors exit non-zero so the
/// manager synthesizes the failure update.
async fn run_handler(config_yaml: &str, request_json: &str, version: i32) -> Result<ExitCode> {
    if version != 1 {
        warn!("handler protocol version {version} requested, serving version 1");
    }

    let base: BaseConfig = serde_yaml::from_str(config_yaml).context("could not parse config")?;
    let request: StartEgressRequest =
        serde_json::from_str(request_json).context("could not parse request")?;

    let info_client = make_info_client(&base.info_url);

    let conf = match PipelineConfig::from_request(base, &request) {
        Ok(conf) => conf,
        Err(e) => {
            return if e.is_user_error() {
                // reject before any status was emitted, terminal update only
                error!("invalid egress request: {e}");
                let mut info = egress_core::info::EgressInfo::new(
                    request.egress_id.clone(),
                    request.room_id.clone(),
                    request.redacted().request,
                );
                info.finish(egress_core::info::EgressStatus::Failed, Some(&e));
                if let Err(send_err) = info_client.update_egress_info(&info).await {
                    error!("failed to send update: {send_err}");
                }
                Ok(ExitCode::SUCCESS)
            } else {
                Err(e.into())
            };
        }
    };

    let bus = Arc::new(LocalBus::new());
    // the rtc bridge is deployment-specific; without one, sdk-sourced jobs
    // are refused at join time
    let sdk: Arc<dyn SdkClient> = Arc::new(NullSdkClient);
    let handler = match Handler::new(conf, bus, info_client, sdk).await {
        Ok(handler) => handler,
        Err(e) if e.is_user_error() => {
            // the handler already sent the FAILED update
            error!("could not build pipeline: {e}");
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };

    let info = handler.run().await?;
    info!(
        "handler finished: egress {} {:?}",
        info.egress_id, info.status
    );
    Ok(ExitCode::SUCCESS)
}

fn make_info_client(info_url: &str) -> Arc<dyn InfoClient> {
    if info_url.is_empty() {
        Arc::new(NullInfoClient)
    } else {
        Arc::new(WebhookInfoClient::new(info_url))
    }
}
