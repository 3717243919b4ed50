use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};

use egress_core::bus::{HandlerRpc, RpcBus};
use egress_core::errors::EgressError;
use egress_core::info::EgressInfo;
use egress_core::pipeline::PipelineHandle;

pub const SOCKET_NAME: &str = "service_rpc.sock";
const DOT_DEADLINE: Duration = Duration::from_secs(2);

pub fn socket_address(handler_tmp_dir: &Path) -> PathBuf {
    handler_tmp_dir.join(SOCKET_NAME)
}

#[derive(Serialize, Deserialize)]
pub struct DotResponse {
    pub dot_file: String,
}

#[derive(Serialize, Deserialize, Default)]
pub struct PProfRequest {
    #[serde(default)]
    pub profile_name: String,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub debug: i32,
}

#[derive(Serialize, Deserialize, Default)]
pub struct UpdateStreamRequest {
    #[serde(default)]
    pub add_output_urls: Vec<String>,
    #[serde(default)]
    pub remove_output_urls: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Per-handler context the socket RPC dispatches into. Stream updates and
/// stops are bridged onto the handler's bus subscription so the dispatcher
/// transport and the in-process path share one code path.
#[derive(Clone)]
pub struct IpcContext {
    pub egress_id: String,
    pub bus: Arc<dyn RpcBus>,
    pub pipeline: PipelineHandle,
}

/// Serve handler RPC on the unix socket until the task is dropped.
pub async fn serve(socket_path: PathBuf, ctx: IpcContext) -> Result<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    debug!("handler rpc listening on {}", socket_path.display());

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, ctx.clone()));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!("failed to handle rpc connection: {e}");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: IpcContext,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    let response = match path.as_str() {
        "/dot" => get_pipeline_dot(&ctx).await,
        "/pprof" => {
            let req: PProfRequest = serde_json::from_slice(&body).unwrap_or_default();
            debug!("pprof requested: {}", req.profile_name);
            Err(EgressError::ProfilingNotAvailable)
        }
        "/update_stream" => {
            let req: UpdateStreamRequest = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string()));
                }
            };
            ctx.bus
                .request(
                    &ctx.egress_id,
                    HandlerRpc::UpdateStream {
                        add_output_urls: req.add_output_urls,
                        remove_output_urls: req.remove_output_urls,
                    },
                )
                .await
                .map(|info| serde_json::to_vec(&info).unwrap_or_default())
        }
        "/stop" => ctx
            .bus
            .request(&ctx.egress_id, HandlerRpc::StopEgress)
            .await
            .map(|info| serde_json::to_vec(&info).unwrap_or_default()),
        _ => {
            return Ok(error_response(StatusCode::NOT_FOUND, "unknown method"));
        }
    };

    Ok(match response {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .expect("valid response"),
        Err(EgressError::DeadlineExceeded(msg)) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, msg)
        }
        Err(EgressError::EgressNotFound) => {
            error_response(StatusCode::NOT_FOUND, "egress not found")
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    })
}

/// The dot dump must not disturb a wedged pipeline: bounded by a hard
/// deadline instead of waiting forever.
async fn get_pipeline_dot(ctx: &IpcContext) -> std::result::Result<Vec<u8>, EgressError> {
    let pipeline = ctx.pipeline.clone();
    let dot = tokio::task::spawn_blocking(move || pipeline.debug_dot());
    match tokio::time::timeout(DOT_DEADLINE, dot).await {
        Ok(Ok(dot_file)) => {
            let response = DotResponse { dot_file };
            Ok(serde_json::to_vec(&response).unwrap_or_default())
        }
        Ok(Err(e)) => Err(EgressError::Internal(e.to_string())),
        Err(_) => Err(EgressError::DeadlineExceeded(
            "timed out requesting pipeline debug info",
        )),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&ErrorResponse {
        error: message.to_string(),
    })
    .unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response")
}

/// Manager-side client for a handler's socket.
#[derive(Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(handler_tmp_dir: &Path) -> Self {
        Self {
            socket_path: socket_address(handler_tmp_dir),
        }
    }

    pub async fn get_pipeline_dot(&self) -> Result<String> {
        let body = self.post("/dot", Vec::new()).await?;
        let response: DotResponse = serde_json::from_slice(&body)?;
        Ok(response.dot_file)
    }

    pub async fn update_stream(
        &self,
        add_output_urls: Vec<String>,
        remove_output_urls: Vec<String>,
    ) -> Result<EgressInfo> {
        let request = UpdateStreamRequest {
            add_output_urls,
            remove_output_urls,
        };
        let body = self
            .post("/update_stream", serde_json::to_vec(&request)?)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn stop_egress(&self) -> Result<EgressInfo> {
        let body = self.post("/stop", Vec::new()).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<Bytes> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connecting {}", self.socket_path.display()))?;
        let io = TokioIo::new(stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("rpc connection error: {e}");
            }
        });

        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Host", "localhost")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))?;
        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorResponse>(&bytes)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).to_string());
            bail!("rpc {path} failed ({status}): {message}");
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_address() {
        assert_eq!(
            socket_address(Path::new("/tmp/EGH_a")),
            PathBuf::from("/tmp/EGH_a/service_rpc.sock")
        );
    }

    #[test]
    fn test_update_stream_request_wire_shape() {
        let parsed: UpdateStreamRequest =
            serde_json::from_str(r#"{"add_output_urls":["rtmp://host/app/key"]}"#).unwrap();
        assert_eq!(parsed.add_output_urls, vec!["rtmp://host/app/key"]);
        assert!(parsed.remove_output_urls.is_empty());
    }
}
