use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{EgressError, Result};
use crate::request::EgressRequest;
use crate::util::unix_nanos_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EgressStatus {
    Starting,
    Active,
    Ending,
    Complete,
    Failed,
    Aborted,
}

impl EgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EgressStatus::Complete | EgressStatus::Failed | EgressStatus::Aborted
        )
    }

    fn rank(&self) -> u8 {
        match self {
            EgressStatus::Starting => 0,
            EgressStatus::Active => 1,
            EgressStatus::Ending => 2,
            EgressStatus::Complete | EgressStatus::Failed | EgressStatus::Aborted => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Active,
    Finished,
    Failed,
}

/// Per-url state of a stream output. The url is stored redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResult {
    pub url: String,
    pub state: StreamState,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileResult {
    pub filename: String,
    #[serde(default)]
    pub duration_ns: i64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentsResult {
    pub playlist_name: String,
    #[serde(default)]
    pub playlist_location: String,
    #[serde(default)]
    pub segment_count: u64,
    #[serde(default)]
    pub duration_ns: i64,
    #[serde(default)]
    pub size: u64,
    /// Wall clock of the first sample, used as the playlist date anchor
    #[serde(default)]
    pub started_at: i64,
}

/// Externally visible job status. `updated_at` never decreases and
/// `ended_at` is set exactly once, by the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressInfo {
    pub egress_id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub room_name: String,
    pub request: EgressRequest,
    pub status: EgressStatus,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub ended_at: i64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub file: Option<FileResult>,
    #[serde(default)]
    pub streams: Vec<StreamResult>,
    #[serde(default)]
    pub segments: Option<SegmentsResult>,
}

impl EgressInfo {
    pub fn new(egress_id: String, room_id: String, request: EgressRequest) -> Self {
        Self {
            egress_id,
            room_id,
            room_name: String::new(),
            request,
            status: EgressStatus::Starting,
            started_at: 0,
            updated_at: unix_nanos_now(),
            ended_at: 0,
            error: String::new(),
            file: None,
            streams: Vec::new(),
            segments: None,
        }
    }

    /// Bump `updated_at`, keeping it non-decreasing.
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(unix_nanos_now());
    }

    /// Set `updated_at` from an externally observed start moment (SDK first
    /// frame). Still never moves backwards.
    pub fn touch_at(&mut self, nanos: i64) {
        self.updated_at = self.updated_at.max(nanos);
    }

    /// Advance to a non-terminal status. Regressions are ignored, which makes
    /// concurrent callers safe: the first transition wins.
    pub fn advance(&mut self, status: EgressStatus) {
        debug_assert!(!status.is_terminal(), "use finish() for terminal status");
        if status.rank() > self.status.rank() {
            debug!("egress {} -> {:?}", self.egress_id, status);
            self.status = status;
        }
        self.touch();
    }

    /// Terminal transition. The first call wins; later calls are no-ops so
    /// exactly one terminal update is ever produced.
    pub fn finish(&mut self, status: EgressStatus, error: Option<&EgressError>) {
        debug_assert!(status.is_terminal());
        if self.ended_at != 0 {
            return;
        }
        self.status = status;
        if let Some(e) = error {
            if self.error.is_empty() {
                self.error = e.to_string();
            }
        }
        self.touch();
        self.ended_at = self.updated_at;
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at != 0
    }
}

/// Receiver of status updates, implemented by the dispatcher side.
#[async_trait]
pub trait InfoClient: Send + Sync {
    async fn update_egress_info(&self, info: &EgressInfo) -> Result<()>;
}

/// Posts every update as JSON to a webhook endpoint.
pub struct WebhookInfoClient {
    url: String,
    client: reqwest::Client,
}

impl WebhookInfoClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InfoClient for WebhookInfoClient {
    async fn update_egress_info(&self, info: &EgressInfo) -> Result<()> {
        self.client
            .post(&self.url)
            .json(info)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Drops updates; used when no dispatcher is attached.
#[derive(Default)]
pub struct NullInfoClient;

#[async_trait]
impl InfoClient for NullInfoClient {
    async fn update_egress_info(&self, info: &EgressInfo) -> Result<()> {
        warn!(
            "dropping status update for {} ({:?})",
            info.egress_id, info.status
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{EgressRequest, RoomCompositeRequest};

    fn info() -> EgressInfo {
        EgressInfo::new(
            "EG_abc".to_string(),
            "RM_xyz".to_string(),
            EgressRequest::RoomComposite(RoomCompositeRequest::default()),
        )
    }

    #[test]
    fn test_updated_at_is_monotonic() {
        let mut i = info();
        let mut last = i.updated_at;
        for status in [EgressStatus::Active, EgressStatus::Ending] {
            i.advance(status);
            assert!(i.updated_at >= last);
            last = i.updated_at;
        }
        // external anchor in the past cannot move updated_at backwards
        i.touch_at(1);
        assert!(i.updated_at >= last);
    }

    #[test]
    fn test_status_never_regresses() {
        let mut i = info();
        i.advance(EgressStatus::Ending);
        i.advance(EgressStatus::Active);
        assert_eq!(i.status, EgressStatus::Ending);
    }

    #[test]
    fn test_single_terminal_update() {
        let mut i = info();
        i.advance(EgressStatus::Active);
        i.finish(
            EgressStatus::Failed,
            Some(&EgressError::Pipeline("sink died".to_string())),
        );
        let ended = i.ended_at;
        let error = i.error.clone();
        assert_ne!(ended, 0);
        assert_eq!(i.status, EgressStatus::Failed);

        // a later COMPLETE must not overwrite the terminal state
        i.finish(EgressStatus::Complete, None);
        assert_eq!(i.status, EgressStatus::Failed);
        assert_eq!(i.ended_at, ended);
        assert_eq!(i.error, error);
    }
}
