use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SegmentConfig;
use crate::errors::{EgressError, Result};
use crate::info::SegmentsResult;
use crate::request::SegmentSuffix;
use crate::sink::playlist::PlaylistWriter;
use crate::upload::{self, Uploader};

const SEGMENT_MIME: &str = "video/mp2t";
const PLAYLIST_MIME: &str = "application/x-mpegurl";

/// Commands consumed by the single upload worker. The queue exists to keep
/// `SegmentsResult` single-writer and to guarantee playlists reach storage in
/// enqueue order, so an older playlist can never overwrite a newer one.
enum SegmentCommand {
    Start {
        path: String,
        running_time: u64,
    },
    Closed {
        path: String,
        running_time: u64,
    },
    StartDate {
        date: DateTime<Utc>,
    },
    Finalize {
        reply: oneshot::Sender<SegmentsResult>,
    },
}

/// HLS output: time-bounded segments cut by the split-muxer, a live playlist,
/// and a serial upload queue.
pub struct SegmentSink {
    namer: SegmentNamer,
    tx: mpsc::UnboundedSender<SegmentCommand>,
    worker: Option<JoinHandle<()>>,
}

impl SegmentSink {
    pub fn new(
        conf: &SegmentConfig,
        result: SegmentsResult,
        failure_tx: mpsc::UnboundedSender<EgressError>,
    ) -> Result<Self> {
        let uploader = match &conf.upload {
            Some(target) => Some(upload::from_target(target)?),
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SegmentWorker {
            conf: conf.clone(),
            uploader,
            playlist: PlaylistWriter::new(conf.local_playlist_path(), conf.segment_duration),
            result,
            open: HashMap::new(),
            closed: HashSet::new(),
            failure_tx,
        };
        let handle = tokio::spawn(worker.run(rx));

        Ok(Self {
            namer: SegmentNamer::new(conf),
            tx,
            worker: Some(handle),
        })
    }

    pub fn namer(&self) -> SegmentNamer {
        self.namer.clone()
    }

    /// Record the split-muxer opening a new fragment.
    pub fn start_segment(&self, path: &str, running_time: u64) -> Result<()> {
        self.tx
            .send(SegmentCommand::Start {
                path: path.to_string(),
                running_time,
            })
            .map_err(|_| EgressError::PipelineClosed)
    }

    /// Queue a closed fragment for upload and playlist publication.
    pub fn enqueue_segment_upload(&self, path: &str, running_time: u64) -> Result<()> {
        self.tx
            .send(SegmentCommand::Closed {
                path: path.to_string(),
                running_time,
            })
            .map_err(|_| EgressError::PipelineClosed)
    }

    /// Anchor the playlist's program-date-time on the first sample's wall
    /// clock.
    pub fn update_start_date(&self, date: DateTime<Utc>) {
        let _ = self.tx.send(SegmentCommand::StartDate { date });
    }

    /// Drain the queue, write the end tag, upload the final playlist and
    /// return the accumulated result.
    pub async fn close(&mut self) -> Result<SegmentsResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SegmentCommand::Finalize { reply: reply_tx })
            .map_err(|_| EgressError::PipelineClosed)?;
        let result = reply_rx.await.map_err(|_| EgressError::PipelineClosed)?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        Ok(result)
    }
}

struct SegmentWorker {
    conf: SegmentConfig,
    uploader: Option<Arc<dyn Uploader>>,
    playlist: PlaylistWriter,
    result: SegmentsResult,
    /// Fragment path -> running time at open
    open: HashMap<String, u64>,
    /// Fragments already published, for idempotence
    closed: HashSet<String>,
    failure_tx: mpsc::UnboundedSender<EgressError>,
}

impl SegmentWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SegmentCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SegmentCommand::Start { path, running_time } => {
                    // replays of the same fragment keep the first timestamp
                    self.open.entry(path).or_insert(running_time);
                }
                SegmentCommand::Closed { path, running_time } => {
                    if !self.closed.insert(path.clone()) {
                        debug!("segment {path} already published");
                        continue;
                    }
                    if let Err(e) = self.publish_segment(&path, running_time).await {
                        error!("failed to publish segment {path}: {e}");
                        let _ = self.failure_tx.send(e);
                    }
                }
                SegmentCommand::StartDate { date } => {
                    self.playlist.set_start_date(date);
                    self.result.started_at = date.timestamp_nanos_opt().unwrap_or(0);
                }
                SegmentCommand::Finalize { reply } => {
                    if let Err(e) = self.finalize().await {
                        error!("failed to finalize playlist: {e}");
                        let _ = self.failure_tx.send(e);
                    }
                    let _ = reply.send(self.result.clone());
                    return;
                }
            }
        }
    }

    async fn publish_segment(&mut self, path: &str, close_time: u64) -> Result<()> {
        let filename = Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());

        let start_time = match self.open.remove(path) {
            Some(t) => t,
            None => {
                warn!("segment {filename} closed without a recorded open");
                close_time.saturating_sub(self.conf.segment_duration as u64 * 1_000_000_000)
            }
        };
        let duration = close_time.saturating_sub(start_time) as f64 / 1e9;

        // timestamp-suffixed filenames carry their own wall-clock anchor
        if self.playlist.start_date().is_none() && self.conf.suffix == SegmentSuffix::Timestamp {
            if let Some(date) = parse_segment_timestamp(&filename) {
                self.playlist.set_start_date(date);
                self.result.started_at = date.timestamp_nanos_opt().unwrap_or(0);
            }
        }

        let local = PathBuf::from(path);
        let size = tokio::fs::metadata(&local).await.map(|m| m.len()).unwrap_or(0);

        if let Some(uploader) = &self.uploader {
            let storage = format!("{}{}", self.conf.storage_dir, filename);
            uploader.upload(&local, &storage, SEGMENT_MIME).await?;
        }

        self.playlist
            .add_segment(filename.clone(), duration, start_time)?;
        self.result.segment_count += 1;
        self.result.duration_ns += (duration * 1e9) as i64;
        self.result.size += size;

        self.upload_playlist().await?;
        info!(
            "published segment {} [{:.3}s, {} total]",
            filename, duration, self.result.segment_count
        );
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.playlist.finalize()?;
        self.upload_playlist().await?;
        self.result.segment_count = self.playlist.segment_count();
        Ok(())
    }

    async fn upload_playlist(&mut self) -> Result<()> {
        let local = self.conf.local_playlist_path();
        if let Some(uploader) = &self.uploader {
            let storage = self.conf.storage_playlist_path();
            let location = uploader.upload(&local, &storage, PLAYLIST_MIME).await?;
            self.result.playlist_location = location;
        } else {
            self.result.playlist_location = local.to_string_lossy().to_string();
        }
        Ok(())
    }
}

/// Generates fragment filenames for the split-muxer, per the configured
/// suffix policy. Cloned into the muxer's location callback, so it must stay
/// cheap and lock-free.
#[derive(Clone)]
pub struct SegmentNamer {
    dir: PathBuf,
    prefix: String,
    suffix: SegmentSuffix,
    index: Arc<AtomicU64>,
}

impl SegmentNamer {
    fn new(conf: &SegmentConfig) -> Self {
        Self {
            dir: conf.local_dir.clone(),
            prefix: conf.segment_prefix.clone(),
            suffix: conf.suffix,
            index: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next(&self) -> PathBuf {
        let name = match self.suffix {
            SegmentSuffix::Index => {
                let idx = self.index.fetch_add(1, Ordering::Relaxed);
                format!("{}_{}.ts", self.prefix, idx)
            }
            SegmentSuffix::Timestamp => format!(
                "{}_{}.ts",
                self.prefix,
                Local::now().format("%Y%m%d%H%M%S%3f")
            ),
        };
        self.dir.join(name)
    }
}

/// Parse the wall-clock start encoded in a timestamp-suffixed segment name,
/// `<prefix>_YYYYMMDDhhmmssMMM.ts`.
pub fn parse_segment_timestamp(filename: &str) -> Option<DateTime<Utc>> {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"_(\d{14})(\d{3})\.ts$").expect("valid regex"));

    let caps = re.captures(filename)?;
    let naive = chrono::NaiveDateTime::parse_from_str(caps.get(1)?.as_str(), "%Y%m%d%H%M%S").ok()?;
    let datetime = Local.from_local_datetime(&naive).single()?;
    let millis: i64 = caps.get(2)?.as_str().parse().ok()?;
    Some((datetime + chrono::Duration::milliseconds(millis)).with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputType;

    fn conf(dir: &Path, suffix: SegmentSuffix, upload: Option<crate::request::UploadTarget>) -> SegmentConfig {
        SegmentConfig {
            output_type: OutputType::Hls,
            local_dir: dir.to_path_buf(),
            storage_dir: "live/".to_string(),
            playlist_filename: "demo.m3u8".to_string(),
            segment_prefix: "demo".to_string(),
            suffix,
            segment_duration: 6,
            disable_manifest: false,
            upload,
        }
    }

    #[test]
    fn test_index_suffix_counts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let namer = SegmentNamer::new(&conf(dir.path(), SegmentSuffix::Index, None));
        assert_eq!(namer.next(), dir.path().join("demo_0.ts"));
        assert_eq!(namer.next(), dir.path().join("demo_1.ts"));
        assert_eq!(namer.next(), dir.path().join("demo_2.ts"));
    }

    #[test]
    fn test_timestamp_suffix_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let namer = SegmentNamer::new(&conf(dir.path(), SegmentSuffix::Timestamp, None));
        let before = Utc::now() - chrono::Duration::seconds(1);
        let path = namer.next();
        let after = Utc::now() + chrono::Duration::seconds(1);

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let parsed = parse_segment_timestamp(&name).expect("timestamp parses");
        assert!(parsed >= before && parsed <= after, "{parsed} not in [{before}, {after}]");
    }

    #[test]
    fn test_parse_segment_timestamp_rejects_other_names() {
        assert!(parse_segment_timestamp("demo_3.ts").is_none());
        assert!(parse_segment_timestamp("demo_2024010212345.ts").is_none());
        assert!(parse_segment_timestamp("demo_20240102123456123.mp4").is_none());
    }

    #[tokio::test]
    async fn test_playlist_lists_segments_in_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let conf = conf(
            dir.path(),
            SegmentSuffix::Index,
            Some(crate::request::UploadTarget::Prefix {
                dir: storage.path().to_string_lossy().to_string(),
            }),
        );

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        let mut sink = SegmentSink::new(&conf, SegmentsResult::default(), failure_tx).unwrap();

        for i in 0..4u64 {
            let path = dir.path().join(format!("demo_{i}.ts"));
            tokio::fs::write(&path, vec![0u8; 188]).await.unwrap();
            let path = path.to_string_lossy().to_string();
            sink.start_segment(&path, i * 6_000_000_000).unwrap();
            sink.enqueue_segment_upload(&path, (i + 1) * 6_000_000_000)
                .unwrap();
            // duplicate close must not publish twice
            sink.enqueue_segment_upload(&path, (i + 1) * 6_000_000_000)
                .unwrap();
        }

        let result = sink.close().await.unwrap();
        assert!(failure_rx.try_recv().is_err(), "no sink failures expected");
        assert_eq!(result.segment_count, 4);
        assert_eq!(result.duration_ns, 24_000_000_000);

        let playlist = tokio::fs::read_to_string(storage.path().join("live/demo.m3u8"))
            .await
            .unwrap();
        let mut last = 0;
        for i in 0..4 {
            let pos = playlist
                .find(&format!("demo_{i}.ts"))
                .expect("segment listed");
            assert!(pos >= last, "segments out of order");
            last = pos;
        }
        assert!(playlist.contains("#EXT-X-ENDLIST"));

        // every segment object reached storage
        for i in 0..4 {
            assert!(storage.path().join(format!("live/demo_{i}.ts")).exists());
        }
    }
}
