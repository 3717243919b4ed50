use std::fs::File;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use m3u8_rs::{MediaPlaylist, MediaPlaylistType, MediaSegment};

use crate::errors::Result;

/// Incrementally written live HLS playlist. Only the segment upload worker
/// holds one, so updates need no locking.
pub struct PlaylistWriter {
    path: PathBuf,
    playlist: MediaPlaylist,
    /// Wall clock of the first sample, anchors EXT-X-PROGRAM-DATE-TIME
    start_date: Option<DateTime<Utc>>,
    /// Pipeline running time of the first segment
    first_running_time: Option<u64>,
}

impl PlaylistWriter {
    pub fn new(path: PathBuf, target_duration: u32) -> Self {
        let mut playlist = MediaPlaylist::default();
        playlist.version = Some(4);
        playlist.target_duration = target_duration as u64;
        playlist.playlist_type = Some(MediaPlaylistType::Event);
        playlist.media_sequence = 0;
        playlist.end_list = false;
        Self {
            path,
            playlist,
            start_date: None,
            first_running_time: None,
        }
    }

    pub fn set_start_date(&mut self, date: DateTime<Utc>) {
        self.start_date = Some(date);
        self.reanchor();
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    /// Append a segment and rewrite the local playlist file. Segments appear
    /// in exactly the order this is called.
    pub fn add_segment(&mut self, uri: String, duration: f64, running_time: u64) -> Result<()> {
        if self.first_running_time.is_none() {
            self.first_running_time = Some(running_time);
        }

        let program_date_time = self.program_date_time(running_time);
        self.playlist.segments.push(MediaSegment {
            uri,
            duration: duration as f32,
            program_date_time,
            ..MediaSegment::default()
        });
        self.write()
    }

    /// Write the end tag; the playlist is complete after this.
    pub fn finalize(&mut self) -> Result<()> {
        self.playlist.end_list = true;
        self.write()
    }

    pub fn segment_count(&self) -> u64 {
        self.segments().count() as u64
    }

    pub fn segment_uris(&self) -> impl Iterator<Item = &str> {
        self.segments().map(|s| s.uri.as_str())
    }

    fn segments(&self) -> impl Iterator<Item = &MediaSegment> {
        self.playlist.segments.iter()
    }

    fn program_date_time(
        &self,
        running_time: u64,
    ) -> Option<DateTime<chrono::FixedOffset>> {
        let start = self.start_date?;
        let first = self.first_running_time?;
        let offset = Duration::nanoseconds(running_time.saturating_sub(first) as i64);
        Some((start + offset).fixed_offset())
    }

    /// The start date can arrive after the first segments were written;
    /// recompute their date tags when it does.
    fn reanchor(&mut self) {
        let Some(start) = self.start_date else {
            return;
        };
        let mut elapsed = Duration::zero();
        for segment in &mut self.playlist.segments {
            segment.program_date_time = Some((start + elapsed).fixed_offset());
            elapsed = elapsed + Duration::nanoseconds((segment.duration as f64 * 1e9) as i64);
        }
    }

    fn write(&self) -> Result<()> {
        let mut out = File::create(&self.path)?;
        self.playlist.write_to(&mut out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn writer(dir: &tempfile::TempDir) -> PlaylistWriter {
        PlaylistWriter::new(dir.path().join("playlist.m3u8"), 6)
    }

    #[test]
    fn test_segments_keep_enqueue_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        for i in 0..5u64 {
            w.add_segment(format!("seg_{i}.ts"), 6.0, i * 6_000_000_000)
                .unwrap();
        }

        let uris: Vec<&str> = w.segment_uris().collect();
        assert_eq!(uris, vec!["seg_0.ts", "seg_1.ts", "seg_2.ts", "seg_3.ts", "seg_4.ts"]);

        let contents = std::fs::read_to_string(dir.path().join("playlist.m3u8")).unwrap();
        let first = contents.find("seg_0.ts").unwrap();
        let last = contents.find("seg_4.ts").unwrap();
        assert!(first < last);
        assert!(!contents.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_finalize_writes_end_tag() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        w.add_segment("seg_0.ts".to_string(), 6.0, 0).unwrap();
        w.finalize().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("playlist.m3u8")).unwrap();
        assert!(contents.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_program_date_time_anchored_to_start_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 12, 34, 56).unwrap();
        w.set_start_date(start);

        w.add_segment("seg_0.ts".to_string(), 6.0, 1_000_000_000).unwrap();
        w.add_segment("seg_1.ts".to_string(), 6.0, 7_000_000_000).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("playlist.m3u8")).unwrap();
        assert!(contents.contains("#EXT-X-PROGRAM-DATE-TIME:2024-01-02T12:34:56"));
    }

    #[test]
    fn test_late_start_date_reanchors_existing_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        w.add_segment("seg_0.ts".to_string(), 6.0, 0).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        w.set_start_date(start);
        w.add_segment("seg_1.ts".to_string(), 6.0, 6_000_000_000).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("playlist.m3u8")).unwrap();
        assert!(contents.contains("#EXT-X-PROGRAM-DATE-TIME:2024-01-02T12:00:00"));
        assert!(contents.contains("#EXT-X-PROGRAM-DATE-TIME:2024-01-02T12:00:06"));
    }
}
