//! Sidecar persistence: `<part>.json` companion enabling resume.
//!
//! Writes are atomic-replace (temp file, fsync, rename) and coalesced to at
//! most one per interval per job, with a forced write before any terminal
//! transition. A corrupt or mismatched sidecar is treated as absent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::planner::{covers_exactly, Segment};

/// Suffix appended to the part path.
pub const SIDECAR_SUFFIX: &str = ".json";

/// `<part>.json` for a part path.
pub fn sidecar_path_for(part_path: &Path) -> PathBuf {
    let mut name = part_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    part_path.with_file_name(name)
}

/// Persisted per-job resume state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub url: String,
    pub total_bytes: u64,
    pub content_type: String,
    /// Epoch seconds of the last committed write.
    pub last_update: f64,
    pub segments: Vec<Segment>,
}

impl SidecarRecord {
    pub fn new(url: &str, total_bytes: u64, content_type: &str, segments: Vec<Segment>) -> Self {
        Self {
            url: url.to_string(),
            total_bytes,
            content_type: content_type.to_string(),
            last_update: epoch_seconds(),
            segments,
        }
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Per-job sidecar store with write throttling and a non-reentrant guard.
pub struct SidecarStore {
    path: PathBuf,
    min_interval: Duration,
    /// Guard against concurrent rename-over on filesystems where replace
    /// fails under contention; a contending writer skips its turn.
    write_guard: Mutex<Option<Instant>>,
}

impl SidecarStore {
    pub fn new(path: PathBuf, min_interval: Duration) -> Self {
        Self {
            path,
            min_interval,
            write_guard: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Throttled write. Skips silently when another worker holds the guard
    /// (the holder's write already reflects newer state) or when the last
    /// committed write is fresher than the interval. Write failures are
    /// logged, not fatal; a later tick retries.
    pub fn maybe_write(&self, record: &SidecarRecord) {
        self.maybe_write_with(|| record.clone());
    }

    /// Like `maybe_write`, but only builds the record once the throttle and
    /// guard have agreed a write will happen. Workers call this per chunk;
    /// snapshotting the segment table on every skipped call would be waste.
    pub fn maybe_write_with<F>(&self, build: F)
    where
        F: FnOnce() -> SidecarRecord,
    {
        let Ok(mut last) = self.write_guard.try_lock() else {
            return;
        };
        if let Some(at) = *last {
            if at.elapsed() < self.min_interval {
                return;
            }
        }
        match self.write_atomic(&build()) {
            Ok(()) => *last = Some(Instant::now()),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "sidecar write failed"),
        }
    }

    /// Unthrottled write, used for the final state before reporting a
    /// terminal status. Blocks on the guard instead of skipping.
    pub fn write_now(&self, record: &SidecarRecord) -> Result<()> {
        let mut last = self.write_guard.lock().unwrap();
        self.write_atomic(record)?;
        *last = Some(Instant::now());
        Ok(())
    }

    fn write_atomic(&self, record: &SidecarRecord) -> Result<()> {
        let mut record = record.clone();
        record.last_update = epoch_seconds();
        let bytes = serde_json::to_vec(&record).context("serialize sidecar")?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(&bytes).context("write sidecar tmp")?;
            f.sync_all().context("fsync sidecar tmp")?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} over {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    /// Load the record, if one exists and decodes cleanly. A corrupt or
    /// internally inconsistent sidecar is deleted and reported absent.
    pub fn load(&self) -> Option<SidecarRecord> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "sidecar unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<SidecarRecord>(&bytes) {
            Ok(record) if covers_exactly(&record.segments, record.total_bytes) => Some(record),
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "sidecar segments inconsistent, discarding");
                let _ = fs::remove_file(&self.path);
                None
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "sidecar corrupt, discarding");
                let _ = fs::remove_file(&self.path);
                None
            }
        }
    }

    /// True when a stored record exists and was written for `url`.
    pub fn matches_url(&self, url: &str) -> bool {
        self.load().map(|r| r.url == url).unwrap_or(false)
    }

    /// Delete the sidecar (successful completion or cancel).
    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "sidecar remove failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan_segments;

    fn store(dir: &Path) -> SidecarStore {
        SidecarStore::new(dir.join("f.bin.part.json"), Duration::ZERO)
    }

    #[test]
    fn sidecar_path_appends_json() {
        assert_eq!(
            sidecar_path_for(Path::new("/d/f.bin.part")),
            PathBuf::from("/d/f.bin.part.json")
        );
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut segments = plan_segments(1000, 4);
        segments[1].written = 77;
        let record = SidecarRecord::new("https://example.com/f.bin", 1000, "video/mp4", segments.clone());
        store.write_now(&record).unwrap();

        let loaded = store.load().expect("record present");
        assert_eq!(loaded.url, "https://example.com/f.bin");
        assert_eq!(loaded.total_bytes, 1000);
        assert_eq!(loaded.content_type, "video/mp4");
        assert_eq!(loaded.segments, segments);
        assert!(loaded.last_update > 0.0);
    }

    #[test]
    fn missing_sidecar_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load().is_none());
    }

    #[test]
    fn corrupt_sidecar_deleted_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn inconsistent_segments_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        // gap between segments: offsets 0..10 then 20..30 claiming total 30
        fs::write(
            store.path(),
            br#"{"url":"https://e.com/f","total_bytes":30,"content_type":"","last_update":1.0,
                "segments":[{"offset":0,"length":10,"written":0},{"offset":20,"length":10,"written":0}]}"#,
        )
        .unwrap();
        assert!(store.load().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn url_match_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = SidecarRecord::new("https://example.com/a", 10, "", plan_segments(10, 1));
        store.write_now(&record).unwrap();
        assert!(store.matches_url("https://example.com/a"));
        assert!(!store.matches_url("https://example.com/b"));
    }

    #[test]
    fn throttle_coalesces_rapid_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SidecarStore::new(dir.path().join("f.part.json"), Duration::from_secs(60));
        let mut record = SidecarRecord::new("https://example.com/f", 10, "", plan_segments(10, 1));
        store.maybe_write(&record);
        let first = store.load().expect("first write landed");

        record.segments[0].written = 9;
        store.maybe_write(&record); // inside the interval: skipped
        let second = store.load().expect("still present");
        assert_eq!(second.segments[0].written, first.segments[0].written);

        store.write_now(&record).unwrap(); // forced final write
        assert_eq!(store.load().unwrap().segments[0].written, 9);
    }

    #[test]
    fn remove_is_quiet_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.remove();
        store.remove();
    }
}
