//! The `.part` file: preallocated, positionally written, renamed on success.
//!
//! All of a job's workers share one open handle and write with pwrite-style
//! positional I/O, so no cursor races. Administrative operations (truncate,
//! preallocate, rename) go through the per-job file-ops mutex; per-chunk
//! writes do not need it.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Suffix appended to the final filename while a download is in progress.
pub const PART_SUFFIX: &str = ".part";

/// `<final>.part` for a destination path.
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    final_path.with_file_name(name)
}

/// Shared handle to a job's part file. Clone freely across worker threads;
/// `write_at` needs no lock, the ops mutex serializes everything else.
#[derive(Clone)]
pub struct PartFile {
    file: Arc<File>,
    path: PathBuf,
    ops: Arc<Mutex<()>>,
}

impl PartFile {
    /// Open (or create) the part file in read+write mode without truncating,
    /// so existing bytes survive for resume.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create download dir {}", parent.display()))?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open part file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            ops: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Preallocate to `size` bytes. Tries `posix_fallocate` for real block
    /// allocation, falling back to `set_len` (sparse is acceptable).
    pub fn preallocate(&self, size: u64) -> Result<()> {
        let _ops = self.ops.lock().unwrap();
        #[cfg(unix)]
        {
            let r = unsafe { libc::posix_fallocate(self.file.as_raw_fd(), 0, size as libc::off_t) };
            if r == 0 {
                return Ok(());
            }
            tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        }
        self.file
            .set_len(size)
            .with_context(|| format!("preallocate {} bytes", size))?;
        Ok(())
    }

    /// Write `data` at `offset` without moving any shared cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let n = self.file.write_at(&data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write_at returned 0",
                ));
            }
            written += n;
        }
        Ok(())
    }

    /// Non-Unix fallback: seek + write on a cloned descriptor.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    /// Flush file data to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("part file sync failed")?;
        Ok(())
    }

    /// Rename the part file to `final_path`, retrying once since the rename
    /// can transiently fail while another handle is closing.
    pub fn finalize(self, final_path: &Path) -> Result<()> {
        let _ops = self.ops.lock().unwrap();
        match std::fs::rename(&self.path, final_path) {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(error = %first, "rename failed, retrying once");
                std::thread::sleep(std::time::Duration::from_millis(100));
                std::fs::rename(&self.path, final_path).with_context(|| {
                    format!(
                        "rename {} to {}",
                        self.path.display(),
                        final_path.display()
                    )
                })
            }
        }
    }

    /// Delete the part file (cancel, or discarding a mismatched resume).
    pub fn remove(&self) -> Result<()> {
        let _ops = self.ops.lock().unwrap();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path_for(Path::new("/tmp/video.mp4")),
            PathBuf::from("/tmp/video.mp4.part")
        );
    }

    #[test]
    fn positional_writes_land_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin.part");
        let part = PartFile::open(&path).unwrap();
        part.preallocate(8).unwrap();
        part.write_at(4, b"BBBB").unwrap();
        part.write_at(0, b"AAAA").unwrap();
        part.sync().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"AAAABBBB");
    }

    #[test]
    fn open_preserves_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin.part");
        std::fs::write(&path, b"keepme").unwrap();
        let part = PartFile::open(&path).unwrap();
        part.write_at(0, b"K").unwrap();
        drop(part);
        assert_eq!(std::fs::read(&path).unwrap(), b"Keepme");
    }

    #[test]
    fn finalize_renames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin.part");
        let final_path = dir.path().join("f.bin");
        let part = PartFile::open(&path).unwrap();
        part.write_at(0, b"done").unwrap();
        part.finalize(&final_path).unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"done");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin.part");
        let part = PartFile::open(&path).unwrap();
        part.remove().unwrap();
        part.remove().unwrap();
        assert!(!path.exists());
    }
}
