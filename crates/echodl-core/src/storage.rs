//! Destination file lifecycle.
//!
//! Downloads are written to a preallocated `.part` file next to the final
//! destination. Writes are positional (pwrite) so workers on disjoint ranges
//! never contend; `sync` flushes to disk before finalize renames the temp
//! file into place atomically.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Temporary file suffix used before atomic rename.
pub const PART_SUFFIX: &str = ".part";

/// Path of the temp file for `final_path` (`file.iso` -> `file.iso.part`).
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(PART_SUFFIX);
    PathBuf::from(os)
}

/// A `.part` download file supporting concurrent positional writes.
///
/// Cloning is cheap; clones share the same file handle and every `write_at`
/// is independent of the others.
#[derive(Debug, Clone)]
pub struct PartFile {
    file: Arc<File>,
    path: PathBuf,
}

impl PartFile {
    /// Create a fresh part file, truncating any previous one, preallocated to
    /// `size` bytes when the size is known.
    pub fn create(path: &Path, size: Option<u64>) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create part file {}", path.display()))?;
        let part = PartFile {
            file: Arc::new(file),
            path: path.to_path_buf(),
        };
        if let Some(size) = size {
            part.preallocate(size)?;
        }
        Ok(part)
    }

    /// Open an existing part file for resume (no truncation). The file must
    /// have been created (and preallocated) by an earlier run.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open part file {}", path.display()))?;
        Ok(PartFile {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Preallocate `size` bytes. On Unix tries `posix_fallocate` for real
    /// block allocation, falling back to `set_len`.
    fn preallocate(&self, size: u64) -> Result<()> {
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
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

    /// Write `data` at `offset` without moving any shared cursor; safe for
    /// concurrent use on disjoint ranges.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let n = self.file.write_at(data, offset)?;
        if n != data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {} of {}", n, data.len()),
            ));
        }
        Ok(())
    }

    /// Seek-and-write fallback for non-Unix targets. Not safe for concurrent
    /// use; segmented mode is Unix-only in practice.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    /// Flush file data to disk. Call before `finalize` for durability.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("part file sync failed")?;
        Ok(())
    }

    /// Path of the part file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically rename the part file onto `final_path`. Consumes the handle
    /// so the file is closed first. Call `sync` beforehand for durability.
    pub fn finalize(self, final_path: &Path) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::rename(&path, final_path).with_context(|| {
            format!("rename {} to {}", path.display(), final_path.display())
        })?;
        Ok(())
    }

    /// Delete the part file (cancel with cleanup). Consumes the handle.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::remove_file(&path)
            .with_context(|| format!("remove part file {}", path.display()))?;
        Ok(())
    }
}
