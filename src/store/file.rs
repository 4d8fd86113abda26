//! Crash-safe file primitives for the store
//!
//! Writes go to a fresh temporary file in the target directory, are fsynced
//! and renamed over the target while an exclusive advisory lock is held on
//! `<target>.lock`. The directory is fsynced after the rename.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sibling lock file used to serialize writers across processes
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Atomically replace `path` with `contents`
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir)?;

    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(lock_path(path))?;
    // Released when the guard drops
    let _lock = Flock::lock(lock_file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| io::Error::from(errno))?;

    let tmp_path = temp_path(&dir);
    if let Err(e) = write_synced(&tmp_path, contents).and_then(|()| fs::rename(&tmp_path, path)) {
        if let Err(cleanup) = fs::remove_file(&tmp_path) {
            debug!("Failed to remove {}: {}", tmp_path.display(), cleanup);
        }
        return Err(e);
    }

    if let Err(e) = File::open(&dir).and_then(|d| d.sync_all()) {
        warn!("Failed to sync directory {}: {}", dir.display(), e);
    }
    Ok(())
}

/// Copy a corrupt file to `<path>.bak.<unix-seconds>`
pub fn backup_corrupt(path: &Path) -> io::Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak.{}", chrono::Utc::now().timestamp()));
    let backup = PathBuf::from(name);
    fs::copy(path, &backup)?;
    Ok(backup)
}

fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn temp_path(dir: &Path) -> PathBuf {
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".udpu-{}-{}.tmp", std::process::id(), seq))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
