use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

static INIT_ONCE: std::sync::Once = std::sync::Once::new();

pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

/// Atomically replace `dest` with `tmp`.
pub fn replace_file_atomic(tmp: &Path, dest: &Path) -> Result<()> {
    fs::rename(tmp, dest)
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))
}

/// Single-instance lockfile holding our pid. A leftover lock from a dead
/// process is reclaimed; a live one refuses startup. Dropped on shutdown.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<LockFile> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    use std::io::Write;
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(LockFile { path: path.to_path_buf() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(path).unwrap_or_default();
                    if let Ok(pid) = holder.trim().parse::<u32>() {
                        if Path::new(&format!("/proc/{pid}")).exists() {
                            bail!(
                                "another capture process (pid {pid}) holds {}",
                                path.display()
                            );
                        }
                    }
                    // Stale lock from a dead process.
                    tracing::warn!(path = %path.display(), "reclaiming stale capture lock");
                    let _ = fs::remove_file(path);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("create lockfile {}", path.display()))
                }
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockfile_excludes_second_holder_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.lock");
        let lock = LockFile::acquire(&path).unwrap();
        assert!(LockFile::acquire(&path).is_err());
        drop(lock);
        assert!(!path.exists());
        let _relock = LockFile::acquire(&path).unwrap();
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.lock");
        // A pid that can't be running.
        fs::write(&path, "4194304").unwrap();
        let _lock = LockFile::acquire(&path).unwrap();
    }
}
