use crate::util::replace_file_atomic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const STATUS_FILE_NAME: &str = "status";
pub const STATUS_TMP_NAME: &str = ".status";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Idle,
    Working,
    Shutdown,
}

impl ThreadStatus {
    fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Idle => "idle",
            ThreadStatus::Working => "working",
            ThreadStatus::Shutdown => "shutdown",
        }
    }
}

/// A worker's published state; cheap enough to flip around every queue
/// pop.
#[derive(Clone, Default)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, st: ThreadStatus) {
        self.0.store(st as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> ThreadStatus {
        match self.0.load(Ordering::Relaxed) {
            0 => ThreadStatus::Idle,
            1 => ThreadStatus::Working,
            _ => ThreadStatus::Shutdown,
        }
    }
}

/// Periodic JSON status file: per-thread states plus pipeline queue
/// depths, written via temp file + rename.
pub struct StatusWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    period: Duration,
    last: Instant,
}

impl StatusWriter {
    pub fn new(dir: &Path, period: Duration) -> Self {
        Self {
            path: dir.join(STATUS_FILE_NAME),
            tmp_path: dir.join(STATUS_TMP_NAME),
            period,
            // Make the first write immediate.
            last: Instant::now() - Duration::from_secs(3600),
        }
    }

    /// Write the status file if the period has elapsed.
    pub fn maybe_write(
        &mut self,
        capture_done: &[bool],
        indexers: &[StatusCell],
        writers: &[StatusCell],
        ready_depth: usize,
        filled_depth: usize,
        indexed_depth: usize,
    ) {
        if self.last.elapsed() < self.period {
            return;
        }
        self.last = Instant::now();

        let doc = serde_json::json!({
            "capture_done": capture_done,
            "index_threads": indexers.iter().map(|c| c.get().as_str()).collect::<Vec<_>>(),
            "output_threads": writers.iter().map(|c| c.get().as_str()).collect::<Vec<_>>(),
            "queued_ready_bkts": ready_depth,
            "queued_filled_bkts": filled_depth,
            "queued_indexed_bkts": indexed_depth,
        });

        let write = || -> anyhow::Result<()> {
            std::fs::write(&self.tmp_path, serde_json::to_vec_pretty(&doc)?)?;
            replace_file_atomic(&self.tmp_path, &self.path)
        };
        if let Err(e) = write() {
            tracing::warn!(error = %format!("{e:#}"), "could not write status file");
        }
    }
}
