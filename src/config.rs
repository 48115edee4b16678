use std::path::{Path, PathBuf};

pub const DEFAULT_MTU: u32 = 65_536;
pub const DEFAULT_BUCKET_BYTES: usize = 256 * 1024 * 1024;
pub const DEFAULT_OUTFILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Capture pipeline options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    /// Base data directory; capture files and indexes land under
    /// `<base>/capture/`.
    pub base_dir: PathBuf,
    /// Offline pcap files to ingest.
    pub input_files: Vec<PathBuf>,
    /// Maximum expected packet size. Chains seal early enough that a
    /// full-MTU packet always fits the output file.
    pub mtu: u32,
    /// Bytes per bucket.
    pub bucket_bytes: usize,
    /// Bucket pool size. `None` sizes the pool from available memory.
    pub bucket_count: Option<usize>,
    /// Target size of each FCAP capture file.
    pub outfile_size: u64,
    pub indexer_threads: Option<usize>,
    pub writer_threads: Option<usize>,
    /// Capture slots per disk before the oldest is reclaimed.
    pub max_slots_per_disk: u64,
    pub progress: bool,
    /// Status file refresh period, seconds.
    pub status_period_secs: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/flowcap"),
            input_files: Vec::new(),
            mtu: DEFAULT_MTU,
            bucket_bytes: DEFAULT_BUCKET_BYTES,
            bucket_count: None,
            outfile_size: DEFAULT_OUTFILE_SIZE,
            indexer_threads: None,
            writer_threads: None,
            max_slots_per_disk: 1024,
            progress: true,
            status_period_secs: 5,
        }
    }
}

impl CaptureOptions {
    pub fn with_base_dir(mut self, base: impl AsRef<Path>) -> Self {
        self.base_dir = base.as_ref().to_path_buf();
        self
    }
    pub fn with_input_file(mut self, path: impl AsRef<Path>) -> Self {
        self.input_files.push(path.as_ref().to_path_buf());
        self
    }
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu.max(64);
        self
    }
    pub fn with_bucket_bytes(mut self, bytes: usize) -> Self {
        self.bucket_bytes = bytes.max(64 * 1024);
        self
    }
    pub fn with_bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = Some(count.max(1));
        self
    }
    pub fn with_outfile_size(mut self, bytes: u64) -> Self {
        self.outfile_size = bytes.max(1024 * 1024);
        self
    }
    pub fn with_indexer_threads(mut self, n: usize) -> Self {
        self.indexer_threads = Some(n.max(1));
        self
    }
    pub fn with_writer_threads(mut self, n: usize) -> Self {
        self.writer_threads = Some(n.max(1));
        self
    }
    pub fn with_max_slots_per_disk(mut self, n: u64) -> Self {
        self.max_slots_per_disk = n.max(1);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
}

/// Index/output worker defaults scale with the machine: `1 + cpus × 3/8`
/// per stage.
pub fn stage_thread_limit(cpus: usize) -> usize {
    1 + cpus * 3 / 8
}

/// Search engine options.
#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub base_dir: PathBuf,
    /// Worker pool size for per-interval tasks.
    pub threads: usize,
    /// Also materialize matching packets into per-interval pcap files.
    pub fetch_pcap: bool,
    pub progress: bool,
    /// Largest residual subtree read in one gulp during index descent.
    pub tree_read_buffer: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/flowcap"),
            threads: 4,
            fetch_pcap: false,
            progress: true,
            tree_read_buffer: 1024 * 1024,
        }
    }
}

impl SearchOptions {
    pub fn with_base_dir(mut self, base: impl AsRef<Path>) -> Self {
        self.base_dir = base.as_ref().to_path_buf();
        self
    }
    pub fn with_threads(mut self, n: usize) -> Self {
        self.threads = n.clamp(1, 64);
        self
    }
    pub fn with_fetch_pcap(mut self, yes: bool) -> Self {
        self.fetch_pcap = yes;
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_tree_read_buffer(mut self, bytes: usize) -> Self {
        self.tree_read_buffer = bytes.max(4096);
        self
    }
}
