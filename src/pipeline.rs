use crate::bucket::{Bucket, BucketChain};
use crate::capture::{capture_worker, FileSource, PacketSource};
use crate::catalog::{Catalog, FsCatalog};
use crate::config::{stage_thread_limit, CaptureOptions};
use crate::event::Event;
use crate::index::index_chain;
use crate::output::{output_chain, OutputError};
use crate::queue::{PopMode, Queue};
use crate::status::{StatusCell, StatusWriter, ThreadStatus};
use crate::util::{init_tracing_once, LockFile};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long startup may spend assembling the bucket pool.
const MAX_STARTUP_WAIT: Duration = Duration::from_secs(10);

/// Counters published by the pipeline when it finishes.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineReport {
    pub chains_committed: u64,
    pub packets_captured: u64,
    pub packets_dropped: u64,
}

/// The capture-to-queryable-storage pipeline: capture workers feed the
/// filled queue, indexers feed the indexed queue, writers recycle buckets
/// back to ready.
pub struct PacketPipeline {
    opts: CaptureOptions,
}

impl PacketPipeline {
    pub fn new() -> Self {
        Self { opts: CaptureOptions::default() }
    }

    pub fn from_options(opts: CaptureOptions) -> Self {
        Self { opts }
    }

    // -------- Builder methods --------
    pub fn base_dir(mut self, base: impl AsRef<std::path::Path>) -> Self {
        self.opts = self.opts.with_base_dir(base);
        self
    }
    pub fn input_file(mut self, path: impl AsRef<std::path::Path>) -> Self {
        self.opts = self.opts.with_input_file(path);
        self
    }
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.opts = self.opts.with_mtu(mtu);
        self
    }
    pub fn bucket_bytes(mut self, bytes: usize) -> Self {
        self.opts = self.opts.with_bucket_bytes(bytes);
        self
    }
    pub fn bucket_count(mut self, count: usize) -> Self {
        self.opts = self.opts.with_bucket_count(count);
        self
    }
    pub fn outfile_size(mut self, bytes: u64) -> Self {
        self.opts = self.opts.with_outfile_size(bytes);
        self
    }
    pub fn indexer_threads(mut self, n: usize) -> Self {
        self.opts = self.opts.with_indexer_threads(n);
        self
    }
    pub fn writer_threads(mut self, n: usize) -> Self {
        self.opts = self.opts.with_writer_threads(n);
        self
    }
    pub fn max_slots_per_disk(mut self, n: u64) -> Self {
        self.opts = self.opts.with_max_slots_per_disk(n);
        self
    }
    pub fn progress(mut self, yes: bool) -> Self {
        self.opts = self.opts.with_progress(yes);
        self
    }

    /// Ingest the configured pcap files through the full pipeline and
    /// block until every chain is committed.
    pub fn run(self) -> Result<PipelineReport> {
        init_tracing_once();
        let opts = self.opts;
        if opts.input_files.is_empty() {
            bail!("no capture inputs configured");
        }

        let mut sources: Vec<Box<dyn PacketSource>> = Vec::new();
        for path in &opts.input_files {
            sources.push(Box::new(
                FileSource::open(path)
                    .with_context(|| format!("open input {}", path.display()))?,
            ));
        }
        run_pipeline(opts, sources, true)
    }

    /// Run with caller-supplied (e.g. live) packet sources. The pipeline
    /// then ends only when `shutdown` is raised externally.
    pub fn run_with_sources(
        self,
        sources: Vec<Box<dyn PacketSource>>,
        shutdown: Event,
    ) -> Result<PipelineReport> {
        init_tracing_once();
        run_pipeline_with_shutdown(self.opts, sources, false, shutdown)
    }
}

impl Default for PacketPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn run_pipeline(
    opts: CaptureOptions,
    sources: Vec<Box<dyn PacketSource>>,
    file_mode: bool,
) -> Result<PipelineReport> {
    run_pipeline_with_shutdown(opts, sources, file_mode, Event::new())
}

fn allocate_buckets(opts: &CaptureOptions, ready: &Queue<Bucket>, inputs: usize) -> Result<()> {
    // Enough buckets that every capture input can have three output files
    // in flight.
    let per_outfile = (opts.outfile_size / opts.bucket_bytes as u64).max(1) as usize;
    let minimum = per_outfile * inputs.max(1) * 3;

    let target = match opts.bucket_count {
        Some(n) => n,
        None => {
            // Size from memory: leave half of what's available alone.
            let avail = crate::mem::available_memory_bytes();
            let fit = (avail / 2 / opts.bucket_bytes as u64) as usize;
            fit.max(minimum)
        }
    };

    let deadline = Instant::now() + MAX_STARTUP_WAIT;
    for i in 0..target {
        if Instant::now() > deadline {
            bail!(
                "could not allocate enough buckets within {}s ({} of {})",
                MAX_STARTUP_WAIT.as_secs(),
                i,
                target
            );
        }
        ready
            .push(Bucket::with_capacity(opts.bucket_bytes))
            .map_err(|_| anyhow::anyhow!("ready queue closed during startup"))?;
    }

    if ready.len() < minimum {
        tracing::warn!(
            allocated = ready.len(),
            minimum,
            "bucket pool is smaller than the recommended three output files per input"
        );
    }
    tracing::info!(count = ready.len(), bytes = opts.bucket_bytes, "allocated buckets");
    Ok(())
}

fn run_pipeline_with_shutdown(
    opts: CaptureOptions,
    sources: Vec<Box<dyn PacketSource>>,
    file_mode: bool,
    gentle_shutdown: Event,
) -> Result<PipelineReport> {
    if (opts.bucket_bytes as u64) < opts.mtu as u64 + 16 {
        bail!("bucket size {} cannot hold a full-MTU packet", opts.bucket_bytes);
    }
    if opts.outfile_size < opts.mtu as u64 + 16 {
        bail!("output file size {} cannot hold a full-MTU packet", opts.outfile_size);
    }

    let lock_path = opts.base_dir.join("capture.lock");
    let _lock = LockFile::acquire(&lock_path)?;

    let catalog = FsCatalog::open(&opts.base_dir, opts.max_slots_per_disk)?;

    let ready: Queue<Bucket> = Queue::new();
    let filled: Queue<BucketChain> = Queue::new();
    let indexed: Queue<BucketChain> = Queue::new();

    allocate_buckets(&opts, &ready, sources.len())?;

    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let indexer_count = opts.indexer_threads.unwrap_or_else(|| stage_thread_limit(cpus));
    let writer_count = opts.writer_threads.unwrap_or_else(|| stage_thread_limit(cpus));

    let capture_shutdowns: Vec<Event> = sources.iter().map(|_| Event::new()).collect();
    let indexer_shutdowns: Vec<Event> = (0..indexer_count).map(|_| Event::new()).collect();
    let writer_shutdowns: Vec<Event> = (0..writer_count).map(|_| Event::new()).collect();
    let indexer_cells: Vec<StatusCell> = (0..indexer_count).map(|_| StatusCell::new()).collect();
    let writer_cells: Vec<StatusCell> = (0..writer_count).map(|_| StatusCell::new()).collect();

    let chains_committed = AtomicU64::new(0);
    let packets_captured = AtomicU64::new(0);
    let packets_dropped = AtomicU64::new(0);

    let mut status =
        StatusWriter::new(&opts.base_dir, Duration::from_secs(opts.status_period_secs));

    std::thread::scope(|scope| -> Result<()> {
        let mut capture_handles = Vec::new();
        for (source, my_shutdown) in sources.into_iter().zip(&capture_shutdowns) {
            let ready = &ready;
            let filled = &filled;
            let gentle = &gentle_shutdown;
            let mtu = opts.mtu;
            let outfile_size = opts.outfile_size;
            capture_handles.push(scope.spawn(move || {
                capture_worker(
                    source,
                    ready,
                    filled,
                    mtu,
                    outfile_size,
                    my_shutdown,
                    gentle,
                    file_mode,
                );
            }));
        }

        let mut indexer_handles = Vec::new();
        for (my_shutdown, cell) in indexer_shutdowns.iter().zip(&indexer_cells) {
            let filled = &filled;
            let indexed = &indexed;
            indexer_handles.push(scope.spawn(move || {
                indexer_worker(filled, indexed, my_shutdown, cell);
            }));
        }

        let mut writer_handles = Vec::new();
        for (my_shutdown, cell) in writer_shutdowns.iter().zip(&writer_cells) {
            let indexed = &indexed;
            let ready = &ready;
            let catalog = &catalog;
            let gentle = &gentle_shutdown;
            let outfile_size = opts.outfile_size;
            let counters = (&chains_committed, &packets_captured, &packets_dropped);
            writer_handles.push(scope.spawn(move || {
                writer_worker(
                    indexed,
                    ready,
                    outfile_size,
                    catalog,
                    my_shutdown,
                    gentle,
                    cell,
                    counters,
                );
            }));
        }

        // Babysit the pipeline: status heartbeats until shutdown is
        // raised, then wind the stages down in order.
        let spinner = if opts.progress {
            let pb = indicatif::ProgressBar::new_spinner();
            pb.enable_steady_tick(Duration::from_millis(100));
            Some(pb)
        } else {
            None
        };
        let mut capture_done: Vec<bool>;
        loop {
            capture_done = capture_shutdowns.iter().map(|e| e.is_set()).collect();
            status.maybe_write(
                &capture_done,
                &indexer_cells,
                &writer_cells,
                ready.len(),
                filled.len(),
                indexed.len(),
            );
            if let Some(pb) = &spinner {
                pb.set_message(format!(
                    "chains committed: {}  queues r/f/i: {}/{}/{}",
                    chains_committed.load(Ordering::Relaxed),
                    ready.len(),
                    filled.len(),
                    indexed.len(),
                ));
            }
            if gentle_shutdown.is_set() {
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        if let Some(pb) = &spinner {
            pb.finish_and_clear();
        }

        tracing::info!("shutting down capture workers");
        for ev in &capture_shutdowns {
            ev.set();
        }
        for h in capture_handles {
            let _ = h.join();
        }

        tracing::info!("shutting down indexer workers");
        drain_then_stop(&filled, &indexer_shutdowns);
        for h in indexer_handles {
            let _ = h.join();
        }

        tracing::info!("shutting down output workers");
        drain_then_stop(&indexed, &writer_shutdowns);
        for h in writer_handles {
            let _ = h.join();
        }

        // Nothing can feed the ready queue any longer.
        ready.close();
        let mut freed = 0u64;
        while ready.pop(PopMode::ForceNoWait).is_some() {
            freed += 1;
        }
        tracing::info!(freed, "freed bucket pool");
        Ok(())
    })?;

    Ok(PipelineReport {
        chains_committed: chains_committed.load(Ordering::Relaxed),
        packets_captured: packets_captured.load(Ordering::Relaxed),
        packets_dropped: packets_dropped.load(Ordering::Relaxed),
    })
}

/// Wait for a stage's input queue to empty, close it, then tell the
/// workers to stop.
fn drain_then_stop<T>(queue: &Queue<T>, shutdowns: &[Event]) {
    while !queue.is_empty() {
        std::thread::sleep(Duration::from_millis(50));
    }
    queue.close();
    for ev in shutdowns {
        ev.set();
    }
}

fn indexer_worker(
    filled: &Queue<BucketChain>,
    indexed: &Queue<BucketChain>,
    my_shutdown: &Event,
    cell: &StatusCell,
) {
    tracing::info!("indexer running");
    while !my_shutdown.is_set() {
        cell.set(ThreadStatus::Idle);
        let Some(mut chain) = filled.pop(PopMode::Block) else {
            continue;
        };
        cell.set(ThreadStatus::Working);
        index_chain(&mut chain);
        if indexed.push(chain).is_err() {
            tracing::error!("indexed queue closed with work in flight");
        }
    }
    cell.set(ThreadStatus::Shutdown);
    tracing::info!("indexer exiting");
}

#[allow(clippy::too_many_arguments)]
fn writer_worker(
    indexed: &Queue<BucketChain>,
    ready: &Queue<Bucket>,
    outfile_size: u64,
    catalog: &dyn Catalog,
    my_shutdown: &Event,
    gentle_shutdown: &Event,
    cell: &StatusCell,
    counters: (&AtomicU64, &AtomicU64, &AtomicU64),
) {
    let (chains_committed, packets_captured, packets_dropped) = counters;
    tracing::info!("output worker running");
    while !my_shutdown.is_set() {
        cell.set(ThreadStatus::Idle);
        let Some(mut chain) = indexed.pop(PopMode::Block) else {
            continue;
        };
        cell.set(ThreadStatus::Working);

        loop {
            match output_chain(outfile_size, catalog, &mut chain) {
                Ok(()) => {
                    chains_committed.fetch_add(1, Ordering::Relaxed);
                    packets_captured.fetch_add(chain.stats.captured_pkts, Ordering::Relaxed);
                    packets_dropped.fetch_add(chain.stats.dropped, Ordering::Relaxed);
                    break;
                }
                Err(OutputError::Catalog(e)) if !gentle_shutdown.is_set() => {
                    // Keep retrying the same chain until the catalog comes
                    // back or we're told to die.
                    tracing::warn!(error = %format!("{e:#}"), "catalog error, retrying chain");
                    std::thread::sleep(Duration::from_millis(500));
                }
                Err(e) => {
                    tracing::error!(error = %e, "abandoning chain write");
                    break;
                }
            }
        }

        // Dismantle the chain and recycle its buckets.
        for mut bucket in chain.into_buckets() {
            bucket.reset();
            let _ = ready.push(bucket);
        }
    }
    cell.set(ThreadStatus::Shutdown);
    tracing::info!("output worker exiting");
}
