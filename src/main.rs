use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcap::search::descriptor::SearchDescriptor;
use flowcap::{init_tracing_once, PacketPipeline, SearchOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flowcap",
    about = "Capture, index and search network packets as flow-ordered FCAP/FIDX stores",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest pcap files through the capture → index → write pipeline.
    Capture {
        /// Base data directory (capture files and indexes land under
        /// <dir>/capture/).
        #[arg(short = 'o', long, default_value = "/var/flowcap")]
        base_dir: PathBuf,
        /// Input pcap files to ingest.
        #[arg(short = 'r', long = "read", required = true)]
        inputs: Vec<PathBuf>,
        /// Bytes per bucket.
        #[arg(short = 'b', long, default_value_t = 256 * 1024 * 1024)]
        bucket_bytes: usize,
        /// Number of buckets (default: sized from available memory).
        #[arg(short = 'm', long)]
        buckets: Option<usize>,
        /// Size of each output capture file, in bytes.
        #[arg(short = 's', long, default_value_t = 4 * 1024 * 1024 * 1024)]
        outfile_size: u64,
        /// Maximum expected packet size.
        #[arg(long, default_value_t = 65_536)]
        mtu: u32,
        /// Indexer worker count (default: 1 + cpus * 3/8).
        #[arg(long)]
        indexer_threads: Option<usize>,
        /// Writer worker count (default: 1 + cpus * 3/8).
        #[arg(long)]
        writer_threads: Option<usize>,
        /// Capture slots per disk before the oldest is reclaimed.
        #[arg(long, default_value_t = 1024)]
        max_slots: u64,
        /// Disable progress output.
        #[arg(short = 'q', long)]
        quiet: bool,
    },
    /// Run a search description across capture intervals.
    Search {
        /// Path to the search description file.
        descriptor: PathBuf,
        /// Base data directory.
        #[arg(short = 'p', long, default_value = "/var/flowcap")]
        base_dir: PathBuf,
        /// Worker threads resolving intervals.
        #[arg(short = 't', long, default_value_t = 4)]
        threads: usize,
        /// Also pull matching packets into per-interval pcap files.
        #[arg(short = 'P', long)]
        fetch_pcap: bool,
        /// Disable progress output.
        #[arg(short = 's', long)]
        silent: bool,
    },
    /// Merge per-interval flow results into one combined flow file.
    Merge {
        /// Where to write the merged flow set.
        output: PathBuf,
        /// Interval ids whose results to merge.
        #[arg(value_name = "INDEX_ID")]
        intervals: Vec<u64>,
        /// Base data directory.
        #[arg(short = 'p', long, default_value = "/var/flowcap")]
        base_dir: PathBuf,
        /// Result name used when the intervals were searched.
        #[arg(short = 'r', long)]
        result_name: Option<String>,
        /// Additional flow files to include by path.
        #[arg(short = 'f', long = "flow-file")]
        flow_files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing_once();
    let cli = Cli::parse();

    match cli.command {
        Command::Capture {
            base_dir,
            inputs,
            bucket_bytes,
            buckets,
            outfile_size,
            mtu,
            indexer_threads,
            writer_threads,
            max_slots,
            quiet,
        } => {
            let mut pipeline = PacketPipeline::new()
                .base_dir(base_dir)
                .bucket_bytes(bucket_bytes)
                .outfile_size(outfile_size)
                .mtu(mtu)
                .max_slots_per_disk(max_slots)
                .progress(!quiet);
            for input in inputs {
                pipeline = pipeline.input_file(input);
            }
            if let Some(n) = buckets {
                pipeline = pipeline.bucket_count(n);
            }
            if let Some(n) = indexer_threads {
                pipeline = pipeline.indexer_threads(n);
            }
            if let Some(n) = writer_threads {
                pipeline = pipeline.writer_threads(n);
            }

            let report = pipeline.run()?;
            println!(
                "captured {} packets into {} intervals ({} dropped)",
                report.packets_captured, report.chains_committed, report.packets_dropped
            );
            Ok(())
        }
        Command::Search { descriptor, base_dir, threads, fetch_pcap, silent } => {
            let descr = SearchDescriptor::parse_file(&descriptor)?;
            let opts = SearchOptions::default()
                .with_base_dir(base_dir)
                .with_threads(threads)
                .with_fetch_pcap(fetch_pcap)
                .with_progress(!silent);
            flowcap::run_search(&descr, &opts)
        }
        Command::Merge { output, intervals, base_dir, result_name, flow_files } => {
            if !intervals.is_empty() && result_name.is_none() {
                anyhow::bail!("--result-name is required when interval ids are given");
            }
            flowcap::merge_flow_results(
                &base_dir,
                result_name.as_deref().unwrap_or(""),
                &intervals,
                &flow_files,
                &output,
            )
            .context("merge flow results")
        }
    }
}
