use crate::catalog::index_path_for;
use crate::config::SearchOptions;
use crate::event::Event;
use crate::keys::{FlowRec, KeyType, TimeVal32};
use crate::search::algebra::{and_results, or_results, AndInput};
use crate::search::descriptor::SearchDescriptor;
use crate::search::flow_fetch::{flow_fetch, FlowFilter};
use crate::search::oset::{OpenOutcome, OrderedSet};
use crate::search::packets::pcap_fetch;
use crate::search::skiplist::SetSkipList;
use crate::search::subindex::search_subindex;
use crate::util::init_tracing_once;
use anyhow::{anyhow, bail, Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// One unit of search work: resolve every missing result file for a
/// single interval.
#[derive(Clone, Copy, Debug)]
struct IntervalTask {
    index_id: u64,
    partial: bool,
}

/// Run a parsed search across its interval lists with a bounded worker
/// pool. Partial intervals are filtered by time; full intervals only by
/// protocol.
pub fn run_search(descr: &SearchDescriptor, opts: &SearchOptions) -> Result<()> {
    init_tracing_once();

    let mut tasks: Vec<IntervalTask> = Vec::new();
    if let Some((_, ids)) = &descr.partial {
        tasks.extend(ids.iter().map(|id| IntervalTask { index_id: *id, partial: true }));
    }
    if let Some((_, ids)) = &descr.full {
        tasks.extend(ids.iter().map(|id| IntervalTask { index_id: *id, partial: false }));
    }
    if tasks.is_empty() {
        bail!("the search names no intervals (no PARTIAL or FULL line)");
    }

    let bar = if opts.progress {
        let pb = indicatif::ProgressBar::new(tasks.len() as u64);
        pb.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} intervals {pos}/{len} [{bar:.cyan/blue}] elapsed: {elapsed_precise}",
            )
            .unwrap(),
        );
        Some(pb)
    } else {
        None
    };

    let abort = Event::new();
    // Bounded fan-out: at most `threads` intervals in flight.
    for chunk in tasks.chunks(opts.threads.max(1)) {
        if abort.is_set() {
            break;
        }
        chunk.par_iter().try_for_each(|task| -> Result<()> {
            if abort.is_set() {
                return Ok(());
            }
            let res = search_interval(descr, opts, task).with_context(|| {
                format!("searching interval {:020}", task.index_id)
            });
            if let Err(e) = res {
                abort.set();
                return Err(e);
            }
            if let Some(pb) = &bar {
                pb.inc(1);
            }
            Ok(())
        })?;
    }
    if let Some(pb) = bar {
        pb.finish_with_message("done");
    }
    Ok(())
}

fn result_name_for(descr: &SearchDescriptor, partial: bool) -> Result<&str> {
    let pair = if partial { &descr.partial } else { &descr.full };
    pair.as_ref()
        .map(|(name, _)| name.as_str())
        .ok_or_else(|| anyhow!("interval list has no result name"))
}

/// Resolve one interval bottom-up with result-file short-circuiting: each
/// stage is skipped outright when its output already exists.
fn search_interval(
    descr: &SearchDescriptor,
    opts: &SearchOptions,
    task: &IntervalTask,
) -> Result<()> {
    let index_path = index_path_for(&opts.base_dir, task.index_id);
    if !index_path.is_dir() {
        bail!("no such index interval: {}", index_path.display());
    }
    let result_name = result_name_for(descr, task.partial)?;

    let packets_path = index_path.join(format!("{result_name}.pcap"));
    if opts.fetch_pcap && packets_path.exists() {
        return Ok(());
    }

    let flows_path = index_path.join(format!("{result_name}.flows"));
    let mut total_flow_bytes = 0u64;
    if !flows_path.exists() {
        let or_path = index_path.join(&descr.or_result_name);
        if !or_path.exists() {
            let and_paths: Vec<PathBuf> = descr
                .and_ops
                .iter()
                .map(|op| index_path.join(&op.result_name))
                .collect();

            if and_paths.iter().any(|p| !p.exists()) {
                // Sub-index scans first; every AND operand needs its
                // result present.
                let sub_paths: Vec<PathBuf> = descr
                    .sub_searches
                    .iter()
                    .map(|s| index_path.join(&s.result_name))
                    .collect();
                for (op, path) in descr.sub_searches.iter().zip(&sub_paths) {
                    if path.exists() {
                        continue;
                    }
                    let index_file = index_path.join(op.kt.name());
                    search_subindex(
                        op.kt,
                        &op.start,
                        &op.end,
                        &index_file,
                        path,
                        opts.tree_read_buffer,
                    )
                    .with_context(|| {
                        format!("sub-index search {} in {}", op.kt, index_path.display())
                    })?;
                }

                for (op, and_path) in descr.and_ops.iter().zip(&and_paths) {
                    if and_path.exists() {
                        continue;
                    }
                    let inputs: Vec<AndInput> = op
                        .items
                        .iter()
                        .map(|item| AndInput {
                            path: sub_paths[item.sub_id].clone(),
                            inverted: item.inverted,
                        })
                        .collect();
                    and_results(&inputs, and_path)
                        .with_context(|| format!("AND operation {}", op.result_name))?;
                }
            }

            or_results(&and_paths, &or_path)
                .with_context(|| format!("OR operation {}", descr.or_result_name))?;
        }

        let flow_index = index_path.join(KeyType::Flow.name());
        let filter = if task.partial {
            FlowFilter { start: descr.start_ts, end: descr.end_ts, proto: descr.proto }
        } else {
            // A full interval sits entirely inside the window; only the
            // protocol can still reject flows.
            FlowFilter { start: TimeVal32::new(0, 0), end: TimeVal32::MAX, proto: descr.proto }
        };
        total_flow_bytes = flow_fetch(&or_path, &flow_index, &filter, &flows_path)
            .with_context(|| format!("flow fetch into {}", flows_path.display()))?;
    }

    if opts.fetch_pcap {
        let fcap_path = index_path.join("FCAP");
        pcap_fetch(&flows_path, &fcap_path, total_flow_bytes, &packets_path)
            .with_context(|| format!("pcap fetch into {}", packets_path.display()))?;
    }

    Ok(())
}

/// Merge per-interval `.flows` results into one combined FlowSet, merging
/// duplicate flows across intervals. Used by the `merge` CLI step.
pub fn merge_flow_results(
    base_dir: &Path,
    result_name: &str,
    interval_ids: &[u64],
    extra_files: &[PathBuf],
    output: &Path,
) -> Result<()> {
    let mut out = match OrderedSet::<FlowRec>::create_final(output)? {
        OpenOutcome::Exists => bail!("output file {} already exists", output.display()),
        OpenOutcome::Writer(w) => w,
    };

    let mut sets = SetSkipList::<FlowRec>::new();
    for id in interval_ids {
        let path = index_path_for(base_dir, *id).join(format!("{result_name}.flows"));
        let set = OrderedSet::<FlowRec>::open_read(&path)
            .with_context(|| format!("open flow result {}", path.display()))?;
        sets.add(set)?;
    }
    for path in extra_files {
        let set = OrderedSet::<FlowRec>::open_read(path)
            .with_context(|| format!("open flow file {}", path.display()))?;
        sets.add(set)?;
    }

    sets.union_into(&mut out)?;
    out.finish()
}
