use crate::keys::{FlowKey, FlowRec, TimeVal32, FLOW_KEY_SIZE};
use crate::output::FidxHeader;
use crate::search::oset::{OpenOutcome, OrderedSet};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Time/protocol filter applied while fetching flow records. Proto 0
/// means any.
#[derive(Clone, Copy, Debug)]
pub struct FlowFilter {
    pub start: TimeVal32,
    pub end: TimeVal32,
    pub proto: u8,
}

impl Default for FlowFilter {
    fn default() -> Self {
        Self { start: TimeVal32::new(0, 0), end: TimeVal32::MAX, proto: 0 }
    }
}

impl FlowFilter {
    /// A flow survives when it overlaps `[start, end]` and matches the
    /// protocol.
    pub fn keep(&self, flow: &FlowKey) -> bool {
        if flow.last_ts < self.start {
            return false;
        }
        if flow.first_ts > self.end {
            return false;
        }
        self.proto == 0 || flow.proto == self.proto
    }
}

/// Fetch one flow record per offset in the OR result, filter it, and emit
/// survivors to a FlowSet (ascending flow-offset order, since the input
/// offsets are sorted). Returns the total FCAP bytes the surviving flows
/// cover; 0 when the result already existed.
pub fn flow_fetch(
    or_result_path: &Path,
    flow_index_path: &Path,
    filter: &FlowFilter,
    flows_out_path: &Path,
) -> Result<u64> {
    let mut out = match OrderedSet::<FlowRec>::create_final(flows_out_path)? {
        OpenOutcome::Exists => return Ok(0),
        OpenOutcome::Writer(w) => w,
    };

    let mut offsets = OrderedSet::<u64>::open_read(or_result_path)
        .with_context(|| format!("open OR result {}", or_result_path.display()))?;

    let mut index = File::open(flow_index_path)
        .with_context(|| format!("open flow index {}", flow_index_path.display()))?;
    let mut hdr_buf = [0u8; 32];
    index.read_exact(&mut hdr_buf).context("read flow index header")?;
    let header = FidxHeader::decode(&hdr_buf)?;
    // The fcap offset width is whatever the file says it is.
    let offset_size = header.offset_size() as usize;

    let mut total_size: u64 = 0;
    let mut rec_buf = vec![0u8; FLOW_KEY_SIZE + offset_size];

    while let Some(offset) = offsets.pop()? {
        index.seek(SeekFrom::Start(offset))?;
        index
            .read_exact(&mut rec_buf)
            .with_context(|| format!("read flow record at {offset}"))?;
        let key = FlowKey::decode(&rec_buf);
        let fcap_offset = if offset_size == 8 {
            u64::from_le_bytes(rec_buf[FLOW_KEY_SIZE..].try_into().unwrap())
        } else {
            u32::from_le_bytes(rec_buf[FLOW_KEY_SIZE..].try_into().unwrap()) as u64
        };

        if !filter.keep(&key) {
            continue;
        }
        total_size += key.decoded_size();
        out.push(FlowRec { key, flow_offset: fcap_offset })?;
    }

    out.finish()?;
    Ok(total_size)
}
