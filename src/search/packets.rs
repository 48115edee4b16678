use crate::fcap::{self, decode_pkt_header, PCAP_PKT_HEADER_SIZE};
use crate::keys::{FlowRec, TimeVal32};
use crate::search::oset::{tmp_path_for, OrderedSet};
use crate::util::replace_file_atomic;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Below this many total flow bytes every flow is preloaded up front, so
/// the FCAP file is read strictly sequentially. Larger pulls load each
/// flow lazily on its first dequeue.
pub const PACKET_PREFETCH_LIMIT: u64 = 100 * 1024 * 1024;

/// One flow's read cursor, doubling as a pairing-heap node. The heap is
/// ordered by the timestamp of each flow's next packet; children hang off
/// `child` as a sibling list.
struct FlowCursor {
    ts: TimeVal32,
    len: u64,
    offset: u64,
    buffer: Option<Vec<u8>>,
    pos: usize,
    child: Option<Box<FlowCursor>>,
    sibling: Option<Box<FlowCursor>>,
}

impl FlowCursor {
    fn new(rec: &FlowRec) -> Box<Self> {
        Box::new(Self {
            ts: rec.key.first_ts,
            len: rec.key.decoded_size(),
            offset: rec.flow_offset,
            buffer: None,
            pos: 0,
            child: None,
            sibling: None,
        })
    }

    /// Pull the whole flow out of the FCAP file. The first packet's
    /// timestamp must agree with the flow record.
    fn load(&mut self, fcap: &mut File) -> Result<()> {
        debug_assert!(self.buffer.is_none());
        let mut buffer = vec![0u8; self.len as usize];
        fcap.seek(SeekFrom::Start(self.offset))?;
        fcap.read_exact(&mut buffer).with_context(|| {
            format!("read flow of {} bytes at offset {}", self.len, self.offset)
        })?;

        if buffer.len() < PCAP_PKT_HEADER_SIZE as usize {
            bail!("flow record too small to hold a packet at {:#x}", self.offset);
        }
        let first = decode_pkt_header(&buffer, false);
        if first.ts != self.ts {
            bail!(
                "mismatched flow and packet timestamp at fcap offset {:#x}",
                self.offset
            );
        }
        self.buffer = Some(buffer);
        Ok(())
    }

    fn exhausted(&self) -> bool {
        self.pos as u64 >= self.len
    }

    /// Copy the cursor's current packet to the output and step to the
    /// next one, refreshing the heap key.
    fn write_packet<W: Write>(&mut self, out: &mut W, fcap: &mut File) -> Result<()> {
        if self.buffer.is_none() {
            self.load(fcap)?;
        }
        let buffer = self.buffer.as_ref().unwrap();

        if self.pos + PCAP_PKT_HEADER_SIZE as usize > buffer.len() {
            bail!("flow buffer truncated mid-header at {}", self.pos);
        }
        let hdr = decode_pkt_header(&buffer[self.pos..], false);
        let write_size = PCAP_PKT_HEADER_SIZE as usize + hdr.caplen as usize;
        if self.pos + write_size > buffer.len() {
            bail!("flow buffer truncated mid-packet at {}", self.pos);
        }
        out.write_all(&buffer[self.pos..self.pos + write_size])?;

        self.pos += write_size;
        if !self.exhausted() {
            if self.pos + PCAP_PKT_HEADER_SIZE as usize > buffer.len() {
                bail!("flow buffer truncated between packets at {}", self.pos);
            }
            let next = decode_pkt_header(&buffer[self.pos..], false);
            self.ts = next.ts;
        }
        Ok(())
    }
}

/// Merge two heaps; the root with the older next-packet timestamp wins.
fn merge(mut a: Box<FlowCursor>, mut b: Box<FlowCursor>) -> Box<FlowCursor> {
    debug_assert!(a.sibling.is_none() && b.sibling.is_none());
    if a.ts <= b.ts {
        b.sibling = a.child.take();
        a.child = Some(b);
        a
    } else {
        a.sibling = b.child.take();
        b.child = Some(a);
        b
    }
}

/// Pairwise merge a sibling list into a single heap.
fn merge_pairs(mut node: Box<FlowCursor>) -> Box<FlowCursor> {
    let Some(mut sibling) = node.sibling.take() else {
        return node;
    };
    match sibling.sibling.take() {
        None => merge(node, sibling),
        Some(rest) => {
            let merged = merge(node, sibling);
            merge(merged, merge_pairs(rest))
        }
    }
}

/// Remove the root, producing the heap of its children.
fn del_min(root: &mut Box<FlowCursor>) -> Option<Box<FlowCursor>> {
    root.child.take().map(merge_pairs)
}

/// Materialize the selected flows as one PCAP whose packets are in strict
/// ascending time order. Written via `.tmp` + rename so a half-built
/// result is never mistaken for a finished one.
pub fn pcap_fetch(
    flows_path: &Path,
    fcap_path: &Path,
    total_size: u64,
    result_path: &Path,
) -> Result<()> {
    if result_path.exists() {
        return Ok(());
    }

    let mut flows = OrderedSet::<FlowRec>::open_read(flows_path)
        .with_context(|| format!("open flow set {}", flows_path.display()))?;
    let mut fcap = File::open(fcap_path)
        .with_context(|| format!("open fcap file {}", fcap_path.display()))?;

    let preload = total_size <= PACKET_PREFETCH_LIMIT;

    let tmp = tmp_path_for(result_path);
    let out_file =
        File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    let mut out = BufWriter::with_capacity(256 * 1024, out_file);
    fcap::write_file_header(&mut out, 0)?;

    let mut root: Option<Box<FlowCursor>> = None;
    while let Some(rec) = flows.pop()? {
        let mut node = FlowCursor::new(&rec);
        if preload {
            node.load(&mut fcap)?;
        }
        root = Some(match root {
            None => node,
            Some(r) => merge(r, node),
        });
    }

    // Pop-write-reinsert until every cursor runs dry. Flows being
    // internally time-ordered makes this O(packets × log flows).
    while let Some(mut min) = root.take() {
        root = del_min(&mut min);
        min.write_packet(&mut out, &mut fcap)?;
        if !min.exhausted() {
            root = Some(match root {
                None => min,
                Some(r) => merge(r, min),
            });
        }
    }

    out.flush()?;
    drop(out);
    replace_file_atomic(&tmp, result_path)
}
