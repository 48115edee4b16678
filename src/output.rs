use crate::bucket::BucketChain;
use crate::catalog::{Catalog, SaveInfo};
use crate::fcap::{self, PCAP_FILE_HEADER_SIZE, PCAP_PKT_HEADER_SIZE};
use crate::index::IndexSet;
use crate::keys::{FlowKey, IndexKey, KeyType, TimeVal32};
use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};

pub const DISK_BLOCK: u64 = 4096;
pub const FIDX_IDENT: u32 = 0x5844_4946; // "FIDX"
pub const FIDX_HEADER_SIZE: u64 = 32;
pub const FIDX_VERSION: u8 = 1;

/// The 32-byte FIDX file header. All fields little-endian; `offset64` is
/// the high bit of the version byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FidxHeader {
    pub offset64: bool,
    pub key_type: KeyType,
    pub preview: u16,
    pub start_ts: TimeVal32,
    pub end_ts: TimeVal32,
    pub records: u64,
}

impl FidxHeader {
    pub fn offset_size(&self) -> u64 {
        if self.offset64 {
            8
        } else {
            4
        }
    }

    /// Bytes before the record section: a full disk block when a preview
    /// index is present.
    pub fn data_start(&self) -> u64 {
        if self.preview != 0 {
            DISK_BLOCK
        } else {
            FIDX_HEADER_SIZE
        }
    }

    pub fn encode(&self) -> [u8; FIDX_HEADER_SIZE as usize] {
        let mut buf = [0u8; FIDX_HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut buf[0..], FIDX_IDENT);
        buf[4] = (FIDX_VERSION & 0x7f) | ((self.offset64 as u8) << 7);
        buf[5] = self.key_type.to_disk();
        LittleEndian::write_u16(&mut buf[6..], self.preview);
        LittleEndian::write_u32(&mut buf[8..], self.start_ts.sec);
        LittleEndian::write_u32(&mut buf[12..], self.start_ts.usec);
        LittleEndian::write_u32(&mut buf[16..], self.end_ts.sec);
        LittleEndian::write_u32(&mut buf[20..], self.end_ts.usec);
        LittleEndian::write_u64(&mut buf[24..], self.records);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<FidxHeader> {
        if buf.len() < FIDX_HEADER_SIZE as usize {
            bail!("index file too small for a header");
        }
        let ident = LittleEndian::read_u32(&buf[0..]);
        if ident != FIDX_IDENT {
            bail!("not an index file (ident {ident:#x})");
        }
        let version = buf[4] & 0x7f;
        if version > FIDX_VERSION {
            bail!("unsupported index version {version}");
        }
        let key_type = KeyType::from_disk(buf[5])
            .ok_or_else(|| anyhow!("bad key type {} in index header", buf[5]))?;
        Ok(FidxHeader {
            offset64: buf[4] & 0x80 != 0,
            key_type,
            preview: LittleEndian::read_u16(&buf[6..]),
            start_ts: TimeVal32::new(
                LittleEndian::read_u32(&buf[8..]),
                LittleEndian::read_u32(&buf[12..]),
            ),
            end_ts: TimeVal32::new(
                LittleEndian::read_u32(&buf[16..]),
                LittleEndian::read_u32(&buf[20..]),
            ),
            records: LittleEndian::read_u64(&buf[24..]),
        })
    }
}

/// Depth of the left-filled implicit tree over `records` entries: the
/// smallest d with 2^d − 1 ≥ records (minimum 1).
pub fn tree_depth(records: u64) -> u32 {
    let mut depth = 1u32;
    let mut cap = 2u64;
    while cap - 1 < records {
        cap <<= 1;
        depth += 1;
    }
    depth
}

/// Depth of the 1-based position `pos` within a tree of depth `depth`.
/// Level-k nodes sit at odd multiples of 2^(depth−k).
pub fn node_depth(pos: u64, depth: u32) -> u32 {
    debug_assert!(pos > 0);
    depth - pos.trailing_zeros()
}

/// Depth of the preview tree for this key type, or 0 when the index is too
/// small to deserve one.
pub fn preview_depth(kt: KeyType, records: u64) -> u32 {
    if kt == KeyType::Flow {
        return 0;
    }
    let pvw_size = DISK_BLOCK / kt.key_size() as u64;
    if records < pvw_size {
        return 0;
    }
    tree_depth(pvw_size) - 1
}

/// How many preview keys fit in the header block.
pub fn preview_capacity(kt: KeyType) -> u64 {
    (DISK_BLOCK - FIDX_HEADER_SIZE) / kt.key_size() as u64
}

/// Number of preview entries that will actually be written: the real nodes
/// in the top `preview_depth` levels, bounded by what fits in the block.
pub fn preview_count(kt: KeyType, records: u64) -> u16 {
    let pd = preview_depth(kt, records);
    if pd == 0 {
        return 0;
    }
    let d = tree_depth(records);
    let in_levels = records >> (d - pd);
    in_levels.min(preview_capacity(kt)) as u16
}

/// Errors the writer distinguishes: catalog failures are retried on the
/// same chain, everything else abandons the chain's write.
#[derive(Debug)]
pub enum OutputError {
    Catalog(anyhow::Error),
    Fatal(anyhow::Error),
}

impl std::fmt::Display for OutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputError::Catalog(e) => write!(f, "catalog error: {e:#}"),
            OutputError::Fatal(e) => write!(f, "write error: {e:#}"),
        }
    }
}

/// Write one indexed chain: FCAP file, seven index files, FCAP symlink,
/// stats, and the catalog ready-mark.
pub fn output_chain(
    outfile_size: u64,
    catalog: &dyn Catalog,
    chain: &mut BucketChain,
) -> Result<(), OutputError> {
    let start_ts = chain
        .first_ts()
        .ok_or_else(|| OutputError::Fatal(anyhow!("chain has no packets")))?;
    let end_ts = chain.last_ts().expect("non-empty chain has a last packet");

    let save = catalog
        .begin_save(start_ts, end_ts)
        .map_err(OutputError::Catalog)?;

    let mut idxs = chain
        .indexes
        .take()
        .ok_or_else(|| OutputError::Fatal(anyhow!("chain was never indexed")))?;

    let result = write_all_indexes(outfile_size, &save, chain, &mut idxs, start_ts, end_ts);
    if let Err(e) = result {
        return Err(OutputError::Fatal(e));
    }

    // Catalog trouble from here on is logged but never retried; the files
    // themselves are complete.
    if let Err(e) = catalog.save_stats(save.index_id, &chain.stats) {
        tracing::error!(index_id = save.index_id, error = %format!("{e:#}"), "could not save chain stats");
    }
    if let Err(e) = catalog.set_index_ready(save.index_id) {
        tracing::error!(index_id = save.index_id, error = %format!("{e:#}"), "could not mark index ready");
    }

    tracing::info!(
        index_id = save.index_id,
        packets = chain.stats.captured_pkts,
        flows = idxs.flow_cnt(),
        "chain committed"
    );
    Ok(())
}

fn write_all_indexes(
    outfile_size: u64,
    save: &SaveInfo,
    chain: &BucketChain,
    idxs: &mut IndexSet,
    start_ts: TimeVal32,
    end_ts: TimeVal32,
) -> Result<()> {
    std::fs::create_dir_all(&save.index_path)
        .with_context(|| format!("create index dir {}", save.index_path.display()))?;

    let offset64 = outfile_size - 1 > u32::MAX as u64;
    let flow_index_size = write_flow_index(save, chain, idxs, offset64, start_ts, end_ts)?;
    let sub_offset64 = flow_index_size > u32::MAX as u64;

    for kt in KeyType::PROJECTIONS {
        write_projection_index(save, chain, idxs, kt, sub_offset64, start_ts, end_ts)?;
    }

    // Searches reach the capture file through this link.
    let link = save.index_path.join("FCAP");
    #[cfg(unix)]
    if let Err(e) = std::os::unix::fs::symlink(&save.slot_path, &link) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            tracing::warn!(error = %e, "could not create FCAP symlink");
        }
    }

    Ok(())
}

/// Write the FCAP capture file and the FLOW index together. Each flow's
/// packets are emitted contiguously (key packet first, then the list), and
/// the node records where its flow record landed so the projection indexes
/// can reference it.
fn write_flow_index(
    save: &SaveInfo,
    chain: &BucketChain,
    idxs: &mut IndexSet,
    offset64: bool,
    start_ts: TimeVal32,
    end_ts: TimeVal32,
) -> Result<u64> {
    let fcap_file = File::create(&save.slot_path)
        .with_context(|| format!("open capture slot {}", save.slot_path.display()))?;
    let mut fcap = BufWriter::with_capacity(256 * 1024, fcap_file);
    fcap::write_file_header(&mut fcap, chain.packet_count())?;

    let fidx_path = save.index_path.join(KeyType::Flow.name());
    let fidx_file = File::create(&fidx_path)
        .with_context(|| format!("create {}", fidx_path.display()))?;
    let mut fidx = BufWriter::with_capacity(256 * 1024, fidx_file);

    let header = FidxHeader {
        offset64,
        key_type: KeyType::Flow,
        preview: 0,
        start_ts,
        end_ts,
        records: idxs.flow_cnt(),
    };
    fidx.write_all(&header.encode())?;

    let offset_size = header.offset_size();
    let mut fcap_cursor: u64 = PCAP_FILE_HEADER_SIZE;
    let mut fidx_cursor: u64 = FIDX_HEADER_SIZE;
    let mut key_buf = [0u8; crate::keys::FLOW_KEY_SIZE];

    let order: Vec<u32> = idxs.flows.in_order().collect();
    for id in order {
        idxs.flows.node_mut(id).flow_index_offset = fidx_cursor;
        let node = idxs.flows.node(id);

        let fcap_offset = fcap_cursor;
        let key_pkt = chain.packet(node.key);
        let tuple = key_pkt.tuple;
        let mut flow_key = FlowKey {
            first_ts: key_pkt.ts,
            last_ts: node
                .payload
                .last()
                .map(|r| chain.packet(*r).ts)
                .unwrap_or(key_pkt.ts),
            src: tuple.src,
            proto: tuple.proto,
            srcport: tuple.srcport,
            packets: 0,
            dst: tuple.dst,
            size_pow: 0,
            packets_pow: 0,
            dstport: tuple.dstport,
            size: 0,
        };

        // The key packet isn't in the list; write it first.
        for r in std::iter::once(node.key).chain(node.payload.iter().copied()) {
            let pkt = chain.packet(r);
            fcap.write_all(&fcap::encode_pkt_header(pkt.ts, pkt.caplen, pkt.len))?;
            fcap.write_all(chain.packet_bytes(r))
                .context("write packet to capture file")?;
            flow_key.size += PCAP_PKT_HEADER_SIZE as u32 + pkt.caplen;
            flow_key.packets += 1;
            fcap_cursor += PCAP_PKT_HEADER_SIZE + pkt.caplen as u64;
        }

        flow_key.encode(&mut key_buf);
        fidx.write_all(&key_buf).context("write to flow index")?;
        if offset64 {
            fidx.write_all(&fcap_offset.to_le_bytes())?;
        } else {
            fidx.write_all(&(fcap_offset as u32).to_le_bytes())?;
        }
        fidx_cursor += crate::keys::FLOW_KEY_SIZE as u64 + offset_size;
    }

    fcap.flush().context("flush capture file")?;
    fidx.flush().context("flush flow index")?;
    Ok(fidx_cursor)
}

/// Serialize one projection tree as a left-filled implicit binary tree:
/// entries in key order (ties in flow-offset order), preview keys from the
/// top levels packed into the header block.
fn write_projection_index(
    save: &SaveInfo,
    chain: &BucketChain,
    idxs: &mut IndexSet,
    kt: KeyType,
    offset64: bool,
    start_ts: TimeVal32,
    end_ts: TimeVal32,
) -> Result<()> {
    // Detach the tree so flow-offset lookups don't fight the borrow; it is
    // dropped (nodes freed) when this write completes.
    let mut tree = std::mem::take(idxs.projection_mut(kt));

    let ids: Vec<u32> = tree.in_order().collect();
    let mut records: u64 = 0;
    for &id in &ids {
        // Flow lists were appended in arrival order; index entries must be
        // in flow-offset order.
        let offsets = &idxs.flows;
        tree.node_mut(id)
            .payload
            .sort_unstable_by_key(|f| offsets.node(*f).flow_index_offset);
        records += tree.node(id).payload.len() as u64;
    }

    let pvw_count = preview_count(kt, records);
    let header = FidxHeader {
        offset64,
        key_type: kt,
        preview: pvw_count,
        start_ts,
        end_ts,
        records,
    };

    let path = save.index_path.join(kt.name());
    let file =
        File::create(&path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::with_capacity(256 * 1024, file);
    w.write_all(&header.encode())?;
    if pvw_count > 0 {
        // Reserve the rest of the first block; the preview keys are known
        // only as the main section streams out.
        w.write_all(&vec![0u8; (DISK_BLOCK - FIDX_HEADER_SIZE) as usize])?;
    }

    let depth = tree_depth(records);
    let pvw_depth = preview_depth(kt, records);
    let key_size = kt.key_size();
    let capacity = preview_capacity(kt) as usize;

    let mut preview = Vec::with_capacity(pvw_count as usize * key_size);
    let mut key_bytes = Vec::with_capacity(key_size);
    let mut pos: u64 = 0;

    for &id in &ids {
        let node = tree.node(id);
        key_bytes.clear();
        IndexKey::for_tuple(chain.tuple(node.key), kt).encode(&mut key_bytes);
        for &flow_id in &node.payload {
            pos += 1;
            w.write_all(&key_bytes)?;
            let off = idxs.flows.node(flow_id).flow_index_offset;
            if offset64 {
                w.write_all(&off.to_le_bytes())?;
            } else {
                w.write_all(&(off as u32).to_le_bytes())?;
            }
            if pvw_depth > 0
                && node_depth(pos, depth) <= pvw_depth
                && preview.len() / key_size < capacity
            {
                preview.extend_from_slice(&key_bytes);
            }
        }
    }

    debug_assert_eq!(pos, records);
    debug_assert_eq!(preview.len() / key_size, pvw_count as usize);

    w.flush()?;
    if pvw_count > 0 {
        let file = w.get_mut();
        file.seek(SeekFrom::Start(FIDX_HEADER_SIZE))?;
        file.write_all(&preview)?;
    }
    Ok(())
}
