//! Shared helpers: synthetic pcap corpora and FIDX/result-file readers.
#![allow(dead_code)]

use flowcap::search::oset::OrderedSet;
use flowcap::{
    encode_pkt_header, index_path_for, write_file_header, FidxHeader, FlowKey, FlowRec,
    IndexKey, KeyType, PacketPipeline, PipelineReport, TimeVal32,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A packet scheduled for a synthetic pcap: (timestamp, frame bytes).
pub struct TestPacket {
    pub ts: TimeVal32,
    pub frame: Vec<u8>,
}

/// An ethernet/IPv4/UDP frame with the given addressing.
pub fn udp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    srcport: u16,
    dstport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[9] = 17; // UDP
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    frame.extend(ip);
    frame.extend_from_slice(&srcport.to_be_bytes());
    frame.extend_from_slice(&dstport.to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]);
    frame.extend_from_slice(payload);
    frame
}

pub fn write_pcap(path: &Path, packets: &[TestPacket]) {
    let mut f = File::create(path).unwrap();
    write_file_header(&mut f, packets.len() as u64).unwrap();
    for p in packets {
        let len = p.frame.len() as u32;
        f.write_all(&encode_pkt_header(p.ts, len, len)).unwrap();
        f.write_all(&p.frame).unwrap();
    }
}

/// Run one pcap through the whole pipeline with test-sized knobs.
pub fn run_capture(base: &Path, pcap: &Path) -> PipelineReport {
    PacketPipeline::new()
        .base_dir(base)
        .input_file(pcap)
        .mtu(2048)
        .bucket_bytes(1024 * 1024)
        .bucket_count(8)
        .outfile_size(16 * 1024 * 1024)
        .indexer_threads(1)
        .writer_threads(1)
        .progress(false)
        .run()
        .unwrap()
}

pub fn interval_dir(base: &Path, index_id: u64) -> PathBuf {
    index_path_for(base, index_id)
}

/// Decode a projection FIDX file into its header and (key, offset)
/// entries.
pub fn read_projection_index(path: &Path) -> (FidxHeader, Vec<(IndexKey, u64)>) {
    let mut f = File::open(path).unwrap();
    let mut hdr_buf = [0u8; 32];
    f.read_exact(&mut hdr_buf).unwrap();
    let hdr = FidxHeader::decode(&hdr_buf).unwrap();
    let kt = hdr.key_type;
    assert_ne!(kt, KeyType::Flow, "use read_flow_index for FLOW files");

    f.seek(SeekFrom::Start(hdr.data_start())).unwrap();
    let key_size = kt.key_size();
    let off_size = hdr.offset_size() as usize;
    let mut entries = Vec::new();
    let mut rec = vec![0u8; key_size + off_size];
    for _ in 0..hdr.records {
        f.read_exact(&mut rec).unwrap();
        let key = IndexKey::decode(kt, &rec);
        let off = if off_size == 8 {
            u64::from_le_bytes(rec[key_size..].try_into().unwrap())
        } else {
            u32::from_le_bytes(rec[key_size..].try_into().unwrap()) as u64
        };
        entries.push((key, off));
    }
    (hdr, entries)
}

/// The preview keys stored in a projection file's header block.
pub fn read_preview_keys(path: &Path) -> Vec<IndexKey> {
    let mut f = File::open(path).unwrap();
    let mut block = vec![0u8; 4096];
    f.read_exact(&mut block).unwrap();
    let hdr = FidxHeader::decode(&block).unwrap();
    let key_size = hdr.key_type.key_size();
    (0..hdr.preview as usize)
        .map(|i| IndexKey::decode(hdr.key_type, &block[32 + i * key_size..]))
        .collect()
}

/// Decode a FLOW FIDX file: (header, entries of (record-offset, flow key,
/// fcap offset)).
pub fn read_flow_index(path: &Path) -> (FidxHeader, Vec<(u64, FlowKey, u64)>) {
    let mut f = File::open(path).unwrap();
    let mut hdr_buf = [0u8; 32];
    f.read_exact(&mut hdr_buf).unwrap();
    let hdr = FidxHeader::decode(&hdr_buf).unwrap();
    assert_eq!(hdr.key_type, KeyType::Flow);

    let off_size = hdr.offset_size() as usize;
    let mut entries = Vec::new();
    let mut rec = vec![0u8; 64 + off_size];
    let mut cursor = 32u64;
    for _ in 0..hdr.records {
        f.read_exact(&mut rec).unwrap();
        let key = FlowKey::decode(&rec);
        let off = if off_size == 8 {
            u64::from_le_bytes(rec[64..].try_into().unwrap())
        } else {
            u32::from_le_bytes(rec[64..].try_into().unwrap()) as u64
        };
        entries.push((cursor, key, off));
        cursor += rec.len() as u64;
    }
    (hdr, entries)
}

pub fn read_offset_set(path: &Path) -> Vec<u64> {
    let mut set = OrderedSet::<u64>::open_read(path).unwrap();
    let mut out = Vec::new();
    while let Some(v) = set.pop().unwrap() {
        out.push(v);
    }
    out
}

pub fn read_flow_set(path: &Path) -> Vec<FlowRec> {
    let mut set = OrderedSet::<FlowRec>::open_read(path).unwrap();
    let mut out = Vec::new();
    while let Some(v) = set.pop().unwrap() {
        out.push(v);
    }
    out
}
