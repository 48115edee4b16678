use crate::keys::TimeVal32;
use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_FILE_HEADER_SIZE: u64 = 24;
pub const PCAP_PKT_HEADER_SIZE: u64 = 16;
pub const SNAPLEN: u32 = 65_535;
pub const LINKTYPE_ETHERNET: u32 = 1;

/// Write a PCAP/FCAP file header.
///
/// FCAP files repurpose the (otherwise unused) `sigfigs` field to carry the
/// file's packet count; 0 is written when the count exceeds `u32::MAX`.
pub fn write_file_header<W: Write>(w: &mut W, packet_count: u64) -> Result<()> {
    let sigfigs = if packet_count > u32::MAX as u64 {
        tracing::warn!(packet_count, "too many packets for FCAP header; storing 0");
        0
    } else {
        packet_count as u32
    };

    let mut hdr = [0u8; PCAP_FILE_HEADER_SIZE as usize];
    LittleEndian::write_u32(&mut hdr[0..], PCAP_MAGIC);
    LittleEndian::write_u16(&mut hdr[4..], 2); // version 2.4
    LittleEndian::write_u16(&mut hdr[6..], 4);
    LittleEndian::write_i32(&mut hdr[8..], 0); // thiszone: GMT
    LittleEndian::write_u32(&mut hdr[12..], sigfigs);
    LittleEndian::write_u32(&mut hdr[16..], SNAPLEN);
    LittleEndian::write_u32(&mut hdr[20..], LINKTYPE_ETHERNET);
    w.write_all(&hdr)?;
    Ok(())
}

/// Encode one on-disk packet record header.
pub fn encode_pkt_header(ts: TimeVal32, caplen: u32, len: u32) -> [u8; 16] {
    let mut hdr = [0u8; 16];
    LittleEndian::write_u32(&mut hdr[0..], ts.sec);
    LittleEndian::write_u32(&mut hdr[4..], ts.usec);
    LittleEndian::write_u32(&mut hdr[8..], caplen);
    LittleEndian::write_u32(&mut hdr[12..], len);
    hdr
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PktHeader {
    pub ts: TimeVal32,
    pub caplen: u32,
    pub len: u32,
}

pub fn decode_pkt_header(buf: &[u8], swapped: bool) -> PktHeader {
    let read = |b: &[u8]| {
        if swapped {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        }
    };
    PktHeader {
        ts: TimeVal32::new(read(&buf[0..]), read(&buf[4..])),
        caplen: read(&buf[8..]),
        len: read(&buf[12..]),
    }
}

/// Sequential reader over a pcap (or FCAP) file. Handles both byte orders
/// of the classic microsecond format.
pub struct PcapReader {
    rdr: BufReader<File>,
    swapped: bool,
    /// `sigfigs` field from the header; the packet count for FCAP files.
    pub sigfigs: u32,
}

impl PcapReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open pcap {}", path.display()))?;
        let mut rdr = BufReader::with_capacity(256 * 1024, file);
        let mut hdr = [0u8; PCAP_FILE_HEADER_SIZE as usize];
        rdr.read_exact(&mut hdr)
            .with_context(|| format!("read pcap header {}", path.display()))?;
        let magic = LittleEndian::read_u32(&hdr[0..]);
        let swapped = match magic {
            PCAP_MAGIC => false,
            0xd4c3_b2a1 => true,
            other => bail!("not a pcap file (magic {:#x}): {}", other, path.display()),
        };
        let sigfigs = if swapped {
            u32::from_be_bytes([hdr[12], hdr[13], hdr[14], hdr[15]])
        } else {
            LittleEndian::read_u32(&hdr[12..])
        };
        Ok(Self { rdr, swapped, sigfigs })
    }

    /// Read the next packet into `buf`. Returns `None` at end of file.
    pub fn next_packet(&mut self, buf: &mut Vec<u8>) -> Result<Option<PktHeader>> {
        let mut hdr = [0u8; PCAP_PKT_HEADER_SIZE as usize];
        match self.rdr.read_exact(&mut hdr) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("read packet header"),
        }
        let header = decode_pkt_header(&hdr, self.swapped);
        if header.caplen > SNAPLEN {
            bail!("oversized packet (caplen {})", header.caplen);
        }
        buf.clear();
        buf.resize(header.caplen as usize, 0);
        self.rdr.read_exact(buf).context("read packet bytes")?;
        Ok(Some(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn header_and_packet_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.pcap");
        let mut f = File::create(&path).unwrap();
        write_file_header(&mut f, 2).unwrap();
        f.write_all(&encode_pkt_header(TimeVal32::new(10, 20), 3, 3)).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        f.write_all(&encode_pkt_header(TimeVal32::new(11, 0), 2, 5)).unwrap();
        f.write_all(&[9, 8]).unwrap();
        drop(f);

        let mut rdr = PcapReader::open(&path).unwrap();
        assert_eq!(rdr.sigfigs, 2);
        let mut buf = Vec::new();
        let h1 = rdr.next_packet(&mut buf).unwrap().unwrap();
        assert_eq!(h1, PktHeader { ts: TimeVal32::new(10, 20), caplen: 3, len: 3 });
        assert_eq!(buf, vec![1, 2, 3]);
        let h2 = rdr.next_packet(&mut buf).unwrap().unwrap();
        assert_eq!(h2.len, 5);
        assert_eq!(buf, vec![9, 8]);
        assert!(rdr.next_packet(&mut buf).unwrap().is_none());
    }

    #[test]
    fn big_endian_pcap_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be.pcap");
        let mut f = File::create(&path).unwrap();
        let mut hdr = [0u8; 24];
        hdr[0..4].copy_from_slice(&PCAP_MAGIC.to_be_bytes());
        hdr[4..6].copy_from_slice(&2u16.to_be_bytes());
        hdr[6..8].copy_from_slice(&4u16.to_be_bytes());
        hdr[16..20].copy_from_slice(&SNAPLEN.to_be_bytes());
        hdr[20..24].copy_from_slice(&1u32.to_be_bytes());
        f.write_all(&hdr).unwrap();
        let mut pkt = [0u8; 16];
        pkt[0..4].copy_from_slice(&7u32.to_be_bytes());
        pkt[8..12].copy_from_slice(&1u32.to_be_bytes());
        pkt[12..16].copy_from_slice(&1u32.to_be_bytes());
        f.write_all(&pkt).unwrap();
        f.write_all(&[0xaa]).unwrap();
        drop(f);

        let mut rdr = PcapReader::open(&path).unwrap();
        let mut buf = Vec::new();
        let h = rdr.next_packet(&mut buf).unwrap().unwrap();
        assert_eq!(h.ts.sec, 7);
        assert_eq!(buf, vec![0xaa]);
    }
}
