use crate::index::IndexSet;
use crate::keys::{FiveTuple, TimeVal32};
use crate::stats::ChainStats;

/// On-disk size of one packet record header (timeval32 + caplen + len).
pub const RECORD_HEADER_SIZE: u64 = 16;

/// One captured packet within a bucket: the on-disk header fields, the
/// position of its raw bytes in the owning bucket's data region, and the
/// five-tuple filled in by the indexer.
#[derive(Clone, Copy, Debug)]
pub struct PacketRecord {
    pub ts: TimeVal32,
    pub caplen: u32,
    pub len: u32,
    pub data_off: u32,
    pub tuple: FiveTuple,
}

/// Index of a packet record within a chain: (bucket, record).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketRef {
    pub bucket: u32,
    pub rec: u32,
}

/// A fixed-capacity slab of captured packets. Allocated once at startup and
/// recycled through the pipeline queues.
#[derive(Debug)]
pub struct Bucket {
    capacity: usize,
    data: Vec<u8>,
    records: Vec<PacketRecord>,
    /// Disk bytes consumed so far (record headers + captured bytes).
    used: u64,
}

impl Bucket {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            data: Vec::with_capacity(capacity),
            records: Vec::new(),
            used: 0,
        }
    }

    /// Ready the bucket for a fresh run of packets.
    pub fn reset(&mut self) {
        self.data.clear();
        self.records.clear();
        self.used = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a packet of up to `mtu` captured bytes fits.
    pub fn fits(&self, mtu: u32) -> bool {
        self.used + RECORD_HEADER_SIZE + mtu as u64 <= self.capacity as u64
    }

    pub fn append(&mut self, ts: TimeVal32, caplen: u32, len: u32, bytes: &[u8]) {
        debug_assert!(bytes.len() == caplen as usize);
        let data_off = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        self.records.push(PacketRecord {
            ts,
            caplen,
            len,
            data_off,
            tuple: FiveTuple::default(),
        });
        self.used += RECORD_HEADER_SIZE + caplen as u64;
    }

    pub fn records(&self) -> &[PacketRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [PacketRecord] {
        &mut self.records
    }

    pub fn bytes_of(&self, rec: &PacketRecord) -> &[u8] {
        let start = rec.data_off as usize;
        &self.data[start..start + rec.caplen as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }
}

/// A chain of buckets holding one output file's worth of packets. Only the
/// chain carries stats and (after indexing) the index set.
#[derive(Debug)]
pub struct BucketChain {
    pub stats: ChainStats,
    pub indexes: Option<IndexSet>,
    pub buckets: Vec<Bucket>,
}

impl BucketChain {
    pub fn new(first: Bucket, stats: ChainStats) -> Self {
        Self { stats, indexes: None, buckets: vec![first] }
    }

    pub fn current(&mut self) -> &mut Bucket {
        self.buckets.last_mut().expect("chain always has a bucket")
    }

    pub fn extend(&mut self, mut bucket: Bucket) {
        bucket.reset();
        self.buckets.push(bucket);
    }

    pub fn packet(&self, r: PacketRef) -> &PacketRecord {
        &self.buckets[r.bucket as usize].records()[r.rec as usize]
    }

    pub fn packet_bytes(&self, r: PacketRef) -> &[u8] {
        let bkt = &self.buckets[r.bucket as usize];
        bkt.bytes_of(&bkt.records()[r.rec as usize])
    }

    pub fn tuple(&self, r: PacketRef) -> &FiveTuple {
        &self.packet(r).tuple
    }

    pub fn packet_count(&self) -> u64 {
        self.buckets.iter().map(|b| b.records().len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Timestamp of the first packet in the chain.
    pub fn first_ts(&self) -> Option<TimeVal32> {
        self.buckets
            .iter()
            .find(|b| !b.is_empty())
            .map(|b| b.records()[0].ts)
    }

    /// Timestamp of the last packet in the chain.
    pub fn last_ts(&self) -> Option<TimeVal32> {
        self.buckets
            .iter()
            .rev()
            .find(|b| !b.is_empty())
            .and_then(|b| b.records().last().map(|r| r.ts))
    }

    pub fn refs(&self) -> impl Iterator<Item = PacketRef> + '_ {
        self.buckets.iter().enumerate().flat_map(|(bi, b)| {
            (0..b.records().len()).map(move |ri| PacketRef {
                bucket: bi as u32,
                rec: ri as u32,
            })
        })
    }

    /// Dismantle the chain, handing each bucket to `recycle`.
    pub fn into_buckets(self) -> Vec<Bucket> {
        self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_space_accounting() {
        let mut b = Bucket::with_capacity(100);
        assert!(b.fits(84));
        assert!(!b.fits(85));
        b.append(TimeVal32::new(1, 0), 10, 10, &[0u8; 10]);
        assert_eq!(b.used_bytes(), 26);
        assert!(b.fits(58));
        assert!(!b.fits(59));
    }

    #[test]
    fn chain_first_last_ts_span_buckets() {
        let mut a = Bucket::with_capacity(1024);
        a.append(TimeVal32::new(5, 0), 1, 1, &[0]);
        a.append(TimeVal32::new(6, 0), 1, 1, &[0]);
        let mut chain = BucketChain::new(a, ChainStats::new("t"));
        let mut b = Bucket::with_capacity(1024);
        b.reset();
        b.append(TimeVal32::new(9, 1), 1, 1, &[0]);
        chain.buckets.push(b);
        assert_eq!(chain.first_ts(), Some(TimeVal32::new(5, 0)));
        assert_eq!(chain.last_ts(), Some(TimeVal32::new(9, 1)));
        assert_eq!(chain.packet_count(), 3);
    }
}
