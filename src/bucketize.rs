use crate::bucket::{Bucket, BucketChain, RECORD_HEADER_SIZE};
use crate::keys::TimeVal32;
use crate::queue::{PopMode, Queue};
use crate::stats::{counter_delta, ChainStats};

/// Per-capture-thread chain state and the seal/extend/append policy.
pub struct Bucketizer {
    interface: String,
    mtu: u32,
    outfile_size: u64,
    chain: Option<BucketChain>,
    /// Packets discarded since the last chain was started.
    dropped_pkts: u64,
    /// Latest cumulative source counters, refreshed once per receive
    /// batch.
    pending_counters: Option<(u64, u64)>,
    counters_32bit: bool,
    last_if_seen: u64,
    last_sys_dropped: u64,
}

impl Bucketizer {
    pub fn new(interface: impl Into<String>, mtu: u32, outfile_size: u64) -> Self {
        Self {
            interface: interface.into(),
            mtu,
            outfile_size,
            chain: None,
            dropped_pkts: 0,
            pending_counters: None,
            counters_32bit: false,
            last_if_seen: 0,
            last_sys_dropped: 0,
        }
    }

    /// Prime the cumulative counters so the first chain's deltas start at
    /// the capture start, not zero.
    pub fn prime_counters(&mut self, counters: Option<(u64, u64)>, is_32bit: bool) {
        if let Some((seen, dropped)) = counters {
            self.last_if_seen = seen;
            self.last_sys_dropped = dropped;
        }
        self.counters_32bit = is_32bit;
    }

    /// Record the source's current cumulative counters; consumed when the
    /// chain seals.
    pub fn note_counters(&mut self, counters: Option<(u64, u64)>) {
        if counters.is_some() {
            self.pending_counters = counters;
        }
    }

    pub fn dropped_pkts(&self) -> u64 {
        self.dropped_pkts
    }

    /// Place one packet. Seals the chain when another full-MTU packet
    /// would overflow the output file, extends it when the current bucket
    /// is full, and otherwise appends in place. A missing ready bucket
    /// means the packet is dropped and counted.
    pub fn place(
        &mut self,
        ready: &Queue<Bucket>,
        filled: &Queue<BucketChain>,
        ts: TimeVal32,
        caplen: u32,
        len: u32,
        bytes: &[u8],
    ) {
        let needs_new_chain = match &self.chain {
            None => true,
            Some(chain) => {
                chain.stats.chain_size + RECORD_HEADER_SIZE + self.mtu as u64
                    > self.outfile_size
            }
        };

        if needs_new_chain {
            self.seal(filled);
            let Some(mut bucket) = ready.pop(PopMode::NoWait) else {
                self.dropped_pkts += 1;
                return;
            };
            bucket.reset();
            let mut stats = ChainStats::new(self.interface.clone());
            // Drops accumulated while no chain could take packets belong
            // to the chain that finally starts.
            stats.dropped = self.dropped_pkts;
            self.dropped_pkts = 0;
            self.chain = Some(BucketChain::new(bucket, stats));
        } else if !self.chain.as_mut().unwrap().current().fits(self.mtu) {
            match ready.pop(PopMode::NoWait) {
                Some(bucket) => self.chain.as_mut().unwrap().extend(bucket),
                None => {
                    self.dropped_pkts += 1;
                    return;
                }
            }
        }

        let chain = self.chain.as_mut().expect("chain exists after rotation");
        chain.current().append(ts, caplen, len, bytes);
        chain.stats.chain_size += RECORD_HEADER_SIZE + caplen as u64;
    }

    /// Push the current chain (complete or not) onto the filled queue,
    /// folding in drop counts and interface counter deltas. Shutdown paths
    /// call this to flush a partial chain.
    pub fn seal(&mut self, filled: &Queue<BucketChain>) {
        let Some(mut chain) = self.chain.take() else {
            return;
        };
        chain.stats.dropped += self.dropped_pkts;
        self.dropped_pkts = 0;

        if let Some((seen, sys_dropped)) = self.pending_counters.take() {
            chain.stats.if_seen =
                counter_delta(seen, self.last_if_seen, self.counters_32bit);
            chain.stats.sys_dropped =
                counter_delta(sys_dropped, self.last_sys_dropped, self.counters_32bit);
            self.last_if_seen = seen;
            self.last_sys_dropped = sys_dropped;
        }

        if chain.is_empty() {
            tracing::debug!(interface = %self.interface, "discarding empty chain");
            return;
        }
        if filled.push(chain).is_err() {
            tracing::error!(
                interface = %self.interface,
                "filled queue closed while sealing; chain lost"
            );
        }
    }
}
