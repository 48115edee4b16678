use ahash::AHashMap;

/// Per-chain capture and parse statistics. Carried only by the chain head
/// and persisted to the catalog when the chain's files are committed.
#[derive(Clone, Debug, Default)]
pub struct ChainStats {
    /// Interface (or input file) the chain was captured from.
    pub interface: String,
    /// Bytes this chain will occupy on disk (record headers + capture data).
    pub chain_size: u64,
    /// Packets copied into the chain.
    pub captured_pkts: u64,
    /// Packets discarded because no bucket was available.
    pub dropped: u64,
    /// Packets the kernel/driver reported dropping during this chain.
    pub sys_dropped: u64,
    /// Packets the interface saw during this chain.
    pub if_seen: u64,
    /// Datalink-layer parse failures.
    pub dll_errors: u64,
    /// Network-layer parse failures.
    pub network_errors: u64,
    /// Transport-layer parse failures.
    pub transport_errors: u64,
    pub ipv4: u64,
    pub ipv6: u64,
    /// Packets whose network layer we could not identify.
    pub other_net_layer: u64,
    /// Per-protocol transport counts.
    pub transport: AHashMap<u8, u64>,
}

impl ChainStats {
    pub fn new(interface: impl Into<String>) -> Self {
        Self { interface: interface.into(), ..Default::default() }
    }

    pub fn count_transport(&mut self, proto: u8) {
        *self.transport.entry(proto).or_insert(0) += 1;
    }
}

/// Delta between two cumulative interface counters, accounting for sources
/// that expose only 32-bit values and wrap.
pub fn counter_delta(now: u64, prev: u64, counter_is_32bit: bool) -> u64 {
    if now >= prev {
        now - prev
    } else if counter_is_32bit {
        (u32::MAX as u64 - prev) + now
    } else {
        // A shrinking 64-bit counter means the source was reset.
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_delta_plain() {
        assert_eq!(counter_delta(100, 40, true), 60);
        assert_eq!(counter_delta(100, 40, false), 60);
    }

    #[test]
    fn counter_delta_wraps_32bit() {
        let prev = u32::MAX as u64 - 5;
        assert_eq!(counter_delta(10, prev, true), 15);
    }
}
