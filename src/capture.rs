use crate::bucket::{Bucket, BucketChain};
use crate::bucketize::Bucketizer;
use crate::event::Event;
use crate::fcap::PcapReader;
use crate::keys::TimeVal32;
use crate::queue::Queue;
use anyhow::Result;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Packets received per loop iteration before yielding the CPU.
pub const PKT_READ_LIMIT: usize = 10_000;

/// A producer of captured packets. Live drivers (packet ring, AF_PACKET)
/// live outside this crate; the offline pcap-file source below is the
/// built-in implementation.
pub trait PacketSource: Send {
    fn name(&self) -> &str;

    /// Receive up to `limit` packets, handing each to `sink`. Returns the
    /// number received; 0 means end of input (file sources only; live
    /// sources block instead).
    fn recv_batch(
        &mut self,
        limit: usize,
        sink: &mut dyn FnMut(TimeVal32, u32, u32, &[u8]),
    ) -> Result<usize>;

    /// Cumulative (seen, sys_dropped) interface counters, if the source
    /// has any.
    fn counters(&self) -> Option<(u64, u64)> {
        None
    }

    /// Whether the counters wrap at 32 bits.
    fn counters_are_32bit(&self) -> bool {
        false
    }

    /// Interrupt a blocking receive so shutdown isn't stuck behind a quiet
    /// wire.
    fn breakloop(&mut self) {}
}

/// Reads packets from an on-disk pcap file.
pub struct FileSource {
    name: String,
    reader: PcapReader,
    buf: Vec<u8>,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            name: path.display().to_string(),
            reader: PcapReader::open(path)?,
            buf: Vec::with_capacity(2048),
        })
    }
}

impl PacketSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv_batch(
        &mut self,
        limit: usize,
        sink: &mut dyn FnMut(TimeVal32, u32, u32, &[u8]),
    ) -> Result<usize> {
        let mut received = 0;
        while received < limit {
            match self.reader.next_packet(&mut self.buf)? {
                Some(hdr) => {
                    sink(hdr.ts, hdr.caplen, hdr.len, &self.buf);
                    received += 1;
                }
                None => break,
            }
        }
        Ok(received)
    }
}

fn coarse_now() -> TimeVal32 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    TimeVal32::new(now.as_secs() as u32, now.subsec_micros())
}

/// One capture worker: drain the source into buckets until told to stop,
/// then flush whatever chain is in flight. File sources additionally
/// trigger a process-wide gentle shutdown at EOF.
#[allow(clippy::too_many_arguments)]
pub fn capture_worker(
    mut source: Box<dyn PacketSource>,
    ready: &Queue<Bucket>,
    filled: &Queue<BucketChain>,
    mtu: u32,
    outfile_size: u64,
    my_shutdown: &Event,
    gentle_shutdown: &Event,
    is_file_source: bool,
) {
    let mut bz = Bucketizer::new(source.name(), mtu, outfile_size);
    bz.prime_counters(source.counters(), source.counters_are_32bit());

    tracing::info!(source = source.name(), "capture worker running");

    while !my_shutdown.is_set() {
        bz.note_counters(source.counters());
        let received = source.recv_batch(PKT_READ_LIMIT, &mut |ts, caplen, len, bytes| {
            // A zero hardware timestamp means the driver didn't supply
            // one; a coarse clock read is the fallback.
            let ts = if ts.sec == 0 { coarse_now() } else { ts };
            bz.place(ready, filled, ts, caplen, len, bytes);
        });

        match received {
            Ok(0) if is_file_source => {
                // End of the capture file; finish up and ask everyone else
                // to wind down behind us.
                my_shutdown.set();
                gentle_shutdown.set();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(source = source.name(), error = %format!("{e:#}"), "receive failed");
                my_shutdown.set();
                gentle_shutdown.set();
            }
        }
        std::thread::yield_now();
    }

    // Ship off whatever is left, even an incomplete chain.
    bz.note_counters(source.counters());
    bz.seal(filled);
    if bz.dropped_pkts() > 0 {
        tracing::warn!(
            source = source.name(),
            dropped = bz.dropped_pkts(),
            "packets dropped with no chain to account them to"
        );
    }
    tracing::info!(source = source.name(), "capture worker exiting");
}
