mod bucket;
mod bucketize;
mod capture;
mod catalog;
mod config;
mod event;
mod fcap;
mod index;
mod keys;
mod mem;
mod output;
mod packet;
mod pipeline;
mod queue;
mod splay;
mod stats;
mod status;
mod util;

pub mod search;

pub use crate::capture::{FileSource, PacketSource};
pub use crate::catalog::{index_path_for, Catalog, FsCatalog, SaveInfo};
pub use crate::fcap::{encode_pkt_header, write_file_header, PcapReader, PktHeader};
pub use crate::config::{CaptureOptions, SearchOptions};
pub use crate::event::Event;
pub use crate::keys::{FiveTuple, FlowKey, FlowRec, IndexKey, IpKey, KeyType, TimeVal32};
pub use crate::output::FidxHeader;
pub use crate::pipeline::{PacketPipeline, PipelineReport};
pub use crate::stats::ChainStats;

// Expose the search entry points at the crate root for the binary and
// integration tests.
pub use crate::search::descriptor::SearchDescriptor;
pub use crate::search::engine::{merge_flow_results, run_search};

// Expose memory helpers so embedders can size bucket pools themselves.
pub use crate::mem::{available_memory_bytes, available_memory_fraction};

// Tracing setup is shared with binaries embedding the library.
pub use crate::util::init_tracing_once;
