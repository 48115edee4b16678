//! The search engine over persisted FIDX/FCAP stores: range scans,
//! offset-set algebra, flow materialization, and time-ordered packet
//! extraction.

pub mod algebra;
pub mod descriptor;
pub mod engine;
pub mod flow_fetch;
pub mod oset;
pub mod packets;
pub mod skiplist;
pub mod subindex;
