use crate::keys::TimeVal32;
use crate::stats::ChainStats;
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const CAPTURE_DIR_NAME: &str = "capture";
pub const INDEX_DIR_NAME: &str = "index";

/// Where one chain's capture file and index directory land.
#[derive(Clone, Debug)]
pub struct SaveInfo {
    pub disk_uuid: String,
    pub slot_id: u64,
    pub index_id: u64,
    pub slot_path: PathBuf,
    pub index_path: PathBuf,
}

/// The bookkeeping store for disks, capture slots, intervals, and
/// statistics. The writer only ever touches these three operations; a
/// transaction wraps disk selection through index-row creation.
pub trait Catalog: Send + Sync {
    /// Pick the least-used disk, claim (or reclaim) a slot on it, and
    /// create the index row for a chain spanning `[start, end]`.
    fn begin_save(&self, start: TimeVal32, end: TimeVal32) -> Result<SaveInfo>;
    /// Persist a committed chain's statistics.
    fn save_stats(&self, index_id: u64, stats: &ChainStats) -> Result<()>;
    /// Make the interval visible to searches.
    fn set_index_ready(&self, index_id: u64) -> Result<()>;
}

pub fn index_path_for(base: &Path, index_id: u64) -> PathBuf {
    base.join(CAPTURE_DIR_NAME)
        .join(INDEX_DIR_NAME)
        .join(format!("{index_id:020}"))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SlotRow {
    id: u64,
    mtime: String,
    index_id: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DiskRow {
    uuid: String,
    usage: u64,
    slots: Vec<SlotRow>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct IndexRow {
    id: u64,
    disk_uuid: Option<String>,
    slot_id: Option<u64>,
    start_ts: String,
    end_ts: String,
    ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stats: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    disks: Vec<DiskRow>,
    next_index_id: u64,
    indexes: Vec<IndexRow>,
}

/// A single-host catalog persisted as one JSON document under the base
/// data directory. Each writer thread holds a cheap clone; a shared lock
/// stands in for the database's transaction isolation.
#[derive(Clone)]
pub struct FsCatalog {
    base: PathBuf,
    max_slots_per_disk: u64,
    state: Arc<Mutex<CatalogState>>,
}

impl FsCatalog {
    pub fn open(base: &Path, max_slots_per_disk: u64) -> Result<Self> {
        fs::create_dir_all(base.join(CAPTURE_DIR_NAME).join(INDEX_DIR_NAME))
            .with_context(|| format!("create data layout under {}", base.display()))?;
        let state_path = base.join("catalog.json");
        let state = if state_path.exists() {
            let bytes = fs::read(&state_path)
                .with_context(|| format!("read {}", state_path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {}", state_path.display()))?
        } else {
            CatalogState {
                disks: vec![DiskRow {
                    uuid: "local-0".to_string(),
                    usage: 0,
                    slots: Vec::new(),
                }],
                ..Default::default()
            }
        };
        Ok(Self {
            base: base.to_path_buf(),
            max_slots_per_disk: max_slots_per_disk.max(1),
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn persist(&self, state: &CatalogState) -> Result<()> {
        let path = self.base.join("catalog.json");
        let tmp = self.base.join("catalog.json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).context("commit catalog state")?;
        Ok(())
    }

    fn now_str() -> String {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

impl Catalog for FsCatalog {
    fn begin_save(&self, start: TimeVal32, end: TimeVal32) -> Result<SaveInfo> {
        let mut state = self.state.lock();

        // Lowest-usage disk first.
        let disk_idx = state
            .disks
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.usage)
            .map(|(i, _)| i)
            .ok_or_else(|| anyhow!("no capture disks registered"))?;
        state.disks[disk_idx].usage += 1;
        let disk_uuid = state.disks[disk_idx].uuid.clone();

        // Fresh slot while the disk has room, otherwise reclaim the oldest
        // and unlink it from the index that owned it.
        let max_slots = self.max_slots_per_disk;
        let (slot_id, evicted) = {
            let disk = &mut state.disks[disk_idx];
            if (disk.slots.len() as u64) < max_slots {
                let id = disk.slots.len() as u64;
                disk.slots.push(SlotRow { id, mtime: Self::now_str(), index_id: None });
                (id, None)
            } else {
                let oldest = disk
                    .slots
                    .iter_mut()
                    .min_by(|a, b| a.mtime.cmp(&b.mtime))
                    .expect("disk has slots when full");
                let evicted = oldest.index_id.take();
                oldest.mtime = Self::now_str();
                (oldest.id, evicted)
            }
        };
        if let Some(old_index) = evicted {
            if let Some(row) = state.indexes.iter_mut().find(|r| r.id == old_index) {
                row.disk_uuid = None;
                row.slot_id = None;
            }
            tracing::info!(old_index, slot_id, "reclaimed capture slot");
        }

        let index_id = state.next_index_id;
        state.next_index_id += 1;

        state.indexes.push(IndexRow {
            id: index_id,
            disk_uuid: Some(disk_uuid.clone()),
            slot_id: Some(slot_id),
            start_ts: start.to_string(),
            end_ts: end.to_string(),
            ready: false,
            stats: None,
        });
        if let Some(slot) =
            state.disks[disk_idx].slots.iter_mut().find(|s| s.id == slot_id)
        {
            slot.index_id = Some(index_id);
        }

        let disk_dir = self.base.join(CAPTURE_DIR_NAME).join(&disk_uuid);
        fs::create_dir_all(&disk_dir)
            .with_context(|| format!("create disk dir {}", disk_dir.display()))?;

        self.persist(&state)?;

        Ok(SaveInfo {
            slot_path: disk_dir.join(format!("p{slot_id}.fcap")),
            index_path: index_path_for(&self.base, index_id),
            disk_uuid,
            slot_id,
            index_id,
        })
    }

    fn save_stats(&self, index_id: u64, stats: &ChainStats) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .indexes
            .iter_mut()
            .find(|r| r.id == index_id)
            .ok_or_else(|| anyhow!("no index row {index_id}"))?;
        let mut transport: Vec<(u8, u64)> =
            stats.transport.iter().map(|(k, v)| (*k, *v)).collect();
        transport.sort_unstable();
        row.stats = Some(serde_json::json!({
            "interface": stats.interface,
            "captured_pkts": stats.captured_pkts,
            "chain_size": stats.chain_size,
            "dropped": stats.dropped,
            "sys_dropped": stats.sys_dropped,
            "if_seen": stats.if_seen,
            "dll_errors": stats.dll_errors,
            "network_errors": stats.network_errors,
            "transport_errors": stats.transport_errors,
            "ipv4": stats.ipv4,
            "ipv6": stats.ipv6,
            "other_net_layer": stats.other_net_layer,
            "transport": transport,
        }));
        self.persist(&state)
    }

    fn set_index_ready(&self, index_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .indexes
            .iter_mut()
            .find(|r| r.id == index_id)
            .ok_or_else(|| anyhow!("no index row {index_id}"))?;
        row.ready = true;
        self.persist(&state)
    }
}
