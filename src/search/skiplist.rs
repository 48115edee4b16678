use crate::search::oset::{OrderedSet, SetItem};
use anyhow::{bail, Result};

pub const MAX_SKIP_LIST_LEVELS: usize = 16;

const NONE: usize = usize::MAX;

struct Entry<T: SetItem> {
    set: OrderedSet<T>,
    /// Cached next item of the set; kept current across pops so ordering
    /// decisions never need to touch the set's buffer.
    head_item: T,
    links: [usize; MAX_SKIP_LIST_LEVELS],
    levels: usize,
}

/// A skip list of ordered sets, keyed by each set's head element. Link
/// heights are deterministic (trailing-zero rule on the insertion counter)
/// rather than random; random levels showed worst-case linear behaviour on
/// this workload.
pub struct SetSkipList<T: SetItem> {
    slots: Vec<Option<Entry<T>>>,
    free: Vec<usize>,
    head: [usize; MAX_SKIP_LIST_LEVELS],
    items_inserted: u64,
    size: u64,
    max_level: usize,
}

impl<T: SetItem> Default for SetSkipList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SetItem> SetSkipList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: [NONE; MAX_SKIP_LIST_LEVELS],
            items_inserted: 0,
            size: 0,
            max_level: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn recalc_max_level(&mut self) {
        let mut items = self.size;
        self.max_level = 0;
        while items > 0 {
            items >>= 1;
            self.max_level += 1;
        }
        self.max_level = self.max_level.min(MAX_SKIP_LIST_LEVELS);
    }

    /// Add a brand new set. Empty sets are discarded immediately.
    pub fn add(&mut self, set: OrderedSet<T>) -> Result<()> {
        self.size += 1;
        self.recalc_max_level();
        let slot = self.alloc(set);
        self.reinsert(slot)
    }

    fn alloc(&mut self, set: OrderedSet<T>) -> usize {
        let entry = Entry {
            set,
            // Placeholder; reinsert refreshes it from the set before any
            // comparison happens.
            head_item: T::decode(&vec![0u8; T::SIZE]),
            links: [NONE; MAX_SKIP_LIST_LEVELS],
            levels: 0,
        };
        if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(entry);
            slot
        } else {
            self.slots.push(Some(entry));
            self.slots.len() - 1
        }
    }

    /// Pop the set with the smallest head. The caller either reinserts it
    /// or drops it for good (via `discard`).
    fn pop_min(&mut self) -> Option<usize> {
        let slot = self.head[0];
        if slot == NONE {
            return None;
        }
        let (levels, links) = {
            let entry = self.slots[slot].as_ref().expect("linked slot is live");
            (entry.levels, entry.links)
        };
        // Only the head can point at the minimum; unlink it at every level
        // it occupies.
        for lvl in 0..levels {
            if self.head[lvl] != slot {
                break;
            }
            self.head[lvl] = links[lvl];
        }
        Some(slot)
    }

    fn discard(&mut self, slot: usize) {
        self.slots[slot] = None;
        self.free.push(slot);
        self.size = self.size.saturating_sub(1);
        self.recalc_max_level();
    }

    /// Re-link a popped set by its (refreshed) head element. A drained set
    /// is dropped instead.
    fn reinsert(&mut self, slot: usize) -> Result<()> {
        // Deterministic link height: level i appears every 2^i insertions.
        let mut levels = 0;
        while levels < self.max_level && self.items_inserted % (1u64 << levels) == 0 {
            levels += 1;
        }
        self.items_inserted += 1;

        let head_item = {
            let entry = self.slots[slot].as_mut().expect("reinserting a live slot");
            match entry.set.peek()? {
                Some(item) => item,
                None => {
                    self.discard(slot);
                    return Ok(());
                }
            }
        };
        {
            let entry = self.slots[slot].as_mut().unwrap();
            entry.head_item = head_item;
            entry.levels = levels.max(1);
            entry.links = [NONE; MAX_SKIP_LIST_LEVELS];
        }

        // Walk right as far as each level allows, dropping a level when the
        // next entry's head is not smaller; link ourselves in at every
        // level we own.
        let mut prior: Option<usize> = None; // None = the head array
        let mut lvl = self.max_level as i64 - 1;
        while lvl >= 0 {
            let l = lvl as usize;
            let next = match prior {
                None => self.head[l],
                Some(p) => self.slots[p].as_ref().unwrap().links[l],
            };
            if next == NONE {
                if self.slots[slot].as_ref().unwrap().levels > l {
                    match prior {
                        None => self.head[l] = slot,
                        Some(p) => self.slots[p].as_mut().unwrap().links[l] = slot,
                    }
                }
                lvl -= 1;
                continue;
            }
            let goes_past = {
                let ours = &self.slots[slot].as_ref().unwrap().head_item;
                let theirs = &self.slots[next].as_ref().unwrap().head_item;
                ours.cmp_item(theirs).is_ge()
            };
            if goes_past {
                prior = Some(next);
            } else {
                if self.slots[slot].as_ref().unwrap().levels > l {
                    match prior {
                        None => {
                            self.head[l] = slot;
                        }
                        Some(p) => {
                            self.slots[p].as_mut().unwrap().links[l] = slot;
                        }
                    }
                    self.slots[slot].as_mut().unwrap().links[l] = next;
                }
                lvl -= 1;
            }
        }
        Ok(())
    }

    /// K-way union of every set into `out`. Equal adjacent items are
    /// deduplicated (offsets) or merged (flow records).
    pub fn union_into(&mut self, out: &mut OrderedSet<T>) -> Result<()> {
        let Some(first) = self.pop_min() else {
            return Ok(());
        };
        let mut last = match self.slots[first].as_mut().unwrap().set.pop()? {
            Some(item) => item,
            None => bail!("ordered set pulled from skip list was empty"),
        };
        self.reinsert(first)?;

        while let Some(slot) = self.pop_min() {
            let item = match self.slots[slot].as_mut().unwrap().set.pop()? {
                Some(item) => item,
                None => bail!("ordered set pulled from skip list was empty"),
            };
            self.reinsert(slot)?;

            match last.cmp_item(&item) {
                std::cmp::Ordering::Equal => last.merge_from(&item),
                _ => {
                    out.push(last)?;
                    last = item;
                }
            }
        }

        out.push(last)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{FlowKey, FlowRec, TimeVal32};
    use crate::search::oset::OpenOutcome;

    fn tmp_set(vals: &[u64]) -> OrderedSet<u64> {
        let mut s = OrderedSet::create_tmp();
        for v in vals {
            s.push(*v).unwrap();
        }
        s.into_read_mode().unwrap();
        s
    }

    fn union_all(sets: Vec<OrderedSet<u64>>) -> Vec<u64> {
        let mut sl = SetSkipList::new();
        for s in sets {
            sl.add(s).unwrap();
        }
        let mut out = OrderedSet::create_tmp();
        sl.union_into(&mut out).unwrap();
        out.into_read_mode().unwrap();
        let mut got = Vec::new();
        while let Some(v) = out.pop().unwrap() {
            got.push(v);
        }
        got
    }

    #[test]
    fn union_dedupes_and_sorts() {
        let got = union_all(vec![
            tmp_set(&[1, 4, 9]),
            tmp_set(&[2, 4, 8, 9]),
            tmp_set(&[3]),
        ]);
        assert_eq!(got, vec![1, 2, 3, 4, 8, 9]);
    }

    #[test]
    fn union_with_empty_and_single_sets() {
        let got = union_all(vec![tmp_set(&[]), tmp_set(&[5, 6])]);
        assert_eq!(got, vec![5, 6]);
        assert!(union_all(vec![tmp_set(&[])]).is_empty());
        assert!(union_all(vec![]).is_empty());
    }

    #[test]
    fn union_many_sets_stays_ordered() {
        // 40 interleaved sets stress the deterministic level assignment.
        let mut sets = Vec::new();
        for i in 0..40u64 {
            sets.push(tmp_set(&[i, i + 100, i + 200, i + 300]));
        }
        let got = union_all(sets);
        let expect: Vec<u64> = (0..40)
            .flat_map(|i| [i, i + 100, i + 200, i + 300])
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn flow_union_merges_same_flow() {
        let mut a = OrderedSet::<FlowRec>::create_tmp();
        a.push(FlowRec {
            key: FlowKey {
                first_ts: TimeVal32::new(100, 0),
                last_ts: TimeVal32::new(120, 0),
                srcport: 80,
                packets: 5,
                size: 50,
                ..Default::default()
            },
            flow_offset: 32,
        })
        .unwrap();
        a.into_read_mode().unwrap();
        let mut b = OrderedSet::<FlowRec>::create_tmp();
        b.push(FlowRec {
            key: FlowKey {
                first_ts: TimeVal32::new(200, 0),
                last_ts: TimeVal32::new(260, 0),
                srcport: 80,
                packets: 7,
                size: 70,
                ..Default::default()
            },
            flow_offset: 32,
        })
        .unwrap();
        b.into_read_mode().unwrap();

        let mut sl = SetSkipList::new();
        sl.add(a).unwrap();
        sl.add(b).unwrap();
        let mut out = OrderedSet::<FlowRec>::create_tmp();
        sl.union_into(&mut out).unwrap();
        out.into_read_mode().unwrap();

        let merged = out.pop().unwrap().unwrap();
        assert_eq!(out.pop().unwrap(), None);
        assert_eq!(merged.key.first_ts, TimeVal32::new(100, 0));
        assert_eq!(merged.key.last_ts, TimeVal32::new(260, 0));
        assert_eq!(merged.key.packets, 12);
        assert_eq!(merged.key.size, 120);
    }
}
