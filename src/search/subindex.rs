use crate::keys::{IndexKey, KeyType};
use crate::output::{tree_depth, FidxHeader, DISK_BLOCK, FIDX_HEADER_SIZE};
use crate::search::oset::{OpenOutcome, OrderedSet};
use crate::search::skiplist::SetSkipList;
use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Merge accumulated per-key sets once this many pile up.
const MAX_OSETS: u64 = 1024;

/// A position during implicit-tree descent. Indices count from 1; the
/// last match remembers the lowest-indexed entry known to be ≥ the start
/// key.
#[derive(Clone, Copy, Debug)]
struct TreePos {
    index: u64,
    node_depth: u32,
    tree_depth: u32,
    last_match: Option<u64>,
}

impl TreePos {
    fn new(depth: u32) -> Self {
        Self {
            index: 1u64 << (depth - 1),
            node_depth: 1,
            tree_depth: depth,
            last_match: None,
        }
    }

    /// Step to the head of the left subtree: back by half the subtree
    /// span. Virtual positions below the leaf level degrade to single
    /// steps.
    fn left(&mut self) {
        self.node_depth += 1;
        let shift = self.tree_depth.saturating_sub(self.node_depth);
        self.index -= 1u64 << shift;
    }

    fn right(&mut self) {
        self.node_depth += 1;
        let shift = self.tree_depth.saturating_sub(self.node_depth);
        self.index += 1u64 << shift;
    }

    fn at_leaf(&self) -> bool {
        self.node_depth >= self.tree_depth
    }
}

/// Scan `[start, end]` in one sub-index file, streaming every matching
/// flow offset (ascending) into `result_path`. An existing result file
/// short-circuits to success.
pub fn search_subindex(
    kt: KeyType,
    start: &IndexKey,
    end: &IndexKey,
    index_file: &Path,
    result_path: &Path,
    tree_read_buffer: usize,
) -> Result<()> {
    if start.cmp(end) == Ordering::Greater {
        bail!("the end of the key range must not be less than the start");
    }

    let mut out = match OrderedSet::<u64>::create_final(result_path)? {
        OpenOutcome::Exists => return Ok(()),
        OpenOutcome::Writer(w) => w,
    };

    let mut file = File::open(index_file)
        .with_context(|| format!("open index file {}", index_file.display()))?;

    // The whole first block: header plus any preview keys.
    let mut block = vec![0u8; DISK_BLOCK as usize];
    let mut filled = 0;
    while filled < block.len() {
        let n = file.read(&mut block[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let header = FidxHeader::decode(&block[..filled.min(block.len())])
        .with_context(|| format!("bad index header in {}", index_file.display()))?;

    if header.key_type != kt {
        bail!(
            "index {} holds {} keys, not {}",
            index_file.display(),
            header.key_type,
            kt
        );
    }

    let rec_size = kt.key_size() as u64 + header.offset_size();
    let expected = header.data_start() + rec_size * header.records;
    let actual = file.metadata()?.len();
    if actual != expected {
        bail!(
            "bad index file size for {}: have {actual}, expected {expected}",
            index_file.display()
        );
    }

    if header.records == 0 {
        return out.finish();
    }

    let mut pos = TreePos::new(tree_depth(header.records));

    if header.preview != 0 {
        search_preview(&block, &header, &mut pos, start, kt);
    }

    search_main(&mut file, &header, &mut pos, start, kt, tree_read_buffer)?;

    if let Some(first_match) = pos.last_match {
        output_matches(&mut file, &header, first_match, end, kt, &mut out)?;
    }

    out.finish()
}

/// Walk the in-memory preview tree, updating the main-tree position in
/// lockstep. On start ≤ key: remember the match and go left (the leftmost
/// match is wanted); otherwise go right. Preview positions past the
/// stored count either follow virtual nodes left or hand over to the main
/// descent.
fn search_preview(
    block: &[u8],
    header: &FidxHeader,
    pos: &mut TreePos,
    start: &IndexKey,
    kt: KeyType,
) {
    let key_size = kt.key_size();
    let pvw_size = DISK_BLOCK / key_size as u64;
    let pvw_depth = tree_depth(pvw_size) - 1;

    let mut n_idx: u64 = 1 << (pvw_depth - 1);
    let mut n_depth: u32 = 1;

    while n_depth <= pvw_depth {
        if n_idx > header.preview as u64 {
            if pos.index > header.records {
                // A virtual node: everything real hangs off its left.
                pos.left();
                continue;
            }
            // Off the preview's right edge (the block can hold slightly
            // fewer keys than the preview depth implies); finish in the
            // main tree.
            return;
        }
        let off = FIDX_HEADER_SIZE as usize + (n_idx as usize - 1) * key_size;
        if off + key_size > block.len() {
            // A preview count that outruns the block is corrupt; the main
            // descent can still finish the search.
            return;
        }
        let key = IndexKey::decode(kt, &block[off..]);
        n_depth += 1;
        let half = 1u64 << pvw_depth.saturating_sub(n_depth);
        if start.cmp(&key).is_le() {
            pos.last_match = Some(pos.index);
            pos.left();
            n_idx -= half;
        } else {
            pos.right();
            n_idx += half;
        }
    }
}

fn read_key_at(
    file: &mut File,
    header: &FidxHeader,
    kt: KeyType,
    rec_size: u64,
    index: u64,
) -> Result<IndexKey> {
    let off = header.data_start() + (index - 1) * rec_size;
    file.seek(SeekFrom::Start(off))?;
    let mut buf = [0u8; 16];
    file.read_exact(&mut buf[..kt.key_size()]).context("read index key")?;
    Ok(IndexKey::decode(kt, &buf))
}

/// Finish the descent in the main index: one read per step while the
/// residual subtree is large, then a single gulp of the rest walked in
/// memory.
fn search_main(
    file: &mut File,
    header: &FidxHeader,
    pos: &mut TreePos,
    start: &IndexKey,
    kt: KeyType,
    buffer_limit: usize,
) -> Result<()> {
    let rec_size = kt.key_size() as u64 + header.offset_size();

    let subtree_bytes = |pos: &TreePos| {
        let rel_depth = pos.tree_depth.saturating_sub(pos.node_depth);
        let subtree_size = 1u64 << (rel_depth + 1);
        (subtree_size - 1) * rec_size
    };

    // Step phase: huge subtrees are walked one key read at a time rather
    // than buffered.
    while subtree_bytes(pos) > buffer_limit as u64 {
        if pos.index > header.records {
            pos.left();
            continue;
        }
        let key = read_key_at(file, header, kt, rec_size, pos.index)?;
        if start.cmp(&key).is_le() {
            pos.last_match = Some(pos.index);
            pos.left();
        } else {
            pos.right();
        }
    }

    // Buffer phase: read the whole residual subtree and walk in memory.
    let rel_depth = pos.tree_depth.saturating_sub(pos.node_depth);
    let subtree_size = 1u64 << (rel_depth + 1);
    let half = subtree_size / 2;
    let first_record = pos.index - (half - 1);
    let last_record = (pos.index + (half - 1)).min(header.records);
    if first_record > header.records {
        // The entire residual subtree is virtual; nothing to compare.
        return Ok(());
    }

    let count = last_record - first_record + 1;
    let mut buffer = vec![0u8; (count * rec_size) as usize];
    file.seek(SeekFrom::Start(header.data_start() + (first_record - 1) * rec_size))?;
    file.read_exact(&mut buffer).context("read index subtree")?;

    loop {
        if pos.index > header.records {
            if pos.at_leaf() {
                break;
            }
            pos.left();
            continue;
        }
        let off = ((pos.index - first_record) * rec_size) as usize;
        let key = IndexKey::decode(kt, &buffer[off..]);
        let le = start.cmp(&key).is_le();
        if le {
            pos.last_match = Some(pos.index);
        }
        if pos.at_leaf() {
            break;
        }
        if le {
            pos.left();
        } else {
            pos.right();
        }
    }

    Ok(())
}

/// Forward scan from the first match: each distinct key's offsets form an
/// already-sorted run; runs are unioned through a skip list (compacted if
/// too many accumulate) into the output set. The scan stops past the end
/// key or at end of file.
fn output_matches(
    file: &mut File,
    header: &FidxHeader,
    first_match: u64,
    end: &IndexKey,
    kt: KeyType,
    out: &mut OrderedSet<u64>,
) -> Result<()> {
    let key_size = kt.key_size();
    let offset_size = header.offset_size() as usize;
    let rec_size = key_size as u64 + header.offset_size();

    let mut sets = SetSkipList::<u64>::new();

    file.seek(SeekFrom::Start(header.data_start() + (first_match - 1) * rec_size))?;
    let mut rdr = std::io::BufReader::with_capacity(256 * 1024, file);

    let mut key_buf = [0u8; 16];
    rdr.read_exact(&mut key_buf[..key_size]).context("read first matched key")?;
    let mut key = IndexKey::decode(kt, &key_buf);

    'scan: while key.cmp(end).is_le() {
        let mut run = OrderedSet::<u64>::create_tmp();
        let this_key = key;
        loop {
            let mut off_buf = [0u8; 8];
            rdr.read_exact(&mut off_buf[..offset_size])
                .context("read flow offset from index")?;
            let offset = if offset_size == 8 {
                u64::from_le_bytes(off_buf)
            } else {
                u32::from_le_bytes([off_buf[0], off_buf[1], off_buf[2], off_buf[3]]) as u64
            };
            run.push(offset)?;

            // The next key, or end of file: the final key group runs to
            // EOF.
            match rdr.read_exact(&mut key_buf[..key_size]) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    run.into_read_mode()?;
                    sets.add(run)?;
                    break 'scan;
                }
                Err(e) => return Err(e).context("read index key"),
            }
            key = IndexKey::decode(kt, &key_buf);
            if key != this_key {
                break;
            }
        }
        run.into_read_mode()?;
        sets.add(run)?;

        if sets.len() >= MAX_OSETS {
            // Compact the pile before it gets out of hand.
            let mut merged = OrderedSet::<u64>::create_tmp();
            sets.union_into(&mut merged)?;
            merged.into_read_mode()?;
            sets = SetSkipList::new();
            sets.add(merged)?;
        }
    }

    sets.union_into(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_pos_moves_match_position_formula() {
        // Five records: depth 3, root at 4.
        let mut pos = TreePos::new(3);
        assert_eq!(pos.index, 4);
        pos.left();
        assert_eq!((pos.index, pos.node_depth), (2, 2));
        pos.right();
        assert_eq!((pos.index, pos.node_depth), (3, 3));

        let mut pos = TreePos::new(3);
        pos.right();
        assert_eq!(pos.index, 6);
        pos.left();
        assert_eq!(pos.index, 5);
    }
}
