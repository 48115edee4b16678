use crate::search::oset::{OpenOutcome, OrderedSet};
use crate::search::skiplist::SetSkipList;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// One operand of an AND operation: a sub-search result path, possibly
/// inverted.
#[derive(Clone, Debug)]
pub struct AndInput {
    pub path: PathBuf,
    pub inverted: bool,
}

/// Intersect the non-inverted input sets, subtracting anything present in
/// the union of the inverted sets. Output is a sorted offset set committed
/// atomically; an existing output is a no-op success.
pub fn and_results(inputs: &[AndInput], result_path: &Path) -> Result<()> {
    let mut out = match OrderedSet::<u64>::create_final(result_path)? {
        OpenOutcome::Exists => return Ok(()),
        OpenOutcome::Writer(w) => w,
    };

    let mut includes: Vec<OrderedSet<u64>> = Vec::new();
    let mut inverted_sets = SetSkipList::<u64>::new();
    let mut inverted_count = 0usize;

    for input in inputs {
        let set = OrderedSet::<u64>::open_read(&input.path)
            .with_context(|| format!("open AND input {}", input.path.display()))?;
        if input.inverted {
            inverted_sets.add(set)?;
            inverted_count += 1;
        } else {
            includes.push(set);
        }
    }
    if includes.is_empty() {
        bail!("at least one non-inverted input set is required");
    }

    // Many inverted sets collapse to one sorted exclusion stream up
    // front; it's cheap and halves the bookkeeping below.
    let mut inv_set: Option<OrderedSet<u64>> = match inverted_count {
        0 => None,
        _ => {
            let mut merged = OrderedSet::create_tmp();
            inverted_sets.union_into(&mut merged)?;
            merged.into_read_mode()?;
            Some(merged)
        }
    };
    let mut next_inv: u64 = 0;
    if let Some(set) = inv_set.as_mut() {
        match set.pop()? {
            Some(v) => next_inv = v,
            None => inv_set = None,
        }
    }

    // Round-robin over the include sets: advance each past the candidate
    // until all agree, then emit unless excluded. Any set running dry ends
    // the intersection.
    let n = includes.len();
    let mut curr_item: u64 = 0;
    let mut match_count = 0usize;
    let mut idx = 0usize;

    'outer: loop {
        if match_count == n {
            if inv_set.is_some() {
                while next_inv < curr_item {
                    match inv_set.as_mut().unwrap().pop()? {
                        Some(v) => next_inv = v,
                        None => {
                            inv_set = None;
                            break;
                        }
                    }
                }
                if inv_set.is_none() || next_inv != curr_item {
                    out.push(curr_item)?;
                }
            } else {
                out.push(curr_item)?;
            }
            match_count = 0;
        }

        // Pull from the current set until it catches up with the
        // candidate.
        let next_item = loop {
            match includes[idx].pop()? {
                None => break 'outer,
                Some(v) if v >= curr_item => break v,
                Some(_) => {}
            }
        };

        if next_item > curr_item {
            curr_item = next_item;
            match_count = 0;
        }
        match_count += 1;
        idx = (idx + 1) % n;
    }

    out.finish()
}

/// Union the AND results into the single OR result for this interval.
pub fn or_results(and_paths: &[PathBuf], result_path: &Path) -> Result<()> {
    let mut out = match OrderedSet::<u64>::create_final(result_path)? {
        OpenOutcome::Exists => return Ok(()),
        OpenOutcome::Writer(w) => w,
    };

    let mut sets = SetSkipList::<u64>::new();
    for path in and_paths {
        let set = OrderedSet::<u64>::open_read(path)
            .with_context(|| format!("open OR input {}", path.display()))?;
        sets.add(set)?;
    }
    sets.union_into(&mut out)?;
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_set(dir: &Path, name: &str, vals: &[u64]) -> PathBuf {
        let path = dir.join(name);
        let OpenOutcome::Writer(mut s) = OrderedSet::<u64>::create_final(&path).unwrap()
        else {
            panic!()
        };
        for v in vals {
            s.push(*v).unwrap();
        }
        s.finish().unwrap();
        path
    }

    fn read_set(path: &Path) -> Vec<u64> {
        let mut s = OrderedSet::<u64>::open_read(path).unwrap();
        let mut got = Vec::new();
        while let Some(v) = s.pop().unwrap() {
            got.push(v);
        }
        got
    }

    #[test]
    fn and_with_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_set(dir.path(), "a", &[1, 2, 3, 4]);
        let b = write_set(dir.path(), "b", &[2, 3, 5]);
        let i = write_set(dir.path(), "i", &[3]);
        let out = dir.path().join("and");
        and_results(
            &[
                AndInput { path: a, inverted: false },
                AndInput { path: b, inverted: false },
                AndInput { path: i, inverted: true },
            ],
            &out,
        )
        .unwrap();
        assert_eq!(read_set(&out), vec![2]);
    }

    #[test]
    fn and_is_plain_intersection_without_inverts() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_set(dir.path(), "a", &[0, 5, 9, 11, 30]);
        let b = write_set(dir.path(), "b", &[0, 9, 30, 40]);
        let c = write_set(dir.path(), "c", &[0, 8, 9, 12, 30]);
        let out = dir.path().join("and");
        and_results(
            &[
                AndInput { path: a, inverted: false },
                AndInput { path: b, inverted: false },
                AndInput { path: c, inverted: false },
            ],
            &out,
        )
        .unwrap();
        assert_eq!(read_set(&out), vec![0, 9, 30]);
    }

    #[test]
    fn and_single_set_minus_inverted() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_set(dir.path(), "a", &[1, 2, 3, 4, 5]);
        let i = write_set(dir.path(), "i", &[2, 4, 6]);
        let out = dir.path().join("and");
        and_results(
            &[
                AndInput { path: a, inverted: false },
                AndInput { path: i, inverted: true },
            ],
            &out,
        )
        .unwrap();
        assert_eq!(read_set(&out), vec![1, 3, 5]);
    }

    #[test]
    fn empty_intersection_writes_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_set(dir.path(), "a", &[1, 3]);
        let b = write_set(dir.path(), "b", &[2, 4]);
        let out = dir.path().join("and");
        and_results(
            &[
                AndInput { path: a, inverted: false },
                AndInput { path: b, inverted: false },
            ],
            &out,
        )
        .unwrap();
        assert_eq!(read_set(&out), Vec::<u64>::new());
    }

    #[test]
    fn or_unions_and_results() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_set(dir.path(), "a", &[1, 4]);
        let b = write_set(dir.path(), "b", &[2, 4, 9]);
        let out = dir.path().join("or");
        or_results(&[a, b], &out).unwrap();
        assert_eq!(read_set(&out), vec![1, 2, 4, 9]);
    }

    #[test]
    fn rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_set(dir.path(), "a", &[7, 8]);
        let out = dir.path().join("or");
        or_results(&[a.clone()], &out).unwrap();
        let first = std::fs::read(&out).unwrap();
        or_results(&[a], &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), first);
    }
}
