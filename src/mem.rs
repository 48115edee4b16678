use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

/// Cached, low-overhead memory watcher used to autosize the bucket pool.
/// Refreshes at most every `REFRESH_EVERY`.
struct MemState {
    sys: System,
    last_check: Instant,
    last_avail: u64,
    last_frac: f64,
}

static STATE: OnceLock<Mutex<MemState>> = OnceLock::new();
const REFRESH_EVERY: Duration = Duration::from_millis(500);

fn with_state<F, T>(f: F) -> T
where
    F: FnOnce(&mut MemState) -> T,
{
    let m = STATE.get_or_init(|| {
        let mut s = System::new();
        s.refresh_memory();
        Mutex::new(MemState {
            sys: s,
            last_check: Instant::now() - REFRESH_EVERY * 2,
            last_avail: 0,
            last_frac: 1.0,
        })
    });
    let mut guard = m.lock().unwrap();
    f(&mut guard)
}

fn refresh(st: &mut MemState) {
    let now = Instant::now();
    if now.duration_since(st.last_check) >= REFRESH_EVERY {
        st.sys.refresh_memory();
        let total = st.sys.total_memory() as f64;
        let avail = st.sys.available_memory();
        st.last_avail = avail;
        st.last_frac = if total > 0.0 { (avail as f64 / total).clamp(0.0, 1.0) } else { 1.0 };
        st.last_check = now;
    }
}

/// Recent estimate of available memory, in bytes.
pub fn available_memory_bytes() -> u64 {
    with_state(|st| {
        refresh(st);
        st.last_avail
    })
}

/// Recent estimate of the available memory fraction (0.0..1.0).
pub fn available_memory_fraction() -> f64 {
    with_state(|st| {
        refresh(st);
        st.last_frac
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_are_sane() {
        let frac = available_memory_fraction();
        assert!((0.0..=1.0).contains(&frac));
        // Any machine running the suite has some memory free.
        assert!(available_memory_bytes() > 0);
    }
}
