use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-way latch used to tell a worker (or the whole process) to stop.
/// Signal handlers only ever call `set`.
#[derive(Clone, Debug, Default)]
pub struct Event {
    flag: Arc<AtomicBool>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
