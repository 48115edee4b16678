use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// How a `pop` behaves when the queue is empty or closed.
///
/// `Force` returns items even from a closed queue; it is the shutdown drain
/// primitive. `NoWait` never blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopMode {
    Block,
    NoWait,
    Force,
    ForceNoWait,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An unbounded FIFO shared between pipeline stages. Closing wakes every
/// waiter; subsequent non-forced pops return `None` even if items remain.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    nonempty: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { items: VecDeque::new(), closed: false }),
            nonempty: Condvar::new(),
        }
    }

    /// Push an item. Returns the item back if the queue is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(item);
        }
        inner.items.push_back(item);
        self.nonempty.notify_one();
        Ok(())
    }

    pub fn pop(&self, mode: PopMode) -> Option<T> {
        let (wait, force) = match mode {
            PopMode::Block => (true, false),
            PopMode::NoWait => (false, false),
            PopMode::Force => (true, true),
            PopMode::ForceNoWait => (false, true),
        };

        let mut inner = self.inner.lock();
        // One wait, then one more look, mirroring the original two-attempt
        // loop: a wakeup with an empty queue yields None rather than a
        // blocked worker.
        for attempt in 0..2 {
            if inner.closed && !force {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed && force {
                // Nothing left to drain.
                return None;
            }
            if attempt == 0 && wait {
                self.nonempty.wait(&mut inner);
            } else {
                break;
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.nonempty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = Queue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.pop(PopMode::NoWait), Some(1));
        assert_eq!(q.pop(PopMode::NoWait), Some(2));
        assert_eq!(q.pop(PopMode::NoWait), Some(3));
        assert_eq!(q.pop(PopMode::NoWait), None);
    }

    #[test]
    fn closed_queue_rejects_push_and_blocks_pop() {
        let q = Queue::new();
        q.push(7u32).unwrap();
        q.close();
        assert_eq!(q.push(8), Err(8));
        // A normal pop on a closed queue yields nothing...
        assert_eq!(q.pop(PopMode::NoWait), None);
        // ...but a forced pop drains what is left.
        assert_eq!(q.pop(PopMode::ForceNoWait), Some(7));
        assert_eq!(q.pop(PopMode::ForceNoWait), None);
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let q = Arc::new(Queue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop(PopMode::Block));
        thread::sleep(Duration::from_millis(20));
        q.push(42).unwrap();
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn close_wakes_blocked_poppers() {
        let q: Arc<Queue<u32>> = Arc::new(Queue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop(PopMode::Block));
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
    }
}
