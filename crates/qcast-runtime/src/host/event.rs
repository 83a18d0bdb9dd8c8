//! Host events: generation counters with condition-variable completion.
//!
//! Recording an event bumps its generation at enqueue time; the stream that
//! recorded it marks that generation complete when the marker is reached. A
//! wait captures the generation current at enqueue time and is released only
//! once that record itself has completed: records on different streams may
//! finish out of order, and a later one never stands in for an earlier one.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Finished records: every generation up to `watermark`, plus the ones
/// above it that completed out of order.
#[derive(Default)]
struct Completion {
    watermark: u64,
    finished: BTreeSet<u64>,
}

impl Completion {
    fn insert(&mut self, generation: u64) {
        if generation <= self.watermark {
            return;
        }
        self.finished.insert(generation);
        while self.finished.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }

    fn contains(&self, generation: u64) -> bool {
        generation <= self.watermark || self.finished.contains(&generation)
    }
}

struct EventState {
    id: u64,
    recorded: AtomicU64,
    completed: Mutex<Completion>,
    cond: Condvar,
    destroyed: AtomicBool,
}

#[derive(Clone)]
pub struct HostEvent {
    inner: Arc<EventState>,
}

impl HostEvent {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(EventState {
                id,
                recorded: AtomicU64::new(0),
                completed: Mutex::new(Completion::default()),
                cond: Condvar::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Claim the generation of a new record.
    pub(crate) fn next_generation(&self) -> u64 {
        self.inner.recorded.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Generation of the latest enqueued record (0 if never recorded).
    pub(crate) fn recorded_generation(&self) -> u64 {
        self.inner.recorded.load(Ordering::Acquire)
    }

    pub(crate) fn complete(&self, generation: u64) {
        self.inner.completed.lock().insert(generation);
        self.inner.cond.notify_all();
    }

    /// Block the calling worker until record `generation` has completed.
    pub(crate) fn wait_for(&self, generation: u64) {
        let mut done = self.inner.completed.lock();
        while !done.contains(generation) {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Whether every enqueued record has completed.
    pub fn query(&self) -> bool {
        self.inner.completed.lock().watermark >= self.recorded_generation()
    }

    pub(crate) fn mark_destroyed(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostEvent(id={}, recorded={})",
            self.inner.id,
            self.recorded_generation()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_never_recorded_is_complete() {
        let e = HostEvent::new(1);
        assert!(e.query());
        e.wait_for(e.recorded_generation());
    }

    #[test]
    fn test_wait_blocks_until_complete() {
        let e = HostEvent::new(2);
        let g = e.next_generation();
        assert!(!e.query());
        let e2 = e.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            e2.complete(g);
        });
        e.wait_for(g);
        assert!(e.query());
        h.join().unwrap();
    }

    #[test]
    fn test_later_record_does_not_release_earlier_wait() {
        let e = HostEvent::new(3);
        let g1 = e.next_generation();
        let g2 = e.next_generation();
        e.complete(g2);
        assert!(!e.query());

        let released = Arc::new(AtomicBool::new(false));
        let (e2, r) = (e.clone(), Arc::clone(&released));
        let h = thread::spawn(move || {
            e2.wait_for(g1);
            r.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));

        e.complete(g1);
        h.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert!(e.query());
        // both records below the watermark now
        e.wait_for(g2);
    }
}
