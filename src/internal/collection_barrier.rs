use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::gc_base::GcType;

struct CollectionState {
    is_gc_running: bool,
    last_gc_type: Option<GcType>,
    total_wait_time: Duration,
}

/// Serialises collections and lets threads wait for a running one to finish.
pub struct CollectionBarrier {
    mutex: Mutex<CollectionState>,
    cv_wakeup: Condvar,
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(CollectionState {
                is_gc_running: false,
                last_gc_type: None,
                total_wait_time: Duration::ZERO,
            }),
            cv_wakeup: Condvar::new(),
        }
    }

    pub fn is_gc_running(&self) -> bool {
        self.mutex.lock().is_gc_running
    }

    pub fn last_gc_type(&self) -> Option<GcType> {
        self.mutex.lock().last_gc_type
    }

    pub fn total_wait_time(&self) -> Duration {
        self.mutex.lock().total_wait_time
    }

    /// Blocks while a collection is running. Returns the type of that collection, or `None`
    /// if there was nothing to wait for.
    pub fn wait_for_gc_to_complete(&self) -> Option<GcType> {
        let mut state = self.mutex.lock();
        if !state.is_gc_running {
            return None;
        }
        let start = Instant::now();
        while state.is_gc_running {
            self.cv_wakeup.wait(&mut state);
        }
        let waited = start.elapsed();
        state.total_wait_time += waited;
        log::debug!("waited {:?} for a running collection", waited);
        state.last_gc_type
    }

    /// Claims the right to collect, waiting for any running collection first.
    pub fn start_collection(&self) {
        let mut state = self.mutex.lock();
        while state.is_gc_running {
            self.cv_wakeup.wait(&mut state);
        }
        state.is_gc_running = true;
    }

    /// Releases the collection claim and wakes every waiter.
    pub fn finish_collection(&self, gc_type: GcType) {
        let mut state = self.mutex.lock();
        debug_assert!(state.is_gc_running);
        state.is_gc_running = false;
        state.last_gc_type = Some(gc_type);
        self.cv_wakeup.notify_all();
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_see_last_collection() {
        let barrier = CollectionBarrier::new();
        assert_eq!(barrier.wait_for_gc_to_complete(), None);
        barrier.start_collection();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| barrier.wait_for_gc_to_complete());
            while !barrier.is_gc_running() {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(5));
            barrier.finish_collection(GcType::Partial);
            let seen = waiter.join().unwrap();
            assert!(seen == Some(GcType::Partial) || seen.is_none());
        });
        assert_eq!(barrier.last_gc_type(), Some(GcType::Partial));
        assert!(!barrier.is_gc_running());
    }
}
