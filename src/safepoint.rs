use std::{
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::runtime::{Checkpoint, MutatorThread};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    /// Running managed code; must reach [`GlobalSafepoint::poll`] regularly.
    Runnable,
    /// Blocked or in native code; never touches the heap in this state.
    Suspended,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MutatorId(usize);

struct MutatorEntry {
    id: MutatorId,
    os_thread: ThreadId,
    thread: Arc<dyn MutatorThread>,
    state: ThreadState,
    pending: Vec<Arc<dyn Checkpoint>>,
    /// Checkpoints currently run on behalf of this thread, it may not become runnable meanwhile.
    held: usize,
}

#[derive(Default)]
struct SafepointState {
    next_id: usize,
    threads: Vec<MutatorEntry>,
    suspend_requested: usize,
}

impl SafepointState {
    fn entry(&mut self, id: MutatorId) -> Option<&mut MutatorEntry> {
        self.threads.iter_mut().find(|entry| entry.id == id)
    }
}

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection can be performed, or to run a checkpoint on every one of them.
#[derive(Default)]
pub struct GlobalSafepoint {
    state: Mutex<SafepointState>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread as a mutator. Blocks while a suspension is in progress.
    pub fn register(&self, thread: Arc<dyn MutatorThread>) -> MutatorId {
        let id = {
            let mut state = self.state.lock();
            let id = MutatorId(state.next_id);
            state.next_id += 1;
            state.threads.push(MutatorEntry {
                id,
                os_thread: thread::current().id(),
                thread,
                state: ThreadState::Suspended,
                pending: vec![],
                held: 0,
            });
            id
        };
        self.transition_to_runnable(id);
        id
    }

    pub fn unregister(&self, id: MutatorId) {
        let mut state = self.state.lock();
        state = self.run_pending(state, id);
        state.threads.retain(|entry| entry.id != id);
        self.cv_stopped.notify_all();
    }

    pub fn thread_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    pub fn state_of(&self, id: MutatorId) -> Option<ThreadState> {
        self.state.lock().entry(id).map(|entry| entry.state)
    }

    /// Runs every checkpoint queued for `id` with the lock released. Returns with the lock held
    /// and no checkpoint pending.
    fn run_pending<'a>(
        &'a self,
        mut state: MutexGuard<'a, SafepointState>,
        id: MutatorId,
    ) -> MutexGuard<'a, SafepointState> {
        loop {
            let next = state
                .entry(id)
                .filter(|entry| !entry.pending.is_empty())
                .map(|entry| (std::mem::take(&mut entry.pending), entry.thread.clone()));
            let (pending, thread) = match next {
                Some(next) => next,
                None => return state,
            };
            drop(state);
            for checkpoint in pending {
                checkpoint.run(&*thread);
            }
            state = self.state.lock();
        }
    }

    /// Safepoint poll of a runnable mutator: runs pending checkpoints and parks the thread while
    /// a suspension is requested.
    pub fn poll(&self, id: MutatorId) {
        let mut state = self.run_pending(self.state.lock(), id);
        if state.suspend_requested == 0 {
            return;
        }
        if let Some(entry) = state.entry(id) {
            entry.state = ThreadState::Suspended;
        }
        self.cv_stopped.notify_all();
        drop(state);
        self.transition_to_runnable(id);
    }

    /// Leaves managed code, e.g. before blocking. Pending checkpoints are run first.
    pub fn transition_to_suspended(&self, id: MutatorId) {
        let mut state = self.run_pending(self.state.lock(), id);
        if let Some(entry) = state.entry(id) {
            entry.state = ThreadState::Suspended;
        }
        self.cv_stopped.notify_all();
    }

    /// Re-enters managed code, waiting until no suspension is in progress.
    pub fn transition_to_runnable(&self, id: MutatorId) {
        let mut state = self.state.lock();
        loop {
            let held = state.entry(id).map(|entry| entry.held).unwrap_or(0);
            if state.suspend_requested == 0 && held == 0 {
                break;
            }
            self.cv_resume.wait(&mut state);
        }
        if let Some(entry) = state.entry(id) {
            entry.state = ThreadState::Runnable;
        }
    }

    /// Requests `checkpoint` on every registered thread. Runnable threads run it at their next
    /// poll; suspended threads and the calling thread have it run here. Returns the number of
    /// threads the checkpoint is run for.
    pub fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize {
        let me = thread::current().id();
        let mut on_behalf = vec![];
        let count = {
            let mut state = self.state.lock();
            for entry in state.threads.iter_mut() {
                if entry.os_thread == me || entry.state == ThreadState::Suspended {
                    entry.held += 1;
                    on_behalf.push((entry.id, entry.thread.clone()));
                } else {
                    entry.pending.push(checkpoint.clone());
                }
            }
            state.threads.len()
        };
        log::trace!(
            "checkpoint requested on {} threads, {} run by requester",
            count,
            on_behalf.len()
        );
        for (_, thread) in on_behalf.iter() {
            checkpoint.run(&**thread);
        }
        if !on_behalf.is_empty() {
            let mut state = self.state.lock();
            for (id, _) in on_behalf {
                if let Some(entry) = state.entry(id) {
                    entry.held -= 1;
                }
            }
            self.cv_resume.notify_all();
        }
        count
    }

    /// Stops every registered thread other than the caller at a safepoint.
    pub fn suspend_all(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        state.suspend_requested += 1;
        while state
            .threads
            .iter()
            .any(|entry| entry.os_thread != me && entry.state == ThreadState::Runnable)
        {
            self.cv_stopped.wait(&mut state);
        }
    }

    pub fn resume_all(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.suspend_requested > 0);
        state.suspend_requested = state.suspend_requested.saturating_sub(1);
        self.cv_resume.notify_all();
    }
}

/// Counting barrier: [`Barrier::increment`] blocks until as many [`Barrier::pass`] calls as
/// the increment have happened, before or after it.
pub struct Barrier {
    count: Mutex<isize>,
    condition: Condvar,
}

impl Barrier {
    pub fn new(count: isize) -> Self {
        Self {
            count: Mutex::new(count),
            condition: Condvar::new(),
        }
    }

    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.condition.notify_all();
        }
    }

    pub fn increment(&self, delta: isize) {
        let mut count = self.count.lock();
        *count += delta;
        while *count != 0 {
            self.condition.wait(&mut count);
        }
    }
}
