//! Work-stealing execution of collector tasks on the heap's thread pool.
//!
//! Tasks are seeded into a global injector; every worker drains its own LIFO queue first, then
//! the injector, then steals from a random sibling. Tasks may push follow-up tasks into the
//! queue of the worker running them.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;

/// Runs `tasks` on `n_workers` workers: the calling thread plus `n_workers - 1` threads of
/// `pool`. Returns once every task, including the ones pushed while running, is done.
pub fn run_tasks<T, F>(pool: &mut Pool, n_workers: usize, tasks: Vec<T>, run: F)
where
    T: Send,
    F: Fn(T, &mut TaskQueue<'_, T>) + Sync,
{
    let n_workers = n_workers.clamp(1, pool.thread_count() as usize + 1);
    let injector = Injector::new();
    let n_tasks = tasks.len();
    for task in tasks {
        injector.push(task);
    }
    let mut workers = Vec::with_capacity(n_workers);
    let mut stealers = Vec::with_capacity(n_workers);
    for _ in 0..n_workers {
        let w = Worker::new_lifo();
        stealers.push(w.stealer());
        workers.push(w);
    }
    log::trace!("running {} tasks on {} workers", n_tasks, n_workers);

    let terminator = Terminator::new(n_workers);
    let run = &run;
    let mut queues = workers
        .into_iter()
        .enumerate()
        .map(|(task_id, worker)| TaskQueue {
            task_id,
            worker,
            injector: &injector,
            stealers: &stealers,
            terminator: &terminator,
        })
        .collect::<Vec<_>>();
    let mut own = queues.remove(0);
    if queues.is_empty() {
        own.run(run);
        return;
    }
    pool.scoped(|scoped| {
        for mut queue in queues {
            scoped.execute(move || queue.run(run));
        }
        own.run(run);
    });
}

/// Queue of one worker, handed to every task it runs.
pub struct TaskQueue<'a, T> {
    task_id: usize,
    worker: Worker<T>,
    injector: &'a Injector<T>,
    stealers: &'a [Stealer<T>],
    terminator: &'a Terminator,
}

impl<'a, T> TaskQueue<'a, T> {
    /// Makes `task` available to this worker and to thieves.
    pub fn push(&mut self, task: T) {
        self.worker.push(task);
    }

    pub fn worker_id(&self) -> usize {
        self.task_id
    }

    fn pop(&mut self) -> Option<T> {
        self.pop_worker()
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_worker(&mut self) -> Option<T> {
        self.worker.pop()
    }

    fn pop_global(&mut self) -> Option<T> {
        loop {
            let result = self.injector.steal_batch_and_pop(&self.worker);

            match result {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }

        None
    }

    fn steal(&self) -> Option<T> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;

            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];

            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn run<F>(&mut self, run: &F)
    where
        F: Fn(T, &mut TaskQueue<'a, T>),
    {
        loop {
            let task = if let Some(task) = self.pop() {
                task
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            run(task, self);
        }
    }
}

/// Detects the point where every worker ran out of work at the same time.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Acquire);

        loop {
            if nworkers == 0 {
                return true;
            }

            let result = self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            match result {
                Ok(_) => {
                    // Still workers running, they may publish more tasks.
                    return false;
                }

                Err(prev_nworkers) => {
                    nworkers = prev_nworkers;
                }
            }
        }
    }
}
