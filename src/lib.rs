//! Concurrent, parallel and generational mark-sweep collection engine.
//!
//! The crate owns the collector side of a managed heap: per-space mark/live bitmaps, the card
//! table fed by the write barrier, mod-union tables for immune spaces and the mark-sweep
//! collector itself. Object layout, roots, threads and allocation are supplied by the embedder
//! through the traits in [`runtime`].
use std::time::Duration;

use error::HeapError;
use utils::{KB, MB};

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod error;
pub mod gc_base;
pub mod gcref;
pub mod heap;
pub mod internal;
pub mod large_space;
pub mod marking;
pub mod marksweep;
pub mod mmap;
pub mod reference_processor;
pub mod runtime;
pub mod safepoint;
pub mod space;
pub mod statistics;
pub mod sweeper;
pub mod task_scheduler;
pub mod utils;
pub mod visitor;

#[cfg(test)]
mod tests;

pub use gc_base::{GarbageCollector, GcCause, GcType};
pub use gcref::{MemberOffset, ObjectRef};
pub use heap::Heap;
pub use space::{GcRetentionPolicy, SpaceConfig};

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address range the card table covers, starting at the lowest space.
    pub heap_size: usize,
    /// Footprint allowed before the first collection.
    pub initial_size: usize,
    /// Footprint the heap never grows past.
    pub growth_limit: usize,
    /// Minimum and maximum free bytes left after a collection.
    pub min_free: usize,
    pub max_free: usize,
    /// Wanted ratio of live bytes to footprint after a collection.
    pub target_utilization: f64,
    /// Workers used while mutators are suspended.
    pub parallel_gc_threads: usize,
    /// Workers used while mutators run.
    pub conc_gc_threads: usize,
    /// Enables concurrent marking and background collections.
    pub concurrent_gc: bool,
    /// Without this, marking stays on the collector thread.
    pub care_about_pause_times: bool,
    /// Sticky collections are promoted to partial ones while the allocation space is smaller.
    pub min_alloc_space_size_for_sticky_gc: usize,
    pub long_pause_log_threshold: Duration,
    pub long_gc_log_threshold: Duration,
    /// Initial mark stack capacity in entries. The stack doubles when it overflows.
    pub mark_stack_size: usize,
    /// Capacity of the allocation and live stacks in entries.
    pub allocation_stack_size: usize,
    /// Seed marking from recursive bitmap range tasks instead of the mark stack only.
    pub use_recursive_mark: bool,
    pub verify_pre_gc_heap: bool,
    pub verify_post_gc_heap: bool,
    pub verify_missing_card_marks: bool,
    pub verify_mod_union_table: bool,
    pub verify_system_weaks: bool,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            heap_size: 256 * MB,
            initial_size: 4 * MB,
            growth_limit: 64 * MB,
            min_free: 512 * KB,
            max_free: 2 * MB,
            target_utilization: 0.5,
            parallel_gc_threads: cpus - 1,
            conc_gc_threads: 0,
            concurrent_gc: true,
            care_about_pause_times: true,
            min_alloc_space_size_for_sticky_gc: 2 * MB,
            long_pause_log_threshold: Duration::from_millis(5),
            long_gc_log_threshold: Duration::from_millis(100),
            mark_stack_size: 64 * KB,
            allocation_stack_size: 256 * KB,
            use_recursive_mark: false,
            verify_pre_gc_heap: false,
            verify_post_gc_heap: false,
            verify_missing_card_marks: false,
            verify_mod_union_table: false,
            verify_system_weaks: false,
            verbose: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), HeapError> {
        let invalid = |what: String| Err(HeapError::InvalidConfig(what));
        if self.heap_size == 0 {
            return invalid("heap_size must not be zero".to_owned());
        }
        if self.initial_size > self.growth_limit {
            return invalid(format!(
                "initial_size ({}) exceeds growth_limit ({})",
                self.initial_size, self.growth_limit
            ));
        }
        if self.growth_limit > self.heap_size {
            return invalid(format!(
                "growth_limit ({}) exceeds heap_size ({})",
                self.growth_limit, self.heap_size
            ));
        }
        if self.min_free > self.max_free {
            return invalid(format!(
                "min_free ({}) exceeds max_free ({})",
                self.min_free, self.max_free
            ));
        }
        if !(self.target_utilization > 0.0 && self.target_utilization < 1.0) {
            return invalid(format!(
                "target_utilization ({}) must be within (0, 1)",
                self.target_utilization
            ));
        }
        if self.mark_stack_size == 0 || self.allocation_stack_size == 0 {
            return invalid("stack sizes must not be zero".to_owned());
        }
        Ok(())
    }

    /// Whether a heap walk may run that must not see unreachable objects allocated during
    /// concurrent marking.
    pub fn verify_any(&self) -> bool {
        self.verify_pre_gc_heap || self.verify_post_gc_heap || self.verify_missing_card_marks
    }
}
