use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::runtime::Runtime;

/// Scope of one collection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum GcType {
    /// Only objects allocated since the last collection.
    Sticky,
    /// Everything except the zygote and image spaces.
    Partial,
    /// Everything except the image spaces.
    Full,
}

impl GcType {
    pub const ALL: [GcType; 3] = [GcType::Sticky, GcType::Partial, GcType::Full];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for GcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcType::Sticky => write!(f, "sticky"),
            GcType::Partial => write!(f, "partial"),
            GcType::Full => write!(f, "full"),
        }
    }
}

/// Why a collection was started.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcCause {
    /// An allocation could not be satisfied or the allocation stack overflowed.
    Alloc,
    /// Concurrent collection triggered by the allocation rate.
    Background,
    /// Requested by the embedder.
    Explicit,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcCause::Alloc => write!(f, "Alloc"),
            GcCause::Background => write!(f, "Background"),
            GcCause::Explicit => write!(f, "Explicit"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcPhase {
    None,
    Initialize,
    Marking,
    HandleDirty,
    Reclaim,
    Finish,
}

/// Outcome of one collection.
#[derive(Default, Clone, Debug)]
pub struct GcStats {
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub freed_large_objects: usize,
    pub freed_large_object_bytes: usize,
    pub pause_times: Vec<Duration>,
    pub duration: Duration,
    /// Whether live and mark bitmaps changed roles at the end of the collection.
    pub swap_bitmaps: bool,
}

impl GcStats {
    pub fn total_paused_time(&self) -> Duration {
        self.pause_times.iter().sum()
    }
}

/// Phase protocol of a collector: `Initialize -> Marking -> [HandleDirty]* -> Reclaim -> Finish`.
pub trait GarbageCollector {
    fn name(&self) -> &str;
    fn gc_type(&self) -> GcType;
    fn is_concurrent(&self) -> bool;
    fn runtime(&self) -> &dyn Runtime;

    fn stats(&self) -> &GcStats;
    fn stats_mut(&mut self) -> &mut GcStats;

    /// Publishes the current phase to other threads.
    fn set_phase(&self, phase: GcPhase);

    fn initialize_phase(&mut self);
    fn marking_phase(&mut self);
    /// Runs with mutators suspended. Returns `false` if the phase has to be repeated.
    fn handle_dirty_objects_phase(&mut self) -> bool;
    fn reclaim_phase(&mut self);
    fn finish_phase(&mut self);

    /// Runs one complete collection.
    fn run(&mut self) {
        let start = Instant::now();
        *self.stats_mut() = GcStats::default();
        self.set_phase(GcPhase::Initialize);
        self.initialize_phase();

        if !self.is_concurrent() {
            let pause_start = Instant::now();
            self.runtime().suspend_all();
            self.set_phase(GcPhase::Marking);
            self.marking_phase();
            self.set_phase(GcPhase::Reclaim);
            self.reclaim_phase();
            self.runtime().resume_all();
            self.register_pause(pause_start.elapsed());
        } else {
            self.set_phase(GcPhase::Marking);
            self.marking_phase();
            let mut done = false;
            while !done {
                let pause_start = Instant::now();
                self.runtime().suspend_all();
                self.set_phase(GcPhase::HandleDirty);
                done = self.handle_dirty_objects_phase();
                self.runtime().resume_all();
                self.register_pause(pause_start.elapsed());
            }
            self.set_phase(GcPhase::Reclaim);
            self.reclaim_phase();
        }

        self.stats_mut().duration = start.elapsed();
        self.set_phase(GcPhase::Finish);
        self.finish_phase();
        self.set_phase(GcPhase::None);
    }

    fn register_pause(&mut self, pause: Duration) {
        self.stats_mut().pause_times.push(pause);
    }

    fn freed_objects(&self) -> usize {
        self.stats().freed_objects
    }
    fn freed_bytes(&self) -> usize {
        self.stats().freed_bytes
    }
    fn freed_large_objects(&self) -> usize {
        self.stats().freed_large_objects
    }
    fn freed_large_object_bytes(&self) -> usize {
        self.stats().freed_large_object_bytes
    }
    fn pause_times(&self) -> &[Duration] {
        &self.stats().pause_times
    }
    fn duration(&self) -> Duration {
        self.stats().duration
    }
    fn swap_bitmaps(&self) -> bool {
        self.stats().swap_bitmaps
    }
}
