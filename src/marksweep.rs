//! The mark-sweep collector. One instance runs one collection; [`GcType`] selects which spaces
//! are collected and [`MarkSweep::is_concurrent`] whether marking overlaps with the mutators.
use std::sync::atomic::Ordering;

use parking_lot::RwLockWriteGuard;

use crate::{
    gc_base::{GarbageCollector, GcPhase, GcStats, GcType},
    gcref::ObjectRef,
    heap::Heap,
    internal::{card_table::CardTable, heap_bitmap::HeapBitmap},
    marking::{ImmuneRange, MarkCounters, Marker},
    reference_processor::ReferenceQueues,
    runtime::Runtime,
    space::GcRetentionPolicy,
    statistics::TimingLogger,
    visitor::NonNullReferences,
};

pub(crate) fn collector_name(gc_type: GcType, concurrent: bool) -> &'static str {
    match (gc_type, concurrent) {
        (GcType::Sticky, false) => "sticky mark sweep",
        (GcType::Sticky, true) => "sticky concurrent mark sweep",
        (GcType::Partial, false) => "partial mark sweep",
        (GcType::Partial, true) => "partial concurrent mark sweep",
        (GcType::Full, false) => "mark sweep",
        (GcType::Full, true) => "concurrent mark sweep",
    }
}

pub struct MarkSweep<'h> {
    pub(crate) heap: &'h Heap,
    name: &'static str,
    pub(crate) gc_type: GcType,
    concurrent: bool,
    clear_soft_references: bool,
    pub(crate) marker: Marker,
    pub(crate) references: ReferenceQueues,
    pub(crate) counters: MarkCounters,
    /// Size of the live stack right after the stacks were swapped. Nothing may be pushed onto
    /// it until the collection ends.
    live_stack_freeze_size: usize,
    pub(crate) timings: TimingLogger,
    pub(crate) stats: GcStats,
}

impl<'h> MarkSweep<'h> {
    pub fn new(heap: &'h Heap, gc_type: GcType, concurrent: bool, clear_soft_references: bool) -> Self {
        let name = collector_name(gc_type, concurrent);
        Self {
            heap,
            name,
            gc_type,
            concurrent,
            clear_soft_references,
            marker: Marker::default(),
            references: ReferenceQueues::default(),
            counters: MarkCounters::default(),
            live_stack_freeze_size: 0,
            timings: TimingLogger::new(name, heap.config.verbose),
            stats: GcStats::default(),
        }
    }

    pub fn immune_range(&self) -> ImmuneRange {
        self.marker.immune
    }

    pub fn timings(&self) -> &TimingLogger {
        &self.timings
    }

    /// Adds space `index` to the immune range. Its objects count as marked, so its mark bitmap
    /// is bound to the live bitmap.
    fn immune_space(&mut self, bitmaps: &mut HeapBitmap, index: usize) {
        let spaces = &self.heap.spaces;
        if !bitmaps.space(index).is_shared() {
            bitmaps.bind_live_to_mark(index);
        }
        let previous = index.checked_sub(1).map(|prev| &spaces[prev]);
        self.marker.immune.add_space(&spaces[index], previous);
    }

    /// Makes the spaces left alone by this collection immune. Sticky collections also treat
    /// everything live in the collected spaces as marked.
    fn bind_bitmaps(&mut self, bitmaps: &mut HeapBitmap) {
        self.timings.start_split("BindBitmaps");
        let heap = self.heap;
        for space in heap.spaces.iter() {
            let immune = match space.gc_retention_policy() {
                GcRetentionPolicy::NeverCollect => true,
                GcRetentionPolicy::FullCollect => self.gc_type != GcType::Full,
                GcRetentionPolicy::AlwaysCollect => false,
            };
            if immune {
                self.immune_space(bitmaps, space.index());
            }
        }
        if self.gc_type == GcType::Sticky {
            for space in heap.spaces.iter() {
                if space.gc_retention_policy() == GcRetentionPolicy::AlwaysCollect {
                    bitmaps.bind_live_to_mark(space.index());
                }
            }
            heap.large_objects.copy_live_to_mark();
        }
        log::trace!(
            "{}: immune range {:#x}-{:#x}",
            self.name,
            self.marker.immune.begin(),
            self.marker.immune.end()
        );
        self.timings.end_split();
    }

    fn un_bind_bitmaps(&mut self, bitmaps: &mut HeapBitmap) {
        self.timings.start_split("UnBindBitmaps");
        for space in self.heap.spaces.iter() {
            if bitmaps.unbind(space.index()) {
                log::trace!("unbound bitmaps of {}", space.name());
            }
        }
        self.timings.end_split();
    }

    /// The mark bitmap of the first always-collect space is tried before any lookup.
    fn find_default_mark_bitmap(&mut self) {
        self.timings.start_split("FindDefaultMarkBitmap");
        let heap = self.heap;
        let default = heap
            .spaces
            .iter()
            .find(|space| space.gc_retention_policy() == GcRetentionPolicy::AlwaysCollect);
        match default {
            Some(space) => self.marker.default_space = Some(space.index()),
            None => heap.fatal(format_args!("could not find a default mark bitmap")),
        }
        self.timings.end_split();
    }

    fn mark_reachable_objects(&mut self, bitmaps: &HeapBitmap) {
        let heap = self.heap;
        if self.gc_type == GcType::Sticky {
            // Everything reachable is referenced by a root or sits on an aged card, the card
            // scan finds the roots again.
            heap.mark_stack.lock().reset();
            self.scan_large_objects(bitmaps);
            self.recursive_mark_dirty_objects(bitmaps, false, CardTable::CARD_AGED);
        } else {
            // New allocations stay out of the live bitmap, so sweeping can run concurrently.
            self.timings.start_split("MarkStackAsLive");
            {
                let mut stacks = heap.stacks.write();
                heap.mark_alloc_stack(bitmaps, &stacks.live);
                stacks.live.reset();
            }
            self.timings.end_split();
            self.recursive_mark(bitmaps);
        }
    }

    /// Large objects have no cards. The old ones are all scanned, since the write barrier
    /// cannot tell which of them point to new objects.
    fn scan_large_objects(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("ScanLargeObjects");
        let heap = self.heap;
        let live = heap.large_objects.lock().live.iter().copied().collect::<Vec<_>>();
        let mut stack = heap.mark_stack.lock();
        for obj in live {
            self.scan_object_serial(bitmaps, &mut stack, obj);
        }
        drop(stack);
        self.timings.end_split();
    }

    /// Checks that the references held by image objects into collected spaces are marked.
    fn verify_image_roots(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("VerifyImageRoots");
        let heap = self.heap;
        let model = &*heap.object_model;
        for space in heap.spaces.iter().filter(|space| space.is_image_space()) {
            bitmaps
                .live_bitmap(space.index())
                .visit_marked_range(space.begin(), space.end(), |obj| {
                    model.visit_references(
                        obj,
                        &mut NonNullReferences(|reference: ObjectRef| {
                            let collected = heap.spaces.iter().any(|space| {
                                space.gc_retention_policy() == GcRetentionPolicy::AlwaysCollect
                                    && space.has_address(reference)
                            });
                            if collected && !self.is_marked(bitmaps, reference) {
                                log::warn!(
                                    "image object {:p} references unmarked {:p}",
                                    obj,
                                    reference
                                );
                            }
                        }),
                    );
                });
        }
        self.timings.end_split();
    }

    /// Checks every reference against the marks before anything is freed.
    fn pre_sweeping_gc_verification(&mut self, bitmaps: &mut RwLockWriteGuard<'h, HeapBitmap>) {
        if !self.heap.config.verify_post_gc_heap {
            return;
        }
        self.timings.start_split("PreSweepingGcVerification");
        // Marks become the live set for the check. Bound bitmaps stay as they are.
        self.swap_bitmaps(bitmaps);
        if !self.heap.verify_heap_references(bitmaps) {
            self.heap.fatal(format_args!(
                "pre sweeping {} GC verification failed",
                self.name
            ));
        }
        self.swap_bitmaps(bitmaps);
        self.timings.end_split();
    }

    /// Runs the runtime's weak tables through the live check. Every entry left after sweeping
    /// has to be alive.
    fn verify_system_weaks(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("VerifySystemWeaks");
        let heap = self.heap;
        heap.runtime.sweep_system_weaks(&|obj| {
            if !heap.is_live_object_locked(bitmaps, obj, true, false) {
                heap.fatal(format_args!("found dead object {:p} in system weaks", obj));
            }
            true
        });
        self.timings.end_split();
    }

    fn sweep_system_weaks(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("SweepSystemWeaks");
        self.heap
            .runtime
            .sweep_system_weaks(&|obj| self.is_marked(bitmaps, obj));
        self.timings.end_split();
    }

    /// Clears the mark of every object allocated during this collection, so the next sticky
    /// collection may reclaim them.
    fn un_mark_alloc_stack(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("UnMarkAllocStack");
        let heap = self.heap;
        let stacks = heap.stacks.read();
        for obj in stacks.allocation.iter() {
            if !self.marker.immune.contains(obj) {
                self.marker.un_mark_object_non_null(heap, bitmaps, obj);
            }
        }
        self.timings.end_split();
    }
}

impl<'h> GarbageCollector for MarkSweep<'h> {
    fn name(&self) -> &str {
        self.name
    }

    fn gc_type(&self) -> GcType {
        self.gc_type
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    fn runtime(&self) -> &dyn Runtime {
        &*self.heap.runtime
    }

    fn stats(&self) -> &GcStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut GcStats {
        &mut self.stats
    }

    fn set_phase(&self, phase: GcPhase) {
        self.heap.set_gc_phase(phase);
    }

    fn initialize_phase(&mut self) {
        self.timings.reset();
        self.timings.start_split("InitializePhase");
        self.marker = Marker::default();
        self.references = ReferenceQueues::default();
        self.counters = MarkCounters::default();
        self.live_stack_freeze_size = 0;
        debug_assert!(self.heap.mark_stack.lock().is_empty());
        self.timings.end_split();
        self.find_default_mark_bitmap();
        self.timings.start_split("PreGcVerification");
        self.heap.pre_gc_verification(self.name);
        self.timings.end_split();
    }

    fn marking_phase(&mut self) {
        let heap = self.heap;
        {
            let mut bitmaps = heap.heap_bitmap_lock.write();
            self.bind_bitmaps(&mut bitmaps);
        }
        self.find_default_mark_bitmap();

        self.timings.start_split("ProcessCards");
        heap.process_cards();
        self.timings.end_split();

        self.timings.start_split("SwapStacks");
        heap.swap_stacks();
        self.timings.end_split();

        let mut bitmaps = heap.heap_bitmap_lock.write();
        if !self.concurrent {
            self.mark_roots(&bitmaps);
        } else {
            // Thread roots are marked by the threads themselves at their next safepoint.
            self.mark_roots_checkpoint(&mut bitmaps);
            self.mark_non_thread_roots(&bitmaps);
        }
        self.live_stack_freeze_size = heap.stacks.read().live.size();
        self.mark_concurrent_roots(&bitmaps);
        self.update_and_mark_mod_union(&bitmaps);
        self.mark_reachable_objects(&bitmaps);
    }

    fn handle_dirty_objects_phase(&mut self) -> bool {
        let heap = self.heap;
        let mut bitmaps = heap.heap_bitmap_lock.write();
        self.re_mark_roots(&bitmaps);
        self.recursive_mark_dirty_objects(&bitmaps, true, CardTable::CARD_DIRTY);

        let clear_soft = self.clear_soft_references;
        self.process_references(&bitmaps, clear_soft);

        if heap.config.verify_any() {
            // Objects allocated during marking that nothing reaches are freed now, so no live
            // stack entry can point to them later.
            let mut stacks = heap.stacks.write();
            self.sweep_array(&bitmaps, &mut stacks.allocation, false);
        }

        self.pre_sweeping_gc_verification(&mut bitmaps);

        let live_stack_size = heap.stacks.read().live.size();
        if live_stack_size > self.live_stack_freeze_size {
            heap.fatal(format_args!(
                "live stack grew from {} to {} entries during marking",
                self.live_stack_freeze_size, live_stack_size
            ));
        }

        let dirty = heap
            .spaces
            .iter()
            .map(|space| {
                heap.card_table
                    .count_cards(space.begin(), space.end(), CardTable::CARD_DIRTY)
            })
            .sum::<usize>();
        log::debug!("{}: {} cards still dirty after remark", self.name, dirty);

        heap.runtime.disallow_new_system_weaks();
        true
    }

    fn reclaim_phase(&mut self) {
        let heap = self.heap;
        if !self.concurrent {
            let bitmaps = heap.heap_bitmap_lock.write();
            let clear_soft = self.clear_soft_references;
            self.process_references(&bitmaps, clear_soft);
        }

        {
            let bitmaps = heap.heap_bitmap_lock.write();
            self.sweep_system_weaks(&bitmaps);
        }

        if cfg!(debug_assertions) {
            let bitmaps = heap.heap_bitmap_lock.read();
            self.verify_image_roots(&bitmaps);
        }

        if self.concurrent {
            heap.runtime.allow_new_system_weaks();
            let bitmaps = heap.heap_bitmap_lock.write();
            self.un_mark_alloc_stack(&bitmaps);
        }

        let mut bitmaps = heap.heap_bitmap_lock.write();
        if !self.concurrent {
            self.pre_sweeping_gc_verification(&mut bitmaps);
        }
        if self.gc_type == GcType::Sticky {
            let mut stacks = heap.stacks.write();
            self.sweep_array(&bitmaps, &mut stacks.live, false);
        } else {
            self.sweep(&bitmaps, false);
        }
        self.swap_bitmaps(&mut bitmaps);
        self.stats.swap_bitmaps = true;
        self.un_bind_bitmaps(&mut bitmaps);
    }

    fn finish_phase(&mut self) {
        let heap = self.heap;
        self.timings.start_split("FinishPhase");

        self.timings.start_split("EnqueueClearedReferences");
        let cleared = self.take_cleared_references();
        if !cleared.is_empty() {
            log::debug!("{}: enqueueing {} cleared references", self.name, cleared.len());
            heap.runtime.enqueue_cleared_references(cleared);
        }

        self.timings.new_split("PostGcVerification");
        if heap.config.verify_system_weaks {
            let bitmaps = heap.heap_bitmap_lock.read();
            self.verify_system_weaks(&bitmaps);
        }

        self.timings.new_split("GrowForUtilization");
        heap.grow_for_utilization(self.gc_type, self.stats.duration);
        self.timings.end_split();

        if !heap.mark_stack.lock().is_empty() {
            heap.fatal(format_args!("mark stack not empty after {}", self.name));
        }
        log::trace!(
            "{}: {} work chunks, {} references delayed",
            self.name,
            self.counters.work_chunks_created.load(Ordering::Relaxed),
            self.counters.references.load(Ordering::Relaxed)
        );

        {
            let bitmaps = heap.heap_bitmap_lock.write();
            for space in heap.spaces.iter() {
                if space.gc_retention_policy() != GcRetentionPolicy::NeverCollect {
                    bitmaps.mark_bitmap(space.index()).clear_all();
                }
            }
        }
        heap.mark_stack.lock().reset();
        heap.large_objects.clear_mark();
        self.timings.end_split();

        heap.record_collector_totals(self.gc_type, self.concurrent, &self.stats, &self.timings);
    }
}
