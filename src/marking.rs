//! Marking primitives, root marking and the parallel marking tasks of [`MarkSweep`].
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    gcref::ObjectRef,
    heap::Heap,
    internal::{
        card_table::CardTable, heap_bitmap::HeapBitmap, mod_union_table::ModUnionMarker,
        object_stack::ObjectStack, space_bitmap::ContinuousSpaceBitmap,
    },
    marksweep::MarkSweep,
    runtime::{Checkpoint, MutatorThread},
    safepoint::Barrier,
    space::{ContinuousSpace, GcRetentionPolicy},
    task_scheduler::{run_tasks, TaskQueue},
    utils::{round_up, KB},
    visitor::NonNullReferences,
};

/// Below this many entries the mark stack is drained on the collector thread.
pub const MINIMUM_PARALLEL_MARK_STACK_SIZE: usize = 128;
/// Capacity of the local stack of a marking task. Half of it is split off on overflow.
pub const MARK_STACK_TASK_SIZE: usize = KB;

/// Address range whose objects count as marked without touching a bitmap.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct ImmuneRange {
    begin: usize,
    end: usize,
}

impl ImmuneRange {
    pub const fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    #[inline]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        obj.address() >= self.begin && obj.address() < self.end
    }

    pub fn contains_space(&self, space: &ContinuousSpace) -> bool {
        !self.is_empty() && self.begin <= space.begin() && self.end >= space.end()
    }

    /// Adds `space` to the range. `previous` is the space right below it; a non-empty range is
    /// only extended when `previous` is already immune, keeping the range contiguous.
    pub fn add_space(&mut self, space: &ContinuousSpace, previous: Option<&ContinuousSpace>) {
        if self.is_empty() {
            self.begin = space.begin();
            self.end = space.end();
        } else if previous.map_or(false, |prev| self.contains_space(prev)) {
            self.begin = self.begin.min(space.begin());
            self.end = self.end.max(space.end());
        }
    }
}

/// Marking state shared by the collector thread, marking tasks and checkpoints.
#[derive(Clone, Copy, Default, Debug)]
pub struct Marker {
    pub immune: ImmuneRange,
    /// Space tried first when looking up the bitmap of an object.
    pub default_space: Option<usize>,
}

impl Marker {
    #[inline]
    fn mark_bitmap<'b>(
        &self,
        bitmaps: &'b HeapBitmap,
        obj: ObjectRef,
    ) -> Option<&'b ContinuousSpaceBitmap> {
        if let Some(index) = self.default_space {
            let bitmap = bitmaps.mark_bitmap(index);
            if bitmap.has_address(obj.address()) {
                return Some(bitmap);
            }
        }
        bitmaps.find_mark_bitmap(obj).map(|bitmap| &**bitmap)
    }

    pub fn is_marked(&self, heap: &Heap, bitmaps: &HeapBitmap, obj: ObjectRef) -> bool {
        if self.immune.contains(obj) {
            return true;
        }
        match self.mark_bitmap(bitmaps, obj) {
            Some(bitmap) => bitmap.test(obj),
            None => heap.large_objects.is_marked(obj),
        }
    }

    /// Sets or clears the mark of a large object. Returns `true` if the mark changed.
    fn mark_large_object(&self, heap: &Heap, obj: ObjectRef, set: bool) -> bool {
        if set && heap.large_objects.is_marked(obj) {
            return false;
        }
        if !heap.large_objects.contains(obj) {
            log::error!("tried to mark {:p} not contained by any spaces", obj);
            log::error!("attempting to see if it's a bad root");
            heap.verify_roots();
            heap.fatal(format_args!("can't mark bad root {:p}", obj));
        }
        if set {
            heap.large_objects.mark(obj)
        } else {
            heap.large_objects.unmark(obj)
        }
    }

    /// Marks `obj` and pushes it onto `stack` if it was not marked yet. Only valid on the thread
    /// owning `stack`.
    #[inline]
    pub fn mark_object_non_null(
        &self,
        heap: &Heap,
        bitmaps: &HeapBitmap,
        stack: &mut ObjectStack,
        obj: ObjectRef,
    ) {
        if self.immune.contains(obj) {
            return;
        }
        let newly_marked = match self.mark_bitmap(bitmaps, obj) {
            Some(bitmap) => !bitmap.set(obj),
            None => self.mark_large_object(heap, obj, true),
        };
        if newly_marked {
            if stack.is_full() {
                expand_mark_stack(heap, stack);
            }
            stack.push_back(obj);
        }
    }

    /// Marks `obj` with an atomic bitmap update. Returns `true` for the single thread that
    /// marked it.
    #[inline]
    pub fn mark_object_parallel(&self, heap: &Heap, bitmaps: &HeapBitmap, obj: ObjectRef) -> bool {
        if self.immune.contains(obj) {
            return false;
        }
        match self.mark_bitmap(bitmaps, obj) {
            Some(bitmap) => !bitmap.atomic_test_and_set(obj),
            None => self.mark_large_object(heap, obj, true),
        }
    }

    /// Marks a root from any thread, pushing it onto the shared mark stack.
    pub fn mark_root_parallel(&self, heap: &Heap, bitmaps: &HeapBitmap, obj: ObjectRef) {
        if self.mark_object_parallel(heap, bitmaps, obj) {
            let mut stack = heap.mark_stack.lock();
            if stack.is_full() {
                expand_mark_stack(heap, &mut stack);
            }
            stack.push_back(obj);
        }
    }

    pub fn un_mark_object_non_null(&self, heap: &Heap, bitmaps: &HeapBitmap, obj: ObjectRef) {
        debug_assert!(!self.immune.contains(obj));
        match self.mark_bitmap(bitmaps, obj) {
            Some(bitmap) => {
                bitmap.clear(obj);
            }
            None => {
                self.mark_large_object(heap, obj, false);
            }
        }
    }
}

/// Doubles the capacity of a full mark stack.
pub(crate) fn expand_mark_stack(heap: &Heap, stack: &mut ObjectStack) {
    let capacity = stack.capacity() * 2;
    log::debug!("expanding {} to {} entries", stack.name(), capacity);
    if let Err(err) = stack.resize(capacity) {
        heap.fatal(format_args!(
            "failed to grow {} to {} entries: {}",
            stack.name(),
            capacity,
            err
        ));
    }
}

/// Marks the roots of one thread into the shared mark stack, then passes the barrier.
pub(crate) struct CheckpointMarkThreadRoots {
    pub heap: Arc<Heap>,
    pub marker: Marker,
    pub barrier: Arc<Barrier>,
}

impl Checkpoint for CheckpointMarkThreadRoots {
    fn run(&self, thread: &dyn MutatorThread) {
        {
            let bitmaps = self.heap.heap_bitmap_lock.read();
            thread.visit_roots(&mut |root: ObjectRef| {
                self.marker.mark_root_parallel(&self.heap, &bitmaps, root);
            });
        }
        self.barrier.pass();
    }
}

/// Counters of the parallel marking machinery.
#[derive(Default, Debug)]
pub struct MarkCounters {
    pub work_chunks_created: AtomicUsize,
    pub work_chunks_deleted: AtomicUsize,
    pub cards_scanned: AtomicUsize,
    pub references: AtomicUsize,
}

/// Unit of parallel marking work. Every variant ends by draining its local stack.
pub(crate) enum MarkTask {
    /// Gray objects taken from the mark stack or split off an overflowing task.
    Chunk(Vec<ObjectRef>),
    /// Cards of `[begin, end)` in space `space`, plus a slice of the mark stack.
    CardScan {
        space: usize,
        begin: usize,
        end: usize,
        minimum_age: u8,
        objects: Vec<ObjectRef>,
    },
    /// Every object marked in `[begin, end)` of space `space`.
    BitmapRange {
        space: usize,
        begin: usize,
        end: usize,
    },
}

/// Visitor for the serial marking paths; everything goes through the shared mark stack.
struct SerialMarker<'a, 'h> {
    collector: &'a MarkSweep<'h>,
    bitmaps: &'a HeapBitmap,
    stack: &'a mut ObjectStack,
}

impl ModUnionMarker for SerialMarker<'_, '_> {
    fn mark_root(&mut self, obj: ObjectRef) {
        self.collector
            .marker
            .mark_object_non_null(self.collector.heap, self.bitmaps, self.stack, obj);
    }

    fn scan_root(&mut self, obj: ObjectRef) {
        self.collector
            .scan_object_serial(self.bitmaps, &mut *self.stack, obj);
    }
}

impl<'h> MarkSweep<'h> {
    /// 0 disables the thread pool, otherwise the number of workers including the caller.
    pub(crate) fn get_thread_count(&self, paused: bool) -> usize {
        let config = &self.heap.config;
        if !self.heap.has_thread_pool() || !config.care_about_pause_times {
            return 0;
        }
        if paused {
            config.parallel_gc_threads + 1
        } else {
            config.conc_gc_threads + 1
        }
    }

    pub(crate) fn is_marked(&self, bitmaps: &HeapBitmap, obj: ObjectRef) -> bool {
        self.marker.is_marked(self.heap, bitmaps, obj)
    }

    /// Marks `obj`, pushing it onto the shared mark stack if it was white.
    pub(crate) fn mark_object(&self, bitmaps: &HeapBitmap, obj: ObjectRef) {
        let mut stack = self.heap.mark_stack.lock();
        self.marker
            .mark_object_non_null(self.heap, bitmaps, &mut stack, obj);
    }

    /// Visits the outgoing references of `obj`, handing each non-null one to `mark`. Reference
    /// objects with a white referent are queued for reference processing.
    pub(crate) fn scan_object(
        &self,
        bitmaps: &HeapBitmap,
        obj: ObjectRef,
        mut mark: impl FnMut(ObjectRef),
    ) {
        let heap = self.heap;
        let model = &*heap.object_model;
        model.visit_references(obj, &mut NonNullReferences(|reference| mark(reference)));
        if let Some(kind) = model.reference_kind(obj) {
            self.delay_reference_referent(bitmaps, obj, kind);
        }
    }

    pub(crate) fn scan_object_serial(&self, bitmaps: &HeapBitmap, stack: &mut ObjectStack, obj: ObjectRef) {
        self.scan_object(bitmaps, obj, |reference| {
            self.marker
                .mark_object_non_null(self.heap, bitmaps, stack, reference)
        });
    }

    fn serial_marker<'a>(
        &'a self,
        bitmaps: &'a HeapBitmap,
        stack: &'a mut ObjectStack,
    ) -> SerialMarker<'a, 'h> {
        SerialMarker {
            collector: self,
            bitmaps,
            stack,
        }
    }

    /// Marks every root with mutators suspended.
    pub(crate) fn mark_roots(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("MarkRoots");
        let heap = self.heap;
        let mut stack = heap.mark_stack.lock();
        let marker = self.marker;
        heap.runtime
            .visit_non_concurrent_roots(&mut |root: ObjectRef| {
                marker.mark_object_non_null(heap, bitmaps, &mut stack, root)
            });
        self.timings.end_split();
    }

    pub(crate) fn mark_non_thread_roots(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("MarkNonThreadRoots");
        let heap = self.heap;
        let mut stack = heap.mark_stack.lock();
        let marker = self.marker;
        heap.runtime.visit_non_thread_roots(&mut |root: ObjectRef| {
            marker.mark_object_non_null(heap, bitmaps, &mut stack, root)
        });
        self.timings.end_split();
    }

    /// Marks the roots that may be visited while mutators run.
    pub(crate) fn mark_concurrent_roots(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("MarkConcurrentRoots");
        let heap = self.heap;
        let mut stack = heap.mark_stack.lock();
        let marker = self.marker;
        heap.runtime.visit_concurrent_roots(
            &mut |root: ObjectRef| marker.mark_object_non_null(heap, bitmaps, &mut stack, root),
            false,
            true,
        );
        self.timings.end_split();
    }

    /// Marks roots created or changed since the concurrent root marking.
    pub(crate) fn re_mark_roots(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("ReMarkRoots");
        let heap = self.heap;
        let mut stack = heap.mark_stack.lock();
        let marker = self.marker;
        heap.runtime.visit_roots(
            &mut |root: ObjectRef| marker.mark_object_non_null(heap, bitmaps, &mut stack, root),
            true,
            true,
        );
        self.timings.end_split();
    }

    /// Runs a checkpoint marking the roots of every mutator thread. The heap bitmap lock is
    /// released while waiting for the threads, which take it for reading themselves.
    pub(crate) fn mark_roots_checkpoint(
        &mut self,
        guard: &mut parking_lot::RwLockWriteGuard<'h, HeapBitmap>,
    ) {
        self.timings.start_split("MarkRootsCheckpoint");
        let heap = match self.heap.self_ref.upgrade() {
            Some(heap) => heap,
            None => self.heap.fatal(format_args!("heap dropped during marking")),
        };
        let barrier = Arc::new(Barrier::new(0));
        let checkpoint = Arc::new(CheckpointMarkThreadRoots {
            heap,
            marker: self.marker,
            barrier: barrier.clone(),
        });
        let runtime = &*self.heap.runtime;
        let count = parking_lot::RwLockWriteGuard::unlocked(guard, || {
            let count = runtime.run_checkpoint(checkpoint);
            barrier.increment(count as isize);
            count
        });
        log::trace!("thread roots marked by {} checkpoints", count);
        self.timings.end_split();
    }

    /// Replays the mod-union tables of the immune spaces into the mark stack.
    pub(crate) fn update_and_mark_mod_union(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("UpdateAndMarkModUnion");
        let heap = self.heap;
        let mut stack = heap.mark_stack.lock();
        heap.update_and_mark_mod_union(
            self.gc_type,
            bitmaps,
            &mut self.serial_marker(bitmaps, &mut stack),
        );
        drop(stack);
        self.timings.end_split();
    }

    /// Queues `reference` on the list of its kind if its referent is white.
    pub(crate) fn delay_reference_referent(
        &self,
        bitmaps: &HeapBitmap,
        reference: ObjectRef,
        kind: crate::runtime::ReferenceKind,
    ) {
        let heap = self.heap;
        let model = &*heap.object_model;
        let referent = match model.referent(reference) {
            Some(referent) => referent,
            None => return,
        };
        if self.is_marked(bitmaps, referent) {
            return;
        }
        self.counters.references.fetch_add(1, Ordering::Relaxed);
        // The same reference may be scanned more than once through dirty cards.
        self.references.queue(kind).enqueue_if_absent(model, reference);
    }

    /// Drains the shared mark stack, scanning every object on it.
    pub(crate) fn process_mark_stack(&mut self, bitmaps: &HeapBitmap, paused: bool) {
        self.timings.start_split("ProcessMarkStack");
        let heap = self.heap;
        let thread_count = self.get_thread_count(paused);
        let size = heap.mark_stack.lock().size();
        if thread_count > 1 && size >= MINIMUM_PARALLEL_MARK_STACK_SIZE {
            self.process_mark_stack_parallel(bitmaps, thread_count);
        } else {
            let mut stack = heap.mark_stack.lock();
            while let Some(obj) = stack.pop_back() {
                self.scan_object_serial(bitmaps, &mut stack, obj);
            }
        }
        self.timings.end_split();
    }

    fn process_mark_stack_parallel(&self, bitmaps: &HeapBitmap, thread_count: usize) {
        let tasks = {
            let mut stack = self.heap.mark_stack.lock();
            let chunk_size = (stack.size() / thread_count + 1).min(MARK_STACK_TASK_SIZE);
            let objects = stack.iter().collect::<Vec<_>>();
            stack.reset();
            objects
                .chunks(chunk_size)
                .map(|chunk| MarkTask::Chunk(chunk.to_vec()))
                .collect::<Vec<_>>()
        };
        self.run_mark_tasks(bitmaps, thread_count, tasks);
    }

    fn run_mark_tasks(&self, bitmaps: &HeapBitmap, thread_count: usize, tasks: Vec<MarkTask>) {
        self.counters
            .work_chunks_created
            .fetch_add(tasks.len(), Ordering::Relaxed);
        let mut pool = self.heap.thread_pool.lock();
        match pool.as_mut() {
            Some(pool) => run_tasks(pool, thread_count, tasks, |task, queue| {
                self.run_mark_task(bitmaps, task, queue)
            }),
            None => self.heap.fatal(format_args!("parallel marking without a thread pool")),
        }
        let created = self.counters.work_chunks_created.load(Ordering::Relaxed);
        let deleted = self.counters.work_chunks_deleted.load(Ordering::Relaxed);
        if created != deleted {
            self.heap.fatal(format_args!(
                "some of the work chunks were leaked ({} created, {} deleted)",
                created, deleted
            ));
        }
    }

    fn run_mark_task(
        &self,
        bitmaps: &HeapBitmap,
        task: MarkTask,
        queue: &mut TaskQueue<'_, MarkTask>,
    ) {
        let mut local = Vec::with_capacity(MARK_STACK_TASK_SIZE);
        match task {
            MarkTask::Chunk(objects) => local = objects,
            MarkTask::CardScan {
                space,
                begin,
                end,
                minimum_age,
                objects,
            } => {
                local = objects;
                let bitmap = bitmaps.mark_bitmap(space);
                let cards = self.heap.card_table.scan(
                    bitmap,
                    begin,
                    end,
                    |obj| self.scan_object_parallel(bitmaps, obj, &mut local, queue),
                    minimum_age,
                );
                self.counters
                    .cards_scanned
                    .fetch_add(cards, Ordering::Relaxed);
            }
            MarkTask::BitmapRange { space, begin, end } => {
                bitmaps.mark_bitmap(space).visit_marked_range(begin, end, |obj| {
                    self.scan_object_parallel(bitmaps, obj, &mut local, queue)
                });
            }
        }
        while let Some(obj) = local.pop() {
            self.scan_object_parallel(bitmaps, obj, &mut local, queue);
        }
        self.counters
            .work_chunks_deleted
            .fetch_add(1, Ordering::Relaxed);
    }

    fn scan_object_parallel(
        &self,
        bitmaps: &HeapBitmap,
        obj: ObjectRef,
        local: &mut Vec<ObjectRef>,
        queue: &mut TaskQueue<'_, MarkTask>,
    ) {
        self.scan_object(bitmaps, obj, |reference| {
            if self
                .marker
                .mark_object_parallel(self.heap, bitmaps, reference)
            {
                if local.len() >= MARK_STACK_TASK_SIZE {
                    // Overflow, give the upper half away as a new task.
                    let half = local.split_off(MARK_STACK_TASK_SIZE / 2);
                    self.counters
                        .work_chunks_created
                        .fetch_add(1, Ordering::Relaxed);
                    queue.push(MarkTask::Chunk(half));
                }
                local.push(reference);
            }
        });
    }

    /// Scans objects on cards at least `minimum_age` old.
    pub(crate) fn scan_gray_objects(&mut self, bitmaps: &HeapBitmap, paused: bool, minimum_age: u8) {
        let heap = self.heap;
        let thread_count = self.get_thread_count(paused);
        if thread_count > 0 {
            self.timings.start_split(if paused {
                "(Paused)ScanGrayObjects"
            } else {
                "ScanGrayObjects"
            });
            self.counters.cards_scanned.store(0, Ordering::Relaxed);
            let mut tasks = vec![];
            {
                let mut stack = heap.mark_stack.lock();
                let mark_stack_tasks = heap.spaces.len() * thread_count;
                let mark_stack_delta =
                    (MARK_STACK_TASK_SIZE / 2).min(stack.size() / mark_stack_tasks + 1);
                for space in heap.spaces.iter() {
                    let mut card_begin = space.begin();
                    let card_end = space.end();
                    let address_range = card_end - card_begin;
                    let card_delta = round_up(address_range / thread_count + 1, CardTable::CARD_SIZE);
                    while card_begin < card_end {
                        let card_increment = card_delta.min(card_end - card_begin);
                        let objects = stack.pop_back_count(mark_stack_delta);
                        tasks.push(MarkTask::CardScan {
                            space: space.index(),
                            begin: card_begin,
                            end: card_begin + card_increment,
                            minimum_age,
                            objects,
                        });
                        card_begin += card_increment;
                    }
                }
            }
            self.run_mark_tasks(bitmaps, thread_count, tasks);
            log::trace!(
                "scanned {} cards",
                self.counters.cards_scanned.load(Ordering::Relaxed)
            );
            self.timings.end_split();
        } else {
            let mut stack = heap.mark_stack.lock();
            for space in heap.spaces.iter() {
                self.timings.start_split(match (space.gc_retention_policy(), paused) {
                    (GcRetentionPolicy::NeverCollect, false) => "ScanGrayImageSpaceObjects",
                    (GcRetentionPolicy::NeverCollect, true) => "(Paused)ScanGrayImageSpaceObjects",
                    (GcRetentionPolicy::FullCollect, false) => "ScanGrayZygoteSpaceObjects",
                    (GcRetentionPolicy::FullCollect, true) => "(Paused)ScanGrayZygoteSpaceObjects",
                    (GcRetentionPolicy::AlwaysCollect, false) => "ScanGrayAllocSpaceObjects",
                    (GcRetentionPolicy::AlwaysCollect, true) => "(Paused)ScanGrayAllocSpaceObjects",
                });
                let bitmap = bitmaps.mark_bitmap(space.index());
                heap.card_table.scan(
                    bitmap,
                    space.begin(),
                    space.end(),
                    |obj| self.scan_object_serial(bitmaps, &mut stack, obj),
                    minimum_age,
                );
                self.timings.end_split();
            }
        }
    }

    /// Marks everything reachable from the gray objects on cards at least `minimum_age` old.
    pub(crate) fn recursive_mark_dirty_objects(
        &mut self,
        bitmaps: &HeapBitmap,
        paused: bool,
        minimum_age: u8,
    ) {
        self.scan_gray_objects(bitmaps, paused, minimum_age);
        self.process_mark_stack(bitmaps, paused);
    }

    /// Marks everything reachable from the marked objects and the mark stack.
    pub(crate) fn recursive_mark(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("RecursiveMark");
        if self.heap.config.use_recursive_mark {
            let heap = self.heap;
            let partial = self.gc_type == crate::gc_base::GcType::Partial;
            let thread_count = self.get_thread_count(false);
            for space in heap.spaces.iter() {
                let collected = match space.gc_retention_policy() {
                    GcRetentionPolicy::AlwaysCollect => true,
                    GcRetentionPolicy::FullCollect => !partial,
                    GcRetentionPolicy::NeverCollect => false,
                };
                if !collected {
                    continue;
                }
                let mut begin = space.begin();
                let end = space.end();
                if thread_count > 1 {
                    let n = thread_count * 2;
                    let mut tasks = vec![];
                    while begin < end {
                        let start = begin;
                        let mut delta = round_up((end - begin) / n, KB);
                        if delta < 16 * KB {
                            delta = end - begin;
                        }
                        begin = (begin + delta).min(end);
                        tasks.push(MarkTask::BitmapRange {
                            space: space.index(),
                            begin: start,
                            end: begin,
                        });
                    }
                    self.run_mark_tasks(bitmaps, thread_count, tasks);
                } else {
                    let mut stack = heap.mark_stack.lock();
                    bitmaps
                        .mark_bitmap(space.index())
                        .visit_marked_range(begin, end, |obj| {
                            self.scan_object_serial(bitmaps, &mut stack, obj)
                        });
                }
            }
        }
        self.timings.end_split();
        self.process_mark_stack(bitmaps, false);
    }
}
