use std::{
    fmt::{self, Write},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use atomic::Atomic;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use scoped_threadpool::Pool;

use crate::{
    error::{HeapError, Result},
    gc_base::{GarbageCollector, GcCause, GcPhase, GcStats, GcType},
    gcref::{MemberOffset, ObjectRef},
    internal::{
        card_table::CardTable,
        collection_barrier::CollectionBarrier,
        heap_bitmap::HeapBitmap,
        mod_union_table::{
            ModUnionContext, ModUnionMarker, ModUnionTable, ModUnionTableCardCache,
            ModUnionTableReferenceCache,
        },
        object_stack::ObjectStack,
        space_bitmap::{ContinuousSpaceBitmap, OBJECT_ALIGNMENT},
    },
    large_space::LargeObjectSpace,
    marksweep::{collector_name, MarkSweep},
    runtime::{LargeObjectAllocator, ObjectModel, Runtime},
    space::{ContinuousSpace, GcRetentionPolicy, SpaceConfig},
    statistics::{CollectorTotals, HeapStatistics, TimingLogger},
    utils::{formatted_duration, formatted_size, is_aligned, KB},
    visitor::NonNullReferences,
    Config,
};

/// Headroom kept between the concurrent collection trigger and the footprint limit.
pub const MIN_CONCURRENT_REMAINING_BYTES: usize = 128 * KB;

/// Objects allocated since the last collection (`allocation`) and the ones the running
/// collection took over when the stacks were swapped (`live`).
pub struct AllocationStacks {
    pub allocation: ObjectStack,
    pub live: ObjectStack,
}

/// Owner of every collector data structure. Spaces, bitmaps, card table, stacks and counters
/// live here; one [`MarkSweep`] is created per collection and borrows the heap.
pub struct Heap {
    pub(crate) config: Config,
    pub(crate) self_ref: Weak<Heap>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) object_model: Arc<dyn ObjectModel>,
    /// Sorted by address, index-stable.
    pub(crate) spaces: Vec<ContinuousSpace>,
    /// Index of the always-collect space mutators allocate into.
    pub(crate) alloc_space: usize,
    pub(crate) heap_bitmap_lock: RwLock<HeapBitmap>,
    pub(crate) card_table: CardTable,
    image_mod_union_table: Mutex<Box<dyn ModUnionTable>>,
    zygote_mod_union_table: Mutex<Box<dyn ModUnionTable>>,
    pub(crate) stacks: RwLock<AllocationStacks>,
    pub(crate) mark_stack: Mutex<ObjectStack>,
    pub(crate) large_objects: LargeObjectSpace,
    pub(crate) thread_pool: Mutex<Option<Pool>>,
    thread_pool_size: usize,

    gc_complete: CollectionBarrier,
    gc_phase: Atomic<GcPhase>,
    next_gc_type: Atomic<GcType>,
    concurrent_gc_pending: AtomicBool,
    concurrent_gc_thread: Mutex<Option<JoinHandle<()>>>,

    num_bytes_allocated: AtomicUsize,
    num_objects_allocated: AtomicUsize,
    max_allowed_footprint: AtomicUsize,
    concurrent_start_bytes: AtomicUsize,
    growth_limit: usize,
    /// Bytes per second, measured between the last two collections.
    allocation_rate: AtomicUsize,
    last_gc_time: Mutex<Instant>,
    last_gc_size: AtomicUsize,

    total_gc_cycles: AtomicUsize,
    total_objects_freed_ever: AtomicUsize,
    total_bytes_freed_ever: AtomicUsize,
    collector_totals: Mutex<HashMap<(GcType, bool), CollectorTotals>>,
}

impl Heap {
    /// Creates a heap over `spaces`, which must be sorted by address and card aligned. The card
    /// table starts at the lowest space and covers `config.heap_size` bytes.
    pub fn new(
        config: Config,
        spaces: Vec<SpaceConfig>,
        large_object_allocator: Option<Arc<dyn LargeObjectAllocator>>,
        object_model: Arc<dyn ObjectModel>,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let heap_begin = match spaces.first() {
            Some(space) => space.begin,
            None => return Err(HeapError::NoAllocSpace),
        };

        let mut previous: Option<&SpaceConfig> = None;
        let mut alloc_space = None;
        for (index, space) in spaces.iter().enumerate() {
            let limit = space.begin + space.capacity;
            if space.size > space.capacity {
                return Err(HeapError::InvalidConfig(format!(
                    "space '{}' uses {} bytes of a {} byte capacity",
                    space.name, space.size, space.capacity
                )));
            }
            if let Some(prev) = previous {
                if space.begin < prev.begin + prev.capacity {
                    return Err(HeapError::UnsortedSpaces {
                        name: space.name.to_owned(),
                        previous: prev.name.to_owned(),
                        begin: space.begin,
                        limit,
                    });
                }
            }
            if !is_aligned(space.begin, CardTable::CARD_SIZE) || !is_aligned(limit, CardTable::CARD_SIZE)
            {
                return Err(HeapError::UnalignedSpace {
                    name: space.name.to_owned(),
                    begin: space.begin,
                    limit,
                });
            }
            if limit > heap_begin + config.heap_size {
                return Err(HeapError::OutsideCardTable {
                    name: space.name.to_owned(),
                    begin: space.begin,
                    limit,
                });
            }
            if space.policy == GcRetentionPolicy::AlwaysCollect {
                if space.allocator.is_none() {
                    return Err(HeapError::MissingAllocator(space.name.to_owned()));
                }
                if alloc_space.is_some() {
                    return Err(HeapError::InvalidConfig(format!(
                        "space '{}' is a second always-collect space",
                        space.name
                    )));
                }
                alloc_space = Some(index);
            }
            previous = Some(space);
        }
        let alloc_space = alloc_space.ok_or(HeapError::NoAllocSpace)?;

        let mut heap_bitmap = HeapBitmap::new();
        for space in spaces.iter() {
            if space.policy == GcRetentionPolicy::NeverCollect {
                // Never-collect spaces are entirely live, one bitmap serves both roles.
                let bitmap = ContinuousSpaceBitmap::create("image bitmap", space.begin, space.capacity)
                    .map_err(HeapError::mmap("image bitmap"))?;
                let bitmap = Arc::new(bitmap);
                heap_bitmap.add_space(bitmap.clone(), bitmap);
            } else {
                let live = ContinuousSpaceBitmap::create("live bitmap", space.begin, space.capacity)
                    .map_err(HeapError::mmap("live bitmap"))?;
                let mark = ContinuousSpaceBitmap::create("mark bitmap", space.begin, space.capacity)
                    .map_err(HeapError::mmap("mark bitmap"))?;
                heap_bitmap.add_space(Arc::new(live), Arc::new(mark));
            }
        }

        let card_table = CardTable::create(heap_begin, config.heap_size)
            .map_err(HeapError::mmap("card table"))?;
        let allocation = ObjectStack::create("allocation stack", config.allocation_stack_size)
            .map_err(HeapError::mmap("allocation stack"))?;
        let live = ObjectStack::create("live stack", config.allocation_stack_size)
            .map_err(HeapError::mmap("live stack"))?;
        let mark_stack = ObjectStack::create("mark stack", config.mark_stack_size)
            .map_err(HeapError::mmap("mark stack"))?;

        let thread_pool_size = config.parallel_gc_threads.max(config.conc_gc_threads);
        let thread_pool = if thread_pool_size > 0 {
            Some(Pool::new(thread_pool_size as u32))
        } else {
            None
        };

        let spaces = spaces
            .into_iter()
            .enumerate()
            .map(|(index, space)| ContinuousSpace::new(index, space))
            .collect::<Vec<_>>();
        if let Some(allocator) = spaces[alloc_space].allocator() {
            allocator.set_footprint_limit(config.initial_size);
        }

        let concurrent_start_bytes = if config.concurrent_gc {
            config
                .initial_size
                .saturating_sub(MIN_CONCURRENT_REMAINING_BYTES)
        } else {
            usize::MAX
        };
        logln_if!(
            config.verbose,
            "[gc] heap with {} spaces, card table {:#x}-{:#x}, {} gc threads",
            spaces.len(),
            heap_begin,
            heap_begin + config.heap_size,
            thread_pool_size
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            runtime,
            object_model,
            spaces,
            alloc_space,
            heap_bitmap_lock: RwLock::new(heap_bitmap),
            card_table,
            image_mod_union_table: Mutex::new(Box::new(ModUnionTableReferenceCache::new(
                "image mod-union table",
            ))),
            zygote_mod_union_table: Mutex::new(Box::new(ModUnionTableCardCache::new(
                "zygote mod-union table",
            ))),
            stacks: RwLock::new(AllocationStacks { allocation, live }),
            mark_stack: Mutex::new(mark_stack),
            large_objects: LargeObjectSpace::new(large_object_allocator),
            thread_pool: Mutex::new(thread_pool),
            thread_pool_size,
            gc_complete: CollectionBarrier::new(),
            gc_phase: Atomic::new(GcPhase::None),
            next_gc_type: Atomic::new(GcType::Partial),
            concurrent_gc_pending: AtomicBool::new(false),
            concurrent_gc_thread: Mutex::new(None),
            num_bytes_allocated: AtomicUsize::new(0),
            num_objects_allocated: AtomicUsize::new(0),
            max_allowed_footprint: AtomicUsize::new(config.initial_size),
            concurrent_start_bytes: AtomicUsize::new(concurrent_start_bytes),
            growth_limit: config.growth_limit,
            allocation_rate: AtomicUsize::new(0),
            last_gc_time: Mutex::new(Instant::now()),
            last_gc_size: AtomicUsize::new(0),
            total_gc_cycles: AtomicUsize::new(0),
            total_objects_freed_ever: AtomicUsize::new(0),
            total_bytes_freed_ever: AtomicUsize::new(0),
            collector_totals: Mutex::new(HashMap::new()),
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn spaces(&self) -> &[ContinuousSpace] {
        &self.spaces
    }

    pub fn alloc_space(&self) -> &ContinuousSpace {
        &self.spaces[self.alloc_space]
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn large_objects(&self) -> &LargeObjectSpace {
        &self.large_objects
    }

    pub(crate) fn has_thread_pool(&self) -> bool {
        self.thread_pool_size > 0
    }

    /// Phase of the running collection, [`GcPhase::None`] between collections.
    pub fn gc_phase(&self) -> GcPhase {
        self.gc_phase.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_phase(&self, phase: GcPhase) {
        log::trace!("gc phase {:?}", phase);
        self.gc_phase.store(phase, Ordering::Release);
    }

    pub fn next_gc_type(&self) -> GcType {
        self.next_gc_type.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn objects_allocated(&self) -> usize {
        self.num_objects_allocated.load(Ordering::Relaxed)
    }

    pub fn max_allowed_footprint(&self) -> usize {
        self.max_allowed_footprint.load(Ordering::Relaxed)
    }

    pub fn concurrent_start_bytes(&self) -> usize {
        self.concurrent_start_bytes.load(Ordering::Relaxed)
    }

    /// Records a new object of `bytes` bytes. The object is pushed onto the allocation stack;
    /// when that stack is full a sticky collection empties it first.
    pub fn record_allocation(&self, obj: ObjectRef, bytes: usize) {
        self.num_bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.num_objects_allocated.fetch_add(1, Ordering::Relaxed);

        if !self.stacks.read().allocation.atomic_push_back(obj) {
            log::debug!("allocation stack overflow, running a sticky collection");
            self.collect_garbage_internal(GcType::Sticky, GcCause::Alloc, false);
            if !self.stacks.read().allocation.atomic_push_back(obj) {
                self.fatal(format_args!(
                    "no room for {:p} on the allocation stack after a collection",
                    obj
                ));
            }
        }

        if self.config.concurrent_gc
            && self.num_bytes_allocated.load(Ordering::Relaxed)
                >= self.concurrent_start_bytes.load(Ordering::Relaxed)
        {
            self.request_concurrent_gc();
        }
    }

    /// Registers an object that already exists in a space mutators do not allocate into, like
    /// the contents of a loaded image or of the zygote space. Returns `false` if `obj` is not
    /// in the used part of such a space.
    pub fn add_live_object(&self, obj: ObjectRef) -> bool {
        let bitmaps = self.heap_bitmap_lock.read();
        match self.spaces.iter().find(|space| space.has_address(obj)) {
            Some(space) if space.index() != self.alloc_space => {
                bitmaps.live_bitmap(space.index()).set(obj);
                true
            }
            _ => false,
        }
    }

    /// Write barrier: to be called after a reference is stored into `obj`.
    #[inline]
    pub fn write_barrier(&self, obj: ObjectRef) {
        // Large objects have no card, sticky collections rescan them instead.
        if self.card_table.addr_is_in_card_table(obj.address()) {
            self.card_table.mark_card(obj.address());
        }
    }

    pub(crate) fn record_free(&self, objects: usize, bytes: usize) {
        let saturating = |n: usize, freed: usize| Some(n.saturating_sub(freed));
        let _ = self
            .num_objects_allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| saturating(n, objects));
        let _ = self
            .num_bytes_allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| saturating(n, bytes));
    }

    /// Ages the cards of the collected spaces and moves the dirty cards of immune spaces into
    /// their mod-union tables.
    pub(crate) fn process_cards(&self) {
        let mut image_table = self.image_mod_union_table.lock();
        let mut zygote_table = self.zygote_mod_union_table.lock();
        for space in self.spaces.iter() {
            match space.gc_retention_policy() {
                GcRetentionPolicy::NeverCollect => image_table.clear_cards(space, &self.card_table),
                GcRetentionPolicy::FullCollect => zygote_table.clear_cards(space, &self.card_table),
                GcRetentionPolicy::AlwaysCollect => self.card_table.modify_cards_atomic(
                    space.begin(),
                    space.end(),
                    CardTable::age_card,
                    |_, _, _| {},
                ),
            }
        }
    }

    /// The running collection takes over the allocation stack, mutators continue on the empty
    /// live stack.
    pub(crate) fn swap_stacks(&self) {
        let mut stacks = self.stacks.write();
        let AllocationStacks { allocation, live } = &mut *stacks;
        std::mem::swap(allocation, live);
    }

    /// Sets the live bit of every object on `stack`.
    pub(crate) fn mark_alloc_stack(&self, bitmaps: &HeapBitmap, stack: &ObjectStack) {
        let live_bitmap = bitmaps.live_bitmap(self.alloc_space);
        for obj in stack.iter() {
            if live_bitmap.has_address(obj.address()) {
                live_bitmap.set(obj);
            } else {
                self.large_objects.set_live(obj);
            }
        }
    }

    fn mod_union_context<'a>(&'a self, bitmaps: &'a HeapBitmap) -> ModUnionContext<'a> {
        ModUnionContext {
            card_table: &self.card_table,
            spaces: &self.spaces,
            bitmaps,
            object_model: &*self.object_model,
        }
    }

    /// Refreshes the mod-union tables of the immune spaces and replays them into `marker`.
    pub(crate) fn update_and_mark_mod_union(
        &self,
        gc_type: GcType,
        bitmaps: &HeapBitmap,
        marker: &mut dyn ModUnionMarker,
    ) {
        if gc_type == GcType::Sticky {
            // Sticky collections scan every aged card of the immune spaces instead.
            return;
        }
        let ctx = self.mod_union_context(bitmaps);
        if gc_type == GcType::Partial {
            let mut table = self.zygote_mod_union_table.lock();
            table.update(&ctx);
            table.mark_references(&ctx, marker);
        }
        let mut table = self.image_mod_union_table.lock();
        table.update(&ctx);
        table.mark_references(&ctx, marker);
    }

    /// Whether `obj` is live. With the heap bitmap lock held by the caller.
    pub(crate) fn is_live_object_locked(
        &self,
        bitmaps: &HeapBitmap,
        obj: ObjectRef,
        search_allocation_stack: bool,
        search_live_stack: bool,
    ) -> bool {
        if !is_aligned(obj.address(), OBJECT_ALIGNMENT) {
            return false;
        }
        let test = || match bitmaps.find_live_bitmap(obj) {
            Some(bitmap) => bitmap.test(obj),
            None => self.large_objects.is_live(obj),
        };
        if test() {
            return true;
        }
        {
            let stacks = self.stacks.read();
            if search_allocation_stack && stacks.allocation.contains(obj) {
                return true;
            }
            if search_live_stack && stacks.live.contains(obj) {
                return true;
            }
        }
        // An object may be marked live right before the stack holding it is reset.
        test()
    }

    pub fn is_live_object(&self, obj: ObjectRef) -> bool {
        let bitmaps = self.heap_bitmap_lock.read();
        self.is_live_object_locked(&bitmaps, obj, true, true)
    }

    /// Runs an explicit full collection, after any running one finished.
    pub fn collect_garbage(&self, clear_soft_references: bool) -> GcType {
        self.wait_for_concurrent_gc_to_complete();
        self.collect_garbage_internal(GcType::Full, GcCause::Explicit, clear_soft_references)
    }

    /// Runs one collection of at most `gc_type`. Returns the type actually run.
    pub(crate) fn collect_garbage_internal(
        &self,
        mut gc_type: GcType,
        cause: GcCause,
        clear_soft_references: bool,
    ) -> GcType {
        self.runtime.set_current_thread_blocked(true);
        self.gc_complete.start_collection();
        self.runtime.set_current_thread_blocked(false);

        let gc_start_size = self.bytes_allocated();
        {
            let last_gc_time = self.last_gc_time.lock();
            let ms_delta = last_gc_time.elapsed().as_millis() as usize;
            if ms_delta != 0 {
                let allocated = gc_start_size.saturating_sub(self.last_gc_size.load(Ordering::Relaxed));
                let rate = allocated * 1000 / ms_delta;
                self.allocation_rate.store(rate, Ordering::Relaxed);
                log::debug!("allocation rate: {}/s", formatted_size(rate));
            }
        }

        if gc_type == GcType::Sticky
            && self.alloc_space().size() < self.config.min_alloc_space_size_for_sticky_gc
        {
            gc_type = GcType::Partial;
        }
        if gc_type == GcType::Partial && !self.spaces.iter().any(|space| space.is_zygote_space()) {
            gc_type = GcType::Full;
        }

        let mut collector = MarkSweep::new(
            self,
            gc_type,
            self.config.concurrent_gc,
            clear_soft_references,
        );
        collector.run();

        let stats = collector.stats();
        let cycle = self.total_gc_cycles.fetch_add(1, Ordering::Relaxed);
        self.total_objects_freed_ever.fetch_add(
            stats.freed_objects + stats.freed_large_objects,
            Ordering::Relaxed,
        );
        self.total_bytes_freed_ever.fetch_add(
            stats.freed_bytes + stats.freed_large_object_bytes,
            Ordering::Relaxed,
        );

        let was_slow = stats.duration > self.config.long_gc_log_threshold
            || (cause == GcCause::Alloc && stats.duration > self.config.long_pause_log_threshold)
            || stats
                .pause_times
                .iter()
                .any(|pause| *pause > self.config.long_pause_log_threshold);
        if self.config.care_about_pause_times && was_slow {
            log::info!("{} {}", cause, self.describe_collection(collector.name(), stats));
            log::debug!("{}", collector.timings());
        }
        logln_if!(
            self.config.verbose,
            "[gc] GC({}) {}",
            cycle,
            self.describe_collection(collector.name(), stats)
        );

        self.gc_complete.finish_collection(gc_type);
        gc_type
    }

    fn describe_collection(&self, name: &str, stats: &GcStats) -> String {
        let used = self.bytes_allocated();
        let total = self.max_allowed_footprint().max(1);
        let percent_free = 100usize.saturating_sub(used.saturating_mul(100) / total);
        let pauses = stats
            .pause_times
            .iter()
            .map(|pause| formatted_duration(*pause).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} GC freed {}({}) AllocSpace objects, {}({}) LOS objects, {}% free, {}/{}, paused {} total {}",
            name,
            stats.freed_objects,
            formatted_size(stats.freed_bytes),
            stats.freed_large_objects,
            formatted_size(stats.freed_large_object_bytes),
            percent_free,
            formatted_size(used),
            formatted_size(total),
            pauses,
            formatted_duration(stats.duration)
        )
    }

    pub(crate) fn record_collector_totals(
        &self,
        gc_type: GcType,
        concurrent: bool,
        stats: &GcStats,
        timings: &TimingLogger,
    ) {
        let mut totals = self.collector_totals.lock();
        let totals = totals.entry((gc_type, concurrent)).or_default();
        totals.runs += 1;
        totals.total_time += stats.duration;
        totals.total_paused_time += stats.total_paused_time();
        totals.max_pause = stats
            .pause_times
            .iter()
            .copied()
            .fold(totals.max_pause, Duration::max);
        totals.freed_objects += stats.freed_objects + stats.freed_large_objects;
        totals.freed_bytes += stats.freed_bytes + stats.freed_large_object_bytes;
        totals.cumulative_timings.add_logger(timings);
    }

    fn request_concurrent_gc(&self) {
        if self.concurrent_gc_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let heap = match self.self_ref.upgrade() {
            Some(heap) => heap,
            None => {
                self.concurrent_gc_pending.store(false, Ordering::Release);
                return;
            }
        };
        let spawned = std::thread::Builder::new()
            .name("concurrent-gc".to_owned())
            .spawn(move || {
                heap.concurrent_gc();
                heap.concurrent_gc_pending.store(false, Ordering::Release);
            });
        match spawned {
            Ok(handle) => {
                *self.concurrent_gc_thread.lock() = Some(handle);
            }
            Err(err) => {
                log::warn!("failed to start the concurrent collector thread: {}", err);
                self.concurrent_gc_pending.store(false, Ordering::Release);
            }
        }
    }

    /// Runs the collection chosen by the last one, unless a collection was already running.
    pub fn concurrent_gc(&self) {
        if self.wait_for_gc_to_complete().is_none() {
            self.collect_garbage_internal(self.next_gc_type(), GcCause::Background, false);
        }
    }

    fn wait_for_gc_to_complete(&self) -> Option<GcType> {
        self.runtime.set_current_thread_blocked(true);
        let last = self.gc_complete.wait_for_gc_to_complete();
        self.runtime.set_current_thread_blocked(false);
        last
    }

    /// Blocks until the running or requested concurrent collection is done. Returns its type,
    /// or `None` if there was nothing to wait for.
    pub fn wait_for_concurrent_gc_to_complete(&self) -> Option<GcType> {
        if !self.config.concurrent_gc {
            return None;
        }
        let mut last = None;
        let pending = self.concurrent_gc_thread.lock().take();
        if let Some(handle) = pending {
            self.runtime.set_current_thread_blocked(true);
            let joined = handle.join();
            self.runtime.set_current_thread_blocked(false);
            if joined.is_ok() {
                last = self.gc_complete.last_gc_type();
            }
        }
        self.wait_for_gc_to_complete().or(last)
    }

    /// Target-utilization footprint policy. Picks the next collection type and, for concurrent
    /// collection, the allocation volume that starts it.
    pub(crate) fn grow_for_utilization(&self, gc_type: GcType, gc_duration: Duration) {
        let bytes_allocated = self.bytes_allocated();
        self.last_gc_size.store(bytes_allocated, Ordering::Relaxed);
        *self.last_gc_time.lock() = Instant::now();

        let max_allowed_footprint = self.max_allowed_footprint();
        let min_free = self.config.min_free;
        let max_free = self.config.max_free;
        let target_size = if gc_type != GcType::Sticky {
            let target = (bytes_allocated as f64 / self.config.target_utilization) as usize;
            self.next_gc_type.store(GcType::Sticky, Ordering::Relaxed);
            target.clamp(bytes_allocated + min_free, bytes_allocated + max_free)
        } else {
            // Close to the limit a partial collection is due.
            let next = if bytes_allocated + min_free <= max_allowed_footprint {
                GcType::Sticky
            } else {
                GcType::Partial
            };
            self.next_gc_type.store(next, Ordering::Relaxed);
            if bytes_allocated + max_free < max_allowed_footprint {
                bytes_allocated + max_free
            } else {
                bytes_allocated.max(max_allowed_footprint)
            }
        };

        let footprint = self.set_ideal_footprint(target_size);

        if self.config.concurrent_gc {
            let rate = self.allocation_rate.load(Ordering::Relaxed) as f64;
            let remaining = ((rate * gc_duration.as_secs_f64()) as usize)
                .max(MIN_CONCURRENT_REMAINING_BYTES);
            let start = if remaining > footprint {
                // Collect again right away.
                bytes_allocated
            } else {
                (footprint - remaining).max(bytes_allocated)
            };
            self.concurrent_start_bytes.store(start, Ordering::Relaxed);
        }
        log::debug!(
            "footprint {} (allocated {}), next {} collection",
            formatted_size(footprint),
            formatted_size(bytes_allocated),
            self.next_gc_type()
        );
    }

    fn set_ideal_footprint(&self, footprint: usize) -> usize {
        let footprint = footprint.min(self.growth_limit);
        if let Some(allocator) = self.alloc_space().allocator() {
            allocator.set_footprint_limit(footprint);
        }
        self.max_allowed_footprint.store(footprint, Ordering::Relaxed);
        footprint
    }

    /// Heap checks that run before marking starts, each with mutators suspended.
    pub(crate) fn pre_gc_verification(&self, name: &str) {
        if self.config.verify_pre_gc_heap {
            self.runtime.suspend_all();
            let verified = {
                let bitmaps = self.heap_bitmap_lock.read();
                self.verify_heap_references(&bitmaps)
            };
            self.runtime.resume_all();
            if !verified {
                self.fatal(format_args!("pre {} heap verification failed", name));
            }
        }

        if self.config.verify_missing_card_marks {
            self.runtime.suspend_all();
            let verified = {
                let bitmaps = self.heap_bitmap_lock.read();
                self.swap_stacks();
                let verified = self.verify_missing_card_marks(&bitmaps);
                self.swap_stacks();
                verified
            };
            self.runtime.resume_all();
            if !verified {
                self.fatal(format_args!(
                    "pre {} missing card mark verification failed",
                    name
                ));
            }
        }

        if self.config.verify_mod_union_table {
            self.runtime.suspend_all();
            let verified = {
                let bitmaps = self.heap_bitmap_lock.read();
                let ctx = self.mod_union_context(&bitmaps);
                let is_live = |obj: ObjectRef| self.is_live_object_locked(&bitmaps, obj, true, true);
                let mut result = Ok(());
                for table in [&self.image_mod_union_table, &self.zygote_mod_union_table] {
                    let mut table = table.lock();
                    table.update(&ctx);
                    result = result.and_then(|_| table.verify(&ctx, &is_live));
                }
                result
            };
            self.runtime.resume_all();
            if let Err(err) = verified {
                self.fatal(format_args!("pre {} mod-union verification failed: {}", name, err));
            }
        }
    }

    /// Checks that every root and every reference held by a live object points to a live
    /// object. Objects on the live stack are not checked, unreachable ones may hold dangling
    /// references.
    pub(crate) fn verify_heap_references(&self, bitmaps: &HeapBitmap) -> bool {
        let model = &*self.object_model;
        let mut failed = false;
        self.runtime.visit_roots(
            &mut |root: ObjectRef| {
                if !self.is_live_object_locked(bitmaps, root, true, false) {
                    log::error!("root {:p} is dead", root);
                    failed = true;
                }
            },
            false,
            false,
        );

        let mut verify = |obj: ObjectRef| {
            model.visit_references(
                obj,
                &mut |owner: ObjectRef, referent: Option<ObjectRef>, offset: MemberOffset, _: bool| {
                    if let Some(referent) = referent {
                        if !self.is_live_object_locked(bitmaps, referent, true, false) {
                            log::error!(
                                "object {:p} references dead object {:p} at offset {}, card {:#x}",
                                owner,
                                referent,
                                offset,
                                self.card_table.get_card(owner.address())
                            );
                            failed = true;
                        }
                    }
                },
            );
        };
        for space in self.spaces.iter() {
            bitmaps.live_bitmap(space.index()).walk(&mut verify);
        }
        let large = self.large_objects.lock().live.iter().copied().collect::<Vec<_>>();
        // Allocated before the collection, or during it for the pre-sweeping check.
        let allocations = self.stacks.read().allocation.iter().collect::<Vec<_>>();
        for obj in large.into_iter().chain(allocations) {
            verify(obj);
        }

        if failed {
            let mut dump = String::new();
            for table in [&self.image_mod_union_table, &self.zygote_mod_union_table] {
                let _ = table.lock().dump(&mut dump);
            }
            log::error!("{}", dump);
            log::error!("{}", self.dump_spaces());
        }
        !failed
    }

    /// Checks that objects referencing anything on the live stack sit on a card that was
    /// dirtied since the last collection.
    pub(crate) fn verify_missing_card_marks(&self, bitmaps: &HeapBitmap) -> bool {
        let model = &*self.object_model;
        let live_stack = self.stacks.read().live.iter().collect::<HashSet<_>>();
        let mut failed = false;
        let mut verify = |obj: ObjectRef| {
            if !self.card_table.addr_is_in_card_table(obj.address()) {
                return;
            }
            if self.card_table.get_card(obj.address()) >= CardTable::CARD_AGED {
                return;
            }
            model.visit_references(
                obj,
                &mut NonNullReferences(|reference: ObjectRef| {
                    if live_stack.contains(&reference) {
                        if live_stack.contains(&obj) {
                            log::error!("object {:p} found in live stack", obj);
                        }
                        log::error!(
                            "object {:p} on a clean card references {:p} in live stack",
                            obj,
                            reference
                        );
                        failed = true;
                    }
                }),
            );
        };
        for space in self.spaces.iter() {
            bitmaps.live_bitmap(space.index()).walk(&mut verify);
        }
        for obj in live_stack.iter() {
            verify(*obj);
        }
        if failed {
            log::error!("{}", self.dump_spaces());
        }
        !failed
    }

    /// Logs every root outside the continuous spaces and the large-object space.
    pub(crate) fn verify_roots(&self) {
        self.runtime.visit_roots(
            &mut |root: ObjectRef| {
                let in_space = self.spaces.iter().any(|space| space.contains(root));
                if !in_space && !self.large_objects.contains(root) {
                    log::error!("root {:p} is not in any space", root);
                }
            },
            false,
            false,
        );
    }

    fn write_spaces(&self, out: &mut dyn Write) -> fmt::Result {
        // The caller may hold the bitmap lock already.
        let bitmaps = self.heap_bitmap_lock.try_read();
        for space in self.spaces.iter() {
            writeln!(out, "{:?}", space)?;
            if let Some(ref bitmaps) = bitmaps {
                writeln!(out, "  {:?}", bitmaps.live_bitmap(space.index()))?;
                writeln!(out, "  {:?}", bitmaps.mark_bitmap(space.index()))?;
            }
        }
        writeln!(out, "{:?}", self.large_objects)
    }

    pub fn dump_spaces(&self) -> String {
        let mut out = String::new();
        let _ = self.write_spaces(&mut out);
        out
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            bytes_allocated: self.bytes_allocated(),
            objects_allocated: self.objects_allocated(),
            max_allowed_footprint: self.max_allowed_footprint(),
            concurrent_start_bytes: self.concurrent_start_bytes(),
            growth_limit: self.growth_limit,
            total_gc_cycles_count: self.total_gc_cycles.load(Ordering::Relaxed),
            total_objects_freed: self.total_objects_freed_ever.load(Ordering::Relaxed),
            total_bytes_freed: self.total_bytes_freed_ever.load(Ordering::Relaxed),
            total_wait_time: self.gc_complete.total_wait_time(),
            allocation_rate: self.allocation_rate.load(Ordering::Relaxed),
            large_objects: self.large_objects.live_objects(),
        }
    }

    /// Cumulative timings and throughput of every collector that ran.
    pub fn dump_gc_performance_info(&self) -> String {
        let mut out = String::new();
        let totals = self.collector_totals.lock();
        for gc_type in GcType::ALL {
            for concurrent in [false, true] {
                if let Some(totals) = totals.get(&(gc_type, concurrent)) {
                    let _ = totals.dump(collector_name(gc_type, concurrent), &mut out);
                }
            }
        }
        let _ = write!(out, "{}", self.statistics());
        out
    }

    /// Logs `args` with a heap dump and a backtrace, then aborts.
    #[cold]
    #[inline(never)]
    pub(crate) fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        log::error!("{}", args);
        log::error!("{}", self.dump_spaces());
        log::error!("{:?}", backtrace::Backtrace::new());
        std::process::abort()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("spaces", &self.spaces)
            .field("card_table", &self.card_table)
            .field("bytes_allocated", &self.bytes_allocated())
            .field("max_allowed_footprint", &self.max_allowed_footprint())
            .finish()
    }
}
