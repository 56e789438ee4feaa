use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::{
    error::HeapError,
    gc_base::{GarbageCollector, GcCause, GcPhase, GcType},
    gcref::{MemberOffset, ObjectRef},
    heap::Heap,
    marksweep::MarkSweep,
    runtime::{
        AllocSpace, Checkpoint, LargeObjectAllocator, MutatorThread, ObjectModel, ReferenceKind,
        Runtime,
    },
    safepoint::{GlobalSafepoint, MutatorId},
    space::{GcRetentionPolicy, SpaceConfig},
    utils::{KB, MB},
    visitor::{ReferenceVisitor, RootVisitor},
    Config,
};

const HEAP_BEGIN: usize = 0x4000_0000;
const IMAGE_CAPACITY: usize = 64 * KB;
const ZYGOTE_BEGIN: usize = HEAP_BEGIN + IMAGE_CAPACITY;
const ZYGOTE_CAPACITY: usize = 64 * KB;
const ALLOC_BEGIN: usize = ZYGOTE_BEGIN + ZYGOTE_CAPACITY;
const ALLOC_CAPACITY: usize = 4 * MB;
/// Outside the card table, which covers `Config::heap_size` bytes from `HEAP_BEGIN`.
const LARGE_BEGIN: usize = HEAP_BEGIN + 64 * MB;
const LARGE_CAPACITY: usize = 64 * MB;
const OBJECT_SIZE: usize = 16;
const LARGE_OBJECT_SIZE: usize = 64 * KB;

fn obj(addr: usize) -> ObjectRef {
    ObjectRef::from_address(addr).unwrap()
}

#[derive(Default)]
struct FakeObject {
    fields: Vec<Option<ObjectRef>>,
    kind: Option<ReferenceKind>,
    referent: Option<ObjectRef>,
    pending_next: Option<ObjectRef>,
    zombie: Option<ObjectRef>,
    enqueued: bool,
}

/// Object layout kept in a side table keyed by address.
#[derive(Default)]
struct FakeObjects {
    objects: Mutex<HashMap<ObjectRef, FakeObject>>,
}

impl FakeObjects {
    fn insert(&self, obj: ObjectRef, fields: usize, kind: Option<ReferenceKind>) {
        self.objects.lock().insert(
            obj,
            FakeObject {
                fields: vec![None; fields],
                kind,
                ..Default::default()
            },
        );
    }

    fn set_field(&self, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
        self.objects.lock().get_mut(&obj).unwrap().fields[index] = value;
    }

    fn field(&self, obj: ObjectRef, index: usize) -> Option<ObjectRef> {
        self.objects.lock()[&obj].fields[index]
    }

    fn set_referent(&self, reference: ObjectRef, referent: ObjectRef) {
        self.objects.lock().get_mut(&reference).unwrap().referent = Some(referent);
    }

    fn zombie(&self, reference: ObjectRef) -> Option<ObjectRef> {
        self.objects.lock()[&reference].zombie
    }
}

impl ObjectModel for FakeObjects {
    fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn ReferenceVisitor) {
        let fields = {
            let objects = self.objects.lock();
            let object = match objects.get(&obj) {
                Some(object) => object,
                None => return,
            };
            let mut fields = object.fields.clone();
            if object.kind == Some(ReferenceKind::Finalizer) {
                fields.push(object.zombie);
            }
            fields
        };
        for (index, field) in fields.into_iter().enumerate() {
            visitor.visit_reference(obj, field, MemberOffset::new(8 + 4 * index as u32), false);
        }
    }

    fn reference_kind(&self, obj: ObjectRef) -> Option<ReferenceKind> {
        self.objects.lock().get(&obj).and_then(|object| object.kind)
    }

    fn referent(&self, reference: ObjectRef) -> Option<ObjectRef> {
        self.objects.lock()[&reference].referent
    }

    fn clear_referent(&self, reference: ObjectRef) {
        self.objects.lock().get_mut(&reference).unwrap().referent = None;
    }

    fn pending_next(&self, reference: ObjectRef) -> Option<ObjectRef> {
        self.objects.lock()[&reference].pending_next
    }

    fn set_pending_next(&self, reference: ObjectRef, next: Option<ObjectRef>) {
        self.objects.lock().get_mut(&reference).unwrap().pending_next = next;
    }

    fn is_enqueuable(&self, reference: ObjectRef) -> bool {
        !self.objects.lock()[&reference].enqueued
    }

    fn set_zombie(&self, reference: ObjectRef, zombie: ObjectRef) {
        self.objects.lock().get_mut(&reference).unwrap().zombie = Some(zombie);
    }
}

#[derive(Default)]
struct FakeThread {
    roots: Mutex<Vec<ObjectRef>>,
}

impl MutatorThread for FakeThread {
    fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let roots = self.roots.lock().clone();
        for root in roots {
            visitor.visit_root(root);
        }
    }
}

struct Mutator {
    id: MutatorId,
    thread: Arc<FakeThread>,
}

struct FakeRuntime {
    safepoint: GlobalSafepoint,
    objects: Arc<FakeObjects>,
    threads: Mutex<Vec<Arc<FakeThread>>>,
    mutators: Mutex<HashMap<ThreadId, MutatorId>>,
    globals: Mutex<Vec<ObjectRef>>,
    /// Interned roots and the number of them reported clean.
    interned: Mutex<(Vec<ObjectRef>, usize)>,
    weaks: Mutex<Vec<ObjectRef>>,
    cleared: Mutex<Vec<ObjectRef>>,
    zygote: AtomicBool,
}

impl FakeRuntime {
    fn new(objects: Arc<FakeObjects>) -> Self {
        Self {
            safepoint: GlobalSafepoint::new(),
            objects,
            threads: Mutex::new(vec![]),
            mutators: Mutex::new(HashMap::new()),
            globals: Mutex::new(vec![]),
            interned: Mutex::new((vec![], 0)),
            weaks: Mutex::new(vec![]),
            cleared: Mutex::new(vec![]),
            zygote: AtomicBool::new(false),
        }
    }

    fn attach(&self) -> Mutator {
        let thread = Arc::new(FakeThread::default());
        self.threads.lock().push(thread.clone());
        let id = self.safepoint.register(thread.clone());
        self.mutators.lock().insert(thread::current().id(), id);
        Mutator { id, thread }
    }

    fn detach(&self, mutator: Mutator) {
        self.mutators.lock().remove(&thread::current().id());
        self.threads
            .lock()
            .retain(|thread| !Arc::ptr_eq(thread, &mutator.thread));
        self.safepoint.unregister(mutator.id);
    }

    fn cleared(&self) -> Vec<ObjectRef> {
        self.cleared.lock().clone()
    }
}

impl Runtime for FakeRuntime {
    fn visit_non_thread_roots(&self, visitor: &mut dyn RootVisitor) {
        let globals = self.globals.lock().clone();
        for root in globals {
            visitor.visit_root(root);
        }
    }

    fn visit_concurrent_roots(
        &self,
        visitor: &mut dyn RootVisitor,
        only_dirty: bool,
        clean_dirty: bool,
    ) {
        let roots = {
            let mut interned = self.interned.lock();
            let from = if only_dirty { interned.1 } else { 0 };
            let roots = interned.0[from..].to_vec();
            if clean_dirty {
                interned.1 = interned.0.len();
            }
            roots
        };
        for root in roots {
            visitor.visit_root(root);
        }
    }

    fn visit_non_concurrent_roots(&self, visitor: &mut dyn RootVisitor) {
        let threads = self.threads.lock().clone();
        for thread in threads {
            thread.visit_roots(visitor);
        }
        self.visit_non_thread_roots(visitor);
    }

    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize {
        self.safepoint.run_checkpoint(checkpoint)
    }

    fn suspend_all(&self) {
        self.safepoint.suspend_all();
    }

    fn resume_all(&self) {
        self.safepoint.resume_all();
    }

    fn sweep_system_weaks(&self, is_marked: &dyn Fn(ObjectRef) -> bool) {
        self.weaks.lock().retain(|weak| is_marked(*weak));
    }

    fn enqueue_cleared_references(&self, references: Vec<ObjectRef>) {
        for reference in references.iter() {
            self.objects
                .objects
                .lock()
                .get_mut(reference)
                .unwrap()
                .enqueued = true;
        }
        self.cleared.lock().extend(references);
    }

    fn is_zygote(&self) -> bool {
        self.zygote.load(Ordering::Relaxed)
    }

    fn set_current_thread_blocked(&self, blocked: bool) {
        let id = self.mutators.lock().get(&thread::current().id()).copied();
        if let Some(id) = id {
            if blocked {
                self.safepoint.transition_to_suspended(id);
            } else {
                self.safepoint.transition_to_runnable(id);
            }
        }
    }
}

/// Bump allocator over the allocation space recording what the collector frees.
struct BumpSpace {
    top: Mutex<usize>,
    freed: Mutex<HashSet<ObjectRef>>,
    footprint_limit: AtomicUsize,
}

impl BumpSpace {
    fn new() -> Self {
        Self {
            top: Mutex::new(ALLOC_BEGIN),
            freed: Mutex::new(HashSet::new()),
            footprint_limit: AtomicUsize::new(0),
        }
    }

    fn is_freed(&self, obj: ObjectRef) -> bool {
        self.freed.lock().contains(&obj)
    }
}

impl AllocSpace for BumpSpace {
    fn free_list(&self, objects: &[ObjectRef]) -> usize {
        let mut freed = self.freed.lock();
        for obj in objects.iter() {
            assert!(freed.insert(*obj), "{:?} freed twice", obj);
        }
        objects.len() * OBJECT_SIZE
    }

    fn set_footprint_limit(&self, limit: usize) {
        self.footprint_limit.store(limit, Ordering::Relaxed);
    }
}

struct LargeSpace {
    top: AtomicUsize,
    freed: Mutex<HashSet<ObjectRef>>,
}

impl LargeSpace {
    fn new() -> Self {
        Self {
            top: AtomicUsize::new(LARGE_BEGIN),
            freed: Mutex::new(HashSet::new()),
        }
    }

    fn is_freed(&self, obj: ObjectRef) -> bool {
        self.freed.lock().contains(&obj)
    }
}

impl LargeObjectAllocator for LargeSpace {
    fn contains(&self, obj: ObjectRef) -> bool {
        obj.address() >= LARGE_BEGIN
            && obj.address() < LARGE_BEGIN + LARGE_CAPACITY
            && obj.address() < self.top.load(Ordering::Relaxed)
            && !self.is_freed(obj)
    }

    fn free(&self, obj: ObjectRef) -> usize {
        assert!(self.freed.lock().insert(obj), "{:?} freed twice", obj);
        LARGE_OBJECT_SIZE
    }
}

fn test_config() -> Config {
    Config {
        heap_size: 16 * MB,
        initial_size: 4 * MB,
        growth_limit: 8 * MB,
        min_free: MB,
        max_free: 2 * MB,
        parallel_gc_threads: 0,
        conc_gc_threads: 0,
        concurrent_gc: false,
        min_alloc_space_size_for_sticky_gc: 0,
        mark_stack_size: KB,
        allocation_stack_size: 16 * KB,
        ..Default::default()
    }
}

struct Fixture {
    heap: Arc<Heap>,
    runtime: Arc<FakeRuntime>,
    objects: Arc<FakeObjects>,
    alloc: Arc<BumpSpace>,
    large: Arc<LargeSpace>,
    zygote_top: Mutex<usize>,
}

impl Fixture {
    fn new(config: Config) -> Self {
        Self::build(config, true)
    }

    fn build(config: Config, with_zygote: bool) -> Self {
        let objects = Arc::new(FakeObjects::default());
        let runtime = Arc::new(FakeRuntime::new(objects.clone()));
        let alloc = Arc::new(BumpSpace::new());
        let large = Arc::new(LargeSpace::new());
        let alloc_space: Arc<dyn AllocSpace> = alloc.clone();
        let large_space: Arc<dyn LargeObjectAllocator> = large.clone();

        let mut spaces = vec![SpaceConfig {
            name: "image space",
            begin: HEAP_BEGIN,
            size: IMAGE_CAPACITY,
            capacity: IMAGE_CAPACITY,
            policy: GcRetentionPolicy::NeverCollect,
            allocator: None,
        }];
        if with_zygote {
            spaces.push(SpaceConfig {
                name: "zygote space",
                begin: ZYGOTE_BEGIN,
                size: 0,
                capacity: ZYGOTE_CAPACITY,
                policy: GcRetentionPolicy::FullCollect,
                allocator: None,
            });
        }
        spaces.push(SpaceConfig {
            name: "alloc space",
            begin: ALLOC_BEGIN,
            size: 0,
            capacity: ALLOC_CAPACITY,
            policy: GcRetentionPolicy::AlwaysCollect,
            allocator: Some(alloc_space),
        });

        let heap = Heap::new(
            config,
            spaces,
            Some(large_space),
            objects.clone(),
            runtime.clone(),
        )
        .unwrap();
        Self {
            heap,
            runtime,
            objects,
            alloc,
            large,
            zygote_top: Mutex::new(ZYGOTE_BEGIN),
        }
    }

    fn new_object(&self, fields: usize, kind: Option<ReferenceKind>) -> ObjectRef {
        let obj = {
            let mut top = self.alloc.top.lock();
            let obj = obj(*top);
            *top += OBJECT_SIZE;
            self.heap.alloc_space().set_end(*top);
            obj
        };
        self.objects.insert(obj, fields, kind);
        self.heap.record_allocation(obj, OBJECT_SIZE);
        obj
    }

    fn alloc(&self, fields: usize) -> ObjectRef {
        self.new_object(fields, None)
    }

    /// Allocates from a registered mutator, polling the safepoint first.
    fn alloc_on(&self, mutator: &Mutator, fields: usize) -> ObjectRef {
        self.runtime.safepoint.poll(mutator.id);
        self.alloc(fields)
    }

    fn alloc_reference(&self, kind: ReferenceKind, referent: ObjectRef) -> ObjectRef {
        let reference = self.new_object(0, Some(kind));
        self.objects.set_referent(reference, referent);
        reference
    }

    fn alloc_large(&self, fields: usize) -> ObjectRef {
        let obj = obj(self.large.top.fetch_add(LARGE_OBJECT_SIZE, Ordering::Relaxed));
        self.objects.insert(obj, fields, None);
        self.heap.record_allocation(obj, LARGE_OBJECT_SIZE);
        obj
    }

    fn image_object(&self, slot: usize, fields: usize) -> ObjectRef {
        let obj = obj(HEAP_BEGIN + slot * OBJECT_SIZE);
        self.objects.insert(obj, fields, None);
        assert!(self.heap.add_live_object(obj));
        obj
    }

    fn zygote_object(&self, fields: usize) -> ObjectRef {
        let obj = {
            let mut top = self.zygote_top.lock();
            let obj = obj(*top);
            *top += OBJECT_SIZE;
            self.heap.spaces()[1].set_end(*top);
            obj
        };
        self.objects.insert(obj, fields, None);
        assert!(self.heap.add_live_object(obj));
        obj
    }

    fn store(&self, owner: ObjectRef, index: usize, value: Option<ObjectRef>) {
        self.objects.set_field(owner, index, value);
        self.heap.write_barrier(owner);
    }

    fn add_global(&self, root: ObjectRef) {
        self.runtime.globals.lock().push(root);
    }

    fn collect(&self, gc_type: GcType) -> GcType {
        self.heap
            .collect_garbage_internal(gc_type, GcCause::Explicit, false)
    }

    fn chain(&self, length: usize) -> Vec<ObjectRef> {
        let chain = (0..length).map(|_| self.alloc(1)).collect::<Vec<_>>();
        for pair in chain.windows(2) {
            self.store(pair[0], 0, Some(pair[1]));
        }
        chain
    }

    fn assert_live(&self, obj: ObjectRef) {
        assert!(self.heap.is_live_object(obj), "{:?} is not live", obj);
        assert!(!self.alloc.is_freed(obj), "{:?} was freed", obj);
        assert!(!self.large.is_freed(obj), "{:?} was freed", obj);
    }

    fn assert_freed(&self, obj: ObjectRef) {
        assert!(!self.heap.is_live_object(obj), "{:?} is live", obj);
        assert!(
            self.alloc.is_freed(obj) || self.large.is_freed(obj),
            "{:?} was not freed",
            obj
        );
    }
}

#[test]
fn full_collection_keeps_retained_chain() {
    let fixture = Fixture::new(test_config());
    let chain = fixture.chain(100);
    fixture.add_global(chain[0]);

    assert_eq!(fixture.heap.collect_garbage(false), GcType::Full);
    for obj in chain.iter() {
        fixture.assert_live(*obj);
    }
    assert_eq!(fixture.heap.objects_allocated(), 100);
    assert_eq!(fixture.heap.bytes_allocated(), 100 * OBJECT_SIZE);

    // A second cycle finds the same objects through the live bitmap instead of the stack.
    fixture.heap.collect_garbage(false);
    for obj in chain.iter() {
        fixture.assert_live(*obj);
    }
    assert_eq!(fixture.heap.gc_phase(), GcPhase::None);
}

#[test]
fn full_collection_sweeps_unreferenced_objects() {
    let fixture = Fixture::new(test_config());
    let root = fixture.alloc(1);
    fixture.add_global(root);
    let garbage = (0..50).map(|_| fixture.alloc(0)).collect::<Vec<_>>();

    fixture.heap.collect_garbage(false);
    fixture.assert_live(root);
    for obj in garbage.iter() {
        fixture.assert_freed(*obj);
    }
    let stats = fixture.heap.statistics();
    assert_eq!(stats.total_gc_cycles_count, 1);
    assert_eq!(stats.total_objects_freed, 50);
    assert_eq!(stats.total_bytes_freed, 50 * OBJECT_SIZE);
    assert_eq!(fixture.heap.objects_allocated(), 1);

    // An old object becomes garbage once its last reference is dropped.
    let child = fixture.alloc(0);
    fixture.store(root, 0, Some(child));
    fixture.heap.collect_garbage(false);
    fixture.assert_live(child);
    fixture.store(root, 0, None);
    fixture.heap.collect_garbage(false);
    fixture.assert_freed(child);
    fixture.assert_live(root);
}

#[test]
fn sticky_collection_frees_only_new_garbage() {
    let fixture = Fixture::new(test_config());
    let root = fixture.alloc(2);
    fixture.add_global(root);
    let old = fixture.alloc(0);
    fixture.store(root, 0, Some(old));
    fixture.heap.collect_garbage(false);
    assert_eq!(fixture.heap.next_gc_type(), GcType::Sticky);

    // Old garbage stays until a bigger collection.
    fixture.store(root, 0, None);
    let young = fixture.alloc(1);
    let young_child = fixture.alloc(0);
    fixture.store(young, 0, Some(young_child));
    fixture.store(root, 1, Some(young));
    let young_garbage = (0..10).map(|_| fixture.alloc(0)).collect::<Vec<_>>();

    assert_eq!(fixture.collect(GcType::Sticky), GcType::Sticky);
    fixture.assert_live(young);
    fixture.assert_live(young_child);
    for obj in young_garbage.iter() {
        fixture.assert_freed(*obj);
    }
    assert!(fixture.heap.is_live_object(old));
    assert!(!fixture.alloc.is_freed(old));

    assert_eq!(fixture.collect(GcType::Partial), GcType::Partial);
    fixture.assert_freed(old);
    fixture.assert_live(young);
    fixture.assert_live(young_child);
}

#[test]
fn sticky_collection_promotes_survivors() {
    let fixture = Fixture::new(test_config());
    let holder = fixture.alloc(1);
    fixture.add_global(holder);
    fixture.heap.collect_garbage(false);

    // The store dirties the card before the first cycle only, the survivor is old in the
    // second one.
    let young = fixture.alloc(0);
    fixture.store(holder, 0, Some(young));
    fixture.collect(GcType::Sticky);
    fixture.assert_live(young);
    fixture.collect(GcType::Sticky);
    fixture.assert_live(young);
}

#[test]
fn small_allocation_space_promotes_sticky_collection() {
    let fixture = Fixture::new(Config {
        min_alloc_space_size_for_sticky_gc: MB,
        ..test_config()
    });
    fixture.alloc(0);
    assert_eq!(fixture.collect(GcType::Sticky), GcType::Partial);
}

#[test]
fn partial_collection_without_zygote_runs_full() {
    let fixture = Fixture::build(test_config(), false);
    let garbage = fixture.alloc(0);
    assert_eq!(fixture.collect(GcType::Partial), GcType::Full);
    fixture.assert_freed(garbage);
    let report = fixture.heap.dump_gc_performance_info();
    assert!(report.contains("mark sweep:"), "{}", report);
    assert!(!report.contains("partial mark sweep"), "{}", report);
}

#[test]
fn partial_collection_keeps_zygote_and_its_referents() {
    let fixture = Fixture::new(test_config());
    let zygote = fixture.zygote_object(1);
    let zygote_garbage = fixture.zygote_object(0);
    let referenced = fixture.alloc(0);
    fixture.store(zygote, 0, Some(referenced));
    let garbage = fixture.alloc(0);

    assert_eq!(fixture.collect(GcType::Partial), GcType::Partial);
    fixture.assert_live(referenced);
    fixture.assert_freed(garbage);
    assert!(fixture.heap.is_live_object(zygote));
    assert!(fixture.heap.is_live_object(zygote_garbage));

    // A second partial cycle only sees the card through the zygote mod-union table.
    assert_eq!(fixture.collect(GcType::Partial), GcType::Partial);
    fixture.assert_live(referenced);

    // Nothing roots the zygote objects, a full collection drops them and what they hold.
    assert_eq!(fixture.collect(GcType::Full), GcType::Full);
    assert!(!fixture.heap.is_live_object(zygote));
    assert!(!fixture.heap.is_live_object(zygote_garbage));
    fixture.assert_freed(referenced);
}

#[test]
fn image_references_survive_through_mod_union_table() {
    let fixture = Fixture::new(test_config());
    let image = fixture.image_object(0, 1);
    let referenced = fixture.alloc(0);
    fixture.store(image, 0, Some(referenced));

    fixture.heap.collect_garbage(false);
    fixture.assert_live(referenced);
    // The card is clean now, the cached reference keeps the object alive.
    fixture.heap.collect_garbage(false);
    fixture.heap.collect_garbage(false);
    fixture.assert_live(referenced);
    assert!(fixture.heap.is_live_object(image));

    fixture.store(image, 0, None);
    fixture.heap.collect_garbage(false);
    fixture.assert_freed(referenced);
    assert!(fixture.heap.is_live_object(image));
}

#[test]
fn immune_range_is_stable_across_cycles() {
    let fixture = Fixture::new(test_config());
    fixture.zygote_object(0);
    let zygote_end = fixture.heap.spaces()[1].end();

    for _ in 0..3 {
        let mut collector = MarkSweep::new(&fixture.heap, GcType::Partial, false, false);
        collector.run();
        assert_eq!(collector.immune_range().begin(), HEAP_BEGIN);
        assert_eq!(collector.immune_range().end(), zygote_end);
        assert!(GarbageCollector::swap_bitmaps(&collector));
        assert_eq!(collector.pause_times().len(), 1);

        let mut collector = MarkSweep::new(&fixture.heap, GcType::Full, false, false);
        collector.run();
        assert_eq!(collector.immune_range().begin(), HEAP_BEGIN);
        assert_eq!(collector.immune_range().end(), HEAP_BEGIN + IMAGE_CAPACITY);
    }
}

#[test]
fn collector_reports_freed_objects() {
    let fixture = Fixture::new(test_config());
    for _ in 0..7 {
        fixture.alloc(0);
    }
    fixture.alloc_large(0);

    let mut collector = MarkSweep::new(&fixture.heap, GcType::Full, false, false);
    collector.run();
    assert_eq!(collector.name(), "mark sweep");
    assert_eq!(collector.freed_objects(), 7);
    assert_eq!(collector.freed_bytes(), 7 * OBJECT_SIZE);
    assert_eq!(collector.freed_large_objects(), 1);
    assert_eq!(collector.freed_large_object_bytes(), LARGE_OBJECT_SIZE);
    assert!(collector.duration() >= collector.stats().total_paused_time());
    assert_eq!(fixture.heap.bytes_allocated(), 0);
}

/// Runs one concurrent collection by hand, storing `value` into `holder` once marking is done.
fn collect_with_store_during_marking(
    fixture: &Fixture,
    gc_type: GcType,
    holder: ObjectRef,
    value: ObjectRef,
) {
    let mut collector = MarkSweep::new(&fixture.heap, gc_type, true, false);
    collector.set_phase(GcPhase::Initialize);
    collector.initialize_phase();
    collector.set_phase(GcPhase::Marking);
    collector.marking_phase();

    // The holder is black already, only its dirty card tells the collector about the store.
    fixture.store(holder, 0, Some(value));
    assert!(fixture.heap.card_table().is_dirty(holder.address()));

    fixture.runtime.suspend_all();
    collector.set_phase(GcPhase::HandleDirty);
    assert!(collector.handle_dirty_objects_phase());
    fixture.runtime.resume_all();
    collector.set_phase(GcPhase::Reclaim);
    collector.reclaim_phase();
    collector.set_phase(GcPhase::Finish);
    collector.finish_phase();
    collector.set_phase(GcPhase::None);
}

#[test]
fn store_during_concurrent_marking_is_remarked() {
    let fixture = Fixture::new(test_config());
    let holder = fixture.alloc(1);
    fixture.add_global(holder);
    fixture.heap.collect_garbage(false);

    let hidden = fixture.alloc(0);
    let garbage = fixture.alloc(0);
    collect_with_store_during_marking(&fixture, GcType::Full, holder, hidden);

    fixture.assert_live(holder);
    fixture.assert_live(hidden);
    fixture.assert_freed(garbage);
    assert_eq!(fixture.objects.field(holder, 0), Some(hidden));
}

#[test]
fn store_during_concurrent_sticky_marking_is_remarked() {
    let fixture = Fixture::new(test_config());
    let holder = fixture.alloc(1);
    fixture.add_global(holder);
    fixture.heap.collect_garbage(false);
    assert_eq!(fixture.heap.next_gc_type(), GcType::Sticky);

    let hidden = fixture.alloc(0);
    let garbage = fixture.alloc(0);
    collect_with_store_during_marking(&fixture, GcType::Sticky, holder, hidden);

    fixture.assert_live(holder);
    fixture.assert_live(hidden);
    fixture.assert_freed(garbage);

    // Survives the next full collection through the stored reference alone.
    fixture.heap.collect_garbage(false);
    fixture.assert_live(hidden);
}

#[test]
fn mod_union_verification_does_not_sweep_allocation_stack() {
    let config = Config {
        verify_mod_union_table: true,
        ..test_config()
    };
    assert!(!config.verify_any());
    for config in [
        Config {
            verify_pre_gc_heap: true,
            ..test_config()
        },
        Config {
            verify_post_gc_heap: true,
            ..test_config()
        },
        Config {
            verify_missing_card_marks: true,
            ..test_config()
        },
    ] {
        assert!(config.verify_any());
    }
}

#[test]
fn concurrent_roots_are_marked() {
    for concurrent_gc in [false, true] {
        let fixture = Fixture::new(Config {
            concurrent_gc,
            ..test_config()
        });
        let interned = fixture.alloc(0);
        let garbage = fixture.alloc(0);
        fixture.runtime.interned.lock().0.push(interned);

        fixture.heap.collect_garbage(false);
        fixture.assert_live(interned);
        fixture.assert_freed(garbage);
        fixture.heap.collect_garbage(false);
        fixture.assert_live(interned);
    }
}

#[test]
fn weak_and_phantom_references_are_cleared_and_enqueued() {
    let fixture = Fixture::new(test_config());
    let weak_referent = fixture.alloc(0);
    let weak = fixture.alloc_reference(ReferenceKind::Weak, weak_referent);
    let phantom_referent = fixture.alloc(0);
    let phantom = fixture.alloc_reference(ReferenceKind::Phantom, phantom_referent);
    let strong = fixture.alloc(0);
    let kept = fixture.alloc_reference(ReferenceKind::Weak, strong);
    for root in [weak, phantom, strong, kept] {
        fixture.add_global(root);
    }

    fixture.heap.collect_garbage(true);
    fixture.assert_freed(weak_referent);
    fixture.assert_freed(phantom_referent);
    fixture.assert_live(strong);
    assert_eq!(fixture.objects.referent(weak), None);
    assert_eq!(fixture.objects.referent(phantom), None);
    assert_eq!(fixture.objects.referent(kept), Some(strong));
    assert_eq!(fixture.runtime.cleared(), vec![weak, phantom]);

    // Cleared references are not enqueued again.
    fixture.heap.collect_garbage(true);
    assert_eq!(fixture.runtime.cleared().len(), 2);
}

#[test]
fn soft_references_are_preserved_unless_cleared() {
    let fixture = Fixture::new(test_config());
    let referent = fixture.alloc(0);
    let soft = fixture.alloc_reference(ReferenceKind::Soft, referent);
    fixture.add_global(soft);

    fixture.heap.collect_garbage(false);
    fixture.assert_live(referent);
    assert_eq!(fixture.objects.referent(soft), Some(referent));
    assert!(fixture.runtime.cleared().is_empty());

    fixture.heap.collect_garbage(true);
    fixture.assert_freed(referent);
    assert_eq!(fixture.objects.referent(soft), None);
    assert_eq!(fixture.runtime.cleared(), vec![soft]);
}

#[test]
fn zygote_runtime_keeps_no_soft_referents() {
    let fixture = Fixture::new(test_config());
    fixture.runtime.zygote.store(true, Ordering::Relaxed);
    let referent = fixture.alloc(0);
    let soft = fixture.alloc_reference(ReferenceKind::Soft, referent);
    fixture.add_global(soft);

    fixture.heap.collect_garbage(false);
    fixture.assert_freed(referent);
    assert_eq!(fixture.runtime.cleared(), vec![soft]);
}

#[test]
fn finalizer_reference_resurrects_referent_once() {
    let fixture = Fixture::new(test_config());
    let referent = fixture.alloc(1);
    let referent_child = fixture.alloc(0);
    fixture.store(referent, 0, Some(referent_child));
    let finalizer = fixture.alloc_reference(ReferenceKind::Finalizer, referent);
    fixture.add_global(finalizer);

    fixture.heap.collect_garbage(false);
    fixture.assert_live(referent);
    fixture.assert_live(referent_child);
    assert_eq!(fixture.objects.referent(finalizer), None);
    assert_eq!(fixture.objects.zombie(finalizer), Some(referent));
    assert_eq!(fixture.runtime.cleared(), vec![finalizer]);

    // The zombie stays reachable through the reference, which is not queued twice.
    fixture.heap.collect_garbage(false);
    fixture.assert_live(referent);
    assert_eq!(fixture.runtime.cleared(), vec![finalizer]);
}

#[test]
fn system_weaks_are_swept() {
    let fixture = Fixture::new(Config {
        verify_system_weaks: true,
        ..test_config()
    });
    let live = fixture.alloc(0);
    let dead = fixture.alloc(0);
    fixture.add_global(live);
    fixture.runtime.weaks.lock().extend([live, dead]);

    fixture.heap.collect_garbage(false);
    assert_eq!(*fixture.runtime.weaks.lock(), vec![live]);
    fixture.assert_freed(dead);
}

#[test]
fn large_objects_are_swept_and_scanned() {
    let fixture = Fixture::new(test_config());
    let large = fixture.alloc_large(1);
    let held = fixture.alloc(0);
    fixture.store(large, 0, Some(held));
    fixture.add_global(large);
    let large_garbage = fixture.alloc_large(0);

    fixture.heap.collect_garbage(false);
    fixture.assert_live(large);
    fixture.assert_live(held);
    fixture.assert_freed(large_garbage);
    assert_eq!(fixture.heap.statistics().large_objects, 1);

    // Large objects have no card, sticky collections still find what they point to.
    let young = fixture.alloc(0);
    fixture.store(large, 0, Some(young));
    let young_large = fixture.alloc_large(0);
    assert_eq!(fixture.collect(GcType::Sticky), GcType::Sticky);
    fixture.assert_live(young);
    fixture.assert_live(large);
    fixture.assert_freed(young_large);
    // Unreferenced but old, only a bigger collection frees it.
    fixture.assert_live(held);
    fixture.heap.collect_garbage(false);
    fixture.assert_freed(held);
    fixture.assert_live(young);
}

#[test]
fn parallel_marking_keeps_wide_graph() {
    for use_recursive_mark in [false, true] {
        let fixture = Fixture::new(Config {
            parallel_gc_threads: 3,
            use_recursive_mark,
            ..test_config()
        });
        let root = fixture.alloc(40);
        fixture.add_global(root);
        let mut retained = vec![root];
        for i in 0..40 {
            let node = fixture.alloc(50);
            fixture.store(root, i, Some(node));
            retained.push(node);
            for j in 0..50 {
                let leaf = fixture.alloc(0);
                fixture.store(node, j, Some(leaf));
                retained.push(leaf);
            }
        }
        let garbage = (0..500).map(|_| fixture.alloc(1)).collect::<Vec<_>>();

        fixture.heap.collect_garbage(false);
        for obj in retained.iter() {
            fixture.assert_live(*obj);
        }
        for obj in garbage.iter() {
            fixture.assert_freed(*obj);
        }

        fixture.heap.collect_garbage(false);
        assert_eq!(fixture.collect(GcType::Sticky), GcType::Sticky);
        for obj in retained.iter() {
            fixture.assert_live(*obj);
        }
    }
}

#[test]
fn mark_stack_grows_on_overflow() {
    let fixture = Fixture::new(Config {
        mark_stack_size: 16,
        ..test_config()
    });
    let root = fixture.alloc(1000);
    fixture.add_global(root);
    let children = (0..1000)
        .map(|i| {
            let child = fixture.alloc(1);
            fixture.store(root, i, Some(child));
            child
        })
        .collect::<Vec<_>>();

    fixture.heap.collect_garbage(false);
    for child in children.iter() {
        fixture.assert_live(*child);
    }
    assert!(fixture.heap.mark_stack.lock().capacity() > 16);
}

#[test]
fn allocation_stack_overflow_runs_collection() {
    let fixture = Fixture::new(Config {
        allocation_stack_size: 64,
        ..test_config()
    });
    let root = fixture.alloc(1);
    fixture.add_global(root);
    let mut last = root;
    for _ in 0..100 {
        let obj = fixture.alloc(1);
        fixture.store(last, 0, Some(obj));
        last = obj;
    }
    assert!(fixture.heap.statistics().total_gc_cycles_count >= 1);

    fixture.heap.collect_garbage(false);
    let mut obj = Some(root);
    let mut length = 0;
    while let Some(current) = obj {
        fixture.assert_live(current);
        obj = fixture.objects.field(current, 0);
        length += 1;
    }
    assert_eq!(length, 101);
}

#[test]
fn verification_passes_on_consistent_heap() {
    let fixture = Fixture::new(Config {
        verify_pre_gc_heap: true,
        verify_post_gc_heap: true,
        verify_missing_card_marks: true,
        verify_mod_union_table: true,
        verify_system_weaks: true,
        parallel_gc_threads: 2,
        ..test_config()
    });
    let image = fixture.image_object(0, 1);
    let zygote = fixture.zygote_object(1);
    fixture.add_global(zygote);
    let root = fixture.alloc(2);
    fixture.add_global(root);
    fixture.store(image, 0, Some(root));
    let weak = fixture.alloc(0);
    fixture.runtime.weaks.lock().push(weak);

    for gc_type in [
        GcType::Full,
        GcType::Sticky,
        GcType::Partial,
        GcType::Sticky,
        GcType::Full,
    ] {
        let young = fixture.alloc(1);
        fixture.store(root, 0, Some(young));
        let from_zygote = fixture.alloc(0);
        fixture.store(zygote, 0, Some(from_zygote));
        fixture.store(young, 0, Some(fixture.alloc(0)));
        fixture.alloc(1);
        assert_eq!(fixture.collect(gc_type), gc_type);
        fixture.assert_live(young);
        fixture.assert_live(from_zygote);
    }
    fixture.assert_live(root);
    assert!(fixture.runtime.weaks.lock().is_empty());
}

#[test]
fn footprint_follows_target_utilization() {
    let config = test_config();
    let fixture = Fixture::new(config.clone());
    assert_eq!(fixture.heap.max_allowed_footprint(), config.initial_size);
    assert_eq!(
        fixture.alloc.footprint_limit.load(Ordering::Relaxed),
        config.initial_size
    );
    assert_eq!(fixture.heap.concurrent_start_bytes(), usize::MAX);

    let chain = fixture.chain(64);
    fixture.add_global(chain[0]);
    fixture.heap.collect_garbage(false);
    let allocated = fixture.heap.bytes_allocated();
    assert_eq!(allocated, 64 * OBJECT_SIZE);
    assert_eq!(
        fixture.heap.max_allowed_footprint(),
        allocated + config.min_free
    );
    assert_eq!(
        fixture.alloc.footprint_limit.load(Ordering::Relaxed),
        allocated + config.min_free
    );
    assert_eq!(fixture.heap.next_gc_type(), GcType::Sticky);

    fixture.collect(GcType::Sticky);
    assert_eq!(fixture.heap.next_gc_type(), GcType::Sticky);
    assert_eq!(
        fixture.heap.max_allowed_footprint(),
        allocated + config.min_free
    );

    let report = fixture.heap.dump_gc_performance_info();
    assert!(report.contains("mark sweep:"), "{}", report);
    assert!(report.contains("sticky mark sweep:"), "{}", report);
    assert!(report.contains("Heap statistics"), "{}", report);
    assert!(fixture.heap.dump_spaces().contains("alloc space"));
}

#[test]
fn wait_without_concurrent_collection() {
    let fixture = Fixture::new(test_config());
    assert_eq!(fixture.heap.wait_for_concurrent_gc_to_complete(), None);
    let fixture = Fixture::new(Config {
        concurrent_gc: true,
        ..test_config()
    });
    assert_eq!(fixture.heap.wait_for_concurrent_gc_to_complete(), None);
}

#[test]
fn concurrent_collection_with_running_mutators() {
    let fixture = Fixture::new(Config {
        concurrent_gc: true,
        parallel_gc_threads: 2,
        conc_gc_threads: 1,
        ..test_config()
    });
    let stop = AtomicBool::new(false);
    let holders = Mutex::new(vec![]);
    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                let mutator = fixture.runtime.attach();
                let holder = fixture.alloc_on(&mutator, 1);
                mutator.thread.roots.lock().push(holder);
                let mut allocated = 0;
                while !stop.load(Ordering::Acquire) || allocated < 1000 {
                    // Only the newest object stays reachable.
                    let obj = fixture.alloc_on(&mutator, 1);
                    fixture.store(holder, 0, Some(obj));
                    allocated += 1;
                    if allocated == 5000 {
                        break;
                    }
                }
                fixture.add_global(holder);
                holders.lock().push(holder);
                fixture.runtime.detach(mutator);
            });
        }
        for _ in 0..5 {
            fixture.heap.collect_garbage(false);
        }
        stop.store(true, Ordering::Release);
    });

    fixture.heap.wait_for_concurrent_gc_to_complete();
    fixture.heap.collect_garbage(false);
    for holder in holders.lock().iter() {
        fixture.assert_live(*holder);
        let newest = fixture.objects.field(*holder, 0).unwrap();
        fixture.assert_live(newest);
    }
    assert!(fixture.heap.statistics().total_objects_freed > 0);
}

#[test]
fn allocation_starts_background_collection() {
    let fixture = Fixture::new(Config {
        concurrent_gc: true,
        initial_size: 256 * KB,
        ..test_config()
    });
    assert_eq!(fixture.heap.concurrent_start_bytes(), 128 * KB);
    let mutator = fixture.runtime.attach();
    let root = fixture.alloc_on(&mutator, 0);
    mutator.thread.roots.lock().push(root);
    for _ in 0..128 * KB / OBJECT_SIZE {
        fixture.alloc_on(&mutator, 0);
    }

    assert!(fixture.heap.wait_for_concurrent_gc_to_complete().is_some());
    assert!(fixture.heap.statistics().total_gc_cycles_count >= 1);
    fixture.assert_live(root);
    fixture.runtime.detach(mutator);
}

#[test]
fn background_collection_runs_next_gc_type() {
    let fixture = Fixture::new(test_config());
    let garbage = fixture.alloc(0);
    fixture.heap.concurrent_gc();
    fixture.assert_freed(garbage);
    // The first background collection is partial.
    let report = fixture.heap.dump_gc_performance_info();
    assert!(report.contains("partial mark sweep:"), "{}", report);
    assert_eq!(fixture.heap.next_gc_type(), GcType::Sticky);
}

fn try_heap(spaces: Vec<SpaceConfig>) -> Result<Arc<Heap>, HeapError> {
    let objects = Arc::new(FakeObjects::default());
    let runtime = Arc::new(FakeRuntime::new(objects.clone()));
    Heap::new(test_config(), spaces, None, objects, runtime)
}

fn space(
    name: &'static str,
    begin: usize,
    capacity: usize,
    policy: GcRetentionPolicy,
    allocator: bool,
) -> SpaceConfig {
    SpaceConfig {
        name,
        begin,
        size: 0,
        capacity,
        policy,
        allocator: if allocator {
            let allocator: Arc<dyn AllocSpace> = Arc::new(BumpSpace::new());
            Some(allocator)
        } else {
            None
        },
    }
}

#[test]
fn heap_rejects_invalid_spaces() {
    use GcRetentionPolicy::*;

    let err = try_heap(vec![]).unwrap_err();
    assert!(matches!(err, HeapError::NoAllocSpace), "{}", err);

    let err = try_heap(vec![
        space("b", ALLOC_BEGIN, MB, AlwaysCollect, true),
        space("a", HEAP_BEGIN, MB, NeverCollect, false),
    ])
    .unwrap_err();
    assert!(matches!(err, HeapError::UnsortedSpaces { .. }), "{}", err);

    let err = try_heap(vec![space("a", HEAP_BEGIN + 8, MB, AlwaysCollect, true)]).unwrap_err();
    assert!(matches!(err, HeapError::UnalignedSpace { .. }), "{}", err);

    let err = try_heap(vec![space("a", HEAP_BEGIN, 32 * MB, AlwaysCollect, true)]).unwrap_err();
    assert!(matches!(err, HeapError::OutsideCardTable { .. }), "{}", err);

    let err = try_heap(vec![space("a", HEAP_BEGIN, MB, AlwaysCollect, false)]).unwrap_err();
    assert!(matches!(err, HeapError::MissingAllocator(_)), "{}", err);

    let err = try_heap(vec![
        space("a", HEAP_BEGIN, MB, AlwaysCollect, true),
        space("b", HEAP_BEGIN + MB, MB, AlwaysCollect, true),
    ])
    .unwrap_err();
    assert!(matches!(err, HeapError::InvalidConfig(_)), "{}", err);

    let err = try_heap(vec![space("a", HEAP_BEGIN, MB, FullCollect, false)]).unwrap_err();
    assert!(matches!(err, HeapError::NoAllocSpace), "{}", err);

    assert!(try_heap(vec![
        space("image", HEAP_BEGIN, MB, NeverCollect, false),
        space("zygote", HEAP_BEGIN + MB, MB, FullCollect, false),
        space("alloc", HEAP_BEGIN + 2 * MB, MB, AlwaysCollect, true),
    ])
    .is_ok());
}
