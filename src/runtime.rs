//! Interfaces the collector consumes from the embedding runtime.
//!
//! The collector never looks inside objects on its own: all knowledge about object layout,
//! roots and threads comes through the traits in this module, which are injected when a
//! [`Heap`](crate::heap::Heap) is constructed.
use std::sync::Arc;

use crate::{
    gcref::ObjectRef,
    visitor::{ReferenceVisitor, RootVisitor},
};

/// Kind of a `java.lang.ref.Reference`-like object.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Finalizer,
    Phantom,
}

/// Object layout knowledge required for tracing and reference processing.
pub trait ObjectModel: Send + Sync {
    /// Reports every outgoing reference field of `obj` to `visitor`.
    ///
    /// For reference objects the referent field must NOT be reported, the collector decides
    /// itself whether the referent is traced.
    fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn ReferenceVisitor);

    /// `Some(kind)` if `obj` is a reference object.
    fn reference_kind(&self, obj: ObjectRef) -> Option<ReferenceKind>;

    fn referent(&self, reference: ObjectRef) -> Option<ObjectRef>;
    fn clear_referent(&self, reference: ObjectRef);

    /// The link used to thread reference objects into the collector's pending lists.
    fn pending_next(&self, reference: ObjectRef) -> Option<ObjectRef>;
    fn set_pending_next(&self, reference: ObjectRef, next: Option<ObjectRef>);

    /// Whether `reference` has a queue and is not on it yet.
    fn is_enqueuable(&self, reference: ObjectRef) -> bool;

    /// Stores the resurrected referent of a finalizer reference.
    fn set_zombie(&self, reference: ObjectRef, zombie: ObjectRef);
}

/// A mutator thread as seen by a checkpoint.
pub trait MutatorThread: Send + Sync {
    fn visit_roots(&self, visitor: &mut dyn RootVisitor);
}

/// Closure executed once per mutator thread, either by the thread itself at a safepoint or by
/// the requesting thread on behalf of a suspended one.
pub trait Checkpoint: Send + Sync {
    fn run(&self, thread: &dyn MutatorThread);
}

/// Root enumeration, thread control and runtime-side weak tables.
pub trait Runtime: Send + Sync {
    /// Every root: concurrent roots followed by the non-concurrent ones.
    fn visit_roots(&self, visitor: &mut dyn RootVisitor, only_dirty: bool, clean_dirty: bool) {
        self.visit_concurrent_roots(visitor, only_dirty, clean_dirty);
        self.visit_non_concurrent_roots(visitor);
    }

    /// Roots not owned by any thread that may only be visited while mutators are stopped.
    fn visit_non_thread_roots(&self, visitor: &mut dyn RootVisitor);

    /// Roots that can be visited while mutators run (interned strings, class tables, ...).
    /// With `only_dirty`, only entries added since the last `clean_dirty` visit are reported.
    fn visit_concurrent_roots(
        &self,
        visitor: &mut dyn RootVisitor,
        only_dirty: bool,
        clean_dirty: bool,
    );

    /// Thread roots plus [`Runtime::visit_non_thread_roots`].
    fn visit_non_concurrent_roots(&self, visitor: &mut dyn RootVisitor);

    /// Requests `checkpoint` to run on every mutator thread. Returns the number of threads
    /// that will run it; each run must end with the checkpoint's own barrier pass.
    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize;

    fn suspend_all(&self);
    fn resume_all(&self);

    /// Drops every runtime-held weak entry whose object is not marked.
    fn sweep_system_weaks(&self, is_marked: &dyn Fn(ObjectRef) -> bool);

    fn allow_new_system_weaks(&self) {}
    fn disallow_new_system_weaks(&self) {}

    /// Receives the references cleared by a collection, in enqueue order.
    fn enqueue_cleared_references(&self, references: Vec<ObjectRef>);

    /// Whether the runtime runs in the zygote, soft references are all preserved then.
    fn is_zygote(&self) -> bool {
        false
    }

    /// Called with `true` before the current thread blocks waiting for a collection and with
    /// `false` once it resumes. A blocked mutator must not hold up checkpoints.
    fn set_current_thread_blocked(&self, _blocked: bool) {}
}

/// Allocator of a continuous space.
pub trait AllocSpace: Send + Sync {
    /// Frees `objects`, returning the number of bytes released.
    fn free_list(&self, objects: &[ObjectRef]) -> usize;

    /// Caps how far the space may grow before the next collection.
    fn set_footprint_limit(&self, _limit: usize) {}
}

/// Allocator for objects living outside every continuous space.
pub trait LargeObjectAllocator: Send + Sync {
    fn contains(&self, obj: ObjectRef) -> bool;
    /// Frees `obj`, returning the number of bytes released.
    fn free(&self, obj: ObjectRef) -> usize;
}
