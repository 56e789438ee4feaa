//! Soft, weak, finalizer and phantom reference processing.
//!
//! Reference objects found during marking with a white referent are threaded into cyclic
//! lists through their pending-next field. Once marking is done the lists are walked: some
//! soft referents are kept alive, finalizable referents are resurrected into their finalizer
//! reference, and every reference left with a white referent is cleared and handed back to
//! the runtime.
use parking_lot::Mutex;

use crate::{
    gcref::ObjectRef,
    internal::heap_bitmap::HeapBitmap,
    marksweep::MarkSweep,
    runtime::{ObjectModel, ReferenceKind},
};

/// Appends `reference` to the cyclic list `list`.
pub fn enqueue_pending_reference(
    model: &dyn ObjectModel,
    reference: ObjectRef,
    list: &mut Option<ObjectRef>,
) {
    match *list {
        None => {
            // One element cycle.
            model.set_pending_next(reference, Some(reference));
            *list = Some(reference);
        }
        Some(head) => {
            let next = model.pending_next(head);
            model.set_pending_next(reference, next);
            model.set_pending_next(head, Some(reference));
        }
    }
}

/// Unlinks one reference from `list`, clearing its pending-next field.
pub fn dequeue_pending_reference(
    model: &dyn ObjectModel,
    list: &mut Option<ObjectRef>,
) -> Option<ObjectRef> {
    let head = (*list)?;
    let next = model.pending_next(head).unwrap_or(head);
    let reference = if next == head {
        *list = None;
        head
    } else {
        let after = model.pending_next(next);
        model.set_pending_next(head, after);
        next
    };
    model.set_pending_next(reference, None);
    Some(reference)
}

/// A pending list shared by the marking threads.
#[derive(Default)]
pub struct ReferenceQueue {
    list: Mutex<Option<ObjectRef>>,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_none()
    }

    /// Enqueues `reference` unless it is already on a pending list.
    pub fn enqueue_if_absent(&self, model: &dyn ObjectModel, reference: ObjectRef) -> bool {
        let mut list = self.list.lock();
        if model.pending_next(reference).is_some() {
            return false;
        }
        enqueue_pending_reference(model, reference, &mut list);
        true
    }

    pub fn enqueue(&self, model: &dyn ObjectModel, reference: ObjectRef) {
        enqueue_pending_reference(model, reference, &mut self.list.lock());
    }

    /// Takes the whole list, leaving the queue empty.
    pub fn take(&self) -> Option<ObjectRef> {
        self.list.lock().take()
    }

    fn put_back(&self, list: Option<ObjectRef>) {
        let mut current = self.list.lock();
        debug_assert!(current.is_none());
        *current = list;
    }
}

/// The per-kind pending lists of one collection plus the list of cleared references.
#[derive(Default)]
pub struct ReferenceQueues {
    pub soft: ReferenceQueue,
    pub weak: ReferenceQueue,
    pub finalizer: ReferenceQueue,
    pub phantom: ReferenceQueue,
    pub cleared: ReferenceQueue,
}

impl ReferenceQueues {
    pub fn queue(&self, kind: ReferenceKind) -> &ReferenceQueue {
        match kind {
            ReferenceKind::Soft => &self.soft,
            ReferenceKind::Weak => &self.weak,
            ReferenceKind::Finalizer => &self.finalizer,
            ReferenceKind::Phantom => &self.phantom,
        }
    }

    /// Whether every pending list is empty; the cleared list is not considered.
    pub fn is_empty(&self) -> bool {
        self.soft.is_empty()
            && self.weak.is_empty()
            && self.finalizer.is_empty()
            && self.phantom.is_empty()
    }
}

impl<'h> MarkSweep<'h> {
    /// Walks the pending lists once marking is complete.
    pub(crate) fn process_references(&mut self, bitmaps: &HeapBitmap, clear_soft: bool) {
        debug_assert!(self.heap.mark_stack.lock().is_empty());
        // Unless in the zygote or asked to clear soft references, keep some white referents.
        if !clear_soft && !self.heap.runtime.is_zygote() {
            self.preserve_some_soft_references(bitmaps);
        }
        self.timings.start_split("ProcessReferences");
        self.clear_white_references(bitmaps, ReferenceKind::Soft);
        self.clear_white_references(bitmaps, ReferenceKind::Weak);
        self.timings.end_split();

        // Resurrect white objects with finalizers and schedule them for finalization.
        self.enqueue_finalizer_references(bitmaps);

        self.timings.start_split("ProcessReferences");
        // References whose referents only the finalizers reach.
        self.clear_white_references(bitmaps, ReferenceKind::Soft);
        self.clear_white_references(bitmaps, ReferenceKind::Weak);
        self.clear_white_references(bitmaps, ReferenceKind::Phantom);
        debug_assert!(self.references.is_empty());
        self.timings.end_split();
    }

    /// Marks every other white soft referent and restarts marking from them.
    fn preserve_some_soft_references(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("PreserveSomeSoftReferences");
        let heap = self.heap;
        let model = &*heap.object_model;
        let mut list = self.references.soft.take();
        let mut clear = None;
        let mut counter = 0usize;
        while let Some(reference) = dequeue_pending_reference(model, &mut list) {
            let referent = match model.referent(reference) {
                Some(referent) => referent,
                // Cleared by the mutator during marking.
                None => continue,
            };
            let mut is_marked = self.is_marked(bitmaps, referent);
            if !is_marked {
                counter += 1;
                if counter & 1 != 0 {
                    self.mark_object(bitmaps, referent);
                    is_marked = true;
                }
            }
            if !is_marked {
                enqueue_pending_reference(model, reference, &mut clear);
            }
        }
        self.references.soft.put_back(clear);
        self.timings.end_split();
        self.process_mark_stack(bitmaps, true);
    }

    /// Clears the referent of every reference of `kind` whose referent is white and moves the
    /// enqueuable ones to the cleared list.
    fn clear_white_references(&mut self, bitmaps: &HeapBitmap, kind: ReferenceKind) {
        let heap = self.heap;
        let model = &*heap.object_model;
        let mut list = self.references.queue(kind).take();
        while let Some(reference) = dequeue_pending_reference(model, &mut list) {
            if let Some(referent) = model.referent(reference) {
                if !self.is_marked(bitmaps, referent) {
                    model.clear_referent(reference);
                    if model.is_enqueuable(reference) {
                        self.references.cleared.enqueue(model, reference);
                    }
                }
            }
        }
    }

    /// Marks white finalizable referents, moves them into the zombie field and enqueues their
    /// references.
    fn enqueue_finalizer_references(&mut self, bitmaps: &HeapBitmap) {
        self.timings.start_split("EnqueueFinalizerReferences");
        let heap = self.heap;
        let model = &*heap.object_model;
        let mut list = self.references.finalizer.take();
        let mut has_enqueued = false;
        while let Some(reference) = dequeue_pending_reference(model, &mut list) {
            if let Some(referent) = model.referent(reference) {
                if !self.is_marked(bitmaps, referent) {
                    self.mark_object(bitmaps, referent);
                    debug_assert!(model.is_enqueuable(reference));
                    model.set_zombie(reference, referent);
                    model.clear_referent(reference);
                    self.references.cleared.enqueue(model, reference);
                    has_enqueued = true;
                }
            }
        }
        self.timings.end_split();
        if has_enqueued {
            self.process_mark_stack(bitmaps, true);
        }
    }

    /// Drains the cleared list, in the order the references were cleared.
    pub(crate) fn take_cleared_references(&self) -> Vec<ObjectRef> {
        let heap = self.heap;
        let model = &*heap.object_model;
        let mut list = self.references.cleared.take();
        let mut cleared = vec![];
        while let Some(reference) = dequeue_pending_reference(model, &mut list) {
            cleared.push(reference);
        }
        cleared.reverse();
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visitor::ReferenceVisitor;
    use hashbrown::HashMap;

    #[derive(Default)]
    struct Links(Mutex<HashMap<ObjectRef, Option<ObjectRef>>>);

    impl ObjectModel for Links {
        fn visit_references(&self, _obj: ObjectRef, _visitor: &mut dyn ReferenceVisitor) {}
        fn reference_kind(&self, _obj: ObjectRef) -> Option<ReferenceKind> {
            Some(ReferenceKind::Weak)
        }
        fn referent(&self, _reference: ObjectRef) -> Option<ObjectRef> {
            None
        }
        fn clear_referent(&self, _reference: ObjectRef) {}
        fn pending_next(&self, reference: ObjectRef) -> Option<ObjectRef> {
            self.0.lock().get(&reference).copied().flatten()
        }
        fn set_pending_next(&self, reference: ObjectRef, next: Option<ObjectRef>) {
            self.0.lock().insert(reference, next);
        }
        fn is_enqueuable(&self, _reference: ObjectRef) -> bool {
            true
        }
        fn set_zombie(&self, _reference: ObjectRef, _zombie: ObjectRef) {}
    }

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    #[test]
    fn pending_list_is_cyclic() {
        let model = Links::default();
        let mut list = None;
        for addr in [0x100, 0x200, 0x300] {
            enqueue_pending_reference(&model, obj(addr), &mut list);
        }
        assert_eq!(list, Some(obj(0x100)));
        // Walking pending-next from the head comes back to it.
        let mut cur = obj(0x100);
        for _ in 0..3 {
            cur = model.pending_next(cur).unwrap();
        }
        assert_eq!(cur, obj(0x100));

        let mut order = vec![];
        while let Some(reference) = dequeue_pending_reference(&model, &mut list) {
            assert_eq!(model.pending_next(reference), None);
            order.push(reference.address());
        }
        assert_eq!(order, vec![0x300, 0x200, 0x100]);
        assert_eq!(list, None);
    }

    #[test]
    fn queue_skips_enqueued_references() {
        let model = Links::default();
        let queue = ReferenceQueue::new();
        assert!(queue.enqueue_if_absent(&model, obj(0x100)));
        assert!(!queue.enqueue_if_absent(&model, obj(0x100)));
        assert!(queue.enqueue_if_absent(&model, obj(0x200)));
        let mut list = queue.take();
        assert!(queue.is_empty());
        assert!(dequeue_pending_reference(&model, &mut list).is_some());
        assert!(dequeue_pending_reference(&model, &mut list).is_some());
        assert!(dequeue_pending_reference(&model, &mut list).is_none());
    }
}
