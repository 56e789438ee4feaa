use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::{Mutex, MutexGuard};

use crate::{gcref::ObjectRef, runtime::LargeObjectAllocator};

/// Live and mark sets of the large-object space. Large objects live outside every continuous
/// space, so they are tracked by hash sets instead of bitmaps.
#[derive(Default)]
pub struct LargeObjectSets {
    pub live: HashSet<ObjectRef>,
    pub mark: HashSet<ObjectRef>,
}

pub struct LargeObjectSpace {
    sets: Mutex<LargeObjectSets>,
    allocator: Option<Arc<dyn LargeObjectAllocator>>,
}

impl LargeObjectSpace {
    pub fn new(allocator: Option<Arc<dyn LargeObjectAllocator>>) -> Self {
        Self {
            sets: Mutex::new(LargeObjectSets::default()),
            allocator,
        }
    }

    /// Takes the large-object lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, LargeObjectSets> {
        self.sets.lock()
    }

    /// Whether `obj` was allocated by the large-object allocator and not freed yet. Without an
    /// allocator every address outside the continuous spaces is accepted.
    pub fn contains(&self, obj: ObjectRef) -> bool {
        match self.allocator {
            Some(ref allocator) => allocator.contains(obj),
            None => true,
        }
    }

    /// Records a surviving allocation as live.
    #[inline]
    pub fn set_live(&self, obj: ObjectRef) -> bool {
        self.sets.lock().live.insert(obj)
    }

    /// Marks `obj`, returning `true` if it was unmarked before.
    #[inline]
    pub fn mark(&self, obj: ObjectRef) -> bool {
        self.sets.lock().mark.insert(obj)
    }

    #[inline]
    pub fn unmark(&self, obj: ObjectRef) -> bool {
        self.sets.lock().mark.remove(&obj)
    }

    #[inline]
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.sets.lock().mark.contains(&obj)
    }

    #[inline]
    pub fn is_live(&self, obj: ObjectRef) -> bool {
        self.sets.lock().live.contains(&obj)
    }

    pub fn copy_live_to_mark(&self) {
        let mut sets = self.sets.lock();
        let LargeObjectSets { live, mark } = &mut *sets;
        mark.clone_from(live);
    }

    pub fn swap_bitmaps(&self) {
        let mut sets = self.sets.lock();
        let LargeObjectSets { live, mark } = &mut *sets;
        std::mem::swap(live, mark);
    }

    pub fn clear_mark(&self) {
        self.sets.lock().mark.clear();
    }

    pub fn live_objects(&self) -> usize {
        self.sets.lock().live.len()
    }

    /// Frees `obj`, dropping it from both sets. Returns the bytes released.
    pub fn free(&self, obj: ObjectRef) -> usize {
        {
            let mut sets = self.sets.lock();
            sets.live.remove(&obj);
            sets.mark.remove(&obj);
        }
        match self.allocator {
            Some(ref allocator) => allocator.free(obj),
            None => 0,
        }
    }

    /// Frees every live object that is not marked. Returns `(objects, bytes)` freed. With
    /// `swap_bitmaps` the sets are used the other way round, for sweeping after a swap.
    pub fn sweep(&self, swap_bitmaps: bool) -> (usize, usize) {
        let dead: Vec<ObjectRef> = {
            let sets = self.sets.lock();
            let (live, mark) = if swap_bitmaps {
                (&sets.mark, &sets.live)
            } else {
                (&sets.live, &sets.mark)
            };
            live.difference(mark).copied().collect()
        };
        let mut freed_bytes = 0;
        for obj in dead.iter() {
            freed_bytes += self.free(*obj);
        }
        (dead.len(), freed_bytes)
    }
}

impl std::fmt::Debug for LargeObjectSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sets = self.sets.lock();
        write!(
            f,
            "large object space (live {}, marked {})",
            sets.live.len(),
            sets.mark.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAllocator {
        freed: AtomicUsize,
    }

    impl LargeObjectAllocator for CountingAllocator {
        fn contains(&self, obj: ObjectRef) -> bool {
            obj.address() >= 0x9000_0000
        }
        fn free(&self, _obj: ObjectRef) -> usize {
            self.freed.fetch_add(1, Ordering::Relaxed);
            4096
        }
    }

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    #[test]
    fn sweep_frees_unmarked() {
        let allocator = Arc::new(CountingAllocator {
            freed: AtomicUsize::new(0),
        });
        let space = LargeObjectSpace::new(Some(allocator.clone()));
        {
            let mut sets = space.lock();
            sets.live.insert(obj(0x9000_0000));
            sets.live.insert(obj(0x9001_0000));
        }
        assert!(space.mark(obj(0x9000_0000)));
        assert!(!space.mark(obj(0x9000_0000)));
        assert_eq!(space.sweep(false), (1, 4096));
        assert_eq!(allocator.freed.load(Ordering::Relaxed), 1);
        space.swap_bitmaps();
        space.clear_mark();
        assert!(space.is_live(obj(0x9000_0000)));
        assert!(!space.is_live(obj(0x9001_0000)));
        assert!(space.contains(obj(0x9002_0000)));
    }
}
