use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{gcref::ObjectRef, runtime::AllocSpace};

/// How a space takes part in collections.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum GcRetentionPolicy {
    /// Application heap, collected by every collection.
    AlwaysCollect,
    /// Zygote/shared heap, only collected by full collections.
    FullCollect,
    /// Boot image, never collected and assumed fully live.
    NeverCollect,
}

/// Description of a continuous space handed to [`Heap::new`](crate::heap::Heap::new).
pub struct SpaceConfig {
    pub name: &'static str,
    pub begin: usize,
    /// Bytes in use at heap creation.
    pub size: usize,
    /// Bytes the space may grow to. Bitmaps cover the whole capacity.
    pub capacity: usize,
    pub policy: GcRetentionPolicy,
    pub allocator: Option<Arc<dyn AllocSpace>>,
}

/// Address range `[begin, end)` of the heap, where `end` may grow up to `limit`.
pub struct ContinuousSpace {
    name: &'static str,
    index: usize,
    begin: usize,
    end: AtomicUsize,
    limit: usize,
    policy: GcRetentionPolicy,
    allocator: Option<Arc<dyn AllocSpace>>,
}

impl ContinuousSpace {
    pub(crate) fn new(index: usize, config: SpaceConfig) -> Self {
        Self {
            name: config.name,
            index,
            begin: config.begin,
            end: AtomicUsize::new(config.begin + config.size),
            limit: config.begin + config.capacity,
            policy: config.policy,
            allocator: config.allocator,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
    /// Position in the heap's address-sorted space vector, also the index of its bitmaps.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }
    #[inline]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }
    #[inline]
    pub fn size(&self) -> usize {
        self.end() - self.begin
    }
    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit - self.begin
    }
    #[inline]
    pub fn gc_retention_policy(&self) -> GcRetentionPolicy {
        self.policy
    }
    #[inline]
    pub fn allocator(&self) -> Option<&Arc<dyn AllocSpace>> {
        self.allocator.as_ref()
    }

    /// Grows (or shrinks) the used part of the space.
    pub fn set_end(&self, end: usize) {
        debug_assert!(end >= self.begin && end <= self.limit);
        self.end.store(end, Ordering::Release);
    }

    /// Whether `obj` lies in the used part of the space.
    #[inline]
    pub fn has_address(&self, obj: ObjectRef) -> bool {
        let addr = obj.address();
        addr >= self.begin && addr < self.end()
    }

    /// Whether `obj` lies anywhere in the reserved range.
    #[inline]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        let addr = obj.address();
        addr >= self.begin && addr < self.limit
    }

    #[inline]
    pub fn is_zygote_space(&self) -> bool {
        self.policy == GcRetentionPolicy::FullCollect
    }

    #[inline]
    pub fn is_image_space(&self) -> bool {
        self.policy == GcRetentionPolicy::NeverCollect
    }
}

impl fmt::Debug for ContinuousSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} space '{}' {:#x}-{:#x} (limit {:#x})",
            self.policy,
            self.name,
            self.begin,
            self.end(),
            self.limit
        )
    }
}
