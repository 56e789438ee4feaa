use std::{
    io,
    mem::size_of,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{gcref::ObjectRef, mmap::MemMap};

/// Fixed-capacity stack of object references backed by an anonymous mapping.
///
/// Used for the allocation/live stacks, where mutators push concurrently through
/// [`ObjectStack::atomic_push_back`], and for the mark stack, which is only touched through
/// `&mut` and grows with [`ObjectStack::resize`].
pub struct ObjectStack {
    name: &'static str,
    mem_map: MemMap,
    begin: *mut AtomicUsize,
    front_index: AtomicUsize,
    back_index: AtomicUsize,
    capacity: usize,
}

unsafe impl Send for ObjectStack {}
unsafe impl Sync for ObjectStack {}

impl ObjectStack {
    pub fn create(name: &'static str, capacity: usize) -> io::Result<Self> {
        let mem_map = MemMap::map_anonymous(name, capacity * size_of::<usize>())?;
        let begin = mem_map.begin().cast();
        Ok(Self {
            name,
            mem_map,
            begin,
            front_index: AtomicUsize::new(0),
            back_index: AtomicUsize::new(0),
            capacity,
        })
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < self.capacity);
        unsafe { &*self.begin.add(index) }
    }

    #[inline]
    fn load(&self, index: usize) -> ObjectRef {
        let addr = self.slot(index).load(Ordering::Relaxed);
        debug_assert_ne!(addr, 0, "{}: empty slot {}", self.name, index);
        unsafe { ObjectRef::from_address_unchecked(addr) }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Pushes `obj` from any thread. Returns `false` when the stack is full.
    pub fn atomic_push_back(&self, obj: ObjectRef) -> bool {
        let mut index;
        loop {
            index = self.back_index.load(Ordering::Relaxed);
            if index >= self.capacity {
                return false;
            }
            if self
                .back_index
                .compare_exchange_weak(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.slot(index).store(obj.address(), Ordering::Release);
        true
    }

    #[inline]
    pub fn push_back(&mut self, obj: ObjectRef) {
        let index = *self.back_index.get_mut();
        debug_assert!(index < self.capacity, "{} overflow", self.name);
        self.slot(index).store(obj.address(), Ordering::Relaxed);
        *self.back_index.get_mut() = index + 1;
    }

    #[inline]
    pub fn pop_back(&mut self) -> Option<ObjectRef> {
        let back = *self.back_index.get_mut();
        if back <= *self.front_index.get_mut() {
            return None;
        }
        *self.back_index.get_mut() = back - 1;
        Some(self.load(back - 1))
    }

    pub fn pop_front(&mut self) -> Option<ObjectRef> {
        let front = *self.front_index.get_mut();
        if front >= *self.back_index.get_mut() {
            return None;
        }
        *self.front_index.get_mut() = front + 1;
        Some(self.load(front))
    }

    /// Removes the topmost `count` entries and returns them in stack order.
    pub fn pop_back_count(&mut self, count: usize) -> Vec<ObjectRef> {
        let back = *self.back_index.get_mut();
        let new_back = back - count.min(self.size());
        let popped = (new_back..back).map(|i| self.load(i)).collect();
        *self.back_index.get_mut() = new_back;
        popped
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.back_index.load(Ordering::Relaxed) - self.front_index.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.back_index.load(Ordering::Relaxed) >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over the current contents, bottom to top. Slots reserved by a concurrent
    /// [`ObjectStack::atomic_push_back`] that are not written yet are skipped.
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        let front = self.front_index.load(Ordering::Acquire);
        let back = self.back_index.load(Ordering::Acquire);
        (front..back)
            .filter_map(move |i| ObjectRef::from_address(self.slot(i).load(Ordering::Acquire)))
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.iter().any(|o| o == obj)
    }

    /// Empties the stack and returns its pages to the OS.
    pub fn reset(&mut self) {
        let used = *self.back_index.get_mut();
        *self.front_index.get_mut() = 0;
        *self.back_index.get_mut() = 0;
        if used != 0 {
            let begin = self.begin.cast::<u8>();
            self.mem_map
                .zero_and_release_pages(begin, unsafe { begin.add(used * size_of::<usize>()) });
        }
    }

    /// Replaces the backing storage with one of `new_capacity` entries, keeping the contents.
    pub fn resize(&mut self, new_capacity: usize) -> io::Result<()> {
        let contents: Vec<ObjectRef> = self.iter().collect();
        debug_assert!(contents.len() <= new_capacity);
        let mut fresh = Self::create(self.name, new_capacity)?;
        for obj in contents {
            fresh.push_back(obj);
        }
        *self = fresh;
        Ok(())
    }
}

impl std::fmt::Debug for ObjectStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}/{}]", self.name, self.size(), self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    #[test]
    fn push_pop_and_resize() {
        let mut stack = ObjectStack::create("test stack", 4).unwrap();
        for i in 1..=4 {
            stack.push_back(obj(i * 8));
        }
        assert!(stack.is_full());
        stack.resize(8).unwrap();
        assert_eq!(stack.capacity(), 8);
        assert_eq!(stack.size(), 4);
        stack.push_back(obj(40));
        assert_eq!(stack.pop_back(), Some(obj(40)));
        assert_eq!(stack.pop_front(), Some(obj(8)));
        assert_eq!(stack.pop_back_count(2), vec![obj(24), obj(32)]);
        assert_eq!(stack.pop_back(), Some(obj(16)));
        assert_eq!(stack.pop_back(), None);
    }

    #[test]
    fn atomic_push_from_threads() {
        let stack = ObjectStack::create("alloc stack", 1000).unwrap();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let stack = &stack;
                scope.spawn(move || {
                    for i in 0..300 {
                        stack.atomic_push_back(obj((t * 1000 + i + 1) * 8));
                    }
                });
            }
        });
        assert!(stack.is_full());
        assert_eq!(stack.size(), 1000);
        assert!(!stack.atomic_push_back(obj(8)));
    }

    #[test]
    fn contains_and_reset() {
        let mut stack = ObjectStack::create("live stack", 16).unwrap();
        for addr in [64, 8, 32, 16].iter() {
            stack.push_back(obj(*addr));
        }
        assert!(stack.contains(obj(32)));
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![obj(64), obj(8), obj(32), obj(16)]);
        assert!(stack.contains(obj(64)));
        assert!(!stack.contains(obj(24)));
        stack.reset();
        assert!(stack.is_empty());
        assert!(!stack.contains(obj(64)));
    }
}
