use atomic::Atomic;
use atomic::Ordering;
use core::fmt;
use std::io;
use std::mem::size_of;

use crate::gcref::ObjectRef;
use crate::mmap::MemMap;
use crate::utils::{round_up, BITS_PER_WORD};

/// Minimum alignment of objects in continuous spaces.
pub const OBJECT_ALIGNMENT: usize = 8;

pub type ContinuousSpaceBitmap = SpaceBitmap<OBJECT_ALIGNMENT>;

/// Word-packed bitmap where bit `i` stands for the object at `heap_begin + i * ALIGN`.
///
/// Words are atomics so that mutator-side readers and parallel markers can share one bitmap;
/// only [`SpaceBitmap::atomic_test_and_set`] is safe against concurrent writers to the same word.
pub struct SpaceBitmap<const ALIGN: usize> {
    mem_map: MemMap,
    bitmap_begin: *mut Atomic<usize>,
    /// Size of the bitmap in bytes, shrinks/grows with [`SpaceBitmap::set_heap_limit`].
    bitmap_size: Atomic<usize>,
    heap_begin: usize,
    heap_limit: Atomic<usize>,
    name: &'static str,
}

unsafe impl<const ALIGN: usize> Send for SpaceBitmap<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for SpaceBitmap<ALIGN> {}

impl<const ALIGN: usize> SpaceBitmap<ALIGN> {
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }
    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit.load(Ordering::Relaxed)
    }
    #[inline]
    pub fn heap_size(&self) -> usize {
        Self::index_to_offset(self.words())
    }
    /// Bitmap size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bitmap_size.load(Ordering::Relaxed)
    }
    #[inline]
    fn words(&self) -> usize {
        self.size() / size_of::<usize>()
    }
    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(index < self.mem_map.size() / size_of::<usize>());
        unsafe { &*self.bitmap_begin.add(index) }
    }
    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        let offset = addr.wrapping_sub(self.heap_begin);
        Self::offset_to_index(offset) < self.words()
    }
    #[inline]
    pub const fn index_to_offset(index: usize) -> usize {
        index * ALIGN * BITS_PER_WORD
    }
    #[inline]
    pub const fn offset_to_index(offset: usize) -> usize {
        offset / ALIGN / BITS_PER_WORD
    }
    #[inline]
    pub const fn offset_bit_index(offset: usize) -> usize {
        (offset / ALIGN) % BITS_PER_WORD
    }
    #[inline]
    pub const fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    /// Sets the bit for `obj` unless it was already set. Returns the previous value, so the
    /// caller that gets `false` back is the one that marked the object.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: ObjectRef) -> bool {
        let addr = obj.address();
        debug_assert!(self.has_address(addr), "Invalid object address: {:p}", obj);
        let offset = addr - self.heap_begin;
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(Self::offset_to_index(offset));
        let mut old_word;
        while {
            old_word = entry.load(Ordering::Relaxed);
            if (old_word & mask) != 0 {
                return true;
            }
            entry
                .compare_exchange_weak(
                    old_word,
                    old_word | mask,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_err()
        } {}
        false
    }

    #[inline]
    pub fn test(&self, obj: ObjectRef) -> bool {
        let addr = obj.address();
        debug_assert!(self.has_address(addr), "Invalid object address: {:p}", obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        (self.word(Self::offset_to_index(offset)).load(Ordering::Relaxed)
            & Self::offset_to_mask(offset))
            != 0
    }

    /// Non-atomic read-modify-write of one bit, returns the previous value.
    #[inline]
    pub fn modify<const SET_BIT: bool>(&self, obj: ObjectRef) -> bool {
        let addr = obj.address();
        debug_assert!(self.has_address(addr), "Invalid object address: {:p}", obj);
        let offset = addr - self.heap_begin;
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(Self::offset_to_index(offset));
        let old_word = entry.load(Ordering::Relaxed);
        if SET_BIT {
            // Check the bit first so fully marked bitmaps are never written to.
            if (old_word & mask) == 0 {
                entry.store(old_word | mask, Ordering::Relaxed);
            }
        } else {
            entry.store(old_word & !mask, Ordering::Relaxed);
        }
        debug_assert_eq!(self.test(obj), SET_BIT);
        (old_word & mask) != 0
    }

    #[inline(always)]
    pub fn set(&self, obj: ObjectRef) -> bool {
        self.modify::<true>(obj)
    }

    #[inline(always)]
    pub fn clear(&self, obj: ObjectRef) -> bool {
        self.modify::<false>(obj)
    }

    pub const fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = ALIGN * BITS_PER_WORD;
        round_up(capacity, bytes_covered_per_word) / bytes_covered_per_word * size_of::<usize>()
    }

    pub const fn compute_heap_size(bitmap_bytes: usize) -> usize {
        bitmap_bytes * 8 * ALIGN
    }

    /// Clears the whole bitmap, handing its pages back to the OS.
    pub fn clear_all(&self) {
        if self.size() == 0 {
            return;
        }
        let begin = self.bitmap_begin.cast::<u8>();
        self.mem_map
            .zero_and_release_pages(begin, unsafe { begin.add(self.size()) });
    }

    /// Clears every bit for addresses in `[begin, end)`.
    pub fn clear_range(&self, begin: usize, end: usize) {
        let mut begin_offset = begin - self.heap_begin;
        let mut end_offset = end - self.heap_begin;
        while begin_offset < end_offset && Self::offset_bit_index(begin_offset) != 0 {
            self.clear(unsafe { ObjectRef::from_address_unchecked(self.heap_begin + begin_offset) });
            begin_offset += ALIGN;
        }
        while begin_offset < end_offset && Self::offset_bit_index(end_offset) != 0 {
            end_offset -= ALIGN;
            self.clear(unsafe { ObjectRef::from_address_unchecked(self.heap_begin + end_offset) });
        }
        if begin_offset >= end_offset {
            return;
        }
        let start_index = Self::offset_to_index(begin_offset);
        let end_index = Self::offset_to_index(end_offset);
        unsafe {
            self.mem_map.zero_and_release_pages(
                self.bitmap_begin.add(start_index).cast(),
                self.bitmap_begin.add(end_index).cast(),
            );
        }
    }

    /// Copies every word of `other` into this bitmap. Both must cover the same range.
    pub fn copy_from(&self, other: &Self) {
        debug_assert_eq!(self.heap_begin, other.heap_begin);
        let words = self.words().min(other.words());
        for i in 0..words {
            self.word(i)
                .store(other.word(i).load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Moves the end of the covered range. Bits past the new end are kept but no longer
    /// visited.
    pub fn set_heap_limit(&self, new_end: usize) {
        debug_assert!(new_end >= self.heap_begin);
        let new_size = Self::offset_to_index(round_up(
            new_end - self.heap_begin,
            ALIGN * BITS_PER_WORD,
        )) * size_of::<usize>();
        let new_size = new_size.min(self.mem_map.size());
        self.bitmap_size.store(new_size, Ordering::Relaxed);
        self.heap_limit.store(new_end, Ordering::Relaxed);
    }

    #[inline(always)]
    fn visit_word(base: usize, mut word: usize, visitor: &mut impl FnMut(ObjectRef)) {
        while word != 0 {
            let shift = word.trailing_zeros() as usize;
            visitor(unsafe { ObjectRef::from_address_unchecked(base + shift * ALIGN) });
            word ^= 1 << shift;
        }
    }

    /// Visit marked bits in `[visit_begin, visit_end)` in ascending address order.
    ///
    /// NOTE: Bits may be changed while visiting: each word is loaded once and then its set
    /// bits are visited, so bits set later in an already loaded word are not seen.
    pub fn visit_marked_range(
        &self,
        visit_begin: usize,
        visit_end: usize,
        mut visitor: impl FnMut(ObjectRef),
    ) {
        debug_assert!(visit_begin <= visit_end);
        if visit_begin >= visit_end {
            return;
        }
        let offset_start = visit_begin - self.heap_begin;
        let offset_end = visit_end - self.heap_begin;

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let bit_start = Self::offset_bit_index(offset_start);
        let bit_end = Self::offset_bit_index(offset_end);
        // Index(begin)  ...    Index(end)
        // [xxxxx???][........][????yyyy]
        //      ^                   ^
        //      |                   #---- Bit of visit_end
        //      #---- Bit of visit_begin
        //
        let mut left_edge = self.word(index_start).load(Ordering::Relaxed);
        left_edge &= !((1usize << bit_start) - 1);
        let mut right_edge;
        if index_start < index_end {
            Self::visit_word(
                Self::index_to_offset(index_start) + self.heap_begin,
                left_edge,
                &mut visitor,
            );
            for i in index_start + 1..index_end {
                let w = self.word(i).load(Ordering::Relaxed);
                if w != 0 {
                    Self::visit_word(Self::index_to_offset(i) + self.heap_begin, w, &mut visitor);
                }
            }
            // visit_end may start a new word, in which case there is no right edge.
            if bit_end == 0 {
                right_edge = 0;
            } else {
                right_edge = self.word(index_end).load(Ordering::Relaxed);
            }
        } else {
            right_edge = left_edge;
        }

        right_edge &= (1usize << bit_end) - 1;
        Self::visit_word(
            Self::index_to_offset(index_end) + self.heap_begin,
            right_edge,
            &mut visitor,
        );
    }

    /// Visits every set bit of the bitmap in ascending order.
    pub fn walk(&self, mut visitor: impl FnMut(ObjectRef)) {
        for i in 0..self.words() {
            let w = self.word(i).load(Ordering::Relaxed);
            if w != 0 {
                Self::visit_word(Self::index_to_offset(i) + self.heap_begin, w, &mut visitor);
            }
        }
    }

    /// Hands every object in `[sweep_begin, sweep_end)` that is set in `live` but not in `mark`
    /// to `callback`, in batches of at most one word's worth of bits per word size.
    pub fn sweep_walk(
        live: &Self,
        mark: &Self,
        sweep_begin: usize,
        sweep_end: usize,
        mut callback: impl FnMut(&[ObjectRef]),
    ) {
        debug_assert_eq!(live.heap_begin, mark.heap_begin);
        debug_assert!(sweep_end <= live.heap_begin + live.heap_size());
        if sweep_end <= sweep_begin {
            return;
        }
        const BUFFER_SIZE: usize = size_of::<usize>() * BITS_PER_WORD;
        let mut buffer = Vec::with_capacity(BUFFER_SIZE);
        let start = Self::offset_to_index(sweep_begin - live.heap_begin);
        let end = Self::offset_to_index(sweep_end - live.heap_begin - 1);
        for i in start..=end {
            let garbage =
                live.word(i).load(Ordering::Relaxed) & !mark.word(i).load(Ordering::Relaxed);
            if garbage != 0 {
                let base = Self::index_to_offset(i) + live.heap_begin;
                Self::visit_word(base, garbage, &mut |obj| buffer.push(obj));
            }
            // Flush before the next word could overflow the buffer.
            if buffer.len() > BUFFER_SIZE - BITS_PER_WORD {
                callback(&buffer);
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            callback(&buffer);
        }
    }

    pub fn create(
        name: &'static str,
        heap_begin: usize,
        heap_capacity: usize,
    ) -> io::Result<Self> {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mem_map = MemMap::map_anonymous(name, bitmap_size)?;
        Ok(Self::create_from_memmap(name, mem_map, heap_begin, heap_capacity))
    }

    pub fn create_from_memmap(
        name: &'static str,
        mem_map: MemMap,
        heap_begin: usize,
        heap_capacity: usize,
    ) -> Self {
        let bitmap_begin = mem_map.begin();
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        debug_assert!(bitmap_size <= mem_map.size());
        Self {
            name,
            mem_map,
            bitmap_begin: bitmap_begin.cast(),
            bitmap_size: Atomic::new(bitmap_size),
            heap_begin,
            heap_limit: Atomic::new(heap_begin + heap_capacity),
        }
    }
}

impl<const ALIGN: usize> fmt::Debug for SpaceBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={:#x},end={:#x}]",
            self.name,
            self.heap_begin,
            self.heap_limit()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MB;

    const HEAP_BEGIN: usize = 0x1000_0000;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    fn bitmap(capacity: usize) -> ContinuousSpaceBitmap {
        ContinuousSpaceBitmap::create("test bitmap", HEAP_BEGIN, capacity).unwrap()
    }

    #[test]
    fn visit_marked_range_in_order() {
        let bitmap = bitmap(MB);
        bitmap.set(obj(HEAP_BEGIN));
        bitmap.set(obj(HEAP_BEGIN + 128));
        let mut seen = vec![];
        bitmap.visit_marked_range(HEAP_BEGIN, HEAP_BEGIN + 256, |o| seen.push(o.address()));
        assert_eq!(seen, vec![HEAP_BEGIN, HEAP_BEGIN + 128]);
        assert!(!bitmap.test(obj(HEAP_BEGIN + 64)));
    }

    #[test]
    fn visit_marked_range_edges() {
        let bitmap = bitmap(MB);
        let bytes_per_word = OBJECT_ALIGNMENT * BITS_PER_WORD;
        let addrs = [
            HEAP_BEGIN + 8,
            HEAP_BEGIN + bytes_per_word - 8,
            HEAP_BEGIN + bytes_per_word,
            HEAP_BEGIN + 3 * bytes_per_word + 16,
            HEAP_BEGIN + 4 * bytes_per_word + 8,
        ];
        for addr in addrs.iter() {
            bitmap.set(obj(*addr));
        }
        let mut seen = vec![];
        bitmap.visit_marked_range(HEAP_BEGIN + 8, HEAP_BEGIN + 4 * bytes_per_word + 8, |o| {
            seen.push(o.address())
        });
        assert_eq!(seen, addrs[..4].to_vec());

        seen.clear();
        bitmap.visit_marked_range(HEAP_BEGIN + 16, HEAP_BEGIN + bytes_per_word, |o| {
            seen.push(o.address())
        });
        assert_eq!(seen, vec![HEAP_BEGIN + bytes_per_word - 8]);
    }

    #[test]
    fn test_is_idempotent() {
        let bitmap = bitmap(MB);
        let o = obj(HEAP_BEGIN + 4096);
        assert!(!bitmap.test(o));
        assert!(!bitmap.test(o));
        assert!(!bitmap.set(o));
        assert!(bitmap.test(o));
        assert!(bitmap.test(o));
        assert!(bitmap.set(o));
        assert!(bitmap.clear(o));
        assert!(!bitmap.test(o));
    }

    #[test]
    fn atomic_test_and_set_marks_once() {
        let bitmap = bitmap(MB);
        let o = obj(HEAP_BEGIN + 512);
        let winners = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if !bitmap.atomic_test_and_set(o) {
                        winners.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(winners.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(bitmap.test(o));
    }

    #[test]
    fn walk_and_sweep_walk() {
        let live = bitmap(MB);
        let mark = ContinuousSpaceBitmap::create("test mark bitmap", HEAP_BEGIN, MB).unwrap();
        let mut expected_garbage = vec![];
        for i in 0..2000 {
            let o = obj(HEAP_BEGIN + i * 64);
            live.set(o);
            if i % 3 == 0 {
                mark.set(o);
            } else {
                expected_garbage.push(o);
            }
        }
        let mut walked = 0;
        live.walk(|_| walked += 1);
        assert_eq!(walked, 2000);

        let mut garbage = vec![];
        let mut batches = 0;
        ContinuousSpaceBitmap::sweep_walk(&live, &mark, HEAP_BEGIN, HEAP_BEGIN + MB, |batch| {
            assert!(batch.len() <= size_of::<usize>() * BITS_PER_WORD);
            batches += 1;
            garbage.extend_from_slice(batch);
        });
        assert_eq!(garbage, expected_garbage);
        assert!(batches > 1);
    }

    #[test]
    fn clear_range_and_copy() {
        let bitmap = bitmap(MB);
        for i in 0..(64 * KB_OBJECTS) {
            bitmap.set(obj(HEAP_BEGIN + i * OBJECT_ALIGNMENT));
        }
        bitmap.clear_range(HEAP_BEGIN + 24, HEAP_BEGIN + 64 * KB_OBJECTS * OBJECT_ALIGNMENT - 40);
        let mut left = vec![];
        bitmap.walk(|o| left.push(o.address() - HEAP_BEGIN));
        assert_eq!(left.len(), 3 + 5);
        assert_eq!(&left[..3], &[0, 8, 16]);

        let copy = ContinuousSpaceBitmap::create("copy", HEAP_BEGIN, MB).unwrap();
        copy.copy_from(&bitmap);
        let mut copied = vec![];
        copy.walk(|o| copied.push(o.address() - HEAP_BEGIN));
        assert_eq!(left, copied);

        copy.clear_all();
        let mut count = 0;
        copy.walk(|_| count += 1);
        assert_eq!(count, 0);
    }

    const KB_OBJECTS: usize = 1024;

    #[test]
    fn heap_limit_restricts_addresses() {
        let bitmap = bitmap(MB);
        assert!(bitmap.has_address(HEAP_BEGIN + MB - 8));
        bitmap.set_heap_limit(HEAP_BEGIN + MB / 2);
        assert!(!bitmap.has_address(HEAP_BEGIN + MB - 8));
        assert!(bitmap.has_address(HEAP_BEGIN + MB / 2 - 8));
        assert!(!bitmap.has_address(HEAP_BEGIN - 8));
        assert_eq!(bitmap.heap_size(), MB / 2);
    }
}
