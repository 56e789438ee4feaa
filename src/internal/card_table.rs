use std::{
    io,
    mem::size_of,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    gcref::ObjectRef,
    internal::space_bitmap::ContinuousSpaceBitmap,
    mmap::MemMap,
    utils::{align_down, align_up, is_aligned},
};

#[inline(always)]
fn byte_cas(old_value: u8, new_value: u8, address: *mut u8) -> bool {
    unsafe {
        (*address.cast::<AtomicU8>())
            .compare_exchange_weak(old_value, new_value, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[inline(always)]
fn load_card(card: *const u8) -> u8 {
    unsafe { (*card.cast::<AtomicU8>()).load(Ordering::Relaxed) }
}

#[inline(always)]
fn load_word(word: *const usize) -> usize {
    unsafe { (*word.cast::<AtomicUsize>()).load(Ordering::Relaxed) }
}

/// Maintain a card table from the the write barrier. All writes of
/// non-null references into heap objects should go through [`CardTable::mark_card`].
pub struct CardTable {
    /// Mmapped pages for the card table
    mem_map: MemMap,
    /// Value used to compute card table addresses from object addresses, see [`CardTable::biased_begin`]
    biased_begin: usize,
    /// Card table doesn't begin at the beginning of the mem_map, instead it is displaced by offset
    /// to allow the byte value of `biased_begin` to equal [CARD_DIRTY](CardTable::CARD_DIRTY).
    offset: usize,
    heap_begin: usize,
    heap_capacity: usize,
}

unsafe impl Send for CardTable {}
unsafe impl Sync for CardTable {}

impl CardTable {
    pub const CARD_SHIFT: usize = 7;
    pub const CARD_SIZE: usize = 1 << Self::CARD_SHIFT;
    pub const CARD_CLEAN: u8 = 0x0;
    pub const CARD_DIRTY: u8 = 0xff;
    pub const CARD_AGED: u8 = Self::CARD_DIRTY - 1;

    pub fn create(heap_begin: usize, heap_capacity: usize) -> io::Result<Self> {
        debug_assert!(is_aligned(heap_begin, Self::CARD_SIZE));
        let capacity = align_up(heap_capacity, Self::CARD_SIZE) / Self::CARD_SIZE;
        // Extra 256 bytes so the biased begin can be displaced to a DIRTY low byte.
        let mem_map = MemMap::map_anonymous("card table", capacity + 256)?;
        let cardtable_begin = mem_map.begin() as usize;
        let mut biased_begin = cardtable_begin.wrapping_sub(heap_begin >> Self::CARD_SHIFT);
        let mut offset = 0;
        let biased_byte = (biased_begin & 0xff) as u8;
        if biased_byte != Self::CARD_DIRTY {
            let delta = Self::CARD_DIRTY as isize - biased_byte as isize;
            offset = (delta + if delta < 0 { 0x100 } else { 0 }) as usize;
            biased_begin = biased_begin.wrapping_add(offset);
        }
        debug_assert_eq!((biased_begin & 0xff) as u8, Self::CARD_DIRTY);
        log::debug!(
            "card table {:?} covers {:#x}-{:#x}",
            mem_map,
            heap_begin,
            heap_begin + heap_capacity
        );
        Ok(Self {
            mem_map,
            biased_begin,
            offset,
            heap_begin,
            heap_capacity,
        })
    }

    /// Returns a value that when added to a heap address >> [CARD_SHIFT](CardTable::CARD_SHIFT)
    /// will address the appropriate card table byte. Its low byte is [CARD_DIRTY](CardTable::CARD_DIRTY)
    /// so compiled barriers can store it directly.
    #[inline]
    pub fn biased_begin(&self) -> *mut u8 {
        self.biased_begin as _
    }

    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline]
    pub fn heap_capacity(&self) -> usize {
        self.heap_capacity
    }

    #[inline]
    fn cards_begin(&self) -> *mut u8 {
        unsafe { self.mem_map.begin().add(self.offset) }
    }

    #[inline]
    pub fn card_from_addr(&self, addr: usize) -> *mut u8 {
        let card_addr = self.biased_begin.wrapping_add(addr >> Self::CARD_SHIFT);
        debug_assert!(
            self.is_valid_card(card_addr as _),
            "card address {:#x} for heap address {:#x} is outside the card table",
            card_addr,
            addr
        );
        card_addr as _
    }

    #[inline]
    pub fn addr_from_card(&self, card_addr: *const u8) -> usize {
        debug_assert!(self.is_valid_card(card_addr));
        let offset = card_addr as usize - self.biased_begin;
        offset << Self::CARD_SHIFT
    }

    #[inline]
    fn cards_end(&self) -> *mut u8 {
        let count = align_up(self.heap_capacity, Self::CARD_SIZE) / Self::CARD_SIZE;
        unsafe { self.cards_begin().add(count) }
    }

    /// Range ends map to the card one past the last one, so it counts as valid here.
    #[inline]
    fn is_valid_card(&self, card_addr: *const u8) -> bool {
        card_addr >= self.cards_begin() as *const u8 && card_addr <= self.cards_end() as *const u8
    }

    #[inline]
    pub fn addr_is_in_card_table(&self, addr: usize) -> bool {
        let card_addr = self.biased_begin.wrapping_add(addr >> Self::CARD_SHIFT) as *const u8;
        card_addr >= self.cards_begin() as *const u8 && card_addr < self.cards_end() as *const u8
    }

    /// Marks the card covering `addr` dirty. Lock-free, callable from any thread.
    #[inline]
    pub fn mark_card(&self, addr: usize) {
        let card = self.card_from_addr(addr);
        unsafe {
            (*card.cast::<AtomicU8>()).store(Self::CARD_DIRTY, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn get_card(&self, addr: usize) -> u8 {
        load_card(self.card_from_addr(addr))
    }

    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.get_card(addr) == Self::CARD_DIRTY
    }

    /// Ages a card value: dirty cards become aged, everything else becomes clean.
    #[inline]
    pub fn age_card(card: u8) -> u8 {
        if card == Self::CARD_DIRTY {
            Self::CARD_AGED
        } else {
            Self::CARD_CLEAN
        }
    }

    /// Resets every card to clean.
    pub fn clear_card_table(&self) {
        self.mem_map
            .zero_and_release_pages(self.mem_map.begin(), self.mem_map.end());
    }

    /// Resets the cards covering `[begin, end)` to clean.
    pub fn clear_space_cards(&self, begin: usize, end: usize) {
        let card_start = self.card_from_addr(begin);
        let card_end = self.card_from_addr(align_up(end, Self::CARD_SIZE));
        self.mem_map.zero_and_release_pages(card_start, card_end);
    }

    /// Number of cards in `[begin, end)` whose value is at least `minimum_age`.
    pub fn count_cards(&self, begin: usize, end: usize, minimum_age: u8) -> usize {
        let card_begin = self.card_from_addr(begin);
        let card_end = self.card_from_addr(align_up(end, Self::CARD_SIZE));
        let mut count = 0;
        let mut card = card_begin;
        while card < card_end {
            if load_card(card) >= minimum_age {
                count += 1;
            }
            card = unsafe { card.add(1) };
        }
        count
    }

    /// For every card in `[scan_begin, scan_end)` with a value `>= minimum_age`, visits every
    /// object marked in `bitmap` on that card. Returns the number of cards scanned.
    pub fn scan(
        &self,
        bitmap: &ContinuousSpaceBitmap,
        scan_begin: usize,
        scan_end: usize,
        mut visitor: impl FnMut(ObjectRef),
        minimum_age: u8,
    ) -> usize {
        debug_assert!(bitmap.has_address(scan_begin));
        debug_assert!(scan_end <= bitmap.heap_limit());
        let card_begin = self.card_from_addr(scan_begin);
        let card_end = self.card_from_addr(align_up(scan_end, Self::CARD_SIZE));
        let mut card_cur = card_begin;
        let mut cards_scanned = 0;

        let scan_card = |card: *mut u8, visitor: &mut dyn FnMut(ObjectRef)| {
            let start = self.addr_from_card(card);
            bitmap.visit_marked_range(start, start + Self::CARD_SIZE, |obj| visitor(obj));
        };

        // Unaligned head, byte by byte.
        while !is_aligned(card_cur as usize, size_of::<usize>()) && card_cur < card_end {
            if load_card(card_cur) >= minimum_age {
                scan_card(card_cur, &mut visitor);
                cards_scanned += 1;
            }
            card_cur = unsafe { card_cur.add(1) };
        }

        let mut word_cur = card_cur.cast::<usize>();
        let word_end = align_down(card_end as usize, size_of::<usize>()) as *mut usize;
        while word_cur < word_end {
            let word = load_word(word_cur);
            if word != 0 {
                let card_base = word_cur.cast::<u8>();
                for (i, card) in word.to_ne_bytes().iter().enumerate() {
                    if *card >= minimum_age {
                        scan_card(unsafe { card_base.add(i) }, &mut visitor);
                        cards_scanned += 1;
                    }
                }
            }
            word_cur = unsafe { word_cur.add(1) };
        }

        // Unaligned tail.
        card_cur = (word_end as *mut u8).max(card_cur);
        while card_cur < card_end {
            if load_card(card_cur) >= minimum_age {
                scan_card(card_cur, &mut visitor);
                cards_scanned += 1;
            }
            card_cur = unsafe { card_cur.add(1) };
        }
        cards_scanned
    }

    /// Atomically replaces every card `c` in `[scan_begin, scan_end)` with `visitor(c)` and
    /// reports each card that changed to `modified(card, old, new)`.
    pub fn modify_cards_atomic(
        &self,
        scan_begin: usize,
        scan_end: usize,
        visitor: impl Fn(u8) -> u8,
        mut modified: impl FnMut(*mut u8, u8, u8),
    ) {
        let mut card_cur = self.card_from_addr(scan_begin);
        let mut card_end = self.card_from_addr(align_up(scan_end, Self::CARD_SIZE));

        let mut modify_card = |card: *mut u8| {
            let mut expected;
            let mut new_value;
            while {
                expected = load_card(card);
                new_value = visitor(expected);
                expected != new_value && !byte_cas(expected, new_value, card)
            } {}
            if expected != new_value {
                modified(card, expected, new_value);
            }
        };

        while !is_aligned(card_cur as usize, size_of::<usize>()) && card_cur < card_end {
            modify_card(card_cur);
            card_cur = unsafe { card_cur.add(1) };
        }
        while !is_aligned(card_end as usize, size_of::<usize>()) && card_end > card_cur {
            card_end = unsafe { card_end.sub(1) };
            modify_card(card_end);
        }

        let mut word_cur = card_cur.cast::<usize>();
        let word_end = card_end.cast::<usize>();
        while word_cur < word_end {
            loop {
                let expected_word = load_word(word_cur);
                if expected_word == 0 {
                    break; // clean cards
                }
                let expected_bytes = expected_word.to_ne_bytes();
                let mut new_bytes = [0u8; size_of::<usize>()];
                for i in 0..size_of::<usize>() {
                    new_bytes[i] = visitor(expected_bytes[i]);
                }
                let new_word = usize::from_ne_bytes(new_bytes);
                let atomic_word = unsafe { &*word_cur.cast::<AtomicUsize>() };
                if atomic_word
                    .compare_exchange_weak(
                        expected_word,
                        new_word,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    for i in 0..size_of::<usize>() {
                        if new_bytes[i] != expected_bytes[i] {
                            modified(
                                unsafe { word_cur.cast::<u8>().add(i) },
                                expected_bytes[i],
                                new_bytes[i],
                            );
                        }
                    }
                    break;
                }
            }
            word_cur = unsafe { word_cur.add(1) };
        }
    }
}

impl std::fmt::Debug for CardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CardTable[{:p} biased={:#x} heap={:#x}-{:#x}]",
            self.cards_begin(),
            self.biased_begin,
            self.heap_begin,
            self.heap_begin + self.heap_capacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MB;

    const HEAP_BEGIN: usize = 0x2000_0000;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    #[test]
    fn biased_begin_low_byte_is_dirty() {
        let table = CardTable::create(HEAP_BEGIN, MB).unwrap();
        assert_eq!(table.biased_begin() as usize & 0xff, CardTable::CARD_DIRTY as usize);
        assert!(table.addr_is_in_card_table(HEAP_BEGIN));
        assert!(table.addr_is_in_card_table(HEAP_BEGIN + MB - 1));
        // The spare cards past the heap end are not part of the table.
        assert!(!table.addr_is_in_card_table(HEAP_BEGIN + MB));
        assert!(!table.addr_is_in_card_table(HEAP_BEGIN + MB + 64 * CardTable::CARD_SIZE));
        assert!(!table.addr_is_in_card_table(HEAP_BEGIN - 1));
        let card = table.card_from_addr(HEAP_BEGIN + 3 * CardTable::CARD_SIZE + 5);
        assert_eq!(table.addr_from_card(card), HEAP_BEGIN + 3 * CardTable::CARD_SIZE);
    }

    #[test]
    fn age_card_transitions() {
        assert_eq!(CardTable::age_card(CardTable::CARD_DIRTY), CardTable::CARD_AGED);
        assert_eq!(CardTable::age_card(CardTable::CARD_AGED), CardTable::CARD_CLEAN);
        assert_eq!(CardTable::age_card(CardTable::CARD_CLEAN), CardTable::CARD_CLEAN);
    }

    #[test]
    fn mark_card_then_scan_visits_card_objects_once() {
        let table = CardTable::create(HEAP_BEGIN, MB).unwrap();
        let bitmap = ContinuousSpaceBitmap::create("live", HEAP_BEGIN, MB).unwrap();
        let card_start = HEAP_BEGIN + 40 * CardTable::CARD_SIZE;
        let on_card = [card_start, card_start + 16, card_start + CardTable::CARD_SIZE - 8];
        for addr in on_card.iter() {
            bitmap.set(obj(*addr));
        }
        // Neighbours on clean cards.
        bitmap.set(obj(card_start - 8));
        bitmap.set(obj(card_start + CardTable::CARD_SIZE));

        table.mark_card(card_start + 16);
        assert!(table.is_dirty(card_start));
        assert!(!table.is_dirty(card_start + CardTable::CARD_SIZE));

        let mut seen = vec![];
        let scanned = table.scan(
            &bitmap,
            HEAP_BEGIN,
            HEAP_BEGIN + MB,
            |o| seen.push(o.address()),
            CardTable::CARD_DIRTY,
        );
        assert_eq!(scanned, 1);
        assert_eq!(seen, on_card.to_vec());
    }

    #[test]
    fn scan_respects_minimum_age() {
        let table = CardTable::create(HEAP_BEGIN, MB).unwrap();
        let bitmap = ContinuousSpaceBitmap::create("live", HEAP_BEGIN, MB).unwrap();
        for i in 0..64 {
            bitmap.set(obj(HEAP_BEGIN + i * CardTable::CARD_SIZE));
            table.mark_card(HEAP_BEGIN + i * CardTable::CARD_SIZE);
        }
        table.modify_cards_atomic(
            HEAP_BEGIN,
            HEAP_BEGIN + 32 * CardTable::CARD_SIZE,
            CardTable::age_card,
            |_, _, _| {},
        );
        let mut count = 0;
        let dirty = table.scan(&bitmap, HEAP_BEGIN, HEAP_BEGIN + MB, |_| count += 1, CardTable::CARD_DIRTY);
        assert_eq!(dirty, 32);
        assert_eq!(count, 32);
        let aged = table.scan(&bitmap, HEAP_BEGIN, HEAP_BEGIN + MB, |_| {}, CardTable::CARD_AGED);
        assert_eq!(aged, 64);
        assert_eq!(table.count_cards(HEAP_BEGIN, HEAP_BEGIN + MB, CardTable::CARD_AGED), 64);
    }

    #[test]
    fn modify_cards_atomic_reports_changes() {
        let table = CardTable::create(HEAP_BEGIN, MB).unwrap();
        // Unaligned head and tail around an aligned interior.
        let dirty = [1, 2, 9, 17, 30, 31, 33];
        for card in dirty.iter() {
            table.mark_card(HEAP_BEGIN + card * CardTable::CARD_SIZE);
        }
        let mut changed = vec![];
        table.modify_cards_atomic(
            HEAP_BEGIN + CardTable::CARD_SIZE,
            HEAP_BEGIN + 32 * CardTable::CARD_SIZE - 1,
            CardTable::age_card,
            |card, old, new| {
                assert_eq!(old, CardTable::CARD_DIRTY);
                assert_eq!(new, CardTable::CARD_AGED);
                changed.push((table.addr_from_card(card) - HEAP_BEGIN) / CardTable::CARD_SIZE);
            },
        );
        changed.sort_unstable();
        assert_eq!(changed, vec![1, 2, 9, 17, 30, 31]);
        assert_eq!(table.get_card(HEAP_BEGIN + 33 * CardTable::CARD_SIZE), CardTable::CARD_DIRTY);
        assert_eq!(table.get_card(HEAP_BEGIN + 9 * CardTable::CARD_SIZE), CardTable::CARD_AGED);

        table.clear_space_cards(HEAP_BEGIN, HEAP_BEGIN + 16 * CardTable::CARD_SIZE);
        assert_eq!(table.get_card(HEAP_BEGIN + 9 * CardTable::CARD_SIZE), CardTable::CARD_CLEAN);
        assert_eq!(table.get_card(HEAP_BEGIN + 17 * CardTable::CARD_SIZE), CardTable::CARD_AGED);
        table.clear_card_table();
        assert_eq!(table.count_cards(HEAP_BEGIN, HEAP_BEGIN + MB, CardTable::CARD_AGED), 0);
    }
}
