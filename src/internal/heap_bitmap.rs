use std::sync::Arc;

use crate::{gcref::ObjectRef, internal::space_bitmap::ContinuousSpaceBitmap};

/// Live and mark bitmaps of one continuous space.
///
/// Binding aliases the mark bitmap to the live bitmap for the duration of one collection; the
/// real mark bitmap is parked in `temp` until it is unbound again.
pub struct SpaceBitmaps {
    live: Arc<ContinuousSpaceBitmap>,
    mark: Arc<ContinuousSpaceBitmap>,
    temp: Option<Arc<ContinuousSpaceBitmap>>,
}

impl SpaceBitmaps {
    #[inline]
    pub fn live(&self) -> &Arc<ContinuousSpaceBitmap> {
        &self.live
    }
    #[inline]
    pub fn mark(&self) -> &Arc<ContinuousSpaceBitmap> {
        &self.mark
    }
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.temp.is_some()
    }
    /// Whether live and mark are one and the same bitmap (never-collect spaces, bound spaces).
    #[inline]
    pub fn is_shared(&self) -> bool {
        Arc::ptr_eq(&self.live, &self.mark)
    }
}

/// Bitmaps of every continuous space, indexed like the heap's space vector. Guarded by the
/// heap bitmap lock.
#[derive(Default)]
pub struct HeapBitmap {
    spaces: Vec<SpaceBitmaps>,
}

impl HeapBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the bitmaps of the next space. Passing the same bitmap twice gives a space
    /// whose live bitmap doubles as its mark bitmap.
    pub fn add_space(&mut self, live: Arc<ContinuousSpaceBitmap>, mark: Arc<ContinuousSpaceBitmap>) {
        debug_assert_eq!(live.heap_begin(), mark.heap_begin());
        self.spaces.push(SpaceBitmaps {
            live,
            mark,
            temp: None,
        });
    }

    #[inline]
    pub fn space(&self, index: usize) -> &SpaceBitmaps {
        &self.spaces[index]
    }
    #[inline]
    pub fn live_bitmap(&self, index: usize) -> &Arc<ContinuousSpaceBitmap> {
        &self.spaces[index].live
    }
    #[inline]
    pub fn mark_bitmap(&self, index: usize) -> &Arc<ContinuousSpaceBitmap> {
        &self.spaces[index].mark
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpaceBitmaps> {
        self.spaces.iter()
    }

    pub fn find_mark_bitmap(&self, obj: ObjectRef) -> Option<&Arc<ContinuousSpaceBitmap>> {
        self.spaces
            .iter()
            .map(|s| &s.mark)
            .find(|b| b.has_address(obj.address()))
    }

    pub fn find_live_bitmap(&self, obj: ObjectRef) -> Option<&Arc<ContinuousSpaceBitmap>> {
        self.spaces
            .iter()
            .map(|s| &s.live)
            .find(|b| b.has_address(obj.address()))
    }

    /// Makes the live bitmap of space `index` act as its mark bitmap. Everything live stays
    /// marked and newly marked objects land in the live bitmap directly.
    pub fn bind_live_to_mark(&mut self, index: usize) {
        let space = &mut self.spaces[index];
        if space.temp.is_some() || space.is_shared() {
            return;
        }
        let mark = std::mem::replace(&mut space.mark, space.live.clone());
        space.temp = Some(mark);
    }

    /// Restores the real mark bitmap. Returns `true` if the space was bound.
    pub fn unbind(&mut self, index: usize) -> bool {
        let space = &mut self.spaces[index];
        match space.temp.take() {
            Some(mark) => {
                space.mark = mark;
                true
            }
            None => false,
        }
    }

    /// Exchanges the roles of the live and mark bitmaps of space `index`.
    pub fn swap(&mut self, index: usize) {
        let space = &mut self.spaces[index];
        if space.is_shared() {
            return;
        }
        std::mem::swap(&mut space.live, &mut space.mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MB;

    const BEGIN: usize = 0x3000_0000;

    fn bitmaps() -> HeapBitmap {
        let mut heap_bitmap = HeapBitmap::new();
        let live = Arc::new(ContinuousSpaceBitmap::create("live", BEGIN, MB).unwrap());
        let mark = Arc::new(ContinuousSpaceBitmap::create("mark", BEGIN, MB).unwrap());
        heap_bitmap.add_space(live, mark);
        let image = Arc::new(ContinuousSpaceBitmap::create("image", BEGIN + MB, MB).unwrap());
        heap_bitmap.add_space(image.clone(), image);
        heap_bitmap
    }

    #[test]
    fn bind_and_unbind() {
        let mut heap_bitmap = bitmaps();
        let mark = heap_bitmap.mark_bitmap(0).clone();
        heap_bitmap.bind_live_to_mark(0);
        assert!(heap_bitmap.space(0).is_bound());
        assert!(Arc::ptr_eq(heap_bitmap.live_bitmap(0), heap_bitmap.mark_bitmap(0)));
        heap_bitmap.swap(0);
        assert!(heap_bitmap.unbind(0));
        assert!(Arc::ptr_eq(heap_bitmap.mark_bitmap(0), &mark));
        assert!(!heap_bitmap.unbind(0));
    }

    #[test]
    fn swap_exchanges_roles() {
        let mut heap_bitmap = bitmaps();
        let live = heap_bitmap.live_bitmap(0).clone();
        let mark = heap_bitmap.mark_bitmap(0).clone();
        heap_bitmap.swap(0);
        assert!(Arc::ptr_eq(heap_bitmap.live_bitmap(0), &mark));
        assert!(Arc::ptr_eq(heap_bitmap.mark_bitmap(0), &live));
        heap_bitmap.swap(1);
        assert!(heap_bitmap.space(1).is_shared());
    }

    #[test]
    fn lookup_by_address() {
        let heap_bitmap = bitmaps();
        let inside = ObjectRef::from_address(BEGIN + MB + 64).unwrap();
        let outside = ObjectRef::from_address(BEGIN + 4 * MB).unwrap();
        let found = heap_bitmap.find_mark_bitmap(inside).unwrap();
        assert_eq!(found.heap_begin(), BEGIN + MB);
        assert!(heap_bitmap.find_live_bitmap(outside).is_none());
    }
}
