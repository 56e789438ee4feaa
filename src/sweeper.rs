//! Reclamation of unmarked objects and the live/mark bitmap swap.
use crate::{
    gc_base::GcType,
    gcref::ObjectRef,
    internal::{
        heap_bitmap::HeapBitmap, object_stack::ObjectStack, space_bitmap::ContinuousSpaceBitmap,
    },
    marksweep::MarkSweep,
    space::GcRetentionPolicy,
};

/// Objects handed to the allocator per `free_list` call by [`MarkSweep::sweep_array`].
pub const SWEEP_ARRAY_CHUNK_FREE_SIZE: usize = 1024;

impl<'h> MarkSweep<'h> {
    /// Frees every object live in a collected space but not marked, then the unmarked large
    /// objects. Zygote spaces only lose the live bit and get their card dirtied, their pages
    /// stay untouched.
    pub(crate) fn sweep(&mut self, bitmaps: &HeapBitmap, swap_bitmaps: bool) {
        debug_assert!(self.heap.mark_stack.lock().is_empty());
        self.timings.start_split("Sweep");
        let heap = self.heap;
        let partial = self.gc_type == GcType::Partial;
        for space in heap.spaces.iter() {
            let sweep_space = match space.gc_retention_policy() {
                GcRetentionPolicy::AlwaysCollect => true,
                GcRetentionPolicy::FullCollect => !partial,
                GcRetentionPolicy::NeverCollect => false,
            };
            if !sweep_space {
                continue;
            }
            let mut live_bitmap = &**bitmaps.live_bitmap(space.index());
            let mut mark_bitmap = &**bitmaps.mark_bitmap(space.index());
            if swap_bitmaps {
                std::mem::swap(&mut live_bitmap, &mut mark_bitmap);
            }
            let (begin, end) = (space.begin(), space.end());
            if space.is_zygote_space() {
                self.timings.start_split("SweepZygote");
                let real_live = bitmaps.live_bitmap(space.index());
                ContinuousSpaceBitmap::sweep_walk(live_bitmap, mark_bitmap, begin, end, |objects| {
                    for obj in objects.iter() {
                        real_live.clear(*obj);
                        heap.card_table.mark_card(obj.address());
                    }
                });
                self.timings.end_split();
                continue;
            }
            let allocator = match space.allocator() {
                Some(allocator) => allocator.clone(),
                None => heap.fatal(format_args!("no allocator to sweep {}", space.name())),
            };
            self.timings.start_split("SweepAllocSpace");
            let mut freed_objects = 0;
            let mut freed_bytes = 0;
            ContinuousSpaceBitmap::sweep_walk(
                live_bitmap,
                mark_bitmap,
                begin,
                end,
                |objects| {
                    let bytes = allocator.free_list(objects);
                    heap.record_free(objects.len(), bytes);
                    freed_objects += objects.len();
                    freed_bytes += bytes;
                },
            );
            self.stats.freed_objects += freed_objects;
            self.stats.freed_bytes += freed_bytes;
            self.timings.end_split();
        }
        self.sweep_large_objects(swap_bitmaps);
        self.timings.end_split();
    }

    /// Frees the unmarked objects among `allocations` and empties it. The objects are expected
    /// in the allocation space or the large-object space.
    pub(crate) fn sweep_array(
        &mut self,
        bitmaps: &HeapBitmap,
        allocations: &mut ObjectStack,
        swap_bitmaps: bool,
    ) {
        self.timings.start_split("SweepArray");
        let heap = self.heap;
        let space = &heap.spaces[heap.alloc_space];
        let allocator = match space.allocator() {
            Some(allocator) => allocator.clone(),
            None => heap.fatal(format_args!("no allocator to sweep {}", space.name())),
        };
        let mark_bitmap = if swap_bitmaps {
            bitmaps.live_bitmap(space.index())
        } else {
            bitmaps.mark_bitmap(space.index())
        };
        let count = allocations.size();
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        let mut freed_large_objects = 0;
        let mut freed_large_object_bytes = 0;
        let mut chunk: Vec<ObjectRef> = Vec::with_capacity(SWEEP_ARRAY_CHUNK_FREE_SIZE);
        for obj in allocations.iter() {
            if mark_bitmap.has_address(obj.address()) {
                if !mark_bitmap.test(obj) {
                    chunk.push(obj);
                    if chunk.len() == SWEEP_ARRAY_CHUNK_FREE_SIZE {
                        freed_objects += chunk.len();
                        freed_bytes += allocator.free_list(&chunk);
                        chunk.clear();
                    }
                }
            } else {
                let marked = {
                    let sets = heap.large_objects.lock();
                    if swap_bitmaps {
                        sets.live.contains(&obj)
                    } else {
                        sets.mark.contains(&obj)
                    }
                };
                if !marked {
                    freed_large_objects += 1;
                    freed_large_object_bytes += heap.large_objects.free(obj);
                }
            }
        }
        if !chunk.is_empty() {
            freed_objects += chunk.len();
            freed_bytes += allocator.free_list(&chunk);
        }
        self.timings.new_split("RecordFree");
        log::debug!(
            "freed {}/{} objects with size {}",
            freed_objects,
            count,
            crate::utils::formatted_size(freed_bytes)
        );
        heap.record_free(
            freed_objects + freed_large_objects,
            freed_bytes + freed_large_object_bytes,
        );
        self.stats.freed_objects += freed_objects;
        self.stats.freed_bytes += freed_bytes;
        self.stats.freed_large_objects += freed_large_objects;
        self.stats.freed_large_object_bytes += freed_large_object_bytes;
        self.timings.new_split("ResetStack");
        allocations.reset();
        self.timings.end_split();
    }

    fn sweep_large_objects(&mut self, swap_bitmaps: bool) {
        self.timings.start_split("SweepLargeObjects");
        let (freed_objects, freed_bytes) = self.heap.large_objects.sweep(swap_bitmaps);
        self.stats.freed_large_objects += freed_objects;
        self.stats.freed_large_object_bytes += freed_bytes;
        self.heap.record_free(freed_objects, freed_bytes);
        self.timings.end_split();
    }

    /// Exchanges live and mark bitmaps of every space this collection swept, so survivors
    /// become the new live set without clearing live bits. Bound spaces are left alone.
    pub(crate) fn swap_bitmaps(&mut self, bitmaps: &mut HeapBitmap) {
        self.timings.start_split("SwapBitmaps");
        for space in self.heap.spaces.iter() {
            let swap = match space.gc_retention_policy() {
                GcRetentionPolicy::AlwaysCollect => true,
                GcRetentionPolicy::FullCollect => self.gc_type == GcType::Full,
                GcRetentionPolicy::NeverCollect => false,
            };
            if swap && !bitmaps.space(space.index()).is_shared() {
                bitmaps.swap(space.index());
            }
        }
        self.heap.large_objects.swap_bitmaps();
        self.timings.end_split();
    }
}
