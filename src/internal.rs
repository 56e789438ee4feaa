pub mod card_table;
pub mod collection_barrier;
pub mod heap_bitmap;
pub mod mod_union_table;
pub mod object_stack;
pub mod space_bitmap;
