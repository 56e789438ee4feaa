//! Remembered sets for spaces that are not collected by every collection.
//!
//! Before each non-sticky collection the cards of immune spaces are cleared into a table, so
//! that the references they hold into collected spaces can be marked without scanning the
//! whole immune space.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};

use crate::{
    gcref::ObjectRef,
    internal::{card_table::CardTable, heap_bitmap::HeapBitmap},
    runtime::ObjectModel,
    space::{ContinuousSpace, GcRetentionPolicy},
    visitor::NonNullReferences,
};

/// Heap state a mod-union table reads. Borrowed for the duration of one operation, with the
/// heap bitmap lock held by the caller.
pub struct ModUnionContext<'a> {
    pub card_table: &'a CardTable,
    pub spaces: &'a [ContinuousSpace],
    pub bitmaps: &'a HeapBitmap,
    pub object_model: &'a dyn ObjectModel,
}

impl<'a> ModUnionContext<'a> {
    fn space_for(&self, addr: usize) -> Option<&'a ContinuousSpace> {
        self.spaces
            .iter()
            .find(|space| addr >= space.begin() && addr < space.limit())
    }

    /// Visits every live object on the card starting at `card`.
    fn visit_card(&self, card: usize, mut visitor: impl FnMut(ObjectRef)) {
        if let Some(space) = self.space_for(card) {
            let end = (card + CardTable::CARD_SIZE).min(space.end());
            if card < end {
                self.bitmaps
                    .live_bitmap(space.index())
                    .visit_marked_range(card, end, &mut visitor);
            }
        }
    }
}

/// Receives what a mod-union table holds when it is replayed during marking.
pub trait ModUnionMarker {
    /// Marks a single cached reference.
    fn mark_root(&mut self, obj: ObjectRef);
    /// Marks every reference held by `obj`.
    fn scan_root(&mut self, obj: ObjectRef);
}

pub trait ModUnionTable: Send {
    fn name(&self) -> &'static str;

    /// Ages every card of `space`, remembering the ones that were dirty.
    fn clear_cards(&mut self, space: &ContinuousSpace, card_table: &CardTable);

    /// Refreshes the cache for the cards remembered since the last update.
    fn update(&mut self, ctx: &ModUnionContext<'_>);

    fn mark_references(&self, ctx: &ModUnionContext<'_>, marker: &mut dyn ModUnionMarker);

    /// Checks the cache against the heap. Returns a description of the first violation.
    fn verify(
        &self,
        ctx: &ModUnionContext<'_>,
        is_live: &dyn Fn(ObjectRef) -> bool,
    ) -> Result<(), String>;

    fn dump(&self, out: &mut dyn Write) -> fmt::Result;
}

fn clear_dirty_cards(
    cleared_cards: &mut BTreeSet<usize>,
    space: &ContinuousSpace,
    card_table: &CardTable,
) {
    card_table.modify_cards_atomic(
        space.begin(),
        space.end(),
        CardTable::age_card,
        |card, old, _| {
            if old == CardTable::CARD_DIRTY {
                cleared_cards.insert(card_table.addr_from_card(card));
            }
        },
    );
}

/// Caches, per card, the references its objects hold out of the never-collect spaces.
#[derive(Default)]
pub struct ModUnionTableReferenceCache {
    name: &'static str,
    cleared_cards: BTreeSet<usize>,
    references: BTreeMap<usize, Vec<ObjectRef>>,
}

impl ModUnionTableReferenceCache {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    /// Whether a reference is worth caching: it points into a collected space or to a large
    /// object.
    fn add_reference(ctx: &ModUnionContext<'_>, reference: ObjectRef) -> bool {
        match ctx.space_for(reference.address()) {
            Some(space) => space.gc_retention_policy() != GcRetentionPolicy::NeverCollect,
            None => true,
        }
    }

    pub fn cleared_cards(&self) -> impl Iterator<Item = usize> + '_ {
        self.cleared_cards.iter().copied()
    }

    pub fn references(&self, card: usize) -> Option<&[ObjectRef]> {
        self.references.get(&card).map(|refs| refs.as_slice())
    }
}

impl ModUnionTable for ModUnionTableReferenceCache {
    fn name(&self) -> &'static str {
        self.name
    }

    fn clear_cards(&mut self, space: &ContinuousSpace, card_table: &CardTable) {
        clear_dirty_cards(&mut self.cleared_cards, space, card_table);
    }

    fn update(&mut self, ctx: &ModUnionContext<'_>) {
        for &card in self.cleared_cards.iter() {
            let mut card_references = vec![];
            ctx.visit_card(card, |obj| {
                ctx.object_model.visit_references(
                    obj,
                    &mut NonNullReferences(|reference| {
                        if Self::add_reference(ctx, reference) {
                            card_references.push(reference);
                        }
                    }),
                );
            });
            match self.references.get_mut(&card) {
                Some(existing) => *existing = card_references,
                None if card_references.is_empty() => {}
                None => {
                    self.references.insert(card, card_references);
                }
            }
        }
        log::trace!(
            "{}: updated {} cards, {} cached",
            self.name,
            self.cleared_cards.len(),
            self.references.len()
        );
        self.cleared_cards.clear();
    }

    fn mark_references(&self, _ctx: &ModUnionContext<'_>, marker: &mut dyn ModUnionMarker) {
        let mut count = 0;
        for references in self.references.values() {
            for reference in references.iter() {
                marker.mark_root(*reference);
                count += 1;
            }
        }
        log::trace!("{}: marked {} references", self.name, count);
    }

    fn verify(
        &self,
        ctx: &ModUnionContext<'_>,
        is_live: &dyn Fn(ObjectRef) -> bool,
    ) -> Result<(), String> {
        for (card, references) in self.references.iter() {
            if let Some(dead) = references.iter().find(|reference| !is_live(**reference)) {
                return Err(format!(
                    "{}: card {:#x} caches dead reference {:p}",
                    self.name, card, dead
                ));
            }
        }
        for (&card, references) in self.references.iter() {
            if ctx.card_table.get_card(card) != CardTable::CARD_CLEAN {
                continue;
            }
            let mut missing = None;
            ctx.visit_card(card, |obj| {
                ctx.object_model.visit_references(
                    obj,
                    &mut NonNullReferences(|reference| {
                        if missing.is_none()
                            && Self::add_reference(ctx, reference)
                            && !references.contains(&reference)
                        {
                            missing = Some((obj, reference));
                        }
                    }),
                );
            });
            if let Some((obj, reference)) = missing {
                return Err(format!(
                    "{}: clean card {:#x} misses reference {:p} -> {:p}",
                    self.name, card, obj, reference
                ));
            }
        }
        Ok(())
    }

    fn dump(&self, out: &mut dyn Write) -> fmt::Result {
        writeln!(out, "{} cleared cards: [", self.name)?;
        for card in self.cleared_cards.iter() {
            writeln!(out, "  {:#x}-{:#x}", card, card + CardTable::CARD_SIZE)?;
        }
        writeln!(out, "]")?;
        writeln!(out, "{} references: [", self.name)?;
        for (card, references) in self.references.iter() {
            write!(out, "  {:#x}-{:#x} ->", card, card + CardTable::CARD_SIZE)?;
            for reference in references.iter() {
                write!(out, " {:p}", reference)?;
            }
            writeln!(out)?;
        }
        writeln!(out, "]")
    }
}

/// Remembers dirty cards only; the cards are rescanned every time they are replayed.
#[derive(Default)]
pub struct ModUnionTableCardCache {
    name: &'static str,
    cleared_cards: BTreeSet<usize>,
}

impl ModUnionTableCardCache {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn cleared_cards(&self) -> impl Iterator<Item = usize> + '_ {
        self.cleared_cards.iter().copied()
    }
}

impl ModUnionTable for ModUnionTableCardCache {
    fn name(&self) -> &'static str {
        self.name
    }

    fn clear_cards(&mut self, space: &ContinuousSpace, card_table: &CardTable) {
        clear_dirty_cards(&mut self.cleared_cards, space, card_table);
    }

    fn update(&mut self, _ctx: &ModUnionContext<'_>) {}

    fn mark_references(&self, ctx: &ModUnionContext<'_>, marker: &mut dyn ModUnionMarker) {
        for &card in self.cleared_cards.iter() {
            ctx.visit_card(card, |obj| marker.scan_root(obj));
        }
    }

    fn verify(
        &self,
        _ctx: &ModUnionContext<'_>,
        _is_live: &dyn Fn(ObjectRef) -> bool,
    ) -> Result<(), String> {
        Ok(())
    }

    fn dump(&self, out: &mut dyn Write) -> fmt::Result {
        writeln!(out, "{} cleared cards: [", self.name)?;
        for card in self.cleared_cards.iter() {
            writeln!(out, "  {:#x}-{:#x}", card, card + CardTable::CARD_SIZE)?;
        }
        writeln!(out, "]")
    }
}
