// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Atlas pages and the tile slot allocator.
//!
//! An *atlas page* is one fixed-size square texture ([`ATLAS_EDGE`] on a
//! side) subdivided into `arity = ATLAS_EDGE² / tile_size²` equal square
//! slots. [`AtlasSet`] owns a growable array of pages and hands out
//! generation-checked [`TileHandle`]s; the textures themselves live behind
//! the [`TextureStore`] seam each backend implements.
//!
//! Lifecycle rules (two-phase, bracketed by `begin_tiling`/`end_tiling`):
//!
//! - `allocate` scans existing pages **newest to oldest** for a free slot
//!   (recently created pages are less likely to be freed soon), then reuses
//!   a vacant entry in the page array, then appends a new page.
//! - `deallocate` only pushes the slot back on its page's free stack. The
//!   texture must stay alive until `end_tiling` because in-flight draws may
//!   still reference the page.
//! - `end_tiling` reaps pages whose every slot is free. `begin_tiling`
//!   recomputes the arity and, after a [`flush`](AtlasSet::flush) or an
//!   arity change, destroys every page outright so pages of mixed arity
//!   never coexist.

use alloc::vec::Vec;
use core::fmt;

use crate::compositor::CompositorError;

/// Edge length of every atlas page in pixels, independent of tile size.
pub const ATLAS_EDGE: u32 = 256;

/// A handle to one tile slot inside one atlas page.
///
/// The generation belongs to the page and changes when the page is
/// destroyed, so handles that outlive their page fail validation instead of
/// aliasing a recycled slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileHandle {
    pub(crate) page: u32,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl TileHandle {
    /// Index of the owning page in the page array.
    #[inline]
    #[must_use]
    pub const fn page(self) -> u32 {
        self.page
    }

    /// Slot index within the page.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Builds a handle from raw parts.
    ///
    /// Intended for backends with simpler internals than [`AtlasSet`] (the
    /// vector backend keeps per-tile pixmaps and packs its own slab indices
    /// into handles).
    #[inline]
    #[must_use]
    pub const fn from_raw_parts(page: u32, slot: u32, generation: u32) -> Self {
        Self {
            page,
            slot,
            generation,
        }
    }

    /// The generation this handle was minted under.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for TileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileHandle({}:{}@gen{})", self.page, self.slot, self.generation)
    }
}

/// Occupancy snapshot of an atlas (or atlas-like) allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AtlasStats {
    /// Slots per page at the current tile size.
    pub arity: u32,
    /// Free slot count of each live page.
    pub free_slots: Vec<u32>,
}

impl AtlasStats {
    /// Number of live pages.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.free_slots.len()
    }
}

/// The texture side of the allocator, implemented per backend.
///
/// The store owns whatever device state uploads need (a queue, a pixmap
/// arena, plain heap buffers); the allocator owns the packing bookkeeping.
pub trait TextureStore {
    /// One page texture, `edge` x `edge` pixels.
    type Texture;

    /// Creates an uninitialized page texture (nearest filtering,
    /// clamp-to-edge, where the device has such notions).
    fn create_texture(&mut self, edge: u32) -> Result<Self::Texture, CompositorError>;

    /// Uploads `size` x `size` tightly-packed premultiplied pixels into the
    /// sub-region at `(x, y)`.
    fn upload(
        &mut self,
        texture: &mut Self::Texture,
        x: u32,
        y: u32,
        size: u32,
        pixels: &[u32],
    ) -> Result<(), CompositorError>;

    /// Destroys a page texture.
    fn delete_texture(&mut self, texture: Self::Texture);
}

struct AtlasPage<T> {
    texture: T,
    /// Free slot stack; `pop` yields the most recently freed / highest
    /// seeded slot first.
    free: Vec<u32>,
    generation: u32,
}

/// The page array plus allocation state for one compositor backend.
pub struct AtlasSet<S: TextureStore> {
    pages: Vec<Option<AtlasPage<S::Texture>>>,
    tile_size: u32,
    arity: u32,
    next_generation: u32,
    needs_flush: bool,
    scratch: Vec<u32>,
}

impl<S: TextureStore> fmt::Debug for AtlasSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasSet")
            .field("pages", &self.pages.len())
            .field("tile_size", &self.tile_size)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl<S: TextureStore> Default for AtlasSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TextureStore> AtlasSet<S> {
    /// Creates an empty atlas set; `begin_tiling` establishes the arity.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            tile_size: 0,
            arity: 0,
            next_generation: 1,
            needs_flush: false,
            scratch: Vec::new(),
        }
    }

    /// Slots per page at the current tile size.
    #[inline]
    #[must_use]
    pub const fn arity(&self) -> u32 {
        self.arity
    }

    /// Number of live (non-vacant) pages.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// A snapshot of the allocator's occupancy, for diagnostics and tests.
    #[must_use]
    pub fn stats(&self) -> AtlasStats {
        AtlasStats {
            arity: self.arity,
            free_slots: self
                .pages
                .iter()
                .filter_map(|p| p.as_ref().map(|p| p.free.len() as u32))
                .collect(),
        }
    }

    /// Free slot count of the page at `index`, if it is live.
    #[must_use]
    pub fn free_slots(&self, index: usize) -> Option<u32> {
        self.pages
            .get(index)
            .and_then(|p| p.as_ref())
            .map(|p| p.free.len() as u32)
    }

    /// Returns whether `handle` still refers to a live slot.
    #[must_use]
    pub fn is_live(&self, handle: TileHandle) -> bool {
        self.page_of(handle).is_some()
    }

    /// The texture backing `handle`'s page, if the handle is live.
    #[must_use]
    pub fn texture(&self, handle: TileHandle) -> Option<&S::Texture> {
        self.page_of(handle).map(|p| &p.texture)
    }

    /// Pixel origin of `handle`'s slot within its page texture.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    #[must_use]
    pub fn slot_origin(&self, handle: TileHandle) -> (u32, u32) {
        assert!(self.is_live(handle), "stale {handle:?}");
        let per_row = ATLAS_EDGE / self.tile_size;
        (
            (handle.slot % per_row) * self.tile_size,
            (handle.slot / per_row) * self.tile_size,
        )
    }

    /// Marks the whole atlas for destruction at the next `begin_tiling`.
    pub fn flush(&mut self) {
        self.needs_flush = true;
    }

    /// Opens a tiling batch: recomputes the arity from `tile_size` and, if
    /// it changed or a flush was requested, destroys every existing page.
    ///
    /// # Panics
    ///
    /// Panics if `tile_size` is not a power of two in `16..=ATLAS_EDGE`.
    pub fn begin_tiling(&mut self, store: &mut S, tile_size: u32) {
        assert!(
            tile_size.is_power_of_two() && (16..=ATLAS_EDGE).contains(&tile_size),
            "tile size {tile_size} must be a power of two in 16..={ATLAS_EDGE}"
        );
        let arity = (ATLAS_EDGE * ATLAS_EDGE) / (tile_size * tile_size);
        if arity != self.arity || self.needs_flush {
            self.destroy_pages(store, true);
            self.tile_size = tile_size;
            self.arity = arity;
            self.needs_flush = false;
        }
    }

    /// Closes a tiling batch, destroying every page whose slots are all
    /// free. Safe to call repeatedly.
    pub fn end_tiling(&mut self, store: &mut S) {
        self.destroy_pages(store, false);
    }

    /// Destroys everything. Called from the backend's `cleanup`.
    pub fn cleanup(&mut self, store: &mut S) {
        self.destroy_pages(store, true);
        self.pages.clear();
    }

    /// Allocates a slot and uploads `pixels` (row stride `stride_px`
    /// pixels) into it.
    ///
    /// Scans pages newest to oldest for spare capacity before growing. On
    /// any texture failure no slot is leaked and no handle is returned.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tiling batch (arity not yet established)
    /// or if `pixels` is too short for `size` rows of `stride_px`.
    pub fn allocate(
        &mut self,
        store: &mut S,
        pixels: &[u32],
        stride_px: usize,
    ) -> Result<TileHandle, CompositorError> {
        assert!(self.arity != 0, "allocate outside a tiling batch");
        let size = self.tile_size;
        if stride_px == size as usize {
            assert!(
                pixels.len() >= (size * size) as usize,
                "tile pixel buffer too short"
            );
        } else {
            assert!(
                pixels.len() >= stride_px * (size as usize - 1) + size as usize,
                "tile pixel buffer too short for stride"
            );
        }

        let handle = self.grab_slot(store)?;
        let (x, y) = self.slot_origin(handle);

        // Tight rows can upload straight from the caller's buffer; anything
        // else is repacked into the scratch buffer first.
        let data: &[u32] = if stride_px == size as usize {
            &pixels[..(size * size) as usize]
        } else {
            self.scratch.clear();
            self.scratch.reserve((size * size) as usize);
            for row in 0..size as usize {
                let start = row * stride_px;
                self.scratch
                    .extend_from_slice(&pixels[start..start + size as usize]);
            }
            &self.scratch
        };

        let page = self.pages[handle.page as usize]
            .as_mut()
            .expect("slot was just grabbed from a live page");
        if let Err(e) = store.upload(&mut page.texture, x, y, size, data) {
            // The tile was not created; return its slot so the page does
            // not leak capacity.
            page.free.push(handle.slot);
            return Err(e);
        }
        Ok(handle)
    }

    /// Returns `handle`'s slot to its page's free stack. The page texture
    /// survives until `end_tiling`.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn deallocate(&mut self, handle: TileHandle) {
        let arity = self.arity;
        let page = self
            .page_of_mut(handle)
            .unwrap_or_else(|| panic!("stale {handle:?}"));
        debug_assert!(
            !page.free.contains(&handle.slot),
            "slot {} freed twice",
            handle.slot
        );
        page.free.push(handle.slot);
        debug_assert!(page.free.len() as u32 <= arity, "free stack overflow");
    }

    fn grab_slot(&mut self, store: &mut S) -> Result<TileHandle, CompositorError> {
        // Newest page first.
        for (index, entry) in self.pages.iter_mut().enumerate().rev() {
            if let Some(page) = entry
                && let Some(slot) = page.free.pop()
            {
                return Ok(TileHandle {
                    page: index as u32,
                    slot,
                    generation: page.generation,
                });
            }
        }

        // No spare capacity: reuse a vacant array entry or append.
        let index = self
            .pages
            .iter()
            .position(|p| p.is_none())
            .unwrap_or_else(|| {
                self.pages.push(None);
                self.pages.len() - 1
            });

        let texture = store.create_texture(ATLAS_EDGE)?;
        let generation = self.next_generation;
        self.next_generation += 1;

        // Seed the free stack with every slot except 0, which is the slot
        // this allocation takes.
        let mut free = Vec::with_capacity(self.arity as usize - 1);
        free.extend(1..self.arity);
        self.pages[index] = Some(AtlasPage {
            texture,
            free,
            generation,
        });

        Ok(TileHandle {
            page: index as u32,
            slot: 0,
            generation,
        })
    }

    fn destroy_pages(&mut self, store: &mut S, force: bool) {
        for entry in &mut self.pages {
            let reap = match entry {
                Some(page) => force || page.free.len() as u32 == self.arity,
                None => false,
            };
            if reap && let Some(page) = entry.take() {
                store.delete_texture(page.texture);
            }
        }
    }

    fn page_of(&self, handle: TileHandle) -> Option<&AtlasPage<S::Texture>> {
        self.pages
            .get(handle.page as usize)?
            .as_ref()
            .filter(|p| p.generation == handle.generation)
    }

    fn page_of_mut(&mut self, handle: TileHandle) -> Option<&mut AtlasPage<S::Texture>> {
        self.pages
            .get_mut(handle.page as usize)?
            .as_mut()
            .filter(|p| p.generation == handle.generation)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    /// A store that hands out numbered textures and counts lifecycle calls.
    #[derive(Default)]
    struct CountingStore {
        created: u32,
        deleted: u32,
        uploads: u32,
        fail_create: bool,
        fail_upload: bool,
    }

    impl TextureStore for CountingStore {
        type Texture = u32;

        fn create_texture(&mut self, _edge: u32) -> Result<u32, CompositorError> {
            if self.fail_create {
                return Err(CompositorError::TextureCreation);
            }
            self.created += 1;
            Ok(self.created)
        }

        fn upload(
            &mut self,
            _texture: &mut u32,
            _x: u32,
            _y: u32,
            _size: u32,
            _pixels: &[u32],
        ) -> Result<(), CompositorError> {
            if self.fail_upload {
                return Err(CompositorError::TextureUpload);
            }
            self.uploads += 1;
            Ok(())
        }

        fn delete_texture(&mut self, _texture: u32) {
            self.deleted += 1;
        }
    }

    fn tile_pixels(size: u32) -> Vec<u32> {
        vec![0xffff_ffff; (size * size) as usize]
    }

    #[test]
    fn arity_matches_edge_over_tile_squared() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        for (tile, want) in [(16, 256), (32, 64), (64, 16), (128, 4), (256, 1)] {
            atlas.begin_tiling(&mut store, tile);
            assert_eq!(atlas.arity(), want, "tile size {tile}");
            atlas.end_tiling(&mut store);
        }
    }

    #[test]
    fn filling_one_page_then_spilling_creates_a_second() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 64);
        let px = tile_pixels(64);

        let arity = atlas.arity();
        for i in 0..arity {
            let h = atlas.allocate(&mut store, &px, 64).unwrap();
            assert_eq!(h.page(), 0, "allocation {i} should stay on page 0");
        }
        assert_eq!(atlas.live_pages(), 1);
        assert_eq!(atlas.free_slots(0), Some(0));

        // One more spills onto a fresh page.
        let h = atlas.allocate(&mut store, &px, 64).unwrap();
        assert_eq!(h.page(), 1);
        assert_eq!(atlas.live_pages(), 2);
        assert_eq!(store.created, 2);
    }

    #[test]
    fn freed_slot_is_reused_before_growth() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 128);
        let px = tile_pixels(128);

        let handles: Vec<_> = (0..atlas.arity())
            .map(|_| atlas.allocate(&mut store, &px, 128).unwrap())
            .collect();
        atlas.deallocate(handles[1]);

        let h = atlas.allocate(&mut store, &px, 128).unwrap();
        assert_eq!((h.page(), h.slot()), (0, handles[1].slot()));
        assert_eq!(store.created, 1, "no new texture while a slot is free");
    }

    #[test]
    fn newest_page_is_scanned_first() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 128);
        let px = tile_pixels(128);

        // Fill page 0, spill one tile onto page 1, then free one slot on
        // each page. The next allocation must land on page 1.
        let first: Vec<_> = (0..atlas.arity())
            .map(|_| atlas.allocate(&mut store, &px, 128).unwrap())
            .collect();
        let spill = atlas.allocate(&mut store, &px, 128).unwrap();
        atlas.deallocate(first[0]);
        atlas.deallocate(spill);

        let h = atlas.allocate(&mut store, &px, 128).unwrap();
        assert_eq!(h.page(), 1);
    }

    #[test]
    fn end_tiling_reaps_only_fully_free_pages_and_is_idempotent() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 128);
        let px = tile_pixels(128);

        let keep = atlas.allocate(&mut store, &px, 128).unwrap();
        let handles: Vec<_> = (0..atlas.arity() * 2 - 1)
            .map(|_| atlas.allocate(&mut store, &px, 128).unwrap())
            .collect();
        assert_eq!(atlas.live_pages(), 2);

        // Free everything on page 1.
        for h in handles.iter().filter(|h| h.page() == 1) {
            atlas.deallocate(*h);
        }
        atlas.end_tiling(&mut store);
        assert_eq!(atlas.live_pages(), 1);
        assert_eq!(store.deleted, 1);

        // Repeated end_tiling with no intervening allocations does nothing.
        atlas.end_tiling(&mut store);
        atlas.end_tiling(&mut store);
        assert_eq!(store.deleted, 1);
        assert!(atlas.free_slots(0).unwrap() <= atlas.arity());
        assert!(atlas.is_live(keep));
    }

    #[test]
    fn flush_destroys_all_pages_at_next_begin_tiling() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 64);
        let px = tile_pixels(64);
        let h = atlas.allocate(&mut store, &px, 64).unwrap();

        atlas.flush();
        atlas.begin_tiling(&mut store, 64);
        assert_eq!(atlas.live_pages(), 0);
        assert_eq!(store.deleted, 1);
        assert!(!atlas.is_live(h), "handles from before the flush are stale");
    }

    #[test]
    fn arity_change_destroys_pages_even_when_occupied() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 64);
        let px = tile_pixels(64);
        let _h = atlas.allocate(&mut store, &px, 64).unwrap();
        atlas.end_tiling(&mut store);

        atlas.begin_tiling(&mut store, 32);
        assert_eq!(atlas.live_pages(), 0, "mixed-arity pages must never coexist");
        assert_eq!(atlas.arity(), 64);
    }

    #[test]
    fn create_failure_returns_error_without_a_page() {
        let mut store = CountingStore {
            fail_create: true,
            ..CountingStore::default()
        };
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 64);
        let px = tile_pixels(64);
        assert!(matches!(
            atlas.allocate(&mut store, &px, 64),
            Err(CompositorError::TextureCreation)
        ));
        assert_eq!(atlas.live_pages(), 0);
    }

    #[test]
    fn upload_failure_returns_the_slot() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 64);
        let px = tile_pixels(64);
        let _ = atlas.allocate(&mut store, &px, 64).unwrap();
        let free_before = atlas.free_slots(0).unwrap();

        store.fail_upload = true;
        assert!(atlas.allocate(&mut store, &px, 64).is_err());
        assert_eq!(atlas.free_slots(0), Some(free_before));
    }

    #[test]
    fn strided_pixels_are_repacked() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 16);
        // 16x16 tile carved out of a 64px-wide buffer.
        let px = vec![0x1234_5678u32; 64 * 16];
        let h = atlas.allocate(&mut store, &px, 64).unwrap();
        assert!(atlas.is_live(h));
        assert_eq!(store.uploads, 1);
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn deallocate_after_flush_panics() {
        let mut store = CountingStore::default();
        let mut atlas = AtlasSet::new();
        atlas.begin_tiling(&mut store, 64);
        let px = tile_pixels(64);
        let h = atlas.allocate(&mut store, &px, 64).unwrap();
        atlas.flush();
        atlas.begin_tiling(&mut store, 64);
        atlas.deallocate(h);
    }
}
