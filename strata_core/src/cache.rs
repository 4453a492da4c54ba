// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The tile cache orchestrator.
//!
//! [`TileCache`] owns the configuration (tile size, cache byte budget,
//! viewport), the layer registry, and the active compositor backend, and
//! runs the frame lifecycle:
//!
//! ```text
//!   mutations (insert/remove/reshape/update/scroll)
//!        │
//!        ▼
//!   begin_frame() ──► Frame
//!                      │  render_scenery / render_sprite   (front to back)
//!                      ▼
//!                     end(surface, dirty)
//!                      │  1. close open occlusion frontiers
//!                      │  2. tiling pass: begin_tiling → rasterize dirty
//!                      │     cells via callbacks → allocate_tile → end_tiling
//!                      │  3. composite pass: begin_frame → replay display
//!                      │     list back-to-front → end_frame
//!                      ▼
//!   snapshot(area) ──► same display list through begin/end_snapshot
//! ```
//!
//! Tile pixel memory is bounded by the cache byte limit with LRU eviction
//! over the tiles not touched by the current frame. Any backend failure
//! poisons [`is_valid`](TileCache::is_valid); the caller recovers with an
//! explicit [`flush`](TileCache::flush).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, warn};

use crate::atlas::TileHandle;
use crate::compositor::{
    BlendMode, Compositor, CompositorError, CompositorFactory, CompositorKind,
};
use crate::geom::{Rect32, covered_cells, tile_ceil, tile_floor, touched_cells};
use crate::layer::{
    Frontier, INVALID_TILE, Renderer, SceneryLayer, Sprite, SpriteLayer,
};
use crate::raster::{Canvas, Raster};
use crate::surface::RenderSurface;

/// Hard ceiling on tile records, matching the 16-bit id space of the
/// original design.
const TILE_RECORD_LIMIT: u32 = 65536;

/// Construction-time configuration.
#[derive(Clone, Copy, Debug)]
pub struct TileCacheOptions {
    /// Tile edge length; a power of two in `16..=256`.
    pub tile_size: u32,
    /// Byte budget for cached tile pixels.
    pub cache_limit: u32,
    /// Initial viewport; its top-left is the scenery tiling origin.
    pub viewport: Rect32,
    /// Backend to install.
    pub compositor: CompositorKind,
}

impl Default for TileCacheOptions {
    fn default() -> Self {
        Self {
            tile_size: 32,
            cache_limit: 32 * 1024 * 1024,
            viewport: Rect32::EMPTY,
            compositor: CompositorKind::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tile records
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TileOwner {
    /// Bakes the scenery layer range `first..=last` (this frame's ids;
    /// remapped forward at the end of every frame).
    Scenery { first: u16, last: u16 },
    /// Caches one cell of the sprite keyed `key`.
    Sprite { key: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TileContent {
    /// Scheduled this frame; not rasterized yet.
    Pending,
    /// Rasterized fully transparent; nothing stored, nothing composited.
    Transparent,
    /// Resident in an atlas slot.
    Atlas(TileHandle),
}

#[derive(Clone, Copy, Debug)]
struct TileRecord {
    owner: TileOwner,
    next: u32,
    prev: u32,
    /// Cell coordinates: viewport cells for scenery, window coordinates
    /// for sprites.
    x: i32,
    y: i32,
    /// OR of the tile's alpha bytes, approximated as 255/127 until the
    /// pixels are analyzed. 255 occludes; 0 composites nothing.
    alpha: u8,
    content: TileContent,
}

impl TileRecord {
    const fn new() -> Self {
        Self {
            owner: TileOwner::Scenery { first: 0, last: 0 },
            next: INVALID_TILE,
            prev: INVALID_TILE,
            x: 0,
            y: 0,
            alpha: 0,
            content: TileContent::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TileList {
    first: u32,
    last: u32,
}

impl TileList {
    const fn new() -> Self {
        Self {
            first: INVALID_TILE,
            last: INVALID_TILE,
        }
    }
}

fn list_remove(records: &mut [TileRecord], list: &mut TileList, index: u32) {
    let (next, prev) = {
        let r = &records[index as usize];
        (r.next, r.prev)
    };
    if next != INVALID_TILE {
        records[next as usize].prev = prev;
    } else {
        list.last = prev;
    }
    if prev != INVALID_TILE {
        records[prev as usize].next = next;
    } else {
        list.first = next;
    }
    let r = &mut records[index as usize];
    r.next = INVALID_TILE;
    r.prev = INVALID_TILE;
}

fn list_push_front(records: &mut [TileRecord], list: &mut TileList, index: u32) {
    if list.first != INVALID_TILE {
        records[index as usize].next = list.first;
        records[list.first as usize].prev = index;
        list.first = index;
    } else {
        list.first = index;
        list.last = index;
    }
}

fn list_pop_back(records: &mut [TileRecord], list: &mut TileList) -> u32 {
    let index = list.last;
    if index != INVALID_TILE {
        list_remove(records, list, index);
    }
    index
}

/// The record slab plus the intrusive used/dirty/empty lists.
///
/// The used list is LRU-ordered front-to-back; `inactive` points at the
/// first record not touched by the current frame, so everything from there
/// to the back is evictable.
struct TileTable {
    records: Vec<TileRecord>,
    used: TileList,
    dirty: TileList,
    empty: TileList,
    inactive: u32,
    active: u32,
}

impl TileTable {
    const fn new() -> Self {
        Self {
            records: Vec::new(),
            used: TileList::new(),
            dirty: TileList::new(),
            empty: TileList::new(),
            inactive: INVALID_TILE,
            active: 0,
        }
    }

    fn touch(&mut self, index: u32) {
        if self.inactive == index {
            self.inactive = self.records[index as usize].next;
        }
        list_remove(&mut self.records, &mut self.used, index);
        list_push_front(&mut self.records, &mut self.used, index);
        self.active += 1;
    }

    fn remove_from_used(&mut self, index: u32) {
        if self.inactive == index {
            self.inactive = self.records[index as usize].next;
        }
        list_remove(&mut self.records, &mut self.used, index);
    }

    fn push_used_front(&mut self, index: u32) {
        list_push_front(&mut self.records, &mut self.used, index);
    }

    fn push_dirty_front(&mut self, index: u32) {
        list_push_front(&mut self.records, &mut self.dirty, index);
    }

    fn push_empty_front(&mut self, index: u32) {
        list_push_front(&mut self.records, &mut self.empty, index);
    }

    fn pop_empty(&mut self) -> u32 {
        list_pop_back(&mut self.records, &mut self.empty)
    }

    fn pop_dirty(&mut self) -> u32 {
        list_pop_back(&mut self.records, &mut self.dirty)
    }
}

// ---------------------------------------------------------------------------
// Display list
// ---------------------------------------------------------------------------

/// One instruction of the frame's display list.
///
/// The list is built while layers are described front to back and replayed
/// in reverse, so composite order is back to front. A sprite's entries are
/// pushed as `LayerEnd`, tiles, `LayerBegin`; reversed playback yields the
/// expected begin/tiles/end bracketing.
#[derive(Clone, Copy, Debug)]
enum DisplayOp {
    Tile(u32),
    LayerBegin {
        origin: (i32, i32),
        clip: Rect32,
        opacity: u8,
        blend: BlendMode,
    },
    LayerEnd,
}

fn replay(
    ops: &[DisplayOp],
    records: &[TileRecord],
    tile_size: i32,
    comp: &mut dyn Compositor,
) -> Result<(), CompositorError> {
    let mut origin = (0, 0);
    let mut in_layer = false;
    for op in ops.iter().rev() {
        let result = match *op {
            DisplayOp::LayerBegin {
                origin: o,
                clip,
                opacity,
                blend,
            } => {
                origin = o;
                in_layer = true;
                comp.begin_layer(clip, opacity, blend)
            }
            DisplayOp::LayerEnd => {
                origin = (0, 0);
                in_layer = false;
                comp.end_layer()
            }
            DisplayOp::Tile(id) => {
                let rec = &records[id as usize];
                match rec.content {
                    TileContent::Atlas(handle) => comp.composite_tile(
                        origin.0 + rec.x * tile_size,
                        origin.1 + rec.y * tile_size,
                        handle,
                    ),
                    // Transparent tiles store nothing; tiles that never
                    // rasterized (aborted frame) draw nothing either.
                    TileContent::Transparent | TileContent::Pending => Ok(()),
                }
            }
        };
        if let Err(e) = result {
            // Keep the backend's layer nesting balanced before bailing.
            if in_layer {
                let _ = comp.end_layer();
            }
            return Err(e);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TileCache
// ---------------------------------------------------------------------------

/// The tile cache and layer compositor for one surface.
pub struct TileCache {
    valid: bool,
    clean: bool,

    tile_size: u32,
    cache_bytes: u32,
    cache_limit: u32,

    kind: CompositorKind,
    compositor: Option<Box<dyn Compositor>>,
    factory: Box<dyn CompositorFactory>,

    viewport: Rect32,
    tiles_across: i32,
    tiles_down: i32,
    /// Per-cell lists of scenery tile records cached at that location.
    cells: Vec<Vec<u32>>,

    sprites: BTreeMap<u32, Sprite>,
    tiles: TileTable,

    display_list: Vec<DisplayOp>,
    /// Highest scenery layer id handed out last frame; sizes the id map.
    prev_scenery_count: u16,
}

impl fmt::Debug for TileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileCache")
            .field("valid", &self.valid)
            .field("clean", &self.clean)
            .field("tile_size", &self.tile_size)
            .field("cache_bytes", &self.cache_bytes)
            .field("viewport", &self.viewport)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl TileCache {
    /// Creates a cache and installs the backend named by the options.
    ///
    /// # Panics
    ///
    /// Panics if the tile size is not a power of two in `16..=256`.
    #[must_use]
    pub fn new(options: TileCacheOptions, factory: Box<dyn CompositorFactory>) -> Self {
        assert_valid_tile_size(options.tile_size);
        let mut cache = Self {
            valid: true,
            clean: false,
            tile_size: options.tile_size,
            cache_bytes: 0,
            cache_limit: options.cache_limit,
            kind: CompositorKind::None,
            compositor: None,
            factory,
            viewport: Rect32::EMPTY,
            tiles_across: 0,
            tiles_down: 0,
            cells: Vec::new(),
            sprites: BTreeMap::new(),
            tiles: TileTable::new(),
            display_list: Vec::new(),
            prev_scenery_count: 0,
        };
        cache.set_viewport(options.viewport);
        cache.set_compositor(options.compositor);
        cache
    }

    // -- Configuration ------------------------------------------------------

    /// `false` after any allocation or device failure until
    /// [`flush`](Self::flush) is called.
    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// `true` immediately after a flush, before any tiling occurs. While
    /// clean, every previously returned layer id is stale.
    #[inline]
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.clean
    }

    /// Current tile edge length.
    #[inline]
    #[must_use]
    pub const fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Current byte budget for cached tile pixels.
    #[inline]
    #[must_use]
    pub const fn cache_limit(&self) -> u32 {
        self.cache_limit
    }

    /// Bytes currently used by cached tile pixels.
    #[inline]
    #[must_use]
    pub const fn cache_bytes(&self) -> u32 {
        self.cache_bytes
    }

    /// The viewport rectangle; its top-left is the scenery tiling origin.
    #[inline]
    #[must_use]
    pub const fn viewport(&self) -> Rect32 {
        self.viewport
    }

    /// Which backend is installed.
    #[inline]
    #[must_use]
    pub const fn compositor_kind(&self) -> CompositorKind {
        self.kind
    }

    /// Read access to the installed backend (tests and diagnostics).
    #[must_use]
    pub fn compositor(&self) -> Option<&dyn Compositor> {
        self.compositor.as_deref()
    }

    /// Marks the cache invalid; the next frame is rejected until
    /// [`flush`](Self::flush).
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Changes the tile size, flushing every cached tile if it differs.
    ///
    /// # Panics
    ///
    /// Panics if `tile_size` is not a power of two in `16..=256`.
    pub fn set_tile_size(&mut self, tile_size: u32) {
        assert_valid_tile_size(tile_size);
        if self.tile_size != tile_size {
            self.flush();
        }
        self.tile_size = tile_size;

        // Re-derive the cell grid for the new granularity.
        let viewport = self.viewport;
        self.set_viewport(Rect32::EMPTY);
        self.set_viewport(viewport);
    }

    /// Changes the byte budget, flushing first when current usage exceeds
    /// the new limit.
    pub fn set_cache_limit(&mut self, cache_limit: u32) {
        if self.cache_bytes > cache_limit {
            self.flush();
        }
        self.cache_limit = cache_limit;
    }

    /// Replaces the viewport. When only the size changes, cached cells
    /// covering complete tiles carry over; everything else is dirtied.
    pub fn set_viewport(&mut self, viewport: Rect32) {
        if !self.valid {
            self.flush();
        }
        if self.viewport == viewport {
            return;
        }

        let ts = self.tile_size as i32;
        let new_across = tile_ceil(viewport.width.max(0), ts);
        let new_down = tile_ceil(viewport.height.max(0), ts);
        let mut new_cells: Vec<Vec<u32>> = vec![Vec::new(); (new_across * new_down) as usize];

        let mut old_cells = core::mem::take(&mut self.cells);
        if self.viewport.x == viewport.x && self.viewport.y == viewport.y {
            // Same origin: complete tiles stay valid in place.
            let old_full_across = tile_floor(self.viewport.width, ts);
            let old_full_down = tile_floor(self.viewport.height, ts);
            for y in 0..old_full_down.min(new_down) {
                for x in 0..old_full_across.min(new_across) {
                    let old = core::mem::take(&mut old_cells[(y * self.tiles_across + x) as usize]);
                    new_cells[(y * new_across + x) as usize] = old;
                }
            }
        }

        self.viewport = viewport;
        self.tiles_across = new_across;
        self.tiles_down = new_down;
        self.cells = new_cells;

        for cell in old_cells {
            for tile in cell {
                self.tiles.remove_from_used(tile);
                self.tiles.push_dirty_front(tile);
            }
        }
    }

    /// Tears down the current backend and installs one of the requested
    /// kind. The cache is flushed, so the next frame re-tiles from scratch.
    ///
    /// Returns `false` (leaving no backend installed) when the factory does
    /// not support `kind` on this platform.
    pub fn set_compositor(&mut self, kind: CompositorKind) -> bool {
        self.flush();
        if let Some(mut old) = self.compositor.take() {
            old.cleanup();
        }
        self.kind = CompositorKind::None;
        if kind == CompositorKind::None {
            return true;
        }
        match self.factory.create(kind) {
            Some(compositor) => {
                self.compositor = Some(compositor);
                self.kind = kind;
                true
            }
            None => {
                warn!("compositor kind {kind:?} is unsupported here");
                false
            }
        }
    }

    // -- Cache maintenance --------------------------------------------------

    /// Discards every cached tile, sprite window, and cell list, tells the
    /// backend to invalidate its atlas at the next tiling pass, and
    /// restores validity. Every previously returned layer id becomes
    /// stale.
    pub fn flush(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
        self.sprites.clear();

        for index in 0..self.tiles.records.len() as u32 {
            self.release_tile_pixels(index);
        }
        self.tiles = TileTable::new();

        if let Some(comp) = &mut self.compositor {
            comp.flush();
        }

        self.display_list.clear();
        self.cache_bytes = 0;
        self.prev_scenery_count = 0;
        self.valid = true;
        self.clean = true;
    }

    /// Evicts every tile not touched by the most recent frame. Their pages
    /// are reaped at the next tiling pass once fully empty.
    pub fn compact(&mut self) {
        while self.tiles.inactive != INVALID_TILE {
            let victim = self.tiles.used.last;
            self.flush_tile(victim, true);
        }
    }

    // -- Scenery mutations --------------------------------------------------

    /// Records the insertion of a scenery layer before `before_layer`
    /// (front-to-back id from the last frame); `region` is the affected
    /// area. Cached tiles spanning the insertion point are invalidated.
    pub fn insert_scenery(&mut self, before_layer: u16, region: Rect32) {
        // Inserting at the very back never splits a cached range.
        if before_layer == 1 {
            return;
        }
        self.flush_cells_containing_layers(before_layer.wrapping_sub(1), before_layer, region);
    }

    /// Records the removal of scenery layer `layer`; `region` is the area
    /// whose pixels must be considered dirty.
    pub fn remove_scenery(&mut self, layer: u16, region: Rect32) {
        self.flush_cells_containing_layers(layer, layer, region);
    }

    /// Records a reshape of scenery layer `layer` from `old_region` to
    /// `new_region`.
    pub fn reshape_scenery(&mut self, layer: u16, old_region: Rect32, new_region: Rect32) {
        self.remove_scenery(layer, old_region);
        self.insert_scenery(layer.wrapping_add(1), new_region);
    }

    /// Records a content update of scenery layer `layer` within `region`.
    pub fn update_scenery(&mut self, layer: u16, region: Rect32) {
        self.flush_cells_containing_layers(layer, layer, region);
    }

    fn flush_cells_containing_layers(&mut self, first: u16, last: u16, region: Rect32) {
        if !self.valid {
            return;
        }
        let affected = touched_cells(
            region,
            (self.viewport.x, self.viewport.y),
            self.tile_size as i32,
            self.tiles_across,
            self.tiles_down,
        );
        for y in affected.top..affected.bottom {
            for x in affected.left..affected.right {
                let index = (y * self.tiles_across + x) as usize;
                let cell = core::mem::take(&mut self.cells[index]);
                let mut kept = Vec::with_capacity(cell.len());
                for tile in cell {
                    let TileOwner::Scenery {
                        first: tile_first,
                        last: tile_last,
                    } = self.tiles.records[tile as usize].owner
                    else {
                        kept.push(tile);
                        continue;
                    };
                    if first >= tile_first && last <= tile_last {
                        self.tiles.remove_from_used(tile);
                        self.tiles.push_dirty_front(tile);
                    } else {
                        kept.push(tile);
                    }
                }
                self.cells[index] = kept;
            }
        }
    }

    // -- Sprite mutations ---------------------------------------------------

    /// Invalidates the cached tiles of sprite `id` within `region`
    /// (sprite-content coordinates). Unknown ids are ignored.
    pub fn update_sprite(&mut self, id: u32, region: Rect32) {
        if !self.valid || self.clean {
            return;
        }
        let ts = self.tile_size as i32;
        let Some(sprite) = self.sprites.get_mut(&id) else {
            return;
        };
        let tile_rect = region.offset(sprite.xorg, sprite.yorg);
        let left = sprite.window.left.max(tile_floor(tile_rect.x, ts));
        let top = sprite.window.top.max(tile_floor(tile_rect.y, ts));
        let right = sprite.window.right.min(tile_ceil(tile_rect.right(), ts));
        let bottom = sprite.window.bottom.min(tile_ceil(tile_rect.bottom(), ts));

        let mut dirtied = Vec::new();
        for y in top..bottom {
            for x in left..right {
                let tile = sprite.cell(x, y);
                if tile != INVALID_TILE {
                    sprite.set_cell(x, y, INVALID_TILE);
                    dirtied.push(tile);
                }
            }
        }
        for tile in dirtied {
            self.tiles.remove_from_used(tile);
            self.tiles.push_dirty_front(tile);
        }
    }

    /// Drops sprite `id` and dirties all of its cached tiles. Unknown ids
    /// are ignored.
    pub fn remove_sprite(&mut self, id: u32) {
        if !self.valid || self.clean {
            return;
        }
        let Some(sprite) = self.sprites.remove(&id) else {
            return;
        };
        for tile in sprite.tiles {
            if tile != INVALID_TILE {
                self.tiles.remove_from_used(tile);
                self.tiles.push_dirty_front(tile);
            }
        }
    }

    /// Scrolls sprite `id` by `(dx, dy)` pixels. Cached tiles are reused
    /// at their translated placement; only newly exposed cells rasterize
    /// at the next frame. Unknown ids are ignored.
    pub fn scroll_sprite(&mut self, id: u32, dx: i32, dy: i32) {
        if !self.valid || self.clean {
            return;
        }
        if let Some(sprite) = self.sprites.get_mut(&id) {
            sprite.xorg -= dx;
            sprite.yorg -= dy;
        }
    }

    // -- Frame lifecycle ----------------------------------------------------

    /// Opens a frame.
    ///
    /// Fails with [`CompositorError::CacheInvalid`] until the caller
    /// flushes an invalid cache, and with [`CompositorError::NoCompositor`]
    /// when no backend is installed. On success, deferred tile destruction
    /// runs and a [`Frame`] is returned; describe the visible layers front
    /// to back and finish with [`Frame::end`].
    pub fn begin_frame<'c, 'f>(&'c mut self) -> Result<Frame<'c, 'f>, CompositorError> {
        if self.compositor.is_none() {
            return Err(CompositorError::NoCompositor);
        }
        if !self.valid {
            return Err(CompositorError::CacheInvalid);
        }

        // Destroy tiles freed by mutations since the last frame.
        loop {
            let tile = self.tiles.pop_dirty();
            if tile == INVALID_TILE {
                break;
            }
            self.release_tile_pixels(tile);
            self.tiles.push_empty_front(tile);
        }

        self.display_list.clear();
        self.tiles.inactive = self.tiles.used.first;
        self.tiles.active = 0;

        let cell_count = (self.tiles_across * self.tiles_down) as usize;
        let map_len = self.prev_scenery_count as usize + 1;
        Ok(Frame {
            frontiers: vec![Frontier::default(); cell_count],
            scenery_map: vec![0; map_len],
            scenery_renderers: Vec::new(),
            sprite_renderers: BTreeMap::new(),
            scenery_pending: Vec::new(),
            sprite_pending: Vec::new(),
            cache: self,
        })
    }

    /// Renders the most recently built display list into an offscreen
    /// pixel buffer covering `area` (surface coordinates).
    ///
    /// Runs the identical layer traversal as the live composite but
    /// redirected through the backend's snapshot target, and touches
    /// neither cleanliness, validity, nor any atlas page.
    pub fn snapshot(&mut self, area: Rect32) -> Result<Raster, CompositorError> {
        let comp = self
            .compositor
            .as_deref_mut()
            .ok_or(CompositorError::NoCompositor)?;
        let mut raster = Raster::new(area.width.max(0), area.height.max(0));
        comp.begin_snapshot(area, &mut raster)?;
        let replayed = replay(
            &self.display_list,
            &self.tiles.records,
            self.tile_size as i32,
            comp,
        );
        match replayed {
            Ok(()) => {
                comp.end_snapshot(area, &mut raster)?;
                Ok(raster)
            }
            Err(e) => {
                let _ = comp.end_snapshot(area, &mut raster);
                Err(e)
            }
        }
    }

    // -- Internals ----------------------------------------------------------

    fn cell_index(&self, x: i32, y: i32) -> usize {
        debug_assert!(
            x >= 0 && x < self.tiles_across && y >= 0 && y < self.tiles_down,
            "cell ({x}, {y}) outside {}x{} grid",
            self.tiles_across,
            self.tiles_down
        );
        (y * self.tiles_across + x) as usize
    }

    fn tile_bytes(&self) -> u32 {
        self.tile_size * self.tile_size * 4
    }

    /// Frees a record's pixel storage (returning its atlas slot) without
    /// touching list membership or references.
    fn release_tile_pixels(&mut self, index: u32) {
        let record = &mut self.tiles.records[index as usize];
        if let TileContent::Atlas(handle) = record.content {
            record.content = TileContent::Pending;
            let bytes = self.tile_size * self.tile_size * 4;
            self.cache_bytes = self.cache_bytes.saturating_sub(bytes);
            if let Some(comp) = &mut self.compositor {
                comp.deallocate_tile(handle);
            }
        } else {
            record.content = TileContent::Pending;
        }
    }

    /// Fully releases a tile: removes its cell/window reference, frees its
    /// pixels, and unlinks it from the used list.
    fn flush_tile(&mut self, index: u32, put_on_empty: bool) {
        if index == INVALID_TILE {
            return;
        }
        let record = self.tiles.records[index as usize];
        match record.owner {
            TileOwner::Sprite { key } => {
                if let Some(sprite) = self.sprites.get_mut(&key)
                    && sprite.contains(record.x, record.y)
                    && sprite.cell(record.x, record.y) == index
                {
                    sprite.set_cell(record.x, record.y, INVALID_TILE);
                }
            }
            TileOwner::Scenery { .. } => {
                if record.x >= 0
                    && record.x < self.tiles_across
                    && record.y >= 0
                    && record.y < self.tiles_down
                {
                    let cell = self.cell_index(record.x, record.y);
                    self.cells[cell].retain(|&t| t != index);
                }
            }
        }

        self.release_tile_pixels(index);
        self.tiles.remove_from_used(index);
        if put_on_empty {
            self.tiles.push_empty_front(index);
        }
    }

    /// Finds room for one tile record, recycling or evicting as needed.
    /// Returns `None` (and invalidates the cache) when every record is
    /// active in the current frame.
    fn create_tile(&mut self) -> Option<u32> {
        let mut index = self.tiles.pop_empty();
        if index == INVALID_TILE {
            if (self.tiles.records.len() as u32) < TILE_RECORD_LIMIT {
                self.tiles.records.push(TileRecord::new());
                index = (self.tiles.records.len() - 1) as u32;
            } else if self.tiles.inactive != INVALID_TILE {
                index = self.tiles.used.last;
                self.flush_tile(index, false);
            } else {
                self.invalidate();
                return None;
            }
        }
        self.tiles.push_used_front(index);
        self.tiles.active += 1;
        Some(index)
    }

    /// Evicts least-recently-used inactive tiles until one more tile fits
    /// the byte budget. Fails (invalidating the cache) when nothing more
    /// can be evicted.
    fn ensure_capacity(&mut self) -> bool {
        let bytes = self.tile_bytes();
        while self.cache_bytes + bytes > self.cache_limit {
            if self.tiles.inactive == INVALID_TILE {
                self.invalidate();
                return false;
            }
            let victim = self.tiles.used.last;
            self.flush_tile(victim, true);
        }
        true
    }

    /// Analyzes a freshly rasterized tile and stores it: fully transparent
    /// tiles store nothing; anything else uploads into the atlas.
    fn store_tile_pixels(&mut self, index: u32, raster: &Raster) {
        let mut or_bits = 0u32;
        let mut and_bits = u32::MAX;
        for &px in raster.pixels() {
            or_bits |= px;
            and_bits &= px;
        }

        if or_bits >> 24 == 0 {
            let record = &mut self.tiles.records[index as usize];
            record.content = TileContent::Transparent;
            record.alpha = 0;
            return;
        }

        if !self.ensure_capacity() {
            return;
        }
        let comp = self
            .compositor
            .as_deref_mut()
            .expect("tiling requires a compositor");
        match comp.allocate_tile(self.tile_size, raster.pixels(), raster.stride()) {
            Ok(handle) => {
                let bytes = self.tile_size * self.tile_size * 4;
                self.cache_bytes += bytes;
                let record = &mut self.tiles.records[index as usize];
                record.content = TileContent::Atlas(handle);
                record.alpha = if and_bits >> 24 == 255 { 255 } else { 127 };
            }
            Err(e) => {
                warn!("tile allocation failed: {e}");
                self.invalidate();
            }
        }
    }
}

impl Drop for TileCache {
    /// Destroying the cache releases the backend (and with it every atlas
    /// page) through the one permitted `cleanup` call.
    fn drop(&mut self) {
        if let Some(mut compositor) = self.compositor.take() {
            compositor.cleanup();
        }
    }
}

fn assert_valid_tile_size(tile_size: u32) {
    assert!(
        tile_size.is_power_of_two() && (16..=256).contains(&tile_size),
        "tile size {tile_size} must be a power of two in 16..=256"
    );
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One open frame: exists between [`TileCache::begin_frame`] and
/// [`Frame::end`]. The borrow it holds makes nested frames and forgotten
/// ends unrepresentable.
pub struct Frame<'c, 'f> {
    cache: &'c mut TileCache,
    frontiers: Vec<Frontier>,
    /// Old scenery id → this frame's id.
    scenery_map: Vec<u16>,
    /// This frame's scenery renderers; layer id is index + 1.
    scenery_renderers: Vec<Renderer<'f>>,
    sprite_renderers: BTreeMap<u32, Renderer<'f>>,
    scenery_pending: Vec<u32>,
    sprite_pending: Vec<u32>,
}

impl fmt::Debug for Frame<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("scenery_layers", &self.scenery_renderers.len())
            .field("sprite_layers", &self.sprite_renderers.len())
            .finish_non_exhaustive()
    }
}

impl<'c, 'f> Frame<'c, 'f> {
    /// Describes the next scenery layer, front to back, and returns the id
    /// to pass for this layer next frame (and to the scenery mutation
    /// calls until then).
    ///
    /// Cells fully covered by an opaque, full-opacity layer are emitted
    /// immediately and occlude everything deeper.
    pub fn render_scenery(&mut self, layer: SceneryLayer<'f>) -> u16 {
        if !self.cache.valid {
            return layer.id;
        }
        let mut old_id = layer.id;
        if self.cache.clean {
            old_id = 0;
        }
        if self.scenery_renderers.len() >= usize::from(u16::MAX) {
            self.cache.invalidate();
            return old_id;
        }

        self.scenery_renderers.push(layer.render);
        let new_id = self.scenery_renderers.len() as u16;
        if old_id != 0 {
            assert!(
                (old_id as usize) < self.scenery_map.len(),
                "unknown scenery layer id {old_id}"
            );
            self.scenery_map[old_id as usize] = new_id;
        }

        let ts = self.cache.tile_size as i32;
        let origin = (self.cache.viewport.x, self.cache.viewport.y);
        let shaped = layer.region.intersect(layer.clip);
        let affected = touched_cells(shaped, origin, ts, self.cache.tiles_across, self.cache.tiles_down);
        let covered = covered_cells(shaped, origin, ts, self.cache.tiles_across, self.cache.tiles_down);

        for y in affected.top..affected.bottom {
            for x in affected.left..affected.right {
                let fi = (y * self.cache.tiles_across + x) as usize;
                if self.frontiers[fi].is_occluded() {
                    continue;
                }
                let occludes = layer.is_opaque
                    && layer.opacity == 255
                    && y >= covered.top
                    && y < covered.bottom
                    && x >= covered.left
                    && x < covered.right;

                if self.frontiers[fi].is_empty() {
                    self.frontiers[fi].first = new_id;
                    self.frontiers[fi].old_first = old_id;
                }
                self.frontiers[fi].last = new_id;
                self.frontiers[fi].old_last = old_id;

                if occludes {
                    self.emit_scenery_tile(x, y, true);
                }
            }
        }

        new_id
    }

    /// Describes a sprite layer for this frame, front to back relative to
    /// the other `render_*` calls.
    ///
    /// Pending scenery beneath the sprite is emitted first; cached sprite
    /// tiles are reused at their (possibly scrolled) placement and only
    /// missing cells are scheduled for rasterization.
    pub fn render_sprite(&mut self, layer: SpriteLayer<'f>) {
        if !self.cache.valid {
            return;
        }
        let ts = self.cache.tile_size as i32;
        let across = self.cache.tiles_across;
        let down = self.cache.tiles_down;
        let viewport = self.cache.viewport;

        let tile_size = self.cache.tile_size;
        self.cache
            .sprites
            .entry(layer.id)
            .or_insert_with(|| Sprite::new(tile_size));
        self.sprite_renderers.insert(layer.id, layer.render);

        let visible = viewport.intersect(layer.region.intersect(layer.clip));
        if visible.is_empty() {
            return;
        }

        // Flush pending scenery ranges beneath the sprite.
        let affected = touched_cells(visible, (viewport.x, viewport.y), ts, across, down);
        for y in affected.top..affected.bottom {
            for x in affected.left..affected.right {
                let fi = (y * across + x) as usize;
                if self.frontiers[fi].is_occluded() || self.frontiers[fi].is_empty() {
                    continue;
                }
                self.emit_scenery_tile(x, y, false);
            }
        }

        // Required sprite tiles, in sprite tile coordinates.
        let sprite = &self.cache.sprites[&layer.id];
        let tile_rect = visible.offset(sprite.xorg - layer.region.x, sprite.yorg - layer.region.y);
        let mut visible_tiles = crate::geom::CellRect::new(
            tile_floor(tile_rect.x, ts),
            tile_floor(tile_rect.y, ts),
            tile_ceil(tile_rect.right(), ts),
            tile_ceil(tile_rect.bottom(), ts),
        );

        // Make the window cover them, relocating if needed.
        let expansion = self
            .cache
            .sprites
            .get_mut(&layer.id)
            .expect("sprite was just inserted")
            .expand(&mut visible_tiles);
        for &tile in &expansion.moved {
            let record = &mut self.cache.tiles.records[tile as usize];
            record.x += expansion.dx;
            record.y += expansion.dy;
        }
        for &tile in &expansion.fallen {
            self.cache.tiles.remove_from_used(tile);
            self.cache.tiles.push_dirty_front(tile);
        }
        let (xorg, yorg) = {
            let sprite = self.cache.sprites.get_mut(&layer.id).expect("sprite exists");
            sprite.xorg += expansion.dx * ts;
            sprite.yorg += expansion.dy * ts;
            (sprite.xorg, sprite.yorg)
        };

        let mut layer_begun = false;
        for y in visible_tiles.top..visible_tiles.bottom {
            // A sprite tile straddles at most two canvas cells per axis
            // (same edge length), so floor/ceil of its top edge name them
            // both.
            let row_top = layer.region.y + y * ts - yorg - viewport.y;
            let canvas_top = tile_floor(row_top, ts).clamp(0, down - 1);
            let canvas_bottom = tile_ceil(row_top, ts).clamp(0, down - 1);
            for x in visible_tiles.left..visible_tiles.right {
                let col_left = layer.region.x + x * ts - xorg - viewport.x;
                let canvas_left = tile_floor(col_left, ts).clamp(0, across - 1);
                let canvas_right = tile_ceil(col_left, ts).clamp(0, across - 1);

                let corners = [
                    (canvas_top, canvas_left),
                    (canvas_top, canvas_right),
                    (canvas_bottom, canvas_left),
                    (canvas_bottom, canvas_right),
                ];
                if corners
                    .iter()
                    .all(|&(cy, cx)| self.frontiers[(cy * across + cx) as usize].is_occluded())
                {
                    continue;
                }

                if !layer_begun {
                    // End marker first: the display list plays backwards.
                    self.cache.display_list.push(DisplayOp::LayerEnd);
                    layer_begun = true;
                }
                self.emit_sprite_tile(x, y, layer.id, layer.is_opaque);
            }
        }

        if layer_begun {
            let clip = layer
                .clip
                .intersect(layer.region)
                .offset(-viewport.x, -viewport.y);
            self.cache.display_list.push(DisplayOp::LayerBegin {
                origin: (
                    layer.region.x - viewport.x - xorg,
                    layer.region.y - viewport.y - yorg,
                ),
                clip,
                opacity: layer.opacity,
                blend: layer.blend,
            });
        }

        // A solid sprite occludes whatever it fully covers.
        if layer.is_opaque && layer.opacity == 255 {
            let inside = covered_cells(visible, (viewport.x, viewport.y), ts, across, down);
            for y in inside.top..inside.bottom {
                for x in inside.left..inside.right {
                    self.frontiers[(y * across + x) as usize].set_occluded();
                }
            }
        }
    }

    /// Ends the frame: rasterizes every scheduled tile (the tiling pass)
    /// and composites the display list onto `surface`.
    ///
    /// `dirty` names the surface region that must be repainted this frame.
    /// On failure the cache is invalid and must be flushed; a partially
    /// composited surface is acceptable and is repaired by the next
    /// successful frame.
    pub fn end(
        mut self,
        surface: &mut dyn RenderSurface,
        dirty: Rect32,
    ) -> Result<(), CompositorError> {
        // Un-occluded content still has to exist: emit every pending
        // frontier range. Appended last, these play first (back-most).
        for y in 0..self.cache.tiles_down {
            for x in 0..self.cache.tiles_across {
                let fi = (y * self.cache.tiles_across + x) as usize;
                let frontier = self.frontiers[fi];
                if !frontier.is_empty() && !frontier.is_occluded() {
                    self.emit_scenery_tile(x, y, false);
                }
            }
        }

        // Tiling pass. A batch opened on the backend is always closed,
        // even when the pass fails partway, so the backend's state machine
        // stays balanced.
        let mut tiling_open = false;
        if self.cache.valid {
            match self
                .cache
                .compositor
                .as_deref_mut()
                .expect("begin_frame checked the compositor")
                .begin_tiling(self.cache.tile_size)
            {
                Ok(()) => tiling_open = true,
                Err(e) => {
                    warn!("begin_tiling failed: {e}");
                    self.cache.invalidate();
                }
            }
        }
        if self.cache.valid {
            self.rasterize_sprite_tiles();
        }
        if self.cache.valid {
            self.remap_scenery_ids();
            self.rasterize_scenery_tiles();
        }
        if tiling_open
            && let Err(e) = self
                .cache
                .compositor
                .as_deref_mut()
                .expect("begin_frame checked the compositor")
                .end_tiling()
        {
            warn!("end_tiling failed: {e}");
            self.cache.invalidate();
        }

        self.cache.prev_scenery_count = self.scenery_renderers.len() as u16;
        self.cache.clean = false;

        debug!(
            "frame: {} sprite tiles, {} scenery tiles, {} active tiles, {} ops, {} bytes",
            self.sprite_pending.len(),
            self.scenery_pending.len(),
            self.cache.tiles.active,
            self.cache.display_list.len(),
            self.cache.cache_bytes,
        );

        if !self.cache.valid {
            return Err(CompositorError::CacheInvalid);
        }

        // Composite pass.
        let cache = &mut *self.cache;
        let comp = cache
            .compositor
            .as_deref_mut()
            .expect("begin_frame checked the compositor");
        if let Err(e) = comp.begin_frame(surface, dirty) {
            cache.valid = false;
            return Err(e);
        }
        let replayed = replay(
            &cache.display_list,
            &cache.tiles.records,
            cache.tile_size as i32,
            comp,
        );
        let ended = comp.end_frame(surface);
        let result = replayed.and(ended);
        if result.is_err() {
            cache.valid = false;
        }
        result
    }

    // -- Internals ----------------------------------------------------------

    /// Emits the pending scenery range at cell `(x, y)` into the display
    /// list, reusing a cached tile when the previous frame had the same
    /// range there, and updates the frontier to occluded or empty.
    fn emit_scenery_tile(&mut self, x: i32, y: i32, is_opaque: bool) {
        let fi = (y * self.cache.tiles_across + x) as usize;
        let frontier = self.frontiers[fi];

        let mut tile = INVALID_TILE;
        if frontier.old_first != 0 && frontier.old_last != 0 {
            let cell = &self.cache.cells[self.cache.cell_index(x, y)];
            for &candidate in cell {
                if let TileOwner::Scenery { first, last } =
                    self.cache.tiles.records[candidate as usize].owner
                    && first == frontier.old_first
                    && last == frontier.old_last
                {
                    tile = candidate;
                    break;
                }
            }
            if tile != INVALID_TILE {
                self.cache.tiles.touch(tile);
            }
        }

        if tile == INVALID_TILE {
            let Some(created) = self.cache.create_tile() else {
                return;
            };
            tile = created;
            let record = &mut self.cache.tiles.records[tile as usize];
            record.owner = TileOwner::Scenery {
                first: frontier.first,
                last: frontier.last,
            };
            record.x = x;
            record.y = y;
            record.alpha = if is_opaque { 255 } else { 127 };
            record.content = TileContent::Pending;
            self.scenery_pending.push(tile);
        }

        let alpha = self.cache.tiles.records[tile as usize].alpha;
        if alpha != 0 {
            self.cache.display_list.push(DisplayOp::Tile(tile));
        }
        if alpha == 255 {
            self.frontiers[fi].set_occluded();
        } else {
            self.frontiers[fi].set_empty();
        }
    }

    /// Reuses or schedules the sprite tile at window cell `(x, y)`.
    fn emit_sprite_tile(&mut self, x: i32, y: i32, key: u32, is_opaque: bool) {
        let sprite = &self.cache.sprites[&key];
        let mut tile = if sprite.contains(x, y) {
            sprite.cell(x, y)
        } else {
            INVALID_TILE
        };

        if tile != INVALID_TILE {
            self.cache.tiles.touch(tile);
        } else {
            let Some(created) = self.cache.create_tile() else {
                return;
            };
            tile = created;
            let record = &mut self.cache.tiles.records[tile as usize];
            record.owner = TileOwner::Sprite { key };
            record.x = x;
            record.y = y;
            record.alpha = if is_opaque { 255 } else { 127 };
            record.content = TileContent::Pending;
            self.sprite_pending.push(tile);
        }

        if self.cache.tiles.records[tile as usize].alpha != 0 {
            self.cache.display_list.push(DisplayOp::Tile(tile));
        }
    }

    /// Rasterizes every sprite tile scheduled this frame, one tile-sized
    /// canvas per cell, and files it in the sprite's window.
    fn rasterize_sprite_tiles(&mut self) {
        let ts = self.cache.tile_size as i32;
        let mut raster = Raster::new(ts, ts);
        for &tile in &self.sprite_pending {
            if !self.cache.valid {
                break;
            }
            let record = self.cache.tiles.records[tile as usize];
            let TileOwner::Sprite { key } = record.owner else {
                unreachable!("sprite_pending holds sprite tiles");
            };

            let (xorg, yorg) = {
                let sprite = &self.cache.sprites[&key];
                (sprite.xorg, sprite.yorg)
            };
            let region = Rect32::new(record.x * ts - xorg, record.y * ts - yorg, ts, ts);

            raster.clear();
            let renderer = self
                .sprite_renderers
                .get_mut(&key)
                .expect("renderer registered by render_sprite");
            let mut canvas = Canvas::new(&mut raster, (region.x, region.y));
            if !(renderer)(&mut canvas, region) {
                self.cache.invalidate();
                break;
            }

            self.cache
                .sprites
                .get_mut(&key)
                .expect("sprite exists")
                .set_cell(record.x, record.y, tile);
            self.cache.store_tile_pixels(tile, &raster);
        }
    }

    /// Rewrites every cell-resident scenery record's layer range from the
    /// previous frame's ids to this frame's; ranges whose layers were not
    /// described this frame map to 0 and will never match a lookup again.
    fn remap_scenery_ids(&mut self) {
        for cell in &self.cache.cells {
            for &tile in cell {
                let record = &mut self.cache.tiles.records[tile as usize];
                if let TileOwner::Scenery { first, last } = record.owner {
                    record.owner = TileOwner::Scenery {
                        first: self.scenery_map[first as usize],
                        last: self.scenery_map[last as usize],
                    };
                }
            }
        }
    }

    /// Rasterizes every scenery tile scheduled this frame: one tile-sized
    /// canvas per cell, painting the tile's layer range back to front.
    fn rasterize_scenery_tiles(&mut self) {
        let ts = self.cache.tile_size as i32;
        let viewport = self.cache.viewport;
        let mut raster = Raster::new(ts, ts);
        'tiles: for &tile in &self.scenery_pending {
            if !self.cache.valid {
                break;
            }
            let record = self.cache.tiles.records[tile as usize];
            let TileOwner::Scenery { first, last } = record.owner else {
                unreachable!("scenery_pending holds scenery tiles");
            };

            let region = Rect32::new(
                viewport.x + record.x * ts,
                viewport.y + record.y * ts,
                ts,
                ts,
            );
            raster.clear();
            // Layer ids grow front to back; paint deepest first.
            for layer in (first..=last).rev() {
                let renderer = &mut self.scenery_renderers[(layer - 1) as usize];
                let mut canvas = Canvas::new(&mut raster, (region.x, region.y));
                if !(renderer)(&mut canvas, region) {
                    self.cache.invalidate();
                    break 'tiles;
                }
            }

            let cell = self.cache.cell_index(record.x, record.y);
            self.cache.cells[cell].push(tile);
            self.cache.store_tile_pixels(tile, &raster);
        }
    }
}
