// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layer descriptors and the registry's internal structures.
//!
//! Two layer lifecycles exist:
//!
//! - **Scenery** layers form an ordered back-to-front sequence of large,
//!   rarely-resized background content. They are identified by per-frame
//!   sequence numbers handed out by
//!   [`Frame::render_scenery`](crate::cache::Frame::render_scenery); cached
//!   tiles may span a whole *range* of consecutive scenery layers.
//! - **Sprite** layers are keyed by an externally assigned id and keep a
//!   private window of cached tiles in sprite-content space, which lets
//!   [`scroll_sprite`](crate::cache::TileCache::scroll_sprite) translate
//!   cached tiles instead of re-rasterizing them.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::compositor::BlendMode;
use crate::geom::{CellRect, Rect32};
use crate::raster::Canvas;

/// A rasterization callback: paint exactly and only `region` into the
/// canvas, returning `false` to abort the tile build.
///
/// Scenery callbacks receive regions in surface coordinates; sprite
/// callbacks receive regions in sprite-content coordinates, where content
/// (0, 0) coincides with the layer region's top-left at the sprite's first
/// render and drifts with [`scroll_sprite`](crate::cache::TileCache::scroll_sprite).
pub type Renderer<'f> = &'f mut dyn FnMut(&mut Canvas<'_>, Rect32) -> bool;

/// One frame's description of a scenery layer.
pub struct SceneryLayer<'f> {
    /// The id returned for this layer by the previous frame's
    /// `render_scenery`, or 0 for a layer described for the first time
    /// (also after a flush, which invalidates every id).
    pub id: u16,
    /// The layer's rectangle in surface coordinates (tiling granularity).
    pub region: Rect32,
    /// Clip applied on top of `region`. Use [`Rect32::LARGEST`] for none.
    pub clip: Rect32,
    /// Whether the layer paints every pixel of its region. Opaque
    /// full-opacity layers occlude everything beneath them.
    pub is_opaque: bool,
    /// Layer opacity, 0–255.
    pub opacity: u8,
    /// How the layer combines with content beneath it.
    pub blend: BlendMode,
    /// Paints the layer's content on demand.
    pub render: Renderer<'f>,
}

impl fmt::Debug for SceneryLayer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneryLayer")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("is_opaque", &self.is_opaque)
            .field("opacity", &self.opacity)
            .finish_non_exhaustive()
    }
}

/// One frame's description of a sprite layer.
pub struct SpriteLayer<'f> {
    /// Externally assigned sprite id; the registry keys its sprite map on
    /// this value.
    pub id: u32,
    /// The layer's rectangle in surface coordinates.
    pub region: Rect32,
    /// Clip intersected with `region` at composite time.
    pub clip: Rect32,
    /// Whether the layer paints every pixel of its region.
    pub is_opaque: bool,
    /// Layer opacity, 0–255.
    pub opacity: u8,
    /// How the layer combines with content beneath it.
    pub blend: BlendMode,
    /// Paints the sprite's content on demand.
    pub render: Renderer<'f>,
}

impl fmt::Debug for SpriteLayer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpriteLayer")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("is_opaque", &self.is_opaque)
            .field("opacity", &self.opacity)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry internals
// ---------------------------------------------------------------------------

/// Per-cell occlusion state maintained while a frame's layers are described
/// front to back.
///
/// `first..=last` is the pending range of scenery layer ids (this frame's
/// numbering) not yet emitted as a tile; `old_first..=old_last` is the same
/// range in the previous frame's numbering, used to find a cached tile.
/// Two sentinel encodings exist: *empty* (no pending layers) and
/// *occluded* (an opaque tile capped the cell; nothing deeper can show).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Frontier {
    pub(crate) first: u16,
    pub(crate) last: u16,
    pub(crate) old_first: u16,
    pub(crate) old_last: u16,
}

impl Frontier {
    pub(crate) fn is_empty(self) -> bool {
        self.first == 0 && self.last == 0
    }

    pub(crate) fn is_occluded(self) -> bool {
        self.first == 0 && self.last == u16::MAX
    }

    pub(crate) fn set_empty(&mut self) {
        self.first = 0;
        self.last = 0;
    }

    pub(crate) fn set_occluded(&mut self) {
        self.first = 0;
        self.last = u16::MAX;
    }
}

/// Persistent sprite state: the window of cached tiles in sprite tile
/// coordinates plus the content origin that maps sprite content into that
/// window.
pub(crate) struct Sprite {
    /// Offset from sprite content (0, 0) to tile-space (0, 0), in pixels.
    pub(crate) xorg: i32,
    pub(crate) yorg: i32,
    /// Extent of the cached-tile window, in tile coordinates (kept within
    /// `0..=MAX_WINDOW` by relocation).
    pub(crate) window: CellRect,
    /// Tile record ids for the window, row-major; `INVALID_TILE` marks an
    /// uncached cell.
    pub(crate) tiles: Vec<u32>,
}

/// Sentinel for "no tile record" in cell and window grids.
pub(crate) const INVALID_TILE: u32 = u32::MAX;

/// Upper bound of sprite window coordinates before relocation kicks in.
pub(crate) const MAX_WINDOW: i32 = 255;

impl Sprite {
    /// A fresh sprite with content (0, 0) placed mid-window so it can
    /// scroll both ways before relocating.
    pub(crate) fn new(tile_size: u32) -> Self {
        let mid = if tile_size < 256 { 128 } else { 64 };
        let org = mid * tile_size as i32;
        Self {
            xorg: org,
            yorg: org,
            window: CellRect::new(0, 0, 0, 0),
            tiles: Vec::new(),
        }
    }

    pub(crate) fn window_width(&self) -> i32 {
        self.window.right - self.window.left
    }

    pub(crate) fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.window.left && x < self.window.right && y >= self.window.top && y < self.window.bottom
    }

    pub(crate) fn cell_index(&self, x: i32, y: i32) -> usize {
        debug_assert!(self.contains(x, y), "sprite cell ({x}, {y}) outside window");
        ((y - self.window.top) * self.window_width() + (x - self.window.left)) as usize
    }

    pub(crate) fn cell(&self, x: i32, y: i32) -> u32 {
        self.tiles[self.cell_index(x, y)]
    }

    pub(crate) fn set_cell(&mut self, x: i32, y: i32, tile: u32) {
        let index = self.cell_index(x, y);
        self.tiles[index] = tile;
    }

    /// Grows the window to cover `request` plus every occupied cell,
    /// relocating when the union would leave `0..=MAX_WINDOW`.
    ///
    /// The returned expansion reports the `(dx, dy)` shift applied to tile
    /// coordinates (the caller must shift surviving tile records and the
    /// content origin accordingly) and any tiles that fell off the window
    /// (the caller must dirty them). `request` is shifted in place.
    pub(crate) fn expand(&mut self, request: &mut CellRect) -> SpriteExpansion {
        let mut new_rect = *request;
        for y in self.window.top..self.window.bottom {
            for x in self.window.left..self.window.right {
                if self.cell(x, y) != INVALID_TILE {
                    new_rect.include(x, y);
                }
            }
        }

        if new_rect == self.window {
            return SpriteExpansion::default();
        }

        // Any overflow past the allowed window comes from `request`, which
        // is never larger than the viewport in tiles, so a single shift
        // always fits.
        let dx = if new_rect.left < 0 {
            let dx = -new_rect.left;
            new_rect.left = 0;
            new_rect.right = (new_rect.right + dx).min(MAX_WINDOW);
            dx
        } else if new_rect.right > MAX_WINDOW {
            let dx = MAX_WINDOW - new_rect.right;
            new_rect.left = (new_rect.left + dx).max(0);
            new_rect.right = MAX_WINDOW;
            dx
        } else {
            0
        };

        let dy = if new_rect.top < 0 {
            let dy = -new_rect.top;
            new_rect.top = 0;
            new_rect.bottom = (new_rect.bottom + dy).min(MAX_WINDOW);
            dy
        } else if new_rect.bottom > MAX_WINDOW {
            let dy = MAX_WINDOW - new_rect.bottom;
            new_rect.top = (new_rect.top + dy).max(0);
            new_rect.bottom = MAX_WINDOW;
            dy
        } else {
            0
        };

        let new_w = new_rect.right - new_rect.left;
        let new_h = new_rect.bottom - new_rect.top;
        let mut new_tiles = vec![INVALID_TILE; (new_w * new_h) as usize];
        let mut expansion = SpriteExpansion {
            dx,
            dy,
            ..SpriteExpansion::default()
        };

        let old_window = self.window;
        for y in old_window.top..old_window.bottom {
            for x in old_window.left..old_window.right {
                let tile = self.cell(x, y);
                if tile == INVALID_TILE {
                    continue;
                }
                let (nx, ny) = (x + dx, y + dy);
                if nx >= new_rect.left
                    && nx < new_rect.right
                    && ny >= new_rect.top
                    && ny < new_rect.bottom
                {
                    new_tiles[((ny - new_rect.top) * new_w + (nx - new_rect.left)) as usize] = tile;
                    if dx != 0 || dy != 0 {
                        expansion.moved.push(tile);
                    }
                } else {
                    expansion.fallen.push(tile);
                }
            }
        }

        self.window = new_rect;
        self.tiles = new_tiles;
        request.left += dx;
        request.top += dy;
        request.right += dx;
        request.bottom += dy;
        expansion
    }
}

/// Outcome of [`Sprite::expand`].
#[derive(Debug, Default)]
pub(crate) struct SpriteExpansion {
    /// Tile-coordinate shift applied by relocation.
    pub(crate) dx: i32,
    pub(crate) dy: i32,
    /// Surviving tile records whose `(x, y)` must shift by `(dx, dy)`.
    pub(crate) moved: Vec<u32>,
    /// Tile records that left the window and must be dirtied.
    pub(crate) fallen: Vec<u32>,
}

impl fmt::Debug for Sprite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sprite")
            .field("xorg", &self.xorg)
            .field("yorg", &self.yorg)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_sentinels_are_distinct() {
        let mut f = Frontier::default();
        assert!(f.is_empty());
        assert!(!f.is_occluded());
        f.set_occluded();
        assert!(f.is_occluded());
        assert!(!f.is_empty());
        f.set_empty();
        assert!(f.is_empty());
    }

    #[test]
    fn fresh_sprite_window_grows_to_the_request() {
        let mut sprite = Sprite::new(32);
        let mut request = CellRect::new(128, 128, 130, 129);
        let expansion = sprite.expand(&mut request);
        assert_eq!((expansion.dx, expansion.dy), (0, 0));
        assert!(expansion.moved.is_empty());
        assert!(expansion.fallen.is_empty());
        assert_eq!(sprite.window, CellRect::new(128, 128, 130, 129));
        assert_eq!(request, CellRect::new(128, 128, 130, 129));
        assert_eq!(sprite.cell(128, 128), INVALID_TILE);
    }

    #[test]
    fn expansion_unions_occupied_cells() {
        let mut sprite = Sprite::new(32);
        let mut request = CellRect::new(128, 128, 129, 129);
        let _ = sprite.expand(&mut request);
        sprite.set_cell(128, 128, 7);

        let mut request = CellRect::new(130, 128, 131, 129);
        let expansion = sprite.expand(&mut request);
        assert_eq!((expansion.dx, expansion.dy), (0, 0));
        assert_eq!(sprite.window, CellRect::new(128, 128, 131, 129));
        assert_eq!(sprite.cell(128, 128), 7, "occupied cell survives growth");
        assert_eq!(sprite.cell(130, 128), INVALID_TILE);
    }

    #[test]
    fn overflow_past_the_window_limit_relocates() {
        let mut sprite = Sprite::new(32);
        let mut request = CellRect::new(254, 0, 255, 1);
        let _ = sprite.expand(&mut request);
        sprite.set_cell(254, 0, 3);

        // Requesting past the right edge shifts everything left.
        let mut request = CellRect::new(255, 0, 257, 1);
        let expansion = sprite.expand(&mut request);
        assert_eq!(expansion.dx, -2);
        assert_eq!(expansion.moved, vec![3]);
        assert!(expansion.fallen.is_empty());
        assert_eq!(request, CellRect::new(253, 0, 255, 1));
        assert_eq!(sprite.cell(252, 0), 3, "survivor shifted with the window");
    }

    #[test]
    fn tiles_falling_off_the_window_are_reported() {
        let mut sprite = Sprite::new(32);
        let mut request = CellRect::new(0, 0, 2, 1);
        let _ = sprite.expand(&mut request);
        sprite.set_cell(0, 0, 11);
        sprite.set_cell(1, 0, 12);

        // A request pushing past the left edge shifts right; with the
        // window pinned at the limit, whatever no longer fits falls off.
        let mut request = CellRect::new(-255, 0, 1, 1);
        let expansion = sprite.expand(&mut request);
        assert_eq!(expansion.dx, 255);
        assert!(
            expansion.fallen.contains(&12),
            "cell pushed past the limit must be dropped: {expansion:?}"
        );
    }
}
