// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The compositor backend contract.
//!
//! A [`Compositor`] is the pluggable engine behind a
//! [`TileCache`](crate::cache::TileCache): it owns the atlas textures and
//! implements the tiling-pass hooks (`begin_tiling` / `allocate_tile` /
//! `deallocate_tile` / `end_tiling`) and the per-frame compositing hooks
//! (`begin_frame` / `begin_layer` / `composite_tile` / `composite_rect` /
//! `end_layer` / `end_frame`), plus the offscreen snapshot pair.
//!
//! # State machine
//!
//! Each instance moves between three mutually exclusive active states from
//! an idle resting state: a tiling batch, an open frame, or an open
//! snapshot. Layers nest exactly one deep inside a frame or snapshot.
//! Violations are programmer errors and panic via [`Phase`]; letting them
//! slide would corrupt atlas state.

use alloc::boxed::Box;
use core::fmt;

use kurbo::Affine;

use crate::atlas::{AtlasStats, TileHandle};
use crate::color::PackedColor;
use crate::geom::Rect32;
use crate::raster::Raster;
use crate::surface::RenderSurface;

/// Which compositor backend a cache runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompositorKind {
    /// No backend installed; every frame is rejected.
    #[default]
    None,
    /// The pure-software backend.
    Software,
    /// The vector-graphics backend.
    Vector,
    /// The hardware-accelerated backend.
    HardwareAccelerated,
}

/// How a layer's pixels combine with the pixels beneath it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Draw nothing at all (the layer is skipped via an empty scissor).
    Noop,
    /// Replace destination pixels.
    Copy,
    /// Premultiplied source-over.
    #[default]
    SrcOver,
}

/// Failures reported by backend operations.
///
/// Any of these aborts the current frame or tiling pass and poisons the
/// owning cache's validity; recovery is an explicit
/// [`flush`](crate::cache::TileCache::flush).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositorError {
    /// A page texture could not be created.
    TextureCreation,
    /// A tile upload into a page texture failed.
    TextureUpload,
    /// The render target could not be acquired (e.g. already locked).
    TargetLock,
    /// The device reported an error while drawing or presenting.
    Device,
    /// A composite call referenced a stale or unknown tile handle.
    StaleTile,
    /// The cache is invalid and must be flushed before the next frame.
    CacheInvalid,
    /// No compositor backend is installed.
    NoCompositor,
}

impl fmt::Display for CompositorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::TextureCreation => "atlas page texture creation failed",
            Self::TextureUpload => "tile upload failed",
            Self::TargetLock => "render target could not be acquired",
            Self::Device => "device error",
            Self::StaleTile => "stale tile handle",
            Self::CacheInvalid => "tile cache is invalid; flush it first",
            Self::NoCompositor => "no compositor installed",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for CompositorError {}

/// The pluggable compositor backend.
///
/// One instance exclusively owns its device handle and atlas pages; no two
/// caches share backend state. All methods run synchronously on the calling
/// thread.
pub trait Compositor {
    /// Which backend family this is.
    fn kind(&self) -> CompositorKind;

    /// Occupancy of the backend's tile storage, when it has pages to
    /// report. Diagnostics only; the default reports nothing.
    fn atlas_stats(&self) -> Option<AtlasStats> {
        None
    }

    /// Releases every backend-owned resource. Called exactly once, before
    /// the backend is dropped or replaced; never re-entrant.
    fn cleanup(&mut self);

    /// Requests a full atlas invalidation at the next `begin_tiling`.
    fn flush(&mut self);

    /// Opens a tiling batch at the given tile size (recomputing the atlas
    /// arity; see [`crate::atlas::AtlasSet::begin_tiling`]).
    fn begin_tiling(&mut self, tile_size: u32) -> Result<(), CompositorError>;

    /// Closes a tiling batch, reaping empty pages. Returns `Err` if any
    /// device error accumulated during the batch.
    fn end_tiling(&mut self) -> Result<(), CompositorError>;

    /// Uploads one `size` x `size` tile (`stride_px` pixels per source row)
    /// into a free atlas slot. On failure no tile exists and no partial
    /// handle is returned.
    fn allocate_tile(
        &mut self,
        size: u32,
        pixels: &[u32],
        stride_px: usize,
    ) -> Result<TileHandle, CompositorError>;

    /// Returns a tile's slot to its page. The backing texture survives
    /// until `end_tiling` so in-flight draws stay valid.
    fn deallocate_tile(&mut self, tile: TileHandle);

    /// Acquires the render target and resets per-frame transform and blend
    /// state. Fails if the target cannot be locked.
    fn begin_frame(
        &mut self,
        surface: &mut dyn RenderSurface,
        dirty: Rect32,
    ) -> Result<(), CompositorError>;

    /// Flushes all pending batches, releases the target, and reports any
    /// accumulated device error.
    fn end_frame(&mut self, surface: &mut dyn RenderSurface) -> Result<(), CompositorError>;

    /// Flushes pending batches, then scissors to `clip` (empty for
    /// [`BlendMode::Noop`]), enables blending, and sets the layer opacity.
    fn begin_layer(
        &mut self,
        clip: Rect32,
        opacity: u8,
        blend: BlendMode,
    ) -> Result<(), CompositorError>;

    /// Flushes pending batches, disables the scissor, restores full
    /// opacity.
    fn end_layer(&mut self) -> Result<(), CompositorError>;

    /// Queues one cached tile at `(x, y)` in content coordinates. Must fail
    /// without side effects when `tile` is stale.
    fn composite_tile(&mut self, x: i32, y: i32, tile: TileHandle) -> Result<(), CompositorError>;

    /// Queues one flat tile-sized rect at `(x, y)`; `color` is stored
    /// premultiplied by the current layer opacity
    /// ([`crate::color::scale_bounded`]).
    fn composite_rect(&mut self, x: i32, y: i32, color: PackedColor)
    -> Result<(), CompositorError>;

    /// Redirects the frame pipeline into an offscreen target sized like
    /// `area`, with `area`'s origin mapped to (0, 0) and no vertical flip.
    /// On failure every partially acquired resource is released.
    fn begin_snapshot(&mut self, area: Rect32, target: &mut Raster)
    -> Result<(), CompositorError>;

    /// Reads the offscreen pixels back into `target`, releases the
    /// offscreen resources, and restores the previous target binding.
    fn end_snapshot(&mut self, area: Rect32, target: &mut Raster) -> Result<(), CompositorError>;
}

/// Constructs backends keyed on [`CompositorKind`].
///
/// The cache owns one factory for its lifetime;
/// [`set_compositor`](crate::cache::TileCache::set_compositor) tears down
/// the previous backend and asks the factory for the next one. Returning
/// `None` means the kind is unsupported on this platform.
pub trait CompositorFactory {
    /// Creates a backend of the requested kind, or `None` if unsupported.
    fn create(&self, kind: CompositorKind) -> Option<Box<dyn Compositor>>;
}

// ---------------------------------------------------------------------------
// Phase state machine
// ---------------------------------------------------------------------------

/// Backend lifecycle state, shared by every backend implementation so the
/// begin/end pairing rules of the contract are enforced uniformly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// No batch, frame, or snapshot open.
    #[default]
    Idle,
    /// Inside `begin_tiling` / `end_tiling`.
    Tiling,
    /// Inside `begin_frame` / `end_frame`; the flag is `true` inside an
    /// open layer.
    Frame(bool),
    /// Inside `begin_snapshot` / `end_snapshot`; the flag is `true` inside
    /// an open layer.
    Snapshot(bool),
}

impl Phase {
    /// Enters the tiling state.
    ///
    /// # Panics
    ///
    /// Panics unless idle (no tiling while a frame or snapshot is open).
    pub fn begin_tiling(&mut self) {
        assert!(*self == Self::Idle, "begin_tiling while {self:?}");
        *self = Self::Tiling;
    }

    /// Leaves the tiling state.
    ///
    /// # Panics
    ///
    /// Panics unless tiling.
    pub fn end_tiling(&mut self) {
        assert!(*self == Self::Tiling, "end_tiling while {self:?}");
        *self = Self::Idle;
    }

    /// Enters the frame state.
    ///
    /// # Panics
    ///
    /// Panics unless idle (frames never nest and never overlap snapshots).
    pub fn begin_frame(&mut self) {
        assert!(*self == Self::Idle, "begin_frame while {self:?}");
        *self = Self::Frame(false);
    }

    /// Leaves the frame state.
    ///
    /// # Panics
    ///
    /// Panics unless in a frame with no layer open.
    pub fn end_frame(&mut self) {
        assert!(*self == Self::Frame(false), "end_frame while {self:?}");
        *self = Self::Idle;
    }

    /// Enters the snapshot state.
    ///
    /// # Panics
    ///
    /// Panics unless idle (snapshots must not overlap frames).
    pub fn begin_snapshot(&mut self) {
        assert!(*self == Self::Idle, "begin_snapshot while {self:?}");
        *self = Self::Snapshot(false);
    }

    /// Leaves the snapshot state.
    ///
    /// # Panics
    ///
    /// Panics unless in a snapshot with no layer open.
    pub fn end_snapshot(&mut self) {
        assert!(*self == Self::Snapshot(false), "end_snapshot while {self:?}");
        *self = Self::Idle;
    }

    /// Opens a layer inside the current frame or snapshot.
    ///
    /// # Panics
    ///
    /// Panics outside a frame/snapshot or if a layer is already open
    /// (layers nest exactly one deep).
    pub fn begin_layer(&mut self) {
        match self {
            Self::Frame(open @ false) | Self::Snapshot(open @ false) => *open = true,
            _ => panic!("begin_layer while {self:?}"),
        }
    }

    /// Closes the open layer.
    ///
    /// # Panics
    ///
    /// Panics if no layer is open.
    pub fn end_layer(&mut self) {
        match self {
            Self::Frame(open @ true) | Self::Snapshot(open @ true) => *open = false,
            _ => panic!("end_layer while {self:?}"),
        }
    }

    /// Returns `true` while a frame or snapshot (at any layer depth) is
    /// open.
    #[must_use]
    pub const fn rendering(&self) -> bool {
        matches!(self, Self::Frame(_) | Self::Snapshot(_))
    }
}

// ---------------------------------------------------------------------------
// Frame transform
// ---------------------------------------------------------------------------

/// The world-transform setup shared by the live-surface and snapshot paths.
///
/// The two paths differ only in the origin translation and the vertical
/// flip flag, never in any other step, so they cannot silently diverge.
/// `flip_y` is set on the live path when the device's origin is bottom-left
/// (classic GL surfaces); raster and wgpu targets are top-down and run
/// unflipped. The snapshot path never flips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameTransform {
    /// Content-space translation applied before the flip.
    pub origin: (i32, i32),
    /// Target height in pixels, used by the flip and by scissor mapping.
    pub target_height: i32,
    /// Whether content y is mirrored into a bottom-up device space.
    pub flip_y: bool,
}

impl FrameTransform {
    /// Transform for rendering to the live surface.
    #[must_use]
    pub const fn live(target_height: i32, device_bottom_up: bool) -> Self {
        Self {
            origin: (0, 0),
            target_height,
            flip_y: device_bottom_up,
        }
    }

    /// Transform for rendering `area` into an offscreen snapshot target:
    /// `area`'s origin maps to (0, 0), no flip.
    #[must_use]
    pub const fn snapshot(area: Rect32) -> Self {
        Self {
            origin: (-area.x, -area.y),
            target_height: area.height,
            flip_y: false,
        }
    }

    /// The equivalent affine map from content space to device space.
    #[must_use]
    pub fn to_affine(&self) -> Affine {
        let translated = Affine::translate((f64::from(self.origin.0), f64::from(self.origin.1)));
        if self.flip_y {
            Affine::translate((0.0, f64::from(self.target_height))) * Affine::FLIP_Y * translated
        } else {
            translated
        }
    }

    /// Maps a content-space point to device space in integer arithmetic.
    #[must_use]
    pub const fn apply(&self, x: i32, y: i32) -> (i32, i32) {
        let tx = x + self.origin.0;
        let ty = y + self.origin.1;
        if self.flip_y {
            (tx, self.target_height - ty)
        } else {
            (tx, ty)
        }
    }

    /// Maps a content-space clip rectangle to a device-space scissor box.
    #[must_use]
    pub const fn device_clip(&self, clip: Rect32) -> Rect32 {
        let x = clip.x + self.origin.0;
        if self.flip_y {
            Rect32::new(
                x,
                self.target_height - (clip.y + clip.height) + self.origin.1,
                clip.width,
                clip.height,
            )
        } else {
            Rect32::new(x, clip.y + self.origin.1, clip.width, clip.height)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_happy_path() {
        let mut p = Phase::default();
        p.begin_tiling();
        p.end_tiling();
        p.begin_frame();
        p.begin_layer();
        p.end_layer();
        p.begin_layer();
        p.end_layer();
        p.end_frame();
        p.begin_snapshot();
        p.begin_layer();
        p.end_layer();
        p.end_snapshot();
        assert_eq!(p, Phase::Idle);
    }

    #[test]
    #[should_panic(expected = "begin_tiling while Frame")]
    fn tiling_inside_frame_panics() {
        let mut p = Phase::default();
        p.begin_frame();
        p.begin_tiling();
    }

    #[test]
    #[should_panic(expected = "begin_frame while Frame")]
    fn nested_frames_panic() {
        let mut p = Phase::default();
        p.begin_frame();
        p.begin_frame();
    }

    #[test]
    #[should_panic(expected = "begin_snapshot while Frame")]
    fn snapshot_inside_frame_panics() {
        let mut p = Phase::default();
        p.begin_frame();
        p.begin_snapshot();
    }

    #[test]
    #[should_panic(expected = "begin_layer while Frame(true)")]
    fn layers_nest_exactly_one_deep() {
        let mut p = Phase::default();
        p.begin_frame();
        p.begin_layer();
        p.begin_layer();
    }

    #[test]
    #[should_panic(expected = "end_frame while Frame(true)")]
    fn ending_frame_with_open_layer_panics() {
        let mut p = Phase::default();
        p.begin_frame();
        p.begin_layer();
        p.end_frame();
    }

    #[test]
    fn live_transform_top_down_is_identity() {
        let t = FrameTransform::live(480, false);
        assert_eq!(t.apply(10, 20), (10, 20));
        assert_eq!(t.device_clip(Rect32::new(5, 6, 7, 8)), Rect32::new(5, 6, 7, 8));
    }

    #[test]
    fn live_transform_bottom_up_flips() {
        let t = FrameTransform::live(480, true);
        assert_eq!(t.apply(10, 20), (10, 460));
        // The scissor box flips around the target height.
        assert_eq!(
            t.device_clip(Rect32::new(0, 100, 50, 30)),
            Rect32::new(0, 350, 50, 30)
        );
    }

    #[test]
    fn snapshot_transform_translates_without_flip() {
        let t = FrameTransform::snapshot(Rect32::new(30, 40, 100, 50));
        assert_eq!(t.apply(30, 40), (0, 0));
        assert_eq!(t.apply(50, 60), (20, 20));
        assert!(!t.flip_y);
    }

    #[test]
    fn affine_agrees_with_integer_map() {
        for t in [
            FrameTransform::live(480, false),
            FrameTransform::live(480, true),
            FrameTransform::snapshot(Rect32::new(-16, 8, 64, 64)),
        ] {
            let p = t.to_affine() * kurbo::Point::new(12.0, 34.0);
            let (x, y) = t.apply(12, 34);
            assert_eq!((p.x as i32, p.y as i32), (x, y), "{t:?}");
        }
    }
}
