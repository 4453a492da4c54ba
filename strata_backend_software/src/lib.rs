// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pure-software compositor backend.
//!
//! Atlas pages are plain heap pixel buffers; compositing is immediate-mode
//! per-pixel premultiplied blending into a working framebuffer that is
//! blitted to the locked [`Raster`] target when the frame ends. No draw
//! batching happens here; with no draw-call cost to amortize, the batching
//! machinery of the hardware backend would buy nothing.
//!
//! The live path and the snapshot path share one [`FrameTransform`]-driven
//! compositing routine; the snapshot path renders into a private buffer
//! translated to the snapshot area and never touches the live target or
//! the atlas.

use log::warn;

use strata_core::atlas::{AtlasSet, TextureStore, TileHandle};
use strata_core::color::{PackedColor, blend_src_over, scale_bounded};
use strata_core::compositor::{
    BlendMode, Compositor, CompositorError, CompositorFactory, CompositorKind, FrameTransform,
    Phase,
};
use strata_core::geom::Rect32;
use strata_core::raster::Raster;
use strata_core::surface::{RenderSurface, TargetKind};

/// One CPU atlas page: a tightly packed `edge` x `edge` pixel buffer.
#[derive(Debug)]
pub struct CpuTexture {
    edge: u32,
    pixels: Vec<u32>,
}

/// [`TextureStore`] over heap pixel buffers.
#[derive(Debug, Default)]
pub struct CpuTextures;

impl TextureStore for CpuTextures {
    type Texture = CpuTexture;

    fn create_texture(&mut self, edge: u32) -> Result<CpuTexture, CompositorError> {
        Ok(CpuTexture {
            edge,
            pixels: vec![0; (edge * edge) as usize],
        })
    }

    fn upload(
        &mut self,
        texture: &mut CpuTexture,
        x: u32,
        y: u32,
        size: u32,
        pixels: &[u32],
    ) -> Result<(), CompositorError> {
        if x + size > texture.edge || y + size > texture.edge {
            return Err(CompositorError::TextureUpload);
        }
        let edge = texture.edge as usize;
        for row in 0..size as usize {
            let dst = (y as usize + row) * edge + x as usize;
            let src = row * size as usize;
            texture.pixels[dst..dst + size as usize]
                .copy_from_slice(&pixels[src..src + size as usize]);
        }
        Ok(())
    }

    fn delete_texture(&mut self, _texture: CpuTexture) {}
}

/// Per-frame drawing state, reset by `begin_frame`/`begin_snapshot`.
#[derive(Debug)]
struct FrameState {
    transform: FrameTransform,
    /// Device-space scissor; `None` outside layers.
    scissor: Option<Rect32>,
    /// Device-space region the caller asked to repaint.
    dirty: Rect32,
    opacity: u8,
    blend: BlendMode,
    framebuffer: Raster,
}

impl FrameState {
    fn new(transform: FrameTransform, dirty: Rect32, framebuffer: Raster) -> Self {
        Self {
            transform,
            scissor: None,
            dirty,
            opacity: 255,
            blend: BlendMode::SrcOver,
            framebuffer,
        }
    }

    /// The device-space rectangle draws are currently limited to.
    fn draw_bounds(&self) -> Rect32 {
        let bounds = Rect32::new(0, 0, self.framebuffer.width(), self.framebuffer.height());
        let bounds = bounds.intersect(self.dirty);
        match self.scissor {
            Some(scissor) => bounds.intersect(scissor),
            None => bounds,
        }
    }
}

/// The pure-software [`Compositor`].
#[derive(Debug, Default)]
pub struct SoftwareCompositor {
    store: CpuTextures,
    atlas: AtlasSet<CpuTextures>,
    phase: Phase,
    tile_size: u32,
    frame: Option<FrameState>,
    /// Area of the open snapshot, checked against `end_snapshot`.
    snapshot_area: Rect32,
}

impl SoftwareCompositor {
    /// Creates an empty software compositor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blends one `size`-pixel-square source (any provider of pixels by
    /// local coordinate) into the framebuffer at content position
    /// `(x, y)`, honoring transform, scissor, dirty region, layer opacity,
    /// and blend mode.
    fn draw_square(&mut self, x: i32, y: i32, size: i32, src: impl Fn(i32, i32) -> PackedColor) {
        let frame = self.frame.as_mut().expect("drawing requires an open frame");
        if frame.blend == BlendMode::Noop {
            return;
        }
        let (dx, dy) = frame.transform.apply(x, y);
        let dest = Rect32::new(dx, dy, size, size).intersect(frame.draw_bounds());
        if dest.is_empty() {
            return;
        }
        let opacity = frame.opacity;
        let blend = frame.blend;
        for py in dest.y..dest.bottom() {
            for px in dest.x..dest.right() {
                let s = src(px - dx, py - dy);
                let s = scale_bounded(s, opacity);
                let out = match blend {
                    BlendMode::SrcOver => blend_src_over(frame.framebuffer.pixel(px, py), s),
                    BlendMode::Copy => s,
                    BlendMode::Noop => unreachable!("noop returned above"),
                };
                let stride = frame.framebuffer.stride();
                frame.framebuffer.pixels_mut()[py as usize * stride + px as usize] = out.0;
            }
        }
    }
}

impl Compositor for SoftwareCompositor {
    fn kind(&self) -> CompositorKind {
        CompositorKind::Software
    }

    fn atlas_stats(&self) -> Option<strata_core::atlas::AtlasStats> {
        Some(self.atlas.stats())
    }

    fn cleanup(&mut self) {
        let Self { store, atlas, .. } = self;
        atlas.cleanup(store);
        self.frame = None;
        self.phase = Phase::Idle;
    }

    fn flush(&mut self) {
        self.atlas.flush();
    }

    fn begin_tiling(&mut self, tile_size: u32) -> Result<(), CompositorError> {
        self.phase.begin_tiling();
        self.tile_size = tile_size;
        let Self { store, atlas, .. } = self;
        atlas.begin_tiling(store, tile_size);
        Ok(())
    }

    fn end_tiling(&mut self) -> Result<(), CompositorError> {
        self.phase.end_tiling();
        let Self { store, atlas, .. } = self;
        atlas.end_tiling(store);
        Ok(())
    }

    fn allocate_tile(
        &mut self,
        size: u32,
        pixels: &[u32],
        stride_px: usize,
    ) -> Result<TileHandle, CompositorError> {
        debug_assert_eq!(size, self.tile_size, "tile size changed mid-batch");
        let Self { store, atlas, .. } = self;
        atlas.allocate(store, pixels, stride_px)
    }

    fn deallocate_tile(&mut self, tile: TileHandle) {
        self.atlas.deallocate(tile);
    }

    fn begin_frame(
        &mut self,
        surface: &mut dyn RenderSurface,
        dirty: Rect32,
    ) -> Result<(), CompositorError> {
        // Seed the working buffer with the current contents so draws
        // outside the dirty region keep last frame's pixels.
        let framebuffer = match surface.lock_target(TargetKind::Raster) {
            None => return Err(CompositorError::TargetLock),
            Some(any) => any.downcast_mut::<Raster>().map(|target| target.clone()),
        };
        surface.unlock_target();
        let Some(framebuffer) = framebuffer else {
            return Err(CompositorError::TargetLock);
        };

        self.phase.begin_frame();
        let transform = FrameTransform::live(framebuffer.height(), false);
        self.frame = Some(FrameState::new(transform, dirty, framebuffer));
        Ok(())
    }

    fn end_frame(&mut self, surface: &mut dyn RenderSurface) -> Result<(), CompositorError> {
        self.phase.end_frame();
        let frame = self.frame.take().expect("end_frame without begin_frame");

        let result = match surface.lock_target(TargetKind::Raster) {
            None => return Err(CompositorError::TargetLock),
            Some(any) => match any.downcast_mut::<Raster>() {
                Some(target) if target.pixels().len() == frame.framebuffer.pixels().len() => {
                    target
                        .pixels_mut()
                        .copy_from_slice(frame.framebuffer.pixels());
                    Ok(())
                }
                Some(_) => {
                    warn!("surface resized mid-frame");
                    Err(CompositorError::Device)
                }
                None => Err(CompositorError::TargetLock),
            },
        };
        surface.unlock_target();
        result
    }

    fn begin_layer(
        &mut self,
        clip: Rect32,
        opacity: u8,
        blend: BlendMode,
    ) -> Result<(), CompositorError> {
        self.phase.begin_layer();
        let frame = self.frame.as_mut().expect("begin_layer requires a frame");
        frame.scissor = if blend == BlendMode::Noop {
            // Nothing of this layer may reach the target.
            Some(Rect32::EMPTY)
        } else {
            Some(frame.transform.device_clip(clip))
        };
        frame.opacity = opacity;
        frame.blend = blend;
        Ok(())
    }

    fn end_layer(&mut self) -> Result<(), CompositorError> {
        self.phase.end_layer();
        let frame = self.frame.as_mut().expect("end_layer requires a frame");
        frame.scissor = None;
        frame.opacity = 255;
        frame.blend = BlendMode::SrcOver;
        Ok(())
    }

    fn composite_tile(&mut self, x: i32, y: i32, tile: TileHandle) -> Result<(), CompositorError> {
        assert!(self.phase.rendering(), "composite_tile outside a frame");
        let Some(texture) = self.atlas.texture(tile) else {
            return Err(CompositorError::StaleTile);
        };
        let (sx, sy) = self.atlas.slot_origin(tile);
        let edge = texture.edge as usize;
        let base = sy as usize * edge + sx as usize;
        let size = self.tile_size as i32;

        // Copy the slot out so the framebuffer can be borrowed mutably.
        let mut slot = vec![0u32; (size * size) as usize];
        for row in 0..size as usize {
            let src = base + row * edge;
            slot[row * size as usize..(row + 1) * size as usize]
                .copy_from_slice(&texture.pixels[src..src + size as usize]);
        }

        self.draw_square(x, y, size, |lx, ly| {
            PackedColor(slot[(ly * size + lx) as usize])
        });
        Ok(())
    }

    fn composite_rect(
        &mut self,
        x: i32,
        y: i32,
        color: PackedColor,
    ) -> Result<(), CompositorError> {
        assert!(self.phase.rendering(), "composite_rect outside a frame");
        let size = self.tile_size as i32;
        self.draw_square(x, y, size, |_, _| color);
        Ok(())
    }

    fn begin_snapshot(
        &mut self,
        area: Rect32,
        _target: &mut Raster,
    ) -> Result<(), CompositorError> {
        if area.is_empty() {
            return Err(CompositorError::Device);
        }
        self.phase.begin_snapshot();
        self.snapshot_area = area;
        let transform = FrameTransform::snapshot(area);
        let framebuffer = Raster::new(area.width, area.height);
        let dirty = Rect32::new(0, 0, area.width, area.height);
        self.frame = Some(FrameState::new(transform, dirty, framebuffer));
        Ok(())
    }

    fn end_snapshot(&mut self, area: Rect32, target: &mut Raster) -> Result<(), CompositorError> {
        self.phase.end_snapshot();
        let frame = self.frame.take().expect("end_snapshot without begin_snapshot");
        debug_assert_eq!(area, self.snapshot_area, "snapshot area changed");
        if target.pixels().len() != frame.framebuffer.pixels().len() {
            return Err(CompositorError::Device);
        }
        target
            .pixels_mut()
            .copy_from_slice(frame.framebuffer.pixels());
        Ok(())
    }
}

/// Factory producing [`SoftwareCompositor`]s for
/// [`CompositorKind::Software`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareFactory;

impl CompositorFactory for SoftwareFactory {
    fn create(&self, kind: CompositorKind) -> Option<Box<dyn Compositor>> {
        match kind {
            CompositorKind::Software => Some(Box::new(SoftwareCompositor::new())),
            _ => None,
        }
    }
}
