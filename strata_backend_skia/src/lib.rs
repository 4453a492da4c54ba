// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Vector-graphics compositor backend, built on [`tiny_skia`].
//!
//! Where the hardware backend packs tiles into atlas-page textures, this
//! backend keeps each tile as its own premultiplied [`tiny_skia::Pixmap`]
//! in a generation-checked slab, the simpler internals the backend
//! contract allows for non-atlas engines. Tiles composite with
//! `draw_pixmap` under a rectangular clip mask; flat rects go through the
//! solid-color fill path. Since nothing here lives on a device, tile
//! storage is released immediately on deallocation rather than deferred to
//! the end of the tiling batch.

use log::warn;
use tiny_skia::{
    BlendMode as SkBlend, FillRule, FilterQuality, Mask, Paint, PathBuilder, Pixmap, PixmapPaint,
    PremultipliedColorU8, Transform,
};

use strata_core::atlas::TileHandle;
use strata_core::color::{PackedColor, scale_bounded};
use strata_core::compositor::{
    BlendMode, Compositor, CompositorError, CompositorFactory, CompositorKind, FrameTransform,
    Phase,
};
use strata_core::geom::Rect32;
use strata_core::raster::Raster;
use strata_core::surface::{RenderSurface, TargetKind};

struct TilePixmap {
    pixmap: Pixmap,
    generation: u32,
}

/// Per-frame drawing state.
struct SkiaFrame {
    transform: FrameTransform,
    /// Device-space scissor of the open layer; `None` outside layers.
    scissor: Option<Rect32>,
    /// Device-space region the caller asked to repaint.
    dirty: Rect32,
    /// Rasterized `scissor` ∩ `dirty`, rebuilt when the layer changes.
    mask: Option<Mask>,
    /// Set while the scissor is empty (no-op layers): draw nothing.
    suppressed: bool,
    opacity: u8,
    blend: BlendMode,
    framebuffer: Pixmap,
}

impl SkiaFrame {
    fn new(transform: FrameTransform, dirty: Rect32, framebuffer: Pixmap) -> Self {
        let mut frame = Self {
            transform,
            scissor: None,
            dirty,
            mask: None,
            suppressed: false,
            opacity: 255,
            blend: BlendMode::SrcOver,
            framebuffer,
        };
        frame.rebuild_mask();
        frame
    }

    fn rebuild_mask(&mut self) {
        let bounds = Rect32::new(
            0,
            0,
            self.framebuffer.width() as i32,
            self.framebuffer.height() as i32,
        );
        let mut clip = bounds.intersect(self.dirty);
        if let Some(scissor) = self.scissor {
            clip = clip.intersect(scissor);
        }

        if clip.is_empty() {
            self.suppressed = true;
            self.mask = None;
            return;
        }
        self.suppressed = false;
        if clip == bounds {
            // Unclipped; skip the mask entirely.
            self.mask = None;
            return;
        }

        let mut mask = Mask::new(self.framebuffer.width(), self.framebuffer.height())
            .expect("framebuffer dimensions are non-zero");
        let rect = tiny_skia::Rect::from_xywh(
            clip.x as f32,
            clip.y as f32,
            clip.width as f32,
            clip.height as f32,
        )
        .expect("clip is non-empty");
        let path = PathBuilder::from_rect(rect);
        mask.fill_path(&path, FillRule::Winding, false, Transform::identity());
        self.mask = Some(mask);
    }
}

/// The tiny-skia [`Compositor`].
#[derive(Default)]
pub struct SkiaCompositor {
    tiles: Vec<Option<TilePixmap>>,
    free: Vec<u32>,
    next_generation: u32,
    needs_flush: bool,
    tile_size: u32,
    phase: Phase,
    frame: Option<SkiaFrame>,
}

impl core::fmt::Debug for SkiaCompositor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SkiaCompositor")
            .field("tiles", &self.tiles.len())
            .field("tile_size", &self.tile_size)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl SkiaCompositor {
    /// Creates an empty vector compositor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tile(&self, handle: TileHandle) -> Option<&TilePixmap> {
        self.tiles
            .get(handle.page() as usize)?
            .as_ref()
            .filter(|t| t.generation == handle.generation())
    }

    fn destroy_all_tiles(&mut self) {
        self.tiles.clear();
        self.free.clear();
    }
}

/// Converts a packed premultiplied ARGB raster into a premultiplied RGBA
/// pixmap.
fn raster_to_pixmap(pixels: &[u32], width: u32, height: u32, stride_px: usize) -> Option<Pixmap> {
    let mut pixmap = Pixmap::new(width, height)?;
    let data = pixmap.data_mut();
    for y in 0..height as usize {
        for x in 0..width as usize {
            let px = pixels[y * stride_px + x];
            let o = (y * width as usize + x) * 4;
            data[o] = (px >> 16) as u8;
            data[o + 1] = (px >> 8) as u8;
            data[o + 2] = px as u8;
            data[o + 3] = (px >> 24) as u8;
        }
    }
    Some(pixmap)
}

/// Converts a premultiplied RGBA pixmap back into packed premultiplied
/// ARGB.
fn pixmap_to_raster(pixmap: &Pixmap, raster: &mut Raster) {
    let data = pixmap.data();
    for (i, px) in raster.pixels_mut().iter_mut().enumerate() {
        let o = i * 4;
        *px = (u32::from(data[o + 3]) << 24)
            | (u32::from(data[o]) << 16)
            | (u32::from(data[o + 1]) << 8)
            | u32::from(data[o + 2]);
    }
}

fn blend_to_skia(blend: BlendMode) -> SkBlend {
    match blend {
        BlendMode::SrcOver => SkBlend::SourceOver,
        BlendMode::Copy => SkBlend::Source,
        // Noop layers are suppressed before any draw call.
        BlendMode::Noop => SkBlend::SourceOver,
    }
}

impl Compositor for SkiaCompositor {
    fn kind(&self) -> CompositorKind {
        CompositorKind::Vector
    }

    fn cleanup(&mut self) {
        self.destroy_all_tiles();
        self.frame = None;
        self.phase = Phase::Idle;
    }

    fn flush(&mut self) {
        self.needs_flush = true;
    }

    fn begin_tiling(&mut self, tile_size: u32) -> Result<(), CompositorError> {
        self.phase.begin_tiling();
        if tile_size != self.tile_size || self.needs_flush {
            self.destroy_all_tiles();
            self.tile_size = tile_size;
            self.needs_flush = false;
        }
        Ok(())
    }

    fn end_tiling(&mut self) -> Result<(), CompositorError> {
        self.phase.end_tiling();
        Ok(())
    }

    fn allocate_tile(
        &mut self,
        size: u32,
        pixels: &[u32],
        stride_px: usize,
    ) -> Result<TileHandle, CompositorError> {
        let pixmap = raster_to_pixmap(pixels, size, size, stride_px)
            .ok_or(CompositorError::TextureCreation)?;
        let generation = self.next_generation;
        self.next_generation += 1;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.tiles.push(None);
                (self.tiles.len() - 1) as u32
            }
        };
        self.tiles[index as usize] = Some(TilePixmap { pixmap, generation });
        Ok(TileHandle::from_raw_parts(index, 0, generation))
    }

    fn deallocate_tile(&mut self, tile: TileHandle) {
        if self.tile(tile).is_none() {
            warn!("deallocate of stale vector tile {tile:?}");
            return;
        }
        self.tiles[tile.page() as usize] = None;
        self.free.push(tile.page());
    }

    fn begin_frame(
        &mut self,
        surface: &mut dyn RenderSurface,
        dirty: Rect32,
    ) -> Result<(), CompositorError> {
        let framebuffer = match surface.lock_target(TargetKind::Raster) {
            None => return Err(CompositorError::TargetLock),
            Some(any) => any.downcast_mut::<Raster>().and_then(|target| {
                raster_to_pixmap(
                    target.pixels(),
                    target.width() as u32,
                    target.height() as u32,
                    target.stride(),
                )
            }),
        };
        surface.unlock_target();
        let Some(framebuffer) = framebuffer else {
            return Err(CompositorError::TargetLock);
        };

        self.phase.begin_frame();
        let transform = FrameTransform::live(framebuffer.height() as i32, false);
        self.frame = Some(SkiaFrame::new(transform, dirty, framebuffer));
        Ok(())
    }

    fn end_frame(&mut self, surface: &mut dyn RenderSurface) -> Result<(), CompositorError> {
        self.phase.end_frame();
        let frame = self.frame.take().expect("end_frame without begin_frame");

        let result = match surface.lock_target(TargetKind::Raster) {
            None => return Err(CompositorError::TargetLock),
            Some(any) => match any.downcast_mut::<Raster>() {
                Some(target)
                    if target.pixels().len()
                        == (frame.framebuffer.width() * frame.framebuffer.height()) as usize =>
                {
                    pixmap_to_raster(&frame.framebuffer, target);
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
            Some(Rect32::EMPTY)
        } else {
            Some(frame.transform.device_clip(clip))
        };
        frame.opacity = opacity;
        frame.blend = blend;
        frame.rebuild_mask();
        Ok(())
    }

    fn end_layer(&mut self) -> Result<(), CompositorError> {
        self.phase.end_layer();
        let frame = self.frame.as_mut().expect("end_layer requires a frame");
        frame.scissor = None;
        frame.opacity = 255;
        frame.blend = BlendMode::SrcOver;
        frame.rebuild_mask();
        Ok(())
    }

    fn composite_tile(&mut self, x: i32, y: i32, tile: TileHandle) -> Result<(), CompositorError> {
        assert!(self.phase.rendering(), "composite_tile outside a frame");
        let Some(entry) = self
            .tiles
            .get(tile.page() as usize)
            .and_then(|slot| slot.as_ref())
            .filter(|entry| entry.generation == tile.generation())
        else {
            return Err(CompositorError::StaleTile);
        };
        let pixmap = entry.pixmap.as_ref();
        let frame = self.frame.as_mut().expect("composite requires a frame");
        if frame.suppressed {
            return Ok(());
        }
        let (dx, dy) = frame.transform.apply(x, y);
        let paint = PixmapPaint {
            opacity: f32::from(frame.opacity) / 255.0,
            blend_mode: blend_to_skia(frame.blend),
            quality: FilterQuality::Nearest,
        };
        frame
            .framebuffer
            .draw_pixmap(dx, dy, pixmap, &paint, Transform::identity(), frame.mask.as_ref());
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
        let frame = self.frame.as_mut().expect("composite requires a frame");
        if frame.suppressed {
            return Ok(());
        }
        // The queued color is premultiplied by the layer opacity up front;
        // this is the bit-reproducible part of the rule.
        let scaled = scale_bounded(color, frame.opacity);
        let Some(premul) =
            PremultipliedColorU8::from_rgba(scaled.red(), scaled.green(), scaled.blue(), scaled.alpha())
        else {
            return Err(CompositorError::Device);
        };
        let straight = premul.demultiply();

        let (dx, dy) = frame.transform.apply(x, y);
        let Some(rect) = tiny_skia::Rect::from_xywh(dx as f32, dy as f32, size as f32, size as f32)
        else {
            return Ok(());
        };
        let mut paint = Paint::default();
        paint.set_color_rgba8(straight.red(), straight.green(), straight.blue(), straight.alpha());
        paint.blend_mode = blend_to_skia(frame.blend);
        paint.anti_alias = false;
        frame
            .framebuffer
            .fill_rect(rect, &paint, Transform::identity(), frame.mask.as_ref());
        Ok(())
    }

    fn begin_snapshot(
        &mut self,
        area: Rect32,
        _target: &mut Raster,
    ) -> Result<(), CompositorError> {
        let Some(framebuffer) = Pixmap::new(area.width.max(0) as u32, area.height.max(0) as u32)
        else {
            return Err(CompositorError::Device);
        };
        self.phase.begin_snapshot();
        let transform = FrameTransform::snapshot(area);
        let dirty = Rect32::new(0, 0, area.width, area.height);
        self.frame = Some(SkiaFrame::new(transform, dirty, framebuffer));
        Ok(())
    }

    fn end_snapshot(&mut self, _area: Rect32, target: &mut Raster) -> Result<(), CompositorError> {
        self.phase.end_snapshot();
        let frame = self
            .frame
            .take()
            .expect("end_snapshot without begin_snapshot");
        if target.pixels().len() != (frame.framebuffer.width() * frame.framebuffer.height()) as usize
        {
            return Err(CompositorError::Device);
        }
        pixmap_to_raster(&frame.framebuffer, target);
        Ok(())
    }
}

/// Factory producing [`SkiaCompositor`]s for [`CompositorKind::Vector`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SkiaFactory;

impl CompositorFactory for SkiaFactory {
    fn create(&self, kind: CompositorKind) -> Option<Box<dyn Compositor>> {
        match kind {
            CompositorKind::Vector => Some(Box::new(SkiaCompositor::new())),
            _ => None,
        }
    }
}
