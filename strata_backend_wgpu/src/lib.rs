// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hardware-accelerated compositor backend on [`wgpu`].
//!
//! Atlas pages are `256x256` BGRA8 textures (nearest filtering,
//! clamp-to-edge) filled by sub-region writes through the core
//! [`AtlasSet`]. Composite calls accumulate quads in the core
//! [`QuadBatch`]es, one textured batch per atlas page plus one global
//! flat-color batch; every batch flush appends a scissored,
//! dynamically-offset draw to the frame's command list, which is encoded
//! and submitted as a single render pass when the frame ends. Layer
//! boundaries flush all batches, so draws never reorder across them.
//!
//! Snapshots render the same pipeline into an offscreen texture and read
//! it back over a 256-byte-aligned staging buffer; the live target is
//! never touched.
//!
//! Pipelines are built lazily on the first frame against the target format
//! actually encountered, keeping device-capability state per instance
//! rather than process-wide.

mod pipeline;

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::mpsc;

use log::warn;

use strata_core::atlas::{ATLAS_EDGE, AtlasSet, TextureStore, TileHandle};
use strata_core::batch::{ColorVertex, QuadBatch, TextureVertex, rect_quad, tile_quad};
use strata_core::color::{PackedColor, scale_bounded};
use strata_core::compositor::{
    BlendMode, Compositor, CompositorError, CompositorFactory, CompositorKind, FrameTransform,
    Phase,
};
use strata_core::geom::Rect32;
use strata_core::raster::Raster;
use strata_core::surface::{RenderSurface, TargetKind};

use pipeline::{GLOBALS_STRIDE, Globals, GpuState};

/// The render-target bundle a surface must expose behind
/// [`TargetKind::Wgpu`].
#[derive(Debug)]
pub struct WgpuTarget {
    /// View of the texture to composite into.
    pub view: wgpu::TextureView,
    /// Its format.
    pub format: wgpu::TextureFormat,
    /// Its width in pixels.
    pub width: u32,
    /// Its height in pixels.
    pub height: u32,
}

/// [`TextureStore`] over wgpu atlas-page textures.
#[derive(Debug)]
struct WgpuTextures {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl TextureStore for WgpuTextures {
    type Texture = wgpu::Texture;

    fn create_texture(&mut self, edge: u32) -> Result<wgpu::Texture, CompositorError> {
        Ok(self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("strata atlas page"),
            size: wgpu::Extent3d {
                width: edge,
                height: edge,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            // Packed ARGB u32 is BGRA bytes in memory on little-endian.
            format: wgpu::TextureFormat::Bgra8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        }))
    }

    fn upload(
        &mut self,
        texture: &mut wgpu::Texture,
        x: u32,
        y: u32,
        size: u32,
        pixels: &[u32],
    ) -> Result<(), CompositorError> {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(pixels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size * 4),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn delete_texture(&mut self, texture: wgpu::Texture) {
        texture.destroy();
    }
}

/// One scissored draw recorded for the frame's render pass.
enum DrawCmd {
    Textured {
        texture: wgpu::Texture,
        vertices: Range<u32>,
        scissor: Rect32,
        globals_slot: u32,
        blend: BlendMode,
    },
    Colored {
        vertices: Range<u32>,
        scissor: Rect32,
        globals_slot: u32,
        blend: BlendMode,
    },
}

/// A per-page accumulation batch plus the page texture it samples.
struct PageBatch {
    texture: wgpu::Texture,
    batch: QuadBatch<TextureVertex>,
}

/// Everything accumulated between `begin_frame`/`begin_snapshot` and the
/// matching end.
struct WgpuFrame {
    transform: FrameTransform,
    scissor: Option<Rect32>,
    dirty: Rect32,
    opacity: u8,
    blend: BlendMode,
    suppressed: bool,

    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    /// Offscreen snapshot texture (snapshot frames only).
    offscreen: Option<wgpu::Texture>,

    tex_vertices: Vec<TextureVertex>,
    col_vertices: Vec<ColorVertex>,
    draws: Vec<DrawCmd>,
    globals: Vec<Globals>,
    page_batches: BTreeMap<u32, PageBatch>,
    color_batch: QuadBatch<ColorVertex>,
}

impl WgpuFrame {
    fn new(
        transform: FrameTransform,
        dirty: Rect32,
        view: wgpu::TextureView,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        offscreen: Option<wgpu::Texture>,
    ) -> Self {
        let mut frame = Self {
            transform,
            scissor: None,
            dirty,
            opacity: 255,
            blend: BlendMode::SrcOver,
            suppressed: false,
            view,
            format,
            width,
            height,
            offscreen,
            tex_vertices: Vec::new(),
            col_vertices: Vec::new(),
            draws: Vec::new(),
            globals: Vec::new(),
            page_batches: BTreeMap::new(),
            color_batch: QuadBatch::new(),
        };
        frame.push_globals();
        frame
    }

    /// Appends a globals slot for the current transform and opacity.
    fn push_globals(&mut self) {
        let t = self.transform;
        let (w, h) = (self.width as f32, self.height as f32);
        let (ox, oy) = (t.origin.0 as f32, t.origin.1 as f32);
        let (scale_y, offset_y) = if t.flip_y {
            (2.0 / h, oy * 2.0 / h - 1.0)
        } else {
            (-2.0 / h, 1.0 - oy * 2.0 / h)
        };
        self.globals.push(Globals {
            scale: [2.0 / w, scale_y],
            offset: [ox * 2.0 / w - 1.0, offset_y],
            opacity: f32::from(self.opacity) / 255.0,
            _pad: [0.0; 3],
        });
    }

    fn globals_slot(&self) -> u32 {
        (self.globals.len() - 1) as u32
    }

    /// The device-space scissor draws are currently limited to.
    fn draw_scissor(&self) -> Rect32 {
        let bounds = Rect32::new(0, 0, self.width as i32, self.height as i32);
        let mut clip = bounds.intersect(self.dirty);
        if let Some(scissor) = self.scissor {
            clip = clip.intersect(scissor);
        }
        clip
    }

    fn flush_color_batch(&mut self) {
        if self.color_batch.is_empty() {
            return;
        }
        let start = self.col_vertices.len() as u32;
        self.col_vertices.extend_from_slice(self.color_batch.vertices());
        self.color_batch.clear();
        self.draws.push(DrawCmd::Colored {
            vertices: start..self.col_vertices.len() as u32,
            scissor: self.draw_scissor(),
            globals_slot: self.globals_slot(),
            blend: self.blend,
        });
    }

    fn flush_page_batch(&mut self, page: u32) {
        let Some(entry) = self.page_batches.get_mut(&page) else {
            return;
        };
        if entry.batch.is_empty() {
            return;
        }
        let start = self.tex_vertices.len() as u32;
        self.tex_vertices.extend_from_slice(entry.batch.vertices());
        entry.batch.clear();
        let texture = entry.texture.clone();
        self.draws.push(DrawCmd::Textured {
            texture,
            vertices: start..self.tex_vertices.len() as u32,
            scissor: self.draw_scissor(),
            globals_slot: self.globals_slot(),
            blend: self.blend,
        });
    }

    /// Flushes every pending batch; called at layer boundaries and frame
    /// end so paint order is preserved.
    fn flush_all(&mut self) {
        self.flush_color_batch();
        let pages: Vec<u32> = self.page_batches.keys().copied().collect();
        for page in pages {
            self.flush_page_batch(page);
        }
    }
}

/// The wgpu [`Compositor`].
pub struct WgpuCompositor {
    store: WgpuTextures,
    atlas: AtlasSet<WgpuTextures>,
    gpu: Option<GpuState>,
    phase: Phase,
    tile_size: u32,
    frame: Option<WgpuFrame>,

    /// Reused frame buffers, grown as needed.
    tex_vertex_buffer: Option<wgpu::Buffer>,
    col_vertex_buffer: Option<wgpu::Buffer>,
    globals_buffer: Option<wgpu::Buffer>,
    globals_bind_group: Option<wgpu::BindGroup>,
}

impl core::fmt::Debug for WgpuCompositor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WgpuCompositor")
            .field("tile_size", &self.tile_size)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl WgpuCompositor {
    /// Creates a compositor over an existing device and queue.
    #[must_use]
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            store: WgpuTextures { device, queue },
            atlas: AtlasSet::new(),
            gpu: None,
            phase: Phase::default(),
            tile_size: 0,
            frame: None,
            tex_vertex_buffer: None,
            col_vertex_buffer: None,
            globals_buffer: None,
            globals_bind_group: None,
        }
    }

    /// Ensures `buffer` exists with at least `size` bytes and `usage`.
    fn ensure_buffer(
        device: &wgpu::Device,
        buffer: &mut Option<wgpu::Buffer>,
        size: u64,
        usage: wgpu::BufferUsages,
        label: &str,
    ) -> bool {
        let needs_new = buffer.as_ref().is_none_or(|b| b.size() < size);
        if needs_new {
            *buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size.next_power_of_two().max(4096),
                usage: usage | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        needs_new
    }

    /// Encodes and submits the frame's draw list into its target view.
    ///
    /// `clear` controls whether the pass starts from transparent (snapshot
    /// targets) or from the existing contents (live surfaces).
    fn submit_frame(&mut self, frame: &WgpuFrame, clear: bool) {
        let device = self.store.device.clone();
        let gpu = self.gpu.get_or_insert_with(|| GpuState::new(&device));

        if frame.draws.is_empty() && !clear {
            return;
        }

        // Upload vertices and globals.
        if !frame.tex_vertices.is_empty() {
            Self::ensure_buffer(
                &device,
                &mut self.tex_vertex_buffer,
                (frame.tex_vertices.len() * size_of::<TextureVertex>()) as u64,
                wgpu::BufferUsages::VERTEX,
                "strata textured vertices",
            );
            self.store.queue.write_buffer(
                self.tex_vertex_buffer.as_ref().expect("buffer just ensured"),
                0,
                bytemuck::cast_slice(&frame.tex_vertices),
            );
        }
        if !frame.col_vertices.is_empty() {
            Self::ensure_buffer(
                &device,
                &mut self.col_vertex_buffer,
                (frame.col_vertices.len() * size_of::<ColorVertex>()) as u64,
                wgpu::BufferUsages::VERTEX,
                "strata color vertices",
            );
            self.store.queue.write_buffer(
                self.col_vertex_buffer.as_ref().expect("buffer just ensured"),
                0,
                bytemuck::cast_slice(&frame.col_vertices),
            );
        }

        let globals_size = frame.globals.len() as u64 * u64::from(GLOBALS_STRIDE);
        let grew = Self::ensure_buffer(
            &device,
            &mut self.globals_buffer,
            globals_size,
            wgpu::BufferUsages::UNIFORM,
            "strata globals",
        );
        if grew || self.globals_bind_group.is_none() {
            self.globals_bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("strata globals bind group"),
                layout: &gpu.globals_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: self.globals_buffer.as_ref().expect("buffer just ensured"),
                        offset: 0,
                        size: wgpu::BufferSize::new(size_of::<Globals>() as u64),
                    }),
                }],
            }));
        }
        let globals_buffer = self.globals_buffer.as_ref().expect("buffer just ensured");
        for (i, globals) in frame.globals.iter().enumerate() {
            self.store.queue.write_buffer(
                globals_buffer,
                i as u64 * u64::from(GLOBALS_STRIDE),
                bytemuck::bytes_of(globals),
            );
        }

        gpu.prepare(&device, frame.format);
        let gpu = &*gpu;
        let pipelines = gpu.pipelines(frame.format);
        let globals_bind_group = self
            .globals_bind_group
            .as_ref()
            .expect("bind group built above");

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("strata frame encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("strata composite pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &frame.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: if clear {
                            wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for draw in &frame.draws {
                let (scissor, vertices, slot, blend) = match draw {
                    DrawCmd::Textured {
                        scissor,
                        vertices,
                        globals_slot,
                        blend,
                        ..
                    }
                    | DrawCmd::Colored {
                        scissor,
                        vertices,
                        globals_slot,
                        blend,
                    } => (*scissor, vertices.clone(), *globals_slot, *blend),
                };
                if scissor.is_empty() {
                    continue;
                }
                pass.set_scissor_rect(
                    scissor.x as u32,
                    scissor.y as u32,
                    scissor.width as u32,
                    scissor.height as u32,
                );
                pass.set_bind_group(0, globals_bind_group, &[slot * GLOBALS_STRIDE]);

                match draw {
                    DrawCmd::Textured { texture, .. } => {
                        pass.set_pipeline(match blend {
                            BlendMode::Copy => &pipelines.textured_copy,
                            _ => &pipelines.textured_src_over,
                        });
                        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                            label: Some("strata atlas bind group"),
                            layout: &gpu.texture_layout,
                            entries: &[
                                wgpu::BindGroupEntry {
                                    binding: 0,
                                    resource: wgpu::BindingResource::TextureView(&view),
                                },
                                wgpu::BindGroupEntry {
                                    binding: 1,
                                    resource: wgpu::BindingResource::Sampler(&gpu.sampler),
                                },
                            ],
                        });
                        pass.set_bind_group(1, &bind_group, &[]);
                        pass.set_vertex_buffer(
                            0,
                            self.tex_vertex_buffer
                                .as_ref()
                                .expect("textured draws imply a buffer")
                                .slice(..),
                        );
                    }
                    DrawCmd::Colored { .. } => {
                        pass.set_pipeline(match blend {
                            BlendMode::Copy => &pipelines.color_copy,
                            _ => &pipelines.color_src_over,
                        });
                        pass.set_vertex_buffer(
                            0,
                            self.col_vertex_buffer
                                .as_ref()
                                .expect("colored draws imply a buffer")
                                .slice(..),
                        );
                    }
                }

                // Quads were batched in strip order, four vertices each.
                let mut v = vertices.start;
                while v < vertices.end {
                    pass.draw(v..v + 4, 0..1);
                    v += 4;
                }
            }
        }
        self.store.queue.submit(Some(encoder.finish()));
    }

    /// Reads an offscreen BGRA8 texture back into a raster.
    fn read_back(&self, texture: &wgpu::Texture, target: &mut Raster) -> Result<(), CompositorError> {
        let width = target.width() as u32;
        let height = target.height() as u32;
        let padded = padded_bytes_per_row(width * 4);

        let buffer = self.store.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("strata snapshot readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .store
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("strata snapshot copy"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.store.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        let _ = self.store.device.poll(wgpu::PollType::Wait);
        match receiver.try_recv() {
            Ok(Ok(())) => {}
            _ => {
                warn!("snapshot readback mapping failed");
                return Err(CompositorError::Device);
            }
        }

        {
            let data = buffer.slice(..).get_mapped_range();
            let stride = target.stride();
            for y in 0..height as usize {
                let row = &data[y * padded as usize..y * padded as usize + width as usize * 4];
                let dest = &mut target.pixels_mut()[y * stride..y * stride + width as usize];
                dest.copy_from_slice(bytemuck::cast_slice(row));
            }
        }
        buffer.unmap();
        Ok(())
    }
}

/// Rounds a tight row length up to wgpu's copy alignment.
fn padded_bytes_per_row(bytes: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    bytes.div_ceil(align) * align
}

impl Compositor for WgpuCompositor {
    fn kind(&self) -> CompositorKind {
        CompositorKind::HardwareAccelerated
    }

    fn atlas_stats(&self) -> Option<strata_core::atlas::AtlasStats> {
        Some(self.atlas.stats())
    }

    fn cleanup(&mut self) {
        let Self { store, atlas, .. } = self;
        atlas.cleanup(store);
        self.frame = None;
        self.gpu = None;
        self.tex_vertex_buffer = None;
        self.col_vertex_buffer = None;
        self.globals_buffer = None;
        self.globals_bind_group = None;
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
        // Validation failures surface through wgpu's error handler; by the
        // time a submission has been accepted the batch is good.
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
        let target = match surface.lock_target(TargetKind::Wgpu) {
            None => return Err(CompositorError::TargetLock),
            Some(any) => match any.downcast_mut::<WgpuTarget>() {
                Some(t) => Some((t.view.clone(), t.format, t.width, t.height)),
                None => None,
            },
        };
        let Some((view, format, width, height)) = target else {
            surface.unlock_target();
            return Err(CompositorError::TargetLock);
        };

        self.phase.begin_frame();
        let transform = FrameTransform::live(height as i32, false);
        self.frame = Some(WgpuFrame::new(
            transform, dirty, view, format, width, height, None,
        ));
        Ok(())
    }

    fn end_frame(&mut self, surface: &mut dyn RenderSurface) -> Result<(), CompositorError> {
        self.phase.end_frame();
        let mut frame = self.frame.take().expect("end_frame without begin_frame");
        frame.flush_all();
        self.submit_frame(&frame, false);
        surface.unlock_target();
        Ok(())
    }

    fn begin_layer(
        &mut self,
        clip: Rect32,
        opacity: u8,
        blend: BlendMode,
    ) -> Result<(), CompositorError> {
        self.phase.begin_layer();
        let frame = self.frame.as_mut().expect("begin_layer requires a frame");
        frame.flush_all();
        frame.suppressed = blend == BlendMode::Noop;
        frame.scissor = if frame.suppressed {
            Some(Rect32::EMPTY)
        } else {
            Some(frame.transform.device_clip(clip))
        };
        frame.opacity = opacity;
        frame.blend = blend;
        frame.push_globals();
        Ok(())
    }

    fn end_layer(&mut self) -> Result<(), CompositorError> {
        self.phase.end_layer();
        let frame = self.frame.as_mut().expect("end_layer requires a frame");
        frame.flush_all();
        frame.suppressed = false;
        frame.scissor = None;
        frame.opacity = 255;
        frame.blend = BlendMode::SrcOver;
        frame.push_globals();
        Ok(())
    }

    fn composite_tile(&mut self, x: i32, y: i32, tile: TileHandle) -> Result<(), CompositorError> {
        assert!(self.phase.rendering(), "composite_tile outside a frame");
        let Some(texture) = self.atlas.texture(tile) else {
            return Err(CompositorError::StaleTile);
        };
        let texture = texture.clone();
        let (sx, sy) = self.atlas.slot_origin(tile);

        let frame = self.frame.as_mut().expect("composite requires a frame");
        if frame.suppressed {
            return Ok(());
        }
        let ts = self.tile_size;
        let edge = ATLAS_EDGE as f32;
        let uv = [
            sx as f32 / edge,
            sy as f32 / edge,
            (sx + ts) as f32 / edge,
            (sy + ts) as f32 / edge,
        ];

        let page = tile.page();
        let entry = frame.page_batches.entry(page).or_insert_with(|| PageBatch {
            texture,
            batch: QuadBatch::new(),
        });
        if entry.batch.is_full() {
            frame.flush_page_batch(page);
        }
        let entry = frame
            .page_batches
            .get_mut(&page)
            .expect("batch entry exists");
        entry.batch.push(tile_quad(x, y, ts as i32, uv));
        Ok(())
    }

    fn composite_rect(
        &mut self,
        x: i32,
        y: i32,
        color: PackedColor,
    ) -> Result<(), CompositorError> {
        assert!(self.phase.rendering(), "composite_rect outside a frame");
        let frame = self.frame.as_mut().expect("composite requires a frame");
        if frame.suppressed {
            return Ok(());
        }
        if frame.color_batch.is_full() {
            frame.flush_color_batch();
        }
        // Queue the color already premultiplied by the layer opacity.
        let scaled = scale_bounded(color, frame.opacity);
        frame
            .color_batch
            .push(rect_quad(x, y, self.tile_size as i32, scaled));
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
        let texture = self.store.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("strata snapshot target"),
            size: wgpu::Extent3d {
                width: area.width as u32,
                height: area.height as u32,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Bgra8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        self.phase.begin_snapshot();
        let transform = FrameTransform::snapshot(area);
        let dirty = Rect32::new(0, 0, area.width, area.height);
        self.frame = Some(WgpuFrame::new(
            transform,
            dirty,
            view,
            wgpu::TextureFormat::Bgra8Unorm,
            area.width as u32,
            area.height as u32,
            Some(texture),
        ));
        Ok(())
    }

    fn end_snapshot(&mut self, _area: Rect32, target: &mut Raster) -> Result<(), CompositorError> {
        self.phase.end_snapshot();
        let mut frame = self
            .frame
            .take()
            .expect("end_snapshot without begin_snapshot");
        frame.flush_all();
        self.submit_frame(&frame, true);

        let texture = frame.offscreen.take().expect("snapshot frames are offscreen");
        let result = self.read_back(&texture, target);
        texture.destroy();
        result
    }
}

/// Factory producing [`WgpuCompositor`]s for
/// [`CompositorKind::HardwareAccelerated`] over one shared device.
#[derive(Clone, Debug)]
pub struct WgpuFactory {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuFactory {
    /// Creates a factory cloning the given device and queue into each
    /// backend.
    #[must_use]
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }
}

impl CompositorFactory for WgpuFactory {
    fn create(&self, kind: CompositorKind) -> Option<Box<dyn Compositor>> {
        match kind {
            CompositorKind::HardwareAccelerated => Some(Box::new(WgpuCompositor::new(
                self.device.clone(),
                self.queue.clone(),
            ))),
            _ => None,
        }
    }
}
