// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Device-backed integration test. Skips (successfully) when no wgpu
//! adapter is available, so CI without a GPU still passes.

use std::any::Any;

use strata_backend_wgpu::{WgpuFactory, WgpuTarget};
use strata_core::cache::{TileCache, TileCacheOptions};
use strata_core::color::PackedColor;
use strata_core::compositor::{BlendMode, CompositorKind};
use strata_core::geom::Rect32;
use strata_core::layer::SceneryLayer;
use strata_core::raster::Canvas;
use strata_core::surface::{RenderSurface, TargetKind};

/// A surface over a plain render-attachment texture.
struct TextureSurface {
    target: WgpuTarget,
    locked: bool,
}

impl RenderSurface for TextureSurface {
    fn lock_target(&mut self, kind: TargetKind) -> Option<&mut dyn Any> {
        if kind != TargetKind::Wgpu || self.locked {
            return None;
        }
        self.locked = true;
        Some(&mut self.target)
    }

    fn unlock_target(&mut self) {
        self.locked = false;
    }
}

fn request_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapter =
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .ok()?;
    pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("strata test device"),
        ..Default::default()
    }))
    .ok()
}

#[test]
fn red_scenery_survives_the_snapshot_readback() {
    let _ = env_logger::builder().is_test(true).try_init();
    let Some((device, queue)) = request_device() else {
        eprintln!("no wgpu adapter available; skipping");
        return;
    };

    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("strata test target"),
        size: wgpu::Extent3d {
            width: 64,
            height: 32,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Bgra8Unorm,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let mut surface = TextureSurface {
        target: WgpuTarget {
            view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
            format: wgpu::TextureFormat::Bgra8Unorm,
            width: 64,
            height: 32,
        },
        locked: false,
    };

    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = TileCache::new(
        TileCacheOptions {
            tile_size: 32,
            cache_limit: 1 << 20,
            viewport,
            compositor: CompositorKind::HardwareAccelerated,
        },
        Box::new(WgpuFactory::new(device, queue)),
    );

    let mut red = |canvas: &mut Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, PackedColor(0xffff_0000));
        true
    };
    let mut frame = cache.begin_frame().unwrap();
    frame.render_scenery(SceneryLayer {
        id: 0,
        region: Rect32::new(0, 0, 64, 32),
        clip: Rect32::LARGEST,
        is_opaque: true,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render: &mut red,
    });
    frame.end(&mut surface, viewport).unwrap();

    // Two 32x32 cells: two slots taken on a single page.
    let stats = cache.compositor().unwrap().atlas_stats().unwrap();
    assert_eq!(stats.arity, 64);
    assert_eq!(stats.pages(), 1);
    assert_eq!(stats.free_slots[0], stats.arity - 2);

    // The snapshot path reads the composite back over the staging buffer.
    let raster = cache.snapshot(viewport).unwrap();
    for &corner in &[(0, 0), (63, 0), (0, 31), (63, 31), (32, 16)] {
        assert_eq!(
            raster.pixel(corner.0, corner.1),
            PackedColor(0xffff_0000),
            "pixel {corner:?}"
        );
    }
}
