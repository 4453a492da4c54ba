// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios: a `TileCache` over the software backend, from
//! layer description through rasterization callbacks to composited pixels.

use std::cell::{Cell, RefCell};

use strata_backend_software::SoftwareFactory;
use strata_core::cache::{TileCache, TileCacheOptions};
use strata_core::color::{PackedColor, scale_bounded};
use strata_core::compositor::{BlendMode, CompositorKind};
use strata_core::geom::Rect32;
use strata_core::layer::{Renderer, SceneryLayer, SpriteLayer};
use strata_core::raster::Canvas;
use strata_core::surface::RasterSurface;

const RED: PackedColor = PackedColor(0xffff_0000);
const GREEN: PackedColor = PackedColor(0xff00_ff00);

fn software_cache(viewport: Rect32) -> TileCache {
    TileCache::new(
        TileCacheOptions {
            tile_size: 32,
            cache_limit: 1 << 20,
            viewport,
            compositor: CompositorKind::Software,
        },
        Box::new(SoftwareFactory),
    )
}

fn opaque_scenery<'f>(id: u16, region: Rect32, render: Renderer<'f>) -> SceneryLayer<'f> {
    SceneryLayer {
        id,
        region,
        clip: Rect32::LARGEST,
        is_opaque: true,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render,
    }
}

fn opaque_sprite<'f>(id: u32, region: Rect32, render: Renderer<'f>) -> SpriteLayer<'f> {
    SpriteLayer {
        id,
        region,
        clip: Rect32::LARGEST,
        is_opaque: true,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render,
    }
}

fn assert_region_is(raster: &strata_core::raster::Raster, region: Rect32, color: PackedColor) {
    for y in region.y..region.bottom() {
        for x in region.x..region.right() {
            assert_eq!(raster.pixel(x, y), color, "pixel ({x}, {y})");
        }
    }
}

/// One red scenery layer over two 32-px cells: two tiles allocated, one
/// atlas page with two slots taken, solid red output.
#[test]
fn red_scenery_fills_two_tiles_and_the_target() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = software_cache(viewport);

    let calls = Cell::new(0u32);
    let mut red = |canvas: &mut Canvas<'_>, rect: Rect32| {
        calls.set(calls.get() + 1);
        canvas.fill_rect(rect, RED);
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
    let mut surface = RasterSurface::with_size(64, 32);
    frame.end(&mut surface, viewport).unwrap();

    // Two 32x32 cells were rasterized and cached.
    assert_eq!(calls.get(), 2);
    assert_eq!(cache.cache_bytes(), 2 * 32 * 32 * 4);

    let stats = cache
        .compositor()
        .expect("backend installed")
        .atlas_stats()
        .expect("software backend reports atlas occupancy");
    assert_eq!(stats.arity, 64);
    assert_eq!(stats.pages(), 1);
    assert_eq!(stats.free_slots[0], stats.arity - 2);

    assert_region_is(surface.raster(), Rect32::new(0, 0, 64, 32), RED);
}

/// A second frame with no mutations reuses every cached tile.
#[test]
fn unchanged_scenery_rasterizes_only_once() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = software_cache(viewport);

    let calls = Cell::new(0u32);
    let mut red = |canvas: &mut Canvas<'_>, rect: Rect32| {
        calls.set(calls.get() + 1);
        canvas.fill_rect(rect, RED);
        true
    };
    let region = Rect32::new(0, 0, 64, 32);

    let mut surface = RasterSurface::with_size(64, 32);
    let mut frame = cache.begin_frame().unwrap();
    let id = frame.render_scenery(opaque_scenery(0, region, &mut red));
    frame.end(&mut surface, viewport).unwrap();
    assert_eq!(calls.get(), 2);

    let mut frame = cache.begin_frame().unwrap();
    let id = frame.render_scenery(opaque_scenery(id, region, &mut red));
    frame.end(&mut surface, viewport).unwrap();
    assert_eq!(calls.get(), 2, "cached tiles must not re-rasterize");

    // Invalidating one cell rebuilds exactly that cell.
    cache.update_scenery(id, Rect32::new(0, 0, 32, 32));
    let mut frame = cache.begin_frame().unwrap();
    frame.render_scenery(opaque_scenery(id, region, &mut red));
    frame.end(&mut surface, viewport).unwrap();
    assert_eq!(calls.get(), 3, "only the dirtied cell rebuilds");
}

/// An opaque layer in front fully occludes the layer behind it; the
/// occluded layer's callback never runs.
#[test]
fn opaque_front_layer_occludes_the_back_layer() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = software_cache(viewport);

    let back_calls = Cell::new(0u32);
    let mut front = |canvas: &mut Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, GREEN);
        true
    };
    let mut back = |canvas: &mut Canvas<'_>, rect: Rect32| {
        back_calls.set(back_calls.get() + 1);
        canvas.fill_rect(rect, RED);
        true
    };

    let mut frame = cache.begin_frame().unwrap();
    // Front to back: the opaque green layer first.
    frame.render_scenery(SceneryLayer {
        id: 0,
        region: Rect32::new(0, 0, 64, 32),
        clip: Rect32::LARGEST,
        is_opaque: true,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render: &mut front,
    });
    frame.render_scenery(SceneryLayer {
        id: 0,
        region: Rect32::new(0, 0, 64, 32),
        clip: Rect32::LARGEST,
        is_opaque: true,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render: &mut back,
    });
    let mut surface = RasterSurface::with_size(64, 32);
    frame.end(&mut surface, viewport).unwrap();

    assert_eq!(back_calls.get(), 0, "fully occluded layers never rasterize");
    assert_region_is(surface.raster(), Rect32::new(0, 0, 64, 32), GREEN);
}

/// Scrolling a sprite by one tile re-rasterizes only the newly exposed
/// strip; the surviving tile translates.
#[test]
fn sprite_scroll_reuses_cached_tiles() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = software_cache(viewport);

    let regions = RefCell::new(Vec::new());
    let mut paint = |canvas: &mut Canvas<'_>, rect: Rect32| {
        regions.borrow_mut().push(rect);
        canvas.fill_rect(rect, RED);
        true
    };
    let region = Rect32::new(0, 0, 64, 32);

    let mut surface = RasterSurface::with_size(64, 32);
    let mut frame = cache.begin_frame().unwrap();
    frame.render_sprite(opaque_sprite(1, region, &mut paint));
    frame.end(&mut surface, viewport).unwrap();
    assert_eq!(regions.borrow().len(), 2, "two cells rasterize initially");

    cache.scroll_sprite(1, 32, 0);

    regions.borrow_mut().clear();
    let mut frame = cache.begin_frame().unwrap();
    frame.render_sprite(opaque_sprite(1, region, &mut paint));
    frame.end(&mut surface, viewport).unwrap();

    assert_eq!(
        *regions.borrow(),
        vec![Rect32::new(0, 0, 32, 32)],
        "only the newly exposed strip rebuilds"
    );
}

/// The flat-rect premultiply rule, end to end through sprite layers at
/// boundary and middle opacities.
#[test]
fn layer_opacity_scales_composited_color() {
    for opacity in [0u8, 128, 255] {
        let viewport = Rect32::new(0, 0, 32, 32);
        let mut cache = software_cache(viewport);

        let mut red = |canvas: &mut Canvas<'_>, rect: Rect32| {
            canvas.fill_rect(rect, RED);
            true
        };
        let mut frame = cache.begin_frame().unwrap();
        frame.render_sprite(SpriteLayer {
            id: 3,
            region: Rect32::new(0, 0, 32, 32),
            clip: Rect32::LARGEST,
            is_opaque: false,
            opacity,
            blend: BlendMode::SrcOver,
            render: &mut red,
        });
        let mut surface = RasterSurface::with_size(32, 32);
        frame.end(&mut surface, viewport).unwrap();

        let want = scale_bounded(RED, opacity);
        assert_eq!(surface.raster().pixel(0, 0), want, "opacity {opacity}");
        assert_eq!(surface.raster().pixel(31, 31), want, "opacity {opacity}");
    }
}

/// Snapshots render the same scene into an offscreen raster without
/// touching cache state or the atlas.
#[test]
fn snapshot_matches_surface_and_leaves_state_alone() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = software_cache(viewport);

    let mut red = |canvas: &mut Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, RED);
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
    let mut surface = RasterSurface::with_size(64, 32);
    frame.end(&mut surface, viewport).unwrap();

    let clean_before = cache.is_clean();
    let valid_before = cache.is_valid();
    let bytes_before = cache.cache_bytes();
    let stats_before = cache.compositor().unwrap().atlas_stats().unwrap();

    // A sub-region snapshot: the right half of the scene.
    let area = Rect32::new(32, 0, 32, 32);
    let raster = cache.snapshot(area).unwrap();
    assert_eq!(raster.width(), 32);
    assert_region_is(&raster, Rect32::new(0, 0, 32, 32), RED);

    assert_eq!(cache.is_clean(), clean_before);
    assert_eq!(cache.is_valid(), valid_before);
    assert_eq!(cache.cache_bytes(), bytes_before);
    assert_eq!(
        cache.compositor().unwrap().atlas_stats().unwrap(),
        stats_before,
        "snapshots must not disturb atlas pages"
    );
}

/// Noop-blend layers contribute nothing to the target.
#[test]
fn noop_blend_sprite_is_invisible() {
    let viewport = Rect32::new(0, 0, 32, 32);
    let mut cache = software_cache(viewport);

    let mut red = |canvas: &mut Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, RED);
        true
    };
    let mut frame = cache.begin_frame().unwrap();
    frame.render_sprite(SpriteLayer {
        id: 9,
        region: Rect32::new(0, 0, 32, 32),
        clip: Rect32::LARGEST,
        is_opaque: false,
        opacity: 255,
        blend: BlendMode::Noop,
        render: &mut red,
    });
    let mut surface = RasterSurface::with_size(32, 32);
    frame.end(&mut surface, viewport).unwrap();

    assert_region_is(
        surface.raster(),
        Rect32::new(0, 0, 32, 32),
        PackedColor::TRANSPARENT,
    );
}

/// Sprite clips apply at composite time: only the clipped part shows.
#[test]
fn sprite_clip_limits_composited_area() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = software_cache(viewport);

    let mut red = |canvas: &mut Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, RED);
        true
    };
    let mut frame = cache.begin_frame().unwrap();
    frame.render_sprite(SpriteLayer {
        id: 4,
        region: Rect32::new(0, 0, 64, 32),
        clip: Rect32::new(0, 0, 16, 32),
        is_opaque: false,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render: &mut red,
    });
    let mut surface = RasterSurface::with_size(64, 32);
    frame.end(&mut surface, viewport).unwrap();

    assert_region_is(surface.raster(), Rect32::new(0, 0, 16, 32), RED);
    assert_region_is(
        surface.raster(),
        Rect32::new(16, 0, 48, 32),
        PackedColor::TRANSPARENT,
    );
}

/// Removing a sprite dirties its tiles; the next frame rebuilds it from
/// scratch.
#[test]
fn removed_sprite_rebuilds_from_scratch() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let mut cache = software_cache(viewport);

    let calls = Cell::new(0u32);
    let mut paint = |canvas: &mut Canvas<'_>, rect: Rect32| {
        calls.set(calls.get() + 1);
        canvas.fill_rect(rect, RED);
        true
    };
    let region = Rect32::new(0, 0, 64, 32);

    let mut surface = RasterSurface::with_size(64, 32);
    let mut frame = cache.begin_frame().unwrap();
    frame.render_sprite(opaque_sprite(2, region, &mut paint));
    frame.end(&mut surface, viewport).unwrap();
    assert_eq!(calls.get(), 2);

    cache.remove_sprite(2);

    let mut frame = cache.begin_frame().unwrap();
    frame.render_sprite(opaque_sprite(2, region, &mut paint));
    frame.end(&mut surface, viewport).unwrap();
    assert_eq!(calls.get(), 4, "a removed sprite loses its cached tiles");
}
