// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frame-protocol tests against the recording backend: draw ordering,
//! snapshot traversal, and the validity gate.

use strata_core::cache::{TileCache, TileCacheOptions};
use strata_core::color::PackedColor;
use strata_core::compositor::{BlendMode, CompositorError, CompositorKind};
use strata_core::geom::Rect32;
use strata_core::layer::{SceneryLayer, SpriteLayer};
use strata_core::surface::RasterSurface;
use strata_debug::{BackendEvent, EventLog, RecordingFactory, format_events};

const RED: PackedColor = PackedColor(0xffff_0000);

fn cache_with_log(viewport: Rect32, cache_limit: u32) -> (TileCache, EventLog) {
    let factory = RecordingFactory::new();
    let log = factory.log();
    let cache = TileCache::new(
        TileCacheOptions {
            tile_size: 32,
            cache_limit,
            viewport,
            compositor: CompositorKind::Software,
        },
        Box::new(factory),
    );
    (cache, log)
}

fn scenery<'f>(
    id: u16,
    region: Rect32,
    render: &'f mut dyn FnMut(&mut strata_core::raster::Canvas<'_>, Rect32) -> bool,
) -> SceneryLayer<'f> {
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

#[test]
fn draws_run_back_to_front_and_never_interleave() {
    // Scenery [A, B, C] in painter's order on disjoint cells, plus a
    // sprite D updated after them. The recorded trace must show all of
    // A's draws, then B's, then C's, then D's.
    let viewport = Rect32::new(0, 0, 96, 32);
    let (mut cache, log) = cache_with_log(viewport, 1 << 20);

    fn paint(region: Rect32) -> impl FnMut(&mut strata_core::raster::Canvas<'_>, Rect32) -> bool {
        move |canvas, rect| {
            canvas.fill_rect(rect.intersect(region), RED);
            true
        }
    }
    let mut a = paint(Rect32::new(0, 0, 32, 32));
    let mut b = paint(Rect32::new(32, 0, 32, 32));
    let mut c = paint(Rect32::new(64, 0, 32, 32));
    let mut d = |canvas: &mut strata_core::raster::Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, RED);
        true
    };

    let mut frame = cache.begin_frame().unwrap();
    // Described front to back: the sprite sits on top.
    frame.render_sprite(SpriteLayer {
        id: 7,
        region: Rect32::new(40, 0, 16, 16),
        clip: Rect32::LARGEST,
        is_opaque: false,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render: &mut d,
    });
    frame.render_scenery(scenery(0, Rect32::new(64, 0, 32, 32), &mut c));
    frame.render_scenery(scenery(0, Rect32::new(32, 0, 32, 32), &mut b));
    frame.render_scenery(scenery(0, Rect32::new(0, 0, 32, 32), &mut a));

    let mut surface = RasterSurface::with_size(96, 32);
    frame.end(&mut surface, viewport).unwrap();

    let events = log.take();
    let composites: Vec<&BackendEvent> = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                BackendEvent::CompositeTile { .. }
                    | BackendEvent::CompositeRect { .. }
                    | BackendEvent::BeginLayer { .. }
                    | BackendEvent::EndLayer
            )
        })
        .collect();

    // A (x=0), B (x=32), C (x=64), then the bracketed sprite at x=40.
    let positions: Vec<i32> = events
        .iter()
        .filter_map(|e| match e {
            BackendEvent::CompositeTile { x, .. } => Some(*x),
            _ => None,
        })
        .collect();
    assert_eq!(
        positions,
        [0, 32, 64, 40],
        "unexpected draw order:\n{}",
        format_events(&events)
    );
    assert!(
        matches!(composites[3], BackendEvent::BeginLayer { .. })
            && matches!(composites[5], BackendEvent::EndLayer),
        "sprite draws must be bracketed by its layer:\n{}",
        format_events(&events)
    );
}

#[test]
fn tiling_batch_brackets_allocations_inside_the_frame() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let (mut cache, log) = cache_with_log(viewport, 1 << 20);

    let mut red = |canvas: &mut strata_core::raster::Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, RED);
        true
    };
    let mut frame = cache.begin_frame().unwrap();
    frame.render_scenery(scenery(0, Rect32::new(0, 0, 64, 32), &mut red));
    let mut surface = RasterSurface::with_size(64, 32);
    frame.end(&mut surface, viewport).unwrap();

    let events = log.take();
    let begin_tiling = events
        .iter()
        .position(|e| matches!(e, BackendEvent::BeginTiling { tile_size: 32 }))
        .expect("begin_tiling recorded");
    let end_tiling = events
        .iter()
        .position(|e| matches!(e, BackendEvent::EndTiling))
        .expect("end_tiling recorded");
    let begin_frame = events
        .iter()
        .position(|e| matches!(e, BackendEvent::BeginFrame { .. }))
        .expect("begin_frame recorded");

    for (i, event) in events.iter().enumerate() {
        if matches!(event, BackendEvent::AllocateTile { .. }) {
            assert!(
                begin_tiling < i && i < end_tiling,
                "allocation outside the tiling batch:\n{}",
                format_events(&events)
            );
        }
    }
    assert!(
        end_tiling < begin_frame,
        "compositing must start after tiling ends:\n{}",
        format_events(&events)
    );
}

#[test]
fn snapshot_replays_the_same_traversal_offscreen() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let (mut cache, log) = cache_with_log(viewport, 1 << 20);

    let mut red = |canvas: &mut strata_core::raster::Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, RED);
        true
    };
    let mut frame = cache.begin_frame().unwrap();
    frame.render_scenery(scenery(0, Rect32::new(0, 0, 64, 32), &mut red));
    let mut surface = RasterSurface::with_size(64, 32);
    frame.end(&mut surface, viewport).unwrap();

    let frame_positions: Vec<i32> = log
        .take()
        .iter()
        .filter_map(|e| match e {
            BackendEvent::CompositeTile { x, .. } => Some(*x),
            _ => None,
        })
        .collect();

    let area = Rect32::new(0, 0, 64, 32);
    let _raster = cache.snapshot(area).unwrap();

    let events = log.take();
    assert!(matches!(events.first(), Some(BackendEvent::BeginSnapshot { area: a }) if *a == area));
    assert!(matches!(events.last(), Some(BackendEvent::EndSnapshot { .. })));
    let snapshot_positions: Vec<i32> = events
        .iter()
        .filter_map(|e| match e {
            BackendEvent::CompositeTile { x, .. } => Some(*x),
            _ => None,
        })
        .collect();
    assert_eq!(
        snapshot_positions, frame_positions,
        "snapshot must composite the identical tile sequence"
    );
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, BackendEvent::AllocateTile { .. } | BackendEvent::BeginTiling { .. })),
        "snapshots never touch the atlas"
    );
}

#[test]
fn zero_budget_invalidates_and_gates_the_next_frame() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let (mut cache, _log) = cache_with_log(viewport, 0);

    let mut red = |canvas: &mut strata_core::raster::Canvas<'_>, rect: Rect32| {
        canvas.fill_rect(rect, RED);
        true
    };
    let mut frame = cache.begin_frame().unwrap();
    frame.render_scenery(scenery(0, Rect32::new(0, 0, 64, 32), &mut red));
    let mut surface = RasterSurface::with_size(64, 32);
    assert_eq!(
        frame.end(&mut surface, viewport),
        Err(CompositorError::CacheInvalid)
    );

    assert!(!cache.is_valid());
    // Rejected until an explicit flush.
    assert!(matches!(
        cache.begin_frame().map(|_| ()),
        Err(CompositorError::CacheInvalid)
    ));
    cache.flush();
    assert!(cache.is_valid());
    assert!(cache.is_clean());
    assert!(cache.begin_frame().is_ok());
}

#[test]
fn set_compositor_cleans_up_the_old_backend() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let (mut cache, log) = cache_with_log(viewport, 1 << 20);

    assert!(cache.set_compositor(CompositorKind::HardwareAccelerated));
    let events = log.take();
    assert!(
        events.contains(&BackendEvent::Cleanup),
        "old backend must be torn down:\n{}",
        format_events(&events)
    );
    assert_eq!(
        cache.compositor_kind(),
        CompositorKind::HardwareAccelerated
    );
    assert!(cache.is_clean(), "a compositor swap re-tiles from scratch");
}

#[test]
fn transparent_layers_composite_nothing() {
    let viewport = Rect32::new(0, 0, 64, 32);
    let (mut cache, log) = cache_with_log(viewport, 1 << 20);

    // The callback paints nothing: the tile is fully transparent, stores
    // no pixels, and must not be composited.
    let mut empty = |_: &mut strata_core::raster::Canvas<'_>, _: Rect32| true;
    let mut frame = cache.begin_frame().unwrap();
    frame.render_scenery(SceneryLayer {
        id: 0,
        region: Rect32::new(0, 0, 64, 32),
        clip: Rect32::LARGEST,
        is_opaque: false,
        opacity: 255,
        blend: BlendMode::SrcOver,
        render: &mut empty,
    });
    let mut surface = RasterSurface::with_size(64, 32);
    frame.end(&mut surface, viewport).unwrap();

    let events = log.take();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, BackendEvent::AllocateTile { .. })),
        "transparent tiles must not allocate:\n{}",
        format_events(&events)
    );
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, BackendEvent::CompositeTile { .. })),
        "transparent tiles must not composite:\n{}",
        format_events(&events)
    );
}
