// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call recording for compositor backends.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::rc::Rc;

use strata_core::atlas::TileHandle;
use strata_core::color::PackedColor;
use strata_core::compositor::{
    BlendMode, Compositor, CompositorError, CompositorFactory, CompositorKind, Phase,
};
use strata_core::geom::Rect32;
use strata_core::raster::Raster;
use strata_core::surface::{RenderSurface, TargetKind};

/// One recorded backend call. Variants mirror the [`Compositor`] methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// `cleanup` was called.
    Cleanup,
    /// `flush` was called.
    Flush,
    /// `begin_tiling` was called.
    BeginTiling {
        /// Tile size opening the batch.
        tile_size: u32,
    },
    /// `end_tiling` was called.
    EndTiling,
    /// `allocate_tile` succeeded.
    AllocateTile {
        /// The handle minted for the tile.
        tile: TileHandle,
    },
    /// `deallocate_tile` was called.
    DeallocateTile {
        /// The returned handle.
        tile: TileHandle,
    },
    /// `begin_frame` succeeded.
    BeginFrame {
        /// Dirty region passed by the caller.
        dirty: Rect32,
    },
    /// `end_frame` was called.
    EndFrame,
    /// `begin_layer` was called.
    BeginLayer {
        /// Scissor rectangle.
        clip: Rect32,
        /// Layer opacity.
        opacity: u8,
        /// Layer blend mode.
        blend: BlendMode,
    },
    /// `end_layer` was called.
    EndLayer,
    /// `composite_tile` succeeded.
    CompositeTile {
        /// Target x in content coordinates.
        x: i32,
        /// Target y in content coordinates.
        y: i32,
        /// The composited tile.
        tile: TileHandle,
    },
    /// `composite_rect` succeeded.
    CompositeRect {
        /// Target x in content coordinates.
        x: i32,
        /// Target y in content coordinates.
        y: i32,
        /// Queued color (premultiplied by the layer opacity).
        color: PackedColor,
    },
    /// `begin_snapshot` succeeded.
    BeginSnapshot {
        /// Snapshot area.
        area: Rect32,
    },
    /// `end_snapshot` was called.
    EndSnapshot {
        /// Snapshot area.
        area: Rect32,
    },
}

/// A shared, clonable view of a recording backend's event list.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<BackendEvent>>>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the events recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BackendEvent> {
        self.events.borrow().clone()
    }

    /// Removes and returns the events recorded so far.
    #[must_use]
    pub fn take(&self) -> Vec<BackendEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    fn push(&self, event: BackendEvent) {
        self.events.borrow_mut().push(event);
    }
}

/// Formats events one per line, for test failure output and dumps.
#[must_use]
pub fn format_events(events: &[BackendEvent]) -> String {
    let mut out = String::new();
    for (i, event) in events.iter().enumerate() {
        let _ = writeln!(out, "{i:4}  {event:?}");
    }
    out
}

/// A [`Compositor`] that records calls instead of drawing.
///
/// Tile handles are minted from a counter; composite calls against handles
/// that were never allocated (or were deallocated) fail with
/// [`CompositorError::StaleTile`], and the shared [`Phase`] machine panics
/// on protocol violations exactly like the real backends.
#[derive(Debug)]
pub struct RecordingCompositor {
    kind: CompositorKind,
    log: EventLog,
    phase: Phase,
    next_tile: u32,
    live: BTreeSet<(u32, u32)>,
    /// When `true`, every `allocate_tile` fails (for invalidity-gate
    /// tests).
    pub fail_allocations: bool,
}

impl RecordingCompositor {
    /// Creates a recorder posing as the given backend kind, appending to
    /// `log`.
    #[must_use]
    pub fn new(kind: CompositorKind, log: EventLog) -> Self {
        Self {
            kind,
            log,
            phase: Phase::default(),
            next_tile: 0,
            live: BTreeSet::new(),
            fail_allocations: false,
        }
    }

    /// The log this recorder appends to.
    #[must_use]
    pub fn log(&self) -> EventLog {
        self.log.clone()
    }
}

impl Compositor for RecordingCompositor {
    fn kind(&self) -> CompositorKind {
        self.kind
    }

    fn cleanup(&mut self) {
        self.log.push(BackendEvent::Cleanup);
        self.live.clear();
    }

    fn flush(&mut self) {
        self.log.push(BackendEvent::Flush);
    }

    fn begin_tiling(&mut self, tile_size: u32) -> Result<(), CompositorError> {
        self.phase.begin_tiling();
        self.log.push(BackendEvent::BeginTiling { tile_size });
        Ok(())
    }

    fn end_tiling(&mut self) -> Result<(), CompositorError> {
        self.phase.end_tiling();
        self.log.push(BackendEvent::EndTiling);
        Ok(())
    }

    fn allocate_tile(
        &mut self,
        _size: u32,
        _pixels: &[u32],
        _stride_px: usize,
    ) -> Result<TileHandle, CompositorError> {
        if self.fail_allocations {
            return Err(CompositorError::TextureCreation);
        }
        let tile = TileHandle::from_raw_parts(self.next_tile, 0, 0);
        self.next_tile += 1;
        self.live.insert((tile.page(), tile.slot()));
        self.log.push(BackendEvent::AllocateTile { tile });
        Ok(tile)
    }

    fn deallocate_tile(&mut self, tile: TileHandle) {
        self.live.remove(&(tile.page(), tile.slot()));
        self.log.push(BackendEvent::DeallocateTile { tile });
    }

    fn begin_frame(
        &mut self,
        surface: &mut dyn RenderSurface,
        dirty: Rect32,
    ) -> Result<(), CompositorError> {
        if surface.lock_target(TargetKind::Raster).is_none() {
            return Err(CompositorError::TargetLock);
        }
        self.phase.begin_frame();
        self.log.push(BackendEvent::BeginFrame { dirty });
        Ok(())
    }

    fn end_frame(&mut self, surface: &mut dyn RenderSurface) -> Result<(), CompositorError> {
        self.phase.end_frame();
        surface.unlock_target();
        self.log.push(BackendEvent::EndFrame);
        Ok(())
    }

    fn begin_layer(
        &mut self,
        clip: Rect32,
        opacity: u8,
        blend: BlendMode,
    ) -> Result<(), CompositorError> {
        self.phase.begin_layer();
        self.log.push(BackendEvent::BeginLayer {
            clip,
            opacity,
            blend,
        });
        Ok(())
    }

    fn end_layer(&mut self) -> Result<(), CompositorError> {
        self.phase.end_layer();
        self.log.push(BackendEvent::EndLayer);
        Ok(())
    }

    fn composite_tile(&mut self, x: i32, y: i32, tile: TileHandle) -> Result<(), CompositorError> {
        assert!(self.phase.rendering(), "composite_tile outside a frame");
        if !self.live.contains(&(tile.page(), tile.slot())) {
            return Err(CompositorError::StaleTile);
        }
        self.log.push(BackendEvent::CompositeTile { x, y, tile });
        Ok(())
    }

    fn composite_rect(
        &mut self,
        x: i32,
        y: i32,
        color: PackedColor,
    ) -> Result<(), CompositorError> {
        assert!(self.phase.rendering(), "composite_rect outside a frame");
        self.log.push(BackendEvent::CompositeRect { x, y, color });
        Ok(())
    }

    fn begin_snapshot(
        &mut self,
        area: Rect32,
        _target: &mut Raster,
    ) -> Result<(), CompositorError> {
        self.phase.begin_snapshot();
        self.log.push(BackendEvent::BeginSnapshot { area });
        Ok(())
    }

    fn end_snapshot(&mut self, area: Rect32, _target: &mut Raster) -> Result<(), CompositorError> {
        self.phase.end_snapshot();
        self.log.push(BackendEvent::EndSnapshot { area });
        Ok(())
    }
}

/// A factory handing out [`RecordingCompositor`]s for every kind, all
/// appending to one shared log.
#[derive(Clone, Debug, Default)]
pub struct RecordingFactory {
    log: EventLog,
}

impl RecordingFactory {
    /// Creates a factory with a fresh log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The log every created backend appends to.
    #[must_use]
    pub fn log(&self) -> EventLog {
        self.log.clone()
    }
}

impl CompositorFactory for RecordingFactory {
    fn create(&self, kind: CompositorKind) -> Option<Box<dyn Compositor>> {
        Some(Box::new(RecordingCompositor::new(kind, self.log.clone())))
    }
}
