// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The render-surface boundary to the platform layer.
//!
//! The platform hands the cache a [`RenderSurface`]; the backend locks it
//! for exactly the span of one frame, downcasting the opaque target to the
//! resource type named by its [`TargetKind`]. Lock failure (for example a
//! target already locked by another caller) aborts the frame before any
//! drawing happens.

use core::any::Any;
use core::fmt;

use crate::raster::Raster;

/// The platform resource type a backend expects to find behind
/// [`RenderSurface::lock_target`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// A [`Raster`] pixel buffer (software and vector backends).
    Raster,
    /// A wgpu target bundle (hardware backend).
    Wgpu,
}

/// A destination surface supplied by the window-system layer.
pub trait RenderSurface {
    /// Acquires exclusive access to the target resource of the given kind.
    ///
    /// Returns `None` when the surface cannot provide that kind or is
    /// already locked.
    fn lock_target(&mut self, kind: TargetKind) -> Option<&mut dyn Any>;

    /// Releases the lock taken by `lock_target`.
    fn unlock_target(&mut self);
}

/// The simplest surface: an owned [`Raster`] presented as the target.
///
/// Used by the CPU backends and throughout the test suites.
pub struct RasterSurface {
    raster: Raster,
    locked: bool,
}

impl fmt::Debug for RasterSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterSurface")
            .field("width", &self.raster.width())
            .field("height", &self.raster.height())
            .field("locked", &self.locked)
            .finish()
    }
}

impl RasterSurface {
    /// Wraps a raster as a lockable surface.
    #[must_use]
    pub const fn new(raster: Raster) -> Self {
        Self {
            raster,
            locked: false,
        }
    }

    /// Allocates a transparent surface of the given size.
    #[must_use]
    pub fn with_size(width: i32, height: i32) -> Self {
        Self::new(Raster::new(width, height))
    }

    /// Read access to the presented pixels.
    #[must_use]
    pub const fn raster(&self) -> &Raster {
        &self.raster
    }

    /// Consumes the surface, returning the pixels.
    #[must_use]
    pub fn into_raster(self) -> Raster {
        self.raster
    }
}

impl RenderSurface for RasterSurface {
    fn lock_target(&mut self, kind: TargetKind) -> Option<&mut dyn Any> {
        if kind != TargetKind::Raster || self.locked {
            return None;
        }
        self.locked = true;
        Some(&mut self.raster)
    }

    fn unlock_target(&mut self) {
        self.locked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_downcasts_to_raster() {
        let mut surface = RasterSurface::with_size(8, 8);
        let target = surface.lock_target(TargetKind::Raster).unwrap();
        assert!(target.downcast_mut::<Raster>().is_some());
    }

    #[test]
    fn double_lock_fails_until_unlocked() {
        let mut surface = RasterSurface::with_size(8, 8);
        assert!(surface.lock_target(TargetKind::Raster).is_some());
        assert!(surface.lock_target(TargetKind::Raster).is_none());
        surface.unlock_target();
        assert!(surface.lock_target(TargetKind::Raster).is_some());
    }

    #[test]
    fn wrong_kind_fails() {
        let mut surface = RasterSurface::with_size(8, 8);
        assert!(surface.lock_target(TargetKind::Wgpu).is_none());
    }
}
