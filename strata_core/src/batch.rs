// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Quad vertex batches for draw-call coalescing.
//!
//! Hardware-style backends accumulate up to [`BATCH_QUADS`] quads of one
//! kind (textured from a single atlas page, or flat-colored) and flush
//! them as one buffer upload. Batches are flushed unconditionally at layer
//! boundaries and frame/snapshot ends so draws are never reordered across a
//! paint-order boundary; [`QuadBatch::is_full`] tells the backend when an
//! append needs a flush first.

use alloc::vec::Vec;

use bytemuck::{Pod, Zeroable};

use crate::color::PackedColor;

/// Maximum quads buffered per batch before a flush is forced.
pub const BATCH_QUADS: usize = 16;

/// Vertices per quad (drawn as a four-vertex triangle strip).
pub const QUAD_VERTICES: usize = 4;

/// One vertex of a textured (atlas-sampled) quad.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TextureVertex {
    /// Position in target pixels.
    pub position: [f32; 2],
    /// Normalized atlas texture coordinates.
    pub uv: [f32; 2],
}

/// One vertex of a flat-colored quad.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ColorVertex {
    /// Position in target pixels.
    pub position: [f32; 2],
    /// Packed premultiplied color, already scaled by the layer opacity.
    pub color: u32,
}

/// A fixed-capacity accumulation buffer of quads of one kind.
#[derive(Clone, Debug)]
pub struct QuadBatch<V> {
    vertices: Vec<V>,
}

impl<V: Copy> Default for QuadBatch<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Copy> QuadBatch<V> {
    /// Creates an empty batch with full capacity reserved.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vertices: Vec::with_capacity(BATCH_QUADS * QUAD_VERTICES),
        }
    }

    /// Returns `true` when no quads are pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Returns `true` when another quad would not fit.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.vertices.len() + QUAD_VERTICES > BATCH_QUADS * QUAD_VERTICES
    }

    /// Number of buffered quads.
    #[inline]
    #[must_use]
    pub fn quads(&self) -> usize {
        self.vertices.len() / QUAD_VERTICES
    }

    /// Appends one quad.
    ///
    /// # Panics
    ///
    /// Panics if the batch is full; callers flush first.
    pub fn push(&mut self, quad: [V; QUAD_VERTICES]) {
        assert!(!self.is_full(), "quad batch overflow; flush before pushing");
        self.vertices.extend_from_slice(&quad);
    }

    /// The buffered vertices, four per quad in strip order.
    #[inline]
    #[must_use]
    pub fn vertices(&self) -> &[V] {
        &self.vertices
    }

    /// Empties the batch (after the backend has issued its draws).
    pub fn clear(&mut self) {
        self.vertices.clear();
    }
}

/// Builds a textured quad covering the `size`-pixel tile at `(x, y)` with
/// the normalized uv box `(u0, v0)..(u1, v1)`, in triangle-strip order.
#[must_use]
pub fn tile_quad(x: i32, y: i32, size: i32, uv: [f32; 4]) -> [TextureVertex; QUAD_VERTICES] {
    let (x0, y0) = (x as f32, y as f32);
    let (x1, y1) = ((x + size) as f32, (y + size) as f32);
    let [u0, v0, u1, v1] = uv;
    [
        TextureVertex {
            position: [x0, y1],
            uv: [u0, v1],
        },
        TextureVertex {
            position: [x1, y1],
            uv: [u1, v1],
        },
        TextureVertex {
            position: [x0, y0],
            uv: [u0, v0],
        },
        TextureVertex {
            position: [x1, y0],
            uv: [u1, v0],
        },
    ]
}

/// Builds a flat-colored quad covering the `size`-pixel tile at `(x, y)`,
/// in triangle-strip order.
#[must_use]
pub fn rect_quad(x: i32, y: i32, size: i32, color: PackedColor) -> [ColorVertex; QUAD_VERTICES] {
    let (x0, y0) = (x as f32, y as f32);
    let (x1, y1) = ((x + size) as f32, (y + size) as f32);
    let c = color.0;
    [
        ColorVertex {
            position: [x0, y1],
            color: c,
        },
        ColorVertex {
            position: [x1, y1],
            color: c,
        },
        ColorVertex {
            position: [x0, y0],
            color: c,
        },
        ColorVertex {
            position: [x1, y0],
            color: c,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_fills_at_sixteen_quads() {
        let mut batch = QuadBatch::new();
        for i in 0..BATCH_QUADS {
            assert!(!batch.is_full(), "batch full after only {i} quads");
            batch.push(rect_quad(0, 0, 16, PackedColor(0xffff_ffff)));
        }
        assert!(batch.is_full());
        assert_eq!(batch.quads(), BATCH_QUADS);
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    #[should_panic(expected = "quad batch overflow")]
    fn push_past_capacity_panics() {
        let mut batch = QuadBatch::new();
        for _ in 0..=BATCH_QUADS {
            batch.push(rect_quad(0, 0, 16, PackedColor(0)));
        }
    }

    #[test]
    fn tile_quad_strip_order_matches_layout() {
        let q = tile_quad(10, 20, 32, [0.0, 0.5, 0.25, 0.75]);
        assert_eq!(q[0].position, [10.0, 52.0]);
        assert_eq!(q[1].position, [42.0, 52.0]);
        assert_eq!(q[2].position, [10.0, 20.0]);
        assert_eq!(q[3].position, [42.0, 20.0]);
        assert_eq!(q[2].uv, [0.0, 0.5]);
        assert_eq!(q[1].uv, [0.25, 0.75]);
    }

    #[test]
    fn vertex_layouts_are_tightly_packed() {
        assert_eq!(core::mem::size_of::<TextureVertex>(), 16);
        assert_eq!(core::mem::size_of::<ColorVertex>(), 12);
    }
}
