//! Temporary obstacles and their rasterization onto tile layers

use glam::{Vec2, Vec3};

use navkit::NULL_AREA;
use navkit_common::{Error, Result};

use crate::tile_cache::CompressedTileRef;
use crate::tile_cache_data::TileCacheLayer;

/// Obstacle reference: `(salt << 16) | index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ObstacleRef(u32);

impl ObstacleRef {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> u32 {
        self.0
    }

    pub const fn encode(salt: u16, index: usize) -> Self {
        Self(((salt as u32) << 16) | (index as u32 & 0xffff))
    }

    pub const fn salt(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn index(&self) -> usize {
        (self.0 & 0xffff) as usize
    }
}

/// Lifecycle of an obstacle slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ObstacleState {
    /// Slot is free
    #[default]
    Empty,
    /// Added, some touched tiles still wait for a rebuild
    Processing,
    /// Carved into every touched tile
    Processed,
    /// Removal requested, some touched tiles still wait for a rebuild
    Removing,
}

/// Obstacle geometry
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ObstacleShape {
    /// Upright cylinder standing on `pos`
    Cylinder { pos: [f32; 3], radius: f32, height: f32 },
    /// Axis-aligned box
    Box { bmin: [f32; 3], bmax: [f32; 3] },
    /// Box rotated around the Y axis
    ///
    /// `rot_aux` holds half the sine and cosine of the rotation, see
    /// [`ObstacleShape::oriented_box`].
    OrientedBox {
        center: [f32; 3],
        half_extents: [f32; 3],
        rot_aux: [f32; 2],
    },
}

impl ObstacleShape {
    /// Box around `center` rotated by `y_radians` around the Y axis
    pub fn oriented_box(center: [f32; 3], half_extents: [f32; 3], y_radians: f32) -> Self {
        let cos_half = (0.5 * y_radians).cos();
        let sin_half = (-0.5 * y_radians).sin();
        Self::OrientedBox {
            center,
            half_extents,
            rot_aux: [cos_half * sin_half, cos_half * cos_half - 0.5],
        }
    }

    pub fn validate(&self) -> Result<()> {
        let finite = |v: &[f32]| v.iter().all(|x| x.is_finite());
        let ok = match self {
            Self::Cylinder {
                pos,
                radius,
                height,
            } => finite(pos) && *radius > 0.0 && *height > 0.0 && radius.is_finite(),
            Self::Box { bmin, bmax } => {
                finite(bmin) && finite(bmax) && (0..3).all(|k| bmin[k] <= bmax[k])
            }
            Self::OrientedBox {
                center,
                half_extents,
                rot_aux,
            } => finite(center) && finite(rot_aux) && half_extents.iter().all(|h| *h > 0.0),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("degenerate obstacle {self:?}")))
        }
    }

    /// World-space bounding box
    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        match self {
            Self::Cylinder {
                pos,
                radius,
                height,
            } => (
                [pos[0] - radius, pos[1], pos[2] - radius],
                [pos[0] + radius, pos[1] + height, pos[2] + radius],
            ),
            Self::Box { bmin, bmax } => (*bmin, *bmax),
            Self::OrientedBox {
                center,
                half_extents,
                ..
            } => {
                // Covers every rotation of the box footprint
                let max_r = 1.41 * half_extents[0].max(half_extents[2]);
                (
                    [center[0] - max_r, center[1] - half_extents[1], center[2] - max_r],
                    [center[0] + max_r, center[1] + half_extents[1], center[2] + max_r],
                )
            }
        }
    }

    /// Whether the column through a cell center at `p` hits the shape footprint
    fn covers(&self, p: Vec3, cs: f32) -> bool {
        let pad = 0.5 * cs;
        match self {
            Self::Cylinder { pos, radius, .. } => {
                let d = Vec2::new(p.x - pos[0], p.z - pos[2]);
                d.length_squared() <= (radius + pad) * (radius + pad)
            }
            Self::Box { bmin, bmax } => {
                p.x >= bmin[0] - pad
                    && p.x <= bmax[0] + pad
                    && p.z >= bmin[2] - pad
                    && p.z <= bmax[2] + pad
            }
            Self::OrientedBox {
                center,
                half_extents,
                rot_aux,
            } => {
                let dx = p.x - center[0];
                let dz = p.z - center[2];
                let x_rot = 2.0 * (rot_aux[1] * dx + rot_aux[0] * dz);
                let z_rot = 2.0 * (rot_aux[1] * dz - rot_aux[0] * dx);
                x_rot.abs() <= half_extents[0] + pad && z_rot.abs() <= half_extents[2] + pad
            }
        }
    }

    /// Marks covered walkable cells of `layer` as unwalkable
    ///
    /// A cell is covered when its center column hits the footprint and its
    /// surface lies within the shape's vertical extent. Returns the number of
    /// carved cells.
    pub fn rasterize(&self, layer: &mut TileCacheLayer, cs: f32, ch: f32) -> usize {
        let (bmin, bmax) = self.bounds();
        let orig = Vec3::from(layer.header.bmin);
        let w = layer.width() as i32;
        let h = layer.height() as i32;

        let x0 = (((bmin[0] - orig.x) / cs).floor() as i32 - 1).max(0);
        let x1 = (((bmax[0] - orig.x) / cs).floor() as i32 + 1).min(w - 1);
        let z0 = (((bmin[2] - orig.z) / cs).floor() as i32 - 1).max(0);
        let z1 = (((bmax[2] - orig.z) / cs).floor() as i32 + 1).min(h - 1);
        if x0 > x1 || z0 > z1 {
            return 0;
        }

        let mut carved = 0;
        for z in z0..=z1 {
            for x in x0..=x1 {
                let idx = (z * w + x) as usize;
                if layer.areas[idx] == NULL_AREA {
                    continue;
                }
                let y = orig.y + layer.heights[idx] as f32 * ch;
                if y < bmin[1] || y > bmax[1] {
                    continue;
                }
                let center = Vec3::new(
                    orig.x + (x as f32 + 0.5) * cs,
                    y,
                    orig.z + (z as f32 + 0.5) * cs,
                );
                if self.covers(center, cs) {
                    layer.areas[idx] = NULL_AREA;
                    carved += 1;
                }
            }
        }
        carved
    }
}

/// Obstacle slot in the tile cache
#[derive(Debug, Clone)]
pub struct Obstacle {
    pub shape: ObstacleShape,
    pub state: ObstacleState,
    pub salt: u16,
    /// Tiles overlapped when the obstacle was added
    pub touched: Vec<CompressedTileRef>,
    /// Touched tiles not yet rebuilt since the last state change
    pub pending: Vec<CompressedTileRef>,
}

impl Default for Obstacle {
    fn default() -> Self {
        Self {
            shape: ObstacleShape::Box {
                bmin: [0.0; 3],
                bmax: [0.0; 3],
            },
            state: ObstacleState::Empty,
            salt: 1,
            touched: Vec::new(),
            pending: Vec::new(),
        }
    }
}
