//! Coordinate conventions of the terrain.
//!
//! The [`Storage`](crate::terrain_data::storage::Storage) describes the terrain in its own
//! grid space, where x and y span the horizontal plane and z is the height.
//! The [`Alignment`] decides how this grid space maps onto the world axes.
//! Every position and bounding box crossing from grid space into world space
//! (and back) passes through the conversions in this module.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

/// The world plane the terrain is authored on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Alignment {
    /// The terrain lies in the xy plane, heights point along z.
    #[default]
    XY,
    /// The terrain lies in the xz plane, heights point along y.
    /// Grid y maps onto negative world z, so that -z points into the screen.
    XZ,
    /// The terrain lies in the yz plane, heights point along x.
    YZ,
}

impl Alignment {
    /// Converts a position from grid space into world space.
    pub fn convert_position(self, position: Vec3) -> Vec3 {
        let Vec3 { x, y, z } = position;

        match self {
            Alignment::XY => position,
            Alignment::XZ => Vec3::new(x, z, -y),
            Alignment::YZ => Vec3::new(y, z, x),
        }
    }

    /// Converts a position from world space back into grid space.
    pub fn unconvert_position(self, position: Vec3) -> Vec3 {
        let Vec3 { x, y, z } = position;

        match self {
            Alignment::XY => position,
            Alignment::XZ => Vec3::new(x, -z, y),
            Alignment::YZ => Vec3::new(z, x, y),
        }
    }

    /// Converts a bounding box from grid space into world space.
    pub fn convert_bounds(self, aabb: TerrainAabb) -> TerrainAabb {
        if aabb.is_empty() {
            return aabb;
        }

        let mut min = self.convert_position(aabb.min);
        let mut max = self.convert_position(aabb.max);

        if self == Alignment::XZ {
            // the sign of z flipped, so the corners swap along that axis
            std::mem::swap(&mut min.z, &mut max.z);
        }

        TerrainAabb { min, max }
    }
}

/// An axis aligned bounding box, which may be empty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TerrainAabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for TerrainAabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl TerrainAabb {
    /// The box containing nothing. Merging with it is a no-op.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) / 2.0
    }

    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }

        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn translated(self, offset: Vec3) -> Self {
        if self.is_empty() {
            return self;
        }

        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// The euclidean distance from the point to the closest point of the box.
    /// Points inside the box have a distance of zero.
    pub fn distance(&self, point: Vec3) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }

        // get box closest point by clamping
        let closest = point.clamp(self.min, self.max);
        closest.distance(point)
    }
}

/// Returns the smallest power of two greater than or equal to `value`.
/// Values below one round up to one.
pub fn next_power_of_two(value: i32) -> i32 {
    if value <= 1 {
        return 1;
    }

    (value as u32).next_power_of_two() as i32
}
