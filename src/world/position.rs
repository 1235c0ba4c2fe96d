use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldId(pub u16);

/// Block position inside one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub world: WorldId,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Coarse grid cell used to pick the simulation queue a task rejoins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionCoord {
    pub world: WorldId,
    pub x: i32,
    pub z: i32,
}

pub const REGION_SHIFT: u32 = 4;

impl Position {
    pub fn new(world: WorldId, x: i32, y: i32, z: i32) -> Self {
        Self { world, x, y, z }
    }

    /// Squared euclidean distance, or `None` across worlds.
    pub fn distance_squared(self, other: Position) -> Option<i64> {
        if self.world != other.world {
            return None;
        }
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        let dz = i64::from(self.z) - i64::from(other.z);
        Some(dx * dx + dy * dy + dz * dz)
    }

    pub fn within(self, other: Position, range: u32) -> bool {
        let range = i64::from(range);
        self.distance_squared(other)
            .map_or(false, |distance| distance <= range * range)
    }

    pub fn region(self) -> RegionCoord {
        RegionCoord {
            world: self.world,
            x: self.x >> REGION_SHIFT,
            z: self.z >> REGION_SHIFT,
        }
    }

    pub fn above(self) -> Option<Self> {
        Some(Self {
            y: self.y.checked_add(1)?,
            ..self
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:({},{},{})", self.world.0, self.x, self.y, self.z)
    }
}
