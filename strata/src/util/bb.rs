//! Tile-aligned rectangles.

use std::fmt;

use glam::IVec2;


/// An axis-aligned rectangle of tiles, the minimum is inclusive and the maximum is
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileRect {
    pub min: IVec2,
    pub max: IVec2,
}

impl TileRect {

    pub const fn new(min: IVec2, max: IVec2) -> Self {
        Self {
            min,
            max,
        }
    }

    /// Construct a rectangle from its minimum corner and its size.
    pub fn from_size(min: IVec2, size: IVec2) -> Self {
        Self::new(min, min + size)
    }

    pub fn size(self) -> IVec2 {
        self.max - self.min
    }

    pub fn is_empty(self) -> bool {
        self.max.x <= self.min.x || self.max.y <= self.min.y
    }

    /// Offset this rectangle by the given delta.
    pub fn offset(self, delta: IVec2) -> Self {
        Self::new(self.min + delta, self.max + delta)
    }

    /// Expand this rectangle in all direction by the given delta.
    pub fn inflate(self, delta: i32) -> Self {
        Self::new(self.min - delta, self.max + delta)
    }

    /// Return true if this rectangle contains the given tile.
    pub fn contains(self, pos: IVec2) -> bool {
        pos.x >= self.min.x && pos.x < self.max.x &&
        pos.y >= self.min.y && pos.y < self.max.y
    }

    /// Return true if every tile of the given rectangle is in this one, an empty
    /// rectangle is contained in any rectangle.
    pub fn contains_rect(self, other: Self) -> bool {
        other.is_empty() || (other.min.cmpge(self.min).all() && other.max.cmple(self.max).all())
    }

    /// Return the intersection of both rectangles, which may be empty.
    pub fn intersection(self, other: Self) -> Self {
        Self::new(self.min.max(other.min), self.max.min(other.max))
    }

    /// Return true if this rectangle shares at least one tile with the given one.
    pub fn intersects(self, other: Self) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Iterate over every tile of this rectangle, rows first.
    pub fn iter(self) -> impl Iterator<Item = IVec2> {
        (self.min.y..self.max.y).flat_map(move |y| {
            (self.min.x..self.max.x).map(move |x| IVec2::new(x, y))
        })
    }

}

impl fmt::Display for TileRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
