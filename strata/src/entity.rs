//! Entity spawn descriptions emitted by generation.

use arcstr::ArcStr;
use glam::DVec2;


/// An entity to be added to the world once the region that produced it becomes active.
/// The entity system itself is an external collaborator, so only the kind and position
/// are known here.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySpawn {
    /// Identifier of the entity kind, resolved by the entity system.
    pub kind: ArcStr,
    /// Position of the entity, in tile units.
    pub pos: DVec2,
}

impl EntitySpawn {

    #[inline]
    pub fn new(kind: impl Into<ArcStr>, pos: DVec2) -> Self {
        Self { kind: kind.into(), pos }
    }

    /// The tile this entity stands in.
    #[inline]
    pub fn tile_pos(&self) -> glam::IVec2 {
        self.pos.floor().as_ivec2()
    }

}
