//! Tile entities are the sparse, per-tile data attached to some tiles. Only their
//! generation-time description is stored here, the simulation that runs them is an
//! external concern.

use arcstr::ArcStr;


/// All kinds of tile entities.
#[derive(Debug, Clone, PartialEq)]
pub enum TileEntity {
    Chest(ChestTileEntity),
    Sign(SignTileEntity),
    Spawner(SpawnerTileEntity),
}

/// A chest whose content is rolled later from a loot table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChestTileEntity {
    /// Identifier of the loot table used to fill the chest.
    pub loot_table: ArcStr,
    /// Seed used when rolling the loot table.
    pub loot_seed: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignTileEntity {
    pub text: ArcStr,
}

/// A spawner periodically spawning the given entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnerTileEntity {
    /// Kind of entity to spawn.
    pub entity: ArcStr,
    /// Remaining ticks before the next spawn.
    pub delay: u16,
}

impl TileEntity {

    /// Numeric tag of the tile entity kind, used by the region codec.
    pub fn tag(&self) -> u8 {
        match self {
            TileEntity::Chest(_) => 0,
            TileEntity::Sign(_) => 1,
            TileEntity::Spawner(_) => 2,
        }
    }

}
