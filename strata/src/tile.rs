//! Tile and wall enumerations, and the immutable registry of tile behaviors.

use glam::IVec2;

use crate::tile_entity::{TileEntity, ChestTileEntity};
use crate::worldgen::GenError;


/// Internal macro to easily define an id registry with names.
macro_rules! ids {
    (
        $names:ident;
        $($ident:ident / $id:literal : $name:literal),* $(,)?
    ) => {

        static $names: [&'static str; 64] = {
            let mut arr = [""; 64];
            $(arr[$id as usize] = $name;)*
            arr
        };

        $(pub const $ident: u16 = $id;)*

    };
}

ids! {
    NAMES;
    AIR/0:          "air",
    DIRT/1:         "dirt",
    GRASS/2:        "grass",
    STONE/3:        "stone",
    SLATE/4:        "slate",
    SAND/5:         "sand",
    CLAY/6:         "clay",
    GRAVEL/7:       "gravel",
    WATER/8:        "water",
    LAVA/9:         "lava",
    COAL_ORE/10:    "coal_ore",
    COPPER_ORE/11:  "copper_ore",
    IRON_ORE/12:    "iron_ore",
    GOLD_ORE/13:    "gold_ore",
    LOG/14:         "log",
    LEAVES/15:      "leaves",
    BRICK/16:       "brick",
    MOSSY_BRICK/17: "mossy_brick",
    TORCH/18:       "torch",
    CHEST/19:       "chest",
    SPAWNER/20:     "spawner",
    SIGN/21:        "sign",
}

/// Find a tile name from its id, unknown tiles have an empty name.
#[inline]
pub fn name(id: u16) -> &'static str {
    NAMES.get(id as usize).copied().unwrap_or("")
}

/// Find a tile id from its name.
pub fn from_name(name: &str) -> Option<u16> {
    if name.is_empty() {
        return None;
    }
    NAMES.iter()
        .position(|&n| n == name)
        .map(|n| n as u16)
}


/// Wall enumeration, walls are the background layer behind tiles.
pub mod wall {

    ids! {
        WALL_NAMES;
        NONE/0:         "none",
        DIRT/1:         "dirt_wall",
        STONE/2:        "stone_wall",
        SLATE/3:        "slate_wall",
        BRICK/4:        "brick_wall",
    }

    /// Find a wall name from its id.
    #[inline]
    pub fn name(id: u16) -> &'static str {
        WALL_NAMES.get(id as usize).copied().unwrap_or("")
    }

}


/// The mutation surface given to tile hooks when a tile is placed or removed. This is
/// implemented by the generation provider, so hooks are bound to the same region
/// bounds as the stage that triggered them.
pub trait TileAccess {

    /// Get the tile id at the given position.
    fn tile_at(&mut self, pos: IVec2) -> Result<u16, GenError>;

    /// Set the tile entity at the given position.
    fn set_tile_entity_at(&mut self, pos: IVec2, tile_entity: TileEntity) -> Result<(), GenError>;

    /// Remove the tile entity at the given position, if any.
    fn remove_tile_entity_at(&mut self, pos: IVec2) -> Result<Option<TileEntity>, GenError>;

}

/// Shared and stateless behavior of a tile id.
pub trait TileBehavior: Send + Sync {

    /// Amount of light lost when light goes through this tile, at least 1.
    fn opacity(&self) -> u8 {
        4
    }

    /// Light level emitted by this tile.
    fn emission(&self) -> u8 {
        0
    }

    /// True if this tile blocks movement and supports other tiles.
    fn is_solid(&self) -> bool {
        true
    }

    /// True if this tile can be overwritten by structures without being considered
    /// as an obstacle.
    fn is_replaceable(&self) -> bool {
        false
    }

    /// Called just after this tile has been written at the given position.
    fn handle_place(&self, access: &mut dyn TileAccess, pos: IVec2) -> Result<(), GenError> {
        let _ = (access, pos);
        Ok(())
    }

    /// Called just before this tile is overwritten at the given position.
    fn handle_remove(&self, access: &mut dyn TileAccess, pos: IVec2) -> Result<(), GenError> {
        let _ = (access, pos);
        Ok(())
    }

}

/// Behavior of the empty tile.
#[derive(Debug)]
pub struct AirBehavior;

impl TileBehavior for AirBehavior {

    fn opacity(&self) -> u8 {
        1
    }

    fn is_solid(&self) -> bool {
        false
    }

    fn is_replaceable(&self) -> bool {
        true
    }

}

/// Behavior of a plain solid tile, this is the behavior of unregistered ids.
#[derive(Debug)]
pub struct SolidBehavior;

impl TileBehavior for SolidBehavior { }

/// Behavior of non-solid tiles letting some light through, like leaves or water.
#[derive(Debug)]
pub struct TranslucentBehavior {
    pub opacity: u8,
    pub replaceable: bool,
}

impl TileBehavior for TranslucentBehavior {

    fn opacity(&self) -> u8 {
        self.opacity.max(1)
    }

    fn is_solid(&self) -> bool {
        false
    }

    fn is_replaceable(&self) -> bool {
        self.replaceable
    }

}

/// Behavior of a tile emitting light.
#[derive(Debug)]
pub struct EmitterBehavior {
    pub emission: u8,
    pub opacity: u8,
}

impl TileBehavior for EmitterBehavior {

    fn opacity(&self) -> u8 {
        self.opacity.max(1)
    }

    fn emission(&self) -> u8 {
        self.emission.min(15)
    }

    fn is_solid(&self) -> bool {
        false
    }

}

/// Behavior of a container tile, which owns a chest tile entity for as long as it
/// is placed.
#[derive(Debug)]
pub struct ContainerBehavior {
    /// Loot table given to new chests.
    pub loot_table: &'static str,
}

impl TileBehavior for ContainerBehavior {

    fn handle_place(&self, access: &mut dyn TileAccess, pos: IVec2) -> Result<(), GenError> {
        // The loot seed only depends on the position, so it is reproducible.
        let loot_seed = (pos.x as i64).wrapping_mul(0x9E3779B97F4A7C15u64 as i64) ^ (pos.y as i64).wrapping_mul(0x632BE59BD9B4E019);
        access.set_tile_entity_at(pos, TileEntity::Chest(ChestTileEntity {
            loot_table: self.loot_table.into(),
            loot_seed,
        }))
    }

    fn handle_remove(&self, access: &mut dyn TileAccess, pos: IVec2) -> Result<(), GenError> {
        access.remove_tile_entity_at(pos)?;
        Ok(())
    }

}


/// Immutable table from tile id to its behavior. It is built once before generation
/// and then shared between all workers.
pub struct TileRegistry {
    behaviors: Vec<Option<Box<dyn TileBehavior>>>,
}

static SOLID: SolidBehavior = SolidBehavior;

impl TileRegistry {

    /// Create an empty registry where only air is registered, every other id behaves
    /// as a solid tile.
    pub fn new() -> Self {
        let mut registry = Self { behaviors: Vec::new() };
        registry.register(AIR, AirBehavior);
        registry
    }

    /// Create the registry with behaviors for all known tiles.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(WATER, TranslucentBehavior { opacity: 2, replaceable: true });
        registry.register(LEAVES, TranslucentBehavior { opacity: 2, replaceable: true });
        registry.register(LAVA, EmitterBehavior { emission: 15, opacity: 3 });
        registry.register(TORCH, EmitterBehavior { emission: 14, opacity: 1 });
        registry.register(CHEST, ContainerBehavior { loot_table: "chest/common" });
        registry.register(SIGN, TranslucentBehavior { opacity: 1, replaceable: false });
        registry
    }

    /// Register the behavior of the given tile id, replacing any previous one.
    pub fn register(&mut self, id: u16, behavior: impl TileBehavior + 'static) {
        let index = id as usize;
        if self.behaviors.len() <= index {
            self.behaviors.resize_with(index + 1, || None);
        }
        self.behaviors[index] = Some(Box::new(behavior));
    }

    /// Get the behavior of the given tile id.
    #[inline]
    pub fn get(&self, id: u16) -> &dyn TileBehavior {
        match self.behaviors.get(id as usize) {
            Some(Some(behavior)) => &**behavior,
            _ => &SOLID,
        }
    }

}

impl Default for TileRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
