//! Dungeon structure, a brick room with a spawner, chests and guardians.

use glam::{DVec2, IVec2};

use crate::tile_entity::{TileEntity, SpawnerTileEntity};
use crate::region::{StructureVariant, REGION_SIZE};
use crate::util::{SeededRandom, TileRect};
use crate::entity::EntitySpawn;
use crate::tile::{self, wall};

use super::{GenContext, GenProvider, GenError, Structure, TerrainStage};


/// Kinds of entities guarding dungeons, a kind may appear several times to make it
/// more likely.
const GUARDIANS: &[&str] = &["skeleton", "zombie", "zombie", "spider"];


/// The shape of a dungeon, fully derived from its variant.
struct DungeonShape {
    /// Number of interior columns on each side of the origin.
    half_width: i32,
    /// Interior height.
    height: i32,
    /// Random generator for everything decided after the shape.
    rand: SeededRandom,
}

impl DungeonShape {

    fn new(variant: StructureVariant) -> Self {
        let mut rand = SeededRandom::new(variant.seed);
        Self {
            half_width: rand.next_int_range(3, 5),
            height: rand.next_int_range(4, 5),
            rand,
        }
    }

    /// The rectangle of the room, shell included.
    fn rect(&self, origin: IVec2) -> TileRect {
        TileRect::new(
            origin - IVec2::new(self.half_width + 1, 1),
            origin + IVec2::new(self.half_width + 2, self.height + 1),
        )
    }

}

/// A rectangular room carved underground, origin is the center of its floor's
/// interior row. The room is lined with bricks, a spawner sits at its origin with
/// chests spread on the floor around it.
#[derive(Debug, Default)]
pub struct DungeonStructure;

impl Structure for DungeonStructure {

    fn footprint(&self, origin: IVec2, variant: StructureVariant) -> TileRect {
        DungeonShape::new(variant).rect(origin)
    }

    fn place(&self, origin: IVec2, variant: StructureVariant, provider: &mut GenProvider) -> Result<(), GenError> {

        let mut shape = DungeonShape::new(variant);
        let rect = shape.rect(origin);
        let floor_y = rect.min.y;
        let ceil_y = rect.max.y - 1;

        // Carve the room and fill the shell.
        for x in rect.min.x..rect.max.x {
            for y in rect.min.y..rect.max.y {

                let pos = IVec2::new(x, y);
                let shell = x == rect.min.x || x == rect.max.x - 1 || y == floor_y || y == ceil_y;

                if shell {
                    // Mossy bricks are decided for every shell tile, to keep the random
                    // sequence independent of the region applying the structure.
                    let mossy = shape.rand.next_chance(3);
                    provider.set_tile_at(pos, if y == floor_y && mossy { tile::MOSSY_BRICK } else { tile::BRICK })?;
                } else {
                    provider.set_tile_at(pos, tile::AIR)?;
                }

                provider.set_wall_at(pos, wall::BRICK)?;

            }
        }

        // Torches in both upper corners of the interior.
        let torch_y = ceil_y - 1;
        provider.set_tile_at(IVec2::new(origin.x - shape.half_width, torch_y), tile::TORCH)?;
        provider.set_tile_at(IVec2::new(origin.x + shape.half_width, torch_y), tile::TORCH)?;

        // Chests on the floor, on distinct columns that are not the spawner's.
        let chest_count = shape.rand.next_int_range(1, 2);
        let mut chest_columns = Vec::new();
        for _ in 0..chest_count {
            let mut dx = shape.rand.next_int_range(1, shape.half_width);
            if shape.rand.next_bool() != variant.mirrored {
                dx = -dx;
            }
            if !chest_columns.contains(&dx) {
                chest_columns.push(dx);
                provider.set_tile_at(IVec2::new(origin.x + dx, origin.y), tile::CHEST)?;
            }
        }

        // The spawner's entity kind is also the kind of guardians.
        let guardian = shape.rand.next_choice(GUARDIANS);
        provider.set_tile_at(origin, tile::SPAWNER)?;
        provider.set_tile_entity_at(origin, TileEntity::Spawner(SpawnerTileEntity {
            entity: guardian.into(),
            delay: 20,
        }))?;

        let guardian_count = shape.rand.next_int_range(1, 2);
        for _ in 0..guardian_count {
            let dx = shape.rand.next_double() * (shape.half_width * 2) as f64 - shape.half_width as f64;
            let pos = DVec2::new(origin.x as f64 + 0.5 + dx, origin.y as f64);
            provider.add_entity(EntitySpawn::new(guardian, pos))?;
        }

        Ok(())

    }

}


/// A stage placing rare dungeons deep underground.
#[derive(Debug, Clone)]
pub struct DungeonStage {
    /// Number of tries per region.
    tries: u32,
    /// One chance out of this value for each try to place a dungeon.
    rarity: i32,
    /// Dungeons are only placed below this height.
    max_y: i32,
}

impl DungeonStage {

    pub fn new(tries: u32, rarity: i32, max_y: i32) -> Self {
        Self { tries, rarity, max_y }
    }

}

impl Default for DungeonStage {
    fn default() -> Self {
        Self::new(2, 4, -24)
    }
}

impl TerrainStage for DungeonStage {

    fn generate(&self, mut cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError> {

        let offset = cx.offset();
        if offset.y > self.max_y {
            return Ok(());
        }

        for _ in 0..self.tries {

            let pos = offset + IVec2::new(
                cx.rand.next_int_bounded(REGION_SIZE as i32),
                cx.rand.next_int_bounded(REGION_SIZE as i32),
            );

            let variant = StructureVariant {
                mirrored: cx.rand.next_bool(),
                seed: cx.rand.next_long(),
            };

            if pos.y > self.max_y || !cx.rand.next_chance(self.rarity) {
                continue;
            }

            // Only start dungeons in solid ground, not in caves.
            let id = provider.tile_at(pos)?;
            if provider.tiles().get(id).is_solid() {
                provider.place_structure("dungeon", pos, variant)?;
            }

        }

        Ok(())

    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn footprint_is_shell() {
        for seed in 0..50 {
            let variant = StructureVariant { mirrored: false, seed };
            let shape = DungeonShape::new(variant);
            let origin = IVec2::new(-30, -100);
            let footprint = DungeonStructure.footprint(origin, variant);
            assert_eq!(footprint.size(), IVec2::new(shape.half_width * 2 + 3, shape.height + 2));
            assert!(footprint.contains(origin));
            assert!(footprint.contains(origin - IVec2::Y));
            assert!((3..=5).contains(&shape.half_width));
            assert!((4..=5).contains(&shape.height));
        }
    }

}
