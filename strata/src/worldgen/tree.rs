//! Tree structure and the stage planting trees on grass.

use glam::IVec2;

use crate::region::{StructureVariant, REGION_SIZE};
use crate::util::{SeededRandom, TileRect};
use crate::tile;

use super::{GenContext, GenProvider, GenError, Structure, TerrainStage};


/// Minimum height of a tree's trunk.
const MIN_HEIGHT: i32 = 4;
/// Radius of the widest canopy layers.
const CANOPY_RADIUS: i32 = 2;


/// The shape of a tree, fully derived from its variant.
struct TreeShape {
    /// Trunk height.
    height: i32,
    /// One bit per canopy corner, telling if the corner leaf is kept.
    corners: u32,
}

impl TreeShape {

    fn new(variant: StructureVariant) -> Self {
        let mut rand = SeededRandom::new(variant.seed);
        Self {
            height: rand.next_int_bounded(3) + MIN_HEIGHT,
            corners: rand.next_int() as u32,
        }
    }

}

/// A simple tree, a straight log trunk topped by a leaves canopy. The origin is the
/// base of the trunk, and the tile below is turned to dirt.
#[derive(Debug, Default)]
pub struct TreeStructure;

impl Structure for TreeStructure {

    fn footprint(&self, origin: IVec2, variant: StructureVariant) -> TileRect {
        let shape = TreeShape::new(variant);
        TileRect::new(
            origin - IVec2::new(CANOPY_RADIUS, 1),
            origin + IVec2::new(CANOPY_RADIUS + 1, shape.height + 1),
        )
    }

    fn place(&self, origin: IVec2, variant: StructureVariant, provider: &mut GenProvider) -> Result<(), GenError> {

        let shape = TreeShape::new(variant);
        let top = origin.y + shape.height;
        let mut corner = 0;

        provider.set_tile_at(origin - IVec2::Y, tile::DIRT)?;

        for y in (top - 3)..=top {

            let dy = y - top;  // Delta from top of the tree.
            let radius = 1 - dy / 2;

            for dx in -radius..=radius {
                let x = if variant.mirrored { -dx } else { dx };
                // Outermost leaves of the lower layers are randomly dropped.
                if dx.abs() == radius && dy != 0 {
                    let keep = shape.corners & (1 << (corner % 32)) != 0;
                    corner += 1;
                    if !keep {
                        continue;
                    }
                }
                provider.replace_tile_at(IVec2::new(origin.x + x, y), tile::LEAVES, |_, behavior| {
                    behavior.is_replaceable()
                })?;
            }

        }

        for y in origin.y..top {
            provider.replace_tile_at(IVec2::new(origin.x, y), tile::LOG, |id, behavior| {
                id == tile::LEAVES || behavior.is_replaceable()
            })?;
        }

        Ok(())

    }

}


/// A stage planting trees on grass surface columns.
#[derive(Debug, Clone)]
pub struct TreeStage {
    /// Number of columns tried per region.
    tries: u32,
    /// Minimum horizontal distance between two trees of the same region.
    spacing: i32,
}

impl TreeStage {

    pub fn new(tries: u32, spacing: i32) -> Self {
        Self { tries, spacing }
    }

    /// Find the grass surface in the given column of the region, from its top.
    fn find_grass(&self, x: i32, provider: &mut GenProvider) -> Result<Option<IVec2>, GenError> {
        let rect = provider.rect();
        let mut above = tile::AIR;
        for y in (rect.min.y..rect.max.y).rev() {
            let pos = IVec2::new(x, y);
            let id = provider.tile_at(pos)?;
            if id == tile::GRASS && above == tile::AIR {
                return Ok(Some(pos));
            } else if id != tile::AIR {
                return Ok(None);
            }
            above = id;
        }
        Ok(None)
    }

}

impl Default for TreeStage {
    fn default() -> Self {
        Self::new(10, 4)
    }
}

impl TerrainStage for TreeStage {

    fn generate(&self, mut cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError> {

        let offset = cx.offset();
        let mut planted = Vec::new();

        for _ in 0..self.tries {

            let x = offset.x + cx.rand.next_int_bounded(REGION_SIZE as i32);
            let variant = StructureVariant {
                mirrored: cx.rand.next_bool(),
                seed: cx.rand.next_long(),
            };

            if planted.iter().any(|&px: &i32| (px - x).abs() < self.spacing) {
                continue;
            }

            if let Some(grass) = self.find_grass(x, provider)? {
                provider.place_structure("tree", grass + IVec2::Y, variant)?;
                planted.push(x);
            }

        }

        Ok(())

    }

}
