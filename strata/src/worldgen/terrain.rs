//! Base terrain stage, mapping a height field and two cave fields to tiles and walls.

use glam::{DVec2, IVec2};

use crate::region::REGION_SIZE;
use crate::util::OctaveNoise;
use crate::tile::{self, wall};

use super::{GenContext, GenProvider, GenError, RegionStage, StageFactory};


/// Tiles at or below this height that are above ground are filled with water.
pub const SEA_LEVEL: i32 = 24;
/// Average height of the surface.
pub const SURFACE_BASE: i32 = 32;
/// Maximum distance of the surface from its average height.
pub const SURFACE_AMPLITUDE: f64 = 24.0;
/// Caves below this height are flooded with lava.
pub const LAVA_LEVEL: i32 = -160;

const HEIGHT_SEED: i64 = 0x4E1F_7A11;
const CAVE_DENSITY_SEED: i64 = 0x0CA7_E5D3;
const CAVE_MASK_SEED: i64 = 0x3A5C_0B1D;

/// Minimum depth under the surface for caves to be carved.
const CAVE_MIN_DEPTH: i32 = 6;


/// A layer of the ground, selected by depth under the surface and by absolute height.
struct Layer {
    /// The layer applies while the depth is lower or equal to this value.
    max_depth: i32,
    /// Inclusive range of absolute heights where the layer applies.
    min_y: i32,
    max_y: i32,
    tile: u16,
    wall: u16,
}

/// The ground layers, from the surface downward. The first layer matching both its
/// depth and its height is used.
const LAYERS: &[Layer] = &[
    Layer { max_depth: 0, min_y: SEA_LEVEL, max_y: i32::MAX, tile: tile::GRASS, wall: wall::NONE },
    Layer { max_depth: 3, min_y: i32::MIN, max_y: SEA_LEVEL + 1, tile: tile::SAND, wall: wall::DIRT },
    Layer { max_depth: 4, min_y: i32::MIN, max_y: i32::MAX, tile: tile::DIRT, wall: wall::DIRT },
    Layer { max_depth: 5, min_y: i32::MIN, max_y: SEA_LEVEL - 4, tile: tile::CLAY, wall: wall::DIRT },
    Layer { max_depth: i32::MAX, min_y: -96, max_y: i32::MAX, tile: tile::STONE, wall: wall::STONE },
    Layer { max_depth: i32::MAX, min_y: i32::MIN, max_y: i32::MAX, tile: tile::SLATE, wall: wall::SLATE },
];


/// The noise fields of the terrain. Every query is a pure function of the seed and of
/// absolute coordinates.
pub struct TerrainNoise {
    height: OctaveNoise,
    cave_density: OctaveNoise,
    cave_mask: OctaveNoise,
}

impl TerrainNoise {

    pub fn new(seed: i64) -> Self {
        Self {
            height: OctaveNoise::new_seeded(seed ^ HEIGHT_SEED, 6),
            cave_density: OctaveNoise::new_seeded(seed ^ CAVE_DENSITY_SEED, 4),
            cave_mask: OctaveNoise::new_seeded(seed ^ CAVE_MASK_SEED, 3),
        }
    }

    /// Height of the surface tile in the given column.
    pub fn surface_height(&self, x: i32) -> i32 {
        let noise = self.height.sample_normalized(DVec2::new(x as f64 * 0.006, 0.5));
        SURFACE_BASE + (noise * SURFACE_AMPLITUDE).floor() as i32
    }

    /// Return true if a cave is carved at the given position.
    pub fn is_cave(&self, pos: IVec2) -> bool {
        let mask = self.cave_mask.sample_normalized(pos.as_dvec2() * 0.008);
        if mask < -0.1 {
            return false;
        }
        let density = self.cave_density.sample_normalized(pos.as_dvec2() * DVec2::new(0.03, 0.045));
        density.abs() < 0.06 + mask * 0.08
    }

    /// Compute the tile and the wall at the given position, knowing the surface height
    /// of its column.
    pub fn sample(&self, pos: IVec2, surface: i32) -> (u16, u16) {

        let depth = surface - pos.y;

        if depth < 0 {
            return if pos.y <= SEA_LEVEL { (tile::WATER, wall::NONE) } else { (tile::AIR, wall::NONE) };
        }

        let layer = LAYERS.iter()
            .find(|layer| depth <= layer.max_depth && (layer.min_y..=layer.max_y).contains(&pos.y))
            .unwrap_or(&LAYERS[LAYERS.len() - 1]);

        if depth >= CAVE_MIN_DEPTH && self.is_cave(pos) {
            let fill = if pos.y < LAVA_LEVEL { tile::LAVA } else { tile::AIR };
            return (fill, layer.wall);
        }

        (layer.tile, layer.wall)

    }

}


/// Factory of the terrain stage, the noise tables are rebuilt for each region.
#[derive(Debug, Default)]
pub struct TerrainStageFactory;

impl StageFactory for TerrainStageFactory {
    fn create(&self, cx: &GenContext) -> Box<dyn RegionStage> {
        Box::new(TerrainStage { noise: TerrainNoise::new(cx.seed) })
    }
}

struct TerrainStage {
    noise: TerrainNoise,
}

impl RegionStage for TerrainStage {

    fn generate(&mut self, cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError> {

        let offset = cx.offset();

        for dx in 0..REGION_SIZE as i32 {
            let x = offset.x + dx;
            let surface = self.noise.surface_height(x);
            for dy in 0..REGION_SIZE as i32 {
                let pos = IVec2::new(x, offset.y + dy);
                let (tile_id, wall_id) = self.noise.sample(pos, surface);
                if tile_id != tile::AIR {
                    provider.set_tile_at(pos, tile_id)?;
                }
                if wall_id != wall::NONE {
                    provider.set_wall_at(pos, wall_id)?;
                }
            }
        }

        Ok(())

    }

}
