//! Ore veins stage.

use glam::{DVec2, IVec2};

use crate::region::REGION_SIZE;
use crate::tile;

use super::{GenContext, GenProvider, GenError, TerrainStage};


/// Description of one kind of ore vein.
#[derive(Debug, Clone)]
pub struct OreVein {
    /// The ore tile.
    pub tile: u16,
    /// Number of veins tried per region.
    pub count: u8,
    /// Approximate number of tiles per vein.
    pub size: u8,
    /// Inclusive range of absolute heights where veins can start.
    pub min_y: i32,
    pub max_y: i32,
}

/// A stage placing ore veins in stone and slate. Veins are confined to the region being
/// generated, tiles that would fall outside of it are dropped.
#[derive(Debug, Clone)]
pub struct OreStage {
    veins: Vec<OreVein>,
}

impl OreStage {

    pub fn new(veins: Vec<OreVein>) -> Self {
        Self { veins }
    }

    /// Place a single vein, this is a line of discs of varying radius.
    fn place_vein(&self, vein: &OreVein, pos: IVec2, cx: &mut GenContext, provider: &mut GenProvider) -> Result<(), GenError> {

        let count = vein.size as f64;
        let angle = cx.rand.next_double() * std::f64::consts::PI;
        let delta = DVec2::new(angle.cos(), angle.sin()) * count / 8.0;

        let line_start = pos.as_dvec2() + delta;
        let line_stop = pos.as_dvec2() - delta;

        for i in 0..=vein.size {

            // Interpolation.
            let center = line_start + (line_stop - line_start) * i as f64 / count;

            let base_size = cx.rand.next_double() * count / 16.0;
            let size = ((i as f64 * std::f64::consts::PI / count).sin() + 1.0) * base_size + 1.0;
            let half_size = size / 2.0;

            let start = (center - half_size).floor().as_ivec2();
            let stop = (center + half_size).floor().as_ivec2();

            for x in start.x..=stop.x {
                for y in start.y..=stop.y {

                    let place_pos = IVec2::new(x, y);
                    let delta = (place_pos.as_dvec2() + 0.5 - center) / half_size;

                    if delta.length_squared() < 1.0 && provider.contains(place_pos) {
                        provider.replace_tile_at(place_pos, vein.tile, |id, _| {
                            id == tile::STONE || id == tile::SLATE
                        })?;
                    }

                }
            }

        }

        Ok(())

    }

}

impl Default for OreStage {
    fn default() -> Self {
        Self::new(vec![
            OreVein { tile: tile::COAL_ORE, count: 20, size: 16, min_y: -128, max_y: 48 },
            OreVein { tile: tile::COPPER_ORE, count: 12, size: 10, min_y: -160, max_y: 16 },
            OreVein { tile: tile::IRON_ORE, count: 10, size: 8, min_y: -256, max_y: 0 },
            OreVein { tile: tile::GOLD_ORE, count: 3, size: 8, min_y: -512, max_y: -96 },
        ])
    }
}

impl TerrainStage for OreStage {

    fn generate(&self, mut cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError> {

        let rect = cx.rect();

        for vein in &self.veins {

            // Skip quickly regions that do not intersect the vein's height range.
            if rect.max.y <= vein.min_y || rect.min.y > vein.max_y {
                continue;
            }

            for _ in 0..vein.count {
                let pos = rect.min + IVec2::new(
                    cx.rand.next_int_bounded(REGION_SIZE as i32),
                    cx.rand.next_int_bounded(REGION_SIZE as i32),
                );
                if pos.y >= vein.min_y && pos.y <= vein.max_y {
                    self.place_vein(vein, pos, &mut cx, provider)?;
                }
            }

        }

        Ok(())

    }

}
