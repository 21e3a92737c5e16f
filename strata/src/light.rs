//! Light rebuild of a whole region. Light is computed region-local: it is seeded from
//! the sky for regions above ground and from every emitting tile, and then spread with
//! a breadth-first flood where each tile subtracts its opacity.

use std::collections::VecDeque;

use glam::IVec2;

use crate::region::{REGION_SIZE, REGION_SLICES};
use crate::slice::{Slice, SLICE_SIZE};
use crate::tile::TileRegistry;


/// Regions at or above this region row receive sky light from their top edge.
pub const SKY_REGION_Y: i32 = 0;
/// Light level of the open sky.
pub const SKY_LIGHT: u8 = 15;

const AREA: usize = REGION_SIZE * REGION_SIZE;


/// Region-local index of the given region-local position.
#[inline]
fn calc_index(x: usize, y: usize) -> usize {
    y * REGION_SIZE + x
}

/// Return the slice index and the slice-local position of a region-local position.
#[inline]
fn calc_slice(x: usize, y: usize) -> (usize, IVec2) {
    let slice = (y / SLICE_SIZE) * REGION_SLICES + x / SLICE_SIZE;
    (slice, IVec2::new((x % SLICE_SIZE) as i32, (y % SLICE_SIZE) as i32))
}

/// Recompute the light of every tile of a region from scratch.
pub fn rebuild_light(region: IVec2, slices: &mut [Slice], registry: &TileRegistry) {

    // Copy tile properties into flat buffers, this avoids resolving slices while
    // flooding.
    let mut opacity = vec![0u8; AREA];
    let mut solid = vec![false; AREA];
    let mut light = vec![0u8; AREA];
    let mut queue = VecDeque::new();

    for y in 0..REGION_SIZE {
        for x in 0..REGION_SIZE {
            let (slice, pos) = calc_slice(x, y);
            let behavior = registry.get(slices[slice].tile(pos));
            let index = calc_index(x, y);
            opacity[index] = behavior.opacity().max(1);
            solid[index] = behavior.is_solid();
            let emission = behavior.emission();
            if emission != 0 {
                light[index] = emission;
                queue.push_back(index);
            }
        }
    }

    if region.y >= SKY_REGION_Y {
        for x in 0..REGION_SIZE {
            // Sky light goes straight down without loss through fully transparent
            // tiles, and stops at the first solid one.
            let mut level = SKY_LIGHT;
            for y in (0..REGION_SIZE).rev() {
                let index = calc_index(x, y);
                if solid[index] || level == 0 {
                    break;
                }
                if level > light[index] {
                    light[index] = level;
                    queue.push_back(index);
                }
                level = level.saturating_sub(opacity[index] - 1);
            }
        }
    }

    while let Some(index) = queue.pop_front() {

        let level = light[index];
        let (x, y) = (index % REGION_SIZE, index / REGION_SIZE);

        let neighbors = [
            (x > 0).then(|| index - 1),
            (x + 1 < REGION_SIZE).then(|| index + 1),
            (y > 0).then(|| index - REGION_SIZE),
            (y + 1 < REGION_SIZE).then(|| index + REGION_SIZE),
        ];

        for neighbor in neighbors.into_iter().flatten() {
            if solid[neighbor] {
                continue;
            }
            let new_level = level.saturating_sub(opacity[neighbor]);
            if new_level > light[neighbor] {
                light[neighbor] = new_level;
                queue.push_back(neighbor);
            }
        }

    }

    for y in 0..REGION_SIZE {
        for x in 0..REGION_SIZE {
            let (slice, pos) = calc_slice(x, y);
            slices[slice].set_light(pos, light[calc_index(x, y)]);
        }
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::region::REGION_SLICE_COUNT;
    use crate::tile;

    fn new_slices(fill: u16) -> Vec<Slice> {
        (0..REGION_SLICE_COUNT).map(|_| {
            let mut slice = Slice::new();
            slice.fill_tile(fill);
            slice
        }).collect()
    }

    #[test]
    fn open_sky_lights_everything() {
        let registry = TileRegistry::with_defaults();
        let mut slices = new_slices(tile::AIR);
        rebuild_light(IVec2::new(0, 1), &mut slices, &registry);
        assert!(slices.iter().all(|s| (0..256).all(|i| s.light(crate::slice::calc_local_pos(i)) == 15)));
    }

    #[test]
    fn underground_is_dark_except_emitters() {

        let registry = TileRegistry::with_defaults();
        let mut slices = new_slices(tile::STONE);
        // Carve a horizontal tunnel with a torch at its start.
        for x in 0..10 {
            let (slice, pos) = calc_slice(x, 5);
            slices[slice].set_tile(pos, tile::AIR);
        }
        let (slice, pos) = calc_slice(0, 5);
        slices[slice].set_tile(pos, tile::TORCH);

        rebuild_light(IVec2::new(0, -1), &mut slices, &registry);

        let level = |x, y| {
            let (slice, pos) = calc_slice(x, y);
            slices[slice].light(pos)
        };

        assert_eq!(level(0, 5), 14);
        assert_eq!(level(1, 5), 13);
        assert_eq!(level(9, 5), 5);
        assert_eq!(level(0, 6), 0);
        assert_eq!(level(30, 30), 0);

    }

    #[test]
    fn sky_stops_at_ground() {
        let registry = TileRegistry::with_defaults();
        let mut slices = new_slices(tile::AIR);
        for x in 0..REGION_SIZE {
            for y in 0..32 {
                let (slice, pos) = calc_slice(x, y);
                slices[slice].set_tile(pos, tile::DIRT);
            }
        }
        rebuild_light(IVec2::new(4, 0), &mut slices, &registry);
        let (slice, pos) = calc_slice(10, 32);
        assert_eq!(slices[slice].light(pos), 15);
        let (slice, pos) = calc_slice(10, 31);
        assert_eq!(slices[slice].light(pos), 0);
    }

}
