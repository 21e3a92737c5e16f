//! A slice storing tiles, walls, light and tile entities of a small square area.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use glam::IVec2;
use indexmap::IndexMap;

use crate::tile_entity::TileEntity;
use crate::tile::{AIR, wall};


/// Slice size in both X and Y coordinates.
pub const SLICE_SIZE: usize = 16;
/// Internal slice size, in number of elements per slice.
pub const SLICE_AREA: usize = SLICE_SIZE * SLICE_SIZE;


/// Calculate the index in the slice's arrays for the given position, only the first 4
/// bits of each component are used, so any absolute position can be given.
#[inline]
pub fn calc_index(pos: IVec2) -> usize {
    let x = pos.x as u32 & 0b1111;
    let y = pos.y as u32 & 0b1111;
    ((y << 4) | x) as usize
}

/// Calculate the position of a tile from its index in a slice, the returned position
/// is local to the slice.
#[inline]
pub fn calc_local_pos(index: usize) -> IVec2 {
    IVec2::new((index & 0b1111) as i32, (index >> 4) as i32)
}

/// Calculate the slice coordinates of the given tile position.
#[inline]
pub fn calc_slice_pos(pos: IVec2) -> IVec2 {
    IVec2::new(pos.x >> 4, pos.y >> 4)
}


/// Data structure storing every slice-local data, slices are a region subdivision of
/// 16x16 tiles.
#[derive(Clone, PartialEq)]
pub struct Slice {
    /// The numeric identifier of the tile.
    tile: [u16; SLICE_AREA],
    /// The numeric identifier of the wall behind the tile.
    wall: [u16; SLICE_AREA],
    /// Light level for each tile.
    light: SliceNibbleArray,
    /// Tile entities, mapped from their index in the slice.
    tile_entities: IndexMap<u16, TileEntity>,
}

impl Slice {

    /// Create a new empty slice, full of air tiles and without walls.
    pub fn new() -> Self {
        Self {
            tile: [AIR; SLICE_AREA],
            wall: [wall::NONE; SLICE_AREA],
            light: SliceNibbleArray::new(0),
            tile_entities: IndexMap::new(),
        }
    }

    /// Get tile id at the given position (rebased to slice-local).
    #[inline]
    pub fn tile(&self, pos: IVec2) -> u16 {
        self.tile[calc_index(pos)]
    }

    /// Set tile id at the given position (rebased to slice-local). This does not run
    /// any tile hook, the provider is responsible for that.
    #[inline]
    pub fn set_tile(&mut self, pos: IVec2, id: u16) {
        self.tile[calc_index(pos)] = id;
    }

    #[inline]
    pub fn wall(&self, pos: IVec2) -> u16 {
        self.wall[calc_index(pos)]
    }

    #[inline]
    pub fn set_wall(&mut self, pos: IVec2, id: u16) {
        self.wall[calc_index(pos)] = id;
    }

    /// Get light level at the given position (rebased to slice-local).
    #[inline]
    pub fn light(&self, pos: IVec2) -> u8 {
        self.light.get(calc_index(pos))
    }

    /// Set light level at the given position (rebased to slice-local), the level is
    /// clamped to 15.
    #[inline]
    pub fn set_light(&mut self, pos: IVec2, level: u8) {
        self.light.set(calc_index(pos), level.min(15));
    }

    /// Fill the whole slice with the given tile id.
    pub fn fill_tile(&mut self, id: u16) {
        self.tile.fill(id);
    }

    /// Get the tile entity at the given position (rebased to slice-local).
    #[inline]
    pub fn tile_entity(&self, pos: IVec2) -> Option<&TileEntity> {
        self.tile_entities.get(&(calc_index(pos) as u16))
    }

    /// Set the tile entity at the given position, returning the previous one.
    #[inline]
    pub fn set_tile_entity(&mut self, pos: IVec2, tile_entity: TileEntity) -> Option<TileEntity> {
        self.tile_entities.insert(calc_index(pos) as u16, tile_entity)
    }

    /// Remove the tile entity at the given position, keeping the order of the others.
    #[inline]
    pub fn remove_tile_entity(&mut self, pos: IVec2) -> Option<TileEntity> {
        self.tile_entities.shift_remove(&(calc_index(pos) as u16))
    }

    /// Iterate over all tile entities with their slice-local position.
    pub fn tile_entities(&self) -> impl Iterator<Item = (IVec2, &TileEntity)> + '_ {
        self.tile_entities.iter().map(|(&index, te)| (calc_local_pos(index as usize), te))
    }

    #[inline]
    pub fn tile_entity_count(&self) -> usize {
        self.tile_entities.len()
    }

    /// Raw tile ids, rows first.
    #[inline]
    pub fn tiles(&self) -> &[u16; SLICE_AREA] {
        &self.tile
    }

    /// Raw wall ids, rows first.
    #[inline]
    pub fn walls(&self) -> &[u16; SLICE_AREA] {
        &self.wall
    }

    /// Write the tile, wall and light arrays to the given writer. Tile entities are
    /// written separately by the region codec.
    pub fn write_data_to(&self, mut writer: impl Write) -> io::Result<()> {
        for &id in &self.tile {
            writer.write_u16::<LE>(id)?;
        }
        for &id in &self.wall {
            writer.write_u16::<LE>(id)?;
        }
        writer.write_all(&self.light.inner)?;
        Ok(())
    }

    /// Read the tile, wall and light arrays previously written by
    /// [`Self::write_data_to`].
    pub fn read_data_from(&mut self, mut reader: impl Read) -> io::Result<()> {
        for id in &mut self.tile {
            *id = reader.read_u16::<LE>()?;
        }
        for id in &mut self.wall {
            *id = reader.read_u16::<LE>()?;
        }
        reader.read_exact(&mut self.light.inner)?;
        Ok(())
    }

}

impl Default for Slice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slice")
            .field("tile_entities", &self.tile_entities.len())
            .finish_non_exhaustive()
    }
}


/// Special arrays for slices that stores `u4 * SLICE_AREA` values.
#[derive(Clone, PartialEq)]
struct SliceNibbleArray {
    inner: [u8; SLICE_AREA / 2]
}

impl SliceNibbleArray {

    const fn new(init: u8) -> Self {
        debug_assert!(init <= 0x0F);
        let init = init << 4 | init;
        Self { inner: [init; SLICE_AREA / 2] }
    }

    #[inline]
    fn get(&self, index: usize) -> u8 {
        let slot = self.inner[index >> 1];
        if index & 1 == 0 {
            slot & 0x0F
        } else {
            (slot & 0xF0) >> 4
        }
    }

    #[inline]
    fn set(&mut self, index: usize, value: u8) {
        debug_assert!(value <= 0x0F);
        let slot = &mut self.inner[index >> 1];
        if index & 1 == 0 {
            *slot = (*slot & 0xF0) | value;
        } else {
            *slot = (*slot & 0x0F) | (value << 4);
        }
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::tile;
    use crate::tile_entity::SignTileEntity;

    #[test]
    fn index_wraps_absolute_positions() {
        assert_eq!(calc_index(IVec2::new(0, 0)), 0);
        assert_eq!(calc_index(IVec2::new(15, 0)), 15);
        assert_eq!(calc_index(IVec2::new(0, 1)), 16);
        assert_eq!(calc_index(IVec2::new(-1, -1)), 255);
        assert_eq!(calc_index(IVec2::new(17, 33)), calc_index(IVec2::new(1, 1)));
        assert_eq!(calc_local_pos(calc_index(IVec2::new(3, 9))), IVec2::new(3, 9));
        assert_eq!(calc_slice_pos(IVec2::new(-1, 16)), IVec2::new(-1, 1));
    }

    #[test]
    fn light_nibbles_are_independent() {
        let mut slice = Slice::new();
        slice.set_light(IVec2::new(0, 0), 15);
        slice.set_light(IVec2::new(1, 0), 3);
        assert_eq!(slice.light(IVec2::new(0, 0)), 15);
        assert_eq!(slice.light(IVec2::new(1, 0)), 3);
        slice.set_light(IVec2::new(0, 0), 200);
        assert_eq!(slice.light(IVec2::new(0, 0)), 15);
    }

    #[test]
    fn data_roundtrip_keeps_arrays() {
        let mut slice = Slice::new();
        slice.set_tile(IVec2::new(4, 5), tile::STONE);
        slice.set_wall(IVec2::new(4, 5), tile::wall::STONE);
        slice.set_light(IVec2::new(7, 7), 9);
        let mut buf = Vec::new();
        slice.write_data_to(&mut buf).unwrap();
        let mut other = Slice::new();
        other.read_data_from(&buf[..]).unwrap();
        assert_eq!(other.tiles(), slice.tiles());
        assert_eq!(other.walls(), slice.walls());
        assert_eq!(other.light(IVec2::new(7, 7)), 9);
    }

    #[test]
    fn tile_entities_keep_order() {
        let mut slice = Slice::new();
        let sign = |text: &str| TileEntity::Sign(SignTileEntity { text: text.into() });
        slice.set_tile_entity(IVec2::new(3, 3), sign("a"));
        slice.set_tile_entity(IVec2::new(1, 1), sign("b"));
        slice.set_tile_entity(IVec2::new(2, 2), sign("c"));
        assert!(slice.remove_tile_entity(IVec2::new(1, 1)).is_some());
        let order = slice.tile_entities().map(|(pos, _)| pos).collect::<Vec<_>>();
        assert_eq!(order, [IVec2::new(3, 3), IVec2::new(2, 2)]);
    }

}
