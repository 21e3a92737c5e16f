//! The generation provider, the only way for stages and structures to mutate a region.

use std::sync::Arc;
use std::mem;

use glam::IVec2;

use crate::region::{Region, RegionData, PendingStructure, StructureVariant, DeferredAction, calc_region_pos, calc_slice_index};
use crate::tile::{TileAccess, TileBehavior, TileRegistry};
use crate::util::{SeededRandom, TileRect, region_seed};
use crate::tile_entity::TileEntity;
use crate::entity::EntitySpawn;
use crate::slice::{Slice, calc_slice_pos};
use crate::store::PinScope;

use super::{GenShared, GenError};


/// Salt of the provider's private random generator.
const PROVIDER_SALT: i64 = 0x0DE1_7A5C;


/// A short-lived, bounds-checked view over the region being generated. Every tile
/// position given to it is absolute, and positions outside of the region are rejected
/// with [`GenError::OutOfBounds`].
///
/// While a structure is being applied the provider is in clip mode: writes outside of
/// the region are silently skipped instead, because those tiles are owned by another
/// region that applies its own part of the structure.
///
/// Pending records for other regions are only collected here, the generation task
/// queues them once the region has been marked generated, so a failed run never
/// leaves records behind.
pub struct GenProvider<'a> {
    shared: &'a GenShared,
    region: &'a Region,
    data: &'a mut RegionData,
    pins: &'a mut PinScope,
    /// Cached tile rectangle of the region.
    rect: TileRect,
    rand: SeededRandom,
    /// Slice coordinates and index of the last slice accessed.
    last_slice: Option<(IVec2, usize)>,
    /// Footprint of the structure being applied, if any.
    clip: Option<TileRect>,
    /// Records to queue to other regions once generated, with the pinned target.
    outgoing: Vec<(Arc<Region>, PendingStructure)>,
}

impl<'a> GenProvider<'a> {

    pub(super) fn new(shared: &'a GenShared, region: &'a Region, data: &'a mut RegionData, pins: &'a mut PinScope) -> Self {
        Self {
            shared,
            region,
            data,
            pins,
            rect: region.rect(),
            rand: SeededRandom::new(region_seed(shared.seed, region.pos(), PROVIDER_SALT)),
            last_slice: None,
            clip: None,
            outgoing: Vec::new(),
        }
    }

    /// Coordinates of the region being generated.
    #[inline]
    pub fn region(&self) -> IVec2 {
        self.region.pos()
    }

    /// Position of the first tile of the region.
    #[inline]
    pub fn offset(&self) -> IVec2 {
        self.rect.min
    }

    #[inline]
    pub fn rect(&self) -> TileRect {
        self.rect
    }

    #[inline]
    pub fn seed(&self) -> i64 {
        self.shared.seed
    }

    #[inline]
    pub fn tiles(&self) -> &'a TileRegistry {
        let shared: &'a GenShared = self.shared;
        &shared.tiles
    }

    /// Return true if the given position is inside the region.
    #[inline]
    pub fn contains(&self, pos: IVec2) -> bool {
        self.rect.contains(pos)
    }

    /// Return true while a structure is being applied.
    #[inline]
    pub fn is_clipped(&self) -> bool {
        self.clip.is_some()
    }

    /// Random generator private to this provider, seeded from the world seed and the
    /// region coordinates.
    #[inline]
    pub fn rand(&mut self) -> &mut SeededRandom {
        &mut self.rand
    }

    #[inline]
    fn check(&self, pos: IVec2) -> Result<(), GenError> {
        if self.contains(pos) {
            Ok(())
        } else {
            Err(GenError::OutOfBounds { pos, region: self.region.pos() })
        }
    }

    /// Return true if a write at this position must be skipped because the provider
    /// is clipped, or an error if the position is outside and not clipped.
    #[inline]
    fn skip(&self, pos: IVec2) -> Result<bool, GenError> {
        if self.contains(pos) {
            Ok(false)
        } else if self.clip.is_some() {
            Ok(true)
        } else {
            Err(GenError::OutOfBounds { pos, region: self.region.pos() })
        }
    }

    /// Get the slice containing the given position.
    pub fn slice_at(&mut self, pos: IVec2) -> Result<&mut Slice, GenError> {
        self.check(pos)?;
        let slice_pos = calc_slice_pos(pos);
        let index = match self.last_slice {
            Some((last_pos, index)) if last_pos == slice_pos => index,
            _ => {
                let index = calc_slice_index(pos);
                self.last_slice = Some((slice_pos, index));
                index
            }
        };
        Ok(&mut self.data.ensure_slices()[index])
    }

    pub fn tile_at(&mut self, pos: IVec2) -> Result<u16, GenError> {
        Ok(self.slice_at(pos)?.tile(pos))
    }

    pub fn wall_at(&mut self, pos: IVec2) -> Result<u16, GenError> {
        Ok(self.slice_at(pos)?.wall(pos))
    }

    /// Set the tile at the given position. The remove hook of the previous tile runs
    /// first, then the tile is written and the place hook of the new tile runs.
    pub fn set_tile_at(&mut self, pos: IVec2, id: u16) -> Result<(), GenError> {

        if self.skip(pos)? {
            return Ok(());
        }

        let tiles = self.tiles();
        let prev_id = self.slice_at(pos)?.tile(pos);
        tiles.get(prev_id).handle_remove(self, pos)?;
        self.slice_at(pos)?.set_tile(pos, id);
        tiles.get(id).handle_place(self, pos)?;

        Ok(())

    }

    /// Set the tile at the given position only if the predicate accepts the current
    /// tile, returning true if the tile has been set. This is the only read allowed to
    /// structures, because the predicate only sees the tile being replaced.
    pub fn replace_tile_at<P>(&mut self, pos: IVec2, id: u16, predicate: P) -> Result<bool, GenError>
    where
        P: FnOnce(u16, &dyn TileBehavior) -> bool,
    {

        if self.skip(pos)? {
            return Ok(false);
        }

        let prev_id = self.tile_at(pos)?;
        if !predicate(prev_id, self.tiles().get(prev_id)) {
            return Ok(false);
        }

        self.set_tile_at(pos, id)?;
        Ok(true)

    }

    pub fn set_wall_at(&mut self, pos: IVec2, id: u16) -> Result<(), GenError> {
        if self.skip(pos)? {
            return Ok(());
        }
        self.slice_at(pos)?.set_wall(pos, id);
        Ok(())
    }

    pub fn tile_entity_at(&mut self, pos: IVec2) -> Result<Option<&TileEntity>, GenError> {
        Ok(self.slice_at(pos)?.tile_entity(pos))
    }

    /// Set the tile entity at the given position, it is also queued to be added to the
    /// simulation once the region is active. Only the last tile entity set at a given
    /// position is queued.
    pub fn set_tile_entity_at(&mut self, pos: IVec2, tile_entity: TileEntity) -> Result<(), GenError> {

        if self.skip(pos)? {
            return Ok(());
        }

        self.slice_at(pos)?.set_tile_entity(pos, tile_entity.clone());
        self.data.cancel_deferred_tile_entity(pos);
        self.data.push_deferred(DeferredAction::AddTileEntity { pos, tile_entity });

        Ok(())

    }

    /// Remove the tile entity at the given position, along with its queued addition.
    pub fn remove_tile_entity_at(&mut self, pos: IVec2) -> Result<Option<TileEntity>, GenError> {

        if self.skip(pos)? {
            return Ok(None);
        }

        let prev = self.slice_at(pos)?.remove_tile_entity(pos);
        self.data.cancel_deferred_tile_entity(pos);
        Ok(prev)

    }

    /// Queue an entity to be added to the simulation once the region is active.
    pub fn add_entity(&mut self, spawn: EntitySpawn) -> Result<(), GenError> {
        if self.skip(spawn.tile_pos())? {
            return Ok(());
        }
        self.data.push_deferred(DeferredAction::AddEntity(spawn));
        Ok(())
    }

    /// Place a registered structure. Its part inside this region is applied now, and a
    /// pending record for every other region its footprint intersects is collected.
    ///
    /// While already applying a structure, only the part inside this region is
    /// applied and no record is collected, so a nested structure must fit in the
    /// footprint of the structure placing it, or [`GenError::NestedOutside`] is
    /// returned.
    pub fn place_structure(&mut self, name: &str, origin: IVec2, variant: StructureVariant) -> Result<(), GenError> {

        let shared: &'a GenShared = self.shared;
        let Some((name, structure)) = shared.structures.get_full(name) else {
            return Err(GenError::UnknownStructure(name.into()));
        };

        let footprint = structure.footprint(origin, variant);
        if footprint.is_empty() {
            return Ok(());
        }

        match self.clip {
            Some(parent) if !parent.contains_rect(footprint) => {
                return Err(GenError::NestedOutside { structure: name.clone(), footprint, parent });
            }
            Some(_) => {}
            None => {

                let region_pos = self.region.pos();
                let min = calc_region_pos(footprint.min);
                let max = calc_region_pos(footprint.max - IVec2::ONE);

                for ry in min.y..=max.y {
                    for rx in min.x..=max.x {
                        let target_pos = IVec2::new(rx, ry);
                        if target_pos != region_pos {
                            let target = self.pins.cache(target_pos);
                            self.outgoing.push((target, PendingStructure {
                                origin_region: region_pos,
                                offset: origin - self.offset(),
                                structure: name.clone(),
                                variant,
                            }));
                        }
                    }
                }

            }
        }

        if footprint.intersects(self.rect) {
            let clip = mem::replace(&mut self.clip, Some(footprint));
            let result = structure.place(origin, variant, self);
            self.clip = clip;
            result?;
        }

        Ok(())

    }

    /// Apply the part of a pending structure that lies inside this region.
    pub(super) fn implant(&mut self, record: &PendingStructure) -> Result<(), GenError> {

        let shared: &'a GenShared = self.shared;
        let Some(structure) = shared.structures.get(&record.structure) else {
            return Err(GenError::UnknownStructure(record.structure.clone()));
        };

        let origin = record.origin();
        let clip = mem::replace(&mut self.clip, Some(structure.footprint(origin, record.variant)));
        let result = structure.place(origin, record.variant, self);
        self.clip = clip;
        result

    }

    /// Take the records collected for other regions, each with its pinned target.
    pub(super) fn take_outgoing(&mut self) -> Vec<(Arc<Region>, PendingStructure)> {
        mem::take(&mut self.outgoing)
    }

}

impl TileAccess for GenProvider<'_> {

    fn tile_at(&mut self, pos: IVec2) -> Result<u16, GenError> {
        GenProvider::tile_at(self, pos)
    }

    fn set_tile_entity_at(&mut self, pos: IVec2, tile_entity: TileEntity) -> Result<(), GenError> {
        GenProvider::set_tile_entity_at(self, pos, tile_entity)
    }

    fn remove_tile_entity_at(&mut self, pos: IVec2) -> Result<Option<TileEntity>, GenError> {
        GenProvider::remove_tile_entity_at(self, pos)
    }

}
