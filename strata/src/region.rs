//! Regions are the unit of generation, persistence and concurrency. Each region owns a
//! fixed square of slices, its lifecycle state and the queues of work deferred until
//! the region is generated or activated.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::fmt;

use arcstr::ArcStr;
use glam::IVec2;
use parking_lot::{Mutex, MutexGuard};

use crate::slice::{Slice, SLICE_SIZE, calc_slice_pos};
use crate::tile_entity::TileEntity;
use crate::entity::EntitySpawn;
use crate::util::TileRect;


/// Number of slices along each axis of a region.
pub const REGION_SLICES: usize = 4;
/// Total number of slices in a region.
pub const REGION_SLICE_COUNT: usize = REGION_SLICES * REGION_SLICES;
/// Region size in tiles, along each axis.
pub const REGION_SIZE: usize = REGION_SLICES * SLICE_SIZE;

const REGION_SHIFT: u32 = REGION_SIZE.trailing_zeros();


/// Calculate the region coordinates owning the given tile position.
#[inline]
pub fn calc_region_pos(pos: IVec2) -> IVec2 {
    IVec2::new(pos.x >> REGION_SHIFT, pos.y >> REGION_SHIFT)
}

/// Calculate the position of the first tile of the given region.
#[inline]
pub fn calc_region_offset(region: IVec2) -> IVec2 {
    region * REGION_SIZE as i32
}

/// Calculate the tile rectangle covered by the given region.
#[inline]
pub fn calc_region_rect(region: IVec2) -> TileRect {
    TileRect::from_size(calc_region_offset(region), IVec2::splat(REGION_SIZE as i32))
}

/// Calculate the index of the slice containing the given tile position, the position
/// must be inside the region but can be absolute.
#[inline]
pub fn calc_slice_index(pos: IVec2) -> usize {
    let slice = calc_slice_pos(pos);
    let x = slice.x as usize & (REGION_SLICES - 1);
    let y = slice.y as usize & (REGION_SLICES - 1);
    y * REGION_SLICES + x
}


/// An action that cannot run while generating, because no live simulation exists yet,
/// and that is replayed once the region becomes active.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredAction {
    AddEntity(EntitySpawn),
    AddTileEntity {
        pos: IVec2,
        tile_entity: TileEntity,
    },
}

/// Variant data of a structure placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StructureVariant {
    /// Mirror the structure along the X axis.
    pub mirrored: bool,
    /// Seed driving every random choice of the structure.
    pub seed: i64,
}

/// A structure placement recorded against a region that was not the one being
/// generated when the structure was placed. It is applied exactly once, clipped to
/// the bounds of the region owning it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStructure {
    /// The region that placed the structure.
    pub origin_region: IVec2,
    /// Origin of the structure relative to the first tile of the origin region.
    pub offset: IVec2,
    /// Name of the structure in the structure registry.
    pub structure: ArcStr,
    pub variant: StructureVariant,
}

impl PendingStructure {

    /// Absolute tile position of the structure's origin.
    #[inline]
    pub fn origin(&self) -> IVec2 {
        calc_region_offset(self.origin_region) + self.offset
    }

}


/// The data owned by whoever currently holds the region's generation permit, or by the
/// simulation thread once generated.
#[derive(Debug, Default)]
pub struct RegionData {
    /// All slices of the region, rows first, allocated on first generation or load.
    slices: Option<Box<[Slice]>>,
    /// Ordered deferred actions produced while generating.
    deferred: Vec<DeferredAction>,
}

impl RegionData {

    /// Return true if slice storage has been allocated.
    #[inline]
    pub fn has_slices(&self) -> bool {
        self.slices.is_some()
    }

    /// Allocate slice storage if not already done, and return it. Storage is only ever
    /// allocated once.
    pub fn ensure_slices(&mut self) -> &mut [Slice] {
        self.slices.get_or_insert_with(|| {
            (0..REGION_SLICE_COUNT).map(|_| Slice::new()).collect()
        })
    }

    /// Prepare for a run of the stage pipeline: every slice is emptied in place and
    /// deferred actions left by a previous failed run are dropped.
    pub(crate) fn reset_for_generation(&mut self) {
        for slice in self.ensure_slices() {
            *slice = Slice::new();
        }
        self.deferred.clear();
    }

    /// Replace the slice storage, used by persistence when loading a region.
    pub(crate) fn set_slices(&mut self, slices: Box<[Slice]>) {
        debug_assert_eq!(slices.len(), REGION_SLICE_COUNT);
        self.slices = Some(slices);
    }

    #[inline]
    pub fn slices(&self) -> Option<&[Slice]> {
        self.slices.as_deref()
    }

    #[inline]
    pub fn slices_mut(&mut self) -> Option<&mut [Slice]> {
        self.slices.as_deref_mut()
    }

    /// Get the slice containing the given tile, the position must be in the region.
    #[inline]
    pub fn slice_at(&self, pos: IVec2) -> Option<&Slice> {
        self.slices.as_ref().map(|slices| &slices[calc_slice_index(pos)])
    }

    /// Get the tile at the given position, the position must be in the region.
    #[inline]
    pub fn tile(&self, pos: IVec2) -> Option<u16> {
        self.slice_at(pos).map(|slice| slice.tile(pos))
    }

    #[inline]
    pub fn wall(&self, pos: IVec2) -> Option<u16> {
        self.slice_at(pos).map(|slice| slice.wall(pos))
    }

    #[inline]
    pub fn light(&self, pos: IVec2) -> Option<u8> {
        self.slice_at(pos).map(|slice| slice.light(pos))
    }

    #[inline]
    pub fn deferred(&self) -> &[DeferredAction] {
        &self.deferred
    }

    #[inline]
    pub fn push_deferred(&mut self, action: DeferredAction) {
        self.deferred.push(action);
    }

    /// Remove the deferred tile entity addition at the given position, if any.
    pub(crate) fn cancel_deferred_tile_entity(&mut self, pos: IVec2) {
        self.deferred.retain(|action| !matches!(action, DeferredAction::AddTileEntity { pos: p, .. } if *p == pos));
    }

    /// Take all deferred actions, in order.
    #[inline]
    pub fn take_deferred(&mut self) -> Vec<DeferredAction> {
        std::mem::take(&mut self.deferred)
    }

}


/// Lifecycle flags and counters of a region. All of them are atomics because they are
/// read by the store and the workers concurrently.
#[derive(Debug, Default)]
pub struct RegionState {
    /// The full generation pipeline has completed.
    generated: AtomicBool,
    /// The generation permit is held.
    permit: AtomicBool,
    /// Persistence has been consulted for this region.
    loaded: AtomicBool,
    /// The structures placed by this region over its neighbors have been queued to
    /// them, this survives invalidation.
    placed: AtomicBool,
    /// Number of reasons this region must stay loaded and active.
    anchors: AtomicU32,
    /// Number of temporary holds, taken while some generation task needs the region.
    pins: AtomicU32,
    /// Number of store ticks this region has been idle.
    idle_ticks: AtomicU32,
}

impl RegionState {

    /// Try to acquire the generation permit, this fails immediately if it is already
    /// held by someone else. The permit is released when the returned guard is dropped.
    pub fn try_acquire_permit(&self) -> Option<GenPermit<'_>> {
        self.permit.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| GenPermit { state: self })
    }

    /// Return true if a generation permit is currently held.
    #[inline]
    pub fn is_generating(&self) -> bool {
        self.permit.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_generated(&self) -> bool {
        self.generated.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_generated(&self, generated: bool) {
        self.generated.store(generated, Ordering::Release);
    }

    #[inline]
    pub fn has_placed(&self) -> bool {
        self.placed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_placed(&self) {
        self.placed.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Add an anchor, returning the new anchor count.
    #[inline]
    pub(crate) fn anchor(&self) -> u32 {
        self.anchors.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Remove an anchor, returning the new anchor count. Removing an anchor from an
    /// unanchored region does nothing.
    pub(crate) fn unanchor(&self) -> u32 {
        match self.anchors.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    #[inline]
    pub fn anchors(&self) -> u32 {
        self.anchors.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_anchored(&self) -> bool {
        self.anchors() != 0
    }

    #[inline]
    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pins.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(prev.is_ok(), "unbalanced region unpin");
    }

    #[inline]
    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Total number of holds keeping this region in memory, anchors plus pins.
    #[inline]
    pub fn holds(&self) -> u32 {
        self.anchors() + self.pins()
    }

    /// Increment and return the idle tick counter.
    #[inline]
    pub(crate) fn tick_idle(&self) -> u32 {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub(crate) fn reset_idle(&self) {
        self.idle_ticks.store(0, Ordering::Relaxed);
    }

}

/// Guard of an acquired generation permit, see [`RegionState::try_acquire_permit`].
#[derive(Debug)]
pub struct GenPermit<'a> {
    state: &'a RegionState,
}

impl Drop for GenPermit<'_> {
    fn drop(&mut self) {
        self.state.permit.store(false, Ordering::Release);
    }
}

/// Coarse lifecycle phase of a region, derived from its state and its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionPhase {
    /// The region exists in the store but has not been generated.
    Cached,
    /// A generation task holds the permit.
    Generating,
    /// Generated but neither anchored nor next to an anchored region.
    Generated,
    /// Generated and anchored or next to an anchored region.
    Active,
}


/// A region of the world, shared between the store, the workers and the simulation.
pub struct Region {
    /// Region coordinates, immutable.
    pos: IVec2,
    state: RegionState,
    /// Data exclusively used by the holder of the generation permit.
    data: Mutex<RegionData>,
    /// Structures placed by other regions that still have to be applied here. The same
    /// lock covers the transition to generated, see [`Region::push_pending`].
    pending: Mutex<Vec<PendingStructure>>,
}

impl Region {

    pub fn new(pos: IVec2) -> Self {
        Self {
            pos,
            state: RegionState::default(),
            data: Mutex::new(RegionData::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn pos(&self) -> IVec2 {
        self.pos
    }

    /// Position of the first tile of the region.
    #[inline]
    pub fn offset(&self) -> IVec2 {
        calc_region_offset(self.pos)
    }

    #[inline]
    pub fn rect(&self) -> TileRect {
        calc_region_rect(self.pos)
    }

    #[inline]
    pub fn contains(&self, pos: IVec2) -> bool {
        calc_region_pos(pos) == self.pos
    }

    #[inline]
    pub fn state(&self) -> &RegionState {
        &self.state
    }

    #[inline]
    pub fn is_generated(&self) -> bool {
        self.state.is_generated()
    }

    /// Lock the region's data. While a generation task runs, this blocks until it has
    /// completed.
    #[inline]
    pub fn data(&self) -> MutexGuard<'_, RegionData> {
        self.data.lock()
    }

    /// Convenient function to read a tile, none if the position is outside of the region
    /// or if slices are not allocated.
    pub fn tile_at(&self, pos: IVec2) -> Option<u16> {
        if !self.contains(pos) {
            return None;
        }
        self.data.lock().tile(pos)
    }

    /// Append a pending structure record to this region. Returns true if the region is
    /// already generated, in which case the record waits for the next generation
    /// request on this region to be replayed.
    pub fn push_pending(&self, record: PendingStructure) -> bool {
        let mut pending = self.pending.lock();
        pending.push(record);
        // Read under the lock: the generation task drains the queue and sets the
        // generated flag while holding it.
        self.state.is_generated()
    }

    #[inline]
    pub(crate) fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingStructure>> {
        self.pending.lock()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count() != 0
    }

    /// Take all deferred actions to replay them in the simulation.
    pub fn take_deferred(&self) -> Vec<DeferredAction> {
        self.data.lock().take_deferred()
    }

    /// Clear the generated flag so that the next generation request runs every stage
    /// again from the start. Structures this region placed over its neighbors are not
    /// queued to them again. This fails if a generation task currently runs.
    pub fn invalidate(&self) -> bool {
        match self.state.try_acquire_permit() {
            Some(_permit) => {
                self.state.set_generated(false);
                true
            }
            None => false,
        }
    }

}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("pos", &self.pos)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
