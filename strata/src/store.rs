//! The region store is the authoritative cache of all regions currently in memory. It
//! is the only structure mutated by many threads, every access to its map is a short
//! critical section.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::IVec2;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::persist::{RegionPersistence, RegionSnapshot, PersistError};
use crate::region::{Region, RegionPhase};


/// Default number of idle ticks before an unused region is unloaded.
pub const DEFAULT_UNLOAD_DELAY: u32 = 600;


/// Concurrent map from region coordinates to their shared region.
pub struct RegionStore {
    /// All regions in memory. Pins are also taken while holding this lock, this way
    /// a region cannot be pinned while being evicted.
    map: Mutex<RegionMap>,
    /// Notified every time a region being saved leaves the saving set.
    saved: Condvar,
    /// Number of consecutive idle ticks before eviction.
    unload_delay: u32,
    /// Where evicted regions are saved and missing regions are loaded from.
    persistence: Arc<dyn RegionPersistence>,
}

#[derive(Default)]
struct RegionMap {
    /// Regions in memory.
    live: HashMap<IVec2, Arc<Region>>,
    /// Regions removed from memory whose save has not completed yet. Their coordinates
    /// cannot be created again until then, or the new region could load a stale file.
    saving: HashSet<IVec2>,
}

/// Report of a single store tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Regions removed from memory after being saved.
    pub evicted: Vec<IVec2>,
    /// Regions that could not be saved, they are kept in memory until next tick.
    pub failed: Vec<(IVec2, PersistError)>,
}

impl RegionStore {

    pub fn new(persistence: Arc<dyn RegionPersistence>, unload_delay: u32) -> Self {
        Self {
            map: Mutex::new(RegionMap::default()),
            saved: Condvar::new(),
            unload_delay,
            persistence,
        }
    }

    #[inline]
    pub fn persistence(&self) -> &dyn RegionPersistence {
        &*self.persistence
    }

    #[inline]
    pub fn unload_delay(&self) -> u32 {
        self.unload_delay
    }

    /// Lock the map, waiting for any save of the given coordinates to complete.
    fn lock_settled(&self, pos: IVec2) -> MutexGuard<'_, RegionMap> {
        let mut map = self.map.lock();
        while map.saving.contains(&pos) {
            trace!("waiting for region {pos} to be saved");
            self.saved.wait(&mut map);
        }
        map
    }

    /// Get the region at the given coordinates, or create and register it if missing.
    /// Concurrent calls for the same coordinates always return the same region.
    pub fn get_or_create(&self, pos: IVec2) -> Arc<Region> {
        let mut map = self.lock_settled(pos);
        Arc::clone(map.live.entry(pos).or_insert_with(|| Arc::new(Region::new(pos))))
    }

    /// Get the region at the given coordinates, if in memory. A region being saved
    /// after its eviction is no longer in memory.
    pub fn get(&self, pos: IVec2) -> Option<Arc<Region>> {
        self.map.lock().live.get(&pos).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all regions currently in memory, in no particular order.
    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.map.lock().live.values().cloned().collect()
    }

    /// Add an anchor to the given region, creating it if needed.
    pub fn anchor(&self, pos: IVec2) -> Arc<Region> {
        let mut map = self.lock_settled(pos);
        let region = map.live.entry(pos).or_insert_with(|| Arc::new(Region::new(pos)));
        region.state().anchor();
        region.state().reset_idle();
        Arc::clone(region)
    }

    /// Remove an anchor from the given region, returning the new anchor count.
    pub fn unanchor(&self, pos: IVec2) -> u32 {
        match self.map.lock().live.get(&pos) {
            Some(region) => region.state().unanchor(),
            None => 0,
        }
    }

    /// Return true if this region or any of its 8 neighbors is anchored.
    pub fn is_active(&self, pos: IVec2) -> bool {
        Self::is_active_in(&self.map.lock().live, pos)
    }

    fn is_active_in(regions: &HashMap<IVec2, Arc<Region>>, pos: IVec2) -> bool {
        for dy in -1..=1 {
            for dx in -1..=1 {
                if let Some(region) = regions.get(&(pos + IVec2::new(dx, dy))) {
                    if region.state().is_anchored() {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Coarse lifecycle phase of the given region.
    pub fn phase(&self, region: &Region) -> RegionPhase {
        let state = region.state();
        if state.is_generating() {
            RegionPhase::Generating
        } else if !state.is_generated() {
            RegionPhase::Cached
        } else if self.is_active(region.pos()) {
            RegionPhase::Active
        } else {
            RegionPhase::Generated
        }
    }

    /// Open a new pin scope on this store, every region cached through it stays in
    /// memory until the scope is released.
    pub fn pin_scope(self: &Arc<Self>) -> PinScope {
        PinScope {
            store: Arc::clone(self),
            pinned: Vec::new(),
        }
    }

    /// Pin the region registered at the coordinates of the given one, and return it.
    /// If the given instance has been evicted meanwhile, the returned region is the
    /// one now registered at its coordinates, created if missing, and the stale
    /// instance is left untouched.
    pub(crate) fn pin_region(&self, region: &Arc<Region>) -> Arc<Region> {
        let current = self.pin_pos(region.pos());
        if !Arc::ptr_eq(&current, region) {
            debug!("region {} was evicted, pinned its current instance", region.pos());
        }
        current
    }

    fn pin_pos(&self, pos: IVec2) -> Arc<Region> {
        let mut map = self.lock_settled(pos);
        let region = map.live.entry(pos).or_insert_with(|| Arc::new(Region::new(pos)));
        region.state().pin();
        region.state().reset_idle();
        Arc::clone(region)
    }

    /// Advance idle counters of every region and evict those that have been idle for
    /// long enough: no anchor, no pin, no anchored neighbor and no generation running.
    /// Evicted regions leave the map before being saved, without holding its lock, a
    /// region that fails to save is registered again.
    pub fn tick(&self) -> TickReport {

        let mut report = TickReport::default();

        let evicting = {
            let mut map = self.map.lock();
            let mut candidates = Vec::new();
            for (&pos, region) in map.live.iter() {
                let state = region.state();
                if state.holds() != 0 || state.is_generating() || Self::is_active_in(&map.live, pos) {
                    state.reset_idle();
                } else if state.tick_idle() >= self.unload_delay {
                    candidates.push(pos);
                }
            }
            let mut evicting = Vec::with_capacity(candidates.len());
            for pos in candidates {
                if let Some(region) = map.live.remove(&pos) {
                    map.saving.insert(pos);
                    evicting.push(region);
                }
            }
            evicting
        };

        for region in evicting {

            let pos = region.pos();
            let result = self.save_region(&region);

            let mut map = self.map.lock();
            map.saving.remove(&pos);
            match result {
                Ok(()) => report.evicted.push(pos),
                Err(err) => {
                    warn!("failed to save region {pos}: {err}");
                    map.live.insert(pos, region);
                    report.failed.push((pos, err));
                }
            }
            drop(map);
            self.saved.notify_all();

        }

        if !report.evicted.is_empty() {
            debug!("evicted {} regions, {} remaining", report.evicted.len(), self.len());
        }

        report

    }

    /// Save every region in memory, without evicting them. Returns the failures.
    pub fn save_all(&self) -> Vec<(IVec2, PersistError)> {
        let mut failed = Vec::new();
        for region in self.regions() {
            if let Err(err) = self.save_region(&region) {
                warn!("failed to save region {}: {err}", region.pos());
                failed.push((region.pos(), err));
            }
        }
        failed
    }

    /// Save a single region. A region that never consulted persistence only holds the
    /// pending records pushed to it, they are merged into what is already stored.
    fn save_region(&self, region: &Region) -> Result<(), PersistError> {

        let mut snapshot = RegionSnapshot::capture(region);

        if !region.state().is_loaded() {
            if let Some(mut stored) = self.persistence.load(region.pos())? {
                stored.pending.append(&mut snapshot.pending);
                snapshot = stored;
            }
        }

        if snapshot.is_empty() {
            return Ok(());
        }

        self.persistence.save(&snapshot)

    }

}

/// A set of regions pinned in memory for the duration of some work, typically the
/// generation of one region. Dropping the scope releases every pin.
pub struct PinScope {
    store: Arc<RegionStore>,
    pinned: Vec<Arc<Region>>,
}

impl PinScope {

    /// Get or create the region at the given coordinates and pin it until this scope
    /// is released.
    pub fn cache(&mut self, pos: IVec2) -> Arc<Region> {
        let region = self.store.pin_pos(pos);
        self.pinned.push(Arc::clone(&region));
        region
    }

    /// Pin an already known region until this scope is released, returning the
    /// instance actually pinned, see [`RegionStore::pin_region`].
    pub fn hold(&mut self, region: &Arc<Region>) -> Arc<Region> {
        let current = self.store.pin_region(region);
        self.pinned.push(Arc::clone(&current));
        current
    }

    /// Take ownership of a pin already taken with [`RegionStore::pin_region`].
    pub(crate) fn adopt(&mut self, region: Arc<Region>) {
        self.pinned.push(region);
    }

    /// Number of pins held by this scope.
    #[inline]
    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }

    /// Release every pin held by this scope.
    pub fn uncache_all(&mut self) {
        for region in self.pinned.drain(..) {
            region.state().unpin();
        }
    }

}

impl Drop for PinScope {
    fn drop(&mut self) {
        self.uncache_all();
    }
}


#[cfg(test)]
mod tests {

    use std::time::Duration;
    use std::thread;
    use std::io;

    use crossbeam_channel::{Receiver, Sender};

    use super::*;
    use crate::persist::MemoryPersistence;
    use crate::tile;

    fn new_store(delay: u32) -> (Arc<RegionStore>, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        (Arc::new(RegionStore::new(persistence.clone(), delay)), persistence)
    }

    /// Persistence where every save waits to be released, and fails if released with
    /// false.
    struct GatedPersistence {
        inner: MemoryPersistence,
        entered: Sender<IVec2>,
        release: Receiver<bool>,
    }

    impl RegionPersistence for GatedPersistence {

        fn load(&self, pos: IVec2) -> Result<Option<RegionSnapshot>, PersistError> {
            self.inner.load(pos)
        }

        fn save(&self, snapshot: &RegionSnapshot) -> Result<(), PersistError> {
            let _ = self.entered.send(snapshot.pos);
            match self.release.recv() {
                Ok(true) => self.inner.save(snapshot),
                _ => Err(io::Error::other("save refused").into()),
            }
        }

    }

    /// A store with gated persistence and a generated region at (5, 5), evicted on
    /// the next tick.
    fn gated_store() -> (Arc<RegionStore>, Arc<GatedPersistence>, Receiver<IVec2>, Sender<bool>, Arc<Region>) {

        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let persistence = Arc::new(GatedPersistence {
            inner: MemoryPersistence::new(),
            entered: entered_tx,
            release: release_rx,
        });

        let store = Arc::new(RegionStore::new(persistence.clone(), 1));
        let region = store.get_or_create(IVec2::new(5, 5));
        region.data().ensure_slices()[0].fill_tile(tile::STONE);
        region.state().set_loaded();
        region.state().set_generated(true);

        (store, persistence, entered_rx, release_tx, region)

    }

    #[test]
    fn get_or_create_is_unique() {
        let (store, _) = new_store(10);
        let handles = (0..8).map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.get_or_create(IVec2::new(3, -2)))
        }).collect::<Vec<_>>();
        let regions = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
        assert!(regions.iter().all(|r| Arc::ptr_eq(r, &regions[0])));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn neighbors_of_anchor_are_active() {
        let (store, _) = new_store(10);
        store.anchor(IVec2::new(0, 0));
        assert!(store.is_active(IVec2::new(0, 0)));
        assert!(store.is_active(IVec2::new(1, 1)));
        assert!(store.is_active(IVec2::new(-1, 0)));
        assert!(!store.is_active(IVec2::new(2, 0)));
        assert_eq!(store.unanchor(IVec2::new(0, 0)), 0);
        assert!(!store.is_active(IVec2::new(1, 1)));
    }

    #[test]
    fn eviction_after_delay() {

        let (store, persistence) = new_store(3);

        let region = store.get_or_create(IVec2::new(5, 5));
        region.data().ensure_slices()[0].fill_tile(tile::STONE);
        region.state().set_loaded();
        region.state().set_generated(true);
        drop(region);

        store.get_or_create(IVec2::new(9, 9));

        let mut scope = store.pin_scope();
        scope.cache(IVec2::new(9, 9));
        store.anchor(IVec2::new(20, 20));

        for _ in 0..2 {
            assert!(store.tick().evicted.is_empty());
        }

        let report = store.tick();
        assert_eq!(report.evicted, [IVec2::new(5, 5)]);
        assert!(report.failed.is_empty());
        assert!(store.get(IVec2::new(5, 5)).is_none());
        assert!(persistence.load(IVec2::new(5, 5)).unwrap().is_some());

        // Pinned and anchored regions are never evicted.
        for _ in 0..10 {
            store.tick();
        }
        assert!(store.get(IVec2::new(9, 9)).is_some());
        assert!(store.get(IVec2::new(20, 20)).is_some());

        scope.uncache_all();
        for _ in 0..3 {
            store.tick();
        }
        assert!(store.get(IVec2::new(9, 9)).is_none());
        assert!(store.get(IVec2::new(20, 20)).is_some());

    }

    #[test]
    fn eviction_saves_outside_map_lock() {

        let (store, persistence, entered, release, evicted) = gated_store();
        let pos = IVec2::new(5, 5);

        let ticking = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.tick())
        };
        assert_eq!(entered.recv_timeout(Duration::from_secs(5)).unwrap(), pos);

        // The save is blocked, other regions are still reachable.
        store.get_or_create(IVec2::new(9, 9));
        assert!(store.get(pos).is_none());

        // Creating the region being saved waits for its save.
        let (created_tx, created_rx) = crossbeam_channel::bounded(1);
        let creating = {
            let store = Arc::clone(&store);
            thread::spawn(move || created_tx.send(store.get_or_create(pos)).unwrap())
        };
        assert!(created_rx.recv_timeout(Duration::from_millis(50)).is_err());

        release.send(true).unwrap();
        let report = ticking.join().unwrap();
        assert_eq!(report.evicted, [pos]);

        let created = created_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        creating.join().unwrap();
        assert!(!Arc::ptr_eq(&created, &evicted));
        assert!(!created.state().is_loaded());
        assert!(persistence.inner.load(pos).unwrap().is_some());

    }

    #[test]
    fn failed_save_keeps_region() {

        let (store, persistence, entered, release, region) = gated_store();
        let pos = IVec2::new(5, 5);

        release.send(false).unwrap();
        let report = store.tick();
        assert_eq!(entered.try_recv().unwrap(), pos);
        assert!(report.evicted.is_empty());
        assert_eq!(report.failed.len(), 1);

        assert!(Arc::ptr_eq(&store.get(pos).unwrap(), &region));
        assert!(persistence.inner.load(pos).unwrap().is_none());

        // Retried on the next tick.
        release.send(true).unwrap();
        assert_eq!(store.tick().evicted, [pos]);

    }

    #[test]
    fn stale_instance_is_replaced() {

        let (store, _) = new_store(1);
        let pos = IVec2::new(2, 2);
        let stale = store.get_or_create(pos);
        assert_eq!(store.tick().evicted, [pos]);

        let current = store.pin_region(&stale);
        assert!(!Arc::ptr_eq(&current, &stale));
        assert!(Arc::ptr_eq(&store.get(pos).unwrap(), &current));
        assert_eq!(current.state().pins(), 1);
        assert_eq!(stale.state().pins(), 0);

        // The current instance is pinned again, not duplicated.
        assert!(Arc::ptr_eq(&store.pin_region(&current), &current));
        assert_eq!(current.state().pins(), 2);

    }

    #[test]
    fn pin_scope_releases_on_drop() {
        let (store, _) = new_store(1);
        let region;
        {
            let mut scope = store.pin_scope();
            region = scope.cache(IVec2::new(1, 2));
            scope.cache(IVec2::new(1, 2));
            assert_eq!(scope.len(), 2);
            assert_eq!(region.state().pins(), 2);
        }
        assert_eq!(region.state().pins(), 0);
    }

}
