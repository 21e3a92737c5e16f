//! A dimension ties a region store to its generator and drives the per-tick work:
//! polling generation completions, replaying the deferred actions of active regions,
//! resubmitting regions that received structures after being generated, and evicting
//! idle regions.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use std::sync::Arc;
use std::thread;
use std::io;

use crossbeam_channel::{Receiver, Sender};
use glam::IVec2;
use tracing::{debug, info, trace, warn};

use crate::persist::{RegionPersistence, RegionDir, MemoryPersistence, PersistError};
use crate::worldgen::{GeneratorBuilder, WorldGenerator, GenError};
use crate::store::{RegionStore, DEFAULT_UNLOAD_DELAY};
use crate::region::{Region, DeferredAction};
use crate::tile_entity::TileEntity;
use crate::entity::EntitySpawn;


/// Default number of ticks before a region that failed is retried.
pub const DEFAULT_RETRY_DELAY: u64 = 20;
/// Default number of failed attempts after which a region is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;


/// Configuration of a dimension.
#[derive(Debug, Clone)]
pub struct DimensionConfig {
    /// The world seed.
    pub seed: i64,
    /// Number of generation workers.
    pub workers: usize,
    /// Number of idle ticks before an unused region is saved and unloaded.
    pub unload_delay: u32,
    /// Directory of region files, regions are only kept in memory if absent.
    pub save_dir: Option<PathBuf>,
    /// Number of ticks before a region that failed is retried, doubled after each
    /// further failure.
    pub retry_delay: u64,
    /// Number of failed attempts after which a region is no longer retried.
    pub max_attempts: u32,
}

impl Default for DimensionConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            workers: thread::available_parallelism().map_or(2, |n| n.get()),
            unload_delay: DEFAULT_UNLOAD_DELAY,
            save_dir: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Receiver of the deferred actions of regions becoming active, this is typically the
/// entity system of the running world.
pub trait ActionSink {

    /// An entity produced by generation must be added to the world.
    fn add_entity(&mut self, spawn: EntitySpawn);

    /// A tile entity produced by generation must start being simulated.
    fn add_tile_entity(&mut self, pos: IVec2, tile_entity: TileEntity);

}

impl ActionSink for Vec<DeferredAction> {

    fn add_entity(&mut self, spawn: EntitySpawn) {
        self.push(DeferredAction::AddEntity(spawn));
    }

    fn add_tile_entity(&mut self, pos: IVec2, tile_entity: TileEntity) {
        self.push(DeferredAction::AddTileEntity { pos, tile_entity });
    }

}

/// Summary of a single dimension tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DimensionTick {
    /// Generation requests that completed successfully.
    pub completed: usize,
    /// Generation requests that failed.
    pub failed: usize,
    /// Deferred actions given to the sink.
    pub replayed: usize,
    /// Generated regions submitted again to implant their pending structures.
    pub resubmitted: usize,
    /// Regions saved and removed from memory.
    pub evicted: usize,
}

/// A completed generation request, sent back from the worker that ran it.
struct Completion {
    pos: IVec2,
    result: Result<(), GenError>,
}

/// Failed attempts of a region, cleared when a request on it succeeds.
#[derive(Debug)]
struct Failures {
    attempts: u32,
    /// Tick from which the region is retried, none once abandoned.
    retry_at: Option<u64>,
}

/// A world dimension owning its regions and their generator.
pub struct Dimension {
    generator: WorldGenerator,
    completion_sender: Sender<Completion>,
    completion_receiver: Receiver<Completion>,
    /// Regions with a generation request in flight.
    requested: HashSet<IVec2>,
    /// Regions whose last request failed.
    failures: HashMap<IVec2, Failures>,
    retry_delay: u64,
    max_attempts: u32,
    /// Number of ticks run.
    time: u64,
}

impl Dimension {

    /// Create a dimension generating with the default pipeline.
    pub fn new(config: &DimensionConfig) -> io::Result<Self> {
        Self::with_pipeline(config, GeneratorBuilder::with_default_pipeline)
    }

    /// Create a dimension whose generator pipeline is set up by the given function,
    /// which receives a builder already configured with the seed and worker count.
    pub fn with_pipeline<F>(config: &DimensionConfig, pipeline: F) -> io::Result<Self>
    where
        F: FnOnce(GeneratorBuilder) -> GeneratorBuilder,
    {

        let persistence: Arc<dyn RegionPersistence> = match &config.save_dir {
            Some(dir) => Arc::new(RegionDir::new(dir)),
            None => Arc::new(MemoryPersistence::new()),
        };

        let store = Arc::new(RegionStore::new(persistence, config.unload_delay));
        let builder = GeneratorBuilder::new(config.seed).workers(config.workers);
        let generator = pipeline(builder).build(store)?;

        info!("created dimension with seed {}, saving to {:?}", config.seed, config.save_dir);
        let mut dimension = Self::with_generator(generator);
        dimension.retry_delay = config.retry_delay;
        dimension.max_attempts = config.max_attempts.max(1);
        Ok(dimension)

    }

    /// Create a dimension around an already built generator.
    pub fn with_generator(generator: WorldGenerator) -> Self {
        let (completion_sender, completion_receiver) = crossbeam_channel::unbounded();
        Self {
            generator,
            completion_sender,
            completion_receiver,
            requested: HashSet::new(),
            failures: HashMap::new(),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            time: 0,
        }
    }

    #[inline]
    pub fn seed(&self) -> i64 {
        self.generator.seed()
    }

    #[inline]
    pub fn generator(&self) -> &WorldGenerator {
        &self.generator
    }

    #[inline]
    pub fn store(&self) -> &Arc<RegionStore> {
        self.generator.store()
    }

    /// Number of ticks run so far.
    #[inline]
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Number of generation requests in flight.
    #[inline]
    pub fn requested(&self) -> usize {
        self.requested.len()
    }

    /// Number of failed attempts of the last requests on the given region, zero once
    /// a request succeeds.
    pub fn failed_attempts(&self, pos: IVec2) -> u32 {
        self.failures.get(&pos).map_or(0, |failures| failures.attempts)
    }

    /// Request the given region to be generated on a worker, or its pending structures
    /// to be implanted if it is already generated. Returns false if nothing has to be
    /// done or if a request for this region is already in flight. An explicit request
    /// ignores the retry delay of a region that failed, even an abandoned one.
    pub fn request(&mut self, pos: IVec2) -> bool {
        let region = self.store().get_or_create(pos);
        self.request_region(&region)
    }

    /// Return true if the tick may submit a request for this region, which is not the
    /// case while a region that failed waits for its retry delay.
    fn retry_due(&self, pos: IVec2) -> bool {
        match self.failures.get(&pos) {
            Some(failures) => failures.retry_at.is_some_and(|tick| self.time >= tick),
            None => true,
        }
    }

    /// Record the failure of a request on the given region and schedule its retry.
    fn record_failure(&mut self, pos: IVec2) {

        let failures = self.failures.entry(pos).or_insert(Failures { attempts: 0, retry_at: None });
        failures.attempts += 1;

        if failures.attempts >= self.max_attempts {
            warn!("giving up region {pos} after {} failed attempts", failures.attempts);
            failures.retry_at = None;
        } else {
            let delay = self.retry_delay.saturating_mul(1u64 << (failures.attempts - 1).min(16));
            failures.retry_at = Some(self.time.saturating_add(delay));
        }

    }

    fn request_region(&mut self, region: &Arc<Region>) -> bool {

        let pos = region.pos();
        if (region.is_generated() && !region.has_pending()) || self.requested.contains(&pos) {
            return false;
        }

        trace!("requesting region {pos}");
        self.requested.insert(pos);
        let sender = self.completion_sender.clone();
        self.generator.generate(region, false, move |region, result| {
            // The dimension may have been dropped meanwhile.
            let _ = sender.send(Completion { pos: region.pos(), result });
        });

        true

    }

    /// Synchronously generate every region of the square of the given radius around
    /// the center region, on the calling thread, then implant structures that were
    /// queued against regions of the square generated earlier. Returns the number of
    /// regions that were not generated in memory, either generated now or loaded.
    pub fn prepare_spawn(&mut self, center: IVec2, radius: i32) -> Result<usize, GenError> {

        info!("preparing spawn area of radius {radius} around region {center}");

        let mut regions = Vec::new();
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                regions.push(self.store().get_or_create(center + IVec2::new(dx, dy)));
            }
        }

        let mut count = 0;
        for region in &regions {
            if !region.is_generated() {
                Self::generate_inline(&self.generator, region)?;
                count += 1;
            }
        }

        for region in &regions {
            if region.has_pending() {
                Self::generate_inline(&self.generator, region)?;
            }
        }

        info!("prepared {count} regions of the spawn area");
        Ok(count)

    }

    fn generate_inline(generator: &WorldGenerator, region: &Arc<Region>) -> Result<(), GenError> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        generator.generate(region, true, move |_, result| {
            let _ = sender.send(result);
        });
        // The task ran on this thread, so its result is already there.
        match receiver.try_recv() {
            Ok(result) => result,
            Err(_) => Err(GenError::Stage(format!("no completion for region {}", region.pos()))),
        }
    }

    /// Anchor the given region, which keeps it and its neighbors active. The region
    /// and its neighbors are requested for generation.
    pub fn anchor(&mut self, pos: IVec2) -> Arc<Region> {
        let region = self.store().anchor(pos);
        for dy in -1..=1 {
            for dx in -1..=1 {
                self.request(pos + IVec2::new(dx, dy));
            }
        }
        region
    }

    /// Remove one anchor from the given region, returning the remaining count.
    pub fn unanchor(&mut self, pos: IVec2) -> u32 {
        self.store().unanchor(pos)
    }

    /// Run a single tick of the dimension, the deferred actions of regions becoming
    /// active are given to the sink.
    pub fn tick(&mut self, sink: &mut dyn ActionSink) -> DimensionTick {

        let mut report = DimensionTick::default();
        self.time += 1;

        while let Ok(completion) = self.completion_receiver.try_recv() {
            self.requested.remove(&completion.pos);
            match completion.result {
                Ok(()) => {
                    self.failures.remove(&completion.pos);
                    report.completed += 1;
                }
                Err(err) => {
                    debug!("request of region {} failed: {err}", completion.pos);
                    if !matches!(err, GenError::Busy | GenError::Shutdown) {
                        self.record_failure(completion.pos);
                    }
                    report.failed += 1;
                }
            }
        }

        for region in self.store().regions() {

            let pos = region.pos();
            let state = region.state();
            // A running task holds the region's data, it is visited again next tick.
            if state.is_generating() {
                continue;
            }

            let active = self.store().is_active(pos);

            let due = self.retry_due(pos);

            if state.is_generated() {

                if due && region.has_pending() && self.request_region(&region) {
                    report.resubmitted += 1;
                }

                if active {
                    for action in region.take_deferred() {
                        match action {
                            DeferredAction::AddEntity(spawn) => sink.add_entity(spawn),
                            DeferredAction::AddTileEntity { pos, tile_entity } => sink.add_tile_entity(pos, tile_entity),
                        }
                        report.replayed += 1;
                    }
                }

            } else if active && due {
                // Active regions that failed to generate are retried.
                self.request_region(&region);
            }

        }

        report.evicted = self.store().tick().evicted.len();
        report

    }

    /// Stop generating: requests that have not started are aborted, and this waits
    /// for every request in flight to report its completion.
    pub fn shutdown(&mut self) {

        self.generator.shutdown();
        info!("waiting for {} generation requests...", self.requested.len());

        while !self.requested.is_empty() {
            match self.completion_receiver.recv_timeout(Duration::from_secs(1)) {
                Ok(completion) => {
                    self.requested.remove(&completion.pos);
                }
                Err(_) => trace!("still waiting for {} requests", self.requested.len()),
            }
        }

    }

    /// Save every region in memory, returning the regions that failed to save.
    pub fn save_all(&self) -> Vec<(IVec2, PersistError)> {
        info!("saving {} regions...", self.store().len());
        self.store().save_all()
    }

}
