//! World generation module.
//!
//! Generation is driven region by region. Each request runs as a task that acquires the
//! region's permit, runs every registered stage in order through a [`GenProvider`]
//! bound to that region, implants the structures other regions queued against it,
//! rebuilds its light and finally marks it generated.
//!
//! Stages and structures must be pure functions of the world seed and of absolute tile
//! coordinates, this is what makes a region identical whatever the order in which the
//! regions around it are generated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use std::sync::Arc;
use std::any::Any;
use std::io;

use arcstr::ArcStr;
use glam::IVec2;
use thiserror::Error;
use tracing::{debug, trace, warn, instrument};

use crate::region::{Region, RegionData, PendingStructure, calc_region_offset, calc_region_rect};
use crate::progress::{LoadProgress, LoadGuard, NoProgress};
use crate::util::{SeededRandom, TileRect, region_seed};
use crate::store::{RegionStore, PinScope};
use crate::persist::PersistError;
use crate::tile::TileRegistry;
use crate::pool::WorkerPool;
use crate::light;

mod provider;
pub use provider::GenProvider;

mod structure;
pub use structure::{Structure, StructureRegistry};

mod terrain;
pub use terrain::TerrainStageFactory;

mod ore;
pub use ore::OreStage;

mod tree;
pub use tree::{TreeStructure, TreeStage};

mod dungeon;
pub use dungeon::{DungeonStructure, DungeonStage};


/// Salt mixed into the seed of each stage's random generator.
const STAGE_SALT: i64 = 0x5EED_57A6E;


/// Everything a stage knows about the current call, built fresh for each stage of each
/// region and passed by value.
#[derive(Debug, Clone)]
pub struct GenContext {
    /// The world seed.
    pub seed: i64,
    /// Index of the stage in the pipeline.
    pub stage_id: usize,
    /// Coordinates of the region being generated.
    pub region: IVec2,
    /// Random generator derived from the seed, the region and the stage index.
    pub rand: SeededRandom,
}

impl GenContext {

    pub fn new(seed: i64, stage_id: usize, region: IVec2) -> Self {
        Self {
            seed,
            stage_id,
            region,
            rand: SeededRandom::new(region_seed(seed, region, STAGE_SALT + stage_id as i64)),
        }
    }

    /// Position of the first tile of the region.
    #[inline]
    pub fn offset(&self) -> IVec2 {
        calc_region_offset(self.region)
    }

    #[inline]
    pub fn rect(&self) -> TileRect {
        calc_region_rect(self.region)
    }

}

/// A stage shared between all regions, it must not keep any state between calls.
pub trait TerrainStage: Send + Sync {

    fn generate(&self, cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError>;

}

/// A throw-away stage created for a single region, this is typically used by stages
/// that build noise tables from the seed before running.
pub trait RegionStage {

    fn generate(&mut self, cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError>;

}

/// A factory creating a [`RegionStage`] for each region.
pub trait StageFactory: Send + Sync {

    fn create(&self, cx: &GenContext) -> Box<dyn RegionStage>;

}

/// A registered stage, both kinds are run through [`Stage::generate`].
pub enum Stage {
    Stateless(Box<dyn TerrainStage>),
    PerRegion(Box<dyn StageFactory>),
}

impl Stage {

    pub fn generate(&self, cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError> {
        match self {
            Stage::Stateless(stage) => stage.generate(cx, provider),
            Stage::PerRegion(factory) => factory.create(&cx).generate(cx, provider),
        }
    }

}

/// Adapter used to register closures as stateless stages.
struct FnStage<F>(F);

impl<F> TerrainStage for FnStage<F>
where
    F: Fn(GenContext, &mut GenProvider) -> Result<(), GenError> + Send + Sync,
{
    fn generate(&self, cx: GenContext, provider: &mut GenProvider) -> Result<(), GenError> {
        (self.0)(cx, provider)
    }
}


/// Builder for a [`WorldGenerator`], stages and structures can only be registered here,
/// the generator's pipeline is immutable once built.
pub struct GeneratorBuilder {
    seed: i64,
    workers: usize,
    stages: Vec<(ArcStr, Stage)>,
    tiles: TileRegistry,
    structures: StructureRegistry,
    progress: Arc<dyn LoadProgress>,
}

impl GeneratorBuilder {

    /// Create a builder with an empty pipeline, default tiles and one worker.
    pub fn new(seed: i64) -> Self {
        Self {
            seed,
            workers: 1,
            stages: Vec::new(),
            tiles: TileRegistry::with_defaults(),
            structures: StructureRegistry::new(),
            progress: Arc::new(NoProgress),
        }
    }

    /// Register the default structures and the default pipeline: terrain, ores, trees
    /// and dungeons, in this order.
    pub fn with_default_pipeline(self) -> Self {
        self.structure("tree", TreeStructure)
            .structure("dungeon", DungeonStructure)
            .stage("terrain", Stage::PerRegion(Box::new(TerrainStageFactory)))
            .stage("ores", Stage::Stateless(Box::new(OreStage::default())))
            .stage("trees", Stage::Stateless(Box::new(TreeStage::default())))
            .stage("dungeons", Stage::Stateless(Box::new(DungeonStage::default())))
    }

    /// Number of worker threads of the generator's pool.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn tiles(mut self, tiles: TileRegistry) -> Self {
        self.tiles = tiles;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn LoadProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Append a stage to the pipeline.
    pub fn stage(mut self, name: impl Into<ArcStr>, stage: Stage) -> Self {
        self.stages.push((name.into(), stage));
        self
    }

    /// Append a closure as a stateless stage.
    pub fn stage_fn<F>(self, name: impl Into<ArcStr>, func: F) -> Self
    where
        F: Fn(GenContext, &mut GenProvider) -> Result<(), GenError> + Send + Sync + 'static,
    {
        self.stage(name, Stage::Stateless(Box::new(FnStage(func))))
    }

    /// Register a structure under the given name, replacing any previous one.
    pub fn structure(mut self, name: impl Into<ArcStr>, structure: impl Structure + 'static) -> Self {
        self.structures.register(name, structure);
        self
    }

    /// Build the generator and spawn its workers.
    pub fn build(self, store: Arc<RegionStore>) -> io::Result<WorldGenerator> {
        let pool = WorkerPool::new("Region Gen", self.workers)?;
        debug!("built generator with {} stages and {} workers", self.stages.len(), pool.len());
        Ok(WorldGenerator {
            shared: Arc::new(GenShared {
                seed: self.seed,
                stages: self.stages,
                tiles: self.tiles,
                structures: self.structures,
                store,
                progress: self.progress,
                shutdown: AtomicBool::new(false),
                stats: GenStats::default(),
            }),
            pool,
        })
    }

}


/// The asynchronous generation driver.
pub struct WorldGenerator {
    shared: Arc<GenShared>,
    /// Dropped after the shared state, this joins every worker.
    pool: WorkerPool,
}

/// Immutable state shared between the generator and its tasks.
struct GenShared {
    seed: i64,
    stages: Vec<(ArcStr, Stage)>,
    tiles: TileRegistry,
    structures: StructureRegistry,
    store: Arc<RegionStore>,
    progress: Arc<dyn LoadProgress>,
    /// Cooperative shutdown flag, read once when a task starts.
    shutdown: AtomicBool,
    stats: GenStats,
}

/// Statistics about generation performance.
#[derive(Debug, Default)]
pub struct GenStats {
    /// Total duration of stage pipelines, in μs.
    pipeline_duration: AtomicU64,
    /// Number of samples added to 'pipeline_duration'.
    pipeline_count: AtomicU64,
    /// Number of pending structures implanted.
    implant_count: AtomicU64,
    /// Number of tasks that reported an error other than busy or shutdown.
    failure_count: AtomicU64,
}

impl GenStats {

    /// Average duration of a stage pipeline, in seconds.
    pub fn average_pipeline_duration(&self) -> f32 {
        // Duration and count are not synchronized, this is only an estimate.
        let count = self.pipeline_count();
        if count == 0 {
            0.0
        } else {
            self.pipeline_duration.load(Ordering::Relaxed) as f32 / count as f32 / 1_000_000.0
        }
    }

    /// Number of stage pipelines that ran to completion.
    #[inline]
    pub fn pipeline_count(&self) -> u64 {
        self.pipeline_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn implant_count(&self) -> u64 {
        self.implant_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

}

impl WorldGenerator {

    #[inline]
    pub fn seed(&self) -> i64 {
        self.shared.seed
    }

    #[inline]
    pub fn store(&self) -> &Arc<RegionStore> {
        &self.shared.store
    }

    #[inline]
    pub fn tiles(&self) -> &TileRegistry {
        &self.shared.tiles
    }

    #[inline]
    pub fn structures(&self) -> &StructureRegistry {
        &self.shared.structures
    }

    #[inline]
    pub fn stats(&self) -> &GenStats {
        &self.shared.stats
    }

    /// Names of the stages, in pipeline order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.shared.stages.iter().map(|(name, _)| name.as_str())
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.pool.queued()
    }

    /// Request shutdown, tasks that have not started yet report [`GenError::Shutdown`]
    /// without running any stage, running tasks complete normally.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Generate the given region, or implant its pending structures if already
    /// generated. The task runs on the calling thread if `run_inline` is true, on a
    /// worker otherwise. The completion callback is called exactly once, from the
    /// thread that ran the task, with the region registered in the store at the
    /// coordinates of the given one.
    pub fn generate<F>(&self, region: &Arc<Region>, run_inline: bool, on_complete: F)
    where
        F: FnOnce(&Arc<Region>, Result<(), GenError>) + Send + 'static,
    {

        let load = LoadGuard::start(Arc::clone(&self.shared.progress));
        // The region is pinned right now, so it cannot be evicted while queued. A stale
        // instance is replaced by the one registered at its coordinates.
        let region = self.shared.store.pin_region(region);

        if run_inline {
            self.shared.run(region, load, on_complete);
        } else {
            let shared = Arc::clone(&self.shared);
            self.pool.submit(move || shared.run(region, load, on_complete));
        }

    }

}

impl GenShared {

    fn run<F>(&self, region: Arc<Region>, load: LoadGuard, on_complete: F)
    where
        F: FnOnce(&Arc<Region>, Result<(), GenError>),
    {

        let mut pins = self.store.pin_scope();
        pins.adopt(Arc::clone(&region));

        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.generate(&region, &mut pins))) {
            Ok(result) => result,
            Err(payload) => Err(GenError::Panicked(panic_message(payload))),
        };

        pins.uncache_all();

        match &result {
            Ok(()) => {}
            Err(err @ (GenError::Busy | GenError::Shutdown)) => {
                debug!("region {} not generated: {err}", region.pos());
            }
            Err(err) => {
                self.stats.failure_count.fetch_add(1, Ordering::Relaxed);
                warn!("failed to generate region {}: {err}", region.pos());
            }
        }

        on_complete(&region, result);
        drop(load);

    }

    #[instrument(skip_all, fields(region = %region.pos()))]
    fn generate(&self, region: &Region, pins: &mut PinScope) -> Result<(), GenError> {

        if self.shutdown.load(Ordering::Acquire) {
            return Err(GenError::Shutdown);
        }

        let Some(_permit) = region.state().try_acquire_permit() else {
            return Err(GenError::Busy);
        };

        let mut data = region.data();

        if !region.state().is_loaded() {
            if let Some(snapshot) = self.store.persistence().load(region.pos())? {
                trace!("loaded from persistence");
                snapshot.merge_into(region, &mut data);
            }
            region.state().set_loaded();
        }

        let mut outgoing = Vec::new();

        if !region.is_generated() {

            // Stages always start from empty slices, even after a failed run.
            data.reset_for_generation();

            let start = Instant::now();
            let mut provider = GenProvider::new(self, region, &mut data, pins);
            for (stage_id, (name, stage)) in self.stages.iter().enumerate() {
                trace!("running stage {name}");
                stage.generate(GenContext::new(self.seed, stage_id, region.pos()), &mut provider)?;
            }
            outgoing = provider.take_outgoing();

            let duration = start.elapsed();
            self.stats.pipeline_duration.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
            self.stats.pipeline_count.fetch_add(1, Ordering::Relaxed);

        }

        self.finalize(region, &mut data, pins)?;
        Self::queue_outgoing(region, outgoing);
        Ok(())

    }

    /// Queue the records of structures this region placed over other regions. This is
    /// only done once per region: a pipeline run again after an invalidation produces
    /// the same records, which its neighbors already received.
    fn queue_outgoing(region: &Region, outgoing: Vec<(Arc<Region>, PendingStructure)>) {

        if region.state().has_placed() {
            if !outgoing.is_empty() {
                trace!("dropped {} records already queued to neighbors", outgoing.len());
            }
            return;
        }

        for (target, record) in outgoing {
            if target.push_pending(record) {
                trace!("queued structure for replay in generated region {}", target.pos());
            }
        }

        region.state().set_placed();

    }

    /// Implant every pending structure, rebuild light and mark the region generated.
    /// The pending queue stays locked until the region is marked generated, so a
    /// record pushed concurrently is either implanted now or kept for a replay.
    fn finalize(&self, region: &Region, data: &mut RegionData, pins: &mut PinScope) -> Result<(), GenError> {

        let mut pending = region.lock_pending();
        let mut records = std::mem::take(&mut *pending);

        if !records.is_empty() {

            // Records of a batch are applied in a fixed order, whatever the order in
            // which neighbors pushed them.
            records.sort_by(|a, b| {
                (a.origin().to_array(), a.structure.as_str(), a.variant.seed)
                    .cmp(&(b.origin().to_array(), b.structure.as_str(), b.variant.seed))
            });

            let mut provider = GenProvider::new(self, region, data, pins);
            for index in 0..records.len() {
                if let Err(err) = provider.implant(&records[index]) {
                    // Restore the records not applied yet before the newer ones.
                    let newer = std::mem::replace(&mut *pending, records.split_off(index));
                    pending.extend(newer);
                    return Err(err);
                }
            }

            self.stats.implant_count.fetch_add(records.len() as u64, Ordering::Relaxed);
            trace!("implanted {} pending structures", records.len());

        }

        light::rebuild_light(region.pos(), data.ensure_slices(), &self.tiles);
        region.state().set_generated(true);

        Ok(())

    }

}

/// Extract a message from a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}


/// Error type returned by generation tasks, stages and structures.
#[derive(Error, Debug)]
pub enum GenError {
    #[error("generator is shut down")]
    Shutdown,
    #[error("region is already being generated")]
    Busy,
    #[error("tile {pos} is outside of region {region}")]
    OutOfBounds { pos: IVec2, region: IVec2 },
    #[error("unknown structure: {0}")]
    UnknownStructure(ArcStr),
    #[error("structure {structure} at {footprint} is not inside the structure placing it at {parent}")]
    NestedOutside { structure: ArcStr, footprint: TileRect, parent: TileRect },
    #[error("persist: {0}")]
    Persist(#[from] PersistError),
    #[error("stage failed: {0}")]
    Stage(String),
    #[error("panicked: {0}")]
    Panicked(String),
}


#[cfg(test)]
mod tests {

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use std::thread;

    use parking_lot::Mutex;

    use crate::region::{StructureVariant, DeferredAction};
    use crate::persist::MemoryPersistence;
    use crate::tile::{self, TileAccess, TileBehavior};
    use crate::progress::LoadCounter;

    use super::*;

    fn new_store() -> Arc<RegionStore> {
        Arc::new(RegionStore::new(Arc::new(MemoryPersistence::new()), 100))
    }

    /// Generate the region on the calling thread and return the reported result.
    fn generate_inline(generator: &WorldGenerator, pos: IVec2) -> Result<(), GenError> {
        let region = generator.store().get_or_create(pos);
        let (tx, rx) = crossbeam_channel::bounded(1);
        generator.generate(&region, true, move |_, result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap()
    }

    /// Every tile, wall and light level of the region, in rectangle order.
    fn dump(region: &Region) -> Vec<(u16, u16, u8)> {
        let data = region.data();
        region.rect().iter()
            .map(|pos| (data.tile(pos).unwrap(), data.wall(pos).unwrap(), data.light(pos).unwrap()))
            .collect()
    }

    fn counting_stage(builder: GeneratorBuilder, calls: &Arc<AtomicUsize>) -> GeneratorBuilder {
        let calls = Arc::clone(calls);
        builder.stage_fn("count", move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    /// A horizontal bar of gravel, recording the regions applying it.
    struct BarStructure {
        len: i32,
        applied: Arc<Mutex<Vec<IVec2>>>,
    }

    impl Structure for BarStructure {

        fn footprint(&self, origin: IVec2, _variant: StructureVariant) -> TileRect {
            TileRect::from_size(origin, IVec2::new(self.len, 1))
        }

        fn place(&self, origin: IVec2, _variant: StructureVariant, provider: &mut GenProvider) -> Result<(), GenError> {
            self.applied.lock().push(provider.region());
            for dx in 0..self.len {
                provider.set_tile_at(origin + IVec2::new(dx, 0), tile::GRAVEL)?;
            }
            Ok(())
        }

    }

    fn bar_generator(applied: &Arc<Mutex<Vec<IVec2>>>) -> WorldGenerator {
        bar_builder(applied).build(new_store()).unwrap()
    }

    /// Stone regions, the origin region places a bar reaching the region on its east.
    fn bar_builder(applied: &Arc<Mutex<Vec<IVec2>>>) -> GeneratorBuilder {
        GeneratorBuilder::new(5)
            .structure("bar", BarStructure { len: 10, applied: Arc::clone(applied) })
            .stage_fn("stone", |cx, provider| {
                for pos in cx.rect().iter() {
                    provider.set_tile_at(pos, tile::STONE)?;
                }
                Ok(())
            })
            .stage_fn("bar", |cx, provider| {
                if cx.region == IVec2::ZERO {
                    provider.place_structure("bar", IVec2::new(60, 10), StructureVariant::default())?;
                }
                Ok(())
            })
    }

    /// A structure only placing a bar at its origin.
    struct HostStructure {
        width: i32,
    }

    impl Structure for HostStructure {

        fn footprint(&self, origin: IVec2, _variant: StructureVariant) -> TileRect {
            TileRect::from_size(origin, IVec2::new(self.width, 1))
        }

        fn place(&self, origin: IVec2, variant: StructureVariant, provider: &mut GenProvider) -> Result<(), GenError> {
            provider.place_structure("bar", origin, variant)
        }

    }

    /// A behavior recording its hooks along with the tile present when called.
    struct RecordingBehavior {
        id: u16,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TileBehavior for RecordingBehavior {

        fn handle_place(&self, access: &mut dyn TileAccess, pos: IVec2) -> Result<(), GenError> {
            let current = access.tile_at(pos)?;
            self.log.lock().push(format!("place {} over {current}", self.id));
            Ok(())
        }

        fn handle_remove(&self, access: &mut dyn TileAccess, pos: IVec2) -> Result<(), GenError> {
            let current = access.tile_at(pos)?;
            self.log.lock().push(format!("remove {} over {current}", self.id));
            Ok(())
        }

    }

    #[test]
    fn fill_scenario() {

        let generator = GeneratorBuilder::new(42)
            .stage_fn("fill", |cx, provider| {
                for pos in cx.rect().iter() {
                    provider.set_tile_at(pos, 7)?;
                }
                Ok(())
            })
            .build(new_store())
            .unwrap();

        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());

        let region = generator.store().get(IVec2::ZERO).unwrap();
        assert!(region.is_generated());
        let data = region.data();
        let slices = data.slices().unwrap();
        assert_eq!(slices.len(), 16);
        assert!(slices.iter().all(|slice| slice.tiles().iter().all(|&id| id == 7)));

    }

    #[test]
    fn same_seed_same_regions() {

        let order = [IVec2::new(0, 0), IVec2::new(1, 0), IVec2::new(0, -1), IVec2::new(-1, -3)];

        let run = || {
            let generator = GeneratorBuilder::new(1234)
                .with_default_pipeline()
                .build(new_store())
                .unwrap();
            for pos in order {
                assert!(generate_inline(&generator, pos).is_ok());
            }
            // Replay the records queued against regions generated earlier.
            for region in generator.store().regions() {
                if region.is_generated() && region.has_pending() {
                    assert!(generate_inline(&generator, region.pos()).is_ok());
                }
            }
            order.map(|pos| {
                let region = generator.store().get(pos).unwrap();
                let deferred = region.data().deferred().to_vec();
                (dump(&region), deferred)
            })
        };

        assert!(run() == run());

    }

    #[test]
    fn default_pipeline_order() {
        let generator = GeneratorBuilder::new(0)
            .with_default_pipeline()
            .build(new_store())
            .unwrap();
        assert_eq!(generator.stage_names().collect::<Vec<_>>(), ["terrain", "ores", "trees", "dungeons"]);
        assert_eq!(generator.structures().names().collect::<Vec<_>>(), ["tree", "dungeon"]);
        assert!(generate_inline(&generator, IVec2::new(2, -4)).is_ok());
        assert_eq!(generator.stats().pipeline_count(), 1);
        assert_eq!(generator.stats().failure_count(), 0);
    }

    #[test]
    fn one_pipeline_per_region() {

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);
        let generator = GeneratorBuilder::new(1)
            .workers(4)
            .stage_fn("slow", move |_, _| {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                Ok(())
            })
            .build(new_store())
            .unwrap();

        let region = generator.store().get_or_create(IVec2::new(3, 3));
        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..8 {
            let tx = tx.clone();
            generator.generate(&region, false, move |_, result| {
                let _ = tx.send(result);
            });
        }

        let results = (0..8).map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap()).collect::<Vec<_>>();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().any(|result| result.is_ok()));
        assert!(results.iter().all(|result| matches!(result, Ok(()) | Err(GenError::Busy))));
        assert!(region.is_generated());
        assert!(!region.state().is_generating());
        assert_eq!(region.state().pins(), 0);

    }

    #[test]
    fn generated_region_skips_stages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = counting_stage(GeneratorBuilder::new(1), &calls)
            .build(new_store())
            .unwrap();
        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn provider_bounds() {

        let generator = GeneratorBuilder::new(1)
            .stage_fn("bounds", |cx, provider| {
                let offset = cx.offset();
                for delta in [IVec2::new(-1, 0), IVec2::new(0, -1), IVec2::new(64, 0), IVec2::new(0, 64)] {
                    if !matches!(provider.set_tile_at(offset + delta, tile::DIRT), Err(GenError::OutOfBounds { .. })) {
                        return Err(GenError::Stage(format!("write at {delta} accepted")));
                    }
                }
                provider.set_tile_at(offset, tile::DIRT)?;
                provider.set_tile_at(offset + IVec2::splat(63), tile::DIRT)?;
                Ok(())
            })
            .build(new_store())
            .unwrap();

        let pos = IVec2::new(-1, 2);
        assert!(generate_inline(&generator, pos).is_ok());

        let region = generator.store().get(pos).unwrap();
        assert_eq!(region.tile_at(region.offset()), Some(tile::DIRT));
        assert_eq!(region.tile_at(region.offset() + IVec2::splat(63)), Some(tile::DIRT));

    }

    #[test]
    fn structure_applied_once_in_order() {

        // The bar starts in region (0,0) and ends in region (1,0), which is generated
        // after its neighbor.
        let applied = Arc::new(Mutex::new(Vec::new()));
        let generator = bar_generator(&applied);
        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());

        let east = generator.store().get(IVec2::X).unwrap();
        assert!(!east.is_generated());
        assert_eq!(east.pending_count(), 1);

        assert!(generate_inline(&generator, IVec2::X).is_ok());
        assert_eq!(east.pending_count(), 0);
        assert_eq!(*applied.lock(), [IVec2::ZERO, IVec2::X]);

        let first = dump(&east);
        assert_eq!(east.tile_at(IVec2::new(64, 10)), Some(tile::GRAVEL));
        assert_eq!(east.tile_at(IVec2::new(69, 10)), Some(tile::GRAVEL));
        assert_eq!(east.tile_at(IVec2::new(70, 10)), Some(tile::STONE));

        // Now the other way around, the record reaches an already generated region
        // and waits for a replay.
        let applied = Arc::new(Mutex::new(Vec::new()));
        let generator = bar_generator(&applied);
        assert!(generate_inline(&generator, IVec2::X).is_ok());
        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());

        let east = generator.store().get(IVec2::X).unwrap();
        assert!(east.has_pending());
        assert_eq!(east.tile_at(IVec2::new(64, 10)), Some(tile::STONE));

        assert!(generate_inline(&generator, IVec2::X).is_ok());
        assert!(!east.has_pending());
        assert_eq!(*applied.lock(), [IVec2::ZERO, IVec2::X]);
        assert!(dump(&east) == first);

        // A further replay has nothing left to apply.
        assert!(generate_inline(&generator, IVec2::X).is_ok());
        assert_eq!(applied.lock().len(), 2);

    }

    #[test]
    fn shutdown_skips_stages() {

        let calls = Arc::new(AtomicUsize::new(0));
        let generator = counting_stage(GeneratorBuilder::new(1), &calls)
            .build(new_store())
            .unwrap();

        generator.shutdown();
        assert!(generator.is_shutdown());
        assert!(matches!(generate_inline(&generator, IVec2::ZERO), Err(GenError::Shutdown)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let region = generator.store().get(IVec2::ZERO).unwrap();
        assert!(!region.is_generated());
        assert!(!region.state().is_generating());

    }

    #[test]
    fn shutdown_lets_running_task_complete() {

        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);
        let generator = GeneratorBuilder::new(1)
            .stage_fn("wait", move |_, _| {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            })
            .build(new_store())
            .unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let running = generator.store().get_or_create(IVec2::ZERO);
        let queued = generator.store().get_or_create(IVec2::ONE);

        let running_tx = tx.clone();
        generator.generate(&running, false, move |region, result| {
            let _ = running_tx.send((region.pos(), result));
        });
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        generator.shutdown();
        generator.generate(&queued, false, move |region, result| {
            let _ = tx.send((region.pos(), result));
        });
        release_tx.send(()).unwrap();

        let (first_pos, first) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let (second_pos, second) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(first_pos, IVec2::ZERO);
        assert!(first.is_ok());
        assert_eq!(second_pos, IVec2::ONE);
        assert!(matches!(second, Err(GenError::Shutdown)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(running.is_generated());
        assert!(!queued.is_generated());

    }

    #[test]
    fn hooks_remove_then_place() {

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tiles = TileRegistry::with_defaults();
        tiles.register(30, RecordingBehavior { id: 30, log: Arc::clone(&log) });
        tiles.register(31, RecordingBehavior { id: 31, log: Arc::clone(&log) });

        let generator = GeneratorBuilder::new(1)
            .tiles(tiles)
            .stage_fn("hooks", |cx, provider| {
                provider.set_tile_at(cx.offset(), 30)?;
                provider.set_tile_at(cx.offset(), 31)?;
                Ok(())
            })
            .build(new_store())
            .unwrap();

        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert_eq!(*log.lock(), ["place 30 over 30", "remove 30 over 30", "place 31 over 31"]);

    }

    #[test]
    fn chest_queues_tile_entity() {

        let generator = GeneratorBuilder::new(1)
            .stage_fn("chest", |cx, provider| {
                provider.set_tile_at(cx.offset(), tile::CHEST)?;
                provider.set_tile_at(cx.offset() + IVec2::X, tile::CHEST)?;
                provider.set_tile_at(cx.offset() + IVec2::X, tile::STONE)?;
                Ok(())
            })
            .build(new_store())
            .unwrap();

        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());

        let region = generator.store().get(IVec2::ZERO).unwrap();
        let data = region.data();
        assert_eq!(data.deferred().len(), 1);
        assert!(matches!(&data.deferred()[0], DeferredAction::AddTileEntity { pos, .. } if *pos == IVec2::ZERO));
        assert!(data.slice_at(IVec2::ZERO).unwrap().tile_entity(IVec2::ZERO).is_some());
        assert!(data.slice_at(IVec2::X).unwrap().tile_entity(IVec2::X).is_none());

    }

    #[test]
    fn retry_starts_from_empty_region() {

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);
        let generator = GeneratorBuilder::new(1)
            .stage_fn("flaky", move |cx, provider| {
                if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                    provider.set_tile_at(cx.offset(), tile::CHEST)?;
                    return Err(GenError::Stage("first run fails".into()));
                }
                Ok(())
            })
            .build(new_store())
            .unwrap();

        assert!(matches!(generate_inline(&generator, IVec2::ZERO), Err(GenError::Stage(_))));
        let region = generator.store().get(IVec2::ZERO).unwrap();
        assert!(!region.is_generated());

        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert!(region.is_generated());
        assert_eq!(region.tile_at(IVec2::ZERO), Some(tile::AIR));
        assert!(region.data().deferred().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

    }

    #[test]
    fn failed_run_queues_no_structure() {

        let applied = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ref = Arc::clone(&calls);
        let generator = bar_builder(&applied)
            .stage_fn("flaky", move |cx, _| {
                if cx.region == IVec2::ZERO && calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(GenError::Stage("first run fails".into()));
                }
                Ok(())
            })
            .build(new_store())
            .unwrap();

        assert!(generate_inline(&generator, IVec2::ZERO).is_err());
        let east = generator.store().get(IVec2::X).unwrap();
        assert!(!east.has_pending());

        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert_eq!(east.pending_count(), 1);

        assert!(generate_inline(&generator, IVec2::X).is_ok());
        assert_eq!(*applied.lock(), [IVec2::ZERO, IVec2::ZERO, IVec2::X]);
        assert_eq!(generator.stats().implant_count(), 1);
        assert_eq!(east.tile_at(IVec2::new(64, 10)), Some(tile::GRAVEL));

    }

    #[test]
    fn invalidated_region_queues_no_structure() {

        let applied = Arc::new(Mutex::new(Vec::new()));
        let generator = bar_generator(&applied);

        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert!(generate_inline(&generator, IVec2::X).is_ok());

        let origin = generator.store().get(IVec2::ZERO).unwrap();
        assert!(origin.state().has_placed());
        assert!(origin.invalidate());
        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert!(origin.is_generated());

        let east = generator.store().get(IVec2::X).unwrap();
        assert!(!east.has_pending());
        assert_eq!(*applied.lock(), [IVec2::ZERO, IVec2::X, IVec2::ZERO]);
        assert_eq!(generator.stats().implant_count(), 1);

    }

    #[test]
    fn nested_structure_must_fit() {

        let host_generator = |host: &'static str| {
            GeneratorBuilder::new(1)
                .structure("bar", BarStructure { len: 10, applied: Arc::new(Mutex::new(Vec::new())) })
                .structure("wide", HostStructure { width: 12 })
                .structure("narrow", HostStructure { width: 4 })
                .stage_fn("host", move |cx, provider| {
                    provider.place_structure(host, cx.offset() + IVec2::new(58, 3), StructureVariant::default())
                })
                .build(new_store())
                .unwrap()
        };

        let generator = host_generator("wide");
        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert!(generate_inline(&generator, IVec2::X).is_ok());
        // The nested bar is applied on both sides of the border.
        assert_eq!(generator.store().get(IVec2::ZERO).unwrap().tile_at(IVec2::new(63, 3)), Some(tile::GRAVEL));
        assert_eq!(generator.store().get(IVec2::X).unwrap().tile_at(IVec2::new(67, 3)), Some(tile::GRAVEL));

        let generator = host_generator("narrow");
        let result = generate_inline(&generator, IVec2::ZERO);
        assert!(matches!(result, Err(GenError::NestedOutside { structure, .. }) if structure.as_str() == "bar"));

    }

    #[test]
    fn unknown_structure_fails() {

        let generator = GeneratorBuilder::new(1)
            .stage_fn("place", |cx, provider| provider.place_structure("nope", cx.offset(), StructureVariant::default()))
            .build(new_store())
            .unwrap();

        assert!(matches!(generate_inline(&generator, IVec2::ZERO), Err(GenError::UnknownStructure(name)) if name.as_str() == "nope"));
        assert!(!generator.store().get(IVec2::ZERO).unwrap().is_generated());
        assert_eq!(generator.stats().failure_count(), 1);

    }

    #[test]
    fn panic_is_reported() {

        let generator = GeneratorBuilder::new(1)
            .stage_fn("panic", |_, _| panic!("stage exploded"))
            .build(new_store())
            .unwrap();

        let result = generate_inline(&generator, IVec2::ZERO);
        assert!(matches!(result, Err(GenError::Panicked(message)) if message.contains("stage exploded")));

        let region = generator.store().get(IVec2::ZERO).unwrap();
        assert!(!region.is_generated());
        assert!(!region.state().is_generating());
        assert_eq!(region.state().pins(), 0);

    }

    #[test]
    fn load_progress_bracketing() {

        let counter = Arc::new(LoadCounter::new());
        let generator = GeneratorBuilder::new(1)
            .progress(counter.clone())
            .stage_fn("fail", |cx, _| {
                if cx.region.x < 0 {
                    Err(GenError::Stage("west is unsupported".into()))
                } else {
                    Ok(())
                }
            })
            .build(new_store())
            .unwrap();

        assert!(generate_inline(&generator, IVec2::ZERO).is_ok());
        assert!(generate_inline(&generator, IVec2::NEG_X).is_err());
        generator.shutdown();
        assert!(generate_inline(&generator, IVec2::Y).is_err());

        assert_eq!(counter.started(), 3);
        assert_eq!(counter.ended(), 3);
        assert_eq!(counter.outstanding(), 0);

    }

}
