//! The pre-generator, keeping a square of regions anchored around the spawn and
//! ticking its dimension at a fixed rate.

use std::time::{Duration, Instant};
use std::io;

use glam::IVec2;
use tracing::{debug, info, warn};

use strata::dimension::{ActionSink, Dimension, DimensionConfig, DimensionTick};
use strata::tile_entity::TileEntity;
use strata::entity::EntitySpawn;

use crate::config;


/// Target tick duration. Currently 20 TPS, so 50 ms/tick.
const TICK_DURATION: Duration = Duration::from_millis(50);

/// Number of ticks between two status reports.
const REPORT_INTERVAL: u64 = 100;


/// A sink counting the actions replayed by active regions, there is no simulation to
/// hand them to.
#[derive(Debug, Default)]
pub struct ActionCounter {
    pub entities: usize,
    pub tile_entities: usize,
}

impl ActionSink for ActionCounter {

    fn add_entity(&mut self, spawn: EntitySpawn) {
        debug!("entity {} at {}", spawn.kind, spawn.pos);
        self.entities += 1;
    }

    fn add_tile_entity(&mut self, pos: IVec2, tile_entity: TileEntity) {
        debug!("tile entity {} at {pos}", tile_entity.tag());
        self.tile_entities += 1;
    }

}

/// The pre-generator state.
pub struct Pregen {
    dimension: Dimension,
    /// Anchored regions, released when stopping.
    anchored: Vec<IVec2>,
    actions: ActionCounter,
    /// Sum of tick reports since the last status report.
    totals: DimensionTick,
}

impl Pregen {

    /// Create the dimension from the configuration, prepare the spawn region and its
    /// neighbors inline, then anchor the whole square.
    pub fn new() -> io::Result<Self> {

        let config = DimensionConfig {
            seed: config::seed(),
            workers: config::workers(),
            unload_delay: config::unload_delay(),
            save_dir: config::save_dir().map(|path| path.to_path_buf()),
            ..DimensionConfig::default()
        };

        let mut dimension = Dimension::new(&config)?;

        let start = Instant::now();
        match dimension.prepare_spawn(IVec2::ZERO, 1) {
            Ok(count) => info!("spawn prepared in {:?}, {count} regions", start.elapsed()),
            Err(err) => warn!("failed to prepare spawn: {err}"),
        }

        let radius = config::radius();
        let mut anchored = Vec::new();
        for y in -radius..=radius {
            for x in -radius..=radius {
                let pos = IVec2::new(x, y);
                dimension.anchor(pos);
                anchored.push(pos);
            }
        }

        info!("anchored {} regions, {} requests in flight", anchored.len(), dimension.requested());

        Ok(Self {
            dimension,
            anchored,
            actions: ActionCounter::default(),
            totals: DimensionTick::default(),
        })

    }

    /// Run a single tick. This function also waits for this function to approximately
    /// last for 50 ms (20 TPS), there is no sleep if the tick was too long, in such
    /// case a warning is logged.
    pub fn tick_padded(&mut self) {

        let start = Instant::now();
        self.tick();
        let elapsed = start.elapsed();

        if let Some(missing) = TICK_DURATION.checked_sub(elapsed) {
            std::thread::sleep(missing);
        } else {
            warn!("tick too long {:?}, expected {:?}", elapsed, TICK_DURATION);
        }

    }

    /// Run a single tick of the dimension.
    pub fn tick(&mut self) {

        let report = self.dimension.tick(&mut self.actions);
        self.totals.completed += report.completed;
        self.totals.failed += report.failed;
        self.totals.replayed += report.replayed;
        self.totals.resubmitted += report.resubmitted;
        self.totals.evicted += report.evicted;

        if self.dimension.time() % REPORT_INTERVAL == 0 {

            let stats = self.dimension.generator().stats();
            info!("tick {}: {} regions in memory, {} requests in flight, {} queued",
                self.dimension.time(),
                self.dimension.store().len(),
                self.dimension.requested(),
                self.dimension.generator().queued());
            info!("last {REPORT_INTERVAL} ticks: {:?}", self.totals);
            info!("pipelines: {}, average {:.3} ms, implants: {}, failures: {}, entities: {}, tile entities: {}",
                stats.pipeline_count(),
                stats.average_pipeline_duration() * 1000.0,
                stats.implant_count(),
                stats.failure_count(),
                self.actions.entities,
                self.actions.tile_entities);

            self.totals = DimensionTick::default();

        }

    }

    /// Release anchors, stop generating and save every region, blocking until done.
    pub fn stop(&mut self) {

        for pos in self.anchored.drain(..) {
            self.dimension.unanchor(pos);
        }

        self.dimension.shutdown();

        let failed = self.dimension.save_all();
        if failed.is_empty() {
            info!("saved all regions");
        } else {
            warn!("failed to save {} regions", failed.len());
        }

    }

}
