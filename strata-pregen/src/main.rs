//! Pre-generates the spawn area of a strata world and keeps it anchored until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod pregen;


pub fn main() {

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = Arc::clone(&running);
    if let Err(err) = ctrlc::set_handler(move || handler_running.store(false, Ordering::Relaxed)) {
        error!("failed to set stop handler: {err}");
        return;
    }

    info!("starting with seed {}", config::seed());

    let mut pregen = match pregen::Pregen::new() {
        Ok(pregen) => pregen,
        Err(err) => {
            error!("failed to start: {err}");
            return;
        }
    };

    while running.load(Ordering::Relaxed) {
        pregen.tick_padded();
    }

    info!("stopping...");
    pregen.stop();

}
