//! The configuration of the pre-generator, given from environment variables and lazy
//! initialized when needed.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::env;

use once_cell::sync::OnceCell;
use tracing::warn;

use strata::store::DEFAULT_UNLOAD_DELAY;


/// Parse the given environment variable, falling back to the default value when it is
/// absent or invalid.
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    parse_value(name, env::var(name).ok().as_deref(), default)
}

fn parse_value<T: FromStr>(name: &str, value: Option<&str>, default: T) -> T {
    match value {
        Some(value) => match value.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("invalid value for {name}: {value:?}, using default");
                default
            }
        },
        None => default,
    }
}

/// The world seed.
///
/// To change it, set `STRATA_SEED=<integer>`.
pub fn seed() -> i64 {
    static ENV: OnceCell<i64> = OnceCell::new();
    *ENV.get_or_init(|| parse_var("STRATA_SEED", 0))
}

/// Number of generation workers, defaults to the available parallelism.
///
/// To change it, set `STRATA_WORKERS=<count>`.
pub fn workers() -> usize {
    static ENV: OnceCell<usize> = OnceCell::new();
    *ENV.get_or_init(|| {
        let default = std::thread::available_parallelism().map_or(2, |n| n.get());
        parse_var("STRATA_WORKERS", default).max(1)
    })
}

/// Radius, in regions, of the square kept anchored around the spawn region.
///
/// To change it, set `STRATA_RADIUS=<regions>`.
pub fn radius() -> i32 {
    static ENV: OnceCell<i32> = OnceCell::new();
    *ENV.get_or_init(|| parse_var("STRATA_RADIUS", 2).max(0))
}

/// Number of idle ticks before a region is saved and unloaded.
///
/// To change it, set `STRATA_UNLOAD_DELAY=<ticks>`.
pub fn unload_delay() -> u32 {
    static ENV: OnceCell<u32> = OnceCell::new();
    *ENV.get_or_init(|| parse_var("STRATA_UNLOAD_DELAY", DEFAULT_UNLOAD_DELAY))
}

/// Directory where region files are saved, regions are only kept in memory if unset.
///
/// To enable saving, set `STRATA_SAVE_DIR=<path>`.
pub fn save_dir() -> Option<&'static Path> {
    static ENV: OnceCell<Option<PathBuf>> = OnceCell::new();
    ENV.get_or_init(|| env::var_os("STRATA_SAVE_DIR").filter(|s| !s.is_empty()).map(PathBuf::from))
        .as_deref()
}
