//! Asynchronous and deterministic generation of an infinite 2D tile world, cached in
//! regions of 64x64 tiles.

pub mod util;
pub mod io;

pub mod tile;
pub mod tile_entity;
pub mod entity;

pub mod slice;
pub mod region;
pub mod store;
pub mod persist;

pub mod light;
pub mod pool;
pub mod progress;
pub mod worldgen;

pub mod dimension;
