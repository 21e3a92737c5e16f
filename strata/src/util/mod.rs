//! Various math utilities.

mod rand;
mod noise;
mod bb;

pub use rand::{SeededRandom, region_seed};
pub use noise::{PerlinNoise, OctaveNoise};
pub use bb::TileRect;
