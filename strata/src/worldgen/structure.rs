//! Structures are named multi-tile placements that may straddle region boundaries.

use arcstr::ArcStr;
use glam::IVec2;
use indexmap::IndexMap;

use crate::region::StructureVariant;
use crate::util::TileRect;

use super::{GenProvider, GenError};


/// A deterministic placement of tiles around an origin.
///
/// A structure is applied separately by every region its footprint intersects, each
/// one only writing its own tiles. For the result to be seamless, placement must only
/// depend on the origin and the variant: random choices are drawn from the variant
/// seed and the only reads allowed are the predicates of
/// [`GenProvider::replace_tile_at`].
pub trait Structure: Send + Sync {

    /// The rectangle containing every tile this structure may write.
    fn footprint(&self, origin: IVec2, variant: StructureVariant) -> TileRect;

    /// Write the structure through the given provider. Other structures placed from
    /// here are only applied inside this region, so their footprint must be contained
    /// in this structure's footprint.
    fn place(&self, origin: IVec2, variant: StructureVariant, provider: &mut GenProvider) -> Result<(), GenError>;

}

/// Registry of structures by name, in registration order.
#[derive(Default)]
pub struct StructureRegistry {
    structures: IndexMap<ArcStr, Box<dyn Structure>>,
}

impl StructureRegistry {

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a structure, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<ArcStr>, structure: impl Structure + 'static) {
        self.structures.insert(name.into(), Box::new(structure));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Structure> {
        self.structures.get(name).map(|s| &**s)
    }

    /// Get a structure along with its registered name.
    pub fn get_full(&self, name: &str) -> Option<(&ArcStr, &dyn Structure)> {
        self.structures.get_key_value(name).map(|(k, s)| (k, &**s))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.structures.keys().map(|name| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

}
