//! Region persistence. A region is saved as a single zlib-compressed file holding its
//! slices, its tile entities, its deferred actions and the pending structure records
//! that still target it.

use std::io::{self, Read, Write};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::fs::{self, File};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use glam::IVec2;
use parking_lot::Mutex;
use thiserror::Error;

use crate::tile_entity::{TileEntity, ChestTileEntity, SignTileEntity, SpawnerTileEntity};
use crate::region::{Region, RegionData, DeferredAction, PendingStructure, StructureVariant, REGION_SLICE_COUNT};
use crate::io::{ReadStrataExt, WriteStrataExt};
use crate::entity::EntitySpawn;
use crate::slice::Slice;


/// Magic number at the start of every region file.
const MAGIC: [u8; 4] = *b"STRG";
/// Current version of the region file format.
const VERSION: u8 = 1;


/// A collaborator able to load and save regions. Implementations must be shareable
/// between the workers and the simulation thread.
pub trait RegionPersistence: Send + Sync {

    /// Load the snapshot of the region at the given coordinates, none if the region
    /// has never been saved.
    fn load(&self, pos: IVec2) -> Result<Option<RegionSnapshot>, PersistError>;

    /// Save the snapshot, replacing any previous save of the same region.
    fn save(&self, snapshot: &RegionSnapshot) -> Result<(), PersistError>;

}

/// An owned copy of everything persisted for a region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSnapshot {
    pub pos: IVec2,
    pub generated: bool,
    pub slices: Option<Box<[Slice]>>,
    pub deferred: Vec<DeferredAction>,
    pub pending: Vec<PendingStructure>,
}

impl RegionSnapshot {

    /// Create an empty snapshot for the given region coordinates.
    pub fn new(pos: IVec2) -> Self {
        Self {
            pos,
            generated: false,
            slices: None,
            deferred: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Copy the current content of the region. This locks the region's data and then
    /// its pending queue, so it blocks while the region is being generated.
    pub fn capture(region: &Region) -> Self {
        let data = region.data();
        let pending = region.lock_pending();
        Self {
            pos: region.pos(),
            generated: region.is_generated(),
            slices: data.slices().map(Box::from),
            deferred: data.deferred().to_vec(),
            pending: pending.clone(),
        }
    }

    /// Return true if there is nothing worth saving in this snapshot.
    pub fn is_empty(&self) -> bool {
        !self.generated && self.slices.is_none() && self.deferred.is_empty() && self.pending.is_empty()
    }

    /// Merge this snapshot into the region that is being loaded, the given data must
    /// be the region's own locked data. Stored records are older than the in-memory
    /// ones, so they are put first.
    pub(crate) fn merge_into(self, region: &Region, data: &mut RegionData) {

        if let Some(slices) = self.slices {
            data.set_slices(slices);
        }

        let mut deferred = self.deferred;
        deferred.append(&mut data.take_deferred());
        for action in deferred {
            data.push_deferred(action);
        }

        if !self.pending.is_empty() {
            let mut pending = region.lock_pending();
            let newer = std::mem::replace(&mut *pending, self.pending);
            pending.extend(newer);
        }

        if self.generated {
            // A stored generated region already queued its structures to neighbors.
            region.state().set_generated(true);
            region.state().set_placed();
        }

    }

    /// Encode this snapshot, the output is not compressed.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), PersistError> {

        writer.write_ivec2(self.pos)?;
        writer.write_bool(self.generated)?;

        match &self.slices {
            Some(slices) => {
                writer.write_bool(true)?;
                for slice in slices.iter() {
                    slice.write_data_to(&mut writer)?;
                    writer.write_u16::<LE>(slice.tile_entity_count() as u16)?;
                    for (pos, tile_entity) in slice.tile_entities() {
                        writer.write_ivec2(pos)?;
                        write_tile_entity(&mut writer, tile_entity)?;
                    }
                }
            }
            None => writer.write_bool(false)?,
        }

        writer.write_u32::<LE>(self.deferred.len() as u32)?;
        for action in &self.deferred {
            match action {
                DeferredAction::AddEntity(spawn) => {
                    writer.write_u8(0)?;
                    writer.write_string8(&spawn.kind)?;
                    writer.write_dvec2(spawn.pos)?;
                }
                DeferredAction::AddTileEntity { pos, tile_entity } => {
                    writer.write_u8(1)?;
                    writer.write_ivec2(*pos)?;
                    write_tile_entity(&mut writer, tile_entity)?;
                }
            }
        }

        writer.write_u32::<LE>(self.pending.len() as u32)?;
        for record in &self.pending {
            writer.write_ivec2(record.origin_region)?;
            writer.write_ivec2(record.offset)?;
            writer.write_string8(&record.structure)?;
            writer.write_bool(record.variant.mirrored)?;
            writer.write_i64::<LE>(record.variant.seed)?;
        }

        Ok(())

    }

    /// Decode a snapshot previously encoded with [`Self::write_to`].
    pub fn read_from(mut reader: impl Read) -> Result<Self, PersistError> {

        let mut snapshot = Self::new(reader.read_ivec2()?);
        snapshot.generated = reader.read_bool()?;

        if reader.read_bool()? {
            let mut slices = Vec::with_capacity(REGION_SLICE_COUNT);
            for _ in 0..REGION_SLICE_COUNT {
                let mut slice = Slice::new();
                slice.read_data_from(&mut reader)?;
                let count = reader.read_u16::<LE>()?;
                for _ in 0..count {
                    let pos = reader.read_ivec2()?;
                    slice.set_tile_entity(pos, read_tile_entity(&mut reader)?);
                }
                slices.push(slice);
            }
            snapshot.slices = Some(slices.into_boxed_slice());
        }

        let count = reader.read_u32::<LE>()?;
        for _ in 0..count {
            let action = match reader.read_u8()? {
                0 => {
                    let kind = reader.read_string8()?;
                    DeferredAction::AddEntity(EntitySpawn::new(kind, reader.read_dvec2()?))
                }
                1 => DeferredAction::AddTileEntity {
                    pos: reader.read_ivec2()?,
                    tile_entity: read_tile_entity(&mut reader)?,
                },
                tag => return Err(PersistError::UnknownActionTag(tag)),
            };
            snapshot.deferred.push(action);
        }

        let count = reader.read_u32::<LE>()?;
        for _ in 0..count {
            snapshot.pending.push(PendingStructure {
                origin_region: reader.read_ivec2()?,
                offset: reader.read_ivec2()?,
                structure: reader.read_string8()?.into(),
                variant: StructureVariant {
                    mirrored: reader.read_bool()?,
                    seed: reader.read_i64::<LE>()?,
                },
            });
        }

        Ok(snapshot)

    }

    /// Encode this snapshot with the file header and compression.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        let mut buf = Vec::new();
        buf.write_all(&MAGIC)?;
        buf.write_u8(VERSION)?;
        let mut encoder = ZlibEncoder::new(buf, Compression::default());
        self.write_to(&mut encoder)?;
        Ok(encoder.finish()?)
    }

    /// Decode a snapshot encoded with [`Self::to_bytes`].
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, PersistError> {

        let mut magic = [0; 4];
        bytes.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(PersistError::InvalidMagic);
        }

        let version = bytes.read_u8()?;
        if version != VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }

        Self::read_from(ZlibDecoder::new(bytes))

    }

}


fn write_tile_entity(mut writer: impl Write, tile_entity: &TileEntity) -> io::Result<()> {
    writer.write_u8(tile_entity.tag())?;
    match tile_entity {
        TileEntity::Chest(chest) => {
            writer.write_string8(&chest.loot_table)?;
            writer.write_i64::<LE>(chest.loot_seed)
        }
        TileEntity::Sign(sign) => {
            writer.write_string8(&sign.text)
        }
        TileEntity::Spawner(spawner) => {
            writer.write_string8(&spawner.entity)?;
            writer.write_u16::<LE>(spawner.delay)
        }
    }
}

fn read_tile_entity(mut reader: impl Read) -> Result<TileEntity, PersistError> {
    Ok(match reader.read_u8()? {
        0 => TileEntity::Chest(ChestTileEntity {
            loot_table: reader.read_string8()?.into(),
            loot_seed: reader.read_i64::<LE>()?,
        }),
        1 => TileEntity::Sign(SignTileEntity {
            text: reader.read_string8()?.into(),
        }),
        2 => TileEntity::Spawner(SpawnerTileEntity {
            entity: reader.read_string8()?.into(),
            delay: reader.read_u16::<LE>()?,
        }),
        tag => return Err(PersistError::UnknownTileEntityTag(tag)),
    })
}


/// A directory of region files, one file per region named after its coordinates.
pub struct RegionDir {
    path: PathBuf,
}

impl RegionDir {

    /// Create a region directory handle, the directory is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the file storing the given region.
    pub fn region_path(&self, pos: IVec2) -> PathBuf {
        self.path.join(format!("r.{}.{}.rgn", pos.x, pos.y))
    }

}

impl RegionPersistence for RegionDir {

    fn load(&self, pos: IVec2) -> Result<Option<RegionSnapshot>, PersistError> {

        let mut file = match File::open(self.region_path(pos)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let snapshot = RegionSnapshot::from_bytes(&bytes)?;
        if snapshot.pos != pos {
            return Err(PersistError::PositionMismatch { expected: pos, found: snapshot.pos });
        }

        Ok(Some(snapshot))

    }

    fn save(&self, snapshot: &RegionSnapshot) -> Result<(), PersistError> {

        let bytes = snapshot.to_bytes()?;
        fs::create_dir_all(&self.path)?;

        // Write to a temporary file first, so a crash never leaves a truncated file.
        let path = self.region_path(snapshot.pos);
        let tmp_path = path.with_extension("rgn.tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &path)?;

        Ok(())

    }

}


/// Persistence keeping encoded regions in memory, used when no save directory is
/// configured.
#[derive(Default)]
pub struct MemoryPersistence {
    regions: Mutex<HashMap<IVec2, Vec<u8>>>,
}

impl MemoryPersistence {

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions stored.
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

impl RegionPersistence for MemoryPersistence {

    fn load(&self, pos: IVec2) -> Result<Option<RegionSnapshot>, PersistError> {
        match self.regions.lock().get(&pos) {
            Some(bytes) => RegionSnapshot::from_bytes(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &RegionSnapshot) -> Result<(), PersistError> {
        let bytes = snapshot.to_bytes()?;
        self.regions.lock().insert(snapshot.pos, bytes);
        Ok(())
    }

}


/// Error type used for every persistence operation.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid region file magic")]
    InvalidMagic,
    #[error("unsupported region file version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown tile entity tag: {0}")]
    UnknownTileEntityTag(u8),
    #[error("unknown deferred action tag: {0}")]
    UnknownActionTag(u8),
    #[error("region file for {expected} contains region {found}")]
    PositionMismatch { expected: IVec2, found: IVec2 },
}
