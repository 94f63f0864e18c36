//! Chunk files on disk.

use crate::chunk::record;
use crate::dir::sync_directory;
use crate::error::{CoreError, CoreResult};
use crate::range::Range;
use crate::types::Entity;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of every chunk file.
pub const CHUNK_MAGIC: [u8; 4] = *b"CHNK";

/// Current chunk file format version.
pub const CHUNK_VERSION: u16 = 1;

/// Suffix of files that are being written and are not yet chunk files.
pub const TEMP_SUFFIX: &str = ".tmp";

const FILE_HEADER_SIZE: usize = 6;

/// Handle to the chunk file that holds one exact range of a segment.
///
/// The handle does not imply the file exists. Chunk files are replaced
/// atomically: contents go to `<name>.tmp` first and are renamed into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFile {
    dir: PathBuf,
    range: Range,
}

impl ChunkFile {
    /// Creates a handle for the chunk covering `range` inside `dir`.
    #[must_use]
    pub fn new(dir: &Path, range: Range) -> Self {
        Self {
            dir: dir.to_path_buf(),
            range,
        }
    }

    /// Returns the range named by this chunk.
    #[must_use]
    pub const fn range(&self) -> Range {
        self.range
    }

    /// Returns the chunk file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(self.range.to_string())
    }

    /// Returns the path of the temporary file used while writing this chunk.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{}{TEMP_SUFFIX}", self.range))
    }

    /// Returns true if the chunk file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Returns true if a temporary file for this chunk exists.
    #[must_use]
    pub fn temp_exists(&self) -> bool {
        self.temp_path().is_file()
    }

    /// Reads every entity in the chunk.
    ///
    /// A missing file surfaces as a `NotFound` I/O error so callers can tell
    /// "superseded by a rollup" apart from a corrupt file.
    pub fn read(&self) -> CoreResult<Vec<Entity>> {
        let path = self.path();
        let data = fs::read(&path)?;
        decode_chunk(&path, &data)
    }

    /// Reads the chunk, returning `None` if the file does not exist.
    pub fn read_if_exists(&self) -> CoreResult<Option<Vec<Entity>>> {
        match self.read() {
            Ok(entities) => Ok(Some(entities)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replaces the chunk contents atomically (temp file, rename).
    pub fn write(&self, entities: &[Entity], sync: bool) -> CoreResult<()> {
        self.write_temp(entities, sync)?;
        self.promote_temp(sync)
    }

    /// Writes `entities` to the temporary file only.
    pub fn write_temp(&self, entities: &[Entity], sync: bool) -> CoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        let data = encode_chunk(entities);
        let mut file = File::create(self.temp_path())?;
        file.write_all(&data)?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Renames the temporary file over the chunk file.
    pub fn promote_temp(&self, sync: bool) -> CoreResult<()> {
        fs::rename(self.temp_path(), self.path())?;
        if sync {
            sync_directory(&self.dir)?;
        }
        Ok(())
    }

    /// Deletes the chunk file. Returns false if it was already gone.
    pub fn remove(&self, sync: bool) -> CoreResult<bool> {
        let removed = remove_if_exists(&self.path())?;
        if removed && sync {
            sync_directory(&self.dir)?;
        }
        Ok(removed)
    }

    /// Deletes a leftover temporary file. Returns false if there was none.
    pub fn remove_temp(&self) -> CoreResult<bool> {
        remove_if_exists(&self.temp_path())
    }
}

fn remove_if_exists(path: &Path) -> CoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Lists the ranges of every chunk file in `dir`, sorted.
///
/// Temporary files and anything that does not parse as a range name are
/// ignored. A missing directory has no chunks.
pub fn list_chunk_ranges(dir: &Path) -> CoreResult<Vec<Range>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ranges = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Ok(range) = name.parse::<Range>() {
            ranges.push(range);
        }
    }
    ranges.sort();
    Ok(ranges)
}

/// Lists the ranges of leftover temporary files in `dir`.
pub fn list_temp_ranges(dir: &Path) -> CoreResult<Vec<Range>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ranges = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(TEMP_SUFFIX)) else {
            continue;
        };
        if let Ok(range) = stem.parse::<Range>() {
            ranges.push(range);
        }
    }
    ranges.sort();
    Ok(ranges)
}

/// Encodes a full chunk file.
#[must_use]
pub fn encode_chunk(entities: &[Entity]) -> Vec<u8> {
    let body: usize = entities.iter().map(record::encoded_size).sum();
    let mut buf = Vec::with_capacity(FILE_HEADER_SIZE + body);
    buf.extend_from_slice(&CHUNK_MAGIC);
    buf.extend_from_slice(&CHUNK_VERSION.to_le_bytes());
    for entity in entities {
        record::encode_into(entity, &mut buf);
    }
    buf
}

/// Decodes a full chunk file read from `path`.
pub fn decode_chunk(path: &Path, data: &[u8]) -> CoreResult<Vec<Entity>> {
    if data.len() < FILE_HEADER_SIZE || data[..4] != CHUNK_MAGIC {
        return Err(CoreError::chunk_read_failure(path, "missing chunk header"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != CHUNK_VERSION {
        return Err(CoreError::chunk_read_failure(
            path,
            format!("unsupported chunk version {version}"),
        ));
    }

    let mut entities = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    while offset < data.len() {
        let (entity, used) = record::decode(&data[offset..])
            .map_err(|message| CoreError::chunk_read_failure(path, message))?;
        entities.push(entity);
        offset += used;
    }
    Ok(entities)
}
