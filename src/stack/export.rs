//! Export of a stack back into tiles, and on-disk persistence of the exported set.
//!
//! An [`ExportedTileSet`] is itself a [`TileSource`], so exporting and rebuilding
//! a stack reproduces its buffer, labels and coordinates. The provenance log
//! travels in the global extras under [`STACK_EXTRAS_KEY`].

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::axes::TileKey;
use super::image_stack::ImageStack;
use super::selector::Selector;
use crate::error::{StackError, StackResult};
use crate::source::{Tile, TileCoordinates, TilePixels, TileSource, STACK_EXTRAS_KEY};

/// Extension given to raw tile files.
pub const TILE_EXTENSION: &str = "f32";

const MANIFEST_VERSION: u32 = 1;

/// Names a persisted tile from the base path, its key and the file extension.
pub type TileNamer = dyn Fn(&Path, TileKey, &str) -> PathBuf;

/// `{base}-H{round}-C{ch}-Z{zplane}.{ext}`
pub fn default_tile_name(base: &Path, key: TileKey, extension: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(
        "-H{}-C{}-Z{}.{}",
        key.round, key.ch, key.zplane, extension
    ));
    PathBuf::from(name)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExportedTile {
    pub key: TileKey,
    pub pixels: Array2<f32>,
    pub coordinates: TileCoordinates,
    pub extras: Map<String, Value>,
}

/// Tiles of a stack in canonical order with coordinates, extras and provenance.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportedTileSet {
    tiles: Vec<ExportedTile>,
    tile_shape: (usize, usize),
    extras: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: u32,
    tile_shape: (usize, usize),
    extras: Map<String, Value>,
    tiles: Vec<ManifestTile>,
}

#[derive(Serialize, Deserialize)]
struct ManifestTile {
    key: TileKey,
    file: PathBuf,
    coordinates: TileCoordinates,
    #[serde(default)]
    extras: Map<String, Value>,
}

impl ImageStack {
    /// Splits the stack back into tiles and embeds the provenance log in the extras.
    pub fn export(&self) -> StackResult<ExportedTileSet> {
        let mut tiles = Vec::with_capacity(self.coordinates.len());
        for key in self.index.keys() {
            let (view, _) = self.slice_view(&Selector::for_tile(key))?;
            let pixels = view
                .to_owned()
                .into_dimensionality()
                .map_err(|err| StackError::shape(err.to_string()))?;
            let coordinates = self
                .coordinates
                .get(&key)
                .map(|entry| entry.to_tile_coordinates())
                .ok_or_else(|| StackError::lookup(format!("no coordinates for tile {key}")))?;
            tiles.push(ExportedTile {
                key,
                pixels,
                coordinates,
                extras: self.tile_extras.get(&key).cloned().unwrap_or_default(),
            });
        }

        let mut extras = self.extras.clone();
        extras.insert(STACK_EXTRAS_KEY.to_string(), Value::String(self.log.to_json()?));

        Ok(ExportedTileSet {
            tiles,
            tile_shape: self.tile_shape(),
            extras,
        })
    }
}

impl ExportedTileSet {
    pub fn tiles(&self) -> &[ExportedTile] {
        &self.tiles
    }

    pub fn tile_shape(&self) -> (usize, usize) {
        self.tile_shape
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Writes a JSON manifest at `path` and one raw little-endian float32 file per tile.
    ///
    /// Tile files are named by `naming` (default [`default_tile_name`]) from `path`
    /// with its extension removed.
    pub fn write_to_path<P: AsRef<Path>>(&self, path: P, naming: Option<&TileNamer>) -> StackResult<()> {
        let path = path.as_ref();
        let directory = path.parent().unwrap_or_else(|| Path::new(""));
        if !directory.as_os_str().is_empty() {
            fs::create_dir_all(directory)?;
        }
        let base = path.with_extension("");

        let mut entries = Vec::with_capacity(self.tiles.len());
        for tile in &self.tiles {
            let file = match naming {
                Some(namer) => namer(&base, tile.key, TILE_EXTENSION),
                None => default_tile_name(&base, tile.key, TILE_EXTENSION),
            };
            let mut bytes = Vec::with_capacity(tile.pixels.len() * 4);
            for value in tile.pixels.iter() {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            fs::write(&file, bytes)?;

            entries.push(ManifestTile {
                key: tile.key,
                file: file.strip_prefix(directory).unwrap_or(&file).to_path_buf(),
                coordinates: tile.coordinates,
                extras: tile.extras.clone(),
            });
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            tile_shape: self.tile_shape,
            extras: self.extras.clone(),
            tiles: entries,
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &manifest)?;
        Ok(())
    }

    /// Loads a set written by [`ExportedTileSet::write_to_path`].
    pub fn read_from_path<P: AsRef<Path>>(path: P) -> StackResult<Self> {
        let path = path.as_ref();
        let directory = path.parent().unwrap_or_else(|| Path::new(""));
        let manifest: Manifest = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(StackError::invalid_data(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }

        let (height, width) = manifest.tile_shape;
        let expected_bytes = height
            .checked_mul(width)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| {
                StackError::invalid_data(format!("tile shape ({height}, {width}) is too large"))
            })?;
        let mut tiles = Vec::with_capacity(manifest.tiles.len());
        for entry in manifest.tiles {
            let bytes = fs::read(directory.join(&entry.file))?;
            if bytes.len() != expected_bytes {
                return Err(StackError::invalid_data(format!(
                    "tile file {} holds {} bytes, expected {expected_bytes}",
                    entry.file.display(),
                    bytes.len()
                )));
            }
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            let pixels = Array2::from_shape_vec((height, width), values)
                .map_err(|err| StackError::shape(err.to_string()))?;
            tiles.push(ExportedTile {
                key: entry.key,
                pixels,
                coordinates: entry.coordinates,
                extras: entry.extras,
            });
        }
        tiles.sort_by_key(|tile| tile.key);

        Ok(Self {
            tiles,
            tile_shape: manifest.tile_shape,
            extras: manifest.extras,
        })
    }
}

impl TileSource for ExportedTileSet {
    fn keys(&self) -> Vec<TileKey> {
        self.tiles.iter().map(|tile| tile.key).collect()
    }

    fn get_tile(&self, key: TileKey) -> StackResult<Tile> {
        let position = self
            .tiles
            .binary_search_by_key(&key, |tile| tile.key)
            .map_err(|_| StackError::lookup(format!("exported set has no tile {key}")))?;
        let tile = &self.tiles[position];
        Ok(Tile::new(TilePixels::F32(tile.pixels.clone()), tile.coordinates)
            .with_extras(tile.extras.clone()))
    }

    fn extras(&self) -> Map<String, Value> {
        self.extras.clone()
    }
}
