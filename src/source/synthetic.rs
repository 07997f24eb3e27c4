use ndarray::Array2;

use super::{Tile, TileCoordinates, TilePixels, TileSource, DEFAULT_EXTENT};
use crate::error::{StackError, StackResult};
use crate::stack::TileKey;

/// Source producing all-ones tiles labelled `0..n` on every categorical axis.
#[derive(Clone, Copy, Debug)]
pub struct SyntheticTileSource {
    pub num_round: usize,
    pub num_ch: usize,
    pub num_z: usize,
    pub tile_height: usize,
    pub tile_width: usize,
}

impl Default for SyntheticTileSource {
    fn default() -> Self {
        Self {
            num_round: 4,
            num_ch: 4,
            num_z: 12,
            tile_height: 50,
            tile_width: 40,
        }
    }
}

impl TileSource for SyntheticTileSource {
    fn keys(&self) -> Vec<TileKey> {
        let mut keys = Vec::with_capacity(self.num_round * self.num_ch * self.num_z);
        for round in 0..self.num_round {
            for ch in 0..self.num_ch {
                for zplane in 0..self.num_z {
                    keys.push(TileKey::new(round, ch, zplane));
                }
            }
        }
        keys
    }

    fn get_tile(&self, key: TileKey) -> StackResult<Tile> {
        if key.round >= self.num_round || key.ch >= self.num_ch || key.zplane >= self.num_z {
            return Err(StackError::lookup(format!("synthetic source has no tile {key}")));
        }
        let pixels = Array2::<f32>::ones((self.tile_height, self.tile_width));
        Ok(Tile::new(
            TilePixels::F32(pixels),
            TileCoordinates {
                x: DEFAULT_EXTENT,
                y: DEFAULT_EXTENT,
                z: Some(DEFAULT_EXTENT),
            },
        ))
    }
}
