//! Regular 2D tiling with halos
//!
//! Tiles are numbered in row-major order over the grid. The inner blocks
//! partition the image; the outer blocks add the halo on each side and are
//! clipped to the image bounds, never padded.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// Half-open rectangular region `[begin, end)` over two axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub begin: [usize; 2],
    pub end: [usize; 2],
}

impl Block {
    pub fn shape(&self) -> [usize; 2] {
        [self.end[0] - self.begin[0], self.end[1] - self.begin[1]]
    }

    pub fn rows(&self) -> Range<usize> {
        self.begin[0]..self.end[0]
    }

    pub fn cols(&self) -> Range<usize> {
        self.begin[1]..self.end[1]
    }

    pub fn contains(&self, y: usize, x: usize) -> bool {
        self.rows().contains(&y) && self.cols().contains(&x)
    }
}

/// A tile: its inner block and the halo-expanded outer block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWithHalo {
    pub inner: Block,
    pub outer: Block,
}

impl BlockWithHalo {
    /// Inner block in coordinates relative to the outer block
    pub fn inner_local(&self) -> Block {
        Block {
            begin: [
                self.inner.begin[0] - self.outer.begin[0],
                self.inner.begin[1] - self.outer.begin[1],
            ],
            end: [
                self.inner.end[0] - self.outer.begin[0],
                self.inner.end[1] - self.outer.begin[1],
            ],
        }
    }
}

/// Regular grid of blocks covering a 2D shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocking {
    shape: [usize; 2],
    block_shape: [usize; 2],
    blocks_per_axis: [usize; 2],
}

impl Blocking {
    pub fn new(shape: [usize; 2], block_shape: [usize; 2]) -> Result<Self> {
        if block_shape.iter().any(|&b| b == 0) {
            return Err(EmbeddingError::invalid_input(format!(
                "Tile shape must be positive, got {:?}",
                block_shape
            )));
        }
        let blocks_per_axis = [
            shape[0].div_ceil(block_shape[0]),
            shape[1].div_ceil(block_shape[1]),
        ];
        Ok(Self {
            shape,
            block_shape,
            blocks_per_axis,
        })
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn block_shape(&self) -> [usize; 2] {
        self.block_shape
    }

    pub fn blocks_per_axis(&self) -> [usize; 2] {
        self.blocks_per_axis
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks_per_axis[0] * self.blocks_per_axis[1]
    }

    /// Inner block for `block_id`, `None` when out of range
    pub fn block(&self, block_id: usize) -> Option<Block> {
        if block_id >= self.n_blocks() {
            return None;
        }
        let grid = [
            block_id / self.blocks_per_axis[1],
            block_id % self.blocks_per_axis[1],
        ];
        let mut begin = [0; 2];
        let mut end = [0; 2];
        for axis in 0..2 {
            begin[axis] = grid[axis] * self.block_shape[axis];
            end[axis] = (begin[axis] + self.block_shape[axis]).min(self.shape[axis]);
        }
        Some(Block { begin, end })
    }

    /// Block plus halo on each side, clipped to the shape
    pub fn block_with_halo(&self, block_id: usize, halo: [usize; 2]) -> Option<BlockWithHalo> {
        let inner = self.block(block_id)?;
        let mut outer = inner;
        for axis in 0..2 {
            outer.begin[axis] = inner.begin[axis].saturating_sub(halo[axis]);
            outer.end[axis] = (inner.end[axis] + halo[axis]).min(self.shape[axis]);
        }
        Some(BlockWithHalo { inner, outer })
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        (0..self.n_blocks()).filter_map(|id| self.block(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count_and_order() {
        let blocking = Blocking::new([100, 70], [32, 32]).unwrap();
        assert_eq!(blocking.blocks_per_axis(), [4, 3]);
        assert_eq!(blocking.n_blocks(), 12);

        // Row-major: second block is to the right of the first
        let b1 = blocking.block(1).unwrap();
        assert_eq!(b1.begin, [0, 32]);
        assert_eq!(b1.end, [32, 64]);

        // Last block is clipped in both axes
        let last = blocking.block(11).unwrap();
        assert_eq!(last.begin, [96, 64]);
        assert_eq!(last.end, [100, 70]);
        assert_eq!(last.shape(), [4, 6]);

        assert!(blocking.block(12).is_none());
    }

    #[test]
    fn test_inner_blocks_cover_image_exactly() {
        let shape = [57, 43];
        let blocking = Blocking::new(shape, [16, 10]).unwrap();
        let mut coverage = vec![0u8; shape[0] * shape[1]];
        for block in blocking.blocks() {
            for y in block.rows() {
                for x in block.cols() {
                    coverage[y * shape[1] + x] += 1;
                }
            }
        }
        assert!(coverage.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_halo_is_clipped_to_bounds() {
        let shape = [50, 50];
        let blocking = Blocking::new(shape, [20, 20]).unwrap();
        for id in 0..blocking.n_blocks() {
            let tile = blocking.block_with_halo(id, [8, 8]).unwrap();
            assert!(tile.outer.end[0] <= shape[0]);
            assert!(tile.outer.end[1] <= shape[1]);
            assert!(tile.outer.begin[0] <= tile.inner.begin[0]);
            assert!(tile.outer.end[1] >= tile.inner.end[1]);
        }

        let first = blocking.block_with_halo(0, [8, 8]).unwrap();
        assert_eq!(first.outer.begin, [0, 0]);
        assert_eq!(first.outer.end, [28, 28]);

        let middle = blocking.block_with_halo(4, [8, 8]).unwrap();
        assert_eq!(middle.outer.begin, [12, 12]);
        assert_eq!(middle.outer.end, [48, 48]);
        assert_eq!(middle.inner_local().begin, [8, 8]);
        assert_eq!(middle.inner_local().shape(), [20, 20]);
    }

    #[test]
    fn test_zero_tile_shape_rejected() {
        assert!(Blocking::new([10, 10], [0, 4]).is_err());
    }

    #[test]
    fn test_single_block_when_tile_exceeds_shape() {
        let blocking = Blocking::new([10, 12], [64, 64]).unwrap();
        assert_eq!(blocking.n_blocks(), 1);
        let tile = blocking.block_with_halo(0, [16, 16]).unwrap();
        assert_eq!(tile.inner, tile.outer);
        assert!(tile.inner.contains(9, 11));
    }
}
