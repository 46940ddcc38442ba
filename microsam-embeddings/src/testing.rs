//! Deterministic encoder for unit tests

use std::cell::Cell;

use ndarray::{Array4, ArrayView4, Axis};

use crate::encoder::{ImageEncoder, ModelIdentity, SamPredictor};
use crate::error::Result;

const SIZE: usize = 16;
const CHANNELS: usize = 4;
const GRID: usize = 4;

/// Encoder producing `(B, 4, 4, 4)` patch means of a 16x16 input
///
/// Each output only depends on its own image, so batched and unbatched calls
/// agree exactly.
#[derive(Debug, Default)]
pub(crate) struct StubEncoder {
    calls: Cell<usize>,
    images: Cell<usize>,
}

impl StubEncoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn predictor() -> SamPredictor<StubEncoder> {
        let identity = ModelIdentity::new("vit_b_lm", Some("xxh128:stub".to_string()))
            .expect("valid test identity");
        SamPredictor::new(Self::new(), identity)
    }

    /// Number of `encode` calls so far
    pub(crate) fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Number of images encoded so far
    pub(crate) fn images(&self) -> usize {
        self.images.get()
    }
}

impl ImageEncoder for StubEncoder {
    fn image_size(&self) -> usize {
        SIZE
    }

    fn encode(&self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let n = batch.len_of(Axis(0));
        self.calls.set(self.calls.get() + 1);
        self.images.set(self.images.get() + n);

        let patch = SIZE / GRID;
        let mut out = Array4::<f32>::zeros((n, CHANNELS, GRID, GRID));
        for b in 0..n {
            for c in 0..CHANNELS {
                let source = batch.index_axis(Axis(0), b);
                let source = source.index_axis(Axis(0), c % 3);
                for gy in 0..GRID {
                    for gx in 0..GRID {
                        let mut sum = 0.0;
                        for y in gy * patch..(gy + 1) * patch {
                            for x in gx * patch..(gx + 1) * patch {
                                sum += source[[y, x]];
                            }
                        }
                        out[[b, c, gy, gx]] = 10.0 + c as f32 + sum / (patch * patch) as f32;
                    }
                }
            }
        }
        Ok(out)
    }
}
