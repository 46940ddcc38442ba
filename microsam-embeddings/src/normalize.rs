//! Conversion of raw input arrays to 8-bit RGB images
//!
//! The encoder consumes `(H, W, 3)` u8 images. Non-u8 data is min-max
//! scaled to `[0, 255]` first; grayscale is replicated across channels.

use ndarray::{Array3, ArrayViewD, Axis, Ix2, Ix3};

use crate::error::{EmbeddingError, Result};

/// Numeric element types accepted as input data
pub trait Pixel: Copy + Send + Sync + 'static {
    /// Type tag included in the data signature
    const DTYPE: &'static str;

    fn to_f32(self) -> f32;

    /// The value itself when the input is already 8-bit
    fn as_u8(self) -> Option<u8> {
        None
    }

    fn extend_le_bytes(self, out: &mut Vec<u8>);
}

impl Pixel for u8 {
    const DTYPE: &'static str = "uint8";

    fn to_f32(self) -> f32 {
        self as f32
    }

    fn as_u8(self) -> Option<u8> {
        Some(self)
    }

    fn extend_le_bytes(self, out: &mut Vec<u8>) {
        out.push(self);
    }
}

macro_rules! impl_pixel {
    ($($ty:ty => $tag:literal),* $(,)?) => {
        $(
            impl Pixel for $ty {
                const DTYPE: &'static str = $tag;

                fn to_f32(self) -> f32 {
                    self as f32
                }

                fn extend_le_bytes(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_pixel!(
    i8 => "int8",
    u16 => "uint16",
    i16 => "int16",
    u32 => "uint32",
    i32 => "int32",
    u64 => "uint64",
    i64 => "int64",
    f32 => "float32",
    f64 => "float64",
);

/// Convert a 2D grayscale or `(H, W, 3)` array to an 8-bit RGB image
///
/// A constant non-u8 input has no usable range and maps to an all-zero image.
pub fn to_image<T: Pixel>(input: ArrayViewD<'_, T>) -> Result<Array3<u8>> {
    let is_rgb = input.ndim() == 3 && input.shape()[2] == 3;
    if input.ndim() != 2 && !is_rgb {
        return Err(EmbeddingError::invalid_input(format!(
            "Invalid input image of shape {:?}. Expect either 2D grayscale or 3D RGB image.",
            input.shape()
        )));
    }

    let scaled = to_u8(&input);

    if is_rgb {
        return scaled
            .into_dimensionality::<Ix3>()
            .map_err(|e| EmbeddingError::invalid_input(e.to_string()));
    }

    let gray = scaled
        .into_dimensionality::<Ix2>()
        .map_err(|e| EmbeddingError::invalid_input(e.to_string()))?;
    let (h, w) = gray.dim();
    let gray = gray.insert_axis(Axis(2));
    gray.broadcast((h, w, 3))
        .map(|view| view.to_owned())
        .ok_or_else(|| EmbeddingError::invalid_input("Failed to replicate grayscale channel"))
}

fn to_u8<T: Pixel>(input: &ArrayViewD<'_, T>) -> ndarray::ArrayD<u8> {
    if T::DTYPE == u8::DTYPE {
        return input.mapv(|v| v.as_u8().unwrap_or_default());
    }

    let (min, max) = input.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        let v = v.to_f32();
        (lo.min(v), hi.max(v))
    });
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        log::warn!("Input has a degenerate intensity range, using an all-zero image");
        return input.mapv(|_| 0u8);
    }
    input.mapv(|v| (((v.to_f32() - min) / range) * 255.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, ArrayD, IxDyn};

    #[test]
    fn test_grayscale_is_replicated() {
        let input: Array2<u8> = array![[0, 10], [20, 255]];
        let image = to_image(input.view().into_dyn()).unwrap();
        assert_eq!(image.dim(), (2, 2, 3));
        for c in 0..3 {
            assert_eq!(image[[1, 0, c]], 20);
            assert_eq!(image[[1, 1, c]], 255);
        }
    }

    #[test]
    fn test_rgb_passthrough() {
        let input = ArrayD::from_shape_fn(IxDyn(&[4, 5, 3]), |idx| (idx[0] * 15 + idx[1] * 3 + idx[2]) as u8);
        let image = to_image(input.view()).unwrap();
        assert_eq!(image.dim(), (4, 5, 3));
        assert_eq!(image.into_dyn(), input);
    }

    #[test]
    fn test_float_input_is_rescaled() {
        let input: Array2<f32> = array![[-1.0, 0.0], [0.5, 1.0]];
        let image = to_image(input.view().into_dyn()).unwrap();
        assert_eq!(image[[0, 0, 0]], 0);
        assert_eq!(image[[0, 1, 0]], 127);
        assert_eq!(image[[1, 1, 2]], 255);
    }

    #[test]
    fn test_u16_input_is_rescaled() {
        let input: Array2<u16> = array![[1000, 3000]];
        let image = to_image(input.view().into_dyn()).unwrap();
        assert_eq!(image[[0, 0, 1]], 0);
        assert_eq!(image[[0, 1, 1]], 255);
    }

    #[test]
    fn test_constant_input_maps_to_zero() {
        let input = Array2::<f32>::from_elem((3, 3), 7.5);
        let image = to_image(input.view().into_dyn()).unwrap();
        assert!(image.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        let input = ArrayD::<u8>::zeros(IxDyn(&[4, 4, 4]));
        assert!(to_image(input.view()).is_err());
        let input = ArrayD::<u8>::zeros(IxDyn(&[4]));
        assert!(to_image(input.view()).is_err());
    }
}
