//! Encoder boundary
//!
//! The image encoder is an external capability. [`ImageEncoder`] exposes what
//! the cache manager needs from it (input size, device, preprocessing and a
//! batched forward pass); [`SamPredictor`] wraps an encoder together with the
//! resize transform, the model identity and the working feature state that
//! downstream prompt-based segmentation reads.

use ndarray::{stack, Array3, Array4, ArrayD, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};
use crate::transform::ResizeLongestSide;

/// Input side length of the SAM image encoders
pub const IMAGE_SIZE: usize = 1024;

/// Encoder architectures; fine-tuned model names start with one of these
pub const MODEL_TYPES: [&str; 4] = ["vit_l", "vit_b", "vit_h", "vit_t"];

const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Batched image encoder
pub trait ImageEncoder {
    /// Side length of the square encoder input
    fn image_size(&self) -> usize {
        IMAGE_SIZE
    }

    fn device(&self) -> &str {
        "cpu"
    }

    /// Normalize a `(3, h, w)` image and pad it to `(3, S, S)`
    fn preprocess(&self, image: Array3<f32>) -> Result<Array3<f32>> {
        let size = self.image_size();
        let (channels, height, width) = image.dim();
        if channels != 3 || height > size || width > size {
            return Err(EmbeddingError::invalid_input(format!(
                "Cannot preprocess image of shape {:?} for input size {}",
                image.shape(),
                size
            )));
        }

        let mut padded = Array3::<f32>::zeros((3, size, size));
        for (c, channel) in image.axis_iter(Axis(0)).enumerate() {
            let mut target = padded.index_axis_mut(Axis(0), c);
            for ((y, x), value) in channel.indexed_iter() {
                target[[y, x]] = (value - PIXEL_MEAN[c]) / PIXEL_STD[c];
            }
        }
        Ok(padded)
    }

    /// Forward pass over a `(B, 3, S, S)` batch, returning `(B, C, H', W')`
    fn encode(&self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

/// Identity of the model that produced a set of embeddings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    /// Encoder architecture, e.g. `vit_b`
    pub model_type: String,
    /// Full model name, e.g. `vit_b_lm`
    pub model_name: String,
    /// Checkpoint hash in `xxh128:<hex>` form, if known
    pub model_hash: Option<String>,
}

impl ModelIdentity {
    /// Identity for a model name; the architecture is its five character prefix
    pub fn new(model_name: impl Into<String>, model_hash: Option<String>) -> Result<Self> {
        let model_name = model_name.into();
        let model_type = model_name.get(..5).unwrap_or(&model_name).to_string();
        Self::with_type(model_type, model_name, model_hash)
    }

    /// Identity with an explicit architecture, e.g. for a local checkpoint
    pub fn with_type(
        model_type: impl Into<String>,
        model_name: impl Into<String>,
        model_hash: Option<String>,
    ) -> Result<Self> {
        let model_type = model_type.into();
        if !MODEL_TYPES.contains(&model_type.as_str()) {
            return Err(EmbeddingError::model(format!(
                "Invalid model_type: {}. Expect one of {:?}",
                model_type, MODEL_TYPES
            )));
        }
        Ok(Self {
            model_type,
            model_name: model_name.into(),
            model_hash,
        })
    }
}

/// Output of one batched forward pass
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// `(B, C, H', W')`
    pub features: Array4<f32>,
    /// `(h, w)` of each image before the resize transform
    pub original_sizes: Vec<(usize, usize)>,
    /// `(h', w')` of each image after the resize transform
    pub input_sizes: Vec<(usize, usize)>,
}

/// Encoder plus the feature state of the current image
pub struct SamPredictor<E> {
    encoder: E,
    transform: ResizeLongestSide,
    identity: ModelIdentity,
    features: Option<ArrayD<f32>>,
    original_size: Option<(usize, usize)>,
    input_size: Option<(usize, usize)>,
    is_image_set: bool,
}

impl<E: ImageEncoder> SamPredictor<E> {
    pub fn new(encoder: E, identity: ModelIdentity) -> Self {
        let transform = ResizeLongestSide::new(encoder.image_size());
        Self {
            encoder,
            transform,
            identity,
            features: None,
            original_size: None,
            input_size: None,
            is_image_set: false,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    pub fn transform(&self) -> &ResizeLongestSide {
        &self.transform
    }

    pub fn device(&self) -> &str {
        self.encoder.device()
    }

    /// Current features, `(1, C, H', W')` once an image is set
    pub fn features(&self) -> Option<&ArrayD<f32>> {
        self.features.as_ref()
    }

    pub fn original_size(&self) -> Option<(usize, usize)> {
        self.original_size
    }

    pub fn input_size(&self) -> Option<(usize, usize)> {
        self.input_size
    }

    pub fn is_image_set(&self) -> bool {
        self.is_image_set
    }

    pub fn reset_image(&mut self) {
        self.features = None;
        self.original_size = None;
        self.input_size = None;
        self.is_image_set = false;
    }

    pub(crate) fn set_state(
        &mut self,
        features: ArrayD<f32>,
        original_size: Option<(usize, usize)>,
        input_size: Option<(usize, usize)>,
    ) {
        self.features = Some(features);
        self.original_size = original_size;
        self.input_size = input_size;
        self.is_image_set = true;
    }

    /// Compute the features of a single `(H, W, 3)` image
    pub fn set_image(&mut self, image: &Array3<u8>) -> Result<()> {
        self.encode_batch(std::slice::from_ref(image)).map(|_| ())
    }

    /// Encode a batch of `(H, W, 3)` images with a single encoder call
    ///
    /// The predictor state is left pointing at the last image of the batch.
    pub fn encode_batch(&mut self, images: &[Array3<u8>]) -> Result<EncodedBatch> {
        if images.is_empty() {
            return Err(EmbeddingError::invalid_input("Cannot encode an empty batch"));
        }
        self.reset_image();

        let mut tensors = Vec::with_capacity(images.len());
        let mut original_sizes = Vec::with_capacity(images.len());
        let mut input_sizes = Vec::with_capacity(images.len());

        for image in images {
            let (height, width, _) = image.dim();
            let resized = self.transform.apply_image(image)?;
            let (new_h, new_w, _) = resized.dim();

            // HWC u8 -> CHW f32
            let chw = resized
                .permuted_axes([2, 0, 1])
                .mapv(|v| v as f32)
                .as_standard_layout()
                .into_owned();

            original_sizes.push((height, width));
            input_sizes.push((new_h, new_w));
            tensors.push(self.encoder.preprocess(chw)?);
        }

        let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
        let batch = stack(Axis(0), &views).map_err(|e| EmbeddingError::encoder(e.to_string()))?;

        log::debug!(
            "Encoding batch of {} images on {}",
            images.len(),
            self.encoder.device()
        );
        let features = self.encoder.encode(batch.view())?;
        if features.len_of(Axis(0)) != images.len() {
            return Err(EmbeddingError::encoder(format!(
                "Encoder returned {} feature maps for a batch of {} images",
                features.len_of(Axis(0)),
                images.len()
            )));
        }

        let last = images.len() - 1;
        let last_features = features
            .index_axis(Axis(0), last)
            .insert_axis(Axis(0))
            .to_owned()
            .into_dyn();
        self.set_state(
            last_features,
            Some(original_sizes[last]),
            Some(input_sizes[last]),
        );

        Ok(EncodedBatch {
            features,
            original_sizes,
            input_sizes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEncoder;

    #[test]
    fn test_model_identity_from_name() {
        let identity = ModelIdentity::new("vit_b_lm", Some("xxh128:abc".into())).unwrap();
        assert_eq!(identity.model_type, "vit_b");
        assert_eq!(identity.model_name, "vit_b_lm");

        assert!(ModelIdentity::new("resnet50", None).is_err());
        assert!(ModelIdentity::new("vit", None).is_err());
        assert!(ModelIdentity::with_type("vit_t", "my_checkpoint", None).is_ok());
    }

    #[test]
    fn test_default_preprocess_pads() {
        let encoder = StubEncoder::new();
        let image = Array3::<f32>::from_elem((3, 4, 2), 123.675);
        let padded = encoder.preprocess(image).unwrap();
        let size = encoder.image_size();
        assert_eq!(padded.dim(), (3, size, size));
        assert!(padded[[0, 0, 0]].abs() < 1e-6);
        assert_eq!(padded[[1, 5, 5]], 0.0);

        let too_large = Array3::<f32>::zeros((3, size + 1, 1));
        assert!(encoder.preprocess(too_large).is_err());
    }

    #[test]
    fn test_encode_batch_sets_state_to_last_image() {
        let mut predictor = StubEncoder::predictor();
        let images = vec![
            Array3::<u8>::from_elem((10, 20, 3), 50),
            Array3::<u8>::from_elem((40, 20, 3), 200),
        ];
        let encoded = predictor.encode_batch(&images).unwrap();
        let size = predictor.encoder().image_size();

        assert_eq!(encoded.features.len_of(Axis(0)), 2);
        assert_eq!(encoded.original_sizes, vec![(10, 20), (40, 20)]);
        assert_eq!(encoded.input_sizes, vec![(size / 2, size), (size, size / 2)]);

        assert!(predictor.is_image_set());
        assert_eq!(predictor.original_size(), Some((40, 20)));
        let features = predictor.features().unwrap();
        assert_eq!(features.ndim(), 4);
        assert_eq!(
            features.index_axis(Axis(0), 0),
            encoded.features.index_axis(Axis(0), 1).into_dyn()
        );
        assert_eq!(predictor.encoder().calls(), 1);

        predictor.reset_image();
        assert!(!predictor.is_image_set());
        assert!(predictor.features().is_none());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let mut predictor = StubEncoder::predictor();
        assert!(predictor.encode_batch(&[]).is_err());
        assert_eq!(predictor.encoder().calls(), 0);
    }
}
