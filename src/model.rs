use std::path::Path;
use std::sync::Mutex;

use log::info;
use ndarray::{Array4, ArrayViewD, Axis, Ix4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::preprocessing::InputSize;

/// Maps a preprocessed `[1, H, W, 3]` tensor to an embedding vector.
///
/// Implementations must be deterministic and free of side effects, and safe to call
/// from many requests at once.
pub trait FeatureExtractor: Send + Sync
{
    fn input_size(&self) -> InputSize;

    fn embedding_dim(&self) -> usize;

    fn extract(&self, input: Array4<f32>) -> Result<Vec<f32>>;
}

/// The image embedding model: a pretrained convolutional network (e.g. MobileNetV2)
/// with its classification head removed, exported to ONNX.
///
/// The export may end at the pooled activations or at the last feature map;
/// in the latter case we apply the global average pooling ourselves, see `pool_activations()`.
///
/// Uses an ONNX representation of the model so that it can be used in Rust,
/// and to execute the model on a wide variety of hardware using the ONNX runtime.
pub struct EmbeddingModel
{
    // Running a session needs exclusive access; the weights themselves are never mutated.
    session: Mutex<Session>,
    input_size: InputSize,
    embedding_dim: usize,
}

impl EmbeddingModel
{
    pub fn new(config: &ModelConfig) -> Result<Self>
    {
        info!("Loading embedding model from {:?}", config.path);
        let now = std::time::Instant::now();

        let session = Self::build_session(&config.path, config.intra_threads)?;

        info!("Embedding model loaded in {:?}", now.elapsed());

        Ok(EmbeddingModel {
            session: Mutex::new(session),
            input_size: InputSize::from(config),
            embedding_dim: config.embedding_dim,
        })
    }

    fn build_session(path: &Path, intra_threads: usize) -> Result<Session>
    {
        if !path.exists() {
            return Err(Error::ModelLoad(format!("model file {:?} does not exist", path)));
        }

        Session::builder()
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?
            .with_intra_threads(intra_threads)
            .map_err(load_error)?
            .commit_from_file(path)
            .map_err(load_error)
    }
}

impl FeatureExtractor for EmbeddingModel
{
    fn input_size(&self) -> InputSize
    {
        self.input_size
    }

    fn embedding_dim(&self) -> usize
    {
        self.embedding_dim
    }

    /// Runs the network over one preprocessed image.
    /// Every intermediate tensor (input view, session outputs) is dropped before returning;
    /// only the plain embedding vector survives the call.
    fn extract(&self, input: Array4<f32>) -> Result<Vec<f32>>
    {
        let expected = [1, self.input_size.height, self.input_size.width, crate::preprocessing::CHANNELS];
        if input.shape() != expected {
            return Err(Error::Extraction(format!(
                "input tensor has shape {:?}, expected {:?}", input.shape(), expected
            )));
        }

        let mut session = self.session.lock()
            .map_err(|_| Error::Extraction("model session lock poisoned".into()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(&input)?])?;

        // The export has a single output: pooled activations or the last feature map.
        let activations = outputs[0].try_extract_array::<f32>()?;

        pool_activations(activations, self.embedding_dim)
    }
}

fn load_error(e: impl std::fmt::Display) -> Error
{
    Error::ModelLoad(e.to_string())
}

/// Reduces the network output to a flat embedding of length `embedding_dim`.
///
/// Accepted shapes (batch of one):
/// - `[1, D]`, `[1, 1, 1, D]`, `[1, D, 1, 1]`: already pooled, only squeezed.
/// - `[1, H, W, D]`: a channels-last feature map, averaged over `H` and `W`.
pub fn pool_activations(activations: ArrayViewD<'_, f32>, embedding_dim: usize) -> Result<Vec<f32>>
{
    let shape = activations.shape().to_vec();
    if shape.first() != Some(&1) {
        return Err(Error::Extraction(format!("expected a batch of one, got output shape {:?}", shape)));
    }

    let embedding: Vec<f32> = match shape.len() {
        2 => activations.iter().copied().collect(),
        4 if shape[1] * shape[2] == 1 || shape[2] * shape[3] == 1 => activations.iter().copied().collect(),
        4 => {
            let (height, width, channels) = (shape[1], shape[2], shape[3]);
            let feature_map = activations.into_dimensionality::<Ix4>()?;
            let pixels = feature_map
                .index_axis(Axis(0), 0)
                .to_shape((height * width, channels))?
                .mean_axis(Axis(0))
                .ok_or_else(|| Error::Extraction("empty feature map".into()))?;
            pixels.to_vec()
        }
        _ => return Err(Error::Extraction(format!("unsupported output shape {:?}", shape))),
    };

    if embedding.len() != embedding_dim {
        return Err(Error::Extraction(format!(
            "model produced {} features, expected {}", embedding.len(), embedding_dim
        )));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(Error::Extraction("model produced non-finite activations".into()));
    }

    Ok(embedding)
}
