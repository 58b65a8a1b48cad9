//! ONNX model loader

use crate::config::ModelsConfig;
use crate::feature_extractor::{FeatureExtractor, FeatureSchema};
use crate::models::inference::Classifier;
use crate::models::Scorer;
use anyhow::{bail, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Loaded ONNX model with metadata
pub struct OnnxScorer {
    /// Model name
    name: String,
    /// ONNX Runtime session; running it needs exclusive access
    session: Mutex<Session>,
    /// Input name for the model
    input_name: String,
    /// Output name for probabilities
    output_name: String,
}

/// Loader for ONNX models
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a new model loader with specified number of threads
    pub fn with_threads(onnx_threads: usize) -> Self {
        Self {
            onnx_threads: onnx_threads.max(1),
        }
    }

    /// Load the model and its feature schema as configured
    pub fn load_classifier(&self, config: &ModelsConfig) -> Result<Classifier> {
        let schema = FeatureSchema::from_path(&config.columns_path)?;
        let scorer = self.load_model(&config.model_path)?;

        info!(
            model = %scorer.name(),
            schema_version = %schema.version(),
            features = schema.len(),
            "Classifier ready"
        );

        Ok(Classifier {
            scorer: Arc::new(scorer),
            features: FeatureExtractor::new(schema),
        })
    }

    /// Load a single ONNX model from file
    pub fn load_model<P: AsRef<Path>>(&self, path: P) -> Result<OnnxScorer> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        info!(model = %name, path = %path.display(), threads = self.onnx_threads, "Loading ONNX model");

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.onnx_threads)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "probabilities".to_string());

        info!(
            model = %name,
            input = %input_name,
            output = %output_name,
            "Model loaded successfully"
        );

        Ok(OnnxScorer {
            name,
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self::with_threads(1)
    }
}

impl Scorer for OnnxScorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, features: &[f32]) -> Result<f64> {
        use ort::value::Tensor;

        // Prepare input tensor - shape [1, num_features]
        let shape = vec![1_i64, features.len() as i64];
        let input_tensor = Tensor::from_array((shape, features.to_vec()))
            .context("Failed to create input tensor")?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let outputs = session.run(ort::inputs![&self.input_name => input_tensor])?;

        if let Some(output) = outputs.get(self.output_name.as_str()) {
            if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
                let prob = positive_class_probability(&shape.iter().copied().collect::<Vec<i64>>(), data)?;
                debug!(model = %self.name, prob = prob, "Extracted from tensor");
                return Ok(prob);
            }
        }

        // Fallback: first float tensor output that is not the label
        for (name, output) in outputs.iter() {
            if name.contains("label") {
                continue;
            }
            if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
                let prob = positive_class_probability(&shape.iter().copied().collect::<Vec<i64>>(), data)?;
                debug!(model = %self.name, output = %name, prob = prob, "Extracted from tensor (fallback)");
                return Ok(prob);
            }
        }

        bail!("Model {} produced no probability tensor", self.name)
    }
}

/// Probability of output class 1 from a `[batch, classes]`, `[classes]`, `[batch, 1]` or scalar tensor
fn positive_class_probability(dims: &[i64], data: &[f32]) -> Result<f64> {
    let value = match dims.last().copied() {
        Some(classes) if classes >= 2 => data.get(1),
        Some(1) | None => data.first(),
        Some(_) => None,
    };
    match value {
        Some(&v) => Ok(v as f64),
        None => bail!(
            "unexpected probability tensor: shape {:?} with {} values",
            dims,
            data.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_from_two_class_tensor() {
        assert_eq!(positive_class_probability(&[1, 2], &[0.25, 0.75]).unwrap(), 0.75);
        assert_eq!(positive_class_probability(&[2], &[0.5, 0.5]).unwrap(), 0.5);
    }

    #[test]
    fn test_probability_from_single_output_tensor() {
        assert_eq!(positive_class_probability(&[1, 1], &[0.5]).unwrap(), 0.5);
        assert_eq!(positive_class_probability(&[], &[0.8]).unwrap(), 0.8);
    }

    #[test]
    fn test_empty_or_misshapen_tensor_is_an_error() {
        assert!(positive_class_probability(&[1, 0], &[]).is_err());
        assert!(positive_class_probability(&[0, 2], &[]).is_err());
        assert!(positive_class_probability(&[1, 2], &[0.3]).is_err());
        assert!(positive_class_probability(&[1, 1], &[]).is_err());
    }

    #[test]
    fn test_missing_model_file_is_an_error() {
        let loader = ModelLoader::default();
        let config = ModelsConfig {
            model_path: "missing/model.onnx".to_string(),
            columns_path: "missing/columns.json".to_string(),
            ..ModelsConfig::default()
        };
        assert!(loader.load_classifier(&config).is_err());
    }
}
