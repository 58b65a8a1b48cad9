//! ML model inference components

pub mod inference;
pub mod loader;

pub use inference::{Classifier, InferenceAdapter};
pub use loader::{ModelLoader, OnnxScorer};

/// A trained fraud classifier.
///
/// Receives features encoded per the model's [`FeatureSchema`](crate::feature_extractor::FeatureSchema)
/// and returns the probability of the model's positive output class.
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, features: &[f32]) -> anyhow::Result<f64>;
}
