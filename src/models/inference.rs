//! Inference adapter: lazily loaded classifier, polarity normalization and decision

use crate::config::AppConfig;
use crate::error::InferenceFault;
use crate::feature_extractor::FeatureExtractor;
use crate::models::loader::ModelLoader;
use crate::models::Scorer;
use crate::types::transaction::Transaction;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// A scorer together with the feature encoding it was trained on
pub struct Classifier {
    pub scorer: Arc<dyn Scorer>,
    pub features: FeatureExtractor,
}

type ClassifierLoader = Box<dyn Fn() -> anyhow::Result<Classifier> + Send + Sync>;

enum ModelState {
    Ready(Classifier),
    /// The artifact could not be loaded; every call answers with the fallback verdict
    Fallback(String),
}

/// Turns transactions into fraud probabilities.
///
/// The classifier is loaded on first use and then shared read-only; only the
/// one-time initialization is synchronized. If loading fails the adapter stays in
/// fallback mode for the rest of the process lifetime.
pub struct InferenceAdapter {
    loader: ClassifierLoader,
    state: OnceLock<ModelState>,
    threshold: f64,
    /// Output class index that means fraud for the loaded model
    fraud_class: u8,
}

impl InferenceAdapter {
    /// Create an adapter that loads its classifier with `loader` on first use
    pub fn new<F>(loader: F, threshold: f64, fraud_class: u8) -> Self
    where
        F: Fn() -> anyhow::Result<Classifier> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            state: OnceLock::new(),
            threshold,
            fraud_class,
        }
    }

    /// Adapter backed by the configured ONNX artifact
    pub fn from_config(config: &AppConfig) -> Self {
        let models = config.models.clone();
        Self::new(
            move || ModelLoader::with_threads(models.onnx_threads).load_classifier(&models),
            config.detection.threshold,
            config.models.fraud_class,
        )
    }

    /// Adapter with an already loaded classifier
    pub fn with_classifier(classifier: Classifier, threshold: f64, fraud_class: u8) -> Self {
        let adapter = Self::new(
            || anyhow::bail!("classifier was provided at construction"),
            threshold,
            fraud_class,
        );
        let _ = adapter.state.set(ModelState::Ready(classifier));
        adapter
    }

    /// Force the one-time load; returns whether a classifier is available
    pub fn ensure_loaded(&self) -> bool {
        matches!(self.state(), ModelState::Ready(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.state.get(), Some(ModelState::Fallback(_)))
    }

    /// `pending`, `ready` or `fallback`, without triggering the load
    pub fn status(&self) -> &'static str {
        match self.state.get() {
            None => "pending",
            Some(ModelState::Ready(_)) => "ready",
            Some(ModelState::Fallback(_)) => "fallback",
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Probability that `transaction` is fraud
    pub fn score(&self, transaction: &Transaction) -> Result<f64, InferenceFault> {
        let classifier = match self.state() {
            ModelState::Ready(classifier) => classifier,
            ModelState::Fallback(reason) => return Err(InferenceFault::Unavailable(reason.clone())),
        };

        let features = classifier.features.extract(transaction);
        let raw = classifier
            .scorer
            .score(&features)
            .map_err(|e| InferenceFault::Model(e.to_string()))?;

        if !raw.is_finite() {
            return Err(InferenceFault::Model(format!(
                "{} returned a non-finite probability",
                classifier.scorer.name()
            )));
        }

        Ok(self.normalize(raw))
    }

    /// Fraud iff the probability is strictly above the threshold
    pub fn decide(probability: f64, threshold: f64) -> bool {
        probability > threshold
    }

    /// Map the model's positive-class output to "probability of fraud".
    ///
    /// The only place label polarity is interpreted.
    fn normalize(&self, raw: f64) -> f64 {
        let raw = raw.clamp(0.0, 1.0);
        if self.fraud_class == 1 {
            raw
        } else {
            1.0 - raw
        }
    }

    fn state(&self) -> &ModelState {
        self.state.get_or_init(|| match (self.loader)() {
            Ok(classifier) => {
                info!(
                    model = %classifier.scorer.name(),
                    features = classifier.features.feature_count(),
                    threshold = self.threshold,
                    fraud_class = self.fraud_class,
                    "Classifier loaded"
                );
                ModelState::Ready(classifier)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Classifier unavailable, entering fallback mode: every transaction will be flagged as fraud"
                );
                ModelState::Fallback(e.to_string())
            }
        })
    }
}
