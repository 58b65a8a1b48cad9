//! Feature encoding for classifier inference.
//!
//! The classifier is trained offline; its input contract is a [`FeatureSchema`]: the
//! ordered list of column names saved at training time (`columns.json`). Features are
//! derived from the transaction by name and then re-indexed onto that schema, with any
//! column the transaction cannot supply filled with 0. One-hot columns follow the
//! `<field>_<value>` naming of the training pipeline.

use crate::types::transaction::Transaction;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Ordered, versioned list of model input columns
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    version: String,
    columns: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaFile {
    Columns(Vec<String>),
    Versioned { version: String, columns: Vec<String> },
}

impl FeatureSchema {
    pub fn new(version: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            version: version.into(),
            columns,
        }
    }

    /// Parse either a bare JSON array of columns or `{"version": .., "columns": [..]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let schema = match serde_json::from_str::<SchemaFile>(json)
            .context("Feature schema must be a column array or {version, columns}")?
        {
            SchemaFile::Columns(columns) => Self::new("unversioned", columns),
            SchemaFile::Versioned { version, columns } => Self::new(version, columns),
        };
        anyhow::ensure!(!schema.columns.is_empty(), "Feature schema has no columns");
        Ok(schema)
    }

    /// Load the schema saved next to the model
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read feature schema from {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Feature extractor that transforms transactions into model input vectors.
pub struct FeatureExtractor {
    schema: FeatureSchema,
    index: HashMap<String, usize>,
}

impl FeatureExtractor {
    pub fn new(schema: FeatureSchema) -> Self {
        let index = schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { schema, index }
    }

    /// Get the number of features produced.
    pub fn feature_count(&self) -> usize {
        self.schema.len()
    }

    /// Encode a transaction using today's date for age
    pub fn extract(&self, tx: &Transaction) -> Vec<f32> {
        self.extract_at(tx, Utc::now().date_naive())
    }

    /// Encode a transaction in schema order; columns without a value are 0
    pub fn extract_at(&self, tx: &Transaction, today: NaiveDate) -> Vec<f32> {
        let mut features = vec![0.0_f32; self.schema.len()];
        for (name, value) in named_features(tx, today) {
            if let Some(&i) = self.index.get(&name) {
                features[i] = value;
            }
        }
        features
    }
}

/// Every feature the transaction can supply, by training-time column name
fn named_features(tx: &Transaction, today: NaiveDate) -> Vec<(String, f32)> {
    let mut features = Vec::with_capacity(8 + tx.extra.len());

    // Passthrough fields first so the interpreted core wins on a name clash
    for (name, value) in &tx.extra {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    features.push((name.clone(), v as f32));
                }
            }
            Value::Bool(b) => features.push((name.clone(), if *b { 1.0 } else { 0.0 })),
            Value::String(s) => features.push((one_hot(name, s), 1.0)),
            _ => {}
        }
    }

    let numeric = [
        ("amt", tx.amt),
        ("city_pop", tx.city_pop),
        ("unix_time", tx.unix_time.map(|t| t as f64)),
    ];
    for (name, value) in numeric {
        if let Some(v) = value {
            features.push((name.to_string(), v as f32));
        }
    }

    if let Some(age) = tx.dob.as_deref().and_then(|dob| age_years(dob, today)) {
        features.push(("age".to_string(), age as f32));
    }

    if let (Some(lat), Some(long), Some(merch_lat), Some(merch_long)) =
        (tx.lat, tx.long, tx.merch_lat, tx.merch_long)
    {
        features.push((
            "distance".to_string(),
            haversine_km(lat, long, merch_lat, merch_long) as f32,
        ));
    }

    let categorical = [
        ("category", &tx.category),
        ("state", &tx.state),
        ("merch_state", &tx.merch_state),
        ("gender", &tx.gender),
    ];
    for (name, value) in categorical {
        if let Some(v) = value {
            features.push((one_hot(name, v), 1.0));
        }
    }

    features
}

fn one_hot(field: &str, value: &str) -> String {
    format!("{field}_{value}")
}

/// Whole years between `dob` (`YYYY-MM-DD`) and `today`, counted in 365-day years
pub fn age_years(dob: &str, today: NaiveDate) -> Option<i64> {
    let born = NaiveDate::parse_from_str(dob.trim(), "%Y-%m-%d").ok()?;
    let days = (today - born).num_days();
    (days >= 0).then_some(days / 365)
}

/// Great-circle distance in kilometers
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}
