use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, ServeError};

/// Confusion matrix as written by the fit worker: true label -> predicted label -> count.
pub type ConfusionMatrix = BTreeMap<String, BTreeMap<String, f64>>;

/// Human-facing metadata, set once at fit time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Training performance written by the fit worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    #[serde(default)]
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confusion_matrix: Option<ConfusionMatrix>,
    #[serde(default)]
    pub score: f64,
}

/// Registry view of one model.
///
/// The on-disk `<id>.json` file deserializes straight into this type; the
/// runtime flags (`running`, `trained`) and the directory are filled in by the
/// registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    #[serde(rename = "model_id", default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub performance: Performance,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub trained: bool,
    #[serde(skip)]
    pub(crate) directory: PathBuf,
}

impl ModelRecord {
    /// A fresh record for a model whose fit has not finished yet.
    pub fn unstarted(id: String, directory: PathBuf) -> Self {
        Self {
            id,
            directory,
            ..Self::default()
        }
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    /// `<dir>/<id>.pkl`, opaque to the server.
    pub(crate) fn artifact_path(&self) -> PathBuf {
        self.directory.join(format!("{}.pkl", self.id))
    }
}

/// `<dir>/<id>.json`
pub(crate) fn metadata_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

/// A feature value or target label: JSON scalars are either numbers or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// One observation: feature name -> value.
pub type Row = BTreeMap<String, Scalar>;

/// Body of a fit request, also the file handed to the fit worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub data: Vec<Row>,
    pub labels: Vec<Scalar>,
}

impl TrainingRequest {
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(ServeError::InvalidRequest(
                "training data must contain at least one row".to_string(),
            ));
        }
        if self.data.len() != self.labels.len() {
            return Err(ServeError::InvalidRequest(format!(
                "got {} rows but {} labels",
                self.data.len(),
                self.labels.len()
            )));
        }
        Ok(())
    }
}

/// Body of a predict request. Forwarded to the worker untouched apart from
/// the model id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub data: Vec<Row>,
}

impl PredictRequest {
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(ServeError::InvalidRequest(
                "prediction data must contain at least one row".to_string(),
            ));
        }
        Ok(())
    }
}

/// Predict response returned to HTTP callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub model_id: String,
    pub labels: serde_json::Value,
}
