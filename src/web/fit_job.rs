//! One-shot training of a new model in a fit worker process.

use std::io::{BufWriter, Write};

use log::{error, info};
use tempfile::NamedTempFile;

use super::error::{Result, ServeError};
use super::model_registry::ModelRegistry;
use super::models::{ModelRecord, TrainingRequest};
use super::worker::process_manager;

/// Fits one model. The training data is written to a temp file that is
/// removed when the job ends, whatever the outcome.
#[derive(Debug)]
pub struct FitJob {
    record: ModelRecord,
    request: TrainingRequest,
}

impl FitJob {
    pub fn new(record: ModelRecord, mut request: TrainingRequest) -> Self {
        request.model_id = Some(record.id.clone());
        Self { record, request }
    }

    /// Run the fit worker and, on success, load the freshly written model into
    /// the registry. A failed fit leaves nothing cached and is not retried.
    pub async fn run(self, registry: &ModelRegistry) -> Result<ModelRecord> {
        let id = self.record.id.clone();
        info!("started fitting model {id}");

        match self.fit(registry).await {
            Ok(record) => {
                info!(
                    "finished fitting model {id}: {} scored {}",
                    record.performance.algorithm, record.performance.score
                );
                Ok(record)
            }
            Err(e) => {
                error!("error fitting model {id}: {e}");
                Err(e)
            }
        }
    }

    async fn fit(self, registry: &ModelRegistry) -> Result<ModelRecord> {
        let FitJob { record, request } = self;

        let data_file = tokio::task::spawn_blocking({
            let prefix = format!("{}-", record.id);
            move || write_training_data(&prefix, &request)
        })
        .await
        .map_err(|e| std::io::Error::other(format!("training data writer panicked: {e}")))??;

        let output = process_manager::run_fit_worker(
            &registry.config().fit_worker,
            record.directory(),
            data_file.path(),
        )
        .await;
        // The temp file goes away here, before we look at the outcome.
        drop(data_file);

        let output = output.map_err(|e| ServeError::LaunchFailure {
            model_id: record.id.clone(),
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(ServeError::WorkerExitFailure {
                model_id: record.id.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(registry.load(&record.id).await?.record())
    }
}

fn write_training_data(prefix: &str, request: &TrainingRequest) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".json")
        .tempfile()?;
    {
        let mut writer = BufWriter::new(file.as_file_mut());
        serde_json::to_writer(&mut writer, request).map_err(std::io::Error::from)?;
        writer.flush()?;
    }
    Ok(file)
}
