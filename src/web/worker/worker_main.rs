//! Built-in reference worker.
//!
//! Runs as a child process spawned by the server (`mlserve --worker <mode> ...`).
//! `predict` binds the endpoint it is given, accepts the server's connection
//! and answers every request frame with exactly one reply frame. `fit` reads a
//! training file, fits a majority-class model and writes the artifact plus its
//! metadata into the output directory.
//!
//! All diagnostics go to stderr, which the server forwards to its log.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::signal::unix::{signal, SignalKind};

use super::ipc_types::{self, IpcEndpoint};
use crate::web::models::{ConfusionMatrix, Metadata, Performance, PredictRequest, Scalar, TrainingRequest};

const ALGORITHM: &str = "MajorityClassifier";

/// How long `--exit-after 0` lingers on the accepted connection before exiting.
const EARLY_EXIT_LINGER: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "mlserve --worker", about = "Reference model worker")]
struct WorkerArgs {
    #[command(subcommand)]
    mode: WorkerMode,
}

#[derive(Debug, Subcommand)]
enum WorkerMode {
    /// Serve predictions for one fitted model
    Predict(PredictArgs),
    /// Fit a model from a training file
    Fit(FitArgs),
}

#[derive(Debug, Args)]
struct PredictArgs {
    #[arg(long, value_enum, default_value_t = Behavior::Classify)]
    behavior: Behavior,

    /// Sleep before answering each request
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Exit after this many replies (0 exits right after accepting the connection)
    #[arg(long)]
    exit_after: Option<u64>,

    /// ipc://<socket path>
    endpoint: String,

    artifact: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Behavior {
    /// Class priors from the fitted artifact
    Classify,
    /// `{"seq": n, "request": ...}`
    Echo,
}

#[derive(Debug, Args)]
struct FitArgs {
    /// Exit nonzero without writing anything
    #[arg(long)]
    fail: bool,

    output_dir: PathBuf,

    training_file: PathBuf,
}

/// Run the worker with the arguments that followed `--worker`.
///
/// Must be called outside any tokio runtime; predict mode builds its own.
pub fn run_worker<I>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = OsString>,
{
    let args = WorkerArgs::try_parse_from(
        std::iter::once(OsString::from("mlserve --worker")).chain(args),
    )?;
    match args.mode {
        WorkerMode::Fit(args) => fit(&args),
        WorkerMode::Predict(args) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build worker runtime")?
            .block_on(serve_predictions(args)),
    }
}

/// Fitted artifact: how often each label occurred in the training data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ClassCounts {
    labels: BTreeMap<String, u64>,
}

impl ClassCounts {
    fn fit(labels: &[Scalar]) -> Self {
        let mut counts = BTreeMap::new();
        for label in labels {
            *counts.entry(label.to_string()).or_insert(0) += 1;
        }
        Self { labels: counts }
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open artifact {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid artifact {}", path.display()))
    }

    fn total(&self) -> u64 {
        self.labels.values().sum()
    }

    /// Most frequent label; ties go to the label that sorts first.
    fn majority(&self) -> Option<(&str, u64)> {
        self.labels
            .iter()
            .fold(None, |best: Option<(&str, u64)>, (label, &count)| match best {
                Some((_, top)) if top >= count => best,
                _ => Some((label.as_str(), count)),
            })
    }

    /// Share of the training rows the majority label gets right.
    fn score(&self) -> f64 {
        match (self.majority(), self.total()) {
            (Some((_, count)), total) if total > 0 => count as f64 / total as f64,
            _ => 0.0,
        }
    }

    fn priors(&self) -> BTreeMap<String, f64> {
        let total = self.total().max(1) as f64;
        self.labels
            .iter()
            .map(|(label, &count)| (label.clone(), count as f64 / total))
            .collect()
    }

    /// Every row is predicted as the majority label.
    fn confusion_matrix(&self) -> ConfusionMatrix {
        let majority = self.majority().map(|(label, _)| label.to_string());
        self.labels
            .iter()
            .map(|(actual, &count)| {
                let row = self
                    .labels
                    .keys()
                    .map(|predicted| {
                        let hits = if Some(predicted) == majority.as_ref() { count } else { 0 };
                        (predicted.clone(), hits as f64)
                    })
                    .collect();
                (actual.clone(), row)
            })
            .collect()
    }
}

fn fit(args: &FitArgs) -> anyhow::Result<()> {
    eprintln!("[WORKER] Starting fit worker (pid={})", std::process::id());
    if args.fail {
        bail!("fit failed: --fail was given");
    }

    let file = File::open(&args.training_file)
        .with_context(|| format!("cannot open training data {}", args.training_file.display()))?;
    let request: TrainingRequest = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("invalid training data {}", args.training_file.display()))?;
    request.validate()?;

    let id = match &request.model_id {
        Some(id) => id.clone(),
        None => args
            .output_dir
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .context("training data has no model_id and the output directory has no name")?,
    };

    let counts = ClassCounts::fit(&request.labels);
    fs::create_dir_all(&args.output_dir)?;

    // The artifact goes first so the metadata file only appears for a complete model.
    write_json(&args.output_dir.join(format!("{id}.pkl")), &counts)?;
    let metadata = Metadata {
        name: request.name.clone(),
        created_at: Some(Utc::now()),
    };
    let performance = Performance {
        algorithm: ALGORITHM.to_string(),
        confusion_matrix: Some(counts.confusion_matrix()),
        score: counts.score(),
    };
    let metadata = json!({
        "model_id": id,
        "metadata": metadata,
        "performance": performance,
    });
    write_json(&args.output_dir.join(format!("{id}.json")), &metadata)?;

    eprintln!(
        "[WORKER] Fitted {id} on {} rows, score {:.3}",
        request.data.len(),
        counts.score()
    );
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

enum Responder {
    Classify(ClassCounts),
    Echo,
}

impl Responder {
    fn reply(&self, request: &[u8], seq: u64) -> Value {
        let request: Value = match serde_json::from_slice(request) {
            Ok(value) => value,
            Err(e) => return json!({ "error": format!("request is not JSON: {e}") }),
        };

        match self {
            Responder::Echo => json!({ "seq": seq, "request": request }),
            Responder::Classify(counts) => match serde_json::from_value::<PredictRequest>(request) {
                Ok(req) => {
                    let priors = counts.priors();
                    Value::Array(req.data.iter().map(|_| json!(priors)).collect())
                }
                Err(e) => json!({ "error": format!("bad prediction request: {e}") }),
            },
        }
    }
}

async fn serve_predictions(args: PredictArgs) -> anyhow::Result<()> {
    eprintln!("[WORKER] Starting predict worker (pid={})", std::process::id());
    let endpoint = IpcEndpoint::parse(&args.endpoint)
        .with_context(|| format!("invalid endpoint {:?}", args.endpoint))?;
    let responder = match args.behavior {
        Behavior::Classify => Responder::Classify(ClassCounts::load(&args.artifact)?),
        Behavior::Echo => Responder::Echo,
    };
    let delay = Duration::from_millis(args.delay_ms);

    let mut interrupt = signal(SignalKind::interrupt())?;
    let listener = ipc_types::bind(&endpoint)
        .with_context(|| format!("cannot bind {endpoint}"))?;
    eprintln!("[WORKER] Listening on {endpoint}");

    let stream = tokio::select! {
        accepted = listener.accept() => accepted?.0,
        _ = interrupt.recv() => {
            ipc_types::remove_socket(&endpoint)?;
            return Ok(());
        }
    };
    let mut conn = ipc_types::frame(stream);

    if args.exit_after == Some(0) {
        tokio::time::sleep(EARLY_EXIT_LINGER).await;
        eprintln!("[WORKER] Exiting without serving");
        return Ok(());
    }

    let mut served = 0u64;
    loop {
        let frame = tokio::select! {
            frame = conn.next() => frame,
            _ = interrupt.recv() => {
                eprintln!("[WORKER] Interrupted");
                break;
            }
        };
        let Some(frame) = frame else {
            eprintln!("[WORKER] Server closed the connection");
            break;
        };
        let frame = frame?;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = responder.reply(&frame, served);
        conn.send(Bytes::from(reply.to_string())).await?;

        served += 1;
        if args.exit_after == Some(served) {
            eprintln!("[WORKER] Served {served} requests, exiting");
            break;
        }
    }

    ipc_types::remove_socket(&endpoint)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::models::ModelRecord;
    use crate::web::worker::ipc_types::{connect, exchange, Payload};

    fn labels(values: &[&str]) -> Vec<Scalar> {
        values.iter().map(|v| Scalar::Text(v.to_string())).collect()
    }

    #[test]
    fn test_majority_counts() {
        let counts = ClassCounts::fit(&labels(&["b", "a", "b", "c", "b"]));
        assert_eq!(counts.majority(), Some(("b", 3)));
        assert_eq!(counts.score(), 0.6);
        assert_eq!(counts.priors()["a"], 0.2);

        let cm = counts.confusion_matrix();
        assert_eq!(cm["a"]["b"], 1.0);
        assert_eq!(cm["a"]["a"], 0.0);
        assert_eq!(cm["b"]["b"], 3.0);
    }

    #[test]
    fn test_majority_tie_prefers_first_label() {
        let counts = ClassCounts::fit(&labels(&["y", "x"]));
        assert_eq!(counts.majority(), Some(("x", 1)));
    }

    #[test]
    fn test_fit_writes_artifact_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("m1");
        let training = dir.path().join("train.json");
        fs::write(
            &training,
            r#"{"model_id": "m1", "name": "iris", "data": [{"x": 1}, {"x": 2}, {"x": 3}], "labels": [0, 0, 1]}"#,
        )
        .unwrap();

        fit(&FitArgs {
            fail: false,
            output_dir: out.clone(),
            training_file: training,
        })
        .unwrap();

        let record: ModelRecord =
            serde_json::from_str(&fs::read_to_string(out.join("m1.json")).unwrap()).unwrap();
        assert_eq!(record.id, "m1");
        assert_eq!(record.metadata.name, "iris");
        assert!(record.metadata.created_at.is_some());
        assert_eq!(record.performance.algorithm, ALGORITHM);
        assert!((record.performance.score - 2.0 / 3.0).abs() < 1e-9);

        let counts = ClassCounts::load(&out.join("m1.pkl")).unwrap();
        assert_eq!(counts.labels["0"], 2);
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let training = dir.path().join("train.json");
        fs::write(&training, r#"{"data": [{"x": 1}], "labels": []}"#).unwrap();

        let args = FitArgs {
            fail: false,
            output_dir: dir.path().join("m"),
            training_file: training.clone(),
        };
        assert!(fit(&args).is_err());
        assert!(fit(&FitArgs { fail: true, ..args }).is_err());
        assert!(!dir.path().join("m").exists());
    }

    #[test]
    fn test_worker_args_put_options_before_positionals() {
        let args = WorkerArgs::try_parse_from([
            "w", "predict", "--behavior", "echo", "--exit-after", "2", "ipc:///tmp/a.sock", "/m/a.pkl",
        ])
        .unwrap();
        match args.mode {
            WorkerMode::Predict(p) => {
                assert_eq!(p.behavior, Behavior::Echo);
                assert_eq!(p.exit_after, Some(2));
                assert_eq!(p.endpoint, "ipc:///tmp/a.sock");
            }
            WorkerMode::Fit(_) => panic!("parsed as fit"),
        }
    }

    #[test]
    fn test_reply_shapes() {
        let echo = Responder::Echo.reply(br#"{"data": []}"#, 4);
        assert_eq!(echo, json!({"seq": 4, "request": {"data": []}}));

        let classify = Responder::Classify(ClassCounts::fit(&labels(&["a", "b", "b", "b"])));
        let reply = classify.reply(br#"{"model_id": "m", "data": [{"x": 1}, {"x": 2}]}"#, 0);
        assert_eq!(reply, json!([{"a": 0.25, "b": 0.75}, {"a": 0.25, "b": 0.75}]));

        assert!(classify.reply(b"not json", 0)["error"].is_string());
    }

    #[tokio::test]
    async fn test_predict_worker_answers_in_order_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = IpcEndpoint::for_model(dir.path(), "m");
        let args = PredictArgs {
            behavior: Behavior::Echo,
            delay_ms: 0,
            exit_after: Some(2),
            endpoint: endpoint.to_string(),
            artifact: dir.path().join("unused.pkl"),
        };
        let worker = tokio::spawn(serve_predictions(args));

        let mut conn = loop {
            match connect(&endpoint).await {
                Ok(conn) => break conn,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        for seq in 0..2 {
            let reply = exchange(&mut conn, Payload::from(r#""hi""#)).await.unwrap();
            let reply: Value = serde_json::from_slice(reply.as_bytes()).unwrap();
            assert_eq!(reply, json!({"seq": seq, "request": "hi"}));
        }

        worker.await.unwrap().unwrap();
        assert!(!endpoint.path().exists());
    }
}
