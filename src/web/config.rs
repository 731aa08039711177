//! Server configuration: the registry settings plus the command line that builds them.

use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use super::worker::process_manager::WorkerProgram;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Settings handed to [`ModelRegistry::new`](super::model_registry::ModelRegistry::new).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding one `<id>/` folder per model.
    pub model_root: PathBuf,
    /// Where worker sockets are created.
    pub socket_dir: PathBuf,
    pub predict_worker: WorkerProgram,
    pub fit_worker: WorkerProgram,
    /// How long a new worker has to bind its socket.
    pub connect_timeout: Duration,
    /// Per-call deadline; `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// How long a stopped worker may take to exit before it is killed.
    pub stop_grace: Duration,
}

impl RegistryConfig {
    pub fn new(
        model_root: impl Into<PathBuf>,
        predict_worker: WorkerProgram,
        fit_worker: WorkerProgram,
    ) -> Self {
        Self {
            model_root: model_root.into(),
            socket_dir: std::env::temp_dir().join("mlserve"),
            predict_worker,
            fit_worker,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Command line of the `mlserve` binary.
#[derive(Debug, Parser)]
#[command(name = "mlserve", about = "Serve fitted classification models from worker processes")]
pub struct ServerArgs {
    /// Port for the API server
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Location of the model directory
    #[arg(long = "model-path", default_value = "models")]
    pub model_path: PathBuf,

    /// Directory for worker sockets (defaults to <tmp>/mlserve)
    #[arg(long)]
    pub socket_dir: Option<PathBuf>,

    /// Prediction worker program (defaults to this binary in worker mode)
    #[arg(long)]
    pub predict_worker: Option<PathBuf>,

    /// Leading argument for the prediction worker, repeatable
    #[arg(long = "predict-worker-arg", allow_hyphen_values = true)]
    pub predict_worker_args: Vec<OsString>,

    /// Fit worker program (defaults to this binary in worker mode)
    #[arg(long)]
    pub fit_worker: Option<PathBuf>,

    /// Leading argument for the fit worker, repeatable
    #[arg(long = "fit-worker-arg", allow_hyphen_values = true)]
    pub fit_worker_args: Vec<OsString>,

    #[arg(long, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Per-call deadline in seconds, 0 waits forever
    #[arg(long, default_value_t = 60)]
    pub call_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub stop_grace_secs: u64,

    /// off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl ServerArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn level(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or(LevelFilter::Info)
    }

    pub fn registry_config(&self) -> io::Result<RegistryConfig> {
        let predict_worker = worker_program(&self.predict_worker, &self.predict_worker_args, "predict")?;
        let fit_worker = worker_program(&self.fit_worker, &self.fit_worker_args, "fit")?;

        let mut config = RegistryConfig::new(&self.model_path, predict_worker, fit_worker)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_call_timeout(
                (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs)),
            )
            .with_stop_grace(Duration::from_secs(self.stop_grace_secs));
        if let Some(dir) = &self.socket_dir {
            config = config.with_socket_dir(dir);
        }
        Ok(config)
    }
}

fn worker_program(
    program: &Option<PathBuf>,
    args: &[OsString],
    mode: &str,
) -> io::Result<WorkerProgram> {
    match program {
        Some(program) => Ok(WorkerProgram::new(program).with_args(args.iter().cloned())),
        None => WorkerProgram::current_exe(mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = ServerArgs::try_parse_from(["mlserve"]).unwrap();
        assert_eq!(args.port, 5000);
        assert_eq!(args.model_path, PathBuf::from("models"));
        assert_eq!(args.level(), LevelFilter::Info);

        let config = args.registry_config().unwrap();
        assert_eq!(config.call_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.predict_worker.args, vec![OsString::from("--worker"), OsString::from("predict")]);
        assert_eq!(config.fit_worker.args, vec![OsString::from("--worker"), OsString::from("fit")]);
    }

    #[test]
    fn test_external_workers_and_no_deadline() {
        let args = ServerArgs::try_parse_from([
            "mlserve",
            "--predict-worker",
            "python3",
            "--predict-worker-arg",
            "predict.py",
            "--fit-worker",
            "python3",
            "--fit-worker-arg",
            "-u",
            "--fit-worker-arg",
            "fit.py",
            "--call-timeout-secs",
            "0",
            "--socket-dir",
            "/run/mlserve",
        ])
        .unwrap();

        let config = args.registry_config().unwrap();
        assert_eq!(config.predict_worker, WorkerProgram::new("python3").with_args(["predict.py"]));
        assert_eq!(config.fit_worker, WorkerProgram::new("python3").with_args(["-u", "fit.py"]));
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.socket_dir, PathBuf::from("/run/mlserve"));
    }

    #[test]
    fn test_bad_log_level_falls_back_to_info() {
        let args = ServerArgs::try_parse_from(["mlserve", "--log-level", "loud"]).unwrap();
        assert_eq!(args.level(), LevelFilter::Info);
    }
}
