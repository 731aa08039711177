//! Server-side handle to one running prediction worker.
//!
//! Two tasks run per worker:
//! - supervisor: owns the child, waits for it to exit, then marks the bridge dead
//! - bridge: pulls requests off the queue in FIFO order and performs one
//!   send/receive exchange on the socket per request
//!
//! Callers block in [`WorkerBridge::call`] on a oneshot reply. Because the
//! bridge finishes one exchange before starting the next, at most one call is
//! in flight per worker.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::ipc_types::{self, IpcConnection, IpcEndpoint, Payload};
use super::process_manager::{self, Signal, WorkerProgram};
use crate::web::error::{Result, ServeError};

/// Delay between attempts to reach a worker that has not bound its socket yet.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

struct BridgeRequest {
    payload: Payload,
    reply: oneshot::Sender<Result<Payload>>,
}

/// Everything needed to launch one prediction worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub model_id: String,
    pub program: WorkerProgram,
    pub endpoint: IpcEndpoint,
    pub artifact: PathBuf,
    pub connect_timeout: Duration,
    pub call_timeout: Option<Duration>,
    /// Start generation, used by the owner to ignore exits of older workers.
    pub epoch: u64,
}

#[derive(Debug)]
pub struct WorkerBridge {
    model_id: String,
    epoch: u64,
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<BridgeRequest>,
    exited: CancellationToken,
    call_timeout: Option<Duration>,
}

impl std::fmt::Debug for BridgeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRequest")
            .field("payload_len", &self.payload.as_bytes().len())
            .finish()
    }
}

impl WorkerBridge {
    /// Launch the worker and connect to it.
    ///
    /// `on_exit` runs on the supervisor task once the process has exited and
    /// the bridge reports itself dead. Errors here are launch errors only;
    /// problems the worker reports later surface per call or in the exit log.
    pub async fn start<F>(spec: LaunchSpec, on_exit: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let LaunchSpec {
            model_id,
            program,
            endpoint,
            artifact,
            connect_timeout,
            call_timeout,
            epoch,
        } = spec;

        let launch_failure = |reason: String| ServeError::LaunchFailure {
            model_id: model_id.clone(),
            reason,
        };

        if let Some(dir) = endpoint.path().parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| launch_failure(format!("cannot create {}: {e}", dir.display())))?;
        }
        ipc_types::remove_socket(&endpoint)
            .map_err(|e| launch_failure(format!("cannot remove stale {endpoint}: {e}")))?;

        let child = process_manager::spawn_predict_worker(&program, &endpoint, &artifact)
            .map_err(|e| launch_failure(format!("cannot spawn {}: {e}", program.program.display())))?;
        let pid = child.id();
        let exited = CancellationToken::new();

        info!("starting model {model_id} (pid {pid:?}, {endpoint})");
        tokio::spawn({
            let model_id = model_id.clone();
            let endpoint = endpoint.clone();
            let exited = exited.clone();
            async move {
                let report = process_manager::supervise(&model_id, child).await;
                report.log(&model_id);
                exited.cancel();
                if let Err(e) = ipc_types::remove_socket(&endpoint) {
                    debug!("could not remove socket {endpoint}: {e}");
                }
                on_exit();
            }
        });

        let conn = match connect_with_retry(&endpoint, &exited, connect_timeout).await {
            Ok(conn) => conn,
            Err(reason) => {
                if let Some(pid) = pid.filter(|_| !exited.is_cancelled()) {
                    if let Err(e) = process_manager::send_signal(pid, Signal::Kill) {
                        warn!("could not kill worker for model {model_id}: {e}");
                    }
                }
                return Err(launch_failure(reason));
            }
        };

        Ok(Self::attach(model_id, epoch, pid, conn, exited, call_timeout))
    }

    /// Wire a bridge task onto an established connection.
    fn attach(
        model_id: String,
        epoch: u64,
        pid: Option<u32>,
        conn: IpcConnection,
        exited: CancellationToken,
        call_timeout: Option<Duration>,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        tokio::spawn(bridge_task(model_id.clone(), conn, rx, exited.clone(), pid));

        Self {
            model_id,
            epoch,
            pid,
            requests,
            exited,
            call_timeout,
        }
    }

    /// Send `payload` to the worker and wait for its reply.
    pub async fn call(&self, payload: Payload) -> Result<Payload> {
        if !self.is_alive() {
            return Err(ServeError::WorkerUnavailable(self.model_id.clone()));
        }

        let (reply, rx) = oneshot::channel();
        self.requests
            .send(BridgeRequest { payload, reply })
            .map_err(|_| ServeError::WorkerUnavailable(self.model_id.clone()))?;

        let received = match self.call_timeout {
            Some(after) => tokio::time::timeout(after, rx)
                .await
                .map_err(|_| ServeError::CallTimeout {
                    model_id: self.model_id.clone(),
                    after,
                })?,
            None => rx.await,
        };

        // A dropped reply sender means the bridge shut down with this request queued.
        received.map_err(|_| ServeError::WorkerExited(self.model_id.clone()))?
    }

    /// Ask the worker to shut down (SIGINT) and return immediately. The
    /// bridge only reports itself dead once the supervisor has reaped the
    /// process. A no-op on a dead worker.
    pub fn stop(&self) -> Result<()> {
        self.signal(Signal::Interrupt)
    }

    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::Kill)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        match self.pid {
            Some(pid) if self.is_alive() => {
                debug!("sending {signal:?} to model {} (pid {pid})", self.model_id);
                Ok(process_manager::send_signal(pid, signal)?)
            }
            _ => Ok(()),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Resolves once the worker process has exited.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn connect_with_retry(
    endpoint: &IpcEndpoint,
    exited: &CancellationToken,
    deadline: Duration,
) -> std::result::Result<IpcConnection, String> {
    let attempts = async {
        loop {
            match ipc_types::connect(endpoint).await {
                Ok(conn) => return conn,
                Err(e) => {
                    trace!("{endpoint} not ready: {e}");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    };

    tokio::select! {
        biased;
        conn = tokio::time::timeout(deadline, attempts) => {
            conn.map_err(|_| format!("worker did not bind {endpoint} within {deadline:?}"))
        }
        () = exited.cancelled() => Err(format!("worker exited before binding {endpoint}")),
    }
}

async fn bridge_task(
    model_id: String,
    mut conn: IpcConnection,
    mut requests: mpsc::UnboundedReceiver<BridgeRequest>,
    exited: CancellationToken,
    pid: Option<u32>,
) {
    loop {
        let request = tokio::select! {
            biased;
            () = exited.cancelled() => break,
            next = requests.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        match ipc_types::exchange(&mut conn, request.payload).await {
            Ok(reply) => {
                // The caller may have given up (timeout); nothing to do then.
                let _ = request.reply.send(Ok(reply));
            }
            Err(e) => {
                error!("error exchanging data with model {model_id}: {e}");
                let err = if ipc_types::is_disconnect(&e) || exited.is_cancelled() {
                    ServeError::WorkerExited(model_id.clone())
                } else {
                    ServeError::Ipc {
                        model_id: model_id.clone(),
                        source: e,
                    }
                };
                let _ = request.reply.send(Err(err));
                // The REQ/REP lockstep is broken; take the worker down so the
                // supervisor marks the model stopped.
                kill_if_alive(&model_id, pid, &exited);
                break;
            }
        }
    }

    // Queued requests are dropped here; their callers see WorkerExited.
    requests.close();
    debug!("[BRIDGE] bridge for model {model_id} exiting");
}

fn kill_if_alive(model_id: &str, pid: Option<u32>, exited: &CancellationToken) {
    let Some(pid) = pid.filter(|_| !exited.is_cancelled()) else {
        return;
    };
    if let Err(e) = process_manager::send_signal(pid, Signal::Kill) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not kill worker for model {model_id}: {e}");
        }
    }
}
