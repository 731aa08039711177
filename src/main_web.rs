// HTTP front end for the model registry
use std::convert::Infallible;
use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::{error, info};

use mlserve::web::logger::init_logging;
use mlserve::web::routes::handle_request;
use mlserve::web::worker::worker_main::run_worker;
use mlserve::web::{ModelRegistry, ServerArgs, SharedModelRegistry};

fn main() -> anyhow::Result<()> {
    // Check for --worker BEFORE anything else: the worker builds its own
    // runtime and must not run inside the server's.
    let mut args = std::env::args_os();
    let program = args.next().unwrap_or_else(|| OsString::from("mlserve"));
    let rest: Vec<OsString> = args.collect();
    if rest.first().is_some_and(|a| a == "--worker") {
        return run_worker(rest.into_iter().skip(1));
    }

    let args = ServerArgs::parse_from(std::iter::once(program).chain(rest));
    init_logging(args.level(), args.log_file.as_deref())?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build server runtime")?
        .block_on(serve(args))
}

async fn serve(args: ServerArgs) -> anyhow::Result<()> {
    let config = args
        .registry_config()
        .context("failed to resolve worker programs")?;
    let registry: SharedModelRegistry = Arc::new(ModelRegistry::new(config));
    registry
        .index_all()
        .await
        .with_context(|| format!("failed to index {}", args.model_path.display()))?;

    let make_svc = make_service_fn({
        let registry = Arc::clone(&registry);
        move |_conn| {
            let registry = Arc::clone(&registry);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle_request(req, Arc::clone(&registry))))
            }
        }
    });

    let addr = args.addr();
    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(make_svc)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        });

    info!("serving models from {} on http://{addr}", args.model_path.display());
    let served = server.await;

    registry.shutdown().await;
    info!("all workers stopped");
    served.context("server error")
}
