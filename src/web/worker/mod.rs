//! Out-of-process model workers.
//!
//! Each running model is served by its own child process:
//! - Crash isolation: a worker crash doesn't kill the server
//! - Memory reclaim: stopping a model frees everything it held

pub mod ipc_types;
pub mod process_manager;
pub mod worker_bridge;
pub mod worker_main;
