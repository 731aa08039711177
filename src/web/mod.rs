// Server modules for the model registry and its HTTP front end

pub mod config;
pub mod error;
pub mod fit_job;
pub mod logger;
pub mod model_registry;
pub mod models;
pub mod request;
pub mod response_helpers;
pub mod routes;
pub mod worker;

// Re-export commonly used types
pub use config::{RegistryConfig, ServerArgs};
pub use error::{Result, ServeError};
pub use model_registry::{Model, ModelRegistry, SharedModelRegistry};
pub use models::*;
