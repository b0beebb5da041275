pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

pub use loader::parser::{load_cluster_config, load_workflow_definition};
