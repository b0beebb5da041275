pub mod memory_registry;
pub mod registry_client;
pub mod registry_path;
