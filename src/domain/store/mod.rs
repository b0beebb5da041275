pub mod memory_store;
pub mod metadata_store;
