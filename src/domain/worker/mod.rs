pub mod plugin_registry;
pub mod task_executor;
pub mod worker_server;
