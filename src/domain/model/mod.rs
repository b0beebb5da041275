pub mod cluster_node;
pub mod definition;
pub mod task_instance;
pub mod workflow_instance;
