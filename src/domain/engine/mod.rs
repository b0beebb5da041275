pub mod events;
pub mod task_runnable;
pub mod workflow_engine;
pub mod workflow_runnable;
