pub mod id;
pub mod statistics;
pub mod system_metrics;
