pub mod dag_engine;
pub mod workflow_dag;
