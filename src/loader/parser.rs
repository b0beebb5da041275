use serde::de::DeserializeOwned;
use std::fs;

use crate::api::config_dto::ClusterConfigDto;
use crate::api::workflow_dto::WorkflowDefinitionDto;
use crate::domain::config::ClusterConfig;
use crate::domain::model::definition::WorkflowDefinition;
use crate::error::Result;

/// Parses a JSON file into a given type `T`.
///
/// Errors are converted into `crate::error::Error` variants:
/// - `Error::IoError` if the file cannot be read.
/// - `Error::DeserializationError` if the JSON is malformed.
pub fn parse_json_file<T: DeserializeOwned>(file_path: &str) -> Result<T> {
    let data = fs::read_to_string(file_path)?;
    let parsed_data: T = serde_json::from_str(&data)?;
    Ok(parsed_data)
}

/// Reads and validates a workflow definition file.
pub fn load_workflow_definition(file_path: &str) -> Result<WorkflowDefinition> {
    let dto: WorkflowDefinitionDto = parse_json_file(file_path)?;
    log::debug!("Parsed workflow definition '{}' from {}", dto.code, file_path);
    WorkflowDefinition::try_from(dto)
}

/// Reads the cluster configuration, `None` yields the defaults.
pub fn load_cluster_config(file_path: Option<&str>) -> Result<ClusterConfig> {
    let dto = match file_path {
        Some(path) => parse_json_file::<ClusterConfigDto>(path)?,
        None => ClusterConfigDto::default(),
    };
    Ok(ClusterConfig::try_from(dto)?)
}
