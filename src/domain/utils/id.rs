use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use uuid::Uuid;

/// String backed identifier, tagged with a marker type so that e.g. a task
/// instance id can never be passed where a workflow instance id is expected.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T> {
    pub id: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Id { id: id.into(), _marker: PhantomData }
    }

    /// Generates a fresh random id.
    pub fn random() -> Self {
        Id::new(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

// Manual impl, the derive would require `T: Clone` on the marker.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        Id::new(self.id.clone())
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<T> From<Id<T>> for String {
    fn from(id_wrapper: Id<T>) -> Self {
        id_wrapper.id
    }
}

impl<T> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Id::new(value)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full_name = std::any::type_name::<T>();
        let clean_name = full_name.split("::").last().unwrap_or(full_name);
        let display_name = clean_name.replace("Tag", "Id");

        write!(f, "{}: {:?}", display_name, self.id)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct WorkflowCodeTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct WorkflowInstanceTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct TaskInstanceTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct NodeCodeTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct HostTag;

pub type WorkflowCode = Id<WorkflowCodeTag>;
pub type WorkflowInstanceId = Id<WorkflowInstanceTag>;
pub type TaskInstanceId = Id<TaskInstanceTag>;
pub type NodeCode = Id<NodeCodeTag>;

/// `ip:port` of a master, worker or alert server.
pub type Host = Id<HostTag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_names_the_id_kind() {
        let id = TaskInstanceId::new("t-1");
        assert_eq!(format!("{:?}", id), "TaskInstanceId: \"t-1\"");
        assert_eq!(id.to_string(), "t-1");
    }

    #[test]
    fn serializes_as_plain_string() {
        let host = Host::new("127.0.0.1:5678");
        let json = serde_json::to_string(&host).unwrap();
        assert_eq!(json, "\"127.0.0.1:5678\"");

        let back: Host = serde_json::from_str(&json).unwrap();
        assert_eq!(back, host);
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(WorkflowInstanceId::random(), WorkflowInstanceId::random());
    }
}
