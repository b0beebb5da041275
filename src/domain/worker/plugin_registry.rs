use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::model::definition::TaskKind;
use crate::domain::worker::task_executor::{NoopExecutor, ShellExecutor, SleepExecutor, TaskExecutor};

/// Executors a worker can run, keyed by task kind. Plugins can be swapped
/// at runtime, a task already running keeps its executor.
#[derive(Default)]
pub struct TaskPluginRegistry {
    executors: RwLock<HashMap<TaskKind, Arc<dyn TaskExecutor>>>,
}

impl TaskPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in shell, sleep and noop executors.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ShellExecutor));
        registry.register(Arc::new(SleepExecutor));
        registry.register(Arc::new(NoopExecutor));
        registry
    }

    /// Returns the executor previously registered for the same kind.
    pub fn register(&self, executor: Arc<dyn TaskExecutor>) -> Option<Arc<dyn TaskExecutor>> {
        let kind = executor.kind();
        log::debug!("Registering executor for {:?}", kind);
        self.executors.write().expect("RwLock poisoned").insert(kind, executor)
    }

    pub fn unload(&self, kind: TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.write().expect("RwLock poisoned").remove(&kind)
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().expect("RwLock poisoned").get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.executors.read().expect("RwLock poisoned").keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_builtin_kinds() {
        let registry = TaskPluginRegistry::with_defaults();
        for kind in [TaskKind::Shell, TaskKind::Sleep, TaskKind::Noop] {
            assert!(registry.get(kind).is_some());
        }
    }

    #[test]
    fn unload_removes_executor() {
        let registry = TaskPluginRegistry::with_defaults();
        assert!(registry.unload(TaskKind::Shell).is_some());
        assert!(registry.get(TaskKind::Shell).is_none());
        assert!(registry.register(Arc::new(ShellExecutor)).is_none());
        assert!(registry.register(Arc::new(ShellExecutor)).is_some());
    }
}
