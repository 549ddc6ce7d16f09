//! Explicit worker registry, built once at process startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use workerman_core::{Worker, WorkerError, WorkerResult};

type WorkerFactory = Box<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// Maps worker names to lazily-built workers.
///
/// Factories run at most once per name; the instance is memoized.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
    instances: Mutex<HashMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration for the same name wins.
    pub fn register<F>(&mut self, worker_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Worker> + Send + Sync + 'static,
    {
        let name = worker_name.into();
        self.instances
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        self.factories.insert(name, Box::new(factory));
        self
    }

    /// Register an already-built worker.
    pub fn register_instance(
        &mut self,
        worker_name: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> &mut Self {
        self.register(worker_name, move || worker.clone())
    }

    pub fn contains(&self, worker_name: &str) -> bool {
        self.factories.contains_key(worker_name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn resolve(&self, worker_name: &str) -> WorkerResult<Arc<dyn Worker>> {
        let factory = self
            .factories
            .get(worker_name)
            .ok_or_else(|| WorkerError::unavailable(worker_name))?;

        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let worker = instances
            .entry(worker_name.to_string())
            .or_insert_with(|| factory());
        Ok(worker.clone())
    }
}

impl core::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("names", &self.names())
            .finish()
    }
}
