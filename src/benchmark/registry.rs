//! Name-keyed adapter registry.
//!
//! The registry is an ordinary value. Build it once at startup and share it
//! with the executor through an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::BenchmarkAdapter;

/// Benchmark adapters keyed by name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn BenchmarkAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` under its own name, replacing any previous one.
    pub fn register(&mut self, adapter: impl BenchmarkAdapter + 'static) {
        self.register_arc(Arc::new(adapter));
    }

    pub fn register_arc(&mut self, adapter: Arc<dyn BenchmarkAdapter>) {
        let name = adapter.name().to_string();
        if self.adapters.insert(name.clone(), adapter).is_some() {
            warn!(adapter = %name, "Replaced existing benchmark adapter");
        } else {
            debug!(adapter = %name, "Registered benchmark adapter");
        }
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_adapter(mut self, adapter: impl BenchmarkAdapter + 'static) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BenchmarkAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}
