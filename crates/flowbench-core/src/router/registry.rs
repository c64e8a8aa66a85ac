//! Name-indexed adapter registry and logical model table.

use std::collections::{BTreeMap, HashMap};

use flowbench_types::model::ModelSpec;

use super::box_adapter::BoxModelAdapter;

/// Registry of available adapters, indexed by name.
pub struct AdapterRegistry {
    adapters: HashMap<String, BoxModelAdapter>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn register(&mut self, adapter: BoxModelAdapter) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<&BoxModelAdapter> {
        self.adapters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered adapter names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Problems with a model table.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    #[error("model '{0}' is defined more than once")]
    DuplicateModel(String),

    #[error("model '{0}' has no adapters")]
    NoAdapters(String),
}

/// Logical model ids mapped to their ordered adapter bindings.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelTable {
    pub fn new(specs: Vec<ModelSpec>) -> Result<Self, TableError> {
        let mut models = BTreeMap::new();
        for spec in specs {
            if spec.adapters.is_empty() {
                return Err(TableError::NoAdapters(spec.name));
            }
            if models.contains_key(&spec.name) {
                return Err(TableError::DuplicateModel(spec.name));
            }
            models.insert(spec.name.clone(), spec);
        }
        Ok(Self { models })
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// All models, sorted by id.
    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// `(model, adapter)` bindings naming an adapter missing from `registry`.
    pub fn unregistered_bindings<'a>(&'a self, registry: &AdapterRegistry) -> Vec<(&'a str, &'a str)> {
        self.models
            .values()
            .flat_map(|spec| {
                spec.adapters
                    .iter()
                    .filter(|b| !registry.contains(&b.adapter))
                    .map(move |b| (spec.name.as_str(), b.adapter.as_str()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbench_types::model::AdapterBinding;

    fn spec(name: &str, adapters: &[&str]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            adapters: adapters
                .iter()
                .map(|a| AdapterBinding {
                    adapter: a.to_string(),
                    model: "m".to_string(),
                    cost: Default::default(),
                    latency: Default::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let err = ModelTable::new(vec![spec("fast", &["a"]), spec("fast", &["b"])]).unwrap_err();
        assert_eq!(err, TableError::DuplicateModel("fast".into()));
    }

    #[test]
    fn test_model_without_adapters_rejected() {
        let err = ModelTable::new(vec![spec("empty", &[])]).unwrap_err();
        assert!(err.to_string().contains("no adapters"));
    }

    #[test]
    fn test_unregistered_bindings() {
        let table = ModelTable::new(vec![spec("fast", &["local", "remote"])]).unwrap();
        let registry = AdapterRegistry::new();
        assert_eq!(
            table.unregistered_bindings(&registry),
            vec![("fast", "local"), ("fast", "remote")]
        );
        assert_eq!(table.len(), 1);
        assert!(table.contains("fast"));
    }
}
