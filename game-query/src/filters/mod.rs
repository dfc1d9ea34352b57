//! Post-processing filters applied to each record after extraction.
//!
//! Filters are looked up by name in a [`FilterRegistry`] and built from a
//! JSON parameter map. The orchestrator runs them in registration order.

pub mod normalise;
pub mod secondstohuman;
pub mod stripcolors;

use crate::error::QueryError;
use crate::protocol::ProtocolInstance;
use crate::record::Record;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type FilterParams = Map<String, Value>;

pub type FilterConstructor = fn(&FilterParams) -> Result<Box<dyn Filter>, QueryError>;

pub trait Filter: Send {
    /// Transform `record`. `instance` is the server the record came from.
    fn apply(&self, record: Record, instance: &ProtocolInstance) -> Record;
}

#[derive(Clone)]
pub struct FilterRegistry {
    constructors: BTreeMap<String, FilterConstructor>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, constructor: FilterConstructor) {
        self.constructors.insert(name.to_lowercase(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(&name.to_lowercase())
    }

    pub fn create(&self, name: &str, params: &FilterParams) -> Result<Box<dyn Filter>, QueryError> {
        let ctor = self
            .constructors
            .get(&name.to_lowercase())
            .ok_or_else(|| QueryError::Configuration(format!("unknown filter '{}'", name)))?;
        ctor(params)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("normalise", normalise::Normalise::build);
        registry.register("secondstohuman", secondstohuman::SecondsToHuman::build);
        registry.register("stripcolors", stripcolors::StripColors::build);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins() {
        let registry = FilterRegistry::default();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["normalise", "secondstohuman", "stripcolors"]
        );
        assert!(registry.create("StripColors", &Map::new()).is_ok());
    }

    #[test]
    fn unknown_filter() {
        let err = FilterRegistry::default()
            .create("reverse", &Map::new())
            .err()
            .unwrap();
        assert!(matches!(err, QueryError::Configuration(_)));
    }
}
