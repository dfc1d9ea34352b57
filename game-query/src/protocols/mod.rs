//! Protocol registry and the bundled protocol implementations.
//!
//! Each protocol is a [`Protocol`] value built by a plain constructor
//! function. The registry maps the server `type` given at registration to
//! that constructor, so several game types can share one wire protocol.

pub mod quake3;
pub mod source;
pub mod teamspeak3;

use crate::error::QueryError;
use crate::protocol::Protocol;
use std::collections::BTreeMap;

pub type Constructor = fn() -> Box<dyn Protocol>;

#[derive(Clone)]
pub struct ProtocolRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl ProtocolRegistry {
    /// A registry with no protocols at all.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Register (or replace) `key`. Keys are case-insensitive.
    pub fn register(&mut self, key: &str, constructor: Constructor) {
        self.constructors.insert(key.to_lowercase(), constructor);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(&key.to_lowercase())
    }

    pub fn constructor(&self, key: &str) -> Result<Constructor, QueryError> {
        self.constructors
            .get(&key.to_lowercase())
            .copied()
            .ok_or_else(|| QueryError::Configuration(format!("unknown server type '{}'", key)))
    }

    pub fn create(&self, key: &str) -> Result<Box<dyn Protocol>, QueryError> {
        self.constructor(key).map(|ctor| ctor())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("source", source::Source::boxed);
        registry.register("csgo", source::Source::boxed);
        registry.register("css", source::Source::boxed);
        registry.register("tf2", source::Source::boxed);
        registry.register("gmod", source::Source::boxed);
        registry.register("quake3", quake3::Quake3::boxed);
        registry.register("teamspeak3", teamspeak3::Teamspeak3::boxed);
        registry.register("ts3", teamspeak3::Teamspeak3::boxed);
        registry
    }
}
