//! Result record produced for every queried server.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const PLAYERS: &str = "players";
pub const TEAMS: &str = "teams";

/// Field bag for one server. Keys are ordered so output is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any previous value.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn add_player(&mut self, player: Map<String, Value>) {
        self.push_to(PLAYERS, player);
    }

    pub fn add_team(&mut self, team: Map<String, Value>) {
        self.push_to(TEAMS, team);
    }

    fn push_to(&mut self, key: &str, entry: Map<String, Value>) {
        let slot = self
            .fields
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => items.push(Value::Object(entry)),
            other => *other = Value::Array(vec![Value::Object(entry)]),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value)> {
        self.fields.iter_mut()
    }

    /// Player entries, empty when the server reported none.
    pub fn players(&self) -> &[Value] {
        match self.fields.get(PLAYERS) {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    pub fn online(&self) -> bool {
        matches!(self.fields.get("online"), Some(Value::Bool(true)))
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.fields.into_iter().collect())
    }
}
