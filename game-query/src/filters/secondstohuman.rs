//! Render player durations (seconds) as `HH:MM:SS` under `<key>_human`.
//!
//! Parameters: `keys`, a list of player fields to convert. Defaults to
//! `["time"]`.

use super::{Filter, FilterParams};
use crate::error::QueryError;
use crate::protocol::ProtocolInstance;
use crate::record::{Record, PLAYERS};
use serde_json::Value;

pub const DEFAULT_KEYS: &[&str] = &["time"];

pub struct SecondsToHuman {
    keys: Vec<String>,
}

impl SecondsToHuman {
    pub fn build(params: &FilterParams) -> Result<Box<dyn Filter>, QueryError> {
        let keys = match params.get("keys") {
            None => DEFAULT_KEYS.iter().map(|k| k.to_string()).collect(),
            Some(Value::Array(list)) => list
                .iter()
                .map(|k| {
                    k.as_str().map(str::to_string).ok_or_else(|| {
                        QueryError::Configuration(format!(
                            "secondstohuman: key {} is not a string",
                            k
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(Value::String(one)) => vec![one.clone()],
            Some(other) => {
                return Err(QueryError::Configuration(format!(
                    "secondstohuman: 'keys' must be a list, got {}",
                    other
                )))
            }
        };
        Ok(Box::new(SecondsToHuman { keys }))
    }
}

impl Filter for SecondsToHuman {
    fn apply(&self, mut record: Record, _instance: &ProtocolInstance) -> Record {
        if let Some(Value::Array(players)) = record.get_mut(PLAYERS) {
            for player in players.iter_mut().filter_map(Value::as_object_mut) {
                for key in &self.keys {
                    let Some(seconds) = player.get(key).and_then(Value::as_f64) else {
                        continue;
                    };
                    player.insert(format!("{}_human", key), Value::from(human(seconds)));
                }
            }
        }
        record
    }
}

pub fn human(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!("{:02}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
}
