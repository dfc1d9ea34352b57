//! Add protocol-independent `gq_*` fields next to the protocol's own.
//!
//! The mapping comes from [`Protocol::normalize`](crate::protocol::Protocol::normalize).
//! Fields the server did not report are left out rather than nulled.

use super::{Filter, FilterParams};
use crate::error::QueryError;
use crate::protocol::ProtocolInstance;
use crate::record::{Record, PLAYERS, TEAMS};
use serde_json::{Map, Value};

pub const PREFIX: &str = "gq_";

pub struct Normalise;

impl Normalise {
    pub fn build(_params: &FilterParams) -> Result<Box<dyn Filter>, QueryError> {
        Ok(Box::new(Normalise))
    }
}

impl Filter for Normalise {
    fn apply(&self, mut record: Record, instance: &ProtocolInstance) -> Record {
        let table = instance.normalize();

        for (gq, key) in table.general {
            if let Some(value) = record.get(key).cloned() {
                record.add(format!("{}{}", PREFIX, gq), value);
            }
        }
        record.add(format!("{}online", PREFIX), record.online());

        for (list, pairs) in [(PLAYERS, table.player), (TEAMS, table.team)] {
            if let Some(Value::Array(items)) = record.get_mut(list) {
                for item in items.iter_mut().filter_map(Value::as_object_mut) {
                    map_entry(item, pairs);
                }
            }
        }
        record
    }
}

fn map_entry(entry: &mut Map<String, Value>, pairs: &[(&str, &str)]) {
    for (gq, key) in pairs {
        if let Some(value) = entry.get(*key).cloned() {
            entry.insert(format!("{}{}", PREFIX, gq), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryOptions;
    use crate::protocol::{Endpoint, ProtocolInstance};
    use crate::protocols::quake3::Quake3;
    use serde_json::json;

    fn quake_instance() -> ProtocolInstance {
        ProtocolInstance::new(
            Quake3::boxed(),
            "quake3",
            Endpoint {
                ip: "192.0.2.7".parse().unwrap(),
                port: 27960,
                client_port: 27960,
            },
            QueryOptions::default(),
        )
    }

    #[test]
    fn maps_general_and_player_fields() {
        let mut record = Record::new();
        record.add("sv_hostname", "Arena");
        record.add("sv_maxclients", "16");
        record.add("online", true);
        let mut p = Map::new();
        p.insert("name".into(), json!("Sarge"));
        p.insert("score".into(), json!(4));
        record.add_player(p);

        let out = Normalise.apply(record, &quake_instance());
        assert_eq!(out.get("gq_hostname"), Some(&json!("Arena")));
        assert_eq!(out.get("gq_maxplayers"), Some(&json!("16")));
        assert_eq!(out.get("gq_online"), Some(&json!(true)));
        assert!(!out.contains("gq_mapname"));
        assert_eq!(out.players()[0]["gq_name"], "Sarge");
        assert_eq!(out.players()[0]["gq_score"], 4);
        // Originals stay.
        assert_eq!(out.get("sv_hostname"), Some(&json!("Arena")));
    }
}
