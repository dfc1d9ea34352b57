//! Remove Quake-style `^N` colour codes from every string in a record.

use super::{Filter, FilterParams};
use crate::error::QueryError;
use crate::protocol::ProtocolInstance;
use crate::record::Record;
use serde_json::Value;

pub struct StripColors;

impl StripColors {
    pub fn build(_params: &FilterParams) -> Result<Box<dyn Filter>, QueryError> {
        Ok(Box::new(StripColors))
    }
}

impl Filter for StripColors {
    fn apply(&self, mut record: Record, _instance: &ProtocolInstance) -> Record {
        for (_, value) in record.iter_mut() {
            strip_value(value);
        }
        record
    }
}

fn strip_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains('^') {
                *s = strip(s);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_value),
        Value::Object(map) => map.values_mut().for_each(strip_value),
        _ => {}
    }
}

/// `^` followed by an ASCII letter or digit is a colour code. A lone or
/// trailing caret is kept.
pub fn strip(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '^' {
            if let Some(next) = chars.peek() {
                if next.is_ascii_alphanumeric() {
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryOptions;
    use crate::protocol::tests::instance;
    use serde_json::{json, Map};

    #[test]
    fn strips_codes() {
        assert_eq!(strip("^1Red ^7Arena"), "Red Arena");
        assert_eq!(strip("^^1x"), "^x");
        assert_eq!(strip("2^ 3 = 8^"), "2^ 3 = 8^");
        assert_eq!(strip("plain"), "plain");
    }

    #[test]
    fn reaches_players() {
        let mut record = Record::new();
        record.add("hostname", "^3Yellow");
        record.add("maxplayers", 16);
        let mut p = Map::new();
        p.insert("name".into(), json!("^2Sarge"));
        record.add_player(p);

        let out = StripColors.apply(record, &instance(QueryOptions::default()));
        assert_eq!(out.get("hostname"), Some(&json!("Yellow")));
        assert_eq!(out.get("maxplayers"), Some(&json!(16)));
        assert_eq!(out.players()[0]["name"], "Sarge");
    }
}
