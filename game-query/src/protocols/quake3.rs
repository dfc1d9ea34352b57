//! Quake 3 `getstatus` over UDP. No challenge.
//!
//! Reply layout:
//!
//! ```text
//!  FF FF FF FF "statusResponse\n"
//!  \key\value\key\value...\n
//!  <score> <ping> "<name>"\n      (one line per player)
//! ```

use crate::buffer::Buffer;
use crate::error::QueryError;
use crate::protocol::{Extraction, Normalize, PacketType, Protocol};
use crate::record::Record;
use serde_json::{json, Map};

const STATUS_RESPONSE: &[u8] = b"\xFF\xFF\xFF\xFFstatusResponse\n";

pub struct Quake3;

impl Quake3 {
    pub fn boxed() -> Box<dyn Protocol> {
        Box::new(Quake3)
    }
}

impl Protocol for Quake3 {
    fn protocol(&self) -> &'static str {
        "quake3"
    }

    fn name_long(&self) -> &'static str {
        "Quake 3"
    }

    fn default_port(&self) -> u16 {
        27960
    }

    fn packets(&self) -> Vec<(PacketType, Vec<u8>)> {
        vec![(PacketType::Status, b"\xFF\xFF\xFF\xFFgetstatus\x0A".to_vec())]
    }

    fn extraction_chain(&self) -> Vec<Extraction> {
        vec![Extraction::new(PacketType::Status, extract_status)]
    }

    fn normalize(&self) -> Normalize {
        Normalize {
            general: &[
                ("gametype", "g_gametype"),
                ("hostname", "sv_hostname"),
                ("mapname", "mapname"),
                ("maxplayers", "sv_maxclients"),
                ("mod", "gamename"),
                ("numplayers", "num_players"),
                ("password", "g_needpass"),
            ],
            player: &[("name", "name"), ("ping", "ping"), ("score", "score")],
            team: &[],
        }
    }
}

fn extract_status(chunks: &[Vec<u8>], record: &mut Record) -> Result<(), QueryError> {
    // Only the first well-formed datagram counts; duplicates are ignored.
    let reply = chunks
        .iter()
        .find(|c| c.starts_with(STATUS_RESPONSE))
        .ok_or_else(|| QueryError::Malformed("no statusResponse header".into()))?;

    let mut buf = Buffer::new(reply);
    buf.expect(STATUS_RESPONSE)?;

    let rules = buf.read_until(b'\n');
    let mut fields = Buffer::new(rules);
    // Leading backslash before the first key.
    fields.skip_prefix(b"\\");
    while !fields.is_empty() {
        let key = String::from_utf8_lossy(fields.read_until(b'\\')).into_owned();
        let value = String::from_utf8_lossy(fields.read_until(b'\\')).into_owned();
        if !key.is_empty() {
            record.add(key, value);
        }
    }

    let mut count = 0u32;
    while !buf.is_empty() {
        let line = buf.read_until(b'\n');
        if line.is_empty() {
            continue;
        }
        record.add_player(parse_player(line)?);
        count += 1;
    }
    record.add("num_players", count);
    Ok(())
}

fn parse_player(line: &[u8]) -> Result<Map<String, serde_json::Value>, QueryError> {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.splitn(3, ' ');
    let (Some(score), Some(ping), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(QueryError::Malformed(format!("bad player line {:?}", text)));
    };
    let score: i64 = score
        .parse()
        .map_err(|_| QueryError::Malformed(format!("bad score {:?}", score)))?;
    let ping: i64 = ping
        .parse()
        .map_err(|_| QueryError::Malformed(format!("bad ping {:?}", ping)))?;

    let mut player = Map::new();
    player.insert("name".into(), json!(name.trim_matches('"')));
    player.insert("score".into(), json!(score));
    player.insert("ping".into(), json!(ping));
    Ok(player)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn status_reply() -> Vec<u8> {
        let mut p = STATUS_RESPONSE.to_vec();
        p.extend_from_slice(b"\\sv_hostname\\^1Red ^7Arena\\mapname\\q3dm17");
        p.extend_from_slice(b"\\sv_maxclients\\16\\g_needpass\\0\\gamename\\baseq3\n");
        p.extend_from_slice(b"20 48 \"^2Sarge\"\n");
        p.extend_from_slice(b"-3 999 \"Visor the Bot\"\n");
        p
    }

    #[test]
    fn rules_and_players() {
        let mut record = Record::new();
        extract_status(&[status_reply()], &mut record).unwrap();
        assert_eq!(record.get("sv_hostname").unwrap(), "^1Red ^7Arena");
        assert_eq!(record.get("mapname").unwrap(), "q3dm17");
        assert_eq!(record.get("sv_maxclients").unwrap(), "16");
        assert_eq!(record.get("num_players").unwrap(), 2);

        let players = record.players();
        assert_eq!(players[0]["name"], "^2Sarge");
        assert_eq!(players[0]["score"], 20);
        assert_eq!(players[1]["name"], "Visor the Bot");
        assert_eq!(players[1]["ping"], 999);
    }

    #[test]
    fn empty_server() {
        let mut reply = STATUS_RESPONSE.to_vec();
        reply.extend_from_slice(b"\\sv_hostname\\idle\n");
        let mut record = Record::new();
        extract_status(&[reply], &mut record).unwrap();
        assert_eq!(record.get("num_players").unwrap(), 0);
        assert!(record.players().is_empty());
    }

    #[test]
    fn wrong_header_is_malformed() {
        let mut record = Record::new();
        let err = extract_status(&[b"\xFF\xFF\xFF\xFFprint\n".to_vec()], &mut record).unwrap_err();
        assert!(matches!(err, QueryError::Malformed(_)));
        assert!(record.is_empty());
    }

    #[test]
    fn rules_without_leading_backslash() {
        let mut reply = STATUS_RESPONSE.to_vec();
        reply.extend_from_slice(b"sv_hostname\\bare\\g_needpass\\1\n");
        let mut record = Record::new();
        extract_status(&[reply], &mut record).unwrap();
        assert_eq!(record.get("sv_hostname").unwrap(), "bare");
        assert_eq!(record.get("g_needpass").unwrap(), "1");
    }

    #[test]
    fn bad_player_line() {
        let mut reply = STATUS_RESPONSE.to_vec();
        reply.extend_from_slice(b"\\a\\b\nnot-a-number 5 \"x\"\n");
        let mut record = Record::new();
        assert!(extract_status(&[reply], &mut record).is_err());
    }
}
