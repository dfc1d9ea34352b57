//! Valve Source engine query protocol (A2S) over UDP.
//!
//! Every request ends in the challenge placeholder; the challenge reply is
//! `FF FF FF FF 41` followed by the four token bytes. Replies larger than
//! one datagram arrive split:
//!
//! ```text
//!  FE FF FF FF | id: i32 | total: u8 | number: u8 | size: u16 | payload ...
//! ```
//!
//! The payload of fragment 0 starts with the usual `FF FF FF FF` header.

use crate::buffer::Buffer;
use crate::error::QueryError;
use crate::protocol::{Extraction, Normalize, PacketType, Protocol};
use crate::record::Record;
use serde_json::{json, Map};

const SINGLE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const SPLIT: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];

const S2C_CHALLENGE: u8 = 0x41;
const S2A_INFO: u8 = 0x49;
const S2A_PLAYER: u8 = 0x44;
const S2A_RULES: u8 = 0x45;

/// Set on the split id when the payload is bzip2 compressed.
const COMPRESSED_FLAG: u32 = 0x8000_0000;

pub struct Source;

impl Source {
    pub fn boxed() -> Box<dyn Protocol> {
        Box::new(Source)
    }
}

impl Protocol for Source {
    fn protocol(&self) -> &'static str {
        "source"
    }

    fn name_long(&self) -> &'static str {
        "Source Engine"
    }

    fn default_port(&self) -> u16 {
        27015
    }

    fn packets(&self) -> Vec<(PacketType, Vec<u8>)> {
        vec![
            (
                PacketType::Challenge,
                b"\xFF\xFF\xFF\xFF\x56\xFF\xFF\xFF\xFF".to_vec(),
            ),
            (
                PacketType::Details,
                b"\xFF\xFF\xFF\xFFTSource Engine Query\x00%s".to_vec(),
            ),
            (PacketType::Players, b"\xFF\xFF\xFF\xFF\x55%s".to_vec()),
            (PacketType::Rules, b"\xFF\xFF\xFF\xFF\x56%s".to_vec()),
        ]
    }

    fn parse_challenge(&self, raw: &[u8]) -> Result<Vec<u8>, QueryError> {
        let mut buf = Buffer::new(raw);
        buf.expect(&SINGLE)
            .map_err(|_| QueryError::Challenge("missing A2S header".into()))?;
        match buf.read_u8() {
            Ok(S2C_CHALLENGE) => {}
            Ok(other) => {
                return Err(QueryError::Challenge(format!(
                    "unexpected challenge reply type 0x{:02x}",
                    other
                )))
            }
            Err(_) => return Err(QueryError::Challenge("truncated challenge reply".into())),
        }
        buf.read(4)
            .map(<[u8]>::to_vec)
            .map_err(|_| QueryError::Challenge("truncated challenge token".into()))
    }

    fn extraction_chain(&self) -> Vec<Extraction> {
        vec![
            Extraction::new(PacketType::Details, extract_details),
            Extraction::new(PacketType::Players, extract_players),
            Extraction::new(PacketType::Rules, extract_rules),
        ]
    }

    fn normalize(&self) -> Normalize {
        Normalize {
            general: &[
                ("dedicated", "dedicated"),
                ("gametype", "game_descr"),
                ("hostname", "hostname"),
                ("mapname", "map"),
                ("maxplayers", "max_players"),
                ("mod", "game_dir"),
                ("numplayers", "num_players"),
                ("password", "password"),
            ],
            player: &[("name", "name"), ("score", "score"), ("time", "time")],
            team: &[],
        }
    }
}

/// Collapse the chunks received for one request into a single payload that
/// starts right after the `FF FF FF FF` header.
pub(crate) fn assemble(chunks: &[Vec<u8>]) -> Result<Vec<u8>, QueryError> {
    if let Some(single) = chunks.iter().find(|c| c.starts_with(&SINGLE)) {
        return Ok(single[SINGLE.len()..].to_vec());
    }

    let mut fragments: Vec<(u8, &[u8])> = Vec::new();
    let mut expected: Option<(u32, u8)> = None;
    for chunk in chunks.iter().filter(|c| c.starts_with(&SPLIT)) {
        let mut buf = Buffer::new(chunk);
        buf.skip(SPLIT.len())?;
        let id = buf.read_u32_le()?;
        let total = buf.read_u8()?;
        let number = buf.read_u8()?;
        buf.skip(2)?;

        if id & COMPRESSED_FLAG != 0 {
            return Err(QueryError::Malformed("compressed split replies are not supported".into()));
        }
        match expected {
            None => expected = Some((id, total)),
            Some((first, _)) if first != id => continue,
            Some(_) => {}
        }
        if !fragments.iter().any(|(n, _)| *n == number) {
            fragments.push((number, buf.rest()));
        }
    }

    let Some((_, total)) = expected else {
        return Err(QueryError::Malformed("no A2S reply in response".into()));
    };
    if fragments.len() != total as usize {
        return Err(QueryError::Malformed(format!(
            "split reply incomplete: {} of {} fragments",
            fragments.len(),
            total
        )));
    }
    fragments.sort_by_key(|(n, _)| *n);

    let joined: Vec<u8> = fragments.into_iter().flat_map(|(_, p)| p.iter().copied()).collect();
    let mut buf = Buffer::new(&joined);
    buf.expect(&SINGLE)?;
    Ok(buf.rest().to_vec())
}

fn expect_type(buf: &mut Buffer, wanted: u8) -> Result<(), QueryError> {
    let got = buf.read_u8()?;
    if got != wanted {
        return Err(QueryError::Malformed(format!(
            "expected reply type 0x{:02x}, got 0x{:02x}",
            wanted, got
        )));
    }
    Ok(())
}

fn extract_details(chunks: &[Vec<u8>], record: &mut Record) -> Result<(), QueryError> {
    let payload = assemble(chunks)?;
    let mut buf = Buffer::new(&payload);
    expect_type(&mut buf, S2A_INFO)?;

    record.add("protocol_version", buf.read_u8()?);
    record.add("hostname", buf.read_cstring()?);
    record.add("map", buf.read_cstring()?);
    record.add("game_dir", buf.read_cstring()?);
    record.add("game_descr", buf.read_cstring()?);
    record.add("steamappid", buf.read_u16_le()?);
    record.add("num_players", buf.read_u8()?);
    record.add("max_players", buf.read_u8()?);
    record.add("num_bots", buf.read_u8()?);
    record.add("dedicated", (buf.read_u8()? as char).to_string());
    record.add("os", (buf.read_u8()? as char).to_string());
    record.add("password", buf.read_u8()? == 1);
    record.add("secure", buf.read_u8()? == 1);
    record.add("version", buf.read_cstring()?);

    if buf.is_empty() {
        return Ok(());
    }
    let edf = buf.read_u8()?;
    if edf & 0x80 != 0 {
        record.add("game_port", buf.read_u16_le()?);
    }
    if edf & 0x10 != 0 {
        record.add("steam_id", buf.read_u64_le()?.to_string());
    }
    if edf & 0x40 != 0 {
        record.add("sourcetv_port", buf.read_u16_le()?);
        record.add("sourcetv_name", buf.read_cstring()?);
    }
    if edf & 0x20 != 0 {
        record.add("keywords", buf.read_cstring()?);
    }
    if edf & 0x01 != 0 {
        record.add("game_id", buf.read_u64_le()?.to_string());
    }
    Ok(())
}

fn extract_players(chunks: &[Vec<u8>], record: &mut Record) -> Result<(), QueryError> {
    let payload = assemble(chunks)?;
    let mut buf = Buffer::new(&payload);
    expect_type(&mut buf, S2A_PLAYER)?;

    let count = buf.read_u8()?;
    for _ in 0..count {
        let mut player = Map::new();
        player.insert("id".into(), json!(buf.read_u8()?));
        player.insert("name".into(), json!(buf.read_cstring()?));
        player.insert("score".into(), json!(buf.read_i32_le()?));
        player.insert("time".into(), json!(buf.read_f32_le()?));
        record.add_player(player);
    }
    Ok(())
}

fn extract_rules(chunks: &[Vec<u8>], record: &mut Record) -> Result<(), QueryError> {
    let payload = assemble(chunks)?;
    let mut buf = Buffer::new(&payload);
    expect_type(&mut buf, S2A_RULES)?;

    let count = buf.read_u16_le()?;
    record.add("num_rules", count);
    for _ in 0..count {
        let key = buf.read_cstring()?;
        let value = buf.read_cstring()?;
        record.add(key, value);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn info_reply() -> Vec<u8> {
        let mut p = SINGLE.to_vec();
        p.push(S2A_INFO);
        p.push(17);
        p.extend_from_slice(b"^1Test ^7Server\0de_dust2\0cstrike\0Counter-Strike\0");
        p.extend_from_slice(&240u16.to_le_bytes());
        p.extend_from_slice(&[3, 24, 1, b'd', b'l', 0, 1]);
        p.extend_from_slice(b"1.0.0.70\0");
        p.push(0x80);
        p.extend_from_slice(&27015u16.to_le_bytes());
        p
    }

    pub(crate) fn players_reply() -> Vec<u8> {
        let mut p = SINGLE.to_vec();
        p.push(S2A_PLAYER);
        p.push(2);
        for (i, name, score, time) in [(0u8, "alice", 12i32, 3725.0f32), (1, "bob", -1, 59.5)] {
            p.push(i);
            p.extend_from_slice(name.as_bytes());
            p.push(0);
            p.extend_from_slice(&score.to_le_bytes());
            p.extend_from_slice(&time.to_le_bytes());
        }
        p
    }

    fn rules_reply() -> Vec<u8> {
        let mut p = SINGLE.to_vec();
        p.push(S2A_RULES);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(b"mp_timelimit\x0030\0sv_gravity\x00800\0");
        p
    }

    fn split(payload: &[u8], id: u32, parts: usize) -> Vec<Vec<u8>> {
        let size = payload.len().div_ceil(parts);
        payload
            .chunks(size)
            .enumerate()
            .map(|(n, piece)| {
                let mut c = SPLIT.to_vec();
                c.extend_from_slice(&id.to_le_bytes());
                c.push(parts as u8);
                c.push(n as u8);
                c.extend_from_slice(&1248u16.to_le_bytes());
                c.extend_from_slice(piece);
                c
            })
            .collect()
    }

    #[test]
    fn challenge_token() {
        let token = Source
            .parse_challenge(&[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 0x0A, 0x0B, 0x0C, 0x0D])
            .unwrap();
        assert_eq!(token, vec![0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn challenge_rejects_other_replies() {
        assert!(Source.parse_challenge(&info_reply()).is_err());
        assert!(Source.parse_challenge(&[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 1]).is_err());
        assert!(Source.parse_challenge(b"").is_err());
    }

    #[test]
    fn details() {
        let mut record = Record::new();
        extract_details(&[info_reply()], &mut record).unwrap();
        assert_eq!(record.get("hostname").unwrap(), "^1Test ^7Server");
        assert_eq!(record.get("map").unwrap(), "de_dust2");
        assert_eq!(record.get("num_players").unwrap(), 3);
        assert_eq!(record.get("max_players").unwrap(), 24);
        assert_eq!(record.get("dedicated").unwrap(), "d");
        assert_eq!(record.get("password").unwrap(), false);
        assert_eq!(record.get("secure").unwrap(), true);
        assert_eq!(record.get("game_port").unwrap(), 27015);
    }

    #[test]
    fn players() {
        let mut record = Record::new();
        extract_players(&[players_reply()], &mut record).unwrap();
        let players = record.players();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0]["name"], "alice");
        assert_eq!(players[1]["score"], -1);
    }

    #[test]
    fn rules() {
        let mut record = Record::new();
        extract_rules(&[rules_reply()], &mut record).unwrap();
        assert_eq!(record.get("mp_timelimit").unwrap(), "30");
        assert_eq!(record.get("sv_gravity").unwrap(), "800");
        assert_eq!(record.get("num_rules").unwrap(), 2);
    }

    #[test]
    fn split_replies_reassemble_out_of_order() {
        let mut chunks = split(&rules_reply(), 7, 3);
        chunks.reverse();
        let mut record = Record::new();
        extract_rules(&chunks, &mut record).unwrap();
        assert_eq!(record.get("sv_gravity").unwrap(), "800");
    }

    #[test]
    fn missing_fragment_is_malformed() {
        let mut chunks = split(&rules_reply(), 7, 3);
        chunks.remove(1);
        assert!(matches!(assemble(&chunks), Err(QueryError::Malformed(_))));
    }

    #[test]
    fn compressed_split_is_rejected() {
        let chunks = split(&rules_reply(), 7 | COMPRESSED_FLAG, 2);
        assert!(assemble(&chunks).is_err());
    }

    #[test]
    fn truncated_details_do_not_panic() {
        let reply = info_reply();
        for cut in 0..reply.len() {
            let mut record = Record::new();
            let _ = extract_details(&[reply[..cut].to_vec()], &mut record);
        }
    }
}
