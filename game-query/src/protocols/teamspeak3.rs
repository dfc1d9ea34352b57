//! TeamSpeak 3 ServerQuery over TCP.
//!
//! The query interface listens on a fixed port and fronts every virtual
//! server on the host, so each request first selects the virtual server by
//! its client port. Replies are line based (`\n\r` terminated) and every
//! command ends with an `error id=N msg=...` line.

use crate::error::QueryError;
use crate::protocol::{
    Endpoint, Extraction, Normalize, PacketMode, PacketSet, PacketType, Protocol, Transport,
};
use crate::record::Record;
use serde_json::{Map, Value};

pub const QUERY_PORT: u16 = 10011;

const PORT_PLACEHOLDER: &str = "{port}";
const LINE_END: &str = "\n\r";
const ERROR_PREFIX: &str = "error id=";

pub struct Teamspeak3;

impl Teamspeak3 {
    pub fn boxed() -> Box<dyn Protocol> {
        Box::new(Teamspeak3)
    }
}

impl Protocol for Teamspeak3 {
    fn protocol(&self) -> &'static str {
        "teamspeak3"
    }

    fn name_long(&self) -> &'static str {
        "TeamSpeak 3"
    }

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn packet_mode(&self) -> PacketMode {
        PacketMode::Linear
    }

    fn default_port(&self) -> u16 {
        9987
    }

    fn query_port(&self, _client_port: u16) -> u16 {
        QUERY_PORT
    }

    fn packets(&self) -> Vec<(PacketType, Vec<u8>)> {
        vec![
            (PacketType::Details, b"use port={port}\nserverinfo\n".to_vec()),
            (PacketType::Players, b"use port={port}\nclientlist\n".to_vec()),
            (
                PacketType::Channels,
                b"use port={port}\nchannellist -topic\n".to_vec(),
            ),
        ]
    }

    fn before_send(&mut self, endpoint: &Endpoint, packets: &mut PacketSet) {
        let port = endpoint.client_port.to_string();
        for template in packets.values_mut() {
            let text = String::from_utf8_lossy(template.bytes()).replace(PORT_PLACEHOLDER, &port);
            template.set_bytes(text.into_bytes());
        }
    }

    fn extraction_chain(&self) -> Vec<Extraction> {
        vec![
            Extraction::new(PacketType::Details, extract_details),
            Extraction::new(PacketType::Players, extract_players),
            Extraction::new(PacketType::Channels, extract_channels),
        ]
    }

    /// One `error id=` line comes back per command sent.
    fn stream_complete(&self, packet: &[u8], data: &[u8]) -> bool {
        let commands = packet.iter().filter(|&&b| b == b'\n').count();
        let text = String::from_utf8_lossy(data);
        text.matches(ERROR_PREFIX).count() >= commands && text.ends_with(LINE_END)
    }

    fn normalize(&self) -> Normalize {
        Normalize {
            general: &[
                ("hostname", "virtualserver_name"),
                ("maxplayers", "virtualserver_maxclients"),
                ("numplayers", "virtualserver_clientsonline"),
                ("password", "virtualserver_flag_password"),
            ],
            player: &[("name", "client_nickname"), ("team", "cid")],
            team: &[("id", "cid"), ("name", "channel_name")],
        }
    }
}

/// Split a reply into its item lists, dropping the banner and acknowledgements.
/// A non-zero error id fails the whole reply.
fn items(chunks: &[Vec<u8>]) -> Result<Vec<Map<String, Value>>, QueryError> {
    let joined: Vec<u8> = chunks.concat();
    let text = String::from_utf8_lossy(&joined);

    let mut out = Vec::new();
    for line in text.split(LINE_END).map(str::trim) {
        if line.is_empty() || line == "TS3" || line.starts_with("Welcome") {
            continue;
        }
        if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
            let id = rest.split(' ').next().unwrap_or_default();
            if id != "0" {
                return Err(QueryError::Malformed(format!("server query error: {}", line)));
            }
            continue;
        }
        out.extend(line.split('|').map(parse_item));
    }
    Ok(out)
}

fn parse_item(item: &str) -> Map<String, Value> {
    item.split(' ')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), typed(&unescape(v))),
            None => (pair.to_string(), Value::String(String::new())),
        })
        .collect()
}

fn typed(value: &str) -> Value {
    match value.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(value),
    }
}

pub(crate) fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('p') => out.push('|'),
            Some('/') => out.push('/'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn extract_details(chunks: &[Vec<u8>], record: &mut Record) -> Result<(), QueryError> {
    for item in items(chunks)? {
        for (key, value) in item {
            record.add(key, value);
        }
    }
    Ok(())
}

fn extract_players(chunks: &[Vec<u8>], record: &mut Record) -> Result<(), QueryError> {
    for item in items(chunks)? {
        // Type 1 is another ServerQuery session.
        if item.get("client_type").and_then(Value::as_i64) == Some(0) {
            record.add_player(item);
        }
    }
    Ok(())
}

fn extract_channels(chunks: &[Vec<u8>], record: &mut Record) -> Result<(), QueryError> {
    for item in items(chunks)? {
        record.add_team(item);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::PacketTemplate;

    pub(crate) const BANNER: &str = "TS3\n\rWelcome to the TeamSpeak 3 ServerQuery interface.\n\r";
    pub(crate) const OK: &str = "error id=0 msg=ok\n\r";

    pub(crate) fn serverinfo() -> String {
        let fields = [
            "virtualserver_name=Friday\\sNight",
            "virtualserver_clientsonline=3",
            "virtualserver_maxclients=32",
            "virtualserver_flag_password=0",
        ];
        format!("{OK}{}\n\r{OK}", fields.join(" "))
    }

    pub(crate) fn clientlist() -> String {
        let clients = [
            "clid=1 cid=4 client_nickname=alice client_type=0",
            "clid=2 cid=4 client_nickname=serveradmin client_type=1",
            "clid=3 cid=5 client_nickname=b\\sb client_type=0",
        ];
        format!("{OK}{}\n\r{OK}", clients.join("|"))
    }

    #[test]
    fn before_send_selects_the_virtual_server() {
        let endpoint = Endpoint {
            ip: "192.0.2.9".parse().unwrap(),
            port: QUERY_PORT,
            client_port: 9988,
        };
        let mut packets: PacketSet = Teamspeak3
            .packets()
            .into_iter()
            .map(|(k, v)| (k, PacketTemplate::new(v)))
            .collect();
        Teamspeak3.before_send(&endpoint, &mut packets);
        assert_eq!(
            packets[&PacketType::Details].bytes(),
            b"use port=9988\nserverinfo\n"
        );
    }

    #[test]
    fn fixed_query_port() {
        assert_eq!(Teamspeak3.query_port(9987), QUERY_PORT);
        assert_eq!(Teamspeak3.query_port(1), QUERY_PORT);
    }

    #[test]
    fn stream_completion_counts_error_lines() {
        let packet = b"use port=9987\nserverinfo\n";
        assert!(!Teamspeak3.stream_complete(packet, BANNER.as_bytes()));
        assert!(!Teamspeak3.stream_complete(packet, OK.as_bytes()));
        let full = format!("{BANNER}{}", serverinfo());
        assert!(Teamspeak3.stream_complete(packet, full.as_bytes()));
        assert!(!Teamspeak3.stream_complete(packet, &full.as_bytes()[..full.len() - 1]));
    }

    #[test]
    fn details_are_unescaped_and_typed() {
        let mut record = Record::new();
        let chunks = vec![BANNER.as_bytes().to_vec(), serverinfo().into_bytes()];
        extract_details(&chunks, &mut record).unwrap();
        assert_eq!(record.get("virtualserver_name").unwrap(), "Friday Night");
        assert_eq!(record.get("virtualserver_clientsonline").unwrap(), 3);
        assert!(!record.contains("error"));
    }

    #[test]
    fn query_clients_are_not_players() {
        let mut record = Record::new();
        extract_players(&[clientlist().into_bytes()], &mut record).unwrap();
        let names: Vec<_> = record
            .players()
            .iter()
            .map(|p| p["client_nickname"].clone())
            .collect();
        assert_eq!(names, vec![Value::from("alice"), Value::from("b b")]);
    }

    #[test]
    fn channels_become_teams() {
        let reply =
            format!("{OK}cid=4 channel_name=Lobby|cid=5 channel_name=AFK\\p\\sidle\n\r{OK}");
        let mut record = Record::new();
        extract_channels(&[reply.into_bytes()], &mut record).unwrap();
        let teams = record.get("teams").unwrap().as_array().unwrap();
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[1]["channel_name"], "AFK| idle");
    }

    #[test]
    fn error_reply_is_malformed() {
        let reply = "error id=1024 msg=invalid\\sserverID\n\r";
        let mut record = Record::new();
        let err = extract_details(&[reply.as_bytes().to_vec()], &mut record).unwrap_err();
        assert!(matches!(err, QueryError::Malformed(_)));
    }

    #[test]
    fn unescapes() {
        assert_eq!(unescape("a\\sb\\/c\\\\d\\pe"), "a b/c\\d|e");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }
}
