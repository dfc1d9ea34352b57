//! The protocol contract.
//!
//! A game protocol is data plus a few hooks: the packet templates it sends,
//! how it decodes a challenge token, and an ordered chain of extractors that
//! turn raw responses into a [`Record`]. [`ProtocolInstance`] wraps one
//! [`Protocol`] with the per-server state of a single query batch: the
//! endpoint, the merged options, the templates (rewritten once a challenge
//! verifies), the response accumulator and the challenge state.
//!
//! ```text
//!  Pending ──send──▶ Sent ──bytes──▶ Received ──parse──▶ Verified
//!     │                │                 │
//!     └────────────────┴─────────────────┴──────────────▶ Failed
//! ```

use crate::config::QueryOptions;
use crate::error::QueryError;
use crate::record::Record;
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Marker inside a template where the challenge token is spliced in.
pub const CHALLENGE_PLACEHOLDER: &[u8] = b"%s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Whether packets may be fanned out over the multiplexer or must be driven
/// one server at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketMode {
    Multi,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketType {
    Challenge,
    Basic,
    Details,
    Info,
    Status,
    Players,
    Rules,
    Teams,
    Channels,
    Version,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Challenge => "challenge",
            PacketType::Basic => "basic",
            PacketType::Details => "details",
            PacketType::Info => "info",
            PacketType::Status => "status",
            PacketType::Players => "players",
            PacketType::Rules => "rules",
            PacketType::Teams => "teams",
            PacketType::Channels => "channels",
            PacketType::Version => "version",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request template. Templates holding [`CHALLENGE_PLACEHOLDER`] wait for
/// a verified challenge token and are withheld from sending until then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketTemplate {
    bytes: Vec<u8>,
    awaiting_challenge: bool,
}

impl PacketTemplate {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let awaiting_challenge = find(&bytes, CHALLENGE_PLACEHOLDER).is_some();
        Self {
            bytes,
            awaiting_challenge,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn awaiting_challenge(&self) -> bool {
        self.awaiting_challenge
    }

    /// A template sent as-is, even if its bytes happen to hold the
    /// placeholder.
    pub fn literal(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            awaiting_challenge: false,
        }
    }

    /// Replace the template body. A template that already received its token
    /// never waits for one again.
    pub fn set_bytes(&mut self, bytes: impl Into<Vec<u8>>) {
        self.bytes = bytes.into();
        self.awaiting_challenge =
            self.awaiting_challenge && find(&self.bytes, CHALLENGE_PLACEHOLDER).is_some();
    }

    /// Splice `token` over the placeholder. Happens at most once.
    fn substitute(&mut self, token: &[u8]) -> bool {
        if !self.awaiting_challenge {
            return false;
        }
        let Some(at) = find(&self.bytes, CHALLENGE_PLACEHOLDER) else {
            return false;
        };
        self.bytes
            .splice(at..at + CHALLENGE_PLACEHOLDER.len(), token.iter().copied());
        self.awaiting_challenge = false;
        true
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub type PacketSet = BTreeMap<PacketType, PacketTemplate>;

/// Which templates to fetch from an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketSelector {
    One(PacketType),
    Many(Vec<PacketType>),
    AllExceptChallenge,
    All,
}

impl PacketSelector {
    fn matches(&self, packet: PacketType) -> bool {
        match self {
            PacketSelector::One(p) => *p == packet,
            PacketSelector::Many(list) => list.contains(&packet),
            PacketSelector::AllExceptChallenge => packet != PacketType::Challenge,
            PacketSelector::All => true,
        }
    }
}

/// Where a server lives. `port` is the query port; `client_port` is the
/// port players connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub client_port: u16,
}

pub type ExtractFn = fn(&[Vec<u8>], &mut Record) -> Result<(), QueryError>;

/// One link of the extraction chain: decode the chunks collected for
/// `packet` into the record.
#[derive(Clone, Copy)]
pub struct Extraction {
    pub packet: PacketType,
    pub extract: ExtractFn,
}

impl Extraction {
    pub fn new(packet: PacketType, extract: ExtractFn) -> Self {
        Self { packet, extract }
    }
}

/// Mapping from protocol field names onto the common `gq_*` names used by
/// the `normalise` filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalize {
    pub general: &'static [(&'static str, &'static str)],
    pub player: &'static [(&'static str, &'static str)],
    pub team: &'static [(&'static str, &'static str)],
}

pub trait Protocol: Send {
    /// Family identifier, e.g. `source`.
    fn protocol(&self) -> &'static str;

    fn name_long(&self) -> &'static str;

    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn packet_mode(&self) -> PacketMode {
        PacketMode::Multi
    }

    /// Client port used when the host string carries none.
    fn default_port(&self) -> u16;

    /// Query port for a server whose players connect on `client_port`.
    fn query_port(&self, client_port: u16) -> u16 {
        client_port
    }

    fn packets(&self) -> Vec<(PacketType, Vec<u8>)>;

    /// Decode a challenge reply into the token spliced into templates.
    fn parse_challenge(&self, _raw: &[u8]) -> Result<Vec<u8>, QueryError> {
        Err(QueryError::Challenge(format!(
            "{} does not use a challenge",
            self.protocol()
        )))
    }

    /// Last chance to rewrite templates before the query phase.
    fn before_send(&mut self, _endpoint: &Endpoint, _packets: &mut PacketSet) {}

    fn extraction_chain(&self) -> Vec<Extraction>;

    /// For stream transports: true once `data` holds the full reply to
    /// `packet`, so the read can stop before the timeout.
    fn stream_complete(&self, _packet: &[u8], _data: &[u8]) -> bool {
        false
    }

    fn normalize(&self) -> Normalize {
        Normalize::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeState {
    NotRequired,
    Pending,
    Sent,
    Received,
    Verified,
    Failed(String),
}

/// A protocol bound to one server for one batch.
pub struct ProtocolInstance {
    protocol: Box<dyn Protocol>,
    type_name: String,
    endpoint: Endpoint,
    options: QueryOptions,
    packets: PacketSet,
    responses: BTreeMap<PacketType, Vec<Vec<u8>>>,
    challenge_state: ChallengeState,
    challenge_raw: Vec<u8>,
    challenge_token: Option<Vec<u8>>,
}

impl ProtocolInstance {
    pub fn new(
        protocol: Box<dyn Protocol>,
        type_name: impl Into<String>,
        endpoint: Endpoint,
        options: QueryOptions,
    ) -> Self {
        let raw = protocol.packets();
        let needs_challenge = raw.iter().any(|(kind, _)| *kind == PacketType::Challenge);
        // Without a challenge packet nothing would ever fill a placeholder.
        let packets: PacketSet = raw
            .into_iter()
            .map(|(kind, bytes)| {
                let template = if needs_challenge {
                    PacketTemplate::new(bytes)
                } else {
                    PacketTemplate::literal(bytes)
                };
                (kind, template)
            })
            .collect();
        let challenge_state = if needs_challenge {
            ChallengeState::Pending
        } else {
            ChallengeState::NotRequired
        };
        Self {
            protocol,
            type_name: type_name.into(),
            endpoint,
            options,
            packets,
            responses: BTreeMap::new(),
            challenge_state,
            challenge_raw: Vec::new(),
            challenge_token: None,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.endpoint.ip
    }

    /// Query port.
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn client_port(&self) -> u16 {
        self.endpoint.client_port
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> Transport {
        self.protocol.transport()
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn packet_mode(&self) -> PacketMode {
        self.protocol.packet_mode()
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol.protocol()
    }

    pub fn name_long(&self) -> &'static str {
        self.protocol.name_long()
    }

    /// Registry key this server was declared with.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn normalize(&self) -> Normalize {
        self.protocol.normalize()
    }

    pub fn has_challenge(&self) -> bool {
        self.packets.contains_key(&PacketType::Challenge)
    }

    /// Templates matching `selector`, in packet-type order. Templates still
    /// waiting for a challenge token are withheld, except the challenge
    /// packet itself.
    pub fn packets(&self, selector: &PacketSelector) -> Vec<(PacketType, Vec<u8>)> {
        self.packets
            .iter()
            .filter(|(kind, _)| selector.matches(**kind))
            .filter(|(kind, template)| {
                **kind == PacketType::Challenge || !template.awaiting_challenge()
            })
            .map(|(kind, template)| (*kind, template.bytes().to_vec()))
            .collect()
    }

    pub fn challenge_packet(&self) -> Option<Vec<u8>> {
        self.packets
            .get(&PacketType::Challenge)
            .map(|t| t.bytes().to_vec())
    }

    pub fn challenge_state(&self) -> &ChallengeState {
        &self.challenge_state
    }

    pub fn challenge_token(&self) -> Option<&[u8]> {
        self.challenge_token.as_deref()
    }

    pub fn mark_challenge_sent(&mut self) {
        if self.challenge_state == ChallengeState::Pending {
            self.challenge_state = ChallengeState::Sent;
        }
    }

    pub fn challenge_response(&self) -> &[u8] {
        &self.challenge_raw
    }

    pub fn set_challenge_response(&mut self, raw: impl Into<Vec<u8>>) {
        self.challenge_raw = raw.into();
        if !self.challenge_raw.is_empty() {
            self.challenge_state = ChallengeState::Received;
        }
    }

    /// Decode the recorded challenge reply and splice the token into every
    /// template waiting for it. A second call after success is a no-op.
    pub fn challenge_verify_and_parse(&mut self) -> Result<(), QueryError> {
        if self.challenge_state == ChallengeState::Verified {
            return Ok(());
        }
        if self.challenge_raw.is_empty() {
            return Err(self.fail_challenge("no challenge response received".into()));
        }

        let token = match self.protocol.parse_challenge(&self.challenge_raw) {
            Ok(token) => token,
            Err(QueryError::Challenge(reason)) => return Err(self.fail_challenge(reason)),
            Err(e) => return Err(self.fail_challenge(e.to_string())),
        };

        let mut rewritten = 0;
        for template in self.packets.values_mut() {
            if template.substitute(&token) {
                rewritten += 1;
            }
        }
        debug!(
            "{} {}: challenge verified, {} template(s) rewritten",
            self.protocol(),
            self.endpoint.ip,
            rewritten
        );
        self.challenge_token = Some(token);
        self.challenge_state = ChallengeState::Verified;
        Ok(())
    }

    fn fail_challenge(&mut self, reason: String) -> QueryError {
        self.challenge_state = ChallengeState::Failed(reason.clone());
        QueryError::Challenge(reason)
    }

    /// Append one raw chunk for `packet`. Earlier chunks are kept.
    pub fn packet_response(&mut self, packet: PacketType, raw: impl Into<Vec<u8>>) {
        self.responses.entry(packet).or_default().push(raw.into());
    }

    pub fn responses(&self, packet: PacketType) -> &[Vec<u8>] {
        self.responses.get(&packet).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn before_send(&mut self) {
        self.protocol.before_send(&self.endpoint, &mut self.packets);
    }

    pub fn stream_complete(&self, packet: &[u8], data: &[u8]) -> bool {
        self.protocol.stream_complete(packet, data)
    }

    /// Run the extraction chain and synthesise the always-present fields.
    /// Missing responses and decoder errors never escape; a server that
    /// yielded nothing is reported with `online = false`.
    pub fn process_response(&self) -> Record {
        let mut record = Record::new();
        let mut errors = Vec::new();

        for step in self.protocol.extraction_chain() {
            let chunks = self.responses(step.packet);
            if chunks.is_empty() {
                continue;
            }
            if let Err(e) = (step.extract)(chunks, &mut record) {
                if self.options.debug {
                    warn!(
                        "{} {}: {} extraction failed: {}",
                        self.protocol(),
                        self.ip(),
                        step.packet,
                        e
                    );
                } else {
                    debug!(
                        "{} {}: {} extraction failed: {}",
                        self.protocol(),
                        self.ip(),
                        step.packet,
                        e
                    );
                }
                errors.push(format!("{}: {}", step.packet, e));
            }
        }

        let online = !record.is_empty();
        record.add("online", online);
        record.add("address", self.ip().to_string());
        record.add("port", self.port());
        record.add("port_client", self.client_port());
        record.add("protocol", self.protocol());
        record.add("type", self.type_name.clone());
        record.add("name_long", self.name_long());
        record.add("transport", self.transport().to_string());
        if self.options.debug && !errors.is_empty() {
            record.add("errors", errors);
        }
        record
    }
}

impl fmt::Debug for ProtocolInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProtocolInstance")
            .field("protocol", &self.protocol())
            .field("type_name", &self.type_name)
            .field("endpoint", &self.endpoint)
            .field("challenge_state", &self.challenge_state)
            .finish()
    }
}
