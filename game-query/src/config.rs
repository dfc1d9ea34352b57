//! Query options, server specs and the host/address rules applied at
//! registration time.

use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

/// Shared multiplexer budget when no `timeout` option is given.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;

/// Delay between challenge sends in the multi-mode challenge phase.
pub const CHALLENGE_SEND_INTERVAL: Duration = Duration::from_millis(200);

/// Delay between packet sends in the multi-mode query phase.
pub const QUERY_SEND_INTERVAL: Duration = Duration::from_millis(50);

/// Options recognised globally and per server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Log decoder errors loudly and list them under `errors` in the record.
    pub debug: bool,
    /// Skip the filter pipeline.
    pub raw: bool,
    /// Budget for one listen phase, in whole seconds.
    pub timeout: u64,
    /// Explicit query port, overriding the host port and protocol defaults.
    pub query_port: Option<u16>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            debug: false,
            raw: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            query_port: None,
        }
    }
}

impl QueryOptions {
    /// Apply per-server overrides on top of these options. Overrides win.
    pub fn merged(&self, overrides: &OptionOverrides) -> QueryOptions {
        QueryOptions {
            debug: overrides.debug.unwrap_or(self.debug),
            raw: overrides.raw.unwrap_or(self.raw),
            timeout: overrides.timeout.unwrap_or(self.timeout),
            query_port: overrides.query_port.or(self.query_port),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Per-socket read timeout. A zero duration is rejected by the OS, so the
    /// floor is one millisecond.
    pub fn read_timeout(&self) -> Duration {
        self.timeout().max(Duration::from_millis(1))
    }
}

/// Per-server option overrides. Unset fields inherit the global value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionOverrides {
    pub debug: Option<bool>,
    pub raw: Option<bool>,
    pub timeout: Option<u64>,
    pub query_port: Option<u16>,
}

/// One server registration.
///
/// `kind` and `host` are required; they are optional here so a spec loaded
/// from JSON can be rejected with a proper configuration error instead of a
/// deserialisation failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSpec {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub host: Option<String>,
    pub id: Option<String>,
    pub options: OptionOverrides,
}

impl ServerSpec {
    pub fn new(kind: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            host: Some(host.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_options(mut self, options: OptionOverrides) -> Self {
        self.options = options;
        self
    }
}

/// Send pacing for the multi-mode phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub challenge: Duration,
    pub query: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            challenge: CHALLENGE_SEND_INTERVAL,
            query: QUERY_SEND_INTERVAL,
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            challenge: Duration::ZERO,
            query: Duration::ZERO,
        }
    }
}

/// Which literal IP addresses registration accepts without a DNS lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressPolicy {
    /// Any literal address, including loopback and private ranges.
    Any,
    /// Reject loopback, private, link-local and unspecified literals.
    #[default]
    PublicOnly,
}

/// Split `address[:port]`, `[v6]:port` or a bare IPv6 literal.
pub fn split_host(host: &str) -> Result<(String, Option<u16>), QueryError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(QueryError::Configuration("host is empty".into()));
    }

    if let Some(rest) = host.strip_prefix('[') {
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| QueryError::Configuration(format!("unterminated '[' in {}", host)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p, host)?),
            None if tail.is_empty() => None,
            None => {
                return Err(QueryError::Configuration(format!(
                    "unexpected trailing data in {}",
                    host
                )))
            }
        };
        return Ok((addr.to_string(), port));
    }

    match host.matches(':').count() {
        0 => Ok((host.to_string(), None)),
        1 => {
            let (addr, port) = host.split_once(':').unwrap_or((host, ""));
            if addr.is_empty() {
                return Err(QueryError::Configuration(format!("missing address in {}", host)));
            }
            Ok((addr.to_string(), Some(parse_port(port, host)?)))
        }
        // Bare IPv6 literal.
        _ => Ok((host.to_string(), None)),
    }
}

fn parse_port(port: &str, host: &str) -> Result<u16, QueryError> {
    port.parse::<u16>()
        .map_err(|_| QueryError::Configuration(format!("invalid port '{}' in {}", port, host)))
}

/// Resolve an address to an IP, trying the literal form first and falling
/// back to a forward DNS lookup (IPv4 answers preferred).
pub fn resolve_address(address: &str, policy: AddressPolicy) -> Result<IpAddr, QueryError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        if policy == AddressPolicy::Any || is_public(&ip) {
            return Ok(ip);
        }
        // A lookup on a literal only hands the same literal back.
        return Err(QueryError::Configuration(format!(
            "address {} is not publicly routable",
            address
        )));
    }

    let resolved: Vec<IpAddr> = (address, 0)
        .to_socket_addrs()
        .map_err(|e| QueryError::Configuration(format!("cannot resolve {}: {}", address, e)))?
        .map(|sa| sa.ip())
        .collect();

    resolved
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| QueryError::Configuration(format!("cannot resolve {}", address)))
}

pub fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            let unique_local = first & 0xfe00 == 0xfc00;
            let link_local = first & 0xffc0 == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}
