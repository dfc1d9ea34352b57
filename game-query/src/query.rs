//! The query orchestrator.
//!
//! [`GameQuery`] owns the registered servers and runs one batch per call to
//! [`GameQuery::process`]:
//!
//! 1. challenge phase: every multi-mode server that needs a challenge gets
//!    one socket, all of them share one listen;
//! 2. query phase: every remaining template of every multi-mode server gets
//!    its own socket, again sharing one listen;
//! 3. linear phase: one server at a time over a single socket.
//!
//! Phases never overlap. Each record then runs through the filters in the
//! order they were added.

use crate::config::{
    resolve_address, split_host, AddressPolicy, Pacing, QueryOptions, ServerSpec,
};
use crate::error::QueryError;
use crate::filters::{Filter, FilterParams, FilterRegistry};
use crate::multiplexer::Multiplexer;
use crate::protocol::{
    ChallengeState, Endpoint, PacketMode, PacketSelector, PacketType, ProtocolInstance, Transport,
};
use crate::protocols::{Constructor, ProtocolRegistry};
use crate::record::Record;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::thread;
use std::time::{Duration, Instant};

/// A registered server and the protocol instance for the current batch.
pub struct ServerEntry {
    id: String,
    kind: String,
    constructor: Constructor,
    endpoint: Endpoint,
    options: QueryOptions,
    instance: ProtocolInstance,
}

impl ServerEntry {
    fn new(
        id: String,
        kind: String,
        constructor: Constructor,
        endpoint: Endpoint,
        options: QueryOptions,
    ) -> Self {
        let instance =
            ProtocolInstance::new(constructor(), kind.clone(), endpoint, options.clone());
        Self {
            id,
            kind,
            constructor,
            endpoint,
            options,
            instance,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn ip(&self) -> IpAddr {
        self.endpoint.ip
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn instance(&self) -> &ProtocolInstance {
        &self.instance
    }

    /// Start a new batch with untouched templates and no responses.
    fn reset(&mut self) {
        self.instance = ProtocolInstance::new(
            (self.constructor)(),
            self.kind.clone(),
            self.endpoint,
            self.options.clone(),
        );
    }
}

pub struct GameQuery {
    registry: ProtocolRegistry,
    filter_registry: FilterRegistry,
    filters: Vec<(String, Box<dyn Filter>)>,
    servers: BTreeMap<String, ServerEntry>,
    options: QueryOptions,
    pacing: Pacing,
    address_policy: AddressPolicy,
}

impl Default for GameQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl GameQuery {
    pub fn new() -> Self {
        Self::with_registry(ProtocolRegistry::default())
    }

    /// Use a custom protocol table instead of the built-in one.
    pub fn with_registry(registry: ProtocolRegistry) -> Self {
        Self {
            registry,
            filter_registry: FilterRegistry::default(),
            filters: Vec::new(),
            servers: BTreeMap::new(),
            options: QueryOptions::default(),
            pacing: Pacing::default(),
            address_policy: AddressPolicy::default(),
        }
    }

    pub fn registry_mut(&mut self) -> &mut ProtocolRegistry {
        &mut self.registry
    }

    pub fn filter_registry_mut(&mut self) -> &mut FilterRegistry {
        &mut self.filter_registry
    }

    /// Global options. Servers merge their overrides on top at registration,
    /// so this only affects servers added afterwards.
    pub fn set_options(&mut self, options: QueryOptions) {
        self.options = options;
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn set_pacing(&mut self, pacing: Pacing) {
        self.pacing = pacing;
    }

    pub fn set_address_policy(&mut self, policy: AddressPolicy) {
        self.address_policy = policy;
    }

    /// Register one server and return its id. A server with an existing id
    /// replaces the old entry.
    pub fn add_server(&mut self, spec: ServerSpec) -> Result<String, QueryError> {
        let kind = spec
            .kind
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| QueryError::Configuration("server is missing 'type'".into()))?;
        let host = spec
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| QueryError::Configuration("server is missing 'host'".into()))?;
        let id = spec
            .id
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| host.clone());

        let constructor = self.registry.constructor(&kind)?;
        let options = self.options.merged(&spec.options);
        let (address, port) = split_host(&host)?;
        let ip = resolve_address(&address, self.address_policy)?;

        let protocol = constructor();
        let client_port = port.unwrap_or_else(|| protocol.default_port());
        let query_port = options
            .query_port
            .unwrap_or_else(|| protocol.query_port(client_port));
        let endpoint = Endpoint {
            ip,
            port: query_port,
            client_port,
        };

        debug!(
            "registered {} as {} at {}:{} (client port {})",
            id, kind, ip, query_port, client_port
        );
        let entry = ServerEntry::new(id.clone(), kind, constructor, endpoint, options);
        if self.servers.insert(id.clone(), entry).is_some() {
            debug!("server {} replaced an earlier registration", id);
        }
        Ok(id)
    }

    /// Register several servers, stopping at the first invalid one. Servers
    /// before it stay registered.
    pub fn add_servers(
        &mut self,
        specs: impl IntoIterator<Item = ServerSpec>,
    ) -> Result<Vec<String>, QueryError> {
        specs.into_iter().map(|spec| self.add_server(spec)).collect()
    }

    pub fn clear_servers(&mut self) {
        self.servers.clear();
    }

    pub fn server_ids(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn server(&self, id: &str) -> Option<&ServerEntry> {
        self.servers.get(id)
    }

    /// Add a filter by name. Adding a name that is already active swaps the
    /// instance in place, keeping its position in the pipeline.
    pub fn add_filter(&mut self, name: &str, params: &FilterParams) -> Result<(), QueryError> {
        let key = name.to_lowercase();
        let filter = self.filter_registry.create(&key, params)?;
        match self.filters.iter_mut().find(|(n, _)| *n == key) {
            Some(slot) => slot.1 = filter,
            None => self.filters.push((key, filter)),
        }
        Ok(())
    }

    /// Returns whether a filter of that name was active.
    pub fn remove_filter(&mut self, name: &str) -> bool {
        let key = name.to_lowercase();
        let before = self.filters.len();
        self.filters.retain(|(n, _)| *n != key);
        self.filters.len() != before
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|(n, _)| n.as_str())
    }

    /// Query every registered server and return one record per server id.
    ///
    /// Network trouble never fails the batch: an unreachable or silent
    /// server comes back with `online = false`.
    pub fn process(&mut self) -> BTreeMap<String, Record> {
        if self.servers.is_empty() {
            return BTreeMap::new();
        }
        let started = Instant::now();
        for entry in self.servers.values_mut() {
            entry.reset();
        }

        let mut challenge = Vec::new();
        let mut multi = Vec::new();
        let mut linear = Vec::new();
        for (id, entry) in &self.servers {
            match entry.instance.packet_mode() {
                PacketMode::Multi if entry.instance.has_challenge() => challenge.push(id.clone()),
                PacketMode::Multi => multi.push(id.clone()),
                PacketMode::Linear => linear.push(id.clone()),
            }
        }
        debug!(
            "batch: {} challenge, {} plain multi, {} linear",
            challenge.len(),
            multi.len(),
            linear.len()
        );

        if !challenge.is_empty() {
            self.challenge_phase(&challenge);
        }
        multi.extend(challenge);
        if !multi.is_empty() {
            self.query_phase(&multi);
        }
        for id in &linear {
            self.linear_exchange(id);
        }

        let results = self.collect();
        info!(
            "queried {} server(s), {} online, in {:?}",
            results.len(),
            results.values().filter(|r| r.online()).count(),
            started.elapsed()
        );
        results
    }

    fn collect(&self) -> BTreeMap<String, Record> {
        self.servers
            .iter()
            .map(|(id, entry)| {
                let mut record = entry.instance.process_response();
                if !entry.options.raw {
                    for (_, filter) in &self.filters {
                        record = filter.apply(record, &entry.instance);
                    }
                }
                (id.clone(), record)
            })
            .collect()
    }

    fn challenge_phase(&mut self, ids: &[String]) {
        let mut mux = Multiplexer::new();
        let mut budget = Duration::ZERO;

        for id in ids {
            let Some(entry) = self.servers.get_mut(id) else {
                continue;
            };
            let instance = &mut entry.instance;
            let Some(packet) = instance.challenge_packet() else {
                continue;
            };
            budget = budget.max(instance.options().timeout());

            if !mux.is_empty() {
                thread::sleep(self.pacing.challenge);
            }
            let conn = match Multiplexer::open(instance, false) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("{}: challenge skipped: {}", id, e);
                    continue;
                }
            };
            let sid = mux.register(conn, id, PacketType::Challenge);
            match mux.send(sid, &packet) {
                Ok(()) => instance.mark_challenge_sent(),
                Err(e) => warn!("{}: challenge send failed: {}", id, e),
            }
        }

        if mux.is_empty() {
            return;
        }
        for (sid, chunks) in mux.listen(budget) {
            let Some((server, _)) = mux.route(sid) else {
                continue;
            };
            let Some(first) = chunks.into_iter().next() else {
                continue;
            };
            let Some(entry) = self.servers.get_mut(server) else {
                continue;
            };
            entry.instance.set_challenge_response(first);
        }
        mux.close();

        for id in ids {
            let Some(entry) = self.servers.get_mut(id) else {
                continue;
            };
            if let Err(e) = entry.instance.challenge_verify_and_parse() {
                warn!("{}: {}", id, e);
            }
        }
    }

    fn query_phase(&mut self, ids: &[String]) {
        let mut mux = Multiplexer::new();
        let mut budget = Duration::ZERO;

        for id in ids {
            let Some(entry) = self.servers.get_mut(id) else {
                continue;
            };
            let instance = &mut entry.instance;
            instance.before_send();
            budget = budget.max(instance.options().timeout());

            for (packet, bytes) in instance.packets(&PacketSelector::AllExceptChallenge) {
                if !mux.is_empty() {
                    thread::sleep(self.pacing.query);
                }
                let conn = match Multiplexer::open(instance, false) {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("{}: {} skipped: {}", id, packet, e);
                        break;
                    }
                };
                let sid = mux.register(conn, id, packet);
                if let Err(e) = mux.send(sid, &bytes) {
                    warn!("{}: {} send failed: {}", id, packet, e);
                }
            }
        }

        if mux.is_empty() {
            return;
        }
        for (sid, chunks) in mux.listen(budget) {
            let Some((server, packet)) = mux.route(sid) else {
                continue;
            };
            if let Some(entry) = self.servers.get_mut(server) {
                for chunk in chunks {
                    entry.instance.packet_response(packet, chunk);
                }
            }
        }
        mux.close();
    }

    /// Challenge and query one linear-mode server over a single socket.
    fn linear_exchange(&mut self, id: &str) {
        let Some(entry) = self.servers.get_mut(id) else {
            return;
        };
        let instance = &mut entry.instance;
        let started = Instant::now();

        let conn = match Multiplexer::open(instance, true) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("{}: {}", id, e);
                return;
            }
        };
        let mut mux = Multiplexer::new();
        let sid = mux.register(conn, id, PacketType::Challenge);

        if let Some(challenge) = instance.challenge_packet() {
            match mux.send(sid, &challenge) {
                Ok(()) => {
                    instance.mark_challenge_sent();
                    if let Some(conn) = mux.connection_mut(sid) {
                        match conn.read_once() {
                            Ok(Some(raw)) => instance.set_challenge_response(raw),
                            Ok(None) => {}
                            Err(e) => debug!("{}: challenge read failed: {}", id, e),
                        }
                    }
                }
                Err(e) => warn!("{}: challenge send failed: {}", id, e),
            }
            if let Err(e) = instance.challenge_verify_and_parse() {
                warn!("{}: {}", id, e);
            }
        }

        instance.before_send();
        let budget = instance.options().timeout();

        for (packet, bytes) in instance.packets(&PacketSelector::AllExceptChallenge) {
            mux.retarget(sid, packet);
            if let Err(e) = mux.send(sid, &bytes) {
                warn!("{}: {} send failed: {}", id, packet, e);
                break;
            }
            match instance.transport() {
                Transport::Tcp => {
                    let Some(conn) = mux.connection_mut(sid) else {
                        break;
                    };
                    let data = conn.read_stream(|data| instance.stream_complete(&bytes, data));
                    if !data.is_empty() {
                        instance.packet_response(packet, data);
                    }
                }
                Transport::Udp => {
                    if let Some(conn) = mux.connection_mut(sid) {
                        if let Err(e) = conn.set_nonblocking(true) {
                            warn!("{}: {}", id, e);
                            break;
                        }
                    }
                    for (_, chunks) in mux.listen(budget) {
                        for chunk in chunks {
                            instance.packet_response(packet, chunk);
                        }
                    }
                }
            }
        }
        mux.close();

        if matches!(instance.challenge_state(), ChallengeState::Failed(_)) {
            debug!("{}: linear exchange finished without a challenge token", id);
        }
        debug!("{}: linear exchange took {:?}", id, started.elapsed());
    }
}
