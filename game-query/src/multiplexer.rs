//! Socket multiplexer: one table of sockets per request phase, and a single
//! bounded polling loop that collects whatever arrives on any of them.
//!
//! Every socket is registered against exactly one (server id, packet type)
//! pair under a monotonic [`SocketId`]. [`Multiplexer::listen`] is the only
//! place the crate waits on the network for a phase; sockets that stay quiet
//! for the whole budget are simply missing from its result.

use crate::error::QueryError;
use crate::protocol::{PacketType, ProtocolInstance, Transport};
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

/// Upper bound for a single read.
pub const READ_CHUNK: usize = 8192;

/// Pause between polls so a chatty socket cannot spin the loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(u64);

/// A connected UDP socket or TCP stream.
#[derive(Debug)]
pub enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl Connection {
    /// Open a socket of `transport` to `addr`. UDP sockets are bound to an
    /// ephemeral local port and connected so only `addr` can answer; TCP
    /// connects with `read_timeout` as the connect timeout.
    pub fn open(
        addr: SocketAddr,
        transport: Transport,
        read_timeout: Duration,
        blocking: bool,
    ) -> Result<Self, QueryError> {
        let fail = |e: io::Error| QueryError::transport(addr, e);
        let domain = Domain::for_address(addr);

        let socket = match transport {
            Transport::Udp => {
                let socket =
                    Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(fail)?;
                let local: SocketAddr = if addr.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                socket.bind(&local.into()).map_err(fail)?;
                socket.connect(&addr.into()).map_err(fail)?;
                socket
            }
            Transport::Tcp => {
                let socket =
                    Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(fail)?;
                socket
                    .connect_timeout(&addr.into(), read_timeout)
                    .map_err(fail)?;
                socket
            }
        };
        socket.set_read_timeout(Some(read_timeout)).map_err(fail)?;
        socket.set_write_timeout(Some(read_timeout)).map_err(fail)?;
        socket.set_nonblocking(!blocking).map_err(fail)?;

        Ok(match transport {
            Transport::Udp => Connection::Udp(socket.into()),
            Transport::Tcp => Connection::Tcp(socket.into()),
        })
    }

    pub fn transport(&self) -> Transport {
        match self {
            Connection::Udp(_) => Transport::Udp,
            Connection::Tcp(_) => Transport::Tcp,
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Connection::Udp(s) => s.set_nonblocking(nonblocking),
            Connection::Tcp(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Connection::Udp(s) => s.send(bytes).map(|_| ()),
            Connection::Tcp(s) => {
                s.write_all(bytes)?;
                s.flush()
            }
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Udp(s) => s.recv(buf),
            Connection::Tcp(s) => s.read(buf),
        }
    }

    /// One bounded read, honouring the socket's read timeout. `None` when
    /// nothing arrived in time.
    pub fn read_once(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; READ_CHUNK];
        match self.recv(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if is_quiet(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a stream until the peer closes it, the read timeout fires, or
    /// `complete` accepts what has been collected.
    pub fn read_stream(&mut self, mut complete: impl FnMut(&[u8]) -> bool) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match self.recv(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&buf[..n]);
                    if complete(&data) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_quiet(&e) => break,
                Err(e) => {
                    debug!("stream read ended: {}", e);
                    break;
                }
            }
        }
        data
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for Connection {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        match self {
            Connection::Udp(s) => s.as_raw_fd(),
            Connection::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// Nothing to read right now; not a failure.
fn is_quiet(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

struct SocketHandle {
    conn: Connection,
    peer: SocketAddr,
    server_id: String,
    packet: PacketType,
}

/// Socket table for one request phase.
#[derive(Default)]
pub struct Multiplexer {
    next_id: u64,
    handles: BTreeMap<SocketId, SocketHandle>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a socket to `instance`'s query endpoint with its transport and
    /// read timeout.
    pub fn open(instance: &ProtocolInstance, blocking: bool) -> Result<Connection, QueryError> {
        let addr = SocketAddr::new(instance.ip(), instance.port());
        Connection::open(
            addr,
            instance.transport(),
            instance.options().read_timeout(),
            blocking,
        )
    }

    /// Track `conn` for (server, packet) and return its handle.
    pub fn register(&mut self, conn: Connection, server_id: &str, packet: PacketType) -> SocketId {
        let peer = match &conn {
            Connection::Udp(s) => s.peer_addr(),
            Connection::Tcp(s) => s.peer_addr(),
        }
        .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

        let id = SocketId(self.next_id);
        self.next_id += 1;
        self.handles.insert(
            id,
            SocketHandle {
                conn,
                peer,
                server_id: server_id.to_string(),
                packet,
            },
        );
        id
    }

    /// Point an existing handle at another packet type of the same server.
    pub fn retarget(&mut self, id: SocketId, packet: PacketType) -> bool {
        match self.handles.get_mut(&id) {
            Some(handle) => {
                handle.packet = packet;
                true
            }
            None => false,
        }
    }

    pub fn route(&self, id: SocketId) -> Option<(&str, PacketType)> {
        self.handles
            .get(&id)
            .map(|h| (h.server_id.as_str(), h.packet))
    }

    pub fn connection_mut(&mut self, id: SocketId) -> Option<&mut Connection> {
        self.handles.get_mut(&id).map(|h| &mut h.conn)
    }

    pub fn send(&mut self, id: SocketId, bytes: &[u8]) -> Result<(), QueryError> {
        let handle = self.handles.get_mut(&id).ok_or_else(|| {
            QueryError::Configuration(format!("unknown socket handle {:?}", id))
        })?;
        debug!(
            "-> {} [{} {}] {} bytes",
            handle.peer,
            handle.server_id,
            handle.packet,
            bytes.len()
        );
        handle
            .conn
            .send(bytes)
            .map_err(|e| QueryError::transport(handle.peer, e))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Collect responses from every tracked socket until `budget` runs out.
    ///
    /// Each readable socket yields one chunk per pass, and every chunk is
    /// kept in arrival order. A socket that reaches end-of-stream or reports
    /// a hard error stops being polled but keeps what it already delivered.
    pub fn listen(&mut self, budget: Duration) -> BTreeMap<SocketId, Vec<Vec<u8>>> {
        let start = Instant::now();
        let mut responses: BTreeMap<SocketId, Vec<Vec<u8>>> = BTreeMap::new();
        let mut pending: Vec<SocketId> = self.handles.keys().copied().collect();
        let mut buf = vec![0u8; READ_CHUNK];

        while !pending.is_empty() {
            let elapsed = start.elapsed();
            if elapsed >= budget {
                break;
            }

            let ready = match self.poll_readable(&pending, budget - elapsed) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!("socket poll failed, abandoning {} socket(s): {}", pending.len(), e);
                    break;
                }
            };

            for id in ready {
                let Some(handle) = self.handles.get_mut(&id) else {
                    continue;
                };
                match handle.conn.recv(&mut buf) {
                    Ok(0) if handle.conn.transport() == Transport::Tcp => {
                        pending.retain(|p| *p != id);
                    }
                    Ok(n) => {
                        debug!(
                            "<- {} [{} {}] {} bytes",
                            handle.peer, handle.server_id, handle.packet, n
                        );
                        responses.entry(id).or_default().push(buf[..n].to_vec());
                    }
                    Err(e) if is_quiet(&e) => {}
                    Err(e) => {
                        debug!(
                            "{} [{}] dropped from poll set: {}",
                            handle.peer, handle.server_id, e
                        );
                        pending.retain(|p| *p != id);
                    }
                }
            }

            std::thread::sleep(POLL_INTERVAL);
        }

        responses
    }

    #[cfg(unix)]
    fn poll_readable(&self, ids: &[SocketId], timeout: Duration) -> io::Result<Vec<SocketId>> {
        use std::os::unix::io::AsRawFd;

        let tracked: Vec<SocketId> = ids
            .iter()
            .copied()
            .filter(|id| self.handles.contains_key(id))
            .collect();
        let mut fds: Vec<libc::pollfd> = tracked
            .iter()
            .filter_map(|id| self.handles.get(id))
            .map(|h| libc::pollfd {
                fd: h.conn.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        // Round up so a sub-millisecond remainder does not turn into a busy poll.
        let millis = timeout
            .as_micros()
            .div_ceil(1000)
            .min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a live, correctly sized array of pollfd structs
        // whose descriptors are owned by `self.handles` for the whole call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        Ok(tracked
            .into_iter()
            .zip(fds)
            .filter(|(_, fd)| fd.revents != 0)
            .map(|(id, _)| id)
            .collect())
    }

    #[cfg(not(unix))]
    fn poll_readable(&self, ids: &[SocketId], timeout: Duration) -> io::Result<Vec<SocketId>> {
        // No portable readiness API in std: sweep every socket with a
        // non-blocking read instead.
        std::thread::sleep(POLL_INTERVAL.min(timeout));
        Ok(ids.to_vec())
    }

    /// Close and forget every socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        if !self.handles.is_empty() {
            debug!("closing {} socket(s)", self.handles.len());
        }
        self.handles.clear();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn udp_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn open_udp(addr: SocketAddr) -> Connection {
        Connection::open(addr, Transport::Udp, Duration::from_secs(1), false).unwrap()
    }

    #[test]
    fn repeat_datagrams_are_all_kept_in_order() {
        let (server, addr) = udp_server();
        let worker = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, peer) = server.recv_from(&mut buf).unwrap();
            for chunk in [&b"one"[..], b"two", b"three"] {
                server.send_to(chunk, peer).unwrap();
            }
        });

        let mut mux = Multiplexer::new();
        let id = mux.register(open_udp(addr), "srv", PacketType::Status);
        mux.send(id, b"ping").unwrap();
        let responses = mux.listen(Duration::from_millis(400));
        worker.join().unwrap();

        assert_eq!(
            responses.get(&id).unwrap(),
            &vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn silent_sockets_are_omitted() {
        let (_quiet, quiet_addr) = udp_server();
        let (talker, talk_addr) = udp_server();
        let worker = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, peer) = talker.recv_from(&mut buf).unwrap();
            talker.send_to(&buf[..n], peer).unwrap();
        });

        let mut mux = Multiplexer::new();
        let quiet = mux.register(open_udp(quiet_addr), "a", PacketType::Info);
        let loud = mux.register(open_udp(talk_addr), "b", PacketType::Info);
        mux.send(quiet, b"hello").unwrap();
        mux.send(loud, b"hello").unwrap();

        let started = Instant::now();
        let responses = mux.listen(Duration::from_millis(300));
        worker.join().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(!responses.contains_key(&quiet));
        assert_eq!(responses[&loud], vec![b"hello".to_vec()]);
    }

    #[test]
    fn handles_are_monotonic_and_routable() {
        let (_server, addr) = udp_server();
        let mut mux = Multiplexer::new();
        let first = mux.register(open_udp(addr), "one", PacketType::Challenge);
        let second = mux.register(open_udp(addr), "two", PacketType::Players);
        assert!(second > first);
        assert_eq!(mux.route(first), Some(("one", PacketType::Challenge)));

        assert!(mux.retarget(first, PacketType::Rules));
        assert_eq!(mux.route(first), Some(("one", PacketType::Rules)));

        mux.close();
        mux.close();
        assert!(mux.is_empty());
        assert_eq!(mux.route(second), None);
        assert!(!mux.retarget(second, PacketType::Info));
    }

    #[test]
    fn zero_budget_returns_immediately() {
        let (_server, addr) = udp_server();
        let mut mux = Multiplexer::new();
        mux.register(open_udp(addr), "x", PacketType::Info);
        let started = Instant::now();
        assert!(mux.listen(Duration::ZERO).is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn refused_tcp_connect_is_a_transport_error() {
        // Grab a free port, then close it so nothing is listening there.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = Connection::open(addr, Transport::Tcp, Duration::from_millis(500), true)
            .unwrap_err();
        assert!(matches!(err, QueryError::Transport { .. }));
    }

    #[test]
    fn tcp_stream_read_stops_on_close_or_completion() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let worker = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"part one|").unwrap();
            stream.write_all(b"part two|END").unwrap();
        });

        let mut conn =
            Connection::open(addr, Transport::Tcp, Duration::from_secs(1), true).unwrap();
        let data = conn.read_stream(|d| d.ends_with(b"END"));
        worker.join().unwrap();
        assert_eq!(data, b"part one|part two|END".to_vec());
    }
}
