//! Loopback mock servers shared by the integration tests.
//!
//! Each mock runs on its own thread, answers through a handler closure and
//! reports every request it sees over a channel so tests can inspect what
//! was actually put on the wire.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

/// Mocks shut themselves down after this long.
const MOCK_LIFETIME: Duration = Duration::from_secs(15);

pub struct Mock {
    pub addr: SocketAddr,
    pub received: Receiver<(SocketAddr, Vec<u8>)>,
}

impl Mock {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.received.try_iter().map(|(_, p)| p).collect()
    }

    pub fn requests(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.received.try_iter().collect()
    }
}

/// UDP server answering every datagram with whatever `handler` returns.
pub fn udp_mock<F>(handler: F) -> Mock
where
    F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind mock");
    socket
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let deadline = Instant::now() + MOCK_LIFETIME;
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            let Ok((n, from)) = socket.recv_from(&mut buf) else {
                continue;
            };
            let packet = buf[..n].to_vec();
            for reply in handler(&packet) {
                let _ = socket.send_to(&reply, from);
            }
            if tx.send((from, packet)).is_err() {
                break;
            }
        }
    });

    Mock { addr, received: rx }
}

/// UDP server that reads but never answers.
pub fn silent_udp() -> Mock {
    udp_mock(|_| Vec::new())
}

/// Line-oriented TCP server for a single connection: writes `greeting` after
/// `delay`, then answers each request line with `handler(line)`.
pub fn tcp_mock<F>(delay: Duration, greeting: &'static str, handler: F) -> Mock
where
    F: Fn(&str) -> String + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let Ok((mut stream, peer)) = listener.accept() else {
            return;
        };
        thread::sleep(delay);
        if stream.write_all(greeting.as_bytes()).is_err() {
            return;
        }
        stream
            .set_read_timeout(Some(MOCK_LIFETIME))
            .unwrap();
        let Ok(reader) = stream.try_clone() else {
            return;
        };
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else {
                break;
            };
            let reply = handler(&line);
            let _ = tx.send((peer, line.into_bytes()));
            if stream.write_all(reply.as_bytes()).is_err() {
                break;
            }
        }
    });

    Mock { addr, received: rx }
}

/// A loopback port with nothing listening on it.
pub fn closed_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
