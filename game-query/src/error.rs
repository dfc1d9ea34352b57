use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    /// Bad server spec, unknown protocol or filter, unresolvable host.
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Transport error ({addr}): {source}")]
    Transport {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Challenge error: {0}")]
    Challenge(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl QueryError {
    pub fn transport(addr: SocketAddr, source: std::io::Error) -> Self {
        QueryError::Transport { addr, source }
    }
}
