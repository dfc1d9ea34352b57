//! Status queries for game servers.
//!
//! Register servers on a [`GameQuery`], call [`GameQuery::process`] and get
//! one [`Record`] per server id. UDP servers are queried concurrently over
//! non-blocking sockets on a single thread; TCP protocols such as
//! TeamSpeak 3 are driven one server at a time afterwards.

pub mod buffer;
pub mod config;
pub mod error;
pub mod filters;
pub mod multiplexer;
pub mod protocol;
pub mod protocols;
pub mod query;
pub mod record;

pub use config::{AddressPolicy, OptionOverrides, Pacing, QueryOptions, ServerSpec};
pub use error::QueryError;
pub use filters::{Filter, FilterParams, FilterRegistry};
pub use protocol::{
    Endpoint, Extraction, PacketMode, PacketType, Protocol, ProtocolInstance, Transport,
};
pub use protocols::ProtocolRegistry;
pub use query::GameQuery;
pub use record::Record;
