//! Asynchronous memcached client speaking the text protocol.
//!
//! Keys are sharded over a fixed host list with a crc32 based hash, each host
//! gets its own bounded [`ConnectionPool`], and values carry type flags that
//! stay compatible with other clients of the same cluster.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod router;
pub mod value;

pub use client::Client;
pub use config::ClientConfig;
pub use connection::Connection;
pub use error::{Error, Result};
pub use pool::{ConnectionPool, ConnectionPoolBuilder};
pub use router::Router;
pub use value::{Flags, Value};
