use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("invalid key: {0}")]
  Key(String),

  #[error("unknown command: {0}")]
  UnknownCommand(String),

  #[error("client error: {0}")]
  Client(String),

  #[error("server error: {0}")]
  Server(String),

  #[error("timed out connecting")]
  ConnectionTimeout,

  #[error("timed out reading")]
  ReadTimeout,

  #[error("timed out writing")]
  WriteTimeout,

  #[error("connection pool for {host} exhausted (active: {active})")]
  PoolExhausted { host: String, active: usize },

  #[error("connection pool for {host} closed")]
  PoolClosed { host: String },

  #[error("protocol error: {0}")]
  Protocol(String),

  #[error("failed to encode value: {0}")]
  Encode(String),

  #[error("invalid host {0}")]
  InvalidHost(String),

  #[error("no hosts configured")]
  NoHosts,

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl Error {
  pub fn is_timeout(&self) -> bool {
    matches!(self, Self::ConnectionTimeout | Self::ReadTimeout | Self::WriteTimeout)
  }

  /// Errors the server reported on a well-formed reply line.
  pub fn is_server_reported(&self) -> bool {
    matches!(self, Self::UnknownCommand(_) | Self::Client(_) | Self::Server(_))
  }
}
