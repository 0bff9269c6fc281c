use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 11211;

/// Client construction parameters.
///
/// Durations are expressed in (fractional) seconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ClientConfig {
  pub hosts: Vec<String>,

  #[serde(default = "default_socket_timeout", with = "seconds")]
  pub socket_timeout: Duration,

  #[serde(default = "default_max_idle")]
  pub max_idle: usize,

  /// 0 means unbounded.
  #[serde(default = "default_max_active")]
  pub max_active: usize,

  /// 0 disables idle pruning.
  #[serde(default = "default_idle_timeout", with = "seconds")]
  pub idle_timeout: Duration,

  /// Backstop for connections that are checked out and never returned.
  #[serde(default = "default_safety_timeout", with = "seconds")]
  pub safety_timeout: Duration,
}

fn default_socket_timeout() -> Duration {
  Duration::from_secs(5)
}

fn default_max_idle() -> usize {
  3
}

fn default_max_active() -> usize {
  10
}

fn default_idle_timeout() -> Duration {
  Duration::from_secs(600)
}

fn default_safety_timeout() -> Duration {
  Duration::from_secs(60)
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      hosts: Vec::new(),
      socket_timeout: default_socket_timeout(),
      max_idle: default_max_idle(),
      max_active: default_max_active(),
      idle_timeout: default_idle_timeout(),
      safety_timeout: default_safety_timeout(),
    }
  }
}

impl ClientConfig {
  pub fn new<I, S>(hosts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let hosts = hosts.into_iter().map(Into::into).collect();
    Self {
      hosts,
      ..Default::default()
    }
  }

  pub fn socket_timeout(self, socket_timeout: Duration) -> Self {
    Self { socket_timeout, ..self }
  }

  pub fn max_idle(self, max_idle: usize) -> Self {
    Self { max_idle, ..self }
  }

  pub fn max_active(self, max_active: usize) -> Self {
    Self { max_active, ..self }
  }

  pub fn idle_timeout(self, idle_timeout: Duration) -> Self {
    Self { idle_timeout, ..self }
  }

  pub fn safety_timeout(self, safety_timeout: Duration) -> Self {
    Self { safety_timeout, ..self }
  }
}

/// Parses a `host:port` endpoint into a `tcp://` url.
pub fn parse_host(host: &str) -> Result<Url> {
  let mut url = Url::parse(&format!("tcp://{host}")).map_err(|err| Error::InvalidHost(format!("{host}: {err}")))?;

  if url.host_str().map_or(true, str::is_empty) || !url.path().is_empty() || url.query().is_some() {
    return Err(Error::InvalidHost(host.to_string()));
  }

  if url.port().is_none() {
    url
      .set_port(Some(DEFAULT_PORT))
      .map_err(|_| Error::InvalidHost(host.to_string()))?;
  }

  Ok(url)
}

mod seconds {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
  }
}
