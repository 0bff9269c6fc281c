use std::collections::BTreeMap;

use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::debug;

use crate::{
  config::{parse_host, ClientConfig},
  error::{Error, Result},
  pool::{ConnectionPool, ConnectionPoolBuilder},
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Hashes a key into the 15-bit space shared with other clients of the
/// cluster. Never returns 0.
pub fn hash_key(key: &[u8]) -> u32 {
  match (CRC32.checksum(key) >> 16) & 0x7fff {
    0 => 1,
    hash => hash,
  }
}

/// Picks the host responsible for `key`. `None` only for an empty host list.
pub fn route<'a, H>(key: &[u8], hosts: &'a [H]) -> Option<&'a H> {
  if hosts.is_empty() {
    return None;
  }
  hosts.get(hash_key(key) as usize % hosts.len())
}

/// Fixed mapping from hosts to their connection pools.
///
/// Hosts listed more than once share a single pool but keep their weight in
/// the routing table.
#[derive(Debug)]
pub struct Router {
  hosts: Vec<String>,
  routes: Vec<ConnectionPool>,
  pools: BTreeMap<String, ConnectionPool>,
}

impl Router {
  pub fn new(config: &ClientConfig) -> Result<Self> {
    if config.hosts.is_empty() {
      return Err(Error::NoHosts);
    }

    let mut pools = BTreeMap::new();
    let mut routes = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
      let pool = match pools.get(host) {
        Some(pool) => ConnectionPool::clone(pool),
        None => {
          let url = parse_host(host)?;
          debug!(%host, %url, "registering pool");
          let pool = ConnectionPoolBuilder::new(host.clone(), url)
            .socket_timeout(config.socket_timeout)
            .max_idle(config.max_idle)
            .max_active(config.max_active)
            .idle_timeout(config.idle_timeout)
            .safety_timeout(config.safety_timeout)
            .build();
          pools.insert(host.clone(), pool.clone());
          pool
        }
      };
      routes.push(pool);
    }

    Ok(Self {
      hosts: config.hosts.clone(),
      routes,
      pools,
    })
  }

  pub fn hosts(&self) -> &[String] {
    &self.hosts
  }

  pub fn route(&self, key: impl AsRef<[u8]>) -> &str {
    let i = hash_key(key.as_ref()) as usize % self.hosts.len();
    &self.hosts[i]
  }

  pub fn pool_for(&self, key: impl AsRef<[u8]>) -> &ConnectionPool {
    let i = hash_key(key.as_ref()) as usize % self.routes.len();
    &self.routes[i]
  }

  pub fn pool(&self, host: impl AsRef<str>) -> Option<&ConnectionPool> {
    self.pools.get(host.as_ref())
  }

  pub fn pools(&self) -> impl Iterator<Item = &ConnectionPool> {
    self.pools.values()
  }

  pub fn close(&self) {
    for pool in self.pools.values() {
      pool.close();
    }
  }
}
