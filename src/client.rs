use std::{
  collections::{BTreeMap, HashMap},
  hash::Hash,
  sync::Arc,
  time::Duration,
};

use bytes::Bytes;
use tracing::debug;

use crate::{
  codec::{
    check_key, check_reply, decode_numeric, decode_value_header, encode_text_command, strip_data_terminator, CommandRef,
    IncrDecrCommandRef, KeyCommandRef, SetCommandRef, ValueHeader, DELETED, END, NOT_FOUND, STORED,
  },
  config::ClientConfig,
  connection::Connection,
  error::{Error, Result},
  pool::ConnectionPool,
  router::Router,
  value::{self, Value},
};

#[derive(Debug, Clone, Copy)]
enum StoreCommand {
  Set,
  Add,
  Replace,
}

impl StoreCommand {
  fn command<'a>(self, cmd: SetCommandRef<'a>) -> CommandRef<'a> {
    match self {
      Self::Set => CommandRef::Set(cmd),
      Self::Add => CommandRef::Add(cmd),
      Self::Replace => CommandRef::Replace(cmd),
    }
  }
}

/// Memcached client sharding keys over a fixed set of hosts.
///
/// Cloning is cheap; clones share the same pools.
#[derive(Debug, Clone)]
pub struct Client {
  router: Arc<Router>,
}

impl Client {
  pub fn new(config: ClientConfig) -> Result<Self> {
    let router = Router::new(&config)?;
    Ok(Self {
      router: Arc::new(router),
    })
  }

  pub fn router(&self) -> &Router {
    &self.router
  }

  /// The host `key` is routed to.
  pub fn host_for(&self, key: impl AsRef<[u8]>) -> &str {
    self.router.route(key)
  }

  pub fn pool(&self, host: impl AsRef<str>) -> Option<&ConnectionPool> {
    self.router.pool(host)
  }

  /// Closes every pool. Operations issued afterwards fail with
  /// [`Error::PoolClosed`].
  pub fn shutdown(&self) {
    self.router.close();
  }

  pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Value>> {
    let key = check_key(key.as_ref(), b"")?;
    let item = self.fetch(&key, CommandRef::Get(KeyCommandRef { key: &key })).await?;
    Ok(item.and_then(|(header, payload)| value::decode(header.flags, &payload)))
  }

  /// Like [`Client::get`], also returning the cas token of the value.
  pub async fn gets(&self, key: impl AsRef<[u8]>) -> Result<Option<(Value, u64)>> {
    let key = check_key(key.as_ref(), b"")?;
    let item = self.fetch(&key, CommandRef::Gets(KeyCommandRef { key: &key })).await?;
    Ok(item.and_then(|(header, payload)| {
      let cas = header.cas?;
      value::decode(header.flags, &payload).map(|value| (value, cas))
    }))
  }

  pub async fn set(
    &self,
    key: impl AsRef<[u8]>,
    value: impl Into<Value>,
    expire: u32,
    compression_threshold: usize,
  ) -> Result<bool> {
    let key = check_key(key.as_ref(), b"")?;
    self
      .store(StoreCommand::Set, &key, &value.into(), expire, compression_threshold)
      .await
  }

  pub async fn add(
    &self,
    key: impl AsRef<[u8]>,
    value: impl Into<Value>,
    expire: u32,
    compression_threshold: usize,
  ) -> Result<bool> {
    let key = check_key(key.as_ref(), b"")?;
    self
      .store(StoreCommand::Add, &key, &value.into(), expire, compression_threshold)
      .await
  }

  pub async fn replace(
    &self,
    key: impl AsRef<[u8]>,
    value: impl Into<Value>,
    expire: u32,
    compression_threshold: usize,
  ) -> Result<bool> {
    let key = check_key(key.as_ref(), b"")?;
    self
      .store(StoreCommand::Replace, &key, &value.into(), expire, compression_threshold)
      .await
  }

  /// Stores `value` only if the item is unchanged since `cas` was read.
  pub async fn cas(&self, key: impl AsRef<[u8]>, cas: u64, value: impl Into<Value>, expire: u32) -> Result<bool> {
    let key = check_key(key.as_ref(), b"")?;
    let (flags, payload) = value::encode(&value.into(), 0)?;
    let command = CommandRef::Cas(SetCommandRef {
      key: &key,
      value: &payload,
      flags,
      exptime: expire,
      cas: Some(cas),
    });
    self.status(&key, &command, |line| line == STORED).await
  }

  pub async fn incr(&self, key: impl AsRef<[u8]>, delta: u64) -> Result<Option<u64>> {
    let key = check_key(key.as_ref(), b"")?;
    self
      .numeric(&key, CommandRef::Incr(IncrDecrCommandRef { key: &key, delta }))
      .await
  }

  pub async fn decr(&self, key: impl AsRef<[u8]>, delta: u64) -> Result<Option<u64>> {
    let key = check_key(key.as_ref(), b"")?;
    self
      .numeric(&key, CommandRef::Decr(IncrDecrCommandRef { key: &key, delta }))
      .await
  }

  /// Deletes `key`. A missing key counts as deleted.
  pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
    let key = check_key(key.as_ref(), b"")?;
    let command = CommandRef::Delete(KeyCommandRef { key: &key });
    self
      .status(&key, &command, |line| line == DELETED || line == NOT_FOUND)
      .await
  }

  /// Fetches many keys, one round trip per host. The result is keyed by the
  /// unprefixed keys as given; misses are left out.
  pub async fn get_multi<I, K>(&self, keys: I, prefix: impl AsRef<[u8]>) -> Result<HashMap<K, Value>>
  where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]> + Eq + Hash,
  {
    let prefix = prefix.as_ref();
    let mut originals = HashMap::new();
    let mut groups: BTreeMap<&str, (&ConnectionPool, Vec<Vec<u8>>)> = BTreeMap::new();
    for key in keys {
      let full = check_key(key.as_ref(), prefix)?;
      if originals.contains_key(&full) {
        continue;
      }
      let pool = self.router.pool_for(&full);
      groups
        .entry(pool.host())
        .or_insert_with(|| (pool, Vec::new()))
        .1
        .push(full.clone());
      originals.insert(full, key);
    }

    let mut values = HashMap::with_capacity(originals.len());
    for (host, (pool, keys)) in groups {
      debug!(%host, keys = keys.len(), "get_multi");
      let mut connection = pool.acquire().await?;
      let result = fetch_many(&mut connection, &keys, pool.socket_timeout()).await;
      let items = settle(connection, result)?;

      for (header, payload) in items {
        let Some(original) = originals.remove(&header.key) else {
          continue;
        };
        if let Some(value) = value::decode(header.flags, &payload) {
          values.insert(original, value);
        }
      }
    }
    Ok(values)
  }

  /// Stores every entry with its own `set`. Returns the keys the server
  /// declined to store; a transport error aborts the remaining entries.
  pub async fn set_multi<I, K, V>(
    &self,
    mapping: I,
    expire: u32,
    prefix: impl AsRef<[u8]>,
    compression_threshold: usize,
  ) -> Result<Vec<K>>
  where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]>,
    V: Into<Value>,
  {
    let prefix = prefix.as_ref();
    let entries = mapping
      .into_iter()
      .map(|(key, value)| {
        let full = check_key(key.as_ref(), prefix)?;
        Ok((key, full, value.into()))
      })
      .collect::<Result<Vec<_>>>()?;

    let mut failed = Vec::new();
    for (key, full, value) in entries {
      if !self
        .store(StoreCommand::Set, &full, &value, expire, compression_threshold)
        .await?
      {
        failed.push(key);
      }
    }
    Ok(failed)
  }

  async fn store(
    &self,
    command: StoreCommand,
    key: &[u8],
    value: &Value,
    expire: u32,
    compression_threshold: usize,
  ) -> Result<bool> {
    let (flags, payload) = value::encode(value, compression_threshold)?;
    let command = command.command(SetCommandRef {
      key,
      value: &payload,
      flags,
      exptime: expire,
      cas: None,
    });
    self.status(key, &command, |line| line == STORED).await
  }

  async fn fetch(&self, key: &[u8], command: CommandRef<'_>) -> Result<Option<(ValueHeader, Bytes)>> {
    let pool = self.router.pool_for(key);
    let mut connection = pool.acquire().await?;
    let result = fetch_one(&mut connection, key, &command, pool.socket_timeout()).await;
    settle(connection, result)
  }

  async fn status(&self, key: &[u8], command: &CommandRef<'_>, success: impl FnOnce(&[u8]) -> bool) -> Result<bool> {
    let pool = self.router.pool_for(key);
    let mut connection = pool.acquire().await?;
    let result = request(&mut connection, command, pool.socket_timeout()).await;
    settle(connection, result).map(|line| success(&line))
  }

  async fn numeric(&self, key: &[u8], command: CommandRef<'_>) -> Result<Option<u64>> {
    let pool = self.router.pool_for(key);
    let mut connection = pool.acquire().await?;
    let result = request(&mut connection, &command, pool.socket_timeout()).await;
    settle(connection, result).map(|line| decode_numeric(&line))
  }
}

/// Returns a connection to its pool after a clean exchange, closes it
/// otherwise.
fn settle<T>(connection: Connection, result: Result<T>) -> Result<T> {
  match &result {
    Ok(_) => connection.release(),
    Err(err) => {
      debug!(host = connection.host(), %err, "discarding connection");
      connection.destroy();
    }
  }
  result
}

/// Sends `command` and reads its single reply line.
async fn request(connection: &mut Connection, command: &CommandRef<'_>, timeout: Duration) -> Result<Vec<u8>> {
  connection.write_all(&encode_text_command(command), timeout).await?;
  let line = connection.read_line(timeout).await?;
  check_reply(&line, command.name())?;
  Ok(line)
}

/// Reads a data block of `len` bytes and its CRLF terminator.
async fn read_payload(connection: &mut Connection, len: usize, timeout: Duration) -> Result<Bytes> {
  let block = len
    .checked_add(2)
    .ok_or_else(|| Error::Protocol(format!("value length {len} out of range")))?;
  strip_data_terminator(connection.read_exact(block, timeout).await?)
}

async fn fetch_one(
  connection: &mut Connection,
  key: &[u8],
  command: &CommandRef<'_>,
  timeout: Duration,
) -> Result<Option<(ValueHeader, Bytes)>> {
  let line = request(connection, command, timeout).await?;
  if line == END {
    return Ok(None);
  }

  let header = decode_value_header(&line)?;
  if header.key != key {
    return Err(Error::Protocol(format!(
      "reply for {:?} while fetching {:?}",
      String::from_utf8_lossy(&header.key),
      String::from_utf8_lossy(key)
    )));
  }
  if matches!(command, CommandRef::Gets(_)) && header.cas.is_none() {
    return Err(Error::Protocol("gets reply without cas token".to_string()));
  }
  let payload = read_payload(connection, header.len, timeout).await?;

  let end = connection.read_line(timeout).await?;
  if end != END {
    return Err(Error::Protocol(format!(
      "expected END, got {:?}",
      String::from_utf8_lossy(&end)
    )));
  }

  Ok(Some((header, payload)))
}

async fn fetch_many(
  connection: &mut Connection,
  keys: &[Vec<u8>],
  timeout: Duration,
) -> Result<Vec<(ValueHeader, Bytes)>> {
  let command = CommandRef::GetM {
    keys: keys.iter().map(Vec::as_slice).collect(),
  };
  let mut line = request(connection, &command, timeout).await?;

  let mut items = Vec::with_capacity(keys.len());
  while line != END {
    let header = decode_value_header(&line)?;
    if !keys.contains(&header.key) {
      return Err(Error::Protocol(format!(
        "unexpected key in reply: {:?}",
        String::from_utf8_lossy(&header.key)
      )));
    }
    let payload = read_payload(connection, header.len, timeout).await?;
    items.push((header, payload));

    line = connection.read_line(timeout).await?;
    check_reply(&line, command.name())?;
  }
  Ok(items)
}
