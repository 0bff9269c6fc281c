#![allow(dead_code)]

use std::{
  collections::HashMap,
  io,
  str::FromStr,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use mcpool::{Client, ClientConfig};
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
  net::{TcpListener, TcpStream},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
  pub flags: u32,
  pub data: Vec<u8>,
  pub cas: u64,
}

#[derive(Debug, Default)]
pub struct Store {
  pub items: HashMap<Vec<u8>, Item>,
  next_cas: u64,
}

impl Store {
  fn insert(&mut self, key: &[u8], flags: u32, data: Vec<u8>) {
    self.next_cas += 1;
    let cas = self.next_cas;
    self.items.insert(key.to_vec(), Item { flags, data, cas });
  }
}

/// In-process memcached speaking enough of the text protocol for the client.
#[derive(Debug, Clone)]
pub struct FakeServer {
  pub host: String,
  pub store: Arc<Mutex<Store>>,
  accepted: Arc<AtomicUsize>,
}

impl FakeServer {
  pub async fn spawn() -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    let store = Arc::new(Mutex::new(Store::default()));
    let accepted = Arc::new(AtomicUsize::new(0));

    let server = Self {
      host,
      store: store.clone(),
      accepted: accepted.clone(),
    };

    tokio::task::spawn(async move {
      while let Ok((stream, _)) = listener.accept().await {
        accepted.fetch_add(1, Ordering::SeqCst);
        tokio::task::spawn(serve(stream, store.clone()));
      }
    });

    server
  }

  pub fn accepted(&self) -> usize {
    self.accepted.load(Ordering::SeqCst)
  }

  pub fn item(&self, key: impl AsRef<[u8]>) -> Option<Item> {
    self.store.lock().unwrap().items.get(key.as_ref()).cloned()
  }

  pub fn len(&self) -> usize {
    self.store.lock().unwrap().items.len()
  }
}

fn number<T: FromStr>(chunk: &[u8]) -> Option<T> {
  std::str::from_utf8(chunk).ok()?.parse().ok()
}

async fn serve(stream: TcpStream, store: Arc<Mutex<Store>>) -> io::Result<()> {
  let mut stream = BufStream::new(stream);
  loop {
    let mut line = Vec::new();
    if stream.read_until(b'\n', &mut line).await? == 0 {
      return Ok(());
    }
    let line = line.strip_suffix(b"\r\n").unwrap_or(&line);
    let parts = line.split(|b| *b == b' ').collect::<Vec<_>>();

    let reply = match parts.as_slice() {
      [cmd @ (b"get" | b"gets"), keys @ ..] if !keys.is_empty() => {
        let mut reply = Vec::new();
        let store = store.lock().unwrap();
        for key in keys {
          if let Some(item) = store.items.get(*key) {
            let header = if *cmd == b"gets" {
              format!(" {} {} {}\r\n", item.flags, item.data.len(), item.cas)
            } else {
              format!(" {} {}\r\n", item.flags, item.data.len())
            };
            reply.extend_from_slice(b"VALUE ");
            reply.extend_from_slice(key);
            reply.extend_from_slice(header.as_bytes());
            reply.extend_from_slice(&item.data);
            reply.extend_from_slice(b"\r\n");
          }
        }
        reply.extend_from_slice(b"END\r\n");
        reply
      }
      [cmd @ (b"set" | b"add" | b"replace" | b"cas"), key, flags, _exptime, len, rest @ ..] => {
        let (Some(flags), Some(len)) = (number::<u32>(flags), number::<usize>(len)) else {
          stream.write_all(b"CLIENT_ERROR bad command line format\r\n").await?;
          stream.flush().await?;
          continue;
        };
        let mut data = vec![0; len + 2];
        stream.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
          stream.write_all(b"CLIENT_ERROR bad data chunk\r\n").await?;
          stream.flush().await?;
          continue;
        }
        data.truncate(len);

        let mut store = store.lock().unwrap();
        let existing = store.items.get(*key).map(|item| item.cas);
        let reply: &[u8] = match (*cmd, existing) {
          (b"set", _) | (b"add", None) | (b"replace", Some(_)) => {
            store.insert(key, flags, data);
            b"STORED\r\n"
          }
          (b"cas", Some(cas)) if rest.first().and_then(|c| number::<u64>(c)) == Some(cas) => {
            store.insert(key, flags, data);
            b"STORED\r\n"
          }
          (b"cas", Some(_)) => b"EXISTS\r\n",
          (b"cas", None) => b"NOT_FOUND\r\n",
          _ => b"NOT_STORED\r\n",
        };
        reply.to_vec()
      }
      [b"delete", key] => match store.lock().unwrap().items.remove(*key) {
        Some(_) => b"DELETED\r\n".to_vec(),
        None => b"NOT_FOUND\r\n".to_vec(),
      },
      [cmd @ (b"incr" | b"decr"), key, delta] => {
        let mut store = store.lock().unwrap();
        match (store.items.get_mut(*key), number::<u64>(delta)) {
          (None, _) => b"NOT_FOUND\r\n".to_vec(),
          (_, None) => b"CLIENT_ERROR invalid numeric delta argument\r\n".to_vec(),
          (Some(item), Some(delta)) => match number::<u64>(&item.data) {
            Some(current) => {
              let value = if *cmd == b"incr" {
                current.wrapping_add(delta)
              } else {
                current.saturating_sub(delta)
              };
              item.data = value.to_string().into_bytes();
              format!("{value}\r\n").into_bytes()
            }
            None => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec(),
          },
        }
      }
      _ => b"ERROR\r\n".to_vec(),
    };

    stream.write_all(&reply).await?;
    stream.flush().await?;
  }
}

/// Answers every request with `reply`, consuming the payload line of storage
/// commands.
pub async fn spawn_scripted(reply: &'static [u8]) -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let host = listener.local_addr().unwrap().to_string();

  tokio::task::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::task::spawn(async move {
        let mut stream = BufStream::new(stream);
        loop {
          let mut line = String::new();
          match stream.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
          }
          if ["set ", "add ", "replace ", "cas "].iter().any(|cmd| line.starts_with(cmd)) {
            let mut payload = String::new();
            if stream.read_line(&mut payload).await.is_err() {
              return;
            }
          }
          if stream.write_all(reply).await.is_err() || stream.flush().await.is_err() {
            return;
          }
        }
      });
    }
  });

  host
}

/// Answers the first `answered` storage commands with STORED, then keeps
/// reading without ever replying. Every command line received is recorded.
pub async fn spawn_stalling(answered: usize) -> (String, Arc<Mutex<Vec<Vec<u8>>>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let host = listener.local_addr().unwrap().to_string();
  let received = Arc::new(Mutex::new(Vec::new()));

  let log = received.clone();
  tokio::task::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let log = log.clone();
      tokio::task::spawn(async move {
        let mut stream = BufStream::new(stream);
        loop {
          let mut line = Vec::new();
          let mut payload = Vec::new();
          match stream.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
          }
          if stream.read_until(b'\n', &mut payload).await.is_err() {
            return;
          }
          let count = {
            let mut log = log.lock().unwrap();
            log.push(line);
            log.len()
          };
          if count <= answered && (stream.write_all(b"STORED\r\n").await.is_err() || stream.flush().await.is_err()) {
            return;
          }
        }
      });
    }
  });

  (host, received)
}

/// Accepts connections and never answers.
pub async fn spawn_silent() -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let host = listener.local_addr().unwrap().to_string();

  tokio::task::spawn(async move {
    let mut held = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
      held.push(stream);
    }
  });

  host
}

pub fn client(hosts: &[&str]) -> Client {
  client_with(hosts, |config| config)
}

pub fn client_with(hosts: &[&str], configure: impl FnOnce(ClientConfig) -> ClientConfig) -> Client {
  let config = ClientConfig::new(hosts.iter().copied()).socket_timeout(Duration::from_secs(2));
  Client::new(configure(config)).unwrap()
}

pub fn active(client: &Client) -> usize {
  client.router().pools().map(|pool| pool.active_count()).sum()
}

pub fn idle(client: &Client) -> usize {
  client.router().pools().map(|pool| pool.idle_count()).sum()
}
