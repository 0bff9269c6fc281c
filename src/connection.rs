use std::{
  fmt,
  future::Future,
  io,
  net::{SocketAddr, SocketAddrV4, SocketAddrV6},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
  },
  time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
  io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
  net::TcpStream,
  sync::{watch, Mutex},
  task::JoinHandle,
  time::{self, Instant},
};
use tracing::{debug, warn};
use url::Url;

use crate::{
  config::DEFAULT_PORT,
  error::{Error, Result},
  pool::PoolInner,
};

/// A checkout of a connection from its pool.
///
/// Whoever settles the lease first (the holder returning the connection, an
/// I/O timeout, or the safety deadline) owns the active count decrement.
#[derive(Debug)]
struct Lease {
  pool: Weak<PoolInner>,
  settled: AtomicBool,
  expired: watch::Sender<bool>,
}

impl Lease {
  fn settle(&self) -> bool {
    !self.settled.swap(true, Ordering::AcqRel)
  }

  fn discard(&self) -> bool {
    let settled = self.settle();
    if settled {
      if let Some(pool) = self.pool.upgrade() {
        pool.forget_active();
      }
    }
    settled
  }
}

enum Outcome<T> {
  Done(io::Result<T>),
  TimedOut,
  Expired,
}

async fn bounded<T>(
  timeout: Duration,
  expired: &mut watch::Receiver<bool>,
  io: impl Future<Output = io::Result<T>>,
) -> Outcome<T> {
  tokio::select! {
    biased;
    Ok(_) = expired.wait_for(|expired| *expired) => Outcome::Expired,
    result = time::timeout(timeout, io) => match result {
      Ok(result) => Outcome::Done(result),
      Err(_) => Outcome::TimedOut,
    },
  }
}

/// The socket, shared with the safety deadline task so that it can close a
/// connection its holder never hands back. `None` once closed.
type Transport = Arc<Mutex<Option<BufStream<TcpStream>>>>;

/// A TCP connection to one memcached server, owned by a pool.
///
/// Every primitive is bounded by the timeout it is given. When a deadline
/// passes the connection is closed and no longer counts as active, so the
/// caller only has to drop it.
pub struct Connection {
  host: String,
  pool: Weak<PoolInner>,
  transport: Transport,
  idle_since: Instant,
  lease: Option<Arc<Lease>>,
  safety: Option<JoinHandle<()>>,
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection")
      .field("host", &self.host)
      .field("open", &self.is_open())
      .field("checked_out", &self.lease.is_some())
      .finish()
  }
}

impl Connection {
  pub(crate) fn new(pool: &Arc<PoolInner>) -> Self {
    Self {
      host: pool.host.clone(),
      pool: Arc::downgrade(pool),
      transport: Arc::new(Mutex::new(None)),
      idle_since: Instant::now(),
      lease: None,
      safety: None,
    }
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  /// Only the safety deadline contends for the transport, and it holds it
  /// solely to close it, so a busy lock reads as closed.
  pub fn is_open(&self) -> bool {
    self.transport.try_lock().map_or(false, |transport| transport.is_some())
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    let transport = self.transport.try_lock().ok()?;
    transport.as_ref()?.get_ref().local_addr().ok()
  }

  pub(crate) fn idle_since(&self) -> Instant {
    self.idle_since
  }

  pub(crate) fn mark_idle(&mut self) {
    self.idle_since = Instant::now();
  }

  /// Starts a new lease and arms the safety deadline for it. Past the
  /// deadline the lease is settled and the socket closed, whatever the
  /// holder is doing.
  pub(crate) fn check_out(&mut self, window: Duration) {
    let (expired, _) = watch::channel(false);
    let lease = Arc::new(Lease {
      pool: self.pool.clone(),
      settled: AtomicBool::new(false),
      expired,
    });

    if !window.is_zero() {
      let host = self.host.clone();
      let lease = lease.clone();
      let transport = self.transport.clone();
      self.safety = Some(tokio::task::spawn(async move {
        time::sleep(window).await;
        if lease.discard() {
          warn!(%host, ?window, "connection held past its safety deadline, closing");
          lease.expired.send_replace(true);
          transport.lock().await.take();
        }
      }));
    }

    self.lease = Some(lease);
  }

  pub(crate) async fn connect(&mut self, url: &Url, timeout: Duration) -> Result<()> {
    let mut expired = self.expiry();

    let outcome = bounded(timeout, &mut expired, open(url)).await;
    match outcome {
      Outcome::Done(Ok(stream)) => {
        debug!(host = %self.host, "connected");
        *self.transport.lock().await = Some(BufStream::new(stream));
        Ok(())
      }
      Outcome::Done(Err(err)) => Err(err.into()),
      Outcome::TimedOut | Outcome::Expired => {
        self.abandon();
        Err(Error::ConnectionTimeout)
      }
    }
  }

  /// Writes `line` followed by CRLF.
  pub async fn write_line(&mut self, line: &[u8], timeout: Duration) -> Result<()> {
    self.write_parts(&[line, b"\r\n"], timeout).await
  }

  /// Writes an already framed buffer.
  pub async fn write_all(&mut self, buffer: &[u8], timeout: Duration) -> Result<()> {
    self.write_parts(&[buffer], timeout).await
  }

  async fn write_parts(&mut self, parts: &[&[u8]], timeout: Duration) -> Result<()> {
    let mut expired = self.expiry();

    let outcome = {
      let mut transport = self.transport.lock().await;
      let Some(stream) = transport.as_mut() else {
        return Err(closed(&expired, Error::WriteTimeout));
      };
      let write = async move {
        for part in parts {
          stream.write_all(part).await?;
        }
        stream.flush().await
      };
      bounded(timeout, &mut expired, write).await
    };
    match outcome {
      Outcome::Done(Ok(())) => Ok(()),
      Outcome::Done(Err(err)) => {
        self.abandon();
        Err(err.into())
      }
      Outcome::TimedOut | Outcome::Expired => {
        self.abandon();
        Err(Error::WriteTimeout)
      }
    }
  }

  /// Reads one line, without its CRLF terminator.
  pub async fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>> {
    let mut expired = self.expiry();

    let mut line = Vec::with_capacity(64);
    let outcome = {
      let mut transport = self.transport.lock().await;
      let Some(stream) = transport.as_mut() else {
        return Err(closed(&expired, Error::ReadTimeout));
      };
      bounded(timeout, &mut expired, stream.read_until(b'\n', &mut line)).await
    };
    match outcome {
      Outcome::Done(Ok(0)) => {
        self.abandon();
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server").into())
      }
      Outcome::Done(Ok(_)) if line.ends_with(b"\r\n") => {
        line.truncate(line.len() - 2);
        Ok(line)
      }
      Outcome::Done(Ok(_)) => {
        self.abandon();
        Err(Error::Protocol("line not terminated by CRLF".to_string()))
      }
      Outcome::Done(Err(err)) => {
        self.abandon();
        Err(err.into())
      }
      Outcome::TimedOut | Outcome::Expired => {
        self.abandon();
        Err(Error::ReadTimeout)
      }
    }
  }

  /// Reads exactly `len` bytes. Callers bound `len` before asking.
  pub async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Bytes> {
    let mut expired = self.expiry();

    let mut buffer = BytesMut::zeroed(len);
    let outcome = {
      let mut transport = self.transport.lock().await;
      let Some(stream) = transport.as_mut() else {
        return Err(closed(&expired, Error::ReadTimeout));
      };
      bounded(timeout, &mut expired, stream.read_exact(&mut buffer[..])).await
    };
    match outcome {
      Outcome::Done(Ok(_)) => Ok(buffer.freeze()),
      Outcome::Done(Err(err)) => {
        self.abandon();
        Err(err.into())
      }
      Outcome::TimedOut | Outcome::Expired => {
        self.abandon();
        Err(Error::ReadTimeout)
      }
    }
  }

  /// Hands the connection back to its pool.
  ///
  /// A no-op beyond closing the transport if the connection was already
  /// abandoned or reclaimed by the safety deadline.
  pub fn release(mut self) {
    self.disarm();
    let Some(lease) = self.lease.take() else {
      return;
    };
    if !lease.settle() {
      return;
    }
    let Some(pool) = self.pool.upgrade() else {
      return;
    };
    if self.is_open() {
      pool.put(self);
    } else {
      pool.forget_active();
    }
  }

  /// Closes the connection without returning it to its pool.
  pub fn destroy(mut self) {
    self.abandon();
  }

  fn expiry(&self) -> watch::Receiver<bool> {
    match &self.lease {
      Some(lease) => lease.expired.subscribe(),
      None => watch::channel(false).1,
    }
  }

  fn disarm(&mut self) {
    if let Some(safety) = self.safety.take() {
      safety.abort();
    }
  }

  fn abandon(&mut self) {
    self.disarm();
    // A held lock means the safety deadline is already closing the socket.
    if let Ok(mut transport) = self.transport.try_lock() {
      transport.take();
    }
    if let Some(lease) = self.lease.take() {
      lease.discard();
    }
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.disarm();
    if let Some(lease) = self.lease.take() {
      if lease.discard() {
        warn!(host = %self.host, "connection dropped while checked out");
      }
    }
  }
}

/// The error for a primitive called on a closed connection: the primitive's
/// own timeout if the safety deadline closed it.
fn closed(expired: &watch::Receiver<bool>, timeout: Error) -> Error {
  if *expired.borrow() {
    timeout
  } else {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed").into()
  }
}

async fn open(url: &Url) -> io::Result<TcpStream> {
  let port = url.port().unwrap_or(DEFAULT_PORT);
  let addr: SocketAddr = match url.host() {
    Some(url::Host::Domain(domain)) => tokio::net::lookup_host(format!("{domain}:{port}"))
      .await
      .and_then(|mut v| {
        v.next()
          .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unable to find host"))
      })?,
    Some(url::Host::Ipv4(ip)) => SocketAddrV4::new(ip, port).into(),
    Some(url::Host::Ipv6(ip)) => SocketAddrV6::new(ip, port, 0, 0).into(),
    None => return Err(io::Error::new(io::ErrorKind::InvalidInput, "missing host")),
  };

  let stream = TcpStream::connect(addr).await?;
  stream.set_nodelay(true)?;
  Ok(stream)
}
