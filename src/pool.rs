use std::{
  collections::VecDeque,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use tracing::{debug, info};
use url::Url;

use crate::{
  connection::Connection,
  error::{Error, Result},
};

#[derive(Debug)]
pub struct ConnectionPoolBuilder {
  host: String,
  url: Url,
  socket_timeout: Duration,
  max_idle: usize,
  max_active: usize,
  idle_timeout: Duration,
  safety_timeout: Duration,
}

impl ConnectionPoolBuilder {
  pub fn new(host: impl Into<String>, url: Url) -> Self {
    Self {
      host: host.into(),
      url,
      socket_timeout: Duration::from_secs(5),
      max_idle: 5,
      max_active: 0,
      idle_timeout: Duration::from_secs(600),
      safety_timeout: Duration::from_secs(60),
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

  pub fn build(self) -> ConnectionPool {
    let Self {
      host,
      url,
      socket_timeout,
      max_idle,
      max_active,
      idle_timeout,
      safety_timeout,
    } = self;
    let inner = Arc::new(PoolInner {
      host,
      url,
      socket_timeout,
      max_idle,
      max_active,
      idle_timeout,
      safety_timeout,
      state: Mutex::new(PoolState {
        idle: VecDeque::with_capacity(max_idle),
        active: 0,
        closed: false,
      }),
    });
    ConnectionPool { inner }
  }
}

/// Bounded set of connections to a single host.
///
/// Checked-out connections are counted in `active`, returned ones wait in an
/// idle queue ordered oldest first. Admission is fail-fast: once `max_active`
/// connections are out, `acquire` errors instead of waiting.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
  inner: Arc<PoolInner>,
}

enum Checkout {
  Idle(Connection),
  New,
}

impl ConnectionPool {
  pub fn host(&self) -> &str {
    &self.inner.host
  }

  pub fn socket_timeout(&self) -> Duration {
    self.inner.socket_timeout
  }

  pub fn active_count(&self) -> usize {
    self.inner.state().active
  }

  pub fn idle_count(&self) -> usize {
    self.inner.state().idle.len()
  }

  pub fn is_closed(&self) -> bool {
    self.inner.state().closed
  }

  pub async fn acquire(&self) -> Result<Connection> {
    let (checkout, pruned) = {
      let mut state = self.inner.state();
      let pruned = self.inner.prune_idle(&mut state);

      let checkout = if state.closed {
        Err(Error::PoolClosed {
          host: self.inner.host.clone(),
        })
      } else if let Some(connection) = state.idle.pop_front() {
        state.active += 1;
        Ok(Checkout::Idle(connection))
      } else if self.inner.max_active == 0 || state.active < self.inner.max_active {
        state.active += 1;
        debug!(host = %self.inner.host, active = state.active, "creating connection");
        Ok(Checkout::New)
      } else {
        Err(Error::PoolExhausted {
          host: self.inner.host.clone(),
          active: state.active,
        })
      };

      (checkout, pruned)
    };

    if !pruned.is_empty() {
      info!(host = %self.inner.host, count = pruned.len(), "pruned stale idle connections");
    }
    drop(pruned);

    match checkout? {
      Checkout::Idle(mut connection) => {
        connection.check_out(self.inner.safety_timeout);
        Ok(connection)
      }
      Checkout::New => {
        let mut connection = Connection::new(&self.inner);
        connection.check_out(self.inner.safety_timeout);
        if let Err(err) = connection.connect(&self.inner.url, self.inner.socket_timeout).await {
          connection.destroy();
          return Err(err);
        }
        Ok(connection)
      }
    }
  }

  /// Marks the pool closed and closes every idle connection. Connections that
  /// are checked out are closed when their holder returns them.
  pub fn close(&self) {
    let drained = {
      let mut state = self.inner.state();
      state.closed = true;
      state.idle.drain(..).collect::<Vec<_>>()
    };
    info!(host = %self.inner.host, idle = drained.len(), "pool closed");
    drop(drained);
  }
}

#[derive(Debug)]
pub(crate) struct PoolInner {
  pub(crate) host: String,
  url: Url,
  socket_timeout: Duration,
  max_idle: usize,
  max_active: usize,
  idle_timeout: Duration,
  safety_timeout: Duration,
  state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
  idle: VecDeque<Connection>,
  active: usize,
  closed: bool,
}

impl PoolInner {
  fn state(&self) -> MutexGuard<'_, PoolState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn prune_idle(&self, state: &mut PoolState) -> Vec<Connection> {
    let mut pruned = Vec::new();
    if self.idle_timeout.is_zero() {
      return pruned;
    }
    while state
      .idle
      .front()
      .is_some_and(|c| c.idle_since().elapsed() > self.idle_timeout)
    {
      pruned.extend(state.idle.pop_front());
    }
    pruned
  }

  /// Takes back a checked-out connection.
  pub(crate) fn put(&self, mut connection: Connection) {
    let evicted = {
      let mut state = self.state();
      state.active = state.active.saturating_sub(1);
      if state.closed {
        drop(state);
        debug!(host = %self.host, "pool closed, closing returned connection");
        return;
      }
      connection.mark_idle();
      state.idle.push_back(connection);
      let excess = state.idle.len().saturating_sub(self.max_idle);
      state.idle.drain(..excess).collect::<Vec<_>>()
    };
    if !evicted.is_empty() {
      info!(host = %self.host, count = evicted.len(), "closing connections over max_idle");
    }
  }

  /// Drops a checked-out connection from the active count.
  pub(crate) fn forget_active(&self) {
    let mut state = self.state();
    state.active = state.active.saturating_sub(1);
  }
}
