//! The heart of relais: one Session per proxied connection.
//!
//! A Session owns two streams: the "client" stream the listener accepted, and the
//! "upstream" stream the session dials itself. Each stream is an endpoint with a
//! connection state (Connecting/Connected/Closed), a reading flag, a writing flag
//! and a queue of pending write items.
//!
//! Data flow is two independent pipelines:
//! - the client reader forwards every chunk into the upstream endpoint's queue,
//!   the upstream writer drains that queue in order, and
//! - the upstream reader feeds the client endpoint's queue, drained by the client
//!   writer.
//!
//! The client endpoint is born Connected (the listener only hands over accepted
//! streams). The upstream endpoint is born Connecting: everything the client
//! sends while the dial is still in flight piles up in the upstream queue and is
//! flushed, in order, once the dial completes. That is also why writes go through
//! a queue at all instead of straight to the socket.
//!
//! Closing travels through the same queue: a graceful close enqueues a
//! [WriteItem::Close] behind whatever data is still pending, so the peer receives
//! every byte before it sees the FIN. When one endpoint learns its peer went away
//! it gracefully closes the other endpoint; whichever endpoint closes last
//! removes the session from the listener, exactly once.
//!
//! All state transitions happen under a single mutex per session. Blocking socket
//! IO never happens while it is held.

use crate::functional_traits::ThreadAdapter;
use crate::relais_error::RelaisResult;
use crate::stream::RelayStream;
use crate::upstream::UpstreamSettings;
use crate::util::next_id;
use crate::{debug_log, trace_log};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

/// Read chunk size. Also the largest unit in which data sits in a write queue.
const READ_BUFFER_SIZE: usize = 0x4000;

/// The owner of a set of sessions. Implemented by the listener.
/// [SessionHost::remove_session] is called exactly once per session, as the very
/// last act of the session's teardown, when both endpoints have closed.
pub(crate) trait SessionHost: Debug + Send + Sync {
  fn remove_session(&self, id: u128);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
  Connecting,
  Connected,
  Closed,
}

/// One entry in an endpoint's write queue.
#[derive(Debug)]
enum WriteItem {
  /// Payload to forward.
  Chunk(Vec<u8>),
  /// Close the endpoint once everything queued before this item has been written.
  Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
  Client,
  Upstream,
}

impl Side {
  fn other(self) -> Side {
    match self {
      Side::Client => Side::Upstream,
      Side::Upstream => Side::Client,
    }
  }

  fn name(self) -> &'static str {
    match self {
      Side::Client => "client",
      Side::Upstream => "upstream",
    }
  }
}

#[derive(Debug)]
struct EndpointState {
  conn: ConnState,
  reading: bool,
  writing: bool,
  queue: VecDeque<WriteItem>,
}

impl EndpointState {
  fn new(conn: ConnState) -> EndpointState {
    EndpointState { conn, reading: false, writing: false, queue: VecDeque::new() }
  }
}

#[derive(Debug)]
struct SessionState {
  client: EndpointState,
  upstream: EndpointState,
  /// None until the dial completed.
  upstream_stream: Option<Box<dyn RelayStream>>,
  /// Latch backing the remove-exactly-once guarantee.
  removed: bool,
}

impl SessionState {
  fn endpoint(&self, side: Side) -> &EndpointState {
    match side {
      Side::Client => &self.client,
      Side::Upstream => &self.upstream,
    }
  }

  fn endpoint_mut(&mut self, side: Side) -> &mut EndpointState {
    match side {
      Side::Client => &mut self.client,
      Side::Upstream => &mut self.upstream,
    }
  }
}

#[derive(Debug)]
struct SessionInner {
  id: u128,
  peer: String,
  host: Weak<dyn SessionHost>,
  settings: Arc<UpstreamSettings>,
  thread_adapter: Arc<dyn ThreadAdapter>,
  client_stream: Box<dyn RelayStream>,
  state: Mutex<SessionState>,
  /// One signal per endpoint. Woken whenever that endpoint's queue or connection
  /// state changes; its writer and any producer blocked on the queue bound listen.
  client_signal: Condvar,
  upstream_signal: Condvar,
}

/// Handle to one proxied connection.
#[derive(Debug, Clone)]
pub(crate) struct Session {
  inner: Arc<SessionInner>,
}

impl Session {
  /// Creates the session without starting anything. The caller registers the
  /// session with its host first and then calls [Session::begin]; that order
  /// guarantees a session that dies instantly is still removed from a set it
  /// was actually in.
  pub(crate) fn prepare(
    host: Weak<dyn SessionHost>,
    client_stream: Box<dyn RelayStream>,
    peer: String,
    settings: Arc<UpstreamSettings>,
    thread_adapter: Arc<dyn ThreadAdapter>,
  ) -> RelaisResult<Session> {
    client_stream.set_nodelay(true)?;

    let session = Session {
      inner: Arc::new(SessionInner {
        id: next_id(),
        peer,
        host,
        settings,
        thread_adapter,
        client_stream,
        state: Mutex::new(SessionState {
          client: EndpointState::new(ConnState::Connected),
          upstream: EndpointState::new(ConnState::Connecting),
          upstream_stream: None,
          removed: false,
        }),
        client_signal: Condvar::new(),
        upstream_signal: Condvar::new(),
      }),
    };

    trace_log!("relais: session {}: new connection from {}", session.inner.id, session.inner.peer.clone());
    Ok(session)
  }

  /// Starts the session's background machinery: the client writer and the dial
  /// thread (which becomes the upstream reader once connected). The caller must
  /// follow up with [Session::serve_client] to pump client data.
  pub(crate) fn begin(&self) -> RelaisResult<()> {
    let clone = self.clone();
    let spawned = self
      .inner
      .thread_adapter
      .spawn(Box::new(move || clone.run_writer(Side::Client)))
      .and_then(|_| {
        let clone = self.clone();
        self.inner.thread_adapter.spawn(Box::new(move || clone.run_dial()))
      });

    if let Err(err) = spawned {
      // Whatever already runs winds down through the regular close path.
      self.abort();
      return Err(err);
    }

    Ok(())
  }

  pub(crate) fn id(&self) -> u128 {
    self.inner.id
  }

  /// Relays client data until the client goes away. Runs on the listener's
  /// per-connection thread and only returns once the client endpoint is done.
  pub(crate) fn serve_client(&self) {
    self.run_reader(Side::Client);
  }

  /// Forced teardown of both endpoints, no flushing. Queued data is dropped and
  /// the session is removed immediately. Used when the manager's shutdown
  /// deadline has passed.
  pub(crate) fn abort(&self) {
    debug_log!("relais: session {}: forced close", self.inner.id);
    self.start_close(Side::Client, false);
    self.start_close(Side::Upstream, false);
  }

  fn lock_state(&self) -> MutexGuard<'_, SessionState> {
    match self.inner.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn wait_signal<'a>(
    &self,
    side: Side,
    guard: MutexGuard<'a, SessionState>,
  ) -> MutexGuard<'a, SessionState> {
    match self.signal(side).wait(guard) {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn signal(&self, side: Side) -> &Condvar {
    match side {
      Side::Client => &self.inner.client_signal,
      Side::Upstream => &self.inner.upstream_signal,
    }
  }

  /// New handle to the endpoint's stream, for use outside the lock.
  fn stream_for(&self, state: &SessionState, side: Side) -> Option<Box<dyn RelayStream>> {
    match side {
      Side::Client => Some(self.inner.client_stream.new_ref()),
      Side::Upstream => state.upstream_stream.as_ref().map(|stream| stream.new_ref()),
    }
  }

  /// Marks an endpoint closed under the lock, drops its queue and decides whether
  /// this caller has to remove the session: true iff both endpoints are now
  /// closed and nobody has claimed the removal yet.
  fn mark_closed(state: &mut SessionState, side: Side) -> bool {
    let endpoint = state.endpoint_mut(side);
    endpoint.conn = ConnState::Closed;
    endpoint.queue.clear();
    if state.endpoint(side.other()).conn == ConnState::Closed && !state.removed {
      state.removed = true;
      return true;
    }
    false
  }

  fn remove_from_host(&self) {
    trace_log!("relais: session {}: removed", self.inner.id);
    if let Some(host) = self.inner.host.upgrade() {
      host.remove_session(self.inner.id);
    }
  }

  ////////////////
  // Write path //
  ////////////////

  /// Queues an item for the given endpoint.
  ///
  /// Connecting: always queued, the writer drains it after the dial completes.
  /// Closed: dropped, the destination is gone.
  /// Connected: queued for the writer. Chunks respect the queue bound and block
  /// the producing reader until there is room again (that is the backpressure
  /// towards the sending peer); a close item is always accepted so a close can
  /// never deadlock behind a full queue.
  fn start_write(&self, side: Side, item: WriteItem) {
    let mut item = Some(item);
    let mut state = self.lock_state();
    loop {
      let limit = self.inner.settings.queue_limit;
      let endpoint = state.endpoint_mut(side);
      if endpoint.conn == ConnState::Closed {
        return;
      }

      if matches!(item, Some(WriteItem::Close)) || endpoint.queue.len() < limit {
        endpoint.queue.push_back(crate::util::unwrap_some(item.take()));
        drop(state);
        self.signal(side).notify_all();
        return;
      }

      state = self.wait_signal(side, state);
    }
  }

  /// Initiates closing of one endpoint.
  ///
  /// Graceful: enqueue a close item so all pending data is written first.
  /// Not graceful: close immediately, dropping whatever is still queued.
  fn start_close(&self, side: Side, graceful: bool) {
    if graceful {
      trace_log!("relais: session {}: closing {} after flush", self.inner.id, side.name());
      self.start_write(side, WriteItem::Close);
      return;
    }

    let (remove, stream) = {
      let mut state = self.lock_state();
      if state.endpoint(side).conn == ConnState::Closed {
        return;
      }
      let remove = Self::mark_closed(&mut state, side);
      (remove, self.stream_for(&state, side))
    };

    self.signal(side).notify_all();
    if let Some(stream) = stream {
      stream.close();
    }
    if remove {
      self.remove_from_host();
    }
  }

  /// Writer of one endpoint. Holds the endpoint's `writing` token while a write
  /// is in flight, which is what serializes writes per stream. Exits when the
  /// endpoint closes or when it processes a close item itself.
  fn run_writer(&self, side: Side) {
    let stream = {
      let state = self.lock_state();
      match self.stream_for(&state, side) {
        Some(stream) => stream,
        // Writers are only started for endpoints that have a stream.
        None => crate::util::unreachable(),
      }
    };

    loop {
      let item = {
        let mut state = self.lock_state();
        loop {
          let endpoint = state.endpoint_mut(side);
          if endpoint.conn == ConnState::Closed {
            endpoint.writing = false;
            return;
          }
          if let Some(item) = endpoint.queue.pop_front() {
            endpoint.writing = true;
            drop(state);
            // A queue slot freed up, a reader may be blocked on the bound.
            self.signal(side).notify_all();
            break item;
          }
          endpoint.writing = false;
          state = self.wait_signal(side, state);
        }
      };

      match item {
        WriteItem::Chunk(data) => {
          let result = stream.write_all(&data).and_then(|_| stream.flush());
          let mut state = self.lock_state();
          if !state.endpoint(side).writing {
            // Write completed but nothing was marked in flight.
            crate::util::unreachable();
          }
          state.endpoint_mut(side).writing = false;
          if let Err(err) = result {
            // Swallowed on purpose: the endpoint's own peer-closed event is the
            // one signal that tears this direction down.
            trace_log!(
              "relais: session {}: write to {} failed: {}",
              self.inner.id,
              side.name(),
              err
            );
          }
        }
        WriteItem::Close => {
          // Everything enqueued before this item has been written and flushed.
          let remove = {
            let mut state = self.lock_state();
            state.endpoint_mut(side).writing = false;
            Self::mark_closed(&mut state, side)
          };
          self.signal(side).notify_all();
          trace_log!("relais: session {}: {} closed", self.inner.id, side.name());
          stream.close();
          if remove {
            self.remove_from_host();
          }
          return;
        }
      }
    }
  }

  ///////////////
  // Read path //
  ///////////////

  /// Continuous read loop of one endpoint. Every chunk is forwarded to the other
  /// endpoint. Ends on EOF or error, which counts as the peer having closed.
  fn run_reader(&self, side: Side) {
    {
      let mut state = self.lock_state();
      let endpoint = state.endpoint_mut(side);
      if endpoint.conn == ConnState::Closed {
        // Closed before the first read. Whoever closed it has already taken
        // care of propagation and removal.
        return;
      }
      if endpoint.reading {
        crate::util::unreachable();
      }
      endpoint.reading = true;
    }

    let stream = {
      let state = self.lock_state();
      match self.stream_for(&state, side) {
        Some(stream) => stream,
        None => crate::util::unreachable(),
      }
    };

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
      match stream.read(&mut buf) {
        Ok(0) => break,
        Ok(n) => {
          debug_assert!(self.lock_state().endpoint(side).reading);
          let chunk = crate::util::unwrap_some(buf.get(..n)).to_vec();
          self.start_write(side.other(), WriteItem::Chunk(chunk));
        }
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => (),
        Err(err) => {
          trace_log!(
            "relais: session {}: read from {} ended: {}",
            self.inner.id,
            side.name(),
            err
          );
          break;
        }
      }
    }

    self.on_peer_closed(side);
  }

  /// The peer of this endpoint went away (EOF, error, or our own queued close
  /// took effect). Mirrors the close to the other endpoint, flushing first; the
  /// last endpoint to get here removes the session.
  fn on_peer_closed(&self, side: Side) {
    trace_log!("relais: session {}: {} peer closed", self.inner.id, side.name());

    let (remove, other_open, stream) = {
      let mut state = self.lock_state();
      state.endpoint_mut(side).reading = false;
      let other_open = state.endpoint(side.other()).conn != ConnState::Closed;
      let remove = Self::mark_closed(&mut state, side);
      (remove, other_open, self.stream_for(&state, side))
    };

    self.signal(side).notify_all();
    if let Some(stream) = stream {
      stream.close();
    }

    if remove {
      self.remove_from_host();
    } else if other_open {
      self.start_close(side.other(), true);
    }
  }

  ///////////////
  // Dial path //
  ///////////////

  /// Dials the upstream. On success this thread turns into the upstream reader.
  fn run_dial(&self) {
    let settings = &self.inner.settings;
    trace_log!(
      "relais: session {}: dialling {}:{}",
      self.inner.id,
      settings.host.clone(),
      settings.port
    );

    match settings.connector.connect(&settings.host, settings.port, settings.dial_timeout) {
      Ok(stream) => self.on_upstream_connected(stream),
      Err(err) => {
        debug_log!(
          "relais: session {}: dial to {}:{} failed: {}",
          self.inner.id,
          settings.host.clone(),
          settings.port,
          err
        );
        self.on_dial_failed();
      }
    }
  }

  fn on_upstream_connected(&self, stream: Box<dyn RelayStream>) {
    if let Err(err) = stream.set_nodelay(true) {
      trace_log!("relais: session {}: set_nodelay on upstream failed: {}", self.inner.id, err);
    }

    {
      let mut state = self.lock_state();
      match state.upstream.conn {
        ConnState::Connecting => (),
        ConnState::Closed => {
          // Torn down while the dial was in flight.
          drop(state);
          stream.close();
          return;
        }
        // A second connect for the same session cannot happen.
        ConnState::Connected => crate::util::unreachable(),
      }
      if state.upstream.writing {
        // No write may have run while the endpoint was still connecting.
        crate::util::unreachable();
      }
      state.upstream.conn = ConnState::Connected;
      state.upstream_stream = Some(stream);
    }

    trace_log!("relais: session {}: upstream connected", self.inner.id);

    // The writer drains everything the client sent during the dial, in order,
    // before it gets to anything newer.
    let clone = self.clone();
    if let Err(err) =
      self.inner.thread_adapter.spawn(Box::new(move || clone.run_writer(Side::Upstream)))
    {
      crate::error_log!(
        "relais: session {}: failed to spawn upstream writer: {}",
        self.inner.id,
        err
      );
      self.abort();
      return;
    }

    self.run_reader(Side::Upstream);
  }

  /// The upstream is closed before it ever was connected: drop whatever the
  /// client sent so far (the destination is gone) and close the client cleanly.
  fn on_dial_failed(&self) {
    let (remove, client_open) = {
      let mut state = self.lock_state();
      if state.upstream.conn == ConnState::Closed {
        // Torn down while the dial was in flight.
        return;
      }
      let client_open = state.client.conn != ConnState::Closed;
      let remove = Self::mark_closed(&mut state, Side::Upstream);
      (remove, client_open)
    };

    self.signal(Side::Upstream).notify_all();

    if remove {
      self.remove_from_host();
    } else if client_open {
      self.start_close(Side::Client, true);
    }
  }
}
