//! The accept side: a Listener binds a socket, accepts client connections on a
//! background thread and runs one Session per connection. It owns its sessions
//! until they remove themselves.

use crate::functional_traits::{DefaultThreadAdapter, ThreadAdapter, ThreadAdapterJoinHandle};
use crate::relais_error::{RelaisError, RelaisResult};
use crate::session::{Session, SessionHost};
use crate::stream::{IntoRelayStream, RelayStream};
use crate::upstream::{TcpUpstreamConnector, UpstreamConnector, UpstreamSettings};
use crate::util::{panic_msg, unwrap_poison, ConnWait};
use crate::{error_log, info_log, trace_log};
use defer_heavy::defer;
use listener_poll::PollEx;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[cfg(feature = "tls")]
use crate::tls_stream::TlsStream;
#[cfg(feature = "tls")]
use crate::upstream::OutboundTls;
#[cfg(feature = "tls")]
use crate::upstream::TlsUpstreamConnector;
#[cfg(feature = "tls")]
use rustls::{ServerConfig, ServerConnection};

/// How often the accept thread wakes up to check the shutdown flag when no
/// connection is arriving.
pub(crate) const SHUTDOWN_FLAG_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// This constant contains the amount of time to wait to confirm that the accept
/// thread did begin shutting down. Considerations for this value are the time for
/// the scheduler to wake up the accept thread and the time it takes for that
/// thread to process a few lines of code.
///
/// If this value is too small we log an error and later succeed anyway.
/// If this value is too big we may block for this amount of time without the
/// user of relais expecting it.
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound of a session's per direction write queue, in chunks.
const DEFAULT_QUEUE_LIMIT: usize = 256;

/// Per listener configuration: the upstream all accepted connections are
/// forwarded to, and how to get there.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
  target_host: String,
  target_port: u16,
  dial_timeout: Option<Duration>,
  queue_limit: usize,
  connector: Option<Arc<dyn UpstreamConnector>>,
  #[cfg(feature = "tls")]
  inbound_tls: Option<Arc<ServerConfig>>,
  #[cfg(feature = "tls")]
  outbound_tls: Option<OutboundTls>,
}

impl ListenerConfig {
  /// Forward every accepted connection to `target_host:target_port`,
  /// plain tcp on both sides.
  pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
    ListenerConfig {
      target_host: target_host.into(),
      target_port,
      dial_timeout: None,
      queue_limit: DEFAULT_QUEUE_LIMIT,
      connector: None,
      #[cfg(feature = "tls")]
      inbound_tls: None,
      #[cfg(feature = "tls")]
      outbound_tls: None,
    }
  }

  /// Terminate TLS on accepted connections. The config carries at least the
  /// server certificate and private key.
  #[cfg(feature = "tls")]
  pub fn with_inbound_tls(mut self, config: Arc<ServerConfig>) -> Self {
    self.inbound_tls = Some(config);
    self
  }

  /// Open the upstream connections through a TLS tunnel.
  #[cfg(feature = "tls")]
  pub fn with_outbound_tls(mut self, tls: OutboundTls) -> Self {
    self.outbound_tls = Some(tls);
    self
  }

  /// Bound the time a single upstream dial may take. Default: unbounded, a dial
  /// that never completes is only cleaned up by a manager shutdown deadline.
  pub fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.dial_timeout = timeout;
    self
  }

  /// Maximum number of chunks a session buffers per direction before it stops
  /// reading from the faster peer. Values below 1 are treated as 1.
  pub fn with_queue_limit(mut self, limit: usize) -> Self {
    self.queue_limit = limit.max(1);
    self
  }

  /// Dial the upstream through a custom [UpstreamConnector] instead of the
  /// built-in tcp/tls ones. Overrides [ListenerConfig::with_outbound_tls].
  pub fn with_upstream_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
    self.connector = Some(connector);
    self
  }
}

/// Handle to one proxy listener: a bound socket plus the set of sessions
/// accepted through it.
#[derive(Debug)]
pub struct Listener {
  main_thread: Mutex<Option<ThreadAdapterJoinHandle>>,
  core: Arc<ListenerCore>,
}

#[derive(Debug)]
struct ListenerCore {
  listener: TcpListener,
  addr_string: String,
  thread_adapter: Arc<dyn ThreadAdapter>,
  settings: Arc<UpstreamSettings>,
  #[cfg(feature = "tls")]
  inbound_tls: Option<Arc<ServerConfig>>,
  started: AtomicBool,
  shutdown_flag: AtomicBool,
  /// Set once a forced teardown ran, so an accept racing it does not leave a
  /// fresh session behind.
  discard_sessions: AtomicBool,
  waiter: ConnWait,
  sessions: Mutex<Vec<Session>>,
}

impl SessionHost for ListenerCore {
  fn remove_session(&self, id: u128) {
    let mut guard = match self.sessions.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    guard.retain(|session| session.id() != id);
  }
}

impl ListenerCore {
  fn next(&self) -> io::Result<(TcpStream, SocketAddr)> {
    loop {
      if self.shutdown_flag.load(Ordering::SeqCst) {
        return Err(io::ErrorKind::ConnectionAborted.into());
      }

      if !self.listener.poll(Some(SHUTDOWN_FLAG_POLLING_INTERVAL))? {
        continue;
      }

      return self.listener.accept();
    }
  }

  fn run(core: &Arc<ListenerCore>) {
    defer! {
      core.waiter.signal(2);
    }

    info_log!(
      "relais: listener[{}]: forwarding to {}:{}, listening...",
      &core.addr_string,
      &core.settings.host,
      core.settings.port
    );

    for this_connection in 1u128.. {
      let accepted = core.next();
      if core.shutdown_flag.load(Ordering::SeqCst) {
        info_log!("relais: listener[{}]: shutdown", &core.addr_string);
        break;
      }

      match accepted {
        Ok((stream, peer)) => {
          info_log!(
            "relais: listener[{}]: connection {} accepted from {}",
            &core.addr_string,
            this_connection,
            peer
          );

          let core_clone = core.clone();
          let peer = peer.to_string();
          if let Err(err) = core.thread_adapter.spawn(Box::new(move || {
            ListenerCore::handle_connection(&core_clone, stream, peer, this_connection);
          })) {
            //May recover on its own courtesy of the OS once load decreases.
            error_log!("relais: listener[{}]: connection {} failed to spawn new thread to handle the connection err={}, will drop connection.", &core.addr_string, this_connection, err);
          }
        }
        Err(err) => {
          // This may just affect a single connection and is likely to recover on its own?
          error_log!(
            "relais: listener[{}]: connection {} failed to accept err={}",
            &core.addr_string,
            this_connection,
            err
          );
        }
      }
    }

    core.waiter.signal(1);
    info_log!("relais: listener[{}]: no longer accepting", &core.addr_string);
  }

  fn handle_connection(
    core: &Arc<ListenerCore>,
    stream: TcpStream,
    peer: String,
    this_connection: u128,
  ) {
    // This call is not needed on linux but is needed on windows, where the
    // accepted socket inherits the listener's non-blocking flag.
    // See https://github.com/rust-lang/rust/issues/67027
    if let Err(err) = stream.set_nonblocking(false) {
      error_log!(
        "relais: listener[{}]: connection {} failed to call TcpStream::set_nonblocking(false) err={}",
        &core.addr_string,
        this_connection,
        err
      );
      return;
    }

    #[cfg(feature = "tls")]
    let relay_stream: Box<dyn RelayStream> = match core.inbound_tls.as_ref() {
      Some(config) => {
        match TlsStream::accept(stream, config.clone(), core.thread_adapter.as_ref()) {
          Ok(stream) => stream,
          Err(err) => {
            error_log!(
              "relais: listener[{}]: connection {} failed to construct TlsStream err={}",
              &core.addr_string,
              this_connection,
              err
            );
            return;
          }
        }
      }
      None => stream.into_relay_stream(),
    };

    #[cfg(not(feature = "tls"))]
    let relay_stream: Box<dyn RelayStream> = stream.into_relay_stream();

    let core_dyn: Arc<dyn SessionHost> = core.clone();
    let host: Weak<dyn SessionHost> = Arc::downgrade(&core_dyn);
    let session = match Session::prepare(
      host,
      relay_stream,
      peer,
      core.settings.clone(),
      core.thread_adapter.clone(),
    ) {
      Ok(session) => session,
      Err(err) => {
        error_log!(
          "relais: listener[{}]: connection {} failed to create session err={}",
          &core.addr_string,
          this_connection,
          err
        );
        return;
      }
    };

    // Registered before anything runs, so the session's own removal always
    // finds it in the set.
    {
      let mut guard = match core.sessions.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      guard.push(session.clone());
    }

    if let Err(err) = session.begin() {
      error_log!(
        "relais: listener[{}]: connection {} failed to start session err={}",
        &core.addr_string,
        this_connection,
        err
      );
      return;
    }

    if core.discard_sessions.load(Ordering::SeqCst) {
      // A forced teardown swept the set while this connection was being set up.
      session.abort();
    }

    session.serve_client();
    trace_log!(
      "relais: listener[{}]: connection {} done",
      &core.addr_string,
      this_connection
    );
  }

  fn abort_sessions(&self) {
    self.discard_sessions.store(true, Ordering::SeqCst);
    let sessions = match self.sessions.lock() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    };
    for session in sessions {
      session.abort();
    }
  }

  fn shutdown(&self) {
    if self.shutdown_flag.swap(true, Ordering::SeqCst) {
      return;
    }

    if !self.started.load(Ordering::SeqCst) {
      // The accept thread never existed, nobody else will signal completion.
      self.waiter.signal(2);
      return;
    }

    if !self.waiter.wait(1, Some(SHUTDOWN_TIMEOUT)) {
      error_log!(
        "relais: listener[{}]: stop failed to wake up the accept thread",
        &self.addr_string
      );
    }
  }
}

impl Listener {
  /// Binds a listener on the given addr. Accepting only starts with
  /// [Listener::start]. All threads are created through the given adapter.
  pub fn bind(
    addr: impl ToSocketAddrs,
    config: ListenerConfig,
    thread_adapter: impl ThreadAdapter + 'static,
  ) -> RelaisResult<Listener> {
    let mut addr_string = String::new();
    let addr_in_vec = addr.to_socket_addrs()?.collect::<Vec<SocketAddr>>();

    for addr in &addr_in_vec {
      if !addr_string.is_empty() {
        addr_string += ", ";
      }
      addr_string += addr.to_string().as_str();
    }

    let thread_adapter: Arc<dyn ThreadAdapter> = Arc::new(thread_adapter);

    #[cfg(feature = "tls")]
    if let Some(tls) = config.inbound_tls.as_ref() {
      //Check if the rust-tls server config is "valid".
      let _ = ServerConnection::new(tls.clone())?;
    }

    let connector = match config.connector.clone() {
      Some(connector) => connector,
      None => Self::default_connector(&config, &thread_adapter),
    };

    let settings = Arc::new(UpstreamSettings {
      host: config.target_host.clone(),
      port: config.target_port,
      dial_timeout: config.dial_timeout,
      queue_limit: config.queue_limit,
      connector,
    });

    let listener = TcpListener::bind(addr_in_vec.as_slice())?;
    listener.set_nonblocking(true)?;

    let core = Arc::new(ListenerCore {
      listener,
      addr_string,
      thread_adapter,
      settings,
      #[cfg(feature = "tls")]
      inbound_tls: config.inbound_tls.clone(),
      started: AtomicBool::new(false),
      shutdown_flag: AtomicBool::new(false),
      discard_sessions: AtomicBool::new(false),
      waiter: ConnWait::default(),
      sessions: Mutex::new(Vec::new()),
    });

    Ok(Listener { main_thread: Mutex::new(None), core })
  }

  /// Binds a listener on the given addr. Accepting only starts with
  /// [Listener::start].
  ///
  /// Threads are created using "thread::Builder::new().spawn"
  pub fn bind_unpooled(addr: impl ToSocketAddrs, config: ListenerConfig) -> RelaisResult<Listener> {
    Self::bind(addr, config, DefaultThreadAdapter)
  }

  fn default_connector(
    config: &ListenerConfig,
    thread_adapter: &Arc<dyn ThreadAdapter>,
  ) -> Arc<dyn UpstreamConnector> {
    #[cfg(feature = "tls")]
    if let Some(tls) = config.outbound_tls.as_ref() {
      return Arc::new(TlsUpstreamConnector::new(tls.client_config(), thread_adapter.clone()));
    }

    #[cfg(not(feature = "tls"))]
    let _ = (config, thread_adapter);

    Arc::new(TcpUpstreamConnector)
  }

  /// Starts accepting connections on a background thread. Calling this on an
  /// already running listener does nothing.
  pub fn start(&self) -> RelaisResult<()> {
    if self.core.shutdown_flag.load(Ordering::SeqCst) {
      return Err(RelaisError::from_io_kind(io::ErrorKind::ConnectionAborted));
    }

    if self.core.started.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    let core = self.core.clone();
    let handle = match self.core.thread_adapter.spawn(Box::new(move || ListenerCore::run(&core)))
    {
      Ok(handle) => handle,
      Err(err) => {
        self.core.started.store(false, Ordering::SeqCst);
        return Err(err);
      }
    };

    let mut guard = match self.main_thread.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(handle);
    Ok(())
  }

  /// Stops accepting new connections. Live sessions are untouched; they finish
  /// on their own (or through the manager's shutdown deadline).
  pub fn stop(&self) {
    self.core.shutdown();
  }

  /// Returns true if the listener is marked to shut down.
  pub fn is_marked_for_shutdown(&self) -> bool {
    self.core.shutdown_flag.load(Ordering::SeqCst)
  }

  /// Returns true if the accept thread has finished, join will not block if this
  /// fn returns true.
  pub fn is_stopped(&self) -> bool {
    self.core.waiter.is_done(2)
  }

  /// Blocks, possibly forever, until the accept thread is done.
  /// Returns true if it is done, false if the timeout occurred.
  pub fn join(&self, timeout: Option<Duration>) -> bool {
    if !self.core.waiter.wait(2, timeout) {
      return false;
    }

    let Ok(mut guard) = self.main_thread.lock() else {
      return false;
    };

    let Some(join_handle) = guard.take() else {
      return true;
    };

    if let Err(err) = join_handle.join() {
      //Code for panic enjoyers
      panic_msg(err, |msg| {
        error_log!(
          "relais: listener[{}]: accept thread panicked: {}",
          &self.core.addr_string,
          msg
        );
      });
    }

    true
  }

  /// Instructs the listener to stop accepting and waits for the accept thread.
  /// Returns true if that completed, false if the timeout occurred.
  pub fn stop_and_join(&self, timeout: Option<Duration>) -> bool {
    self.stop();
    self.join(timeout)
  }

  /// Number of sessions currently alive on this listener.
  pub fn live_session_count(&self) -> usize {
    unwrap_poison(self.core.sessions.lock()).map(|guard| guard.len()).unwrap_or_default()
  }

  /// The addresses this listener was asked to bind, as one display string.
  pub fn addr(&self) -> &str {
    &self.core.addr_string
  }

  /// The actual local address of the bound socket. Useful after binding port 0.
  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.core.listener.local_addr()
  }

  pub(crate) fn abort_sessions(&self) {
    self.core.abort_sessions();
  }
}
