//! The top level: a Manager owns any number of listeners and coordinates
//! startup and (graceful) shutdown across all of them.

use crate::functional_traits::{DefaultThreadAdapter, ThreadAdapter};
use crate::listener::Listener;
use crate::relais_error::{RelaisError, RelaisResult};
use crate::util::ConnWait;
use crate::{info_log, trace_log, warn_log};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How a [Manager::stop] treats sessions that are still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop listening and close all live sessions right away, dropping whatever
  /// data they still had in flight.
  Immediate,
  /// Stop listening, then wait however long it takes until all live sessions
  /// have finished on their own.
  Drain,
  /// Stop listening, wait for live sessions to finish, but force-close whatever
  /// is left once the duration has elapsed.
  DrainFor(Duration),
}

/// Interval in which the drain monitor rechecks the live session count.
const DRAIN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ManagedListener {
  handle: usize,
  listener: Arc<Listener>,
}

#[derive(Debug)]
struct ManagerInner {
  listeners: Mutex<Vec<ManagedListener>>,
  next_handle: AtomicUsize,
  thread_adapter: Arc<dyn ThreadAdapter>,
  shutdown_flag: AtomicBool,
  /// level 1: all listeners told to stop accepting. level 2: fully stopped.
  waiter: ConnWait,
}

/// Owns a set of [Listener]s and manages them as one unit.
///
/// Dropping the manager performs an [ShutdownMode::Immediate] stop.
#[derive(Debug)]
pub struct Manager {
  inner: Arc<ManagerInner>,
}

impl Default for Manager {
  fn default() -> Self {
    Self::new()
  }
}

impl Manager {
  /// Creates an empty manager.
  /// Threads are created using "thread::Builder::new().spawn"
  pub fn new() -> Manager {
    Self::with_thread_adapter(DefaultThreadAdapter)
  }

  /// Creates an empty manager whose own background threads (the drain monitor)
  /// are created through the given adapter.
  pub fn with_thread_adapter(thread_adapter: impl ThreadAdapter + 'static) -> Manager {
    Manager {
      inner: Arc::new(ManagerInner {
        listeners: Mutex::new(Vec::new()),
        next_handle: AtomicUsize::new(1),
        thread_adapter: Arc::new(thread_adapter),
        shutdown_flag: AtomicBool::new(false),
        waiter: ConnWait::default(),
      }),
    }
  }

  fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<ManagedListener>> {
    match self.inner.listeners.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn listeners_snapshot(&self) -> Vec<Arc<Listener>> {
    self.lock_listeners().iter().map(|managed| managed.listener.clone()).collect()
  }

  /// Adds a listener. Returns a handle that can later be passed to
  /// [Manager::remove]. The listener is not started by this call.
  pub fn add(&self, listener: Arc<Listener>) -> usize {
    let handle = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
    self.lock_listeners().push(ManagedListener { handle, listener });
    handle
  }

  /// Stops and removes the listener with the given handle. Live sessions of that
  /// listener are untouched. Returns false if no such listener exists.
  pub fn remove(&self, handle: usize) -> bool {
    let listener = {
      let mut guard = self.lock_listeners();
      match guard.iter().position(|managed| managed.handle == handle) {
        Some(index) => Some(guard.remove(index)),
        None => None,
      }
    };

    match listener {
      Some(managed) => {
        managed.listener.stop();
        true
      }
      None => false,
    }
  }

  /// Starts all listeners. Fails on the first listener that cannot start.
  pub fn start(&self) -> RelaisResult<()> {
    if self.inner.shutdown_flag.load(Ordering::SeqCst) {
      return Err(RelaisError::from_io_kind(ErrorKind::ConnectionAborted));
    }

    for listener in self.listeners_snapshot() {
      listener.start()?;
    }
    Ok(())
  }

  /// Starts all listeners and then blocks until the manager is stopped by
  /// another thread (for example from a signal handler).
  pub fn run(&self) -> RelaisResult<()> {
    self.start()?;
    self.join(None);
    Ok(())
  }

  /// Stops the manager. All listeners stop accepting immediately; what happens
  /// to live sessions depends on the mode. Nonblocking: with a drain mode the
  /// wait happens on a background thread, use [Manager::join] to await it.
  /// Only the first call does anything.
  pub fn stop(&self, mode: ShutdownMode) {
    if self.inner.shutdown_flag.swap(true, Ordering::SeqCst) {
      return;
    }

    info_log!("relais: manager: stopping ({:?})", mode);

    let listeners = self.listeners_snapshot();
    for listener in &listeners {
      listener.stop();
    }
    self.inner.waiter.signal(1);

    let deadline = match mode {
      ShutdownMode::Immediate => {
        Self::finish(&self.inner, &listeners);
        return;
      }
      ShutdownMode::Drain => None,
      ShutdownMode::DrainFor(timeout) => Some(Instant::now() + timeout),
    };

    if Self::count(&listeners) == 0 {
      Self::finish(&self.inner, &listeners);
      return;
    }

    let inner = self.inner.clone();
    let spawned = self.inner.thread_adapter.spawn(Box::new(move || {
      Self::drain(&inner, &listeners, deadline);
    }));

    if let Err(err) = spawned {
      crate::error_log!(
        "relais: manager: failed to spawn the drain monitor err={}, closing sessions now",
        err
      );
      Self::finish(&self.inner, &self.listeners_snapshot());
    }
  }

  /// Instructs the manager to stop and waits for the shutdown to complete.
  /// Returns true if it completed, false if the timeout occurred (the shutdown
  /// then continues in the background and join can be called again).
  pub fn stop_and_join(&self, mode: ShutdownMode, timeout: Option<Duration>) -> bool {
    self.stop(mode);
    self.join(timeout)
  }

  /// Blocks, possibly forever, until the manager is fully stopped.
  /// Returns true if it is stopped, false if the timeout occurred.
  pub fn join(&self, timeout: Option<Duration>) -> bool {
    self.inner.waiter.wait(2, timeout)
  }

  /// Returns true if the manager was told to stop.
  pub fn is_shutdown(&self) -> bool {
    self.inner.shutdown_flag.load(Ordering::SeqCst)
  }

  /// Returns true if all listeners have been told to stop accepting.
  pub fn is_stopping(&self) -> bool {
    self.inner.waiter.is_done(1)
  }

  /// Returns true if shutdown has fully completed, join will not block if this
  /// fn returns true.
  pub fn is_stopped(&self) -> bool {
    self.inner.waiter.is_done(2)
  }

  /// Number of sessions currently alive across all listeners.
  pub fn live_session_count(&self) -> usize {
    Self::count(&self.listeners_snapshot())
  }

  /// Number of listeners this manager holds.
  pub fn listener_count(&self) -> usize {
    self.lock_listeners().len()
  }

  fn count(listeners: &[Arc<Listener>]) -> usize {
    listeners.iter().map(|listener| listener.live_session_count()).sum()
  }

  /// Periodically rechecks the live session count until everything drained or
  /// the deadline passed, then finishes the shutdown.
  fn drain(inner: &Arc<ManagerInner>, listeners: &[Arc<Listener>], deadline: Option<Instant>) {
    loop {
      let live = Self::count(listeners);
      if live == 0 {
        break;
      }

      if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
          warn_log!(
            "relais: manager: drain deadline reached with {} session(s) still open",
            live
          );
          break;
        }
      }

      trace_log!("relais: manager: waiting for {} session(s)", live);
      let tick = match deadline {
        Some(deadline) => DRAIN_TICK.min(deadline.saturating_duration_since(Instant::now())),
        None => DRAIN_TICK,
      };
      std::thread::sleep(tick);
    }

    Self::finish(inner, listeners);
  }

  fn finish(inner: &Arc<ManagerInner>, listeners: &[Arc<Listener>]) {
    for listener in listeners {
      listener.abort_sessions();
    }
    inner.waiter.signal(2);
    info_log!("relais: manager: stopped");
  }
}

impl Drop for Manager {
  fn drop(&mut self) {
    self.stop(ShutdownMode::Immediate);
    trace_log!("relais: manager: drop");
  }
}
