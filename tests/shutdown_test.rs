mod test_util;

use relais::{Listener, ListenerConfig, Manager, ShutdownMode};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_util::{connect_client, echo_upstream, wait_for};

fn managed_echo_proxy() -> (Manager, Arc<Listener>, u16) {
  let upstream = echo_upstream();
  let listener = Arc::new(
    Listener::bind_unpooled(("127.0.0.1", 0), ListenerConfig::new("127.0.0.1", upstream.port()))
      .expect("bind listener"),
  );
  let port = listener.local_addr().expect("local addr").port();

  let manager = Manager::new();
  manager.add(listener.clone());
  manager.start().expect("start manager");
  (manager, listener, port)
}

/// Opens a session and completes one echo roundtrip, so the session is
/// guaranteed to be established and counted.
fn open_session(port: u16) -> TcpStream {
  let mut client = connect_client(port);
  client.write_all(b"hi").expect("send");
  let mut echo = [0u8; 2];
  client.read_exact(&mut echo).expect("read echo");
  client
}

/// Graceful stop with a deadline and an idle-but-open session: accepting stops
/// immediately, the shutdown completes once the deadline fires, the session is
/// force-closed.
#[test]
fn graceful_stop_hits_the_deadline() {
  let (manager, listener, port) = managed_echo_proxy();

  let mut client = open_session(port);
  assert_eq!(manager.live_session_count(), 1);

  let started = Instant::now();
  manager.stop(ShutdownMode::DrainFor(Duration::from_secs(2)));
  assert!(manager.is_shutdown());
  assert!(manager.is_stopping());
  assert!(listener.is_marked_for_shutdown());

  // The client stays idle and open, so only the deadline ends the wait.
  assert!(manager.join(Some(Duration::from_secs(10))), "shutdown did not complete");
  assert!(started.elapsed() >= Duration::from_secs(2), "deadline fired early");
  assert!(manager.is_stopped());

  assert!(wait_for(Duration::from_secs(2), || manager.live_session_count() == 0));

  // The forced close reached the client.
  client.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");
  let mut rest = Vec::new();
  _ = client.read_to_end(&mut rest);
  assert_eq!(rest, b"");
}

/// Graceful stop completes as soon as the last session drains, well before the
/// deadline.
#[test]
fn graceful_stop_completes_when_drained() {
  let (manager, _listener, port) = managed_echo_proxy();

  let client = open_session(port);
  assert_eq!(manager.live_session_count(), 1);

  let started = Instant::now();
  manager.stop(ShutdownMode::DrainFor(Duration::from_secs(30)));

  // Client wraps up on its own.
  client.shutdown(Shutdown::Both).expect("close client");

  assert!(manager.join(Some(Duration::from_secs(10))), "shutdown did not complete");
  assert!(started.elapsed() < Duration::from_secs(20), "drain waited for the deadline");
  assert_eq!(manager.live_session_count(), 0);
}

/// Immediate stop closes live sessions right away.
#[test]
fn immediate_stop_closes_sessions() {
  let (manager, _listener, port) = managed_echo_proxy();

  let mut client = open_session(port);
  assert_eq!(manager.live_session_count(), 1);

  manager.stop(ShutdownMode::Immediate);
  assert!(manager.join(Some(Duration::from_secs(10))));
  assert!(wait_for(Duration::from_secs(2), || manager.live_session_count() == 0));

  client.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");
  let mut rest = Vec::new();
  _ = client.read_to_end(&mut rest);
  assert_eq!(rest, b"");
}

/// After stop, freshly connecting clients are not served anymore.
#[test]
fn no_accepts_after_stop() {
  let (manager, _listener, port) = managed_echo_proxy();

  manager.stop(ShutdownMode::Immediate);
  assert!(manager.join(Some(Duration::from_secs(10))));

  // The connect itself may land in the dead socket's backlog, but nothing will
  // ever serve it: no echo comes back.
  if let Ok(mut client) = TcpStream::connect(("127.0.0.1", port)) {
    client.set_read_timeout(Some(Duration::from_millis(500))).expect("set read timeout");
    _ = client.write_all(b"anyone there?");
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
      Ok(0) => (),  // connection dropped, fine
      Ok(n) => panic!("received {n} bytes from a stopped proxy"),
      Err(_) => (), // timeout, fine
    }
  }

  assert_eq!(manager.live_session_count(), 0);
}

/// Listener handles are add/remove-able and the counts follow.
#[test]
fn add_and_remove_listeners() {
  let upstream = echo_upstream();
  let manager = Manager::new();
  assert_eq!(manager.listener_count(), 0);

  let make_listener = || {
    Arc::new(
      Listener::bind_unpooled(
        ("127.0.0.1", 0),
        ListenerConfig::new("127.0.0.1", upstream.port()),
      )
      .expect("bind listener"),
    )
  };

  let first = manager.add(make_listener());
  let second = manager.add(make_listener());
  assert_eq!(manager.listener_count(), 2);

  assert!(manager.remove(first));
  assert!(!manager.remove(first));
  assert_eq!(manager.listener_count(), 1);

  manager.start().expect("start manager");
  manager.stop(ShutdownMode::Drain);
  assert!(manager.join(Some(Duration::from_secs(10))));
  assert!(manager.remove(second));
  assert_eq!(manager.listener_count(), 0);
}

/// run() blocks until another thread stops the manager.
#[test]
fn run_blocks_until_stopped() {
  let upstream = echo_upstream();
  let listener = Arc::new(
    Listener::bind_unpooled(("127.0.0.1", 0), ListenerConfig::new("127.0.0.1", upstream.port()))
      .expect("bind listener"),
  );
  let manager = Arc::new(Manager::new());
  manager.add(listener);

  let runner = {
    let manager = manager.clone();
    std::thread::spawn(move || {
      manager.run().expect("run");
    })
  };

  std::thread::sleep(Duration::from_millis(100));
  assert!(!manager.is_stopped());
  manager.stop(ShutdownMode::Immediate);
  runner.join().expect("runner thread");
  assert!(manager.is_stopped());
}
