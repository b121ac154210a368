mod test_util;

use log::LevelFilter;
use relais::{Listener, ListenerConfig};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use test_util::{
  connect_client, echo_upstream, oneshot_upstream, pseudo_random_bytes, sink_upstream, wait_for,
};

fn start_plain_listener(upstream_port: u16) -> Arc<Listener> {
  let listener = Listener::bind_unpooled(
    ("127.0.0.1", 0),
    ListenerConfig::new("127.0.0.1", upstream_port),
  )
  .expect("bind listener");
  listener.start().expect("start listener");
  Arc::new(listener)
}

/// Client sends "hello", gets the echo back, half-closes. The upstream must see
/// the EOF, the session must clean itself up, the count must return to zero.
#[test]
fn echo_roundtrip_and_half_close() {
  trivial_log::init_stdout(LevelFilter::Trace).expect("init log");

  let upstream = echo_upstream();
  let listener = start_plain_listener(upstream.port());
  let port = listener.local_addr().expect("local addr").port();

  let mut client = connect_client(port);
  client.write_all(b"hello").expect("send");

  let mut echo = [0u8; 5];
  client.read_exact(&mut echo).expect("read echo");
  assert_eq!(&echo, b"hello");

  client.shutdown(Shutdown::Write).expect("half close");

  // The proxy propagates the close; the client connection ends cleanly.
  let mut rest = Vec::new();
  client.read_to_end(&mut rest).expect("drain");
  assert_eq!(rest, b"");

  assert!(
    wait_for(Duration::from_secs(5), || listener.live_session_count() == 0),
    "session was not removed"
  );

  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
  trivial_log::free();
}

/// The upstream closes first: the client must receive the full payload, then EOF.
#[test]
fn upstream_close_propagates_to_client() {
  let payload = pseudo_random_bytes(64 * 1024, 7);
  let upstream = oneshot_upstream(payload.clone());
  let listener = start_plain_listener(upstream.port());
  let port = listener.local_addr().expect("local addr").port();

  let mut client = connect_client(port);
  let mut received = Vec::new();
  client.read_to_end(&mut received).expect("read payload");
  assert_eq!(received, payload);

  assert!(
    wait_for(Duration::from_secs(5), || listener.live_session_count() == 0),
    "session was not removed"
  );

  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
}

/// Two concurrent clients push 1 MiB each through the proxy into a sink.
/// Both streams must arrive byte-identical and both sessions must clean up.
#[test]
fn concurrent_bulk_transfer() {
  let (upstream, received) = sink_upstream();
  let listener = start_plain_listener(upstream.port());
  let port = listener.local_addr().expect("local addr").port();

  let payload_a = pseudo_random_bytes(1024 * 1024, 1);
  let payload_b = pseudo_random_bytes(1024 * 1024, 2);

  let send = |payload: Vec<u8>| {
    let mut client = connect_client(port);
    std::thread::spawn(move || {
      for chunk in payload.chunks(64 * 1024) {
        client.write_all(chunk).expect("send chunk");
      }
      client.shutdown(Shutdown::Write).expect("half close");
      // Wait for the proxy to finish with us.
      let mut rest = Vec::new();
      _ = client.read_to_end(&mut rest);
    })
  };

  let thread_a = send(payload_a.clone());
  let thread_b = send(payload_b.clone());
  thread_a.join().expect("client a");
  thread_b.join().expect("client b");

  assert!(
    wait_for(Duration::from_secs(10), || received.lock().expect("lock").len() == 2),
    "upstream did not receive both streams"
  );

  {
    let received = received.lock().expect("lock");
    let mut streams: Vec<&Vec<u8>> = received.iter().collect();
    // Order of arrival is not defined, match by content.
    streams.sort_by_key(|data| data.as_slice().first().copied());
    let mut expected: Vec<&Vec<u8>> = vec![&payload_a, &payload_b];
    expected.sort_by_key(|data| data.as_slice().first().copied());
    assert_eq!(streams, expected);
  }

  assert!(
    wait_for(Duration::from_secs(5), || listener.live_session_count() == 0),
    "sessions were not removed"
  );

  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
}

/// Session accounting does not drift: many sequential connections always end at
/// a live count of zero.
#[test]
fn repeated_sessions_do_not_leak() {
  let upstream = echo_upstream();
  let listener = start_plain_listener(upstream.port());
  let port = listener.local_addr().expect("local addr").port();

  for round in 0..20u8 {
    let mut client = connect_client(port);
    let payload = [round; 17];
    client.write_all(&payload).expect("send");
    let mut echo = [0u8; 17];
    client.read_exact(&mut echo).expect("read echo");
    assert_eq!(echo, payload);
    client.shutdown(Shutdown::Write).expect("half close");
    let mut rest = Vec::new();
    _ = client.read_to_end(&mut rest);

    assert!(
      wait_for(Duration::from_secs(5), || listener.live_session_count() == 0),
      "session of round {round} was not removed"
    );
  }

  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
}

/// Raw TcpStream sanity for the sort key above: first byte differs.
#[test]
fn pseudo_random_streams_differ() {
  let a = pseudo_random_bytes(16, 1);
  let b = pseudo_random_bytes(16, 2);
  assert_ne!(a, b);
}
