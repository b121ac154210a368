mod test_util;

use relais::{
  Listener, ListenerConfig, RelaisResult, RelayStream, TcpUpstreamConnector, UpstreamConnector,
};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use test_util::{connect_client, echo_upstream, pseudo_random_bytes, sink_upstream, wait_for};

/// Dials like the real thing, after an artificial delay. Keeps the upstream in
/// its connecting state for a while so data piles up in the session.
#[derive(Debug)]
struct DelayedConnector {
  delay: Duration,
}

impl UpstreamConnector for DelayedConnector {
  fn connect(
    &self,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
  ) -> RelaisResult<Box<dyn RelayStream>> {
    std::thread::sleep(self.delay);
    TcpUpstreamConnector.connect(host, port, timeout)
  }
}

/// Bytes sent while the upstream dial is still in flight must arrive complete,
/// in order, and before anything sent later.
#[test]
fn no_loss_across_the_connect_window() {
  let upstream = echo_upstream();
  let listener = Listener::bind_unpooled(
    ("127.0.0.1", 0),
    ListenerConfig::new("127.0.0.1", upstream.port()).with_upstream_connector(Arc::new(
      DelayedConnector { delay: Duration::from_millis(200) },
    )),
  )
  .expect("bind listener");
  listener.start().expect("start listener");
  let port = listener.local_addr().expect("local addr").port();

  let mut client = connect_client(port);
  // Lands while the dial is still sleeping.
  client.write_all(b"ABCDEFG").expect("send early");
  std::thread::sleep(Duration::from_millis(300));
  // Lands after the dial completed.
  client.write_all(b"HIJ").expect("send late");

  let mut echo = [0u8; 10];
  client.read_exact(&mut echo).expect("read echo");
  assert_eq!(&echo, b"ABCDEFGHIJ");

  client.shutdown(Shutdown::Write).expect("half close");
  assert!(wait_for(Duration::from_secs(5), || listener.live_session_count() == 0));
  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
}

/// Same, with a write queue bound of a single chunk: the proxy must stop reading
/// from the client instead of dropping anything.
#[test]
fn tiny_queue_limit_loses_nothing() {
  let upstream = echo_upstream();
  let listener = Listener::bind_unpooled(
    ("127.0.0.1", 0),
    ListenerConfig::new("127.0.0.1", upstream.port())
      .with_queue_limit(1)
      .with_upstream_connector(Arc::new(DelayedConnector { delay: Duration::from_millis(150) })),
  )
  .expect("bind listener");
  listener.start().expect("start listener");
  let port = listener.local_addr().expect("local addr").port();

  let payload = pseudo_random_bytes(256 * 1024, 42);
  let mut client = connect_client(port);

  let writer = {
    let payload = payload.clone();
    let mut sender = client.try_clone().expect("clone client");
    std::thread::spawn(move || {
      sender.write_all(&payload).expect("send payload");
      sender.shutdown(Shutdown::Write).expect("half close");
    })
  };

  let mut received = Vec::new();
  client.read_to_end(&mut received).expect("read echo");
  writer.join().expect("writer thread");
  assert_eq!(received, payload);

  assert!(wait_for(Duration::from_secs(5), || listener.live_session_count() == 0));
  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
}

/// The close also queues behind the connect window: a client that sends and
/// half-closes before the dial even finished still gets everything delivered to
/// the upstream, followed by the EOF.
#[test]
fn half_close_during_connect_window() {
  let (upstream, received) = sink_upstream();
  let listener = Listener::bind_unpooled(
    ("127.0.0.1", 0),
    ListenerConfig::new("127.0.0.1", upstream.port()).with_upstream_connector(Arc::new(
      DelayedConnector { delay: Duration::from_millis(200) },
    )),
  )
  .expect("bind listener");
  listener.start().expect("start listener");
  let port = listener.local_addr().expect("local addr").port();

  let mut client = connect_client(port);
  client.write_all(b"parting words").expect("send");
  client.shutdown(Shutdown::Write).expect("half close");

  // Everything queued during the window reaches the upstream, then the EOF.
  assert!(wait_for(Duration::from_secs(5), || received.lock().expect("lock").len() == 1));
  assert_eq!(received.lock().expect("lock").first().expect("first"), &b"parting words".to_vec());

  // The client connection ends cleanly.
  let mut rest = Vec::new();
  client.read_to_end(&mut rest).expect("drain");
  assert_eq!(rest, b"");

  assert!(wait_for(Duration::from_secs(5), || listener.live_session_count() == 0));
  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
}
