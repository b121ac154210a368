mod test_util;

use relais::{Listener, ListenerConfig, RelaisResult, RelayStream, UpstreamConnector};
use std::io;
use std::io::Write;
use std::net::Shutdown;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use test_util::{connect_client, wait_for};

/// Fault injecting upstream stream: records all written bytes, trips a flag if
/// two writes ever overlap, and blocks reads until closed.
#[derive(Debug, Clone)]
struct SerializingSink {
  data: Arc<Mutex<Vec<u8>>>,
  writes_in_flight: Arc<AtomicUsize>,
  overlap: Arc<AtomicBool>,
  closed: Arc<(Mutex<bool>, Condvar)>,
}

impl SerializingSink {
  fn new() -> SerializingSink {
    SerializingSink {
      data: Arc::new(Mutex::new(Vec::new())),
      writes_in_flight: Arc::new(AtomicUsize::new(0)),
      overlap: Arc::new(AtomicBool::new(false)),
      closed: Arc::new((Mutex::new(false), Condvar::new())),
    }
  }

  fn is_closed(&self) -> bool {
    *self.closed.0.lock().expect("closed lock")
  }
}

impl RelayStream for SerializingSink {
  fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
    // Nothing to say, ever. Block until the session closes us, then EOF.
    let (lock, cvar) = &*self.closed;
    let mut closed = lock.lock().expect("closed lock");
    while !*closed {
      closed = cvar.wait(closed).expect("closed wait");
    }
    Ok(0)
  }

  fn write_all(&self, buf: &[u8]) -> io::Result<()> {
    if self.is_closed() {
      return Err(io::ErrorKind::BrokenPipe.into());
    }

    if self.writes_in_flight.fetch_add(1, SeqCst) != 0 {
      self.overlap.store(true, SeqCst);
    }
    // Widen the race window, a second concurrent writer would be caught above.
    std::thread::sleep(Duration::from_micros(200));
    self.data.lock().expect("data lock").extend_from_slice(buf);
    self.writes_in_flight.fetch_sub(1, SeqCst);
    Ok(())
  }

  fn flush(&self) -> io::Result<()> {
    Ok(())
  }

  fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
    Ok(())
  }

  fn close(&self) {
    let (lock, cvar) = &*self.closed;
    *lock.lock().expect("closed lock") = true;
    cvar.notify_all();
  }

  fn peer_addr(&self) -> io::Result<String> {
    Ok("mock".to_string())
  }

  fn local_addr(&self) -> io::Result<String> {
    Ok("mock".to_string())
  }

  fn new_ref(&self) -> Box<dyn RelayStream> {
    Box::new(self.clone()) as Box<dyn RelayStream>
  }
}

#[derive(Debug)]
struct SinkConnector {
  sink: SerializingSink,
}

impl UpstreamConnector for SinkConnector {
  fn connect(
    &self,
    _host: &str,
    _port: u16,
    _timeout: Option<Duration>,
  ) -> RelaisResult<Box<dyn RelayStream>> {
    Ok(Box::new(self.sink.clone()) as Box<dyn RelayStream>)
  }
}

/// Rapid small writes never overlap on the destination stream, and arrive as
/// the exact concatenation of what the client sent.
#[test]
fn writes_are_serialized_and_ordered() {
  let sink = SerializingSink::new();
  let listener = Listener::bind_unpooled(
    ("127.0.0.1", 0),
    ListenerConfig::new("127.0.0.1", 9)
      .with_upstream_connector(Arc::new(SinkConnector { sink: sink.clone() })),
  )
  .expect("bind listener");
  listener.start().expect("start listener");
  let port = listener.local_addr().expect("local addr").port();

  let mut client = connect_client(port);
  let mut expected = Vec::new();
  for i in 0..300u32 {
    let chunk = vec![(i % 251) as u8; 1 + (i as usize % 40)];
    client.write_all(&chunk).expect("send chunk");
    expected.extend_from_slice(&chunk);
  }
  client.shutdown(Shutdown::Write).expect("half close");

  assert!(
    wait_for(Duration::from_secs(10), || listener.live_session_count() == 0),
    "session was not removed"
  );

  assert!(!sink.overlap.load(SeqCst), "two writes were in flight at once");
  assert_eq!(*sink.data.lock().expect("data lock"), expected);

  assert!(listener.stop_and_join(Some(Duration::from_secs(10))));
}
