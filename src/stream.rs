//! The byte stream abstraction the relay engine runs on.
//! A RelayStream is either a plain TcpStream or a TLS engine wrapped around one;
//! the session code cannot tell the difference.

use std::fmt::Debug;
use std::io;
use std::net::TcpStream;

/// A reliable, ordered, bidirectional byte channel between the proxy and one peer.
///
/// Instances are handle types: [RelayStream::new_ref] produces another handle to
/// the same underlying stream, so the reading thread and the writing thread of a
/// session can each own one.
///
/// The implementation may assume that at most one read and at most one write are
/// in flight at any time (the session engine serializes both per endpoint).
/// [RelayStream::close] is the exception: it may be called at any time, from any
/// thread, concurrently with blocked reads and writes.
pub trait RelayStream: Debug + Send + Sync {
  /// Read up to `buf.len()` bytes. `Ok(0)` means the peer has closed its end of
  /// the stream and no further data will arrive.
  fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

  /// Write the entire buffer.
  fn write_all(&self, buf: &[u8]) -> io::Result<()>;

  /// Flush anything the implementation buffers.
  fn flush(&self) -> io::Result<()>;

  /// Toggle Nagle's algorithm on the underlying socket.
  fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

  /// Close the stream. Idempotent.
  ///
  /// This must unblock concurrent read and write calls; all ongoing and future
  /// operations are expected to return `Err` (or `Ok(0)` for reads) promptly
  /// after this fn was called.
  fn close(&self);

  /// The address of the remote of this stream.
  fn peer_addr(&self) -> io::Result<String>;

  /// The local address of this stream.
  fn local_addr(&self) -> io::Result<String>;

  /// A new handle to the same underlying stream.
  fn new_ref(&self) -> Box<dyn RelayStream>;
}

/// Conversion of socket-ish things into a [RelayStream].
pub trait IntoRelayStream {
  /// Converts this into a RelayStream.
  fn into_relay_stream(self) -> Box<dyn RelayStream>;
}

impl IntoRelayStream for TcpStream {
  fn into_relay_stream(self) -> Box<dyn RelayStream> {
    tcp::new(self)
  }
}

impl IntoRelayStream for Box<dyn RelayStream> {
  fn into_relay_stream(self) -> Box<dyn RelayStream> {
    self
  }
}

mod tcp {
  use crate::stream::RelayStream;
  use std::io;
  use std::io::{Read, Write};
  use std::net::{Shutdown, TcpStream};
  use std::sync::Arc;

  pub fn new(stream: TcpStream) -> Box<dyn RelayStream> {
    Box::new(TcpStreamOuter(Arc::new(stream)))
  }

  /// `&TcpStream` implements Read and Write, so no locking is needed here;
  /// concurrent reads and writes go straight to the socket.
  #[derive(Debug, Clone)]
  struct TcpStreamOuter(Arc<TcpStream>);

  impl RelayStream for TcpStreamOuter {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
      Read::read(&mut &*self.0, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
      Write::write_all(&mut &*self.0, buf)
    }

    fn flush(&self) -> io::Result<()> {
      Write::flush(&mut &*self.0)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
      self.0.set_nodelay(nodelay)
    }

    fn close(&self) {
      // The kernel sends the FIN after everything already written; a second
      // shutdown on an already dead socket just errors, which is fine.
      _ = self.0.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> io::Result<String> {
      Ok(format!("{}", self.0.peer_addr()?))
    }

    fn local_addr(&self) -> io::Result<String> {
      Ok(format!("{}", self.0.local_addr()?))
    }

    fn new_ref(&self) -> Box<dyn RelayStream> {
      Box::new(self.clone()) as Box<dyn RelayStream>
    }
  }
}
