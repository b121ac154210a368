//! Rustls backed [RelayStream] implementations.
//! The server side wraps connections accepted by a TLS terminating listener,
//! the client side wraps outbound connections to a TLS upstream.

use crate::functional_traits::ThreadAdapter;
use crate::relais_error::RelaisResult;
use crate::stream::RelayStream;
use rust_tls_duplex_stream::RustTlsDuplexStream;
use rustls::client::ClientConnectionData;
use rustls::pki_types::ServerName;
use rustls::server::ServerConnectionData;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// Read/Write handle onto the raw tcp socket for the TLS engine's pump threads.
#[derive(Debug, Clone)]
struct StreamWrapper(Arc<TcpStream>);

impl Read for StreamWrapper {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    Read::read(&mut &*self.0, buf)
  }
}

impl Write for StreamWrapper {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    Write::write(&mut &*self.0, buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    Write::flush(&mut &*self.0)
  }
}

#[derive(Debug)]
enum TlsEngine {
  Server(RustTlsDuplexStream<ServerConnection, ServerConnectionData>),
  Client(RustTlsDuplexStream<ClientConnection, ClientConnectionData>),
}

impl TlsEngine {
  fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
    match self {
      TlsEngine::Server(tls) => Read::read(&mut &*tls, buf),
      TlsEngine::Client(tls) => Read::read(&mut &*tls, buf),
    }
  }

  fn write_all(&self, buf: &[u8]) -> io::Result<()> {
    match self {
      TlsEngine::Server(tls) => Write::write_all(&mut &*tls, buf),
      TlsEngine::Client(tls) => Write::write_all(&mut &*tls, buf),
    }
  }

  fn flush(&self) -> io::Result<()> {
    match self {
      TlsEngine::Server(tls) => Write::flush(&mut &*tls),
      TlsEngine::Client(tls) => Write::flush(&mut &*tls),
    }
  }
}

/// Wrapper struct that wraps a TLS Engine from RustTLS around a tcp stream.
#[derive(Debug, Clone)]
pub struct TlsStream(Arc<TlsStreamInner>);

#[derive(Debug)]
struct TlsStreamInner {
  tcp: Arc<TcpStream>,
  tls: TlsEngine,
  peer: String,
  local: String,
}

impl Drop for TlsStreamInner {
  fn drop(&mut self) {
    _ = self.tcp.shutdown(Shutdown::Both);
  }
}

impl TlsStream {
  /// Terminate TLS on an accepted connection (we are the TLS server).
  /// Calling this fn will create 2 background threads using the provided spawner.
  /// The threads are automatically stopped once the returned RelayStream is closed or dropped.
  pub fn accept(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    spawner: &dyn ThreadAdapter,
  ) -> RelaisResult<Box<dyn RelayStream>> {
    let tls = ServerConnection::new(config)?;
    let peer = stream.peer_addr()?.to_string();
    let local = stream.local_addr()?.to_string();
    let tcp = Arc::new(stream);
    let wrapper = StreamWrapper(tcp.clone());
    let tls = RustTlsDuplexStream::new(tls, wrapper.clone(), wrapper, move |task| {
      spawner.spawn(task)?;
      Ok(())
    })?;

    Ok(Box::new(TlsStream(Arc::new(TlsStreamInner {
      tcp,
      tls: TlsEngine::Server(tls),
      peer,
      local,
    }))) as Box<dyn RelayStream>)
  }

  /// Originate TLS on a freshly dialled outbound connection (we are the TLS client).
  /// `host` becomes the SNI server name and is verified against the upstream's certificate.
  /// Calling this fn will create 2 background threads using the provided spawner.
  /// The threads are automatically stopped once the returned RelayStream is closed or dropped.
  pub fn connect(
    stream: TcpStream,
    config: Arc<ClientConfig>,
    host: &str,
    spawner: &dyn ThreadAdapter,
  ) -> RelaisResult<Box<dyn RelayStream>> {
    let name = ServerName::try_from(host.to_string())?;
    let tls = ClientConnection::new(config, name)?;
    let peer = stream.peer_addr()?.to_string();
    let local = stream.local_addr()?.to_string();
    let tcp = Arc::new(stream);
    let wrapper = StreamWrapper(tcp.clone());
    let tls = RustTlsDuplexStream::new(tls, wrapper.clone(), wrapper, move |task| {
      spawner.spawn(task)?;
      Ok(())
    })?;

    Ok(Box::new(TlsStream(Arc::new(TlsStreamInner {
      tcp,
      tls: TlsEngine::Client(tls),
      peer,
      local,
    }))) as Box<dyn RelayStream>)
  }
}

impl RelayStream for TlsStream {
  fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
    self.0.tls.read(buf)
  }

  fn write_all(&self, buf: &[u8]) -> io::Result<()> {
    self.0.tls.write_all(buf)
  }

  fn flush(&self) -> io::Result<()> {
    self.0.tls.flush()
  }

  fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
    self.0.tcp.set_nodelay(nodelay)
  }

  fn close(&self) {
    // Shutting down the raw socket cancels the engine's pump threads and makes
    // every pending and future read/write on the TLS side return an error.
    _ = self.0.tcp.shutdown(Shutdown::Both);
  }

  fn peer_addr(&self) -> io::Result<String> {
    Ok(self.0.peer.clone())
  }

  fn local_addr(&self) -> io::Result<String> {
    Ok(self.0.local.clone())
  }

  fn new_ref(&self) -> Box<dyn RelayStream> {
    Box::new(self.clone()) as Box<dyn RelayStream>
  }
}
