//! The outbound side: dialling the upstream a listener forwards to, plain or TLS.

use crate::relais_error::{RelaisError, RelaisResult};
use crate::stream::{IntoRelayStream, RelayStream};
use std::fmt::Debug;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tls")]
use crate::functional_traits::ThreadAdapter;
#[cfg(feature = "tls")]
use crate::tls_stream::TlsStream;
#[cfg(feature = "tls")]
use rustls::{ClientConfig, RootCertStore};

/// Strategy for establishing the upstream connection of a session.
///
/// The default implementations dial TCP (optionally wrapping the fresh connection
/// in TLS). Custom implementations can be plugged into a
/// [ListenerConfig](crate::ListenerConfig) to route the dial through something
/// else entirely, or to inject delays/failures in tests.
pub trait UpstreamConnector: Debug + Send + Sync {
  /// Establish a fresh connection to the upstream.
  /// Called once per session, from that session's dial thread. There is no retry:
  /// if this returns Err the session closes its client connection.
  fn connect(
    &self,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
  ) -> RelaisResult<Box<dyn RelayStream>>;
}

/// Outbound TLS selection for a listener.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum OutboundTls {
  /// Library defaults: webpki trust roots, no client certificate.
  Default,
  /// Caller supplied rustls config. Use this for custom roots, a client
  /// certificate/key, or to relax verification.
  Config(Arc<ClientConfig>),
}

#[cfg(feature = "tls")]
impl OutboundTls {
  pub(crate) fn client_config(&self) -> Arc<ClientConfig> {
    match self {
      OutboundTls::Default => default_client_config(),
      OutboundTls::Config(config) => config.clone(),
    }
  }
}

/// The rustls ClientConfig used by [OutboundTls::Default]:
/// webpki trust roots and no client certificate.
///
/// Note that like every use of `ClientConfig::builder()` this requires a process
/// level default crypto provider, either via rustls's provider cargo features or
/// via `CryptoProvider::install_default`.
#[cfg(feature = "tls")]
pub fn default_client_config() -> Arc<ClientConfig> {
  let mut roots = RootCertStore::empty();
  roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
  Arc::new(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

fn dial(host: &str, port: u16, timeout: Option<Duration>) -> RelaisResult<TcpStream> {
  let mut last_error = None;
  for addr in (host, port).to_socket_addrs()? {
    let attempt = match timeout {
      Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
      None => TcpStream::connect(addr),
    };

    match attempt {
      Ok(stream) => return Ok(stream),
      Err(err) => last_error = Some(err),
    }
  }

  Err(match last_error {
    Some(err) => RelaisError::IO(err),
    None => {
      RelaisError::new_io(ErrorKind::NotFound, format!("no addresses resolved for {host}:{port}"))
    }
  })
}

/// Dials the upstream with a plain TCP connection.
#[derive(Debug, Default)]
pub struct TcpUpstreamConnector;

impl UpstreamConnector for TcpUpstreamConnector {
  fn connect(
    &self,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
  ) -> RelaisResult<Box<dyn RelayStream>> {
    Ok(dial(host, port, timeout)?.into_relay_stream())
  }
}

/// Dials the upstream with TCP and performs a TLS client handshake on the fresh
/// connection. The configured target host doubles as the SNI server name.
#[cfg(feature = "tls")]
#[derive(Debug)]
pub struct TlsUpstreamConnector {
  config: Arc<ClientConfig>,
  thread_adapter: Arc<dyn ThreadAdapter>,
}

#[cfg(feature = "tls")]
impl TlsUpstreamConnector {
  /// Creates a connector using the given rustls config.
  /// `thread_adapter` is used to create the 2 pump threads of each TLS engine.
  pub fn new(config: Arc<ClientConfig>, thread_adapter: Arc<dyn ThreadAdapter>) -> Self {
    Self { config, thread_adapter }
  }
}

#[cfg(feature = "tls")]
impl UpstreamConnector for TlsUpstreamConnector {
  fn connect(
    &self,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
  ) -> RelaisResult<Box<dyn RelayStream>> {
    let tcp = dial(host, port, timeout)?;
    TlsStream::connect(tcp, self.config.clone(), host, self.thread_adapter.as_ref())
  }
}

/// Everything a session needs to know about its listener's upstream.
#[derive(Debug)]
pub(crate) struct UpstreamSettings {
  pub host: String,
  pub port: u16,
  pub dial_timeout: Option<Duration>,
  pub queue_limit: usize,
  pub connector: Arc<dyn UpstreamConnector>,
}
