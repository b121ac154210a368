//! Relais is a transparent TCP reverse proxy: listeners accept client connections and relay all bytes, unmodified and in order, to a preconfigured upstream. TLS can independently be terminated on the inbound side and originated on the outbound side, and every combination of plain and TLS behaves identically. Relais uses blocking IO and plain threads; thread creation is pluggable.

#![warn(missing_docs)]

mod functional_traits;
mod listener;
mod manager;
mod relais_error;
mod session;
mod stream;
#[cfg(feature = "tls")]
mod tls_stream;
mod upstream;
mod util;

pub use functional_traits::{ThreadAdapter, ThreadAdapterJoinHandle};
pub use listener::{Listener, ListenerConfig};
pub use manager::{Manager, ShutdownMode};
pub use relais_error::{RelaisError, RelaisResult};
pub use stream::{IntoRelayStream, RelayStream};
#[cfg(feature = "tls")]
pub use tls_stream::TlsStream;
#[cfg(feature = "tls")]
pub use upstream::{default_client_config, OutboundTls, TlsUpstreamConnector};
pub use upstream::{TcpUpstreamConnector, UpstreamConnector};
