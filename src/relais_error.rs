//! Error type of the crate.

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::io::ErrorKind;

/// Result alias used by all fallible fn's in relais.
pub type RelaisResult<T> = Result<T, RelaisError>;

/// Error type used by all fallible fn's in relais.
///
/// Almost everything this crate does is socket IO, so almost every error is an
/// `IO` error. TLS configuration/handshake setup errors surface as `Tls`.
/// `Other` carries anything a user supplied component (ThreadAdapter,
/// UpstreamConnector) may produce.
#[derive(Debug)]
#[non_exhaustive]
pub enum RelaisError {
  /// An io::Error.
  IO(io::Error),
  /// An error from rustls.
  #[cfg(feature = "tls")]
  Tls(rustls::Error),
  /// Any other error.
  Other(Box<dyn Error + Send + Sync>),
}

impl RelaisError {
  /// Creates a new io::Error based RelaisError with the given kind and message.
  pub fn new_io<E: Into<Box<dyn Error + Send + Sync>>>(kind: ErrorKind, message: E) -> RelaisError {
    io::Error::new(kind, message).into()
  }

  /// Creates a new io::Error based RelaisError from the given kind.
  pub fn from_io_kind(kind: ErrorKind) -> RelaisError {
    io::Error::from(kind).into()
  }

  /// Best effort mapping to an io::ErrorKind.
  pub fn kind(&self) -> ErrorKind {
    match self {
      RelaisError::IO(io) => io.kind(),
      #[cfg(feature = "tls")]
      RelaisError::Tls(_) => ErrorKind::InvalidData,
      _ => ErrorKind::Other,
    }
  }

  /// Downcast the inner error to a concrete type, if it has that type.
  pub fn downcast_ref<T: Error + Send + 'static>(&self) -> Option<&T> {
    match self {
      RelaisError::IO(err) => (err as &dyn Error).downcast_ref::<T>(),
      #[cfg(feature = "tls")]
      RelaisError::Tls(err) => (err as &dyn Error).downcast_ref::<T>(),
      RelaisError::Other(other) => other.downcast_ref::<T>(),
    }
  }

  /// Unwraps the inner error as a boxed dyn Error.
  pub fn into_inner(self) -> Box<dyn Error + Send + Sync + 'static> {
    match self {
      RelaisError::IO(err) => Box::new(err) as Box<dyn Error + Send + Sync>,
      #[cfg(feature = "tls")]
      RelaisError::Tls(err) => Box::new(err) as Box<dyn Error + Send + Sync>,
      RelaisError::Other(other) => other,
    }
  }
}

impl Display for RelaisError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      RelaisError::IO(err) => Display::fmt(err, f),
      #[cfg(feature = "tls")]
      RelaisError::Tls(err) => Display::fmt(err, f),
      RelaisError::Other(err) => Display::fmt(err, f),
    }
  }
}

impl<T> From<T> for RelaisError
where
  T: Error + Send + Sync + 'static,
{
  fn from(value: T) -> Self {
    let mut dyn_box = Box::new(value) as Box<dyn Error + Send + Sync>;
    dyn_box = match dyn_box.downcast::<io::Error>() {
      Ok(err) => return RelaisError::IO(*err),
      Err(err) => err,
    };
    #[cfg(feature = "tls")]
    {
      dyn_box = match dyn_box.downcast::<rustls::Error>() {
        Ok(err) => return RelaisError::Tls(*err),
        Err(err) => err,
      };
    }

    RelaisError::Other(dyn_box)
  }
}

impl From<RelaisError> for Box<dyn Error + Send> {
  fn from(value: RelaisError) -> Self {
    value.into_inner()
  }
}

impl From<RelaisError> for io::Error {
  fn from(value: RelaisError) -> Self {
    match value {
      RelaisError::IO(io) => io,
      err => io::Error::new(err.kind(), err.into_inner()),
    }
  }
}
