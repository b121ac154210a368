//! Demo wiring all four TLS combinations in front of example.com.
//!
//! `cargo run --example proxy --features "log tls"`
//!
//! The TLS terminating listeners need `certificate.pem` and `privatekey.pem` in
//! the working directory; without them only the plain and TLS originating
//! listeners come up. INT and TERM trigger a graceful stop.
#![allow(unsafe_code)]

use log::LevelFilter;
use relais::{Listener, ListenerConfig, Manager, OutboundTls, ShutdownMode};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::io::{BufReader, Cursor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

static STOP: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
  STOP.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
  let handler = on_signal as extern "C" fn(libc::c_int);
  unsafe {
    libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
  }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn load_tls_server_config() -> Option<Arc<ServerConfig>> {
  let cert = std::fs::read("certificate.pem").ok()?;
  let key = std::fs::read("privatekey.pem").ok()?;

  let certs: Vec<CertificateDer<'static>> =
    rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert))).collect::<Result<_, _>>().ok()?;
  let key = rustls_pemfile::private_key(&mut BufReader::new(Cursor::new(key))).ok()??;

  let config = ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key).ok()?;
  Some(Arc::new(config))
}

fn main() -> relais::RelaisResult<()> {
  trivial_log::init_stdout(LevelFilter::Info).expect("logger");

  let manager = Manager::new();

  // HTTP -> HTTP
  let plain = Listener::bind_unpooled("0.0.0.0:8081", ListenerConfig::new("example.com", 80))?;
  println!("http://127.0.0.1:8081 -> http://example.com");
  manager.add(Arc::new(plain));

  match load_tls_server_config() {
    Some(config) => {
      // HTTPS -> HTTP, we terminate TLS
      let terminate = Listener::bind_unpooled(
        "0.0.0.0:8082",
        ListenerConfig::new("example.com", 80).with_inbound_tls(config.clone()),
      )?;
      println!("https://127.0.0.1:8082 -> http://example.com");
      manager.add(Arc::new(terminate));

      // HTTP -> HTTPS, we originate TLS
      let originate = Listener::bind_unpooled(
        "0.0.0.0:8083",
        ListenerConfig::new("example.com", 443).with_outbound_tls(OutboundTls::Default),
      )?;
      println!("http://127.0.0.1:8083 -> https://example.com:443");
      manager.add(Arc::new(originate));

      // HTTPS -> HTTPS
      let both = Listener::bind_unpooled(
        "0.0.0.0:8084",
        ListenerConfig::new("example.com", 443)
          .with_inbound_tls(config)
          .with_outbound_tls(OutboundTls::Default),
      )?;
      println!("https://127.0.0.1:8084 -> https://example.com:443");
      manager.add(Arc::new(both));
    }
    None => {
      println!("Warning: TLS termination is disabled, certificate file(s) not found (certificate.pem / privatekey.pem)");
    }
  }

  install_signal_handlers();

  println!("Starting... INT/TERM stops gracefully");
  manager.start()?;

  while !STOP.load(Ordering::SeqCst) && !manager.is_stopped() {
    thread::sleep(Duration::from_millis(100));
  }

  println!("Stopping...");
  manager.stop(ShutdownMode::DrainFor(Duration::from_secs(30)));
  manager.join(None);
  println!("Stopped.");
  trivial_log::free();
  Ok(())
}
