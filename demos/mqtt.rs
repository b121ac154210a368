//! Plain MQTT on 1883 forwarded into a TLS MQTT broker on 8883.
//!
//! `cargo run --example mqtt --features "log tls"`
//!
//! Lets legacy MQTT clients that cannot speak TLS talk to a TLS-only broker.
//! The broker's certificate must validate against the webpki roots; point
//! BROKER_HOST at your broker.

use log::LevelFilter;
use relais::{Listener, ListenerConfig, Manager, OutboundTls};
use std::sync::Arc;

const BROKER_HOST: &str = "127.0.0.1";
const BROKER_PORT: u16 = 8883;

fn main() -> relais::RelaisResult<()> {
  trivial_log::init_stdout(LevelFilter::Info).expect("logger");

  let listener = Listener::bind_unpooled(
    "0.0.0.0:1883",
    ListenerConfig::new(BROKER_HOST, BROKER_PORT).with_outbound_tls(OutboundTls::Default),
  )?;
  println!("mqtt://0.0.0.0:1883 -> mqtts://{BROKER_HOST}:{BROKER_PORT}");

  let manager = Manager::new();
  manager.add(Arc::new(listener));
  manager.run()
}
