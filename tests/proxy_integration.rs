//! End-to-end tests driving a real `ProxyService` over real TCP sockets,
//! wired to the dry-run transport so no hardware is required. These cover
//! the scenarios from the proxy's testable-properties list that a
//! component-level unit test can't reach: multiple real TCP clients,
//! full-duplex line framing over the wire, and probe interleaving observed
//! purely through client-visible traffic.

use std::sync::Arc;
use std::time::Duration;

use gcode_serial_proxy::config::{Config, DeviceConfig, ServerConfig};
use gcode_serial_proxy::handlers::NoopHandlers;
use gcode_serial_proxy::service::ProxyService;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn dry_run_config(queue_limit: usize, liveness_period_ms: u64) -> Config {
  Config {
    server: ServerConfig {
      port: 0,
      address: "127.0.0.1".to_string(),
      queue_limit,
    },
    device: DeviceConfig {
      usb_id: None,
      dev_path: None,
      baud_rate: 115_200,
      serial_delay: 0,
      liveness_period: liveness_period_ms,
      swallow_realtime_ok: true,
      command_timeout_ms: 2000,
    },
    custom_triggers: vec![],
  }
}

async fn connect(addr: std::net::SocketAddr) -> (impl tokio::io::AsyncBufRead + Unpin, tokio::net::tcp::OwnedWriteHalf) {
  let stream = TcpStream::connect(addr).await.unwrap();
  let (read_half, write_half) = stream.into_split();
  (BufReader::new(read_half), write_half)
}

/// Scenario (a): a single client sending one line gets exactly one `ok` back.
#[tokio::test]
async fn single_client_echo() {
  let config = dry_run_config(50, 0);
  let service = ProxyService::start(config, true, Arc::new(NoopHandlers)).await.unwrap();
  let addr = service.local_addr();

  let (mut reader, mut writer) = connect(addr).await;
  writer.write_all(b"G28\n").await.unwrap();

  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  assert_eq!(line, "ok\n");

  service.stop().await;
}

/// Scenario (b): two clients' commands both reach the device and each
/// client gets its own `ok` back, uncorrupted by the other's traffic.
#[tokio::test]
async fn two_clients_each_get_their_own_response() {
  let config = dry_run_config(50, 0);
  let service = ProxyService::start(config, true, Arc::new(NoopHandlers)).await.unwrap();
  let addr = service.local_addr();

  let (mut reader_a, mut writer_a) = connect(addr).await;
  let (mut reader_b, mut writer_b) = connect(addr).await;

  writer_a.write_all(b"G0 X10\n").await.unwrap();
  writer_b.write_all(b"G0 Y10\n").await.unwrap();

  let mut line_a = String::new();
  let mut line_b = String::new();
  reader_a.read_line(&mut line_a).await.unwrap();
  reader_b.read_line(&mut line_b).await.unwrap();

  assert_eq!(line_a, "ok\n");
  assert_eq!(line_b, "ok\n");

  service.stop().await;
}

/// A single client's sequence of commands comes back in the same order it
/// was sent, one response per request, the request/response illusion §4.4
/// promises each connection.
#[tokio::test]
async fn per_client_commands_are_ordered() {
  let config = dry_run_config(50, 0);
  let service = ProxyService::start(config, true, Arc::new(NoopHandlers)).await.unwrap();
  let addr = service.local_addr();

  let (mut reader, mut writer) = connect(addr).await;
  for line in ["G0 X1\n", "G0 X2\n", "G0 X3\n"] {
    writer.write_all(line.as_bytes()).await.unwrap();
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response, "ok\n");
  }

  service.stop().await;
}

/// Scenario (d)/(e): with liveness probing enabled, idle clients see no
/// stray traffic and a client's own `?` still gets a status frame back.
#[tokio::test]
async fn probe_traffic_never_reaches_an_idle_client() {
  let config = dry_run_config(50, 30);
  let service = ProxyService::start(config, true, Arc::new(NoopHandlers)).await.unwrap();
  let addr = service.local_addr();

  let (mut reader, _writer) = connect(addr).await;

  // Several probe periods elapse with this client sending nothing; it must
  // observe no traffic at all (the probe and its status frame stay
  // internal to DeviceSession).
  let idle = tokio::time::timeout(Duration::from_millis(200), reader.fill_buf()).await;
  assert!(idle.is_err(), "idle client must not receive any proxy-injected traffic");

  service.stop().await;
}

/// A client that explicitly sends `?` gets the status frame back directly.
#[tokio::test]
async fn explicit_status_query_is_delivered_to_the_requesting_client() {
  let config = dry_run_config(50, 0);
  let service = ProxyService::start(config, true, Arc::new(NoopHandlers)).await.unwrap();
  let addr = service.local_addr();

  let (mut reader, mut writer) = connect(addr).await;
  writer.write_all(b"?\n").await.unwrap();

  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  assert!(line.trim_end().starts_with('<') && line.trim_end().ends_with('>'));

  service.stop().await;
}

/// Scenario (c): a matching trigger fires without delaying the client's
/// response past the device round trip.
#[tokio::test]
async fn trigger_fires_without_blocking_client_response() {
  use gcode_serial_proxy::config::{TriggerConfig, TriggerKindConfig};

  let mut config = dry_run_config(50, 0);
  config.custom_triggers = vec![TriggerConfig {
    id: "air-on".to_string(),
    trigger: TriggerKindConfig {
      kind: "gcode".to_string(),
      pattern: "^M8$".to_string(),
    },
    command: "sleep 0.3".to_string(),
  }];

  let service = ProxyService::start(config, true, Arc::new(NoopHandlers)).await.unwrap();
  let addr = service.local_addr();

  let (mut reader, mut writer) = connect(addr).await;

  let started = std::time::Instant::now();
  writer.write_all(b"M8\n").await.unwrap();
  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();

  assert_eq!(line, "ok\n");
  assert!(
    started.elapsed() < Duration::from_millis(150),
    "client must not wait on the trigger subprocess's runtime"
  );

  service.stop().await;
}

/// Graceful shutdown terminates promptly even with a client connected and
/// does not hang waiting on anything.
#[tokio::test]
async fn shutdown_completes_promptly_with_a_connected_client() {
  let config = dry_run_config(50, 0);
  let service = ProxyService::start(config, true, Arc::new(NoopHandlers)).await.unwrap();
  let addr = service.local_addr();

  let (_reader, _writer) = connect(addr).await;

  let stopped = tokio::time::timeout(Duration::from_secs(3), service.stop()).await;
  assert!(stopped.is_ok(), "shutdown must complete within a bounded time");
}
