//! Push listener for live subscribers
//!
//! Dashboards, passenger apps and driver apps hold a TCP connection and
//! receive JSON lines. The first line the client sends picks the interest:
//!
//! ```text
//! {"all":true}      every bus delta
//! {"bus":7}         one bus
//! {"route":3}       every bus on a route
//! {"user":42}       notifications for a user (plus their buses)
//! ```
//!
//! Later lines of the same shape widen the subscription. Each outbound
//! message is one line tagged with `"type":"bus_update"` or
//! `"type":"notification"`.
//!
//! Inbound lines are capped at [`MAX_LINE_BYTES`]. A client that sends no
//! request within the handshake timeout is dropped.

use crate::domain::{BusId, RouteId, UserId};
use crate::services::{Fleet, Interest, Outbound, SubscriberId};
use futures::StreamExt;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

/// Longest request line a client may send
pub const MAX_LINE_BYTES: usize = 4096;

type RequestLines = FramedRead<OwnedReadHalf, LinesCodec>;

/// Subscription request line
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscribeRequest {
    #[serde(default)]
    all: bool,
    bus: Option<u64>,
    route: Option<u64>,
    user: Option<u64>,
}

/// Parse one request line into an interest. Exactly one selector must be set.
pub fn parse_request(line: &str) -> Result<Interest, String> {
    let req: SubscribeRequest = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let mut picked = Vec::with_capacity(1);
    if req.all {
        picked.push(Interest::AllBuses);
    }
    if let Some(bus) = req.bus {
        picked.push(Interest::Bus(BusId(bus)));
    }
    if let Some(route) = req.route {
        picked.push(Interest::Route(RouteId(route)));
    }
    if let Some(user) = req.user {
        picked.push(Interest::User(UserId(user)));
    }
    match picked.as_slice() {
        [interest] => Ok(*interest),
        [] => Err("no interest given".to_string()),
        _ => Err("exactly one of all, bus, route, user expected".to_string()),
    }
}

/// Push listener configuration
#[derive(Debug, Clone)]
pub struct PushListenerConfig {
    pub port: u16,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
}

/// Start the push listener
pub async fn start_push_listener(
    config: PushListenerConfig,
    fleet: Arc<Fleet>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(port = %config.port, "push_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("push_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let fleet = fleet.clone();
                        let shutdown = shutdown.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            handle_push_connection(socket, addr, fleet, config, shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "push_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str, timeout: Duration) -> bool {
    let write = async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await
    };
    matches!(tokio::time::timeout(timeout, write).await, Ok(Ok(())))
}

/// Wait for the first non-empty request line
async fn read_handshake(lines: &mut RequestLines) -> Option<Result<Interest, String>> {
    loop {
        match lines.next().await {
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => return Some(parse_request(line.trim())),
            Some(Err(e)) => return Some(Err(e.to_string())),
            None => return None,
        }
    }
}

async fn handle_push_connection(
    socket: TcpStream,
    addr: SocketAddr,
    fleet: Arc<Fleet>,
    config: PushListenerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = addr.to_string();
    let write_timeout = config.write_timeout;
    let (read_half, mut writer) = socket.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    // Handshake: the first non-empty line selects the interest
    let interest = match tokio::time::timeout(config.handshake_timeout, read_handshake(&mut lines)).await {
        Ok(Some(Ok(interest))) => interest,
        Ok(Some(Err(e))) => {
            warn!(peer = %peer, error = %e, "push_bad_handshake");
            let reply = serde_json::json!({ "type": "error", "message": e }).to_string();
            let _ = write_line(&mut writer, &reply, write_timeout).await;
            return;
        }
        Ok(None) => {
            debug!(peer = %peer, "push_closed_before_handshake");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "push_handshake_timeout");
            return;
        }
    };

    let mut subscription = fleet.subscribe(interest);
    let id = subscription.id;
    info!(peer = %peer, subscriber = %id, interest = ?interest, "push_subscribed");

    let ack = serde_json::json!({ "type": "subscribed", "id": id.0 }).to_string();
    if write_line(&mut writer, &ack, write_timeout).await {
        serve(
            &mut subscription.rx,
            &mut lines,
            &mut writer,
            &fleet,
            id,
            &peer,
            write_timeout,
            &mut shutdown,
        )
        .await;
    }

    fleet.unsubscribe(id);
    info!(peer = %peer, subscriber = %id, "push_unsubscribed");
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    rx: &mut tokio::sync::mpsc::Receiver<Outbound>,
    lines: &mut RequestLines,
    writer: &mut OwnedWriteHalf,
    fleet: &Fleet,
    id: SubscriberId,
    peer: &str,
    write_timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            message = rx.recv() => {
                // None: the registry evicted us
                let Some(message) = message else { return };
                let line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "push_serialize_failed");
                        continue;
                    }
                };
                if !write_line(writer, &line, write_timeout).await {
                    warn!(peer = %peer, subscriber = %id, "push_write_failed");
                    return;
                }
            }
            line = lines.next() => {
                match line {
                    Some(Ok(line)) if line.trim().is_empty() => {}
                    Some(Ok(line)) => match parse_request(line.trim()) {
                        Ok(interest) => {
                            fleet.add_interest(id, interest);
                            debug!(peer = %peer, subscriber = %id, interest = ?interest, "push_interest_added");
                        }
                        Err(e) => debug!(peer = %peer, error = %e, "push_bad_request"),
                    },
                    Some(Err(e)) => {
                        warn!(peer = %peer, subscriber = %id, error = %e, "push_read_failed");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BusRecord;
    use crate::infra::{Config, Metrics};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    fn listener_config(handshake_timeout: Duration) -> PushListenerConfig {
        PushListenerConfig { port: 0, write_timeout: Duration::from_secs(1), handshake_timeout }
    }

    /// Serve one accepted connection and report the address to dial
    async fn serve_one(fleet: Arc<Fleet>, config: PushListenerConfig) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let (socket, peer) = listener.accept().await.unwrap();
            handle_push_connection(socket, peer, fleet, config, shutdown_rx).await;
        });
        addr
    }

    #[test]
    fn test_parse_request() {
        assert_eq!(parse_request(r#"{"all":true}"#), Ok(Interest::AllBuses));
        assert_eq!(parse_request(r#"{"bus":7}"#), Ok(Interest::Bus(BusId(7))));
        assert_eq!(parse_request(r#"{"route":3}"#), Ok(Interest::Route(RouteId(3))));
        assert_eq!(parse_request(r#"{"user":42}"#), Ok(Interest::User(UserId(42))));
        assert!(parse_request(r#"{}"#).is_err());
        assert!(parse_request(r#"{"all":false}"#).is_err());
        assert!(parse_request(r#"{"bus":1,"route":2}"#).is_err());
        assert!(parse_request(r#"{"vehicle":1}"#).is_err());
        assert!(parse_request("not json").is_err());
    }

    #[tokio::test]
    async fn test_push_connection_receives_updates() {
        let (fleet, mut engine) = Fleet::new(&Config::default(), Arc::new(Metrics::new()));
        fleet
            .register_bus(BusRecord {
                id: BusId(7),
                number: "AA-107".to_string(),
                capacity: 40,
                route_id: None,
                driver_id: None,
            })
            .unwrap();
        engine.drain();
        let fleet = Arc::new(fleet);

        let addr = serve_one(fleet.clone(), listener_config(Duration::from_secs(5))).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"{\"bus\":7}\n").await.unwrap();

        let mut reader = BufReader::new(&mut client);
        let mut ack = String::new();
        reader.read_line(&mut ack).await.unwrap();
        assert!(ack.contains("\"subscribed\""));
        assert_eq!(fleet.subscriber_count(), 1);

        fleet.set_passenger_count(BusId(7), 3).unwrap();
        engine.drain();

        let mut update = String::new();
        reader.read_line(&mut update).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&update).unwrap();
        assert_eq!(json["type"], "bus_update");
        assert_eq!(json["current_passengers"], 3);

        drop(reader);
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        for _ in 0..50 {
            if fleet.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fleet.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let (fleet, _engine) = Fleet::new(&Config::default(), Arc::new(Metrics::new()));
        let addr = serve_one(Arc::new(fleet), listener_config(Duration::from_millis(50))).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
        assert!(matches!(read, Ok(Ok(0))), "connection should be closed by the server");
    }

    #[tokio::test]
    async fn test_overlong_line_closes_connection() {
        let (fleet, _engine) = Fleet::new(&Config::default(), Arc::new(Metrics::new()));
        let fleet = Arc::new(fleet);
        let addr = serve_one(fleet.clone(), listener_config(Duration::from_secs(30))).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&vec![b'x'; MAX_LINE_BYTES * 2]).await.unwrap();

        // Either a clean close after the error line or a reset; never a hang
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
        assert!(read.is_ok(), "server should close before the handshake timeout");
        assert_eq!(fleet.subscriber_count(), 0);
    }
}
