//! HTTP API
//!
//! Driver, check-in and dashboard endpoints over hyper http1:
//!
//! | Method | Path | Action |
//! |---|---|---|
//! | POST | `/api/buses/{id}/location` | location update (202) |
//! | PATCH | `/api/buses/{id}/status?status=X` | status change |
//! | POST/DELETE | `/api/buses/{id}/emergency` | trigger / clear emergency |
//! | PATCH | `/api/buses/{id}/passengers?count=N` | manual headcount |
//! | POST | `/api/reservations/checkin/{code}` | check-in |
//! | POST | `/api/reservations/confirm/{code}` | payment confirmed |
//! | POST | `/api/reservations/cancel/{code}` | cancellation |
//! | GET | `/api/buses` | full state (poll) |
//! | GET | `/api/buses/{id}`, `/api/buses/number/{n}` | single bus |
//! | GET | `/api/buses/statistics`, `/api/buses/available`, `/api/buses/area` | queries |
//! | GET | `/api/reservations/bus/{id}/today` | driver's passenger list |
//! | GET | `/metrics`, `/health` | ops |
//!
//! Errors are JSON `{"ok":false,"error":<kind>,"message":<text>}`.

use crate::domain::{BusId, BusStatus, ErrorKind, FleetError, RouteId};
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::{Area, Fleet, IngestOutcome};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Location payloads are a few hundred bytes
const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpResponse = Response<Full<Bytes>>;

fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "http_serialize_failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, "application/json", r#"{"ok":false,"error":"internal"}"#)
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidTransition | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::CapacityExceeded => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn error_response(err: &FleetError) -> HttpResponse {
    let kind = err.kind();
    json_response(
        status_for(kind),
        &json!({ "ok": false, "error": kind.as_str(), "message": err.to_string() }),
    )
}

fn not_found() -> HttpResponse {
    json_response(StatusCode::NOT_FOUND, &json!({ "ok": false, "error": "not_found", "message": "no such route" }))
}

/// Percent-decode one path segment
fn decode_segment(raw: &str) -> Result<String, FleetError> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| FleetError::Validation(format!("invalid percent-encoding in '{raw}'")))
}

/// Look up `key` in a raw query string. `+` decodes to a space, then
/// percent escapes are decoded. Values that are not valid UTF-8 are ignored.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| urlencoding::decode(&v.replace('+', " ")).ok().map(|v| v.into_owned()))
}

fn parse_bus_id(raw: &str) -> Result<BusId, FleetError> {
    raw.parse::<u64>().map(BusId).map_err(|_| FleetError::Validation(format!("invalid bus id '{raw}'")))
}

fn parse_f64(query: Option<&str>, key: &str) -> Result<f64, FleetError> {
    query_param(query, key)
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| FleetError::Validation(format!("missing or invalid '{key}'")))
}

/// Optional string field from a JSON body
fn body_field(body: &[u8], field: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get(field)?
        .as_str()
        .map(str::to_string)
}

fn reply<T: Serialize>(status: StatusCode, result: Result<T, FleetError>) -> HttpResponse {
    match result {
        Ok(value) => json_response(status, &value),
        Err(e) => error_response(&e),
    }
}

/// Route one request. Separated from the connection loop so it can be tested directly.
pub fn dispatch(
    fleet: &Fleet,
    site_id: &str,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> HttpResponse {
    // Split before decoding so an escaped '/' stays inside its segment
    let decoded = match path.trim_matches('/').split('/').map(decode_segment).collect::<Result<Vec<_>, _>>() {
        Ok(decoded) => decoded,
        Err(e) => return error_response(&e),
    };
    let segments: Vec<&str> = decoded.iter().map(String::as_str).collect();

    match (method, segments.as_slice()) {
        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, PATCH, DELETE, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::new()))
            .expect("static response should not fail"),

        (&Method::GET, ["health"]) => response(StatusCode::OK, "text/plain", "ok"),

        (&Method::GET, ["metrics"]) => {
            let summary = fleet.metrics().report(fleet.bus_count(), fleet.subscriber_count());
            response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                format_prometheus_metrics(&summary, site_id),
            )
        }

        (&Method::GET, ["api", "buses"]) => {
            let list = if let Some(status) = query_param(query, "status") {
                match status.parse::<BusStatus>() {
                    Ok(status) => fleet.buses_by_status(status),
                    Err(e) => return error_response(&e),
                }
            } else if let Some(route) = query_param(query, "route") {
                match route.parse::<u64>() {
                    Ok(route) => fleet.buses_by_route(RouteId(route)),
                    Err(_) => return error_response(&FleetError::Validation(format!("invalid route '{route}'"))),
                }
            } else {
                fleet.buses()
            };
            json_response(StatusCode::OK, &list)
        }

        (&Method::GET, ["api", "buses", "statistics"]) => json_response(StatusCode::OK, &fleet.statistics()),

        (&Method::GET, ["api", "buses", "available"]) => json_response(StatusCode::OK, &fleet.available_buses()),

        (&Method::GET, ["api", "buses", "area"]) => {
            let area = (|| {
                Ok::<_, FleetError>(Area {
                    min_lat: parse_f64(query, "minLat")?,
                    max_lat: parse_f64(query, "maxLat")?,
                    min_lon: parse_f64(query, "minLon")?,
                    max_lon: parse_f64(query, "maxLon")?,
                })
            })();
            reply(StatusCode::OK, area.map(|area| fleet.buses_in_area(area)))
        }

        (&Method::GET, ["api", "buses", "number", number]) => match fleet.bus_by_number(number) {
            Some(bus) => json_response(StatusCode::OK, &bus),
            None => json_response(
                StatusCode::NOT_FOUND,
                &json!({ "ok": false, "error": "not_found", "message": format!("bus {number} not found") }),
            ),
        },

        (&Method::GET, ["api", "buses", id]) => reply(StatusCode::OK, parse_bus_id(id).and_then(|id| fleet.bus(id))),

        (&Method::POST, ["api", "buses", id, "location"]) => {
            let result = parse_bus_id(id).and_then(|id| fleet.submit_location_json(Some(id), body));
            match result {
                Ok(IngestOutcome::Accepted(snapshot)) => json_response(
                    StatusCode::ACCEPTED,
                    &json!({ "ok": true, "accepted": true, "version": snapshot.version }),
                ),
                Ok(IngestOutcome::Discarded) => {
                    json_response(StatusCode::ACCEPTED, &json!({ "ok": true, "accepted": false }))
                }
                Err(e) => error_response(&e),
            }
        }

        (&Method::PATCH | &Method::PUT, ["api", "buses", id, "status"]) => {
            let Some(status) = query_param(query, "status").or_else(|| body_field(body, "status")) else {
                return error_response(&FleetError::Validation("missing 'status'".to_string()));
            };
            reply(StatusCode::OK, parse_bus_id(id).and_then(|id| fleet.set_status_str(id, &status)))
        }

        (&Method::POST, ["api", "buses", id, "emergency"]) => {
            let message = body_field(body, "message");
            reply(StatusCode::OK, parse_bus_id(id).and_then(|id| fleet.trigger_emergency(id, message.as_deref())))
        }

        (&Method::DELETE, ["api", "buses", id, "emergency"]) => {
            reply(StatusCode::OK, parse_bus_id(id).and_then(|id| fleet.clear_emergency(id)))
        }

        (&Method::PATCH | &Method::PUT, ["api", "buses", id, "passengers"]) => {
            let count = query_param(query, "count").and_then(|c| c.parse::<u32>().ok());
            let Some(count) = count else {
                return error_response(&FleetError::Validation("missing or invalid 'count'".to_string()));
            };
            reply(StatusCode::OK, parse_bus_id(id).and_then(|id| fleet.set_passenger_count(id, count)))
        }

        (&Method::POST, ["api", "reservations", "checkin", code]) => match fleet.check_in(code) {
            Ok(receipt) => json_response(
                StatusCode::OK,
                &json!({ "ok": true, "reservation": receipt.reservation, "bus": receipt.bus }),
            ),
            Err(e) => error_response(&e),
        },

        (&Method::POST, ["api", "reservations", "confirm", code]) => {
            reply(StatusCode::OK, fleet.confirm_reservation(code))
        }

        (&Method::POST, ["api", "reservations", "cancel", code]) => {
            let reason = query_param(query, "reason").or_else(|| body_field(body, "reason"));
            reply(StatusCode::OK, fleet.cancel_reservation(code, reason.as_deref()))
        }

        (&Method::GET, ["api", "reservations", "bus", id, "today"]) => {
            reply(StatusCode::OK, parse_bus_id(id).and_then(|id| fleet.reservations_for_bus_today(id)))
        }

        _ => not_found(),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    fleet: Arc<Fleet>,
    site_id: Arc<String>,
    timeout: Duration,
) -> Result<HttpResponse, Infallible> {
    let (parts, body) = req.into_parts();

    let work = async {
        let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(path = %parts.uri.path(), error = %e, "http_body_rejected");
                let message = "request body too large or unreadable";
                return json_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &json!({ "ok": false, "error": "validation_error", "message": message }),
                );
            }
        };
        dispatch(&fleet, &site_id, &parts.method, parts.uri.path(), parts.uri.query(), &bytes)
    };

    match tokio::time::timeout(timeout, work).await {
        Ok(resp) => {
            debug!(method = %parts.method, path = %parts.uri.path(), status = %resp.status().as_u16(), "http_request");
            Ok(resp)
        }
        Err(_) => {
            warn!(method = %parts.method, path = %parts.uri.path(), "http_request_timeout");
            Ok(json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "ok": false, "error": "timeout", "message": "request timed out" }),
            ))
        }
    }
}

/// Start the HTTP API server
pub async fn start_http_server(
    port: u16,
    fleet: Arc<Fleet>,
    site_id: String,
    request_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let fleet = fleet.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let fleet = fleet.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, fleet, site_id, request_timeout).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
