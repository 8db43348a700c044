//! Status routes and HTTP response assembly
//!
//! The connection layer owns the socket and request parsing; this module
//! renders the non-media responses: the embedded status page, the SSE event
//! stream, and the two API endpoints.

pub mod embedded;

use crate::status::{Status, StatusEvent};
use log::debug;
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Streaming responses: raw TS bytes follow, connection close ends the body.
pub const STREAM_PREAMBLE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: video/mp2t\r\nConnection: close\r\n\r\n";

const SSE_RETRY_MS: u64 = 3000;
const SSE_PING_INTERVAL: Duration = Duration::from_secs(15);

pub fn http_response(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn json_response(status: u16, reason: &str, value: &serde_json::Value) -> Vec<u8> {
    http_response(status, reason, "application/json", value.to_string().as_bytes())
}

pub fn error_response(status: u16, reason: &str, message: &str) -> Vec<u8> {
    json_response(status, reason, &json!({ "success": false, "error": message }))
}

pub fn status_page() -> Vec<u8> {
    http_response(200, "OK", "text/html; charset=utf-8", embedded::STATUS_PAGE.as_bytes())
}

/// Parse one `key=value` pair out of a urlencoded form body.
pub fn form_value<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    body.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// `POST /api/disconnect` with `client_id=<id>`.
pub fn handle_disconnect(status: &Status, body: &str) -> Vec<u8> {
    let id = match form_value(body, "client_id").and_then(|v| v.parse::<u32>().ok()) {
        Some(id) => id,
        None => return error_response(400, "Bad Request", "missing or invalid client_id"),
    };
    if status.request_disconnect(id) {
        json_response(
            200,
            "OK",
            &json!({ "success": true, "message": format!("client {} scheduled for disconnect", id) }),
        )
    } else {
        error_response(404, "Not Found", "no such client")
    }
}

/// `PUT /api/loglevel` with `level=<0..4>`.
pub fn handle_loglevel(status: &Status, body: &str) -> Vec<u8> {
    let level = match form_value(body, "level").and_then(|v| v.parse::<i32>().ok()) {
        Some(l) if (0..=4).contains(&l) => l,
        _ => return error_response(400, "Bad Request", "level must be 0..4"),
    };
    status.set_log_level(level);
    json_response(200, "OK", &json!({ "success": true, "message": format!("log level {}", level) }))
}

fn sse_frame(json: &str) -> Vec<u8> {
    format!("data: {}\n\n", json).into_bytes()
}

/// Serve `/status/sse`: one snapshot frame up front, a fresh snapshot per
/// status event (coalesced), comment pings while idle.
pub async fn serve_sse(stream: &mut TcpStream, status: &Arc<Status>) -> io::Result<()> {
    let preamble = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-store\r\nConnection: close\r\n\r\nretry: {}\n\n",
        SSE_RETRY_MS
    );
    stream.write_all(preamble.as_bytes()).await?;

    let snapshot = serde_json::to_string(&status.snapshot()).unwrap_or_default();
    stream.write_all(&sse_frame(&snapshot)).await?;

    let mut events = status.subscribe();
    let mut sink = [0u8; 512];
    loop {
        let next = tokio::time::timeout(SSE_PING_INTERVAL, events.recv()).await;
        match next {
            Ok(Ok(event)) => {
                // Coalesce whatever queued behind this event; one snapshot
                // covers them all.
                while events.try_recv().is_ok() {}
                debug!("sse: pushing snapshot after {:?}", event);
                let snapshot = serde_json::to_string(&status.snapshot()).unwrap_or_default();
                stream.write_all(&sse_frame(&snapshot)).await?;
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                events = status.subscribe();
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return Ok(()),
            Err(_) => {
                stream.write_all(b": ping\n\n").await?;
            }
        }
        // Detect client disconnect without consuming meaningful data; SSE
        // clients never send anything after the request.
        match tokio::time::timeout(Duration::from_millis(1), stream.read(&mut sink)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Err(e)) if e.kind() != io::ErrorKind::WouldBlock => return Err(e),
            _ => {}
        }
    }
}

/// Emit a one-second heartbeat event so SSE subscribers see liveness even on
/// an idle gateway. Driven from the worker tick.
pub fn heartbeat(status: &Status) {
    status.notify(StatusEvent::Heartbeat);
}
