//! Client connections
//!
//! Each accepted socket gets one task: parse the HTTP request, route it, and
//! either answer immediately (status, API) or turn into a streaming client.
//! While streaming, the stream context is the only producer of output; the
//! client socket is read solely to detect disconnection.

use crate::config::{Config, Service};
use crate::sendq::{FlushOutcome, SendQueue};
use crate::status::ClientHandle;
use crate::stream::{self, StreamContext, StreamError};
use crate::web;
use crate::worker::WorkerState;
use log::{debug, info, trace, warn};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

const REQUEST_MAX_BYTES: usize = 8 * 1024;
const BODY_MAX_BYTES: usize = 16 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// A client that falls this far behind is dropped as unrecoverable.
const MAX_QUEUED_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed request")]
    BadRequest,
    #[error("request too large")]
    TooLarge,
    #[error("timed out reading request")]
    Timeout,
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

/// Read and parse one HTTP/1.x request head (+ small form body).
pub async fn read_request(stream: &mut TcpStream) -> Result<HttpRequest, RequestError> {
    let deadline = Instant::now() + REQUEST_TIMEOUT;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > REQUEST_MAX_BYTES {
            return Err(RequestError::TooLarge);
        }
        let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| RequestError::Timeout)??;
        if n == 0 {
            return Err(RequestError::BadRequest);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| RequestError::BadRequest)?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(RequestError::BadRequest)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(RequestError::BadRequest)?.to_string();
    let target = parts.next().ok_or(RequestError::BadRequest)?.to_string();
    let version = parts.next().ok_or(RequestError::BadRequest)?;
    if !version.starts_with("HTTP/1.") {
        return Err(RequestError::BadRequest);
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(RequestError::BadRequest)?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };

    // Small form bodies only (the two API routes).
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > BODY_MAX_BYTES {
        return Err(RequestError::TooLarge);
    }
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| RequestError::Timeout)??;
        if n == 0 {
            return Err(RequestError::BadRequest);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest { method, path, query, headers, body })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug)]
enum Route {
    StatusPage,
    Sse,
    ApiDisconnect,
    ApiLoglevel,
    Media(Service),
    NotFound,
    BadRequest,
}

fn route_request(config: &Config, req: &HttpRequest) -> Route {
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/") | ("GET", "/status") => Route::StatusPage,
        ("GET", "/status/sse") => Route::Sse,
        ("POST", "/api/disconnect") => Route::ApiDisconnect,
        ("PUT", "/api/loglevel") => Route::ApiLoglevel,
        ("GET", path) if path.starts_with("/rtsp/") => {
            let full = if req.query.is_empty() {
                path.to_string()
            } else {
                format!("{}?{}", path, req.query)
            };
            match stream::rtsp_service(&full) {
                Some(service) => Route::Media(service),
                None => Route::BadRequest,
            }
        }
        ("GET", path) if path.starts_with("/udp/") || path.starts_with("/rtp/") => {
            if !config.server.udpxy {
                return Route::NotFound;
            }
            match stream::udpxy_service(path) {
                Some(service) => Route::Media(service),
                None => Route::BadRequest,
            }
        }
        ("GET", path) => {
            let name = path.trim_start_matches('/');
            match config.services.get(name) {
                Some(service_config) => {
                    match service_config.resolve(req.query_param("playseek")) {
                        Ok(service) => Route::Media(service),
                        Err(e) => {
                            warn!("service {}: {}", name, e);
                            Route::NotFound
                        }
                    }
                }
                None => Route::NotFound,
            }
        }
        _ => Route::BadRequest,
    }
}

fn authorized(config: &Config, req: &HttpRequest) -> bool {
    let token = &config.server.token;
    if token.is_empty() {
        return true;
    }
    if let Some(value) = req.header("authorization") {
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            return bearer.trim() == token;
        }
    }
    req.query_param("token") == Some(token.as_str())
}

/// Entry point for one accepted connection.
pub async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, worker: Rc<WorkerState>) {
    let request = match read_request(&mut stream).await {
        Ok(r) => r,
        Err(RequestError::Io(e)) => {
            trace!("{}: request read failed: {}", peer, e);
            return;
        }
        Err(e) => {
            trace!("{}: {}", peer, e);
            let _ = stream
                .write_all(&web::error_response(400, "Bad Request", "malformed request"))
                .await;
            return;
        }
    };

    if !authorized(&worker.config, &request) {
        let _ = stream
            .write_all(&web::error_response(401, "Unauthorized", "bad or missing token"))
            .await;
        return;
    }

    match route_request(&worker.config, &request) {
        Route::StatusPage => {
            let _ = stream.write_all(&web::status_page()).await;
        }
        Route::Sse => {
            if let Err(e) = web::serve_sse(&mut stream, &worker.status).await {
                trace!("{}: sse closed: {}", peer, e);
            }
        }
        Route::ApiDisconnect => {
            let body = String::from_utf8_lossy(&request.body);
            let rsp = web::handle_disconnect(&worker.status, &body);
            let _ = stream.write_all(&rsp).await;
        }
        Route::ApiLoglevel => {
            let body = String::from_utf8_lossy(&request.body);
            let rsp = web::handle_loglevel(&worker.status, &body);
            let _ = stream.write_all(&rsp).await;
        }
        Route::Media(service) => {
            serve_media(stream, peer, worker, service).await;
        }
        Route::NotFound => {
            let _ = stream
                .write_all(&web::error_response(404, "Not Found", "no such service"))
                .await;
        }
        Route::BadRequest => {
            let _ = stream
                .write_all(&web::error_response(400, "Bad Request", "unsupported request"))
                .await;
        }
    }
}

async fn serve_media(
    mut stream: TcpStream,
    peer: SocketAddr,
    worker: Rc<WorkerState>,
    service: Service,
) {
    // Capacity gate before any upstream work.
    if worker.status.total_clients() >= worker.status.max_clients() {
        let _ = stream
            .write_all(&web::error_response(503, "Service Unavailable", "at capacity"))
            .await;
        return;
    }

    let mut ctx = match StreamContext::new(&service, worker.settings.clone(), worker.pool.clone())
    {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!("{}: cannot open upstream: {}", peer, e);
            let _ = stream
                .write_all(&web::error_response(502, "Bad Gateway", "upstream unavailable"))
                .await;
            return;
        }
    };
    // Upstream failures before the body starts map to an HTTP error.
    if let Err(e) = ctx.start().await {
        warn!("{}: upstream start failed: {}", peer, e);
        let _ = stream
            .write_all(&web::error_response(502, "Bad Gateway", "upstream refused"))
            .await;
        return;
    }

    let handle = match worker.status.register_client(
        worker.id,
        &peer.to_string(),
        &ctx.describe_target(),
    ) {
        Some(h) => h,
        None => {
            let _ = stream
                .write_all(&web::error_response(503, "Service Unavailable", "at capacity"))
                .await;
            return;
        }
    };

    if stream.write_all(web::STREAM_PREAMBLE).await.is_err() {
        return;
    }
    info!("{}: streaming {} (client {})", peer, ctx.describe_target(), handle.id());

    let zerocopy = worker.zerocopy && SendQueue::arm_zerocopy(stream.as_raw_fd());
    let mut sendq = SendQueue::new(zerocopy);

    let result = streaming_loop(&mut stream, &mut ctx, &mut sendq, &handle, &worker).await;
    match result {
        Ok(reason) => info!("{}: stream ended ({})", peer, reason),
        Err(e) => debug!("{}: stream error: {}", peer, e),
    }

    ctx.shutdown().await;
    finish_sendq(&mut sendq, &stream, &worker).await;
}

#[derive(Debug, Error)]
enum LoopError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

async fn streaming_loop(
    stream: &mut TcpStream,
    ctx: &mut StreamContext,
    sendq: &mut SendQueue,
    handle: &ClientHandle,
    worker: &Rc<WorkerState>,
) -> Result<&'static str, LoopError> {
    let fd = stream.as_raw_fd();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stop = worker.stop.clone();
    let mut last_bytes: u64 = 0;
    let mut last_bw_at = Instant::now();
    let mut last_stats = sendq.stats();
    let mut scratch = [0u8; 512];

    enum Event {
        Writable,
        ClientReadable,
        Payloads(Vec<crate::buffer::BufRef>),
        FlushDeadline,
        Tick,
        Stop,
    }

    loop {
        let now = std::time::Instant::now();
        let want_flush = sendq.wants_flush(now);
        let deadline = sendq.deadline().map(Instant::from_std);

        // Futures in select arms borrow the stream context and socket, so
        // all real work happens after the event resolves.
        let event = tokio::select! {
            biased;
            r = stream.writable(), if want_flush => { r?; Event::Writable }
            r = stream.readable() => { r?; Event::ClientReadable }
            payloads = ctx.pump() => Event::Payloads(payloads?),
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            }, if !want_flush && deadline.is_some() => Event::FlushDeadline,
            _ = tick.tick() => Event::Tick,
            _ = stop.changed() => Event::Stop,
        };

        match event {
            Event::Writable => {
                if sendq.flush(fd)? == FlushOutcome::Drained && sendq.pending_completions() > 0 {
                    let _ = sendq.drain_completions(fd);
                }
            }
            Event::ClientReadable => match stream.try_read(&mut scratch) {
                Ok(0) => return Ok("client disconnected"),
                Ok(_) => {} // stray bytes after the request are ignored
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            },
            Event::Payloads(payloads) => {
                for buf in payloads {
                    handle.add_bytes(buf.len() as u64);
                    sendq.enqueue(buf);
                }
                if sendq.queued_bytes() > MAX_QUEUED_BYTES {
                    return Ok("client too slow");
                }
            }
            Event::FlushDeadline => {
                // Next iteration sees the expired deadline and arms
                // writability.
            }
            Event::Tick => {
                ctx.tick(now)?;
                if handle.disconnect_requested() {
                    return Ok("disconnected by operator");
                }
                handle.set_state(ctx.state_str());
                let bytes = handle.bytes_sent();
                let elapsed = last_bw_at.elapsed().as_millis() as u64;
                if elapsed > 0 {
                    handle.set_bandwidth((bytes - last_bytes) * 8 * 1000 / elapsed);
                }
                last_bytes = bytes;
                last_bw_at = Instant::now();

                let stats = sendq.stats();
                worker.add_send_stats(stats.delta_since(&last_stats));
                last_stats = stats;
                if sendq.pending_completions() > 0 {
                    let _ = sendq.drain_completions(fd);
                }
            }
            Event::Stop => return Ok("server shutting down"),
        }
    }
}

/// Flush what remains and wait briefly for zero-copy completions before the
/// socket closes.
async fn finish_sendq(sendq: &mut SendQueue, stream: &TcpStream, worker: &Rc<WorkerState>) {
    let fd = stream.as_raw_fd();
    let before = sendq.stats();
    for _ in 0..20 {
        let _ = sendq.flush(fd);
        let _ = sendq.drain_completions(fd);
        if sendq.is_empty() && sendq.pending_completions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    sendq.clear();
    sendq.abandon_pending();
    worker.add_send_stats(sendq.stats().delta_since(&before));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServiceConfig, ServiceKind};

    fn request(method: &str, target: &str) -> HttpRequest {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.to_string(), String::new()),
        };
        HttpRequest {
            method: method.to_string(),
            path,
            query,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn test_routing_table() {
        let mut config = Config::default();
        config.services.insert(
            "cctv1".into(),
            ServiceConfig {
                kind: ServiceKind::Mrtp,
                address: "239.1.1.1:5000".into(),
                source: String::new(),
                url: String::new(),
                fcc: String::new(),
                fec: String::new(),
            },
        );

        assert!(matches!(route_request(&config, &request("GET", "/")), Route::StatusPage));
        assert!(matches!(route_request(&config, &request("GET", "/status")), Route::StatusPage));
        assert!(matches!(route_request(&config, &request("GET", "/status/sse")), Route::Sse));
        assert!(matches!(
            route_request(&config, &request("POST", "/api/disconnect")),
            Route::ApiDisconnect
        ));
        assert!(matches!(
            route_request(&config, &request("PUT", "/api/loglevel")),
            Route::ApiLoglevel
        ));
        assert!(matches!(
            route_request(&config, &request("GET", "/udp/239.0.0.1:1234")),
            Route::Media(Service::Mudp { .. })
        ));
        assert!(matches!(
            route_request(&config, &request("GET", "/rtsp/10.0.0.1:554/ch1")),
            Route::Media(Service::Rtsp { .. })
        ));
        assert!(matches!(
            route_request(&config, &request("GET", "/cctv1")),
            Route::Media(Service::Mrtp { .. })
        ));
        assert!(matches!(route_request(&config, &request("GET", "/nope")), Route::NotFound));
        assert!(matches!(
            route_request(&config, &request("DELETE", "/status")),
            Route::BadRequest
        ));
        assert!(matches!(
            route_request(&config, &request("GET", "/udp/bogus")),
            Route::BadRequest
        ));

        config.server.udpxy = false;
        assert!(matches!(
            route_request(&config, &request("GET", "/udp/239.0.0.1:1234")),
            Route::NotFound
        ));
    }

    #[test]
    fn test_token_check() {
        let mut config = Config::default();
        assert!(authorized(&config, &request("GET", "/x")));
        config.server.token = "sekrit".into();
        assert!(!authorized(&config, &request("GET", "/x")));
        let mut req = request("GET", "/x");
        req.headers.push(("Authorization".into(), "Bearer sekrit".into()));
        assert!(authorized(&config, &req));
        let req = request("GET", "/x?token=sekrit");
        assert!(authorized(&config, &req));
        let req = request("GET", "/x?token=wrong");
        assert!(!authorized(&config, &req));
    }

    #[tokio::test]
    async fn test_read_request_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut c = TcpStream::connect(addr).await.unwrap();
            c.write_all(
                b"POST /api/disconnect?x=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 12\r\n\r\nclient_id=42",
            )
            .await
            .unwrap();
            c
        });
        let (mut server_side, _) = listener.accept().await.unwrap();
        let req = read_request(&mut server_side).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/disconnect");
        assert_eq!(req.query_param("x"), Some("1"));
        assert_eq!(req.header("host"), Some("h"));
        assert_eq!(req.body, b"client_id=42");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_request_rejects_garbage() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut c = TcpStream::connect(addr).await.unwrap();
            c.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
            c
        });
        let (mut server_side, _) = listener.accept().await.unwrap();
        assert!(matches!(
            read_request(&mut server_side).await,
            Err(RequestError::BadRequest)
        ));
        client.await.unwrap();
    }
}
