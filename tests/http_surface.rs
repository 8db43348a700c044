//! End-to-end tests over loopback: real sockets, real connection tasks.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::LocalSet;
use tsgate::config::Config;
use tsgate::connection;
use tsgate::status::Status;
use tsgate::worker::WorkerState;

async fn spawn_gateway(config: Config) -> (std::net::SocketAddr, watch::Sender<bool>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let status = Status::new(1, config.server.maxclients);
    let state = WorkerState::new(0, Arc::new(config), status, stop_rx).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::task::spawn_local(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(a) => a,
                Err(_) => break,
            };
            let state = state.clone();
            tokio::task::spawn_local(async move {
                connection::handle_connection(socket, peer, state).await;
            });
        }
    });
    (addr, stop_tx)
}

async fn http_get(addr: std::net::SocketAddr, target: &str, extra: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("GET {} HTTP/1.1\r\nHost: test\r\n{}\r\n", target, extra);
    stream.write_all(req.as_bytes()).await.unwrap();
    let mut body = Vec::new();
    stream.read_to_end(&mut body).await.unwrap();
    let text = String::from_utf8_lossy(&body).to_string();
    let code = text
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    (code, text)
}

#[tokio::test]
async fn test_status_page_and_api() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _stop) = spawn_gateway(Config::default()).await;

            let (code, text) = http_get(addr, "/status", "").await;
            assert_eq!(code, 200);
            assert!(text.contains("text/html"));
            assert!(text.contains("tsgate"));

            let (code, _) = http_get(addr, "/definitely-missing", "").await;
            assert_eq!(code, 404);

            // Log level API via PUT.
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let body = "level=3";
            let req = format!(
                "PUT /api/loglevel HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(req.as_bytes()).await.unwrap();
            let mut rsp = Vec::new();
            stream.read_to_end(&mut rsp).await.unwrap();
            let rsp = String::from_utf8_lossy(&rsp).to_string();
            assert!(rsp.contains("200"));
            assert!(rsp.contains("\"success\":true"));

            // Disconnecting an unknown client 404s.
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let body = "client_id=777";
            let req = format!(
                "POST /api/disconnect HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(req.as_bytes()).await.unwrap();
            let mut rsp = Vec::new();
            stream.read_to_end(&mut rsp).await.unwrap();
            assert!(String::from_utf8_lossy(&rsp).contains("404"));
        })
        .await;
}

#[tokio::test]
async fn test_bearer_token_enforced() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut config = Config::default();
            config.server.token = "sekrit".to_string();
            let (addr, _stop) = spawn_gateway(config).await;

            let (code, _) = http_get(addr, "/status", "").await;
            assert_eq!(code, 401);

            let (code, _) =
                http_get(addr, "/status", "Authorization: Bearer sekrit\r\n").await;
            assert_eq!(code, 200);

            let (code, _) = http_get(addr, "/status?token=sekrit", "").await;
            assert_eq!(code, 200);
        })
        .await;
}

#[tokio::test]
async fn test_sse_first_frame_schema() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _stop) = spawn_gateway(Config::default()).await;

            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /status/sse HTTP/1.1\r\nHost: t\r\n\r\n")
                .await
                .unwrap();

            // Read until the first complete `data:` frame.
            let mut buf = Vec::new();
            let mut chunk = [0u8; 2048];
            let frame = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before first frame");
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(start) = text.find("data: ") {
                    if let Some(end) = text[start..].find("\n\n") {
                        break text[start + 6..start + end].to_string();
                    }
                }
            };
            let head = String::from_utf8_lossy(&buf);
            assert!(head.contains("text/event-stream"));

            let json: serde_json::Value = serde_json::from_str(frame.trim()).unwrap();
            for key in [
                "serverStartTime",
                "uptimeMs",
                "currentLogLevel",
                "version",
                "maxClients",
                "clients",
                "totalClients",
                "workers",
                "logsMode",
                "logs",
            ] {
                assert!(json.get(key).is_some(), "missing key {}", key);
            }
            assert_eq!(json["totalClients"], 0);
            assert_eq!(json["clients"], serde_json::json!([]));
            assert_eq!(json["logsMode"], "full");
            let worker = &json["workers"][0];
            for key in ["id", "pid", "activeClients", "send", "pool"] {
                assert!(worker.get(key).is_some(), "missing worker key {}", key);
            }
        })
        .await;
}

/// Full-stack RTSP: HTTP client asks for /rtsp/..., the gateway negotiates
/// an interleaved session against a fake server, and the RTP payloads come
/// back as the MPEG-TS HTTP body.
#[tokio::test]
async fn test_rtsp_route_streams_to_http_body() {
    let local = LocalSet::new();
    local
        .run_until(async {
            use tokio::io::{AsyncBufReadExt, BufReader};

            let rtsp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let rtsp_addr = rtsp_listener.local_addr().unwrap();

            tokio::task::spawn_local(async move {
                let (sock, _) = rtsp_listener.accept().await.unwrap();
                let (read_half, mut write) = sock.into_split();
                let mut reader = BufReader::new(read_half);

                let respond = |cseq: u32, extra: &str| {
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: {}\r\n{}Content-Length: 0\r\n\r\n",
                        cseq, extra
                    )
                };

                for expected in ["DESCRIBE", "SETUP", "PLAY"] {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    assert!(line.starts_with(expected), "got {:?}", line);
                    let mut cseq = 0;
                    loop {
                        let mut hdr = String::new();
                        reader.read_line(&mut hdr).await.unwrap();
                        let t = hdr.trim();
                        if let Some(v) = t.strip_prefix("CSeq:") {
                            cseq = v.trim().parse().unwrap();
                        }
                        if t.is_empty() {
                            break;
                        }
                    }
                    let extra = match expected {
                        "SETUP" => {
                            "Transport: MP2T/RTP/TCP;unicast;interleaved=0-1\r\nSession: 99\r\n"
                        }
                        _ => "",
                    };
                    write.write_all(respond(cseq, extra).as_bytes()).await.unwrap();
                }

                // Two RTP frames and an RTCP frame in between.
                let frame = |channel: u8, payload: &[u8]| {
                    let mut f = vec![b'$', channel];
                    f.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                    f.extend_from_slice(payload);
                    f
                };
                let rtp = |seq: u16, fill: u8| {
                    let mut p = vec![0x80, 33, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2];
                    p[2..4].copy_from_slice(&seq.to_be_bytes());
                    p.extend_from_slice(&[fill; 8]);
                    p
                };
                let mut wire = frame(0, &rtp(1, 0xAA));
                wire.extend_from_slice(&frame(1, &[0u8; 8]));
                wire.extend_from_slice(&frame(0, &rtp(2, 0xBB)));
                write.write_all(&wire).await.unwrap();

                // Hold the connection open until the gateway tears down.
                let mut rest = String::new();
                let _ = reader.read_line(&mut rest).await;
            });

            let (addr, _stop) = spawn_gateway(Config::default()).await;
            let mut client = TcpStream::connect(addr).await.unwrap();
            let req = format!(
                "GET /rtsp/{}/live/ch1 HTTP/1.1\r\nHost: t\r\n\r\n",
                rtsp_addr
            );
            client.write_all(req.as_bytes()).await.unwrap();

            // Expect the streaming preamble and then exactly the two RTP
            // payloads (16 bytes).
            let mut collected = Vec::new();
            let mut chunk = [0u8; 2048];
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            while std::time::Instant::now() < deadline {
                let n = tokio::time::timeout(
                    std::time::Duration::from_millis(500),
                    client.read(&mut chunk),
                )
                .await
                .map(|r| r.unwrap())
                .unwrap_or(0);
                if n == 0 && !collected.is_empty() {
                    break;
                }
                collected.extend_from_slice(&chunk[..n]);
                if let Some(pos) = find_subslice(&collected, b"\r\n\r\n") {
                    if collected.len() >= pos + 4 + 16 {
                        break;
                    }
                }
            }
            let text = String::from_utf8_lossy(&collected);
            assert!(text.starts_with("HTTP/1.1 200 OK"), "got {:?}", &text[..40.min(text.len())]);
            assert!(text.contains("Content-Type: video/mp2t"));
            let body_start = find_subslice(&collected, b"\r\n\r\n").unwrap() + 4;
            let body = &collected[body_start..body_start + 16];
            assert_eq!(&body[..8], &[0xAA; 8]);
            assert_eq!(&body[8..], &[0xBB; 8]);
        })
        .await;
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
