//! Async RTSP client
//!
//! Drives one RTSP connection through DESCRIBE / SETUP / PLAY and hands the
//! resulting media packets to the stream pipeline. Transport is negotiated
//! from a fixed preference list (interleaved TCP first); UDP transports can
//! advertise a STUN-mapped public port. Methods are strictly sequential on
//! the connection and CSeq increases monotonically.

pub mod interleaved;
pub mod playseek;
pub mod stun;
pub mod transport;

use interleaved::{DeframeError, Deframed, Deframer};
use log::{debug, info, trace};
use rtsp_types::headers::{self, CSeq};
use rtsp_types::{HeaderName, Message, Method, Request, Response, Version};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use transport::{NegotiatedTransport, TransportMode, TransportProtocol};
use url::Url;

pub const MAX_REDIRECTS: u32 = 5;
/// Best-effort TEARDOWN: wait this long for the reply, then force-free.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive unanswered keepalive intervals (no server bytes at all)
/// before the session is declared dead.
const MAX_MISSED_KEEPALIVES: u32 = 3;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("tsgate/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum RtspError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad RTSP url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server answered {0}")]
    Status(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Deframe(#[from] DeframeError),
    #[error("redirect limit exceeded")]
    RedirectLimit,
    #[error("no acceptable transport")]
    NoTransport,
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("timed out waiting for the server")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Init,
    Connecting,
    Connected,
    Describing,
    Described,
    SettingUp,
    SetUp,
    Playing,
    TearingDown,
    TornDown,
}

impl RtspState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspState::Init => "init",
            RtspState::Connecting => "connecting",
            RtspState::Connected => "connected",
            RtspState::Describing => "describing",
            RtspState::Described => "described",
            RtspState::SettingUp => "setting-up",
            RtspState::SetUp => "set-up",
            RtspState::Playing => "playing",
            RtspState::TearingDown => "tearing-down",
            RtspState::TornDown => "torn-down",
        }
    }
}

/// Which URI a request targets.
enum Target {
    Base,
    Control,
}

pub struct RtspSession {
    url: Url,
    state: RtspState,
    cseq: u32,
    session_id: Option<String>,
    stream: Option<TcpStream>,
    deframer: Deframer,
    /// Media frames that arrived interleaved with a response.
    pending_media: VecDeque<Vec<u8>>,
    transport: Option<NegotiatedTransport>,
    udp_rtp: Option<UdpSocket>,
    udp_rtcp: Option<UdpSocket>,
    stun_server: Option<SocketAddr>,
    range: Option<String>,
    redirects: u32,
    control_url: Option<Url>,
    next_keepalive: Instant,
    /// Keepalives sent since the server last produced any traffic.
    missed_keepalives: u32,
}

impl RtspSession {
    pub fn new(url: Url, playseek_param: Option<&str>, stun_server: Option<SocketAddr>) -> Self {
        let range = playseek_param.and_then(playseek::playseek_to_clock);
        RtspSession {
            url,
            state: RtspState::Init,
            cseq: 0,
            session_id: None,
            stream: None,
            deframer: Deframer::new(),
            pending_media: VecDeque::new(),
            transport: None,
            udp_rtp: None,
            udp_rtcp: None,
            stun_server,
            range,
            redirects: 0,
            control_url: None,
            next_keepalive: Instant::now() + KEEPALIVE_INTERVAL,
            missed_keepalives: 0,
        }
    }

    pub fn state(&self) -> RtspState {
        self.state
    }

    pub fn transport(&self) -> Option<&NegotiatedTransport> {
        self.transport.as_ref()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Run the setup sequence through PLAY.
    pub async fn start(&mut self) -> Result<(), RtspError> {
        self.connect().await?;
        self.describe().await?;
        self.setup().await?;
        self.play().await?;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), RtspError> {
        self.state = RtspState::Connecting;
        let host = self
            .url
            .host_str()
            .ok_or_else(|| RtspError::Protocol("url without host".into()))?;
        let port = self.url.port().unwrap_or(554);
        let stream = timeout(RESPONSE_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RtspError::Timeout)??;
        stream.set_nodelay(true).ok();
        debug!("rtsp: connected to {}:{}", host, port);
        self.stream = Some(stream);
        self.deframer = Deframer::new();
        self.state = RtspState::Connected;
        Ok(())
    }

    fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    async fn send_message(&mut self, msg: Message<Vec<u8>>) -> Result<(), RtspError> {
        let mut data = Vec::new();
        msg.write(&mut data)
            .map_err(|e| RtspError::Protocol(format!("serialize: {}", e)))?;
        let stream = self.stream.as_mut().ok_or(RtspError::ConnectionClosed)?;
        stream.write_all(&data).await?;
        Ok(())
    }

    /// Read until a full RTSP response arrives. Interleaved media frames on
    /// the RTP channel are queued; RTCP frames are discarded.
    async fn read_response(&mut self) -> Result<Response<Vec<u8>>, RtspError> {
        let mut buf = [0u8; 8192];
        loop {
            while let Some(item) = self.deframer.next()? {
                match item {
                    Deframed::Data(channel, payload) => self.queue_media(channel, payload),
                    Deframed::Message(Message::Response(rsp)) => return Ok(rsp),
                    Deframed::Message(Message::Request(req)) => {
                        trace!("rtsp: ignoring server request {:?}", req.method());
                    }
                    Deframed::Message(Message::Data(data)) => {
                        self.queue_media(data.channel_id(), data.into_body());
                    }
                }
            }
            let stream = self.stream.as_mut().ok_or(RtspError::ConnectionClosed)?;
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(RtspError::ConnectionClosed);
            }
            self.missed_keepalives = 0;
            self.deframer.push(&buf[..n])?;
        }
    }

    fn queue_media(&mut self, channel: u8, payload: Vec<u8>) {
        match self.transport.as_ref() {
            Some(t) if channel == t.interleaved.0 => self.pending_media.push_back(payload),
            Some(t) if channel == t.interleaved.1 => trace!("rtsp: RTCP frame discarded"),
            _ => trace!("rtsp: frame on unknown channel {}", channel),
        }
    }

    /// One request/response exchange, following redirects (bounded).
    async fn roundtrip(
        &mut self,
        method: Method,
        target: Target,
        extra: &[(HeaderName, String)],
    ) -> Result<Response<Vec<u8>>, RtspError> {
        loop {
            let uri = match target {
                Target::Base => self.url.clone(),
                Target::Control => self.control_url.clone().unwrap_or_else(|| self.url.clone()),
            };
            let cseq = self.next_cseq();
            let mut builder = Request::builder(method.clone(), Version::V1_0)
                .request_uri(uri)
                .typed_header::<CSeq>(&cseq.into())
                .header(headers::USER_AGENT, USER_AGENT);
            if let Some(session) = &self.session_id {
                builder = builder.header(headers::SESSION, session.clone());
            }
            for (name, value) in extra {
                builder = builder.header(name.clone(), value.clone());
            }
            let req = builder.build(Vec::new());
            self.send_message(req.into()).await?;
            let rsp = timeout(RESPONSE_TIMEOUT, self.read_response())
                .await
                .map_err(|_| RtspError::Timeout)??;
            let code = u16::from(rsp.status());
            if (300..400).contains(&code) {
                self.redirects += 1;
                if self.redirects > MAX_REDIRECTS {
                    return Err(RtspError::RedirectLimit);
                }
                let location = rsp
                    .header(&headers::LOCATION)
                    .map(|v| v.as_str().to_string())
                    .ok_or_else(|| RtspError::Protocol("redirect without Location".into()))?;
                self.url = Url::parse(&location).or_else(|_| self.url.join(&location))?;
                info!("rtsp: redirected to {}", self.url);
                self.control_url = None;
                self.connect().await?;
                continue;
            }
            if code != 200 {
                return Err(RtspError::Status(code));
            }
            return Ok(rsp);
        }
    }

    async fn describe(&mut self) -> Result<(), RtspError> {
        self.state = RtspState::Describing;
        let rsp = self
            .roundtrip(
                Method::Describe,
                Target::Base,
                &[(headers::ACCEPT, "application/sdp".to_string())],
            )
            .await?;
        self.control_url = extract_control(rsp.body(), &self.url);
        self.state = RtspState::Described;
        Ok(())
    }

    async fn setup(&mut self) -> Result<(), RtspError> {
        self.state = RtspState::SettingUp;
        // UDP offers need bound sockets up front; STUN (when configured)
        // rewrites the advertised port to the NAT mapping.
        let (rtp_sock, rtcp_sock, mut client_port) = bind_udp_pair().await?;
        if let Some(server) = self.stun_server {
            if let Some(mapped) = stun::query(&rtp_sock, server).await? {
                client_port = mapped.port();
            }
        }
        self.udp_rtp = Some(rtp_sock);
        self.udp_rtcp = Some(rtcp_sock);

        let offer = transport::offer_header(client_port);
        let rsp = self
            .roundtrip(Method::Setup, Target::Control, &[(headers::TRANSPORT, offer)])
            .await?;

        let chosen = rsp
            .header(&headers::TRANSPORT)
            .map(|v| v.as_str().to_string())
            .ok_or(RtspError::NoTransport)?;
        let negotiated = transport::parse_transport_header(&chosen).ok_or(RtspError::NoTransport)?;
        info!("rtsp: transport {}", negotiated);
        if negotiated.mode == TransportMode::Tcp {
            // Interleaved: the UDP pair is dead weight.
            self.udp_rtp = None;
            self.udp_rtcp = None;
        }
        self.transport = Some(negotiated);

        if let Some(session) = rsp.header(&headers::SESSION) {
            let id = session.as_str().split(';').next().unwrap_or("").trim();
            if !id.is_empty() {
                self.session_id = Some(id.to_string());
            }
        }
        self.state = RtspState::SetUp;
        Ok(())
    }

    async fn play(&mut self) -> Result<(), RtspError> {
        let mut extra = Vec::new();
        if let Some(range) = &self.range {
            extra.push((headers::RANGE, range.clone()));
        }
        self.roundtrip(Method::Play, Target::Control, &extra).await?;
        self.state = RtspState::Playing;
        self.next_keepalive = Instant::now() + KEEPALIVE_INTERVAL;
        Ok(())
    }

    /// Next media packet while Playing. The payload framing depends on the
    /// negotiated transport protocol.
    ///
    /// Liveness: every keepalive interval without a single byte from the
    /// server bumps a miss counter; any server traffic (media, RTCP, a
    /// keepalive response) resets it. Past the limit the session reports
    /// [`RtspError::Timeout`], the heartbeat analogue of a multicast
    /// upstream going silent.
    pub async fn recv_media(&mut self) -> Result<(TransportProtocol, Vec<u8>), RtspError> {
        let protocol = self
            .transport
            .as_ref()
            .map(|t| t.protocol)
            .ok_or(RtspError::NoTransport)?;
        loop {
            if let Some(payload) = self.pending_media.pop_front() {
                return Ok((protocol, payload));
            }
            let deadline = self.next_keepalive;
            match timeout_at_media(self, deadline).await? {
                Some(payload) => return Ok((protocol, payload)),
                None => {
                    // Keepalive due.
                    if self.missed_keepalives >= MAX_MISSED_KEEPALIVES {
                        info!("rtsp: server silent for {} keepalives, giving up", self.missed_keepalives);
                        return Err(RtspError::Timeout);
                    }
                    self.send_keepalive().await?;
                    self.missed_keepalives += 1;
                    self.next_keepalive = Instant::now() + KEEPALIVE_INTERVAL;
                }
            }
        }
    }

    async fn send_keepalive(&mut self) -> Result<(), RtspError> {
        let cseq = self.next_cseq();
        let mut builder = Request::builder(Method::Options, Version::V1_0)
            .request_uri(self.url.clone())
            .typed_header::<CSeq>(&cseq.into())
            .header(headers::USER_AGENT, USER_AGENT);
        if let Some(session) = &self.session_id {
            builder = builder.header(headers::SESSION, session.clone());
        }
        trace!("rtsp: keepalive");
        self.send_message(builder.build(Vec::new()).into()).await
    }

    /// Best-effort TEARDOWN. Ok(true) when the server acknowledged within
    /// the grace period.
    pub async fn teardown(&mut self) -> Result<bool, RtspError> {
        if self.stream.is_none() || self.state == RtspState::TornDown {
            return Ok(true);
        }
        self.state = RtspState::TearingDown;
        let result = timeout(TEARDOWN_GRACE, async {
            self.roundtrip(Method::Teardown, Target::Control, &[]).await
        })
        .await;
        self.state = RtspState::TornDown;
        self.stream = None;
        match result {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(RtspError::ConnectionClosed)) => Ok(true),
            Ok(Err(e)) => {
                debug!("rtsp: teardown error: {}", e);
                Ok(false)
            }
            Err(_) => {
                debug!("rtsp: teardown timed out");
                Ok(false)
            }
        }
    }
}

/// Await the next media packet across the active sockets, or `None` when the
/// keepalive deadline passes first.
async fn timeout_at_media(
    session: &mut RtspSession,
    deadline: Instant,
) -> Result<Option<Vec<u8>>, RtspError> {
    let mode = session
        .transport
        .as_ref()
        .map(|t| t.mode)
        .ok_or(RtspError::NoTransport)?;
    match mode {
        TransportMode::Tcp => {
            let mut buf = [0u8; 8192];
            loop {
                if let Some(p) = session.pending_media.pop_front() {
                    return Ok(Some(p));
                }
                let stream = session.stream.as_mut().ok_or(RtspError::ConnectionClosed)?;
                let read = tokio::time::timeout_at(deadline, stream.read(&mut buf)).await;
                let n = match read {
                    Ok(r) => r?,
                    Err(_) => return Ok(None),
                };
                if n == 0 {
                    return Err(RtspError::ConnectionClosed);
                }
                session.missed_keepalives = 0;
                session.deframer.push(&buf[..n])?;
                while let Some(item) = session.deframer.next()? {
                    match item {
                        Deframed::Data(channel, payload) => session.queue_media(channel, payload),
                        Deframed::Message(Message::Response(_)) => {
                            trace!("rtsp: keepalive response");
                        }
                        Deframed::Message(Message::Request(req)) => {
                            trace!("rtsp: ignoring server request {:?}", req.method());
                        }
                        Deframed::Message(Message::Data(data)) => {
                            session.queue_media(data.channel_id(), data.into_body());
                        }
                    }
                }
            }
        }
        TransportMode::Udp => {
            let RtspSession { stream, deframer, udp_rtp, udp_rtcp, missed_keepalives, .. } =
                session;
            let rtp = udp_rtp.as_ref().ok_or(RtspError::NoTransport)?;
            let rtcp = udp_rtcp.as_ref();
            let tcp = stream.as_mut();
            let mut rtp_buf = [0u8; crate::buffer::BUFFER_SIZE];
            let mut rtcp_buf = [0u8; 1500];
            let mut tcp_buf = [0u8; 2048];
            let recv = async {
                let mut tcp = tcp;
                loop {
                    tokio::select! {
                        r = rtp.recv_from(&mut rtp_buf) => {
                            let (n, _) = r?;
                            *missed_keepalives = 0;
                            return Ok::<_, RtspError>(rtp_buf[..n].to_vec());
                        }
                        r = async {
                            match rtcp {
                                Some(s) => s.recv_from(&mut rtcp_buf).await,
                                None => std::future::pending().await,
                            }
                        } => {
                            let _ = r?;
                            // RTCP is consumed and dropped.
                            *missed_keepalives = 0;
                        }
                        // Keep the control connection drained: keepalive
                        // responses and server chatter land here.
                        r = async {
                            match tcp.as_deref_mut() {
                                Some(s) => s.read(&mut tcp_buf).await,
                                None => std::future::pending().await,
                            }
                        } => {
                            let n = r?;
                            if n == 0 {
                                return Err(RtspError::ConnectionClosed);
                            }
                            *missed_keepalives = 0;
                            deframer.push(&tcp_buf[..n])?;
                            while let Some(_item) = deframer.next()? {
                                trace!("rtsp: control traffic during UDP play consumed");
                            }
                        }
                    }
                }
            };
            match tokio::time::timeout_at(deadline, recv).await {
                Ok(r) => r.map(Some),
                Err(_) => Ok(None),
            }
        }
    }
}

/// Bind an RTP/RTCP port pair (even/odd). Falls back to whatever two ports
/// the kernel hands out if no aligned pair is found quickly.
async fn bind_udp_pair() -> io::Result<(UdpSocket, UdpSocket, u16)> {
    for _ in 0..10 {
        let rtp = UdpSocket::bind("0.0.0.0:0").await?;
        let port = rtp.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        match UdpSocket::bind(("0.0.0.0", port + 1)).await {
            Ok(rtcp) => return Ok((rtp, rtcp, port)),
            Err(_) => continue,
        }
    }
    let rtp = UdpSocket::bind("0.0.0.0:0").await?;
    let port = rtp.local_addr()?.port();
    let rtcp = UdpSocket::bind("0.0.0.0:0").await?;
    Ok((rtp, rtcp, port))
}

/// Pull the session/control URL out of an SDP body.
fn extract_control(body: &[u8], base: &Url) -> Option<Url> {
    for line in body.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r').trim();
        if let Some(value) = line.strip_prefix("a=control:") {
            let value = value.trim();
            if value == "*" || value.is_empty() {
                return None;
            }
            if let Ok(url) = Url::parse(value) {
                return Some(url);
            }
            return base.join(value).ok();
        }
    }
    None
}
