//! Fast channel change session
//!
//! On tune-in the gateway asks the carrier's FCC server for a unicast burst
//! that replays the stream from a recent random-access point, then joins the
//! multicast group and hands off without a gap: multicast packets buffer
//! while the burst catches up, a termination packet tells the server where to
//! stop, and the pending buffer drains once the two meet.
//!
//! Signaling has no application-level retransmit, so every request and
//! termination goes out three times back-to-back.

pub mod packets;

use crate::buffer::BufRef;
use crate::net;
use crate::rtp::{self, seq_delta};
use log::{debug, info, trace, warn};
use packets::{Dialect, MsgKind, Response, MODE_JOIN_MCAST, MODE_REDIRECT, MODE_UNICAST};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;

/// Server response deadline before falling back to plain multicast.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(80);
/// Deadline for the first burst packet after an accepted request.
pub const FIRST_UNICAST_TIMEOUT: Duration = Duration::from_secs(1);
/// How long to wait for the server's sync notification before joining
/// multicast on our own.
pub const SYNC_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_REDIRECTS: u32 = 5;
/// Pending multicast buffer cap; overflowing forces the hand-off.
pub const PENDING_MAX_BYTES: usize = 4 * 1024 * 1024;
const SIGNAL_REPEAT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccState {
    Init,
    Requested,
    UnicastPending,
    UnicastActive,
    McastRequested,
    McastActive,
}

impl FccState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FccState::Init => "init",
            FccState::Requested => "requested",
            FccState::UnicastPending => "unicast-pending",
            FccState::UnicastActive => "unicast-active",
            FccState::McastRequested => "mcast-requested",
            FccState::McastActive => "mcast-active",
        }
    }
}

/// What the owning stream context must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccAction {
    None,
    /// Join the multicast group now; unicast keeps flowing meanwhile.
    JoinMulticast,
    /// FCC failed or was refused: join multicast and stream plainly.
    Fallback,
    /// Burst caught up with the multicast edge: reset the reorder base to
    /// the first multicast sequence and drain the pending buffer.
    Handoff,
}

/// Disposition for an incoming multicast packet while FCC is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McastDisposition {
    Forward,
    Buffered,
    /// Buffered, and the hand-off condition is now met.
    BufferedHandoff,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FccStats {
    pub requests_sent: u64,
    pub termination_bursts: u64,
    pub redirects: u32,
    pub unicast_packets: u64,
    pub pending_peak_bytes: usize,
}

pub struct FccSession {
    dialect: Dialect,
    group: SocketAddrV4,
    server: SocketAddrV4,
    socket: AsyncFd<UdpSocket>,
    state: FccState,
    state_since: Instant,
    term_sent: bool,
    first_mcast_seq: Option<u16>,
    last_unicast_seq: Option<u16>,
    server_media_port: u16,
    pending: Vec<(u16, BufRef)>,
    pending_bytes: usize,
    stats: FccStats,
}

impl FccSession {
    pub fn new(dialect: Dialect, group: SocketAddrV4, server: SocketAddrV4) -> io::Result<Self> {
        let socket = net::udp_socket(SocketAddr::from(([0, 0, 0, 0], 0)), 512 * 1024)?;
        Ok(FccSession {
            dialect,
            group,
            server,
            socket: AsyncFd::new(socket)?,
            state: FccState::Init,
            state_since: Instant::now(),
            term_sent: false,
            first_mcast_seq: None,
            last_unicast_seq: None,
            server_media_port: 0,
            pending: Vec::new(),
            pending_bytes: 0,
            stats: FccStats::default(),
        })
    }

    pub fn state(&self) -> FccState {
        self.state
    }

    pub fn stats(&self) -> FccStats {
        self.stats
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.get_ref().as_raw_fd()
    }

    pub fn socket(&self) -> &AsyncFd<UdpSocket> {
        &self.socket
    }

    pub fn first_mcast_seq(&self) -> Option<u16> {
        self.first_mcast_seq
    }

    /// Await the next batch of datagrams on the signaling/media socket.
    pub async fn recv_datagrams(
        &mut self,
        pool: &crate::buffer::BufferPool,
    ) -> io::Result<Vec<(BufRef, Option<SocketAddrV4>)>> {
        loop {
            let fd = self.raw_fd();
            let mut guard = self.socket.readable().await?;
            let batch = crate::mcast::recv_batch(fd, pool, true)?;
            if batch.packets.is_empty() && batch.dropped == 0 {
                guard.clear_ready();
                continue;
            }
            return Ok(batch
                .packets
                .into_iter()
                .map(|(buf, peer)| (buf.freeze(), peer))
                .collect());
        }
    }

    fn set_state(&mut self, state: FccState, now: Instant) {
        if self.state != state {
            debug!(
                "fcc {}: {} -> {}",
                self.group,
                self.state.as_str(),
                state.as_str()
            );
            self.state = state;
            self.state_since = now;
        }
    }

    fn send_burst(&self, pkt: &[u8], dest: SocketAddrV4) {
        for _ in 0..SIGNAL_REPEAT {
            if let Err(e) = self.socket.get_ref().send_to(pkt, SocketAddr::V4(dest)) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    warn!("fcc {}: signaling send failed: {}", self.group, e);
                    return;
                }
            }
        }
    }

    /// Kick off the session: request the burst and wait for the verdict.
    pub fn start(&mut self, now: Instant) -> io::Result<()> {
        let port = net::local_port(self.socket.get_ref())?;
        let req = packets::build_request(self.dialect, *self.group.ip(), Ipv4Addr::UNSPECIFIED, port);
        self.send_burst(&req, self.server);
        self.stats.requests_sent += 1;
        self.set_state(FccState::Requested, now);
        Ok(())
    }

    /// Handle a datagram that arrived on the FCC socket. Signaling frames are
    /// consumed; unicast media comes back for delivery to the pipeline.
    pub fn handle_datagram(
        &mut self,
        buf: BufRef,
        peer: Option<SocketAddrV4>,
        now: Instant,
    ) -> (Option<BufRef>, FccAction) {
        if let Some(peer) = peer {
            let port_ok = peer.port() == self.server.port()
                || (self.server_media_port != 0 && peer.port() == self.server_media_port);
            if peer.ip() != self.server.ip() || !port_ok {
                trace!("fcc {}: dropping datagram from stranger {}", self.group, peer);
                return (None, FccAction::None);
            }
        }
        if let Some(fb) = packets::parse_fb(buf.as_slice()) {
            let action = match self.dialect.kind_of(fb.fmt) {
                Some(kind) => self.handle_signal(kind, fb.fci, now),
                None => {
                    trace!("fcc {}: unknown FMT {}", self.group, fb.fmt);
                    FccAction::None
                }
            };
            return (None, action);
        }
        self.handle_unicast_media(buf, now)
    }

    fn handle_signal(&mut self, kind: MsgKind, fci: &[u8], now: Instant) -> FccAction {
        match kind {
            MsgKind::Response => {
                if self.state != FccState::Requested {
                    return FccAction::None;
                }
                let resp = match packets::parse_response(self.dialect, fci) {
                    Some(r) => r,
                    None => {
                        warn!("fcc {}: malformed response", self.group);
                        self.set_state(FccState::McastActive, now);
                        return FccAction::Fallback;
                    }
                };
                self.handle_response(resp, now)
            }
            MsgKind::SyncNotify => {
                if self.state == FccState::UnicastActive || self.state == FccState::UnicastPending {
                    let seq = packets::parse_sync(fci).unwrap_or(0);
                    debug!("fcc {}: sync notification (seq {})", self.group, seq);
                    self.set_state(FccState::McastRequested, now);
                    return FccAction::JoinMulticast;
                }
                FccAction::None
            }
            // Requests, terminations and punches are client-to-server only.
            MsgKind::Request | MsgKind::Termination | MsgKind::NatPunch => FccAction::None,
        }
    }

    fn handle_response(&mut self, resp: Response, now: Instant) -> FccAction {
        if resp.result != 0 {
            info!("fcc {}: server refused (result {})", self.group, resp.result);
            self.set_state(FccState::McastActive, now);
            return FccAction::Fallback;
        }
        match resp.mode {
            MODE_UNICAST => {
                self.server_media_port = resp.media_port;
                self.set_state(FccState::UnicastPending, now);
                if self.dialect == Dialect::Huawei {
                    // Open the NAT mapping toward the burst source.
                    let punch = packets::build_nat_punch(*self.group.ip());
                    let dest = SocketAddrV4::new(*self.server.ip(), resp.media_port);
                    self.send_burst(&punch, dest);
                }
                FccAction::None
            }
            MODE_JOIN_MCAST => {
                debug!("fcc {}: server says join multicast directly", self.group);
                self.set_state(FccState::McastRequested, now);
                FccAction::JoinMulticast
            }
            MODE_REDIRECT => {
                self.stats.redirects += 1;
                if self.stats.redirects > MAX_REDIRECTS {
                    warn!("fcc {}: redirect limit exceeded", self.group);
                    self.set_state(FccState::McastActive, now);
                    return FccAction::Fallback;
                }
                let target = SocketAddrV4::new(resp.redirect_ip, resp.redirect_port);
                info!("fcc {}: redirected to {}", self.group, target);
                self.server = target;
                self.set_state(FccState::Init, now);
                if let Err(e) = self.start(now) {
                    warn!("fcc {}: restart after redirect failed: {}", self.group, e);
                    self.set_state(FccState::McastActive, now);
                    return FccAction::Fallback;
                }
                FccAction::None
            }
            other => {
                warn!("fcc {}: unknown response mode {}", self.group, other);
                self.set_state(FccState::McastActive, now);
                FccAction::Fallback
            }
        }
    }

    fn handle_unicast_media(&mut self, buf: BufRef, now: Instant) -> (Option<BufRef>, FccAction) {
        let seq = match rtp::parse(buf.as_slice()) {
            Ok(pkt) => pkt.sequence,
            Err(e) => {
                trace!("fcc {}: unparseable media packet: {}", self.group, e);
                return (None, FccAction::None);
            }
        };
        self.stats.unicast_packets += 1;
        self.last_unicast_seq = Some(seq);
        match self.state {
            FccState::UnicastPending => {
                self.set_state(FccState::UnicastActive, now);
                (Some(buf), FccAction::None)
            }
            FccState::UnicastActive => (Some(buf), FccAction::None),
            FccState::McastRequested => {
                if self.handoff_ready() {
                    self.set_state(FccState::McastActive, now);
                    (Some(buf), FccAction::Handoff)
                } else {
                    (Some(buf), FccAction::None)
                }
            }
            // Residual burst packets after hand-off still carry payload the
            // ring will reject as late; deliver and let it decide.
            FccState::McastActive => (Some(buf), FccAction::None),
            FccState::Init | FccState::Requested => (Some(buf), FccAction::None),
        }
    }

    fn handoff_ready(&self) -> bool {
        match (self.first_mcast_seq, self.last_unicast_seq) {
            (Some(first), Some(last)) => seq_delta(last, first.wrapping_sub(1)) >= 0,
            _ => false,
        }
    }

    /// Feed a multicast RTP packet observed while FCC is live.
    pub fn on_mcast_rtp(&mut self, seq: u16, buf: &BufRef, now: Instant) -> McastDisposition {
        match self.state {
            FccState::McastRequested => {
                if self.first_mcast_seq.is_none() {
                    self.first_mcast_seq = Some(seq);
                    // Ask the server to stop the burst just past the join
                    // point. The +2 offset matches the deployed servers.
                    let term =
                        packets::build_termination(self.dialect, *self.group.ip(), seq.wrapping_add(2));
                    self.send_burst(&term, self.server);
                    self.term_sent = true;
                    self.stats.termination_bursts += 1;
                    debug!(
                        "fcc {}: first multicast seq {}, termination at {}",
                        self.group,
                        seq,
                        seq.wrapping_add(2)
                    );
                }
                self.pending.push((seq, buf.clone()));
                self.pending_bytes += buf.len();
                self.stats.pending_peak_bytes = self.stats.pending_peak_bytes.max(self.pending_bytes);
                if self.handoff_ready() || self.pending_bytes > PENDING_MAX_BYTES {
                    if self.pending_bytes > PENDING_MAX_BYTES {
                        warn!("fcc {}: pending buffer overflow, forcing hand-off", self.group);
                    }
                    self.set_state(FccState::McastActive, now);
                    McastDisposition::BufferedHandoff
                } else {
                    McastDisposition::Buffered
                }
            }
            _ => McastDisposition::Forward,
        }
    }

    /// Drain the pending multicast buffer at hand-off, oldest first.
    pub fn take_pending(&mut self) -> Vec<(u16, BufRef)> {
        self.pending_bytes = 0;
        std::mem::take(&mut self.pending)
    }

    /// Periodic timeout enforcement.
    pub fn tick(&mut self, now: Instant) -> FccAction {
        let elapsed = now.duration_since(self.state_since);
        match self.state {
            FccState::Requested if elapsed >= RESPONSE_TIMEOUT => {
                info!("fcc {}: no server response, falling back to multicast", self.group);
                self.set_state(FccState::McastActive, now);
                FccAction::Fallback
            }
            FccState::UnicastPending if elapsed >= FIRST_UNICAST_TIMEOUT => {
                info!("fcc {}: burst never arrived, falling back to multicast", self.group);
                self.set_state(FccState::McastActive, now);
                FccAction::Fallback
            }
            FccState::UnicastActive if elapsed >= SYNC_WAIT_TIMEOUT => {
                info!("fcc {}: sync wait expired, joining multicast", self.group);
                self.set_state(FccState::McastRequested, now);
                FccAction::JoinMulticast
            }
            _ => FccAction::None,
        }
    }

    /// Tear the session down. If no termination was ever sent, an emergency
    /// stop with sequence zero goes out so the server does not keep bursting.
    pub fn cleanup(&mut self) {
        if !self.term_sent && self.state != FccState::Init {
            let term = packets::build_termination(self.dialect, *self.group.ip(), 0);
            self.send_burst(&term, self.server);
            self.term_sent = true;
            self.stats.termination_bursts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{buf_from_slice, BufferPool, PoolConfig};

    fn pool() -> BufferPool {
        BufferPool::new(PoolConfig::default())
    }

    const GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 5000);

    struct FakeServer {
        socket: UdpSocket,
    }

    impl FakeServer {
        fn new() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            FakeServer { socket }
        }

        fn addr(&self) -> SocketAddrV4 {
            match self.socket.local_addr().unwrap() {
                SocketAddr::V4(a) => a,
                _ => unreachable!(),
            }
        }

        fn recv(&self) -> (Vec<u8>, SocketAddr) {
            let mut buf = vec![0u8; 1500];
            let (n, from) = self.socket.recv_from(&mut buf).unwrap();
            buf.truncate(n);
            (buf, from)
        }
    }

    fn rtp_frame(seq: u16) -> Vec<u8> {
        let mut pkt = vec![0x80, 33, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2];
        pkt[2..4].copy_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(b"ts-payload");
        pkt
    }

    #[tokio::test]
    async fn test_happy_path_telecom() {
        let pool = pool();
        let server = FakeServer::new();
        let now = Instant::now();
        let mut fcc = FccSession::new(Dialect::Telecom, GROUP, server.addr()).unwrap();
        fcc.start(now).unwrap();
        assert_eq!(fcc.state(), FccState::Requested);

        // Request goes out three times.
        let (req, from) = server.recv();
        let fb = packets::parse_fb(&req).unwrap();
        assert_eq!(Dialect::Telecom.kind_of(fb.fmt), Some(MsgKind::Request));
        assert_eq!(fb.media_ssrc, u32::from(*GROUP.ip()));
        server.recv();
        server.recv();

        // Server accepts with a unicast burst.
        let resp = packets::build_response(
            Dialect::Telecom,
            *GROUP.ip(),
            &Response {
                result: 0,
                mode: MODE_UNICAST,
                media_port: 50000,
                redirect_ip: Ipv4Addr::UNSPECIFIED,
                redirect_port: 0,
            },
        );
        let peer = match from {
            SocketAddr::V4(_) => server.addr(),
            _ => unreachable!(),
        };
        let (media, action) =
            fcc.handle_datagram(buf_from_slice(&pool, &resp).unwrap(), Some(peer), now);
        assert!(media.is_none());
        assert_eq!(action, FccAction::None);
        assert_eq!(fcc.state(), FccState::UnicastPending);

        // Burst packets 1000..=1009 arrive.
        for seq in 1000u16..1010 {
            let (media, action) =
                fcc.handle_datagram(buf_from_slice(&pool, &rtp_frame(seq)).unwrap(), Some(peer), now);
            assert!(media.is_some());
            assert_eq!(action, FccAction::None);
        }
        assert_eq!(fcc.state(), FccState::UnicastActive);

        // Server tells us to join the group.
        let sync = packets::build_sync(Dialect::Telecom, *GROUP.ip(), 1010);
        let (_, action) =
            fcc.handle_datagram(buf_from_slice(&pool, &sync).unwrap(), Some(peer), now);
        assert_eq!(action, FccAction::JoinMulticast);
        assert_eq!(fcc.state(), FccState::McastRequested);

        // First multicast packet: termination with seq + 2, and since the
        // burst already reached 1009 >= 1010 - 1, hand-off is immediate.
        let mbuf = buf_from_slice(&pool, &rtp_frame(1010)).unwrap();
        let disp = fcc.on_mcast_rtp(1010, &mbuf, now);
        assert_eq!(disp, McastDisposition::BufferedHandoff);
        assert_eq!(fcc.state(), FccState::McastActive);
        let (term, _) = server.recv();
        let fb = packets::parse_fb(&term).unwrap();
        assert_eq!(Dialect::Telecom.kind_of(fb.fmt), Some(MsgKind::Termination));
        assert_eq!(crate::wire::read_u16_be(fb.fci, 0), Some(1012));

        let pending = fcc.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, 1010);

        // Cleanup after a sent termination stays quiet.
        fcc.cleanup();
        assert_eq!(fcc.stats().termination_bursts, 1);
    }

    #[tokio::test]
    async fn test_burst_still_behind_buffers_multicast() {
        let pool = pool();
        let server = FakeServer::new();
        let now = Instant::now();
        let mut fcc = FccSession::new(Dialect::Telecom, GROUP, server.addr()).unwrap();
        fcc.start(now).unwrap();
        let resp = packets::build_response(
            Dialect::Telecom,
            *GROUP.ip(),
            &Response {
                result: 0,
                mode: MODE_UNICAST,
                media_port: 50000,
                redirect_ip: Ipv4Addr::UNSPECIFIED,
                redirect_port: 0,
            },
        );
        fcc.handle_datagram(buf_from_slice(&pool, &resp).unwrap(), None, now);
        // Burst at 500, multicast already at 520.
        fcc.handle_datagram(buf_from_slice(&pool, &rtp_frame(500)).unwrap(), None, now);
        let sync = packets::build_sync(Dialect::Telecom, *GROUP.ip(), 0);
        fcc.handle_datagram(buf_from_slice(&pool, &sync).unwrap(), None, now);

        for seq in 520u16..523 {
            let buf = buf_from_slice(&pool, &rtp_frame(seq)).unwrap();
            assert_eq!(fcc.on_mcast_rtp(seq, &buf, now), McastDisposition::Buffered);
        }
        // Unicast catches up to 519 == first - 1: hand-off.
        for seq in 501u16..519 {
            fcc.handle_datagram(buf_from_slice(&pool, &rtp_frame(seq)).unwrap(), None, now);
        }
        let (media, action) =
            fcc.handle_datagram(buf_from_slice(&pool, &rtp_frame(519)).unwrap(), None, now);
        assert!(media.is_some());
        assert_eq!(action, FccAction::Handoff);
        assert_eq!(fcc.take_pending().len(), 3);
    }

    #[tokio::test]
    async fn test_timeouts_fall_back() {
        let server = FakeServer::new();
        let now = Instant::now();
        let mut fcc = FccSession::new(Dialect::Huawei, GROUP, server.addr()).unwrap();
        fcc.start(now).unwrap();
        assert_eq!(fcc.tick(now + Duration::from_millis(50)), FccAction::None);
        assert_eq!(
            fcc.tick(now + Duration::from_millis(100)),
            FccAction::Fallback
        );
        assert_eq!(fcc.state(), FccState::McastActive);
    }

    #[tokio::test]
    async fn test_redirect_bounded() {
        let pool = pool();
        let server = FakeServer::new();
        let now = Instant::now();
        let mut fcc = FccSession::new(Dialect::Telecom, GROUP, server.addr()).unwrap();
        fcc.start(now).unwrap();
        let redirect = packets::build_response(
            Dialect::Telecom,
            *GROUP.ip(),
            &Response {
                result: 0,
                mode: MODE_REDIRECT,
                media_port: 0,
                redirect_ip: Ipv4Addr::new(127, 0, 0, 1),
                redirect_port: server.addr().port(),
            },
        );
        for _ in 0..MAX_REDIRECTS {
            let (_, action) =
                fcc.handle_datagram(buf_from_slice(&pool, &redirect).unwrap(), None, now);
            assert_eq!(action, FccAction::None);
            assert_eq!(fcc.state(), FccState::Requested);
        }
        let (_, action) = fcc.handle_datagram(buf_from_slice(&pool, &redirect).unwrap(), None, now);
        assert_eq!(action, FccAction::Fallback);
    }

    #[tokio::test]
    async fn test_emergency_termination_once() {
        let server = FakeServer::new();
        let now = Instant::now();
        let mut fcc = FccSession::new(Dialect::Telecom, GROUP, server.addr()).unwrap();
        fcc.start(now).unwrap();
        // Drain the requests.
        for _ in 0..3 {
            server.recv();
        }
        fcc.cleanup();
        fcc.cleanup();
        assert_eq!(fcc.stats().termination_bursts, 1);
        let (term, _) = server.recv();
        let fb = packets::parse_fb(&term).unwrap();
        assert_eq!(Dialect::Telecom.kind_of(fb.fmt), Some(MsgKind::Termination));
        assert_eq!(crate::wire::read_u16_be(fb.fci, 0), Some(0));
    }
}
