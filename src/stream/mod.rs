//! Per-connection media pipeline
//!
//! A `StreamContext` owns every upstream socket of one streaming client and
//! is the sole producer of its output: multicast (with optional FCC burst
//! and FEC recovery) or an RTSP session. The connection task pumps it for
//! payload views and enqueues them on its send queue.

use crate::buffer::{buf_from_slice, BufRef, BufferPool};
use crate::config::{Config, Service};
use crate::fcc::packets::Dialect;
use crate::fcc::{FccAction, FccSession, McastDisposition};
use crate::fec::{FecContext, FEC_PAYLOAD_TYPES};
use crate::mcast::McastRx;
use crate::net::{self, Iface};
use crate::reorder::ReorderRing;
use crate::rtp;
use crate::rtsp::transport::TransportProtocol;
use crate::rtsp::{RtspError, RtspSession};
use log::{debug, trace, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Rtsp(#[from] RtspError),
    #[error("upstream went silent")]
    UpstreamTimeout,
}

/// Stream-relevant knobs distilled from the config.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub rcvbuf: usize,
    pub iface: Iface,
    pub rejoin_interval: Option<Duration>,
    pub mcast_timeout: Duration,
    pub dialect: Dialect,
    pub stun_server: Option<SocketAddr>,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> io::Result<StreamSettings> {
        Ok(StreamSettings {
            rcvbuf: config.buffers.udp_rcvbuf,
            iface: net::parse_iface(&config.upstream.mcast_interface)?,
            rejoin_interval: (config.upstream.mcast_rejoin_interval > 0)
                .then(|| Duration::from_secs(config.upstream.mcast_rejoin_interval)),
            mcast_timeout: Duration::from_secs(config.upstream.mcast_timeout.max(1)),
            dialect: config.upstream.fcc_dialect.to_packets(),
            stun_server: config.stun_server(),
        })
    }
}

struct McastStream {
    group: SocketAddrV4,
    source: Option<Ipv4Addr>,
    /// RTP service; false forwards raw datagrams (MUDP).
    rtp: bool,
    rx: Option<McastRx>,
    fcc: Option<FccSession>,
    fec_group: Option<SocketAddrV4>,
    fec_rx: Option<McastRx>,
    fec: Option<FecContext>,
    ring: ReorderRing,
    last_rejoin: Instant,
    malformed: u64,
    dropped: u64,
}

struct RtspStream {
    session: RtspSession,
    ring: ReorderRing,
    malformed: u64,
}

enum Upstream {
    Multicast(McastStream),
    Rtsp(Box<RtspStream>),
}

pub struct StreamContext {
    pool: BufferPool,
    settings: StreamSettings,
    upstream: Upstream,
}

impl StreamContext {
    pub fn new(
        service: &Service,
        settings: StreamSettings,
        pool: BufferPool,
    ) -> Result<StreamContext, StreamError> {
        let upstream = match service {
            Service::Mrtp { group, source, fcc, fec } => {
                let has_fec = fec.is_some();
                let mut stream = McastStream {
                    group: *group,
                    source: *source,
                    rtp: true,
                    rx: None,
                    fcc: None,
                    fec_group: *fec,
                    fec_rx: None,
                    fec: has_fec.then(FecContext::new),
                    ring: ReorderRing::new(has_fec),
                    last_rejoin: Instant::now(),
                    malformed: 0,
                    dropped: 0,
                };
                match fcc {
                    Some(server) => {
                        stream.fcc = Some(FccSession::new(settings.dialect, *group, *server)?);
                    }
                    None => stream.join_group(&settings)?,
                }
                Upstream::Multicast(stream)
            }
            Service::Mudp { group, source } => {
                let mut stream = McastStream {
                    group: *group,
                    source: *source,
                    rtp: false,
                    rx: None,
                    fcc: None,
                    fec_group: None,
                    fec_rx: None,
                    fec: None,
                    ring: ReorderRing::new(false),
                    last_rejoin: Instant::now(),
                    malformed: 0,
                    dropped: 0,
                };
                stream.join_group(&settings)?;
                Upstream::Multicast(stream)
            }
            Service::Rtsp { url, playseek } => Upstream::Rtsp(Box::new(RtspStream {
                session: RtspSession::new(
                    url.clone(),
                    playseek.as_deref(),
                    settings.stun_server,
                ),
                ring: ReorderRing::new(false),
                malformed: 0,
            })),
        };
        Ok(StreamContext { pool, settings, upstream })
    }

    /// Kick the upstream into motion: FCC request burst or the RTSP
    /// DESCRIBE/SETUP/PLAY sequence.
    pub async fn start(&mut self) -> Result<(), StreamError> {
        match &mut self.upstream {
            Upstream::Multicast(m) => {
                if let Some(fcc) = &mut m.fcc {
                    fcc.start(Instant::now())?;
                }
                Ok(())
            }
            Upstream::Rtsp(r) => {
                r.session.start().await?;
                Ok(())
            }
        }
    }

    /// Human-readable state for the status slot.
    pub fn state_str(&self) -> &'static str {
        match &self.upstream {
            Upstream::Multicast(m) => match &m.fcc {
                Some(fcc) => fcc.state().as_str(),
                None => "streaming",
            },
            Upstream::Rtsp(r) => r.session.state().as_str(),
        }
    }

    /// Wait for upstream activity and return the payload views it produced,
    /// in delivery order.
    pub async fn pump(&mut self) -> Result<Vec<BufRef>, StreamError> {
        if matches!(self.upstream, Upstream::Multicast(_)) {
            self.pump_mcast().await
        } else {
            self.pump_rtsp().await
        }
    }

    async fn pump_rtsp(&mut self) -> Result<Vec<BufRef>, StreamError> {
        let r = match &mut self.upstream {
            Upstream::Rtsp(r) => r,
            _ => unreachable!(),
        };
        let (protocol, frame) = match r.session.recv_media().await {
            Ok(media) => media,
            // Missed-keepalive limit: the RTSP analogue of a multicast
            // upstream going silent.
            Err(RtspError::Timeout) => return Err(StreamError::UpstreamTimeout),
            Err(e) => return Err(e.into()),
        };
        let mode = r.session.transport().map(|t| t.mode);
        let mut out = Vec::new();
        let buf = match buf_from_slice(&self.pool, &frame) {
            Some(b) => b,
            None => {
                trace!("rtsp: pool exhausted, media packet dropped");
                return Ok(out);
            }
        };
        match protocol {
            TransportProtocol::Mp2t => out.push(buf),
            TransportProtocol::Rtp => match rtp::parse(buf.as_slice()) {
                Ok(pkt) => {
                    if mode == Some(crate::rtsp::transport::TransportMode::Udp) {
                        // UDP can reorder; run the jitter ring.
                        r.ring.insert(
                            pkt.sequence,
                            buf.clone(),
                            pkt.payload_offset,
                            pkt.payload_len,
                            &mut |b| out.push(b),
                        );
                    } else {
                        // Interleaved TCP is already in order.
                        out.push(buf.slice(pkt.payload_offset, pkt.payload_len));
                    }
                }
                Err(e) => {
                    r.malformed += 1;
                    trace!("rtsp: bad RTP packet: {}", e);
                }
            },
        }
        Ok(out)
    }

    async fn pump_mcast(&mut self) -> Result<Vec<BufRef>, StreamError> {
        enum Wake {
            Mcast(crate::mcast::RecvBatch),
            Fcc(Vec<(BufRef, Option<SocketAddrV4>)>),
            Fec(crate::mcast::RecvBatch),
        }

        let m = match &mut self.upstream {
            Upstream::Multicast(m) => m,
            _ => unreachable!(),
        };
        let pool = &self.pool;
        let has_rx = m.rx.is_some();
        let has_fcc = m.fcc.is_some();
        let has_fec = m.fec_rx.is_some();
        let McastStream { rx, fcc, fec_rx, .. } = &mut *m;
        let wake = tokio::select! {
            r = async { rx.as_mut().expect("guarded").recv(pool).await }, if has_rx => Wake::Mcast(r?),
            r = async { fcc.as_mut().expect("guarded").recv_datagrams(pool).await }, if has_fcc => Wake::Fcc(r?),
            r = async { fec_rx.as_mut().expect("guarded").recv(pool).await }, if has_fec => Wake::Fec(r?),
        };

        let now = Instant::now();
        let mut out = Vec::new();
        match wake {
            Wake::Mcast(batch) => {
                let m = self.mcast_mut();
                m.dropped += batch.dropped as u64;
                for (pbuf, _) in batch.packets {
                    let buf = pbuf.freeze();
                    self.ingest_mcast(buf, now, &mut out);
                }
            }
            Wake::Fcc(datagrams) => {
                for (buf, peer) in datagrams {
                    let (media, action) = self
                        .mcast_mut()
                        .fcc
                        .as_mut()
                        .expect("fcc present")
                        .handle_datagram(buf, peer, now);
                    if let Some(frame) = media {
                        self.ingest_rtp(frame, &mut out);
                    }
                    self.apply_fcc_action(action, &mut out)?;
                }
            }
            Wake::Fec(batch) => {
                for (pbuf, _) in batch.packets {
                    let buf = pbuf.freeze();
                    self.ingest_fec(buf, &mut out);
                }
            }
        }
        Ok(out)
    }

    fn mcast_mut(&mut self) -> &mut McastStream {
        match &mut self.upstream {
            Upstream::Multicast(m) => m,
            _ => unreachable!(),
        }
    }

    fn ingest_mcast(&mut self, buf: BufRef, now: Instant, out: &mut Vec<BufRef>) {
        if !self.mcast_mut().rtp {
            // MUDP: the datagram is the payload.
            out.push(buf);
            return;
        }
        let pkt = match rtp::parse(buf.as_slice()) {
            Ok(p) => p,
            Err(e) => {
                self.mcast_mut().malformed += 1;
                trace!("mcast: bad RTP packet: {}", e);
                return;
            }
        };
        let disposition = match self.mcast_mut().fcc.as_mut() {
            Some(fcc) => fcc.on_mcast_rtp(pkt.sequence, &buf, now),
            None => McastDisposition::Forward,
        };
        match disposition {
            McastDisposition::Forward => self.insert_ring(pkt, buf, out),
            McastDisposition::Buffered => {}
            McastDisposition::BufferedHandoff => self.do_handoff(out),
        }
    }

    /// Unicast burst packet from the FCC media path.
    fn ingest_rtp(&mut self, buf: BufRef, out: &mut Vec<BufRef>) {
        let pkt = match rtp::parse(buf.as_slice()) {
            Ok(p) => p,
            Err(e) => {
                self.mcast_mut().malformed += 1;
                trace!("fcc: bad RTP packet: {}", e);
                return;
            }
        };
        self.insert_ring(pkt, buf, out);
    }

    fn ingest_fec(&mut self, buf: BufRef, out: &mut Vec<BufRef>) {
        let pkt = match rtp::parse(buf.as_slice()) {
            Ok(p) => p,
            Err(e) => {
                self.mcast_mut().malformed += 1;
                trace!("fec: bad RTP packet: {}", e);
                return;
            }
        };
        if !FEC_PAYLOAD_TYPES.contains(&pkt.payload_type) {
            trace!("fec: unexpected payload type {}", pkt.payload_type);
            return;
        }
        let payload = buf.slice(pkt.payload_offset, pkt.payload_len);
        if let Some(fec) = self.mcast_mut().fec.as_mut() {
            fec.on_fec_payload(payload);
        }
        // Parity may complete a group that is already blocking the ring.
        self.try_fec_recover(out);
    }

    fn insert_ring(&mut self, pkt: rtp::RtpPacket, buf: BufRef, out: &mut Vec<BufRef>) {
        let m = self.mcast_mut();
        let res = m.ring.insert(
            pkt.sequence,
            buf,
            pkt.payload_offset,
            pkt.payload_len,
            &mut |b| out.push(b),
        );
        if res.hole {
            self.try_fec_recover(out);
        }
        let m = self.mcast_mut();
        if let Some(fec) = m.fec.as_mut() {
            fec.expire(&mut m.ring);
        }
    }

    fn try_fec_recover(&mut self, out: &mut Vec<BufRef>) {
        let m = match &mut self.upstream {
            Upstream::Multicast(m) => m,
            _ => return,
        };
        let recovered = match m.fec.as_mut() {
            Some(fec) => fec.try_recover(&m.ring),
            None => return,
        };
        for (_seq, frame) in recovered {
            let buf = match buf_from_slice(&self.pool, &frame) {
                Some(b) => b,
                None => continue,
            };
            if let Ok(pkt) = rtp::parse(buf.as_slice()) {
                m.ring.insert(
                    pkt.sequence,
                    buf,
                    pkt.payload_offset,
                    pkt.payload_len,
                    &mut |b| out.push(b),
                );
            }
        }
    }

    fn apply_fcc_action(
        &mut self,
        action: FccAction,
        out: &mut Vec<BufRef>,
    ) -> Result<(), StreamError> {
        match action {
            FccAction::None => Ok(()),
            FccAction::JoinMulticast | FccAction::Fallback => {
                let settings = self.settings.clone();
                self.mcast_mut().join_group(&settings)?;
                Ok(())
            }
            FccAction::Handoff => {
                self.do_handoff(out);
                Ok(())
            }
        }
    }

    /// Burst caught up: restart the ring at the first multicast sequence and
    /// replay the buffered multicast packets through it.
    fn do_handoff(&mut self, out: &mut Vec<BufRef>) {
        let m = self.mcast_mut();
        if let Some(first) = m.fcc.as_ref().and_then(|f| f.first_mcast_seq()) {
            debug!("fcc {}: hand-off at seq {}", m.group, first);
            m.ring.reset_to(first);
        }
        let pending = m.fcc.as_mut().map(|f| f.take_pending()).unwrap_or_default();
        for (_seq, buf) in pending {
            self.ingest_rtp(buf, out);
        }
        if let Some(rx) = self.mcast_mut().rx.as_mut() {
            rx.touch();
        }
    }

    /// One-second housekeeping: upstream timeout, periodic rejoin, FCC
    /// timers. May produce payloads only indirectly (never today).
    pub fn tick(&mut self, now: Instant) -> Result<(), StreamError> {
        let settings = self.settings.clone();
        let action = match &mut self.upstream {
            Upstream::Multicast(m) => {
                if let Some(rx) = &m.rx {
                    if rx.timed_out(now, settings.mcast_timeout) {
                        warn!("mcast {}: upstream timeout", m.group);
                        return Err(StreamError::UpstreamTimeout);
                    }
                }
                if let Some(interval) = settings.rejoin_interval {
                    if m.rx.is_some() && now.duration_since(m.last_rejoin) >= interval {
                        m.last_rejoin = now;
                        if let Some(rx) = &m.rx {
                            rx.rejoin();
                        }
                        if let Some(fec_rx) = &m.fec_rx {
                            fec_rx.rejoin();
                        }
                    }
                }
                match m.fcc.as_mut() {
                    Some(fcc) => fcc.tick(now),
                    None => FccAction::None,
                }
            }
            // RTSP liveness is enforced inside the session: unanswered
            // keepalives surface as UpstreamTimeout through pump.
            Upstream::Rtsp(_) => return Ok(()),
        };
        // Tick actions never carry payloads; the scratch list stays empty.
        let mut out = Vec::new();
        self.apply_fcc_action(action, &mut out)?;
        debug_assert!(out.is_empty());
        Ok(())
    }

    /// Release upstream resources. FCC sends its termination; RTSP tears the
    /// session down, bounded by the teardown grace period.
    pub async fn shutdown(&mut self) {
        match &mut self.upstream {
            Upstream::Multicast(m) => {
                if let Some(fcc) = &mut m.fcc {
                    fcc.cleanup();
                }
                debug!(
                    "mcast {}: closing ({} malformed, {} dropped)",
                    m.group, m.malformed, m.dropped
                );
            }
            Upstream::Rtsp(r) => {
                if let Err(e) = r.session.teardown().await {
                    debug!("rtsp: teardown failed: {}", e);
                }
                debug!("rtsp {}: closing ({} malformed)", r.session.url(), r.malformed);
            }
        }
    }

    pub fn describe_target(&self) -> String {
        match &self.upstream {
            Upstream::Multicast(m) if m.rtp => format!("rtp://{}", m.group),
            Upstream::Multicast(m) => format!("udp://{}", m.group),
            Upstream::Rtsp(r) => r.session.url().to_string(),
        }
    }
}

impl McastStream {
    fn join_group(&mut self, settings: &StreamSettings) -> io::Result<()> {
        if self.rx.is_none() {
            self.rx = Some(McastRx::join(
                self.group,
                self.source,
                settings.iface,
                settings.rcvbuf,
            )?);
            self.last_rejoin = Instant::now();
        }
        if self.fec_rx.is_none() {
            if let Some(fec_group) = self.fec_group {
                match McastRx::join(fec_group, self.source, settings.iface, settings.rcvbuf) {
                    Ok(rx) => self.fec_rx = Some(rx),
                    Err(e) => {
                        warn!("fec: cannot join {}: {}", fec_group, e);
                        self.fec = None;
                        self.ring.set_retain(false);
                        self.fec_group = None;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Build a service for the UDPxy-style address routes.
pub fn udpxy_service(path: &str) -> Option<Service> {
    let (kind, rest) = if let Some(rest) = path.strip_prefix("/rtp/") {
        ("rtp", rest)
    } else if let Some(rest) = path.strip_prefix("/udp/") {
        ("udp", rest)
    } else {
        return None;
    };
    let rest = rest.split(&['?', '#'][..]).next().unwrap_or(rest);
    // rtp routes accept group@source ordering variants: `ip:port@src`.
    let (addr_part, source) = match rest.split_once('@') {
        Some((a, s)) => (a, Some(s.parse::<Ipv4Addr>().ok()?)),
        None => (rest, None),
    };
    let group: SocketAddrV4 = addr_part.parse().ok()?;
    if !group.ip().is_multicast() {
        return None;
    }
    Some(match kind {
        "rtp" => Service::Mrtp { group, source, fcc: None, fec: None },
        _ => Service::Mudp { group, source },
    })
}

/// Build an RTSP service from a `/rtsp/host:port/path?query` route.
pub fn rtsp_service(path_and_query: &str) -> Option<Service> {
    let rest = path_and_query.strip_prefix("/rtsp/")?;
    let url = Url::parse(&format!("rtsp://{}", rest)).ok()?;
    let playseek = url
        .query_pairs()
        .find(|(k, _)| k == "playseek")
        .map(|(_, v)| v.to_string());
    Some(Service::Rtsp { url, playseek })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolConfig;
    use crate::config::Config;

    fn pool() -> BufferPool {
        BufferPool::new(PoolConfig::default())
    }

    fn settings() -> StreamSettings {
        StreamSettings::from_config(&Config::default()).unwrap()
    }

    fn rtp_frame(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x80, 33, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2];
        pkt[2..4].copy_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    fn mudp_context(pool: &BufferPool) -> StreamContext {
        // No join: exercise the ingest path directly.
        StreamContext {
            pool: pool.clone(),
            settings: settings(),
            upstream: Upstream::Multicast(McastStream {
                group: "239.9.9.9:1234".parse().unwrap(),
                source: None,
                rtp: false,
                rx: None,
                fcc: None,
                fec_group: None,
                fec_rx: None,
                fec: None,
                ring: ReorderRing::new(false),
                last_rejoin: Instant::now(),
                malformed: 0,
                dropped: 0,
            }),
        }
    }

    fn mrtp_context(pool: &BufferPool, fec: bool) -> StreamContext {
        StreamContext {
            pool: pool.clone(),
            settings: settings(),
            upstream: Upstream::Multicast(McastStream {
                group: "239.9.9.9:1234".parse().unwrap(),
                source: None,
                rtp: true,
                rx: None,
                fcc: None,
                fec_group: None,
                fec_rx: None,
                fec: fec.then(FecContext::new),
                ring: ReorderRing::new(fec),
                last_rejoin: Instant::now(),
                malformed: 0,
                dropped: 0,
            }),
        }
    }

    #[test]
    fn test_mudp_forwards_datagrams_verbatim() {
        let pool = pool();
        let mut ctx = mudp_context(&pool);
        let mut out = Vec::new();
        let datagram = b"not even rtp";
        let buf = buf_from_slice(&pool, datagram).unwrap();
        ctx.ingest_mcast(buf, Instant::now(), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_slice(), datagram);
    }

    #[test]
    fn test_mrtp_strips_headers_and_reorders() {
        let pool = pool();
        let mut ctx = mrtp_context(&pool, false);
        let mut out = Vec::new();
        let now = Instant::now();
        for seq in [100u16, 103, 101, 102, 104] {
            let frame = rtp_frame(seq, &seq.to_be_bytes());
            let buf = buf_from_slice(&pool, &frame).unwrap();
            ctx.ingest_mcast(buf, now, &mut out);
        }
        let seqs: Vec<u16> = out
            .iter()
            .map(|b| u16::from_be_bytes([b.as_slice()[0], b.as_slice()[1]]))
            .collect();
        assert_eq!(seqs, vec![100, 101, 102, 103, 104]);
    }

    #[test]
    fn test_malformed_packets_counted_not_fatal() {
        let pool = pool();
        let mut ctx = mrtp_context(&pool, false);
        let mut out = Vec::new();
        let buf = buf_from_slice(&pool, &[0x00; 6]).unwrap();
        ctx.ingest_mcast(buf, Instant::now(), &mut out);
        assert!(out.is_empty());
        assert_eq!(ctx.mcast_mut().malformed, 1);
    }

    #[test]
    fn test_fec_recovers_missing_packet_inline() {
        use crate::fec::{gf256, matrix, FecHeader, FEC_HEADER_LEN};
        let pool = pool();
        let mut ctx = mrtp_context(&pool, true);
        let mut out = Vec::new();
        let now = Instant::now();

        // Activate the ring.
        for seq in 96..100u16 {
            let frame = rtp_frame(seq, &[0]);
            let buf = buf_from_slice(&pool, &frame).unwrap();
            ctx.ingest_mcast(buf, now, &mut out);
        }
        out.clear();

        // Group 100..=103, lose 101.
        let rtp_len = 20usize;
        let frames: Vec<Vec<u8>> = [0xAAu8, 0xBB, 0xCC, 0xDD]
            .iter()
            .enumerate()
            .map(|(i, &m)| rtp_frame(100 + i as u16, &[m]))
            .collect();
        let gen = matrix::parity_generator(4, 2);
        let mut parity_block = vec![0u8; rtp_len];
        for (j, frame) in frames.iter().enumerate() {
            let mut padded = vec![0u8; rtp_len];
            padded[..frame.len()].copy_from_slice(frame);
            gf256::mul_add_slice(&mut parity_block, &padded, gen.get(1, j));
        }
        let hdr = FecHeader {
            begin_seq: 100,
            end_seq: 103,
            m: 2,
            redund_idx: 1,
            fec_len: rtp_len,
            rtp_len,
        };
        let mut fec_payload = vec![0u8; FEC_HEADER_LEN];
        hdr.write(&mut fec_payload);
        fec_payload.extend_from_slice(&parity_block);
        let mut fec_frame = vec![0x80, 127, 0, 0, 0, 0, 0, 1, 0, 0, 0, 3];
        fec_frame[2..4].copy_from_slice(&7u16.to_be_bytes());
        fec_frame.extend_from_slice(&fec_payload);

        for i in [0usize, 2, 3] {
            let buf = buf_from_slice(&pool, &frames[i]).unwrap();
            ctx.ingest_mcast(buf, now, &mut out);
        }
        // 100 delivered, 102/103 stuck behind the hole at 101.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_slice()[0], 0xAA);

        let buf = buf_from_slice(&pool, &fec_frame).unwrap();
        ctx.ingest_fec(buf, &mut out);
        let markers: Vec<u8> = out.iter().map(|b| b.as_slice()[0]).collect();
        assert_eq!(markers, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_udpxy_routes() {
        match udpxy_service("/udp/239.1.2.3:5000").unwrap() {
            Service::Mudp { group, source } => {
                assert_eq!(group, "239.1.2.3:5000".parse().unwrap());
                assert_eq!(source, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
        match udpxy_service("/rtp/239.1.2.3:5000@10.0.0.8").unwrap() {
            Service::Mrtp { group, source, .. } => {
                assert_eq!(group.port(), 5000);
                assert_eq!(source, Some("10.0.0.8".parse().unwrap()));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(udpxy_service("/udp/10.0.0.1:5000").is_none());
        assert!(udpxy_service("/other/x").is_none());
    }

    #[test]
    fn test_rtsp_route_with_playseek() {
        match rtsp_service("/rtsp/10.1.1.5:554/live/ch1?playseek=20260801120000").unwrap() {
            Service::Rtsp { url, playseek } => {
                assert_eq!(url.host_str(), Some("10.1.1.5"));
                assert_eq!(url.port(), Some(554));
                assert_eq!(playseek.as_deref(), Some("20260801120000"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(rtsp_service("/rtsp/").is_none());
    }
}
