//! Reed-Solomon FEC recovery
//!
//! A parallel multicast stream carries parity packets (RTP payload type
//! 127/97). Each parity payload names the source span it protects and its
//! redundancy index within the group. Once enough packets of a group are on
//! hand (source packets retained in the reorder ring plus received parity)
//! the missing sources are reconstructed and fed back through the ring.

pub mod gf256;
pub mod matrix;

use crate::buffer::BufRef;
use crate::reorder::ReorderRing;
use crate::rtp::seq_delta;
use crate::wire::{read_u16_be, write_u16_be};
use log::{debug, trace, warn};

/// Parity payload header length.
pub const FEC_HEADER_LEN: usize = 12;
/// Concurrently tracked groups.
pub const FEC_MAX_GROUPS: usize = 8;
/// RTP payload types that mark the parity stream.
pub const FEC_PAYLOAD_TYPES: [u8; 2] = [127, 97];

#[derive(Debug, Clone, Copy, Default)]
pub struct FecStats {
    pub parity_packets: u64,
    pub recovered_packets: u64,
    pub groups_evicted: u64,
    pub decode_failures: u64,
    pub malformed: u64,
}

/// Parsed parity payload header.
///
/// ```text
///  0              2              4      5      6         8         10
/// +--------------+--------------+------+------+---------+---------+----+
/// |  begin_seq   |   end_seq    |  m   | idx  | fec_len | rtp_len |rsvd|
/// +--------------+--------------+------+------+---------+---------+----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecHeader {
    pub begin_seq: u16,
    pub end_seq: u16,
    pub m: usize,
    pub redund_idx: usize,
    pub fec_len: usize,
    pub rtp_len: usize,
}

impl FecHeader {
    pub fn parse(payload: &[u8]) -> Option<FecHeader> {
        if payload.len() < FEC_HEADER_LEN {
            return None;
        }
        let hdr = FecHeader {
            begin_seq: read_u16_be(payload, 0)?,
            end_seq: read_u16_be(payload, 2)?,
            m: payload[4] as usize,
            redund_idx: payload[5] as usize,
            fec_len: read_u16_be(payload, 6)? as usize,
            rtp_len: read_u16_be(payload, 8)? as usize,
        };
        if hdr.m == 0 || hdr.redund_idx >= hdr.m || hdr.rtp_len == 0 {
            return None;
        }
        if payload.len() < FEC_HEADER_LEN + hdr.fec_len {
            return None;
        }
        Some(hdr)
    }

    pub fn write(&self, out: &mut [u8]) -> bool {
        if out.len() < FEC_HEADER_LEN {
            return false;
        }
        write_u16_be(out, 0, self.begin_seq);
        write_u16_be(out, 2, self.end_seq);
        out[4] = self.m as u8;
        out[5] = self.redund_idx as u8;
        write_u16_be(out, 6, self.fec_len as u16);
        write_u16_be(out, 8, self.rtp_len as u16);
        write_u16_be(out, 10, 0);
        true
    }

    pub fn k(&self) -> usize {
        self.end_seq.wrapping_sub(self.begin_seq) as usize + 1
    }
}

struct FecGroup {
    begin: u16,
    end: u16,
    k: usize,
    m: usize,
    rtp_len: usize,
    /// Parity payload views, indexed by redundancy index.
    parity: Vec<Option<BufRef>>,
    parity_count: usize,
}

impl FecGroup {
    fn covers(&self, seq: u16) -> bool {
        seq_delta(seq, self.begin) >= 0 && seq_delta(self.end, seq) >= 0
    }
}

pub struct FecContext {
    groups: Vec<FecGroup>,
    newest_begin: u16,
    stats: FecStats,
}

impl Default for FecContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FecContext {
    pub fn new() -> Self {
        FecContext {
            groups: Vec::with_capacity(FEC_MAX_GROUPS),
            newest_begin: 0,
            stats: FecStats::default(),
        }
    }

    pub fn stats(&self) -> FecStats {
        self.stats
    }

    /// Register a parity packet. `payload` is the RTP payload of the FEC
    /// stream packet (header + parity bytes).
    pub fn on_fec_payload(&mut self, payload: BufRef) {
        let hdr = match FecHeader::parse(payload.as_slice()) {
            Some(h) => h,
            None => {
                self.stats.malformed += 1;
                trace!("fec: malformed parity payload ({} bytes)", payload.len());
                return;
            }
        };
        self.stats.parity_packets += 1;
        let k = hdr.k();
        if k == 0 || k > 256 {
            self.stats.malformed += 1;
            return;
        }
        let parity_view = payload.slice(FEC_HEADER_LEN, hdr.fec_len);

        if let Some(group) = self
            .groups
            .iter_mut()
            .find(|g| g.begin == hdr.begin_seq && g.end == hdr.end_seq)
        {
            if group.parity[hdr.redund_idx].is_none() {
                group.parity[hdr.redund_idx] = Some(parity_view);
                group.parity_count += 1;
            }
            return;
        }

        if self.groups.len() == FEC_MAX_GROUPS {
            // Evict the group lagging furthest behind the newest span.
            let newest = self.newest_begin;
            if let Some((idx, _)) = self
                .groups
                .iter()
                .enumerate()
                .max_by_key(|(_, g)| seq_delta(newest, g.begin))
            {
                self.groups.swap_remove(idx);
                self.stats.groups_evicted += 1;
            }
        }

        let mut parity = Vec::with_capacity(hdr.m);
        parity.resize_with(hdr.m, || None);
        parity[hdr.redund_idx] = Some(parity_view);
        self.newest_begin = hdr.begin_seq;
        self.groups.push(FecGroup {
            begin: hdr.begin_seq,
            end: hdr.end_seq,
            k,
            m: hdr.m,
            rtp_len: hdr.rtp_len,
            parity,
            parity_count: 1,
        });
    }

    /// Attempt recovery for the group covering the ring's base sequence.
    /// Returns reconstructed full RTP frames, lowest sequence first.
    pub fn try_recover(&mut self, ring: &ReorderRing) -> Vec<(u16, Vec<u8>)> {
        let base = ring.base_seq();
        let group = match self.groups.iter().find(|g| g.covers(base)) {
            Some(g) => g,
            None => return Vec::new(),
        };

        let k = group.k;
        let mut have_data: Vec<(usize, u16)> = Vec::with_capacity(k);
        let mut missing: Vec<(usize, u16)> = Vec::new();
        for j in 0..k {
            let seq = group.begin.wrapping_add(j as u16);
            if ring.get(seq).is_some() {
                have_data.push((j, seq));
            } else {
                missing.push((j, seq));
            }
        }
        if missing.is_empty() {
            return Vec::new();
        }
        if have_data.len() + group.parity_count < k {
            return Vec::new();
        }

        let gen = matrix::parity_generator(k, group.m);

        // Assemble exactly k source rows: all received data, then parity.
        enum Row {
            Data(usize),
            Parity(usize),
        }
        let mut rows: Vec<(Row, Vec<u8>)> = Vec::with_capacity(k);
        for &(j, seq) in &have_data {
            if let Some((buf, _, _)) = ring.get(seq) {
                let mut block = vec![0u8; group.rtp_len];
                let frame = buf.as_slice();
                let n = frame.len().min(group.rtp_len);
                block[..n].copy_from_slice(&frame[..n]);
                rows.push((Row::Data(j), block));
            }
        }
        for (r, slot) in group.parity.iter().enumerate() {
            if rows.len() == k {
                break;
            }
            if let Some(p) = slot {
                let mut block = vec![0u8; group.rtp_len];
                let n = p.len().min(group.rtp_len);
                block[..n].copy_from_slice(&p.as_slice()[..n]);
                rows.push((Row::Parity(r), block));
            }
        }
        if rows.len() < k {
            return Vec::new();
        }

        // d = A^-1 * s, where row i of A maps the original data vector to
        // source i.
        let mut a = matrix::Matrix::zero(k, k);
        for (i, (row, _)) in rows.iter().enumerate() {
            match row {
                Row::Data(j) => a.set(i, *j, 1),
                Row::Parity(r) => {
                    for c in 0..k {
                        a.set(i, c, gen.get(*r, c));
                    }
                }
            }
        }
        let a_inv = match a.invert() {
            Some(inv) => inv,
            None => {
                self.stats.decode_failures += 1;
                warn!(
                    "fec: singular decode system for group [{}, {}]",
                    group.begin, group.end
                );
                return Vec::new();
            }
        };

        let mut recovered = Vec::with_capacity(missing.len());
        for &(j, seq) in &missing {
            let mut acc = vec![0u8; group.rtp_len];
            for (i, (_, block)) in rows.iter().enumerate() {
                gf256::mul_add_slice(&mut acc, block, a_inv.get(j, i));
            }
            recovered.push((seq, acc));
        }
        self.stats.recovered_packets += recovered.len() as u64;
        debug!(
            "fec: recovered {} packet(s) in group [{}, {}]",
            recovered.len(),
            group.begin,
            group.end
        );
        recovered
    }

    /// Drop groups the ring has moved past and release their retained
    /// source packets.
    pub fn expire(&mut self, ring: &mut ReorderRing) {
        let base = ring.base_seq();
        let mut i = 0;
        while i < self.groups.len() {
            if seq_delta(base, self.groups[i].end) > 0 {
                let g = self.groups.swap_remove(i);
                ring.release_range(g.begin, g.end);
            } else {
                i += 1;
            }
        }
    }

    pub fn active_groups(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{buf_from_slice, BufferPool, PoolConfig};
    use crate::rtp;

    fn pool() -> BufferPool {
        BufferPool::new(PoolConfig::default())
    }

    /// Build a source RTP frame with a one-byte payload marker.
    fn source_frame(seq: u16, marker: u8) -> Vec<u8> {
        let mut pkt = vec![0x80, 33, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2];
        pkt[2..4].copy_from_slice(&seq.to_be_bytes());
        pkt.push(marker);
        pkt
    }

    fn padded(frame: &[u8], rtp_len: usize) -> Vec<u8> {
        let mut block = vec![0u8; rtp_len];
        let n = frame.len().min(rtp_len);
        block[..n].copy_from_slice(&frame[..n]);
        block
    }

    /// Encode parity payloads the way the upstream FEC server does.
    fn encode_parity(
        begin: u16,
        frames: &[Vec<u8>],
        m: usize,
        rtp_len: usize,
    ) -> Vec<Vec<u8>> {
        let k = frames.len();
        let gen = matrix::parity_generator(k, m);
        let mut out = Vec::with_capacity(m);
        for r in 0..m {
            let mut block = vec![0u8; rtp_len];
            for (j, frame) in frames.iter().enumerate() {
                gf256::mul_add_slice(&mut block, &padded(frame, rtp_len), gen.get(r, j));
            }
            let hdr = FecHeader {
                begin_seq: begin,
                end_seq: begin.wrapping_add(k as u16 - 1),
                m,
                redund_idx: r,
                fec_len: rtp_len,
                rtp_len,
            };
            let mut payload = vec![0u8; FEC_HEADER_LEN];
            assert!(hdr.write(&mut payload));
            payload.extend_from_slice(&block);
            out.push(payload);
        }
        out
    }

    /// Ring in retain mode, activated with four packets just before
    /// `group_begin`, then fed `frames`.
    fn ring_with(pool: &BufferPool, group_begin: u16, frames: &[(u16, &[u8])]) -> ReorderRing {
        let mut ring = ReorderRing::new(true);
        let mut sink = |_b: crate::buffer::BufRef| {};
        for i in 0..4u16 {
            let seq = group_begin.wrapping_sub(4).wrapping_add(i);
            let frame = source_frame(seq, 0);
            let parsed = rtp::parse(&frame).unwrap();
            let buf = buf_from_slice(pool, &frame).unwrap();
            ring.insert(seq, buf, parsed.payload_offset, parsed.payload_len, &mut sink);
        }
        assert_eq!(ring.base_seq(), group_begin);
        for &(seq, frame) in frames {
            let buf = buf_from_slice(pool, frame).unwrap();
            let parsed = rtp::parse(frame).unwrap();
            ring.insert(seq, buf, parsed.payload_offset, parsed.payload_len, &mut sink);
        }
        ring
    }

    #[test]
    fn test_header_roundtrip_and_bounds() {
        let hdr = FecHeader {
            begin_seq: 1000,
            end_seq: 1099,
            m: 5,
            redund_idx: 3,
            fec_len: 1316,
            rtp_len: 1328,
        };
        let mut buf = vec![0u8; FEC_HEADER_LEN];
        assert!(hdr.write(&mut buf));
        buf.extend_from_slice(&vec![0u8; 1316]);
        assert_eq!(FecHeader::parse(&buf), Some(hdr));
        assert_eq!(hdr.k(), 100);
        // Truncated parity region rejected.
        assert!(FecHeader::parse(&buf[..100]).is_none());
        // redund_idx out of range rejected.
        buf[5] = 5;
        assert!(FecHeader::parse(&buf).is_none());
    }

    #[test]
    fn test_single_loss_recovery() {
        // k=4, m=2; data payload markers AA BB CC DD; data[1] lost,
        // parity[1] received.
        let pool = pool();
        let rtp_len = 20;
        let frames: Vec<Vec<u8>> = [0xAAu8, 0xBB, 0xCC, 0xDD]
            .iter()
            .enumerate()
            .map(|(i, &m)| source_frame(100 + i as u16, m))
            .collect();
        let parity = encode_parity(100, &frames, 2, rtp_len);

        let ring = ring_with(
            &pool,
            100,
            &[(100, &frames[0][..]), (102, &frames[2][..]), (103, &frames[3][..])],
        );
        // base delivered 100, stuck at 101
        assert_eq!(ring.base_seq(), 101);

        let mut fec = FecContext::new();
        fec.on_fec_payload(buf_from_slice(&pool, &parity[1]).unwrap());
        let recovered = fec.try_recover(&ring);
        assert_eq!(recovered.len(), 1);
        let (seq, frame) = &recovered[0];
        assert_eq!(*seq, 101);
        let parsed = rtp::parse(frame).unwrap();
        assert_eq!(parsed.sequence, 101);
        assert_eq!(frame[parsed.payload_offset], 0xBB);
        assert_eq!(fec.stats().recovered_packets, 1);
    }

    #[test]
    fn test_recovery_needs_k_sources() {
        let pool = pool();
        let frames: Vec<Vec<u8>> = (0..4u16).map(|i| source_frame(200 + i, i as u8)).collect();
        let parity = encode_parity(200, &frames, 2, 20);
        // Only two data packets and one parity: 3 < k=4.
        let ring = ring_with(&pool, 200, &[(200, &frames[0][..]), (203, &frames[3][..])]);
        let mut fec = FecContext::new();
        fec.on_fec_payload(buf_from_slice(&pool, &parity[0]).unwrap());
        assert!(fec.try_recover(&ring).is_empty());
    }

    #[test]
    fn test_multi_loss_recovery_random_spans() {
        // Any k of k+m suffices: exercise several (k, m) shapes.
        let pool = pool();
        for &(k, m, lose) in &[(4usize, 2usize, 2usize), (8, 3, 3), (10, 1, 1)] {
            let base = 5000u16;
            let frames: Vec<Vec<u8>> = (0..k)
                .map(|i| source_frame(base + i as u16, (i * 7 + k) as u8))
                .collect();
            let rtp_len = 24;
            let parity = encode_parity(base, &frames, m, rtp_len);

            // Drop the first `lose` data packets.
            let kept: Vec<(u16, &[u8])> = (lose..k)
                .map(|i| (base + i as u16, &frames[i][..]))
                .collect();
            let ring = ring_with(&pool, base, &kept);
            let mut fec = FecContext::new();
            for p in &parity {
                fec.on_fec_payload(buf_from_slice(&pool, p).unwrap());
            }
            let mut recovered = fec.try_recover(&ring);
            recovered.sort_by_key(|(s, _)| *s);
            assert_eq!(recovered.len(), lose, "k={} m={}", k, m);
            for (i, (seq, frame)) in recovered.iter().enumerate() {
                assert_eq!(*seq, base + i as u16);
                assert_eq!(&frame[..frames[i].len()], &frames[i][..]);
            }
        }
    }

    #[test]
    fn test_random_spans_any_k_of_n() {
        // Seeded sweep over group shapes: any k received out of k+m must
        // reconstruct the originals bit-exactly.
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x7515_FEC5);
        for round in 0..12 {
            let k = rng.gen_range(4..=40);
            let m = rng.gen_range(1..=5usize);
            let lose = rng.gen_range(1..=m.min(k));
            let base = rng.gen::<u16>();
            let rtp_len = 32;
            let frames: Vec<Vec<u8>> = (0..k)
                .map(|i| {
                    let mut f = source_frame(base.wrapping_add(i as u16), 0);
                    for _ in 0..8 {
                        f.push(rng.gen());
                    }
                    f
                })
                .collect();
            let gen = matrix::parity_generator(k, m);
            let blocks: Vec<Vec<u8>> = frames.iter().map(|f| padded(f, rtp_len)).collect();

            // Drop `lose` random data blocks, decode from the rest + parity.
            let mut missing: Vec<usize> = (0..k).collect();
            for i in (1..k).rev() {
                let j = rng.gen_range(0..=i);
                missing.swap(i, j);
            }
            missing.truncate(lose);
            missing.sort_unstable();

            let mut parity_blocks = Vec::with_capacity(m);
            for r in 0..m {
                let mut p = vec![0u8; rtp_len];
                for (j, b) in blocks.iter().enumerate() {
                    gf256::mul_add_slice(&mut p, b, gen.get(r, j));
                }
                parity_blocks.push(p);
            }

            // Solve the system directly, as try_recover does internally.
            let mut a = matrix::Matrix::zero(k, k);
            let mut sources: Vec<&[u8]> = Vec::with_capacity(k);
            let mut row = 0;
            for j in 0..k {
                if missing.contains(&j) {
                    continue;
                }
                a.set(row, j, 1);
                sources.push(&blocks[j]);
                row += 1;
            }
            for r in 0..lose {
                for c in 0..k {
                    a.set(row, c, gen.get(r, c));
                }
                sources.push(&parity_blocks[r]);
                row += 1;
            }
            let a_inv = a.invert().unwrap_or_else(|| panic!("singular at round {}", round));
            for &j in &missing {
                let mut acc = vec![0u8; rtp_len];
                for (i, src) in sources.iter().enumerate() {
                    gf256::mul_add_slice(&mut acc, src, a_inv.get(j, i));
                }
                assert_eq!(acc, blocks[j], "round {} k={} m={} j={}", round, k, m, j);
            }
        }
    }

    #[test]
    fn test_carrier_grouping_recovers_five_losses() {
        // The standard carrier span: 100 data packets, 5 parity.
        let pool = pool();
        let base = 40000u16;
        let rtp_len = 64;
        let frames: Vec<Vec<u8>> = (0..100u16)
            .map(|i| {
                let mut f = source_frame(base + i, (i % 251) as u8);
                f.extend_from_slice(&i.to_be_bytes());
                f
            })
            .collect();
        let parity = encode_parity(base, &frames, 5, rtp_len);

        // Lose the first five packets of the span.
        let kept: Vec<(u16, &[u8])> = (5..100usize)
            .map(|i| (base + i as u16, &frames[i][..]))
            .collect();
        let ring = ring_with(&pool, base, &kept);
        let mut fec = FecContext::new();
        for p in &parity {
            fec.on_fec_payload(buf_from_slice(&pool, p).unwrap());
        }
        let mut recovered = fec.try_recover(&ring);
        recovered.sort_by_key(|(s, _)| *s);
        assert_eq!(recovered.len(), 5);
        for (i, (seq, frame)) in recovered.iter().enumerate() {
            assert_eq!(*seq, base + i as u16);
            assert_eq!(&frame[..frames[i].len()], &frames[i][..]);
        }
    }

    #[test]
    fn test_group_eviction_keeps_newest() {
        let pool = pool();
        let mut fec = FecContext::new();
        for g in 0..(FEC_MAX_GROUPS + 2) as u16 {
            let begin = g * 100;
            let hdr = FecHeader {
                begin_seq: begin,
                end_seq: begin + 9,
                m: 1,
                redund_idx: 0,
                fec_len: 4,
                rtp_len: 16,
            };
            let mut payload = vec![0u8; FEC_HEADER_LEN];
            hdr.write(&mut payload);
            payload.extend_from_slice(&[0u8; 4]);
            fec.on_fec_payload(buf_from_slice(&pool, &payload).unwrap());
        }
        assert_eq!(fec.active_groups(), FEC_MAX_GROUPS);
        assert_eq!(fec.stats().groups_evicted, 2);
    }

    #[test]
    fn test_expiry_releases_ring_range() {
        let pool = pool();
        let frames: Vec<Vec<u8>> = (0..4u16).map(|i| source_frame(300 + i, i as u8)).collect();
        let parity = encode_parity(300, &frames, 1, 20);
        let mut ring = ring_with(
            &pool,
            300,
            &[
                (300, &frames[0][..]),
                (301, &frames[1][..]),
                (302, &frames[2][..]),
                (303, &frames[3][..]),
            ],
        );
        assert_eq!(ring.base_seq(), 304);
        let mut fec = FecContext::new();
        fec.on_fec_payload(buf_from_slice(&pool, &parity[0]).unwrap());
        assert_eq!(fec.active_groups(), 1);
        fec.expire(&mut ring);
        assert_eq!(fec.active_groups(), 0);
        assert!(ring.get(301).is_none());
    }
}
