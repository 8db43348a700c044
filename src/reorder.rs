//! RTP jitter reordering ring
//!
//! A fixed 128-slot window keyed by sequence number modulo window size.
//! Packets are delivered downstream in strictly increasing sequence order;
//! late arrivals inside the reordering horizon fill their hole and trigger a
//! consecutive flush. When FEC is active, delivered slots are retained so the
//! ring doubles as the decode window.

use crate::buffer::BufRef;
use crate::rtp::seq_delta;
use log::{debug, trace};

/// Window size, power of two. Tolerates a reordering horizon of 127 packets.
pub const WINDOW: usize = 128;
/// Packets gathered before the ring locks a base sequence and goes active.
pub const INIT_COLLECT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Empty,
    Collecting,
    Active,
}

struct Slot {
    seq: u16,
    delivered: bool,
    buf: BufRef,
    payload_offset: usize,
    payload_len: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderStats {
    pub delivered: u64,
    pub lost: u64,
    pub late: u64,
    pub duplicate: u64,
    /// Hole-fill events that released two or more packets at once.
    pub recovered: u64,
}

/// What an insert did; the stream context uses `hole` to trigger FEC.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertResult {
    pub flushed: usize,
    pub stored: bool,
    pub hole: bool,
}

pub struct ReorderRing {
    slots: Vec<Option<Slot>>,
    base_seq: u16,
    /// Undelivered packets currently stored.
    pending: usize,
    phase: Phase,
    /// Keep delivered slots for the FEC decode window.
    retain: bool,
    stats: ReorderStats,
}

impl ReorderRing {
    pub fn new(retain_for_fec: bool) -> Self {
        let mut slots = Vec::with_capacity(WINDOW);
        slots.resize_with(WINDOW, || None);
        ReorderRing {
            slots,
            base_seq: 0,
            pending: 0,
            phase: Phase::Empty,
            retain: retain_for_fec,
            stats: ReorderStats::default(),
        }
    }

    pub fn base_seq(&self) -> u16 {
        self.base_seq
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn set_retain(&mut self, retain: bool) {
        self.retain = retain;
    }

    /// Drop all state and restart from `seq` (FCC multicast hand-off).
    pub fn reset_to(&mut self, seq: u16) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.pending = 0;
        self.base_seq = seq;
        self.phase = Phase::Collecting;
    }

    #[inline]
    fn idx(seq: u16) -> usize {
        seq as usize & (WINDOW - 1)
    }

    /// Borrow a stored packet by exact sequence (delivered or not). Used by
    /// the FEC decoder to assemble its source block.
    pub fn get(&self, seq: u16) -> Option<(&BufRef, usize, usize)> {
        match &self.slots[Self::idx(seq)] {
            Some(s) if s.seq == seq => Some((&s.buf, s.payload_offset, s.payload_len)),
            _ => None,
        }
    }

    /// Release retained packets in `[begin, end]` once their FEC group ages
    /// out. Only touches slots already delivered.
    pub fn release_range(&mut self, begin: u16, end: u16) {
        let mut seq = begin;
        loop {
            let idx = Self::idx(seq);
            if let Some(s) = &self.slots[idx] {
                if s.seq == seq && s.delivered {
                    self.slots[idx] = None;
                }
            }
            if seq == end {
                break;
            }
            seq = seq.wrapping_add(1);
        }
    }

    /// Insert a parsed RTP packet. `deliver` receives payload views in
    /// sequence order as slots flush.
    pub fn insert(
        &mut self,
        seq: u16,
        buf: BufRef,
        payload_offset: usize,
        payload_len: usize,
        deliver: &mut dyn FnMut(BufRef),
    ) -> InsertResult {
        match self.phase {
            Phase::Empty => {
                self.base_seq = seq;
                self.store(seq, buf, payload_offset, payload_len);
                self.phase = Phase::Collecting;
                InsertResult { stored: true, ..Default::default() }
            }
            Phase::Collecting => {
                if seq_delta(seq, self.base_seq) < 0 {
                    self.base_seq = seq;
                }
                let mut res = InsertResult::default();
                res.stored = self.store(seq, buf, payload_offset, payload_len);
                if self.pending >= INIT_COLLECT {
                    self.phase = Phase::Active;
                    res.flushed = self.flush(deliver);
                }
                res
            }
            Phase::Active => self.insert_active(seq, buf, payload_offset, payload_len, deliver),
        }
    }

    fn insert_active(
        &mut self,
        seq: u16,
        buf: BufRef,
        payload_offset: usize,
        payload_len: usize,
        deliver: &mut dyn FnMut(BufRef),
    ) -> InsertResult {
        let mut res = InsertResult::default();
        let d = seq_delta(seq, self.base_seq);
        if d == 0 {
            res.stored = self.store(seq, buf, payload_offset, payload_len);
            res.flushed = self.flush(deliver);
            if res.flushed >= 2 {
                self.stats.recovered += 1;
                debug!("reorder: hole filled, released {} packets", res.flushed);
            }
        } else if d < 0 {
            self.stats.late += 1;
            trace!("reorder: late packet seq={} base={}", seq, self.base_seq);
        } else if (d as usize) >= WINDOW {
            // Window overrun: drag the base forward, give up on the holes.
            let target = seq.wrapping_sub(WINDOW as u16 - 1);
            self.force_advance(target, deliver);
            res.stored = self.store(seq, buf, payload_offset, payload_len);
            res.flushed = self.flush(deliver);
        } else {
            let idx = Self::idx(seq);
            if matches!(&self.slots[idx], Some(s) if s.seq == seq) {
                self.stats.duplicate += 1;
                return res;
            }
            res.stored = self.store(seq, buf, payload_offset, payload_len);
            res.hole = true;
        }
        res
    }

    fn store(&mut self, seq: u16, buf: BufRef, payload_offset: usize, payload_len: usize) -> bool {
        let idx = Self::idx(seq);
        if let Some(old) = self.slots[idx].take() {
            if !old.delivered {
                self.pending -= 1;
            }
        }
        self.slots[idx] = Some(Slot { seq, delivered: false, buf, payload_offset, payload_len });
        self.pending += 1;
        true
    }

    /// Deliver consecutive packets starting at the base sequence.
    pub fn flush(&mut self, deliver: &mut dyn FnMut(BufRef)) -> usize {
        let mut flushed = 0;
        loop {
            let idx = Self::idx(self.base_seq);
            let ready = matches!(&self.slots[idx], Some(s) if s.seq == self.base_seq && !s.delivered);
            if !ready {
                break;
            }
            if self.retain {
                if let Some(s) = self.slots[idx].as_mut() {
                    s.delivered = true;
                    deliver(s.buf.slice(s.payload_offset, s.payload_len));
                }
            } else if let Some(s) = self.slots[idx].take() {
                deliver(s.buf.slice(s.payload_offset, s.payload_len));
            }
            self.pending -= 1;
            self.stats.delivered += 1;
            self.base_seq = self.base_seq.wrapping_add(1);
            flushed += 1;
        }
        flushed
    }

    /// Advance the base to `target`, delivering whatever is stored on the way
    /// and counting the gaps as loss.
    fn force_advance(&mut self, target: u16, deliver: &mut dyn FnMut(BufRef)) {
        while self.base_seq != target {
            let idx = Self::idx(self.base_seq);
            let present = matches!(&self.slots[idx], Some(s) if s.seq == self.base_seq && !s.delivered);
            if present {
                if self.retain {
                    if let Some(s) = self.slots[idx].as_mut() {
                        s.delivered = true;
                        deliver(s.buf.slice(s.payload_offset, s.payload_len));
                    }
                } else if let Some(s) = self.slots[idx].take() {
                    deliver(s.buf.slice(s.payload_offset, s.payload_len));
                }
                self.pending -= 1;
                self.stats.delivered += 1;
            } else {
                self.stats.lost += 1;
            }
            self.base_seq = self.base_seq.wrapping_add(1);
        }
        if self.stats.lost > 0 {
            debug!("reorder: window overrun, base advanced to {}", target);
        }
    }
}
