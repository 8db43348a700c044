//! Per-connection batched send queue
//!
//! Media payloads are queued as refcounted buffer views and flushed with a
//! single vectored `sendmsg` per batch. When the socket has `SO_ZEROCOPY`
//! armed the flush uses `MSG_ZEROCOPY`; consumed entries then stay alive on a
//! pending-completion FIFO until the kernel reports their notification id
//! range on the socket error queue. File entries (`sendfile`) bypass the
//! completion FIFO entirely.
//!
//! Batching: a flush is requested once 10 KiB accumulate or the oldest entry
//! is 5 ms old. At IPTV packet sizes an unbatched send costs more in syscalls
//! than the copy it avoids.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::buffer::BufRef;

/// Max iovec entries handed to one `sendmsg`.
pub const MAX_SEND_IOVECS: usize = 64;
/// Flush once this many unsent bytes accumulate.
pub const BATCH_BYTES: usize = 10 * 1024;
/// ...or once the oldest queued entry reaches this age.
pub const BATCH_TIMEOUT: Duration = Duration::from_millis(5);
/// Bounds batches per flush call so one connection cannot stall the worker.
const MAX_BATCHES_PER_FLUSH: usize = 8;

/// `ee_code` flag set when the kernel fell back to copying.
const EE_CODE_ZEROCOPY_COPIED: u8 = 1;

/// `ee_origin` value for MSG_ZEROCOPY completions (not exposed by the `libc` crate).
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

/// Counters surfaced per worker on the status page.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendStats {
    /// Successful vectored sends.
    pub total: u64,
    /// Zero-copy notifications consumed from the error queue.
    pub completions: u64,
    /// Completions where the kernel copied instead of pinning pages.
    pub copied: u64,
    pub eagain: u64,
    pub enobufs: u64,
    /// Flushes that packed more than one entry.
    pub batch: u64,
}

impl SendStats {
    /// Counter movement since `prev`.
    pub fn delta_since(&self, prev: &SendStats) -> SendStats {
        SendStats {
            total: self.total - prev.total,
            completions: self.completions - prev.completions,
            copied: self.copied - prev.copied,
            eagain: self.eagain - prev.eagain,
            enobufs: self.enobufs - prev.enobufs,
            batch: self.batch - prev.batch,
        }
    }

    pub fn accumulate(&mut self, other: &SendStats) {
        self.total += other.total;
        self.completions += other.completions;
        self.copied += other.copied;
        self.eagain += other.eagain;
        self.enobufs += other.enobufs;
        self.batch += other.batch;
    }
}

enum Entry {
    Buf {
        buf: BufRef,
        /// Bytes of this entry already handed to the kernel.
        sent: usize,
    },
    File {
        fd: OwnedFd,
        offset: i64,
        remaining: usize,
    },
}

struct Pending {
    id: u32,
    bufs: Vec<BufRef>,
}

/// Outcome of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Everything currently flushable was written.
    Drained,
    /// Socket backpressure; keep write interest armed.
    WouldBlock,
}

pub struct SendQueue {
    entries: VecDeque<Entry>,
    queued_bytes: usize,
    oldest: Option<Instant>,
    file_entries: usize,
    pending: VecDeque<Pending>,
    next_zc_id: u32,
    zerocopy: bool,
    stats: SendStats,
}

impl SendQueue {
    pub fn new(zerocopy: bool) -> Self {
        SendQueue {
            entries: VecDeque::new(),
            queued_bytes: 0,
            oldest: None,
            file_entries: 0,
            pending: VecDeque::new(),
            next_zc_id: 0,
            zerocopy,
            stats: SendStats::default(),
        }
    }

    /// Arm `SO_ZEROCOPY` on a connected socket. Returns whether the kernel
    /// accepted it; callers construct the queue with the result.
    pub fn arm_zerocopy(fd: RawFd) -> bool {
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ZEROCOPY,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        rc == 0
    }

    pub fn stats(&self) -> SendStats {
        self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn pending_completions(&self) -> usize {
        self.pending.len()
    }

    pub fn enqueue(&mut self, buf: BufRef) {
        if buf.is_empty() {
            return;
        }
        self.queued_bytes += buf.len();
        if self.entries.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.entries.push_back(Entry::Buf { buf, sent: 0 });
    }

    /// Queue a region of an owned file for `sendfile` transmission. The fd
    /// closes when the entry drains.
    pub fn enqueue_file(&mut self, fd: OwnedFd, offset: i64, len: usize) {
        if len == 0 {
            return;
        }
        self.queued_bytes += len;
        if self.entries.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.file_entries += 1;
        self.entries.push_back(Entry::File { fd, offset, remaining: len });
    }

    /// Whether a flush should run now. File entries always flush immediately.
    pub fn wants_flush(&self, now: Instant) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if self.file_entries > 0 {
            return true;
        }
        if self.queued_bytes >= BATCH_BYTES {
            return true;
        }
        match self.oldest {
            Some(t) => now.duration_since(t) >= BATCH_TIMEOUT,
            None => false,
        }
    }

    /// When the batching deadline for the current head expires, if ever.
    pub fn deadline(&self) -> Option<Instant> {
        if self.entries.is_empty() {
            return None;
        }
        if self.file_entries > 0 || self.queued_bytes >= BATCH_BYTES {
            return Some(Instant::now());
        }
        self.oldest.map(|t| t + BATCH_TIMEOUT)
    }

    /// Write as much of the queue as the socket accepts.
    pub fn flush(&mut self, fd: RawFd) -> io::Result<FlushOutcome> {
        for _ in 0..MAX_BATCHES_PER_FLUSH {
            if self.entries.is_empty() {
                self.oldest = None;
                return Ok(FlushOutcome::Drained);
            }
            let outcome = match self.entries.front() {
                Some(Entry::File { .. }) => self.flush_file(fd)?,
                _ => self.flush_bufs(fd)?,
            };
            if outcome == FlushOutcome::WouldBlock {
                return Ok(FlushOutcome::WouldBlock);
            }
        }
        Ok(if self.entries.is_empty() {
            self.oldest = None;
            FlushOutcome::Drained
        } else {
            FlushOutcome::WouldBlock
        })
    }

    fn flush_bufs(&mut self, fd: RawFd) -> io::Result<FlushOutcome> {
        let mut iovecs: [libc::iovec; MAX_SEND_IOVECS] = unsafe { std::mem::zeroed() };
        let mut count = 0;
        for entry in self.entries.iter() {
            if count == MAX_SEND_IOVECS {
                break;
            }
            match entry {
                Entry::Buf { buf, sent } => {
                    let slice = &buf.as_slice()[*sent..];
                    if slice.is_empty() {
                        continue;
                    }
                    iovecs[count] = libc::iovec {
                        iov_base: slice.as_ptr() as *mut libc::c_void,
                        iov_len: slice.len(),
                    };
                    count += 1;
                }
                // A file entry fences the batch; it flushes on its own.
                Entry::File { .. } => break,
            }
        }
        if count == 0 {
            return Ok(FlushOutcome::Drained);
        }

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iovecs.as_mut_ptr();
        msg.msg_iovlen = count as _;
        let mut flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        if self.zerocopy {
            flags |= libc::MSG_ZEROCOPY;
        }
        let n = unsafe { libc::sendmsg(fd, &msg, flags) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => {
                    self.stats.eagain += 1;
                    Ok(FlushOutcome::WouldBlock)
                }
                Some(libc::ENOBUFS) => {
                    self.stats.enobufs += 1;
                    Ok(FlushOutcome::WouldBlock)
                }
                _ => Err(err),
            };
        }
        let n = n as usize;
        self.stats.total += 1;
        if count > 1 {
            self.stats.batch += 1;
        }
        self.advance_bufs(n);
        Ok(FlushOutcome::Drained)
    }

    /// Pop `n` sent bytes off the queue head. Under zero-copy the consumed
    /// views move to the pending FIFO under the id of the send that carried
    /// them; a partially sent head stays queued but is also held pending,
    /// since the kernel may still reference its pages.
    fn advance_bufs(&mut self, n: usize) {
        let mut remaining = n;
        let mut carried: Vec<BufRef> = Vec::new();
        while remaining > 0 {
            let consumed = match self.entries.front_mut() {
                Some(Entry::Buf { buf, sent }) => {
                    let left = buf.len() - *sent;
                    if remaining >= left {
                        remaining -= left;
                        true
                    } else {
                        *sent += remaining;
                        if self.zerocopy {
                            carried.push(buf.clone());
                        }
                        remaining = 0;
                        false
                    }
                }
                _ => break,
            };
            if consumed {
                if let Some(Entry::Buf { buf, .. }) = self.entries.pop_front() {
                    if self.zerocopy {
                        carried.push(buf);
                    }
                }
            }
        }
        self.queued_bytes -= n - remaining;
        if self.zerocopy && n > 0 {
            self.pending.push_back(Pending { id: self.next_zc_id, bufs: carried });
            self.next_zc_id = self.next_zc_id.wrapping_add(1);
        }
        if self.entries.is_empty() {
            self.oldest = None;
        }
    }

    fn flush_file(&mut self, out_fd: RawFd) -> io::Result<FlushOutcome> {
        let (n, done) = match self.entries.front_mut() {
            Some(Entry::File { fd, offset, remaining }) => {
                let rc = unsafe {
                    libc::sendfile(out_fd, fd.as_raw_fd(), offset as *mut libc::off_t, *remaining)
                };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    return match err.raw_os_error() {
                        Some(libc::EAGAIN) => {
                            self.stats.eagain += 1;
                            Ok(FlushOutcome::WouldBlock)
                        }
                        _ => Err(err),
                    };
                }
                let n = rc as usize;
                if n == 0 {
                    // File shorter than the queued region; nothing more
                    // will ever come out of it.
                    let n = *remaining;
                    *remaining = 0;
                    (n, true)
                } else {
                    *remaining -= n;
                    (n, *remaining == 0)
                }
            }
            _ => return Ok(FlushOutcome::Drained),
        };
        self.queued_bytes -= n;
        self.stats.total += 1;
        if done {
            self.entries.pop_front();
            self.file_entries -= 1;
        }
        if self.entries.is_empty() {
            self.oldest = None;
        }
        Ok(FlushOutcome::Drained)
    }

    /// Drain zero-copy completion notifications from the socket error queue.
    /// Returns how many pending sends were released.
    pub fn drain_completions(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut released = 0;
        loop {
            let mut ctrl = [0u8; 128];
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = ctrl.len() as _;
            let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
            if n < 0 {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EAGAIN) => Ok(released),
                    _ => Err(err),
                };
            }
            let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            while !cmsg.is_null() {
                let (level, ty) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
                let is_recverr = (level == libc::SOL_IP && ty == libc::IP_RECVERR)
                    || (level == libc::SOL_IPV6 && ty == libc::IPV6_RECVERR);
                if is_recverr {
                    let serr = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err) };
                    if serr.ee_errno == 0 && serr.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                        let copied = serr.ee_code & EE_CODE_ZEROCOPY_COPIED != 0;
                        released += self.complete_range(serr.ee_info, serr.ee_data, copied);
                    }
                }
                cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
            }
        }
    }

    /// Release every pending send whose id falls inside `[lo, hi]`.
    /// Completion ranges arrive in order but may coalesce several sends.
    pub fn complete_range(&mut self, lo: u32, hi: u32, copied: bool) -> usize {
        let mut released = 0;
        while let Some(front) = self.pending.front() {
            let id = front.id;
            let in_range = if lo <= hi {
                id >= lo && id <= hi
            } else {
                // id counter wrapped
                id >= lo || id <= hi
            };
            if !in_range {
                break;
            }
            self.pending.pop_front();
            self.stats.completions += 1;
            if copied {
                self.stats.copied += 1;
            }
            released += 1;
        }
        released
    }

    /// Drop all queued entries. Pending completions are kept; the owner must
    /// drain the error queue before the socket goes away.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queued_bytes = 0;
        self.file_entries = 0;
        self.oldest = None;
    }

    /// Forget pending completions without kernel acknowledgment. Only valid
    /// once the socket is closed: closing flushes the error queue state, so
    /// the kernel holds no further page references.
    pub fn abandon_pending(&mut self) {
        self.pending.clear();
    }
}
