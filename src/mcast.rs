//! Multicast ingress
//!
//! Joins the service group and pulls packets with batched `recvmmsg` into
//! pooled buffers. When the pool is exhausted the socket is drained into a
//! throwaway buffer so the kernel-side queue never backs up against the
//! sender; those packets are counted as dropped.

use crate::buffer::{BufferPool, PoolBufMut};
use crate::net::{self, Iface};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;

/// Upper bound on packets pulled per readiness event.
pub const MAX_RECV_PACKETS_PER_BATCH: usize = 64;
/// A stream with no upstream data for this long is considered dead.
pub const MCAST_TIMEOUT: Duration = Duration::from_secs(30);

/// One batch of received packets. Buffers arrive with their lengths set from
/// the kernel's returned sizes.
pub struct RecvBatch {
    pub packets: Vec<(PoolBufMut, Option<SocketAddrV4>)>,
    /// Packets discarded because no pool buffer was available.
    pub dropped: usize,
}

/// Batched non-blocking receive on any UDP socket. An empty batch with
/// `dropped == 0` means the socket would block.
pub fn recv_batch(fd: RawFd, pool: &BufferPool, capture_peer: bool) -> io::Result<RecvBatch> {
    let mut bufs = pool.alloc_batch(MAX_RECV_PACKETS_PER_BATCH);
    if bufs.is_empty() {
        return Ok(RecvBatch { packets: Vec::new(), dropped: drain_discard(fd)? });
    }
    let n = bufs.len();

    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(n);
    let mut addrs: Vec<libc::sockaddr_in> = vec![unsafe { std::mem::zeroed() }; n];
    let mut hdrs: Vec<libc::mmsghdr> = Vec::with_capacity(n);
    for (i, buf) in bufs.iter_mut().enumerate() {
        let storage = buf.storage_mut();
        iovecs.push(libc::iovec {
            iov_base: storage.as_mut_ptr() as *mut libc::c_void,
            iov_len: storage.len(),
        });
        let mut mh: libc::msghdr = unsafe { std::mem::zeroed() };
        mh.msg_iov = &mut iovecs[i];
        mh.msg_iovlen = 1;
        if capture_peer {
            mh.msg_name = &mut addrs[i] as *mut libc::sockaddr_in as *mut libc::c_void;
            mh.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        }
        hdrs.push(libc::mmsghdr { msg_hdr: mh, msg_len: 0 });
    }

    let rc = unsafe {
        libc::recvmmsg(fd, hdrs.as_mut_ptr(), n as libc::c_uint, libc::MSG_DONTWAIT, std::ptr::null_mut())
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {
                Ok(RecvBatch { packets: Vec::new(), dropped: 0 })
            }
            _ => Err(err),
        };
    }

    let received = rc as usize;
    let mut packets = Vec::with_capacity(received);
    for (i, mut buf) in bufs.into_iter().enumerate().take(received) {
        buf.set_len(hdrs[i].msg_len as usize);
        let peer = if capture_peer && hdrs[i].msg_hdr.msg_namelen > 0 {
            let sin = &addrs[i];
            Some(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            ))
        } else {
            None
        };
        packets.push((buf, peer));
    }
    // Unused buffers drop back into the pool here.
    Ok(RecvBatch { packets, dropped: 0 })
}

/// Pool exhausted: pull whatever is queued into a scratch buffer and count it.
fn drain_discard(fd: RawFd) -> io::Result<usize> {
    let mut scratch = [0u8; crate::buffer::BUFFER_SIZE];
    let mut dropped = 0;
    loop {
        let rc = unsafe {
            libc::recv(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len(), libc::MSG_DONTWAIT)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(dropped),
                _ => Err(err),
            };
        }
        dropped += 1;
        if dropped >= MAX_RECV_PACKETS_PER_BATCH {
            return Ok(dropped);
        }
    }
}

/// A joined multicast group plus receive-side bookkeeping.
pub struct McastRx {
    afd: AsyncFd<UdpSocket>,
    group: SocketAddrV4,
    source: Option<Ipv4Addr>,
    iface: Iface,
    last_data: Instant,
    pub dropped: u64,
}

impl McastRx {
    pub fn join(
        group: SocketAddrV4,
        source: Option<Ipv4Addr>,
        iface: Iface,
        rcvbuf: usize,
    ) -> io::Result<Self> {
        let socket = net::multicast_socket(group, source, iface, rcvbuf)?;
        log::debug!("mcast: joined {}{}", group, match source {
            Some(s) => format!(" (source {})", s),
            None => String::new(),
        });
        Ok(McastRx {
            afd: AsyncFd::new(socket)?,
            group,
            source,
            iface,
            last_data: Instant::now(),
            dropped: 0,
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn raw_fd(&self) -> RawFd {
        self.afd.get_ref().as_raw_fd()
    }

    /// Await the next non-empty batch.
    pub async fn recv(&mut self, pool: &BufferPool) -> io::Result<RecvBatch> {
        loop {
            let mut guard = self.afd.readable().await?;
            let batch = recv_batch(self.raw_fd(), pool, false)?;
            if batch.packets.is_empty() && batch.dropped == 0 {
                guard.clear_ready();
                continue;
            }
            self.dropped += batch.dropped as u64;
            if !batch.packets.is_empty() {
                self.last_data = Instant::now();
            }
            return Ok(batch);
        }
    }

    /// Re-assert membership (periodic rejoin for flaky upstream switches).
    /// The existing membership is never dropped first.
    pub fn rejoin(&self) {
        if let Err(e) =
            net::rejoin_multicast(self.afd.get_ref(), self.group, self.source, self.iface)
        {
            log::warn!("mcast: rejoin of {} failed: {}", self.group, e);
        }
    }

    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_data) > timeout
    }

    /// Treat an external event (FCC pending flush) as liveness.
    pub fn touch(&mut self) {
        self.last_data = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolConfig;

    fn pool() -> BufferPool {
        BufferPool::new(PoolConfig::default())
    }

    #[test]
    fn test_recv_batch_reads_queued_datagrams() {
        let rx = net::udp_socket("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let tx = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dst = rx.local_addr().unwrap();
        for i in 0..5u8 {
            tx.send_to(&[i; 10], dst).unwrap();
        }
        // Give the loopback a moment.
        std::thread::sleep(Duration::from_millis(20));
        let batch = recv_batch(rx.as_raw_fd(), &pool(), true).unwrap();
        assert_eq!(batch.packets.len(), 5);
        for (i, (buf, peer)) in batch.packets.iter().enumerate() {
            assert_eq!(buf.as_slice(), &[i as u8; 10]);
            let peer = peer.expect("peer captured");
            assert_eq!(peer.port(), tx.local_addr().unwrap().port());
        }
    }

    #[test]
    fn test_recv_batch_empty_on_would_block() {
        let rx = net::udp_socket("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let batch = recv_batch(rx.as_raw_fd(), &pool(), false).unwrap();
        assert!(batch.packets.is_empty());
        assert_eq!(batch.dropped, 0);
    }

    #[test]
    fn test_exhausted_pool_drains_socket() {
        let small = BufferPool::new(PoolConfig {
            initial_buffers: 2,
            max_buffers: 2,
            expand_step: 2,
            low_watermark: 0,
            high_watermark: 2,
        });
        // Hold every buffer so the pool cannot serve the receive path.
        let held = small.alloc_batch(2);
        assert_eq!(held.len(), 2);

        let rx = net::udp_socket("127.0.0.1:0".parse().unwrap(), 0).unwrap();
        let tx = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dst = rx.local_addr().unwrap();
        for _ in 0..3 {
            tx.send_to(b"spill", dst).unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        let batch = recv_batch(rx.as_raw_fd(), &small, false).unwrap();
        assert!(batch.packets.is_empty());
        assert_eq!(batch.dropped, 3);
    }
}
