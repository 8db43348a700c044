//! Minimal STUN binding client (RFC 5389)
//!
//! Used before a UDP-transport SETUP to learn the public address a NAT maps
//! our RTP port to, so the Transport header can advertise reachable ports.

use crate::wire::{read_u16_be, read_u32_be};
use rand::Rng;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

pub const MAGIC_COOKIE: u32 = 0x2112A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const RETRY_INTERVAL: Duration = Duration::from_millis(500);
const RETRIES: usize = 3;

pub fn build_binding_request(txid: &[u8; 12]) -> [u8; 20] {
    let mut pkt = [0u8; 20];
    pkt[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length 0: no attributes
    pkt[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    pkt[8..20].copy_from_slice(txid);
    pkt
}

/// Extract the mapped address from a binding success response.
/// XOR-MAPPED-ADDRESS wins over the legacy MAPPED-ADDRESS.
pub fn parse_binding_response(buf: &[u8], txid: &[u8; 12]) -> Option<SocketAddrV4> {
    if buf.len() < 20 {
        return None;
    }
    if read_u16_be(buf, 0)? != BINDING_SUCCESS {
        return None;
    }
    if read_u32_be(buf, 4)? != MAGIC_COOKIE || &buf[8..20] != txid {
        return None;
    }
    let msg_len = read_u16_be(buf, 2)? as usize;
    let end = (20 + msg_len).min(buf.len());

    let mut mapped = None;
    let mut off = 20;
    while off + 4 <= end {
        let attr = read_u16_be(buf, off)?;
        let len = read_u16_be(buf, off + 2)? as usize;
        let value = buf.get(off + 4..off + 4 + len)?;
        match attr {
            ATTR_XOR_MAPPED_ADDRESS if len >= 8 && value[1] == 0x01 => {
                let port = read_u16_be(value, 2)? ^ (MAGIC_COOKIE >> 16) as u16;
                let addr = read_u32_be(value, 4)? ^ MAGIC_COOKIE;
                return Some(SocketAddrV4::new(Ipv4Addr::from(addr), port));
            }
            ATTR_MAPPED_ADDRESS if len >= 8 && value[1] == 0x01 => {
                let port = read_u16_be(value, 2)?;
                let addr = read_u32_be(value, 4)?;
                mapped = Some(SocketAddrV4::new(Ipv4Addr::from(addr), port));
            }
            _ => {}
        }
        // Attributes are padded to 32-bit boundaries.
        off += 4 + (len + 3) / 4 * 4;
    }
    mapped
}

/// Query `server` from `socket`. Retries at 500 ms, up to 3 attempts; `None`
/// when the server never answers usably (the caller then advertises the
/// local port).
pub async fn query(socket: &UdpSocket, server: SocketAddr) -> io::Result<Option<SocketAddrV4>> {
    let txid: [u8; 12] = rand::thread_rng().gen();
    let request = build_binding_request(&txid);
    let mut buf = [0u8; 576];
    for attempt in 0..RETRIES {
        socket.send_to(&request, server).await?;
        match tokio::time::timeout(RETRY_INTERVAL, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                if from != server {
                    continue;
                }
                if let Some(mapped) = parse_binding_response(&buf[..n], &txid) {
                    log::debug!("stun: mapped address {} (attempt {})", mapped, attempt + 1);
                    return Ok(Some(mapped));
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => continue,
        }
    }
    log::debug!("stun: no usable answer from {}", server);
    Ok(None)
}
