//! RTSP transport negotiation
//!
//! SETUP offers a preference-ordered list of transport specs; the server
//! answers with the one it picked. Interleaved TCP variants come first (they
//! traverse NATs for free), UDP with advertised client ports after.

use std::fmt;

/// How media reaches us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Udp,
}

/// Payload framing inside the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// RTP packets; the RTP header is stripped before forwarding.
    Rtp,
    /// Raw MPEG-TS, forwarded verbatim.
    Mp2t,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedTransport {
    pub mode: TransportMode,
    pub protocol: TransportProtocol,
    /// RTP/RTCP channel ids for interleaved TCP.
    pub interleaved: (u8, u8),
    /// Server-side RTP port for UDP transports.
    pub server_port: Option<u16>,
}

impl fmt::Display for NegotiatedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} interleaved={}-{}",
            self.protocol, self.mode, self.interleaved.0, self.interleaved.1
        )
    }
}

/// The offer list for SETUP, most preferred first. `client_port` is the
/// (possibly STUN-mapped) local RTP port advertised for the UDP entries.
pub fn offer_list(client_port: u16) -> Vec<String> {
    vec![
        "MP2T/RTP/TCP;unicast;interleaved=0-1".to_string(),
        "MP2T/TCP;unicast;interleaved=0-1".to_string(),
        "RTP/AVP/TCP;unicast;interleaved=0-1".to_string(),
        format!("MP2T/RTP/UDP;unicast;client_port={}-{}", client_port, client_port + 1),
        format!("MP2T/UDP;unicast;client_port={}-{}", client_port, client_port + 1),
        format!("RTP/AVP;unicast;client_port={}-{}", client_port, client_port + 1),
    ]
}

/// The Transport header value offered in SETUP.
pub fn offer_header(client_port: u16) -> String {
    offer_list(client_port).join(",")
}

/// Parse the server's chosen transport out of its Transport header. Only the
/// first spec is considered, per RFC 2326 (the response names one choice).
pub fn parse_transport_header(value: &str) -> Option<NegotiatedTransport> {
    let chosen = value.split(',').next()?.trim();
    let mut parts = chosen.split(';');
    let spec = parts.next()?.trim();

    let upper = spec.to_ascii_uppercase();
    let mode = if upper.contains("/TCP") {
        TransportMode::Tcp
    } else {
        TransportMode::Udp
    };
    let protocol = if upper.starts_with("MP2T") && !upper.contains("/RTP") {
        TransportProtocol::Mp2t
    } else if upper.starts_with("MP2T") || upper.starts_with("RTP/AVP") {
        TransportProtocol::Rtp
    } else {
        return None;
    };

    let mut interleaved = (0u8, 1u8);
    let mut server_port = None;
    for param in parts {
        let param = param.trim();
        if let Some(v) = param.strip_prefix("interleaved=") {
            interleaved = parse_pair_u8(v)?;
        } else if let Some(v) = param.strip_prefix("server_port=") {
            server_port = Some(parse_pair_u16(v)?.0);
        }
    }
    Some(NegotiatedTransport { mode, protocol, interleaved, server_port })
}

fn parse_pair_u8(v: &str) -> Option<(u8, u8)> {
    match v.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u8 = v.trim().parse().ok()?;
            Some((a, a.wrapping_add(1)))
        }
    }
}

fn parse_pair_u16(v: &str) -> Option<(u16, u16)> {
    match v.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u16 = v.trim().parse().ok()?;
            Some((a, a.wrapping_add(1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_order() {
        let offers = offer_list(42000);
        assert_eq!(offers.len(), 6);
        assert!(offers[0].starts_with("MP2T/RTP/TCP"));
        assert!(offers[1].starts_with("MP2T/TCP"));
        assert!(offers[2].starts_with("RTP/AVP/TCP"));
        assert!(offers[3].contains("client_port=42000-42001"));
        assert!(offers[5].starts_with("RTP/AVP;"));
    }

    #[test]
    fn test_parse_interleaved_choice() {
        let t = parse_transport_header("MP2T/RTP/TCP;unicast;interleaved=2-3").unwrap();
        assert_eq!(t.mode, TransportMode::Tcp);
        assert_eq!(t.protocol, TransportProtocol::Rtp);
        assert_eq!(t.interleaved, (2, 3));
    }

    #[test]
    fn test_parse_raw_ts_over_tcp() {
        let t = parse_transport_header("MP2T/TCP;interleaved=0-1").unwrap();
        assert_eq!(t.protocol, TransportProtocol::Mp2t);
        assert_eq!(t.mode, TransportMode::Tcp);
    }

    #[test]
    fn test_parse_udp_with_server_port() {
        let t = parse_transport_header(
            "RTP/AVP;unicast;client_port=42000-42001;server_port=6970-6971",
        )
        .unwrap();
        assert_eq!(t.mode, TransportMode::Udp);
        assert_eq!(t.protocol, TransportProtocol::Rtp);
        assert_eq!(t.server_port, Some(6970));
    }

    #[test]
    fn test_unknown_spec_rejected() {
        assert!(parse_transport_header("H264/FOO;interleaved=0-1").is_none());
    }
}
