//! tsgate - IPTV multicast/RTSP to HTTP streaming gateway
//!
//! Converts carrier RTP/UDP multicast and RTSP unicast feeds into plain HTTP
//! responses, with fast channel change (FCC), Reed-Solomon FEC recovery and
//! a zero-copy batched send path.

pub mod args;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod fcc;
pub mod fec;
pub mod mcast;
pub mod net;
pub mod reorder;
pub mod rtp;
pub mod rtsp;
pub mod sendq;
pub mod status;
pub mod stream;
pub mod web;
pub mod wire;
pub mod worker;

// Re-exports
pub use buffer::{BufRef, BufferPool, PoolConfig};
pub use config::{Config, Service};
pub use status::Status;
pub use stream::{StreamContext, StreamSettings};
