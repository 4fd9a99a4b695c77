//! Wire codecs: SLIP byte-stuffed framing and the H5 packet header
//!
//! Outbound packets are H5-encoded and then SLIP-framed; inbound frames go
//! through the reverse pipeline after the reassembler has located them in
//! the byte stream.

pub mod h5;
pub mod slip;

pub use h5::{H5Error, H5Packet, PacketType};
pub use slip::SlipError;
