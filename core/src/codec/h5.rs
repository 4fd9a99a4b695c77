//! Three-Wire UART (H5) packet codec
//!
//! Wire layout around a payload, before SLIP framing:
//!
//! ```text
//! byte 0: reliable[1] | integrity[1] | ack[3] | seq[3]
//! byte 1: len_low[4]  | packet_type[4]
//! byte 2: len_high[8]
//! byte 3: header checksum
//! bytes 4..: payload
//! optional trailing 2 bytes: CRC-16 over header + payload (little-endian)
//! ```
//!
//! The header checksum makes the sum of all four header bytes 0xFF modulo
//! 256. The payload length field is 12 bits wide.

use std::fmt;
use thiserror::Error;

/// Largest payload the 12-bit length field can describe
pub const MAX_PAYLOAD: usize = 0x0FFF;

/// Number of header bytes preceding the payload
pub const HEADER_SIZE: usize = 4;

/// H5 decoding/encoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum H5Error {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("header checksum mismatch: computed {computed:#04x}, found {found:#04x}")]
    HeaderChecksumMismatch { computed: u8, found: u8 },

    #[error("length field says {header} bytes, frame carries {actual}")]
    LengthMismatch { header: usize, actual: usize },

    #[error("payload CRC mismatch")]
    IntegrityMismatch,

    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),
}

/// Packet types from the Three-Wire UART table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ack,
    HciCommand,
    AclData,
    SyncData,
    HciEvent,
    Reset,
    VendorSpecific,
    LinkControl,
    /// 4-bit values with no assigned meaning; carried through for dispatch
    /// to drop.
    Reserved(u8),
}

impl PacketType {
    /// Map a 4-bit wire value to a packet type
    pub fn from_wire(value: u8) -> Self {
        match value & 0x0F {
            0 => PacketType::Ack,
            1 => PacketType::HciCommand,
            2 => PacketType::AclData,
            3 => PacketType::SyncData,
            4 => PacketType::HciEvent,
            5 => PacketType::Reset,
            14 => PacketType::VendorSpecific,
            15 => PacketType::LinkControl,
            other => PacketType::Reserved(other),
        }
    }

    /// The 4-bit wire value
    pub fn as_wire(&self) -> u8 {
        match self {
            PacketType::Ack => 0,
            PacketType::HciCommand => 1,
            PacketType::AclData => 2,
            PacketType::SyncData => 3,
            PacketType::HciEvent => 4,
            PacketType::Reset => 5,
            PacketType::VendorSpecific => 14,
            PacketType::LinkControl => 15,
            PacketType::Reserved(other) => other & 0x0F,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Ack => write!(f, "ACK"),
            PacketType::HciCommand => write!(f, "HCI_COMMAND"),
            PacketType::AclData => write!(f, "ACL_DATA"),
            PacketType::SyncData => write!(f, "SYNC_DATA"),
            PacketType::HciEvent => write!(f, "HCI_EVENT"),
            PacketType::Reset => write!(f, "RESET"),
            PacketType::VendorSpecific => write!(f, "VENDOR_SPECIFIC"),
            PacketType::LinkControl => write!(f, "LINK_CONTROL"),
            PacketType::Reserved(other) => write!(f, "RESERVED_{}", other),
        }
    }
}

/// A decoded H5 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H5Packet {
    pub payload: Vec<u8>,
    pub seq: u8,
    pub ack: u8,
    pub reliable: bool,
    pub packet_type: PacketType,
}

/// Build the H5 byte sequence around a payload
pub fn encode(
    payload: &[u8],
    seq: u8,
    ack: u8,
    reliable: bool,
    integrity: bool,
    packet_type: PacketType,
) -> Result<Vec<u8>, H5Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(H5Error::PayloadTooLarge(payload.len()));
    }

    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + 2);

    out.push((seq & 0x07) | ((ack & 0x07) << 3) | (u8::from(integrity) << 6) | (u8::from(reliable) << 7));
    out.push(packet_type.as_wire() | (((len & 0x000F) as u8) << 4));
    out.push((len >> 4) as u8);
    out.push(header_checksum(&out));
    out.extend_from_slice(payload);

    if integrity {
        let crc = crc16(&out);
        out.push((crc & 0xFF) as u8);
        out.push((crc >> 8) as u8);
    }

    Ok(out)
}

/// Parse an H5 byte sequence (post SLIP decoding)
pub fn decode(frame: &[u8]) -> Result<H5Packet, H5Error> {
    if frame.len() < HEADER_SIZE {
        return Err(H5Error::TooShort(frame.len()));
    }

    let computed = header_checksum(&frame[..3]);
    if computed != frame[3] {
        return Err(H5Error::HeaderChecksumMismatch {
            computed,
            found: frame[3],
        });
    }

    let seq = frame[0] & 0x07;
    let ack = (frame[0] >> 3) & 0x07;
    let integrity = frame[0] & 0x40 != 0;
    let reliable = frame[0] & 0x80 != 0;
    let packet_type = PacketType::from_wire(frame[1] & 0x0F);
    let header_len = ((frame[1] >> 4) as usize) | ((frame[2] as usize) << 4);

    let trailer = if integrity { 2 } else { 0 };
    if frame.len() < HEADER_SIZE + trailer {
        return Err(H5Error::TooShort(frame.len()));
    }
    let actual = frame.len() - HEADER_SIZE - trailer;
    if header_len != actual {
        return Err(H5Error::LengthMismatch {
            header: header_len,
            actual,
        });
    }

    if integrity {
        let body = &frame[..HEADER_SIZE + actual];
        let crc = crc16(body);
        let found = u16::from(frame[frame.len() - 2]) | (u16::from(frame[frame.len() - 1]) << 8);
        if crc != found {
            return Err(H5Error::IntegrityMismatch);
        }
    }

    Ok(H5Packet {
        payload: frame[HEADER_SIZE..HEADER_SIZE + actual].to_vec(),
        seq,
        ack,
        reliable,
        packet_type,
    })
}

fn header_checksum(header: &[u8]) -> u8 {
    let sum = header
        .iter()
        .take(3)
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    0xFFu8.wrapping_sub(sum)
}

/// CRC-16 used by the three-wire payload integrity check
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc = (crc >> 8 & 0x00FF) | (crc << 8 & 0xFF00);
        crc ^= b as u16;
        crc ^= (crc & 0x00FF) >> 4;
        crc ^= (crc << 8) << 4;
        crc ^= ((crc & 0x00FF) << 4) << 1;
    }
    crc
}

/// Name a link-control payload from the Three-Wire table, if it is one
pub fn link_control_name(payload: &[u8]) -> Option<&'static str> {
    if payload.len() < 2 {
        return None;
    }
    match (payload[0], payload[1]) {
        (0x01, 0x7E) => Some("SYNC"),
        (0x02, 0x7D) => Some("SYNC_RESPONSE"),
        (0x03, 0xFC) => Some("SYNC_CONFIG"),
        (0x04, 0x7B) => Some("SYNC_CONFIG_RESPONSE"),
        (0x05, 0xFA) => Some("WAKEUP"),
        (0x06, 0xF9) => Some("WOKEN"),
        (0x07, 0x78) => Some("SLEEP"),
        _ => None,
    }
}

impl fmt::Display for H5Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type:{} reliable:{} seq:{} ack:{} len:{}",
            self.packet_type,
            if self.reliable { "yes" } else { "no" },
            self.seq,
            self.ack,
            self.payload.len()
        )?;
        if self.packet_type == PacketType::LinkControl {
            if let Some(name) = link_control_name(&self.payload) {
                write!(f, " [{}]", name)?;
            }
        }
        Ok(())
    }
}
