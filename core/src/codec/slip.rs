//! SLIP framing
//!
//! Every packet on the wire travels between two frame delimiters, with
//! delimiter and escape bytes inside the payload replaced by two-byte
//! escape sequences.

use thiserror::Error;

/// Frame delimiter
pub const END: u8 = 0xC0;
/// Escape introducer
pub const ESC: u8 = 0xDB;
/// Escaped form of END
pub const ESC_END: u8 = 0xDC;
/// Escaped form of ESC
pub const ESC_ESC: u8 = 0xDD;

/// SLIP decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlipError {
    #[error("invalid byte following escape: {0:#04x}")]
    InvalidEscape(u8),

    #[error("frame delimiter missing")]
    MissingDelimiter,
}

/// Encode a payload as a delimited SLIP frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => {
                out.push(ESC);
                out.push(ESC_END);
            }
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            _ => out.push(byte),
        }
    }
    out.push(END);
    out
}

/// Decode a complete SLIP frame (both delimiters included) back to its payload
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, SlipError> {
    if frame.len() < 2 || frame[0] != END || frame[frame.len() - 1] != END {
        return Err(SlipError::MissingDelimiter);
    }

    let mut out = Vec::with_capacity(frame.len() - 2);
    let mut iter = frame[1..frame.len() - 1].iter();

    while let Some(&byte) = iter.next() {
        if byte != ESC {
            out.push(byte);
            continue;
        }
        match iter.next() {
            Some(&ESC_END) => out.push(END),
            Some(&ESC_ESC) => out.push(ESC),
            Some(&other) => return Err(SlipError::InvalidEscape(other)),
            None => return Err(SlipError::InvalidEscape(END)),
        }
    }

    Ok(out)
}
