//! SLIP frame reassembly
//!
//! The transport delivers bytes in arbitrary chunks. This sink scans them
//! for delimiter-bounded SLIP frames, keeps partial frames across calls,
//! and discards noise between frames.

use crate::codec::slip;

/// Stateful frame locator fed from the transport's delivery context
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Bytes gathered since the last opening delimiter
    buf: Vec<u8>,
    /// Whether an opening delimiter has been seen
    in_frame: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of transport bytes, returning every complete frame
    /// (delimiters included) found in it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if byte != slip::END {
                if self.in_frame {
                    self.buf.push(byte);
                }
                // Bytes between frames are noise
                continue;
            }

            if !self.in_frame {
                self.in_frame = true;
                self.buf.clear();
                self.buf.push(slip::END);
                continue;
            }

            // Two consecutive delimiters: the first opened a frame nothing
            // was written into, so treat this one as the real opening.
            if self.buf.len() == 1 {
                continue;
            }

            self.buf.push(slip::END);
            frames.push(std::mem::take(&mut self.buf));
            self.in_frame = false;
        }

        frames
    }
}
