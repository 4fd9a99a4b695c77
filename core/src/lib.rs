// threewire-core — Three-Wire UART (H5) link layer
//
// Carries framed, acknowledged packets between a host and a Bluetooth
// controller over a plain byte channel. The byte channel itself and the
// interpretation of payloads both live outside this crate; what lives
// here is the link: SLIP framing, the four-byte H5 header, frame
// reassembly, link establishment and the single-slot reliable send loop.

pub mod codec;
pub mod link;
pub mod reassembly;
pub mod transport;

pub use codec::{H5Error, H5Packet, PacketType, SlipError};
pub use link::{
    H5Link, H5LinkConfig, LinkCounters, LinkDelegate, LinkError, LinkEvent, LinkState,
};
pub use reassembly::Reassembler;
pub use transport::{Transport, TransportDelegate, TransportError};
