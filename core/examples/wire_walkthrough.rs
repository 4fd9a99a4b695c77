// Walks one payload through the outbound pipeline and back: H5 encode,
// SLIP framing, chunked reassembly, SLIP decode, H5 decode.
//
// Run with: cargo run --example wire_walkthrough

use threewire_core::codec::{h5, slip, PacketType};
use threewire_core::Reassembler;

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() {
    let payload = [0x01, 0xC0, 0xDB, 0x04];
    println!("payload:     {}", hex(&payload));

    let h5_frame = h5::encode(&payload, 2, 5, true, true, PacketType::VendorSpecific)
        .expect("payload fits the 12-bit length field");
    println!("h5 encoded:  {}", hex(&h5_frame));

    let wire = slip::encode(&h5_frame);
    println!("on the wire: {}", hex(&wire));

    // The transport delivers bytes in arbitrary chunks; feed them one at a
    // time to show the reassembler holding partial state.
    let mut reassembler = Reassembler::new();
    let mut frames = Vec::new();
    for chunk in wire.chunks(3) {
        frames.extend(reassembler.push(chunk));
    }
    assert_eq!(frames.len(), 1);

    let slip_payload = slip::decode(&frames[0]).expect("frame is well formed");
    let packet = h5::decode(&slip_payload).expect("header is intact");
    println!("decoded:     {packet}");
    assert_eq!(packet.payload, payload);
}
