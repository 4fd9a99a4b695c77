//! Shared harness: an in-memory transport with a scriptable peer
//!
//! The mock records every frame the link transmits and lets the test (or a
//! background peer thread) push bytes back through the transport delegate,
//! standing in for the serial port's delivery thread.

#![allow(dead_code)]

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use threewire_core::codec::{h5, slip, H5Packet, PacketType};
use threewire_core::link::{
    SYNC_CONFIG_PAYLOAD, SYNC_CONFIG_RESPONSE_PAYLOAD, SYNC_PAYLOAD, SYNC_RESPONSE_PAYLOAD,
};
use threewire_core::{
    LinkDelegate, LinkEvent, Transport, TransportDelegate, TransportError,
};

struct MockShared {
    delegate: RwLock<Option<Arc<dyn TransportDelegate>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

/// The transport half handed to `H5Link::new`
pub struct MockTransport {
    shared: Arc<MockShared>,
}

/// The peer half kept by the test
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<MockShared>,
}

/// Opt-in log output for debugging test runs: RUST_LOG=debug cargo test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn mock_pair() -> (MockTransport, PeerHandle) {
    let shared = Arc::new(MockShared {
        delegate: RwLock::new(None),
        sent: Mutex::new(Vec::new()),
    });
    (
        MockTransport {
            shared: Arc::clone(&shared),
        },
        PeerHandle { shared },
    )
}

impl Transport for MockTransport {
    fn open(&mut self, delegate: Arc<dyn TransportDelegate>) -> Result<(), TransportError> {
        *self.shared.delegate.write() = Some(delegate);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.shared.sent.lock().push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        *self.shared.delegate.write() = None;
        Ok(())
    }
}

impl PeerHandle {
    /// Push raw bytes at the link, as the transport's delivery thread would
    pub fn inject(&self, bytes: &[u8]) {
        let delegate = self.shared.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_data(bytes);
        }
    }

    pub fn inject_error(&self, error: TransportError) {
        let delegate = self.shared.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_error(error);
        }
    }

    pub fn inject_packet(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        seq: u8,
        ack: u8,
        reliable: bool,
        integrity: bool,
    ) {
        let frame = h5::encode(payload, seq, ack, reliable, integrity, packet_type).unwrap();
        self.inject(&slip::encode(&frame));
    }

    pub fn inject_link_control(&self, payload: &[u8]) {
        self.inject_packet(PacketType::LinkControl, payload, 0, 0, false, false);
    }

    pub fn inject_ack(&self, ack: u8) {
        self.inject_packet(PacketType::Ack, &[], 0, ack, false, false);
    }

    pub fn inject_reliable(&self, payload: &[u8], seq: u8) {
        self.inject_packet(PacketType::VendorSpecific, payload, seq, 0, true, true);
    }

    /// Every frame the link has transmitted so far, raw
    pub fn sent_raw(&self) -> Vec<Vec<u8>> {
        self.shared.sent.lock().clone()
    }

    /// New raw frames since the caller's cursor
    pub fn sent_since(&self, cursor: &mut usize) -> Vec<Vec<u8>> {
        let sent = self.shared.sent.lock();
        let new = sent[*cursor..].to_vec();
        *cursor = sent.len();
        new
    }

    /// Every frame the link has transmitted so far, decoded
    pub fn decoded_sent(&self) -> Vec<H5Packet> {
        self.sent_raw()
            .iter()
            .filter_map(|raw| decode_frame(raw))
            .collect()
    }

    pub fn vendor_frames(&self) -> Vec<H5Packet> {
        self.decoded_sent()
            .into_iter()
            .filter(|p| p.packet_type == PacketType::VendorSpecific)
            .collect()
    }

    pub fn raw_vendor_frames(&self) -> Vec<Vec<u8>> {
        self.sent_raw()
            .into_iter()
            .filter(|raw| {
                decode_frame(raw)
                    .map(|p| p.packet_type == PacketType::VendorSpecific)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Poll until the link has transmitted a frame matching `pred`
    pub fn wait_for<F>(&self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(&H5Packet) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if self.decoded_sent().iter().any(&pred) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

pub fn decode_frame(raw: &[u8]) -> Option<H5Packet> {
    let payload = slip::decode(raw).ok()?;
    h5::decode(&payload).ok()
}

pub fn is_link_control(packet: &H5Packet, payload_prefix: &[u8]) -> bool {
    packet.packet_type == PacketType::LinkControl && packet.payload.starts_with(payload_prefix)
}

// ----------------------------------------------------------------------
// Scripted peer
// ----------------------------------------------------------------------

/// What the background peer does with the link's traffic
#[derive(Clone, Copy)]
pub struct PeerBehavior {
    /// Answer SYNC and SYNC_CONFIG so the link can reach ACTIVE
    pub establish: bool,
    /// Acknowledge the n-th transmission of each reliable packet;
    /// `None` never acknowledges
    pub ack_on_attempt: Option<usize>,
}

impl PeerBehavior {
    pub fn establish_only() -> Self {
        Self {
            establish: true,
            ack_on_attempt: None,
        }
    }

    pub fn cooperative() -> Self {
        Self {
            establish: true,
            ack_on_attempt: Some(1),
        }
    }
}

/// Background thread reacting to link traffic like a controller would
pub struct Responder {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Responder {
    pub fn spawn(peer: PeerHandle, behavior: PeerBehavior) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            let mut cursor = 0usize;
            let mut config_pushed = false;
            let mut attempts: HashMap<u8, usize> = HashMap::new();

            while !stop_flag.load(Ordering::SeqCst) {
                for raw in peer.sent_since(&mut cursor) {
                    let Some(packet) = decode_frame(&raw) else {
                        continue;
                    };
                    match packet.packet_type {
                        PacketType::LinkControl if behavior.establish => {
                            if packet.payload.starts_with(&SYNC_PAYLOAD) {
                                peer.inject_link_control(&SYNC_RESPONSE_PAYLOAD);
                            } else if packet.payload.starts_with(&SYNC_CONFIG_PAYLOAD[..2]) {
                                peer.inject_link_control(&SYNC_CONFIG_RESPONSE_PAYLOAD);
                                if !config_pushed {
                                    config_pushed = true;
                                    peer.inject_link_control(&SYNC_CONFIG_PAYLOAD);
                                }
                            }
                        }
                        PacketType::VendorSpecific if packet.reliable => {
                            if let Some(n) = behavior.ack_on_attempt {
                                let count = attempts.entry(packet.seq).or_insert(0);
                                *count += 1;
                                if *count == n {
                                    *count = 0;
                                    peer.inject_ack((packet.seq + 1) & 0x07);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ----------------------------------------------------------------------
// Recording link delegate
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct TestDelegate {
    pub data: Mutex<Vec<Vec<u8>>>,
    pub events: Mutex<Vec<LinkEvent>>,
    pub errors: Mutex<Vec<TransportError>>,
}

impl TestDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data_count(&self) -> usize {
        self.data.lock().len()
    }

    pub fn wait_for_data(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.data_count() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl LinkDelegate for TestDelegate {
    fn on_data(&self, payload: &[u8]) {
        self.data.lock().push(payload.to_vec());
    }

    fn on_event(&self, event: LinkEvent) {
        self.events.lock().push(event);
    }

    fn on_error(&self, error: TransportError) {
        self.errors.lock().push(error);
    }
}
