//! The link state machine and reliable-transmission engine
//!
//! One worker thread walks the establishment states; the transport's
//! delivery thread decodes inbound frames and flips exit-criteria flags;
//! application threads block in `open`, `send` and `wait_for_state` on
//! condition variables with absolute deadlines.

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};

use super::criteria::ExitCriteria;
use super::{
    H5LinkConfig, LinkError, LinkEvent, LinkState, OPEN_WAIT_TIMEOUT, SEQ_MASK,
    SYNC_CONFIG_PAYLOAD, SYNC_CONFIG_RESPONSE_PAYLOAD, SYNC_PAYLOAD, SYNC_RESPONSE_PAYLOAD,
    SYNC_RETRANSMISSION, SYNC_TIMEOUT,
};
use crate::codec::h5::{self, H5Packet, PacketType};
use crate::codec::slip;
use crate::reassembly::Reassembler;
use crate::transport::{Transport, TransportDelegate, TransportError};

/// Callback interface for link events, the upward face of the layer
pub trait LinkDelegate: Send + Sync {
    /// A reliable payload arrived, in peer transmission order
    fn on_data(&self, payload: &[u8]);
    /// Out-of-band link notification
    fn on_event(&self, event: LinkEvent);
    /// The lower transport reported an error; fatal errors also drive the
    /// link to FAILED
    fn on_error(&self, error: TransportError);
}

/// Packet statistics since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub incoming_packets: u64,
    pub outgoing_packets: u64,
    pub error_packets: u64,
}

/// The 3-bit sequence window and the retained in-flight frame
#[derive(Default)]
struct Window {
    /// Next outbound sequence number; advanced on acknowledgement
    seq: u8,
    /// Next expected inbound sequence number; advanced on delivery
    ack: u8,
    /// The encoded reliable frame awaiting acknowledgement
    last_packet: Option<Vec<u8>>,
}

struct LinkInner {
    config: H5LinkConfig,
    transport: Mutex<Box<dyn Transport>>,

    /// Exit criteria of the state currently executing; the "sync" pair
    criteria: Mutex<ExitCriteria>,
    sync_cond: Condvar,

    /// Current state, for `wait_for_state` observers
    state: Mutex<LinkState>,
    state_cond: Condvar,

    /// Sequence window; the "ack" pair
    window: Mutex<Window>,
    ack_cond: Condvar,

    /// Serializes callers of `send`: the window holds one packet
    send_slot: Mutex<()>,

    reassembler: Mutex<Reassembler>,
    delegate: RwLock<Option<Arc<dyn LinkDelegate>>>,
    run_state_machine: AtomicBool,

    incoming_packets: AtomicU64,
    outgoing_packets: AtomicU64,
    error_packets: AtomicU64,
}

/// Three-Wire UART link layer over a byte transport
pub struct H5Link {
    inner: Arc<LinkInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl H5Link {
    /// Wrap a byte transport. The link stays in START until `open`.
    pub fn new(transport: Box<dyn Transport>, config: H5LinkConfig) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                transport: Mutex::new(transport),
                criteria: Mutex::new(ExitCriteria::Inert),
                sync_cond: Condvar::new(),
                state: Mutex::new(LinkState::Start),
                state_cond: Condvar::new(),
                window: Mutex::new(Window::default()),
                ack_cond: Condvar::new(),
                send_slot: Mutex::new(()),
                reassembler: Mutex::new(Reassembler::new()),
                delegate: RwLock::new(None),
                run_state_machine: AtomicBool::new(false),
                incoming_packets: AtomicU64::new(0),
                outgoing_packets: AtomicU64::new(0),
                error_packets: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the state machine, open the lower transport and wait for the
    /// link to become ACTIVE.
    pub fn open(&self, delegate: Arc<dyn LinkDelegate>) -> Result<(), LinkError> {
        if self.inner.run_state_machine.swap(true, Ordering::SeqCst) {
            return Err(LinkError::InvalidState(self.state()));
        }
        let state = self.state();
        if state != LinkState::Start {
            self.inner.run_state_machine.store(false, Ordering::SeqCst);
            return Err(LinkError::InvalidState(state));
        }

        *self.inner.delegate.write() = Some(delegate);
        self.inner.window.lock().last_packet = None;
        *self.inner.criteria.lock() = ExitCriteria::for_state(LinkState::Start);

        let worker_inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("h5-state-machine".into())
            .spawn(move || state_machine_worker(worker_inner))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        *self.worker.lock() = Some(handle);

        let delivery: Arc<dyn TransportDelegate> = Arc::new(DeliveryHandle {
            inner: Arc::downgrade(&self.inner),
        });
        let opened = self.inner.transport.lock().open(delivery);
        match opened {
            Ok(()) => {
                self.inner.criteria.lock().note_opened();
                self.inner.sync_cond.notify_all();
            }
            Err(e) => {
                self.inner.raise_io_error();
                return Err(e.into());
            }
        }

        if self.wait_for_state(LinkState::Active, OPEN_WAIT_TIMEOUT) {
            Ok(())
        } else {
            Err(LinkError::Timeout)
        }
    }

    /// Transmit a reliable payload and block until the peer acknowledges
    /// it or the retransmission budget is spent.
    pub fn send(&self, payload: &[u8]) -> Result<(), LinkError> {
        let _slot = self.inner.send_slot.lock();

        let state = self.state();
        if state != LinkState::Active {
            return Err(LinkError::InvalidState(state));
        }

        let mut window = self.inner.window.lock();
        let h5_frame = h5::encode(
            payload,
            window.seq,
            window.ack,
            true,
            true,
            PacketType::VendorSpecific,
        )?;
        let initial_seq = window.seq;
        debug!(
            "-> VENDOR_SPECIFIC reliable seq:{} ack:{} len:{}",
            window.seq,
            window.ack,
            payload.len()
        );
        window.last_packet = Some(slip::encode(&h5_frame));

        for _ in 0..SYNC_RETRANSMISSION {
            let pending = match &window.last_packet {
                Some(frame) => frame.clone(),
                // The dispatcher consumed the acknowledgement and released
                // the buffer
                None => return Ok(()),
            };
            let sent = MutexGuard::unlocked(&mut window, || self.inner.send_raw(&pending));
            if let Err(e) = sent {
                window.last_packet = None;
                return Err(e.into());
            }

            let deadline = Instant::now() + self.inner.config.retransmission_timeout;
            loop {
                if window.seq != initial_seq {
                    window.last_packet = None;
                    return Ok(());
                }
                if self
                    .inner
                    .ack_cond
                    .wait_until(&mut window, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }

        window.last_packet = None;
        Err(LinkError::Timeout)
    }

    /// Stop the state machine and close the lower transport
    pub fn close(&self) -> Result<(), LinkError> {
        self.inner.criteria.lock().note_close();
        self.inner.run_state_machine.store(false, Ordering::SeqCst);
        self.inner.sync_cond.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            // A delegate callback running on the worker may close the link;
            // joining would deadlock, so the worker is left to unwind on
            // its own in that case.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        *self.inner.delegate.write() = None;
        self.inner.transport.lock().close().map_err(LinkError::from)
    }

    /// The state the machine is currently in
    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    /// Block until the machine reaches `target`, or `timeout` elapses.
    /// Returns whether the state was reached.
    pub fn wait_for_state(&self, target: LinkState, timeout: std::time::Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while *state != target {
            if self
                .inner
                .state_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        *state == target
    }

    /// Packet statistics since construction
    pub fn counters(&self) -> LinkCounters {
        LinkCounters {
            incoming_packets: self.inner.incoming_packets.load(Ordering::Relaxed),
            outgoing_packets: self.inner.outgoing_packets.load(Ordering::Relaxed),
            error_packets: self.inner.error_packets.load(Ordering::Relaxed),
        }
    }
}

/// Forwards transport callbacks into the link without keeping it alive
struct DeliveryHandle {
    inner: Weak<LinkInner>,
}

impl TransportDelegate for DeliveryHandle {
    fn on_data(&self, data: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_transport_data(data);
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_transport_error(error);
        }
    }
}

impl LinkInner {
    fn run(&self) -> bool {
        self.run_state_machine.load(Ordering::SeqCst)
    }

    fn current_state(&self) -> LinkState {
        *self.state.lock()
    }

    fn enter_state(&self, next: LinkState) {
        *self.criteria.lock() = ExitCriteria::for_state(next);
        let mut state = self.state.lock();
        *state = next;
        self.state_cond.notify_all();
    }

    fn raise_io_error(&self) {
        self.criteria.lock().note_io_error();
        self.sync_cond.notify_all();
    }

    fn raise_sync_error(&self) {
        self.criteria.lock().note_sync_error();
        self.sync_cond.notify_all();
    }

    fn notify_event(&self, event: LinkEvent) {
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_event(event);
        }
    }

    // ------------------------------------------------------------------
    // State actions, executed by the worker thread
    // ------------------------------------------------------------------

    /// Common post-wait evaluation: errors first, then close, then the
    /// state's success flags.
    fn resolve(&self, crit: &ExitCriteria, success: LinkState) -> LinkState {
        if crit.io_error() {
            LinkState::Failed
        } else if crit.close_requested() || !self.run() {
            LinkState::Start
        } else if crit.is_fulfilled() {
            success
        } else {
            LinkState::Failed
        }
    }

    /// START: nothing to transmit yet; wait for the channel to come up
    fn start_action(&self) -> LinkState {
        let mut crit = self.criteria.lock();
        while !crit.is_fulfilled() && self.run() {
            self.sync_cond.wait(&mut crit);
        }
        self.resolve(&crit, LinkState::Reset)
    }

    /// RESET: force the peer into a known state, then hold still for one
    /// sync timeout so its response window passes
    fn reset_action(&self) -> LinkState {
        if self.send_reset().is_ok() {
            self.notify_event(LinkEvent::ResetPerformed);
        }
        let mut crit = self.criteria.lock();
        crit.note_reset_sent();
        if !crit.io_error() && !crit.close_requested() && self.run() {
            let deadline = Instant::now() + SYNC_TIMEOUT;
            let _ = self.sync_cond.wait_until(&mut crit, deadline);
        }
        self.resolve(&crit, LinkState::Uninitialized)
    }

    /// UNINITIALIZED: repeat SYNC until the peer answers with
    /// SYNC_RESPONSE
    fn uninitialized_action(&self) -> LinkState {
        let mut crit = self.criteria.lock();
        let mut attempts = SYNC_RETRANSMISSION;
        while !crit.is_fulfilled() && attempts > 0 && self.run() {
            attempts -= 1;
            MutexGuard::unlocked(&mut crit, || {
                let _ = self.send_link_control(&SYNC_PAYLOAD);
            });
            crit.note_sync_sent();
            let deadline = Instant::now() + SYNC_TIMEOUT;
            while !crit.is_fulfilled() && self.run() {
                if self.sync_cond.wait_until(&mut crit, deadline).timed_out() {
                    break;
                }
            }
        }
        self.resolve(&crit, LinkState::Initialized)
    }

    /// INITIALIZED: exchange configuration both ways; the peer must see
    /// our SYNC_CONFIG and we must see (and answer) theirs
    fn initialized_action(&self) -> LinkState {
        let _ = self.send_link_control(&SYNC_CONFIG_PAYLOAD);
        let mut crit = self.criteria.lock();
        crit.note_config_sent();
        let mut retransmissions = SYNC_RETRANSMISSION;
        'wait: loop {
            if crit.is_fulfilled() || !self.run() {
                break;
            }
            let deadline = Instant::now() + SYNC_TIMEOUT;
            loop {
                if crit.is_fulfilled() || !self.run() {
                    break 'wait;
                }
                if self.sync_cond.wait_until(&mut crit, deadline).timed_out() {
                    break;
                }
            }
            if retransmissions == 0 {
                break;
            }
            retransmissions -= 1;
            MutexGuard::unlocked(&mut crit, || {
                let _ = self.send_link_control(&SYNC_CONFIG_PAYLOAD);
            });
        }
        self.resolve(&crit, LinkState::Active)
    }

    /// ACTIVE: zero the window, then wait for whatever ends the session
    fn active_action(&self) -> LinkState {
        {
            let mut window = self.window.lock();
            window.seq = 0;
            window.ack = 0;
        }
        let mut crit = self.criteria.lock();
        while !crit.is_fulfilled() && self.run() {
            self.sync_cond.wait(&mut crit);
        }
        // Peer restart and sequence violations both re-establish
        self.resolve(&crit, LinkState::Reset)
    }

    // ------------------------------------------------------------------
    // Inbound dispatch, executed on the transport's delivery thread
    // ------------------------------------------------------------------

    fn on_transport_data(&self, data: &[u8]) {
        let frames = self.reassembler.lock().push(data);
        for frame in frames {
            self.process_packet(&frame);
        }
    }

    fn on_transport_error(&self, error: TransportError) {
        if error.is_fatal() {
            self.raise_io_error();
        }
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.on_error(error);
        }
    }

    fn process_packet(&self, frame: &[u8]) {
        let slip_payload = match slip::decode(frame) {
            Ok(p) => p,
            Err(e) => {
                self.error_packets.fetch_add(1, Ordering::Relaxed);
                debug!("dropping frame: {e}");
                return;
            }
        };
        let packet = match h5::decode(&slip_payload) {
            Ok(p) => p,
            Err(e) => {
                self.error_packets.fetch_add(1, Ordering::Relaxed);
                debug!("dropping frame: {e}");
                return;
            }
        };
        self.incoming_packets.fetch_add(1, Ordering::Relaxed);
        debug!("<- {packet}");

        if self.current_state() == LinkState::Reset {
            // Nothing is expected here, but a disturbed peer ends the
            // quiet period early
            self.sync_cond.notify_all();
            return;
        }

        match packet.packet_type {
            PacketType::LinkControl => self.handle_link_control(&packet),
            PacketType::VendorSpecific => self.handle_vendor(&packet),
            PacketType::Ack => self.handle_ack(&packet),
            _ => {}
        }
    }

    fn handle_link_control(&self, packet: &H5Packet) {
        let payload = &packet.payload;
        if payload.len() < 2 {
            return;
        }
        let is_sync = payload.starts_with(&SYNC_PAYLOAD);
        let is_sync_rsp = payload.starts_with(&SYNC_RESPONSE_PAYLOAD);
        let is_config = payload.starts_with(&SYNC_CONFIG_PAYLOAD[..2]);
        let is_config_rsp = payload.starts_with(&SYNC_CONFIG_RESPONSE_PAYLOAD[..2]);

        match self.current_state() {
            LinkState::Uninitialized => {
                if is_sync_rsp {
                    self.criteria.lock().note_sync_rsp_received();
                    self.sync_cond.notify_all();
                }
                if is_sync {
                    let _ = self.send_link_control(&SYNC_RESPONSE_PAYLOAD);
                }
            }
            LinkState::Initialized => {
                if is_config_rsp {
                    self.criteria.lock().note_config_rsp_received();
                    self.sync_cond.notify_all();
                }
                if is_config {
                    let _ = self.send_link_control(&SYNC_CONFIG_RESPONSE_PAYLOAD);
                    let mut crit = self.criteria.lock();
                    crit.note_config_received();
                    crit.note_config_rsp_sent();
                    drop(crit);
                    self.sync_cond.notify_all();
                }
                if is_sync {
                    let _ = self.send_link_control(&SYNC_RESPONSE_PAYLOAD);
                }
            }
            LinkState::Active => {
                if is_sync {
                    self.criteria.lock().note_sync_received();
                    self.sync_cond.notify_all();
                    self.notify_event(LinkEvent::PeerRestart);
                }
            }
            _ => {}
        }
    }

    fn handle_vendor(&self, packet: &H5Packet) {
        if self.current_state() != LinkState::Active || !packet.reliable {
            return;
        }

        let delivered_ack = {
            let mut window = self.window.lock();
            if packet.seq == window.ack {
                window.ack = (window.ack + 1) & SEQ_MASK;
                Some(window.ack)
            } else {
                None
            }
        };

        match delivered_ack {
            Some(ack) => {
                let _ = self.send_ack_packet(ack);
                let delegate = self.delegate.read().clone();
                if let Some(delegate) = delegate {
                    delegate.on_data(&packet.payload);
                }
            }
            None => {
                warn!("sequence violation: got seq {} and cannot recover", packet.seq);
                self.raise_sync_error();
            }
        }
    }

    fn handle_ack(&self, packet: &H5Packet) {
        if self.current_state() != LinkState::Active {
            return;
        }

        let mut window = self.window.lock();
        let expected = (window.seq + 1) & SEQ_MASK;
        if packet.ack == expected {
            window.seq = expected;
            window.last_packet = None;
            self.ack_cond.notify_all();
        } else if packet.ack == window.seq {
            // Echo of an acknowledgement already consumed; drop it
        } else {
            drop(window);
            warn!("invalid acknowledgement number {}", packet.ack);
            self.raise_sync_error();
        }
    }

    // ------------------------------------------------------------------
    // Outbound helpers
    // ------------------------------------------------------------------

    fn send_link_control(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.send_packet(PacketType::LinkControl, payload, 0)
    }

    fn send_reset(&self) -> Result<(), TransportError> {
        self.send_packet(PacketType::Reset, &[], 0)
    }

    fn send_ack_packet(&self, ack: u8) -> Result<(), TransportError> {
        self.send_packet(PacketType::Ack, &[], ack)
    }

    /// Encode and transmit a non-reliable packet
    fn send_packet(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        ack: u8,
    ) -> Result<(), TransportError> {
        let h5_frame = match h5::encode(payload, 0, ack, false, false, packet_type) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping outbound packet: {e}");
                return Err(TransportError::Io(e.to_string()));
            }
        };
        match h5::link_control_name(payload) {
            Some(name) => debug!("-> {packet_type} [{name}]"),
            None => debug!("-> {packet_type} ack:{ack}"),
        }
        self.send_raw(&slip::encode(&h5_frame))
    }

    fn send_raw(&self, frame: &[u8]) -> Result<(), TransportError> {
        let result = self.transport.lock().send(frame);
        match result {
            Ok(()) => {
                self.outgoing_packets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!("transport send failed: {e}");
                if e.is_fatal() {
                    self.raise_io_error();
                }
                Err(e)
            }
        }
    }
}

/// Worker: one state action at a time until FAILED or shutdown
fn state_machine_worker(inner: Arc<LinkInner>) {
    loop {
        let state = inner.current_state();
        if state == LinkState::Failed || !inner.run() {
            break;
        }
        let next = match state {
            LinkState::Start => inner.start_action(),
            LinkState::Reset => inner.reset_action(),
            LinkState::Uninitialized => inner.uninitialized_action(),
            LinkState::Initialized => inner.initialized_action(),
            LinkState::Active => inner.active_action(),
            LinkState::Failed | LinkState::Unknown => break,
        };
        debug!("link state {state} -> {next}");
        inner.enter_state(next);
    }
}
