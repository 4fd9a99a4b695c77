//! Link establishment over a scripted peer: the full RESET →
//! UNINITIALIZED → INITIALIZED → ACTIVE walk, plus the ways it can fail.

mod common;

use common::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use threewire_core::codec::PacketType;
use threewire_core::link::{SYNC_PAYLOAD, SYNC_RESPONSE_PAYLOAD};
use threewire_core::{H5Link, H5LinkConfig, LinkError, LinkEvent, LinkState, TransportError};

#[test]
fn test_happy_path_link_up() {
    init_tracing();
    let (transport, peer) = mock_pair();
    let link = H5Link::new(Box::new(transport), H5LinkConfig::default());
    let responder = Responder::spawn(peer.clone(), PeerBehavior::establish_only());
    let delegate = TestDelegate::new();

    link.open(delegate.clone()).unwrap();
    assert_eq!(link.state(), LinkState::Active);
    assert!(link.wait_for_state(LinkState::Active, Duration::from_millis(2000)));

    // The establishment dialogue went out in order
    let sent = peer.decoded_sent();
    assert!(sent.iter().any(|p| p.packet_type == PacketType::Reset));
    assert!(sent.iter().any(|p| is_link_control(p, &SYNC_PAYLOAD)));
    assert!(sent
        .iter()
        .any(|p| is_link_control(p, &[0x03, 0xFC])));
    // The peer's SYNC_CONFIG was answered
    assert!(peer.wait_for(
        |p| is_link_control(p, &[0x04, 0x7B]),
        Duration::from_millis(500)
    ));

    let counters = link.counters();
    assert!(counters.outgoing_packets >= 3);
    assert!(counters.incoming_packets >= 3);
    assert_eq!(counters.error_packets, 0);

    responder.stop();
    link.close().unwrap();
    assert_eq!(link.state(), LinkState::Start);
}

#[test]
fn test_open_times_out_without_peer() {
    let (transport, _peer) = mock_pair();
    let link = H5Link::new(Box::new(transport), H5LinkConfig::default());
    let delegate = TestDelegate::new();

    assert_eq!(link.open(delegate), Err(LinkError::Timeout));
    // SYNC went unanswered until the retransmission budget ran out
    assert_eq!(link.state(), LinkState::Failed);
}

#[test]
fn test_open_twice_rejected() {
    let (transport, peer) = mock_pair();
    let link = H5Link::new(Box::new(transport), H5LinkConfig::default());
    let _responder = Responder::spawn(peer, PeerBehavior::establish_only());
    let delegate = TestDelegate::new();

    link.open(delegate.clone()).unwrap();
    assert!(matches!(
        link.open(delegate),
        Err(LinkError::InvalidState(_))
    ));
    link.close().unwrap();
}

#[test]
fn test_peer_sync_answered_during_uninitialized() {
    let (transport, peer) = mock_pair();
    let link = Arc::new(H5Link::new(Box::new(transport), H5LinkConfig::default()));
    let delegate = TestDelegate::new();

    // No cooperating peer: open will eventually time out in the background
    let opener = {
        let link = Arc::clone(&link);
        thread::spawn(move || link.open(delegate))
    };

    assert!(peer.wait_for(
        |p| is_link_control(p, &SYNC_PAYLOAD),
        Duration::from_millis(1000)
    ));
    // A peer that syncs at the same time must be answered
    peer.inject_link_control(&SYNC_PAYLOAD);
    assert!(peer.wait_for(
        |p| is_link_control(p, &SYNC_RESPONSE_PAYLOAD),
        Duration::from_millis(1000)
    ));

    assert_eq!(opener.join().unwrap(), Err(LinkError::Timeout));
}

#[test]
fn test_transport_error_drives_failed() {
    let (transport, peer) = mock_pair();
    let link = H5Link::new(Box::new(transport), H5LinkConfig::default());
    let responder = Responder::spawn(peer.clone(), PeerBehavior::establish_only());
    let delegate = TestDelegate::new();

    link.open(delegate.clone()).unwrap();
    responder.stop();

    peer.inject_error(TransportError::IoResourcesUnavailable("port gone".into()));
    assert!(link.wait_for_state(LinkState::Failed, Duration::from_millis(1000)));

    assert_eq!(
        link.send(&[0x01]),
        Err(LinkError::InvalidState(LinkState::Failed))
    );
    assert!(delegate
        .errors
        .lock()
        .iter()
        .any(|e| matches!(e, TransportError::IoResourcesUnavailable(_))));
}

#[test]
fn test_nonfatal_transport_error_reported_not_fatal() {
    let (transport, peer) = mock_pair();
    let link = H5Link::new(Box::new(transport), H5LinkConfig::default());
    let _responder = Responder::spawn(peer.clone(), PeerBehavior::establish_only());
    let delegate = TestDelegate::new();

    link.open(delegate.clone()).unwrap();
    peer.inject_error(TransportError::Io("transient hiccup".into()));

    // Still ACTIVE after the report
    thread::sleep(Duration::from_millis(50));
    assert_eq!(link.state(), LinkState::Active);
    assert_eq!(delegate.errors.lock().len(), 1);
    link.close().unwrap();
}

#[test]
fn test_peer_restart_returns_to_reset() {
    let (transport, peer) = mock_pair();
    let link = H5Link::new(Box::new(transport), H5LinkConfig::default());
    let responder = Responder::spawn(peer.clone(), PeerBehavior::establish_only());
    let delegate = TestDelegate::new();

    link.open(delegate.clone()).unwrap();
    responder.stop();

    // The controller rebooted and is trying to synchronize again
    peer.inject_link_control(&SYNC_PAYLOAD);
    assert!(link.wait_for_state(LinkState::Reset, Duration::from_millis(1000)));
    assert!(delegate
        .events
        .lock()
        .contains(&LinkEvent::PeerRestart));

    // Until the link is ACTIVE again, sends are refused
    assert!(matches!(
        link.send(&[0x01]),
        Err(LinkError::InvalidState(_))
    ));
}

#[test]
fn test_garbage_frames_counted_and_dropped() {
    let (transport, peer) = mock_pair();
    let link = H5Link::new(Box::new(transport), H5LinkConfig::default());
    let _responder = Responder::spawn(peer.clone(), PeerBehavior::establish_only());
    let delegate = TestDelegate::new();

    link.open(delegate.clone()).unwrap();

    // A delimited frame that is not valid H5
    peer.inject(&[0xC0, 0x01, 0x02, 0x03, 0xC0]);
    // An invalid escape sequence
    peer.inject(&[0xC0, 0xDB, 0x42, 0xC0]);

    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while link.counters().error_packets < 2 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(link.counters().error_packets, 2);
    assert_eq!(link.state(), LinkState::Active);
    assert!(delegate.data.lock().is_empty());
    link.close().unwrap();
}
