//! Coordinator behaviour over the in-process radio medium
//!
//! Runs on a paused clock so tick cadence, jitter and the Safe burst complete
//! instantly and deterministically.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use futures::FutureExt;
use sos_mesh::config::{MeshConfig, StoreConfig};
use sos_mesh::core::codec::{decode, encode, WireProfile};
use sos_mesh::core::packet::{SosPacket, Status, UniqueId};
use sos_mesh::error::{MeshError, RadioError};
use sos_mesh::mesh::{ErrorEvent, MeshCoordinator, MeshHandle, PacketEvent, StateEvent};
use sos_mesh::radio::{MemoryEther, MemoryRadio};
use sos_mesh::store::{PacketStore, StoreHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

struct Device {
    radio: MemoryRadio,
    store: StoreHandle,
    mesh: MeshHandle,
}

async fn device(ether: &MemoryEther, name: &str) -> Device {
    device_with(ether, name, MeshConfig::default()).await
}

async fn device_with(ether: &MemoryEther, name: &str, config: MeshConfig) -> Device {
    let radio = ether.join(name);
    let store = PacketStore::new(StoreConfig::in_memory())
        .initialize()
        .await
        .unwrap();
    let mesh = MeshCoordinator::new(config, store.clone(), Arc::new(radio.clone()))
        .start()
        .await
        .unwrap();
    radio.attach(mesh.radio_sink());
    Device { radio, store, mesh }
}

fn frame(user: u32, seq: u16, status: Status) -> Bytes {
    encode(
        &SosPacket::new(user, seq, 37.7749, -122.4194, status),
        WireProfile::Legacy,
    )
}

async fn next<T: Clone + Send + 'static>(stream: &mut BroadcastStream<T>) -> T {
    timeout(Duration::from_secs(60), stream.next())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
        .expect("subscriber lagged")
}

/// Nothing is waiting in `stream` right now
fn quiet<T: Clone + Send + 'static>(stream: &mut BroadcastStream<T>) -> bool {
    stream.next().now_or_never().is_none()
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_verification_scenario() {
    let ether = MemoryEther::new();
    let b = device(&ether, "B").await;
    let mut packets = b.mesh.subscribe_packets();
    let sos = frame(1, 1, Status::Sos);

    // First sighting, relayed by A itself
    b.mesh.on_packet_received(sos.clone(), -55, "A").await.unwrap();
    match next(&mut packets).await {
        PacketEvent::Alert {
            packet, verified, ..
        } => {
            assert_eq!(packet.user_id, 1);
            assert_eq!(packet.sequence, 1);
            assert_eq!(packet.rssi, Some(-55));
            assert!(!verified);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let queue = b.mesh.relay_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].packet.user_id, 1);
    assert!(!b.mesh.is_verified(1).await.unwrap());

    // The same bytes relayed by C: a store duplicate, but a second confirmation
    b.mesh.on_packet_received(sos.clone(), -70, "C").await.unwrap();
    let stats = b.mesh.stats().await.unwrap();
    assert_eq!(stats.counters.duplicates, 1);
    assert_eq!(stats.handshake_count, 1);
    assert!(!b.mesh.is_verified(1).await.unwrap());

    // A third distinct neighbour reaches the quorum
    b.mesh.on_packet_received(sos, -80, "D").await.unwrap();
    assert!(b.mesh.is_verified(1).await.unwrap());
    assert_eq!(
        next(&mut packets).await,
        PacketEvent::Verified {
            user_id: 1,
            confirmations: 3
        }
    );
    assert_eq!(b.mesh.relay_queue().await.unwrap().len(), 1);
    assert_eq!(b.mesh.stats().await.unwrap().verified_count, 1);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_scan_repeat_dropped_before_store() {
    let ether = MemoryEther::new();
    let b = device(&ether, "B").await;
    let sos = frame(3, 1, Status::Trapped);

    // Through the radio callback path this time
    assert!(b.radio.inject(sos.clone(), "A"));
    assert!(b.radio.inject(sos, "A"));

    let stats = b.mesh.stats().await.unwrap();
    assert_eq!(stats.counters.scan_repeats, 1);
    assert_eq!(stats.counters.duplicates, 0);
    assert_eq!(stats.counters.frames_received, 2);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_echo_and_self_exclusion() {
    let ether = MemoryEther::new();
    let a = device(&ether, "A").await;
    let mut packets = a.mesh.subscribe_packets();
    let me = a.mesh.local_user_id();

    a.mesh
        .on_packet_received(frame(me, 1, Status::Sos), -50, "B")
        .await
        .unwrap();

    assert_eq!(next(&mut packets).await, PacketEvent::Echo { count: 1 });
    let stats = a.mesh.stats().await.unwrap();
    assert_eq!(stats.echo_count, 1);
    assert_eq!(stats.handshake_count, 0);
    assert!(a.mesh.relay_queue().await.unwrap().is_empty());
    assert!(a.store.active_packets().await.unwrap().is_empty());

    a.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_safe_kills_propagation() {
    let ether = MemoryEther::new();
    let b = device(&ether, "B").await;
    let mut packets = b.mesh.subscribe_packets();

    b.mesh
        .on_packet_received(frame(5, 1, Status::Injured), -60, "X")
        .await
        .unwrap();
    assert!(matches!(next(&mut packets).await, PacketEvent::Alert { .. }));
    assert_eq!(b.mesh.relay_queue().await.unwrap().len(), 1);

    b.mesh
        .on_packet_received(frame(5, 2, Status::Safe), -60, "X")
        .await
        .unwrap();
    match next(&mut packets).await {
        PacketEvent::SafeAnnounced { packet } => assert_eq!(packet.unique_id(), UniqueId::new(5, 2)),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(b.mesh.relay_queue().await.unwrap().is_empty());

    // Stale activity is ignored, newer activity is stored but not relayed
    b.mesh
        .on_packet_received(frame(5, 1, Status::Injured), -60, "Y")
        .await
        .unwrap();
    b.mesh
        .on_packet_received(frame(5, 3, Status::Sos), -60, "Z")
        .await
        .unwrap();
    assert!(b.mesh.relay_queue().await.unwrap().is_empty());
    assert_eq!(b.mesh.stats().await.unwrap().counters.safe_received, 1);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_alerts_after_safe_never_verify() {
    let ether = MemoryEther::new();
    let b = device(&ether, "B").await;
    let mut packets = b.mesh.subscribe_packets();

    b.mesh
        .on_packet_received(frame(5, 1, Status::Sos), -60, "X")
        .await
        .unwrap();
    b.mesh
        .on_packet_received(frame(5, 2, Status::Safe), -60, "X")
        .await
        .unwrap();
    assert!(matches!(next(&mut packets).await, PacketEvent::Alert { .. }));
    assert!(matches!(
        next(&mut packets).await,
        PacketEvent::SafeAnnounced { .. }
    ));

    // Neighbours that missed the Safe keep relaying the old alert
    for neighbour in ["P", "Q", "R"] {
        b.mesh
            .on_packet_received(frame(5, 1, Status::Sos), -60, neighbour)
            .await
            .unwrap();
    }

    assert!(!b.mesh.is_verified(5).await.unwrap());
    assert!(quiet(&mut packets), "no alert or verification after safe");
    let stats = b.mesh.stats().await.unwrap();
    assert_eq!(stats.verified_count, 0);
    assert_eq!(stats.queue_len, 0);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_private_message_keeps_sender_alert() {
    let ether = MemoryEther::new();
    let b = device(&ether, "B").await;
    let me = b.mesh.local_user_id();
    let elsewhere = me.wrapping_add(1).max(1);
    let mut packets = b.mesh.subscribe_packets();

    b.mesh
        .on_packet_received(frame(7, 1, Status::Trapped), -60, "X")
        .await
        .unwrap();
    let private = SosPacket::new(7, 2, 1.0, 2.0, Status::Sos).with_target(elsewhere);
    b.mesh
        .on_packet_received(encode(&private, WireProfile::Extended), -60, "X")
        .await
        .unwrap();

    assert!(matches!(next(&mut packets).await, PacketEvent::Alert { .. }));
    assert!(quiet(&mut packets), "someone else's message is not surfaced");

    // Both are relayed, the broadcast keeps its own slot
    let slots: Vec<(u16, u32)> = b
        .mesh
        .relay_queue()
        .await
        .unwrap()
        .iter()
        .map(|e| (e.packet.sequence, e.packet.target_id))
        .collect();
    assert_eq!(slots, vec![(1, 0), (2, elsewhere)]);

    let latest = b.store.latest_for(7).await.unwrap().unwrap();
    assert_eq!(latest.packet.unique_id(), UniqueId::new(7, 1));
    let active = b.store.active_packets().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].packet.target_id, 0);
    let unsynced = b.store.unsynced_packets().await.unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0].packet.target_id, 0);

    // The alert heard again from elsewhere still confirms it
    b.mesh
        .on_packet_received(frame(7, 1, Status::Trapped), -60, "Y")
        .await
        .unwrap();
    assert_eq!(b.mesh.relay_queue().await.unwrap()[0].packet.sequence, 1);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_targeted_packets() {
    let ether = MemoryEther::new();
    let b = device(&ether, "B").await;
    let me = b.mesh.local_user_id();
    let mut packets = b.mesh.subscribe_packets();

    // Addressed to someone else: relayed silently
    let other = SosPacket::new(8, 1, 1.0, 2.0, Status::SuppliesNeeded).with_target(me.wrapping_add(1).max(1));
    b.mesh
        .on_packet_received(encode(&other, WireProfile::Legacy), -60, "X")
        .await
        .unwrap();
    let queue = b.mesh.relay_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert!(quiet(&mut packets), "targeted packets for others are not surfaced");

    // Addressed to us: surfaced, not relayed further
    let mine = SosPacket::new(9, 1, 1.0, 2.0, Status::Medical).with_target(me);
    b.mesh
        .on_packet_received(encode(&mine, WireProfile::Extended), -60, "X")
        .await
        .unwrap();
    match next(&mut packets).await {
        PacketEvent::Alert { packet, .. } => assert_eq!(packet.target_id, me),
        other => panic!("unexpected event {other:?}"),
    }
    let queue = b.mesh.relay_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].packet.user_id, 8);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_decode_failure_is_reported() {
    let ether = MemoryEther::new();
    let b = device(&ether, "B").await;
    let mut errors = b.mesh.subscribe_errors();

    b.mesh
        .on_packet_received(Bytes::from_static(b"\x12\x34garbage"), -90, "X")
        .await
        .unwrap();

    assert!(matches!(next(&mut errors).await, ErrorEvent::Decode(_)));
    assert_eq!(b.mesh.stats().await.unwrap().counters.decode_failures, 1);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_congestion_drop_event() {
    let ether = MemoryEther::new();
    let config = MeshConfig::default_with_overrides(|c| c.relay.queue_ceiling = 2);
    let b = device_with(&ether, "B", config).await;
    let mut errors = b.mesh.subscribe_errors();

    for user in 1..=3 {
        b.mesh
            .on_packet_received(frame(user, 1, Status::Sos), -60, "X")
            .await
            .unwrap();
    }

    assert_eq!(
        next(&mut errors).await,
        ErrorEvent::CongestionDrop(UniqueId::new(1, 1))
    );
    let users: Vec<u32> = b
        .mesh
        .relay_queue()
        .await
        .unwrap()
        .iter()
        .map(|e| e.packet.user_id)
        .collect();
    assert_eq!(users, vec![2, 3]);

    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_commands_rejected() {
    let ether = MemoryEther::new();
    let a = device(&ether, "A").await;

    assert!(matches!(
        a.mesh.start_broadcasting(1.0, 2.0, Status::Safe).await,
        Err(MeshError::InvalidArgument(_))
    ));
    assert!(matches!(
        a.mesh.send_targeted_message(0, 1.0, 2.0, Status::Sos).await,
        Err(MeshError::InvalidArgument(_))
    ));
    assert_eq!(a.mesh.stop_broadcasting().await.unwrap(), None);

    a.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_radio_failure_is_not_fatal() {
    let ether = MemoryEther::new();
    let a = device(&ether, "A").await;
    let mut errors = a.mesh.subscribe_errors();

    a.radio
        .fail_next(RadioError::Unavailable("permission revoked".into()));
    let packet = a
        .mesh
        .start_broadcasting(37.7749, -122.4194, Status::Sos)
        .await
        .expect("a failed transmit does not fail the command");

    assert!(matches!(
        next(&mut errors).await,
        ErrorEvent::RadioUnavailable(_)
    ));
    let stats = a.mesh.stats().await.unwrap();
    assert!(stats.broadcasting);
    assert_eq!(stats.counters.transmit_failures, 1);

    // The tick loop retries
    sleep(Duration::from_secs(3)).await;
    let stats = a.mesh.stats().await.unwrap();
    assert!(stats.counters.transmissions >= 1);
    let last = a.radio.transmitted().pop().unwrap();
    assert_eq!(decode(&last).unwrap().unique_id(), packet.unique_id());

    a.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_broadcasting_sends_safe_burst() {
    let ether = MemoryEther::new();
    let a = device(&ether, "A").await;
    let mut state = a.mesh.subscribe_state();

    let sos = a
        .mesh
        .start_broadcasting(37.7749, -122.4194, Status::Trapped)
        .await
        .unwrap();
    assert_eq!(next(&mut state).await, StateEvent::Broadcasting(true));

    let safe = a.mesh.stop_broadcasting().await.unwrap().unwrap();
    assert_eq!(safe.status, Status::Safe);
    assert_eq!(safe.user_id, sos.user_id);
    assert!(safe.sequence > sos.sequence);
    assert_eq!(next(&mut state).await, StateEvent::Broadcasting(false));

    let sent = a.radio.transmitted();
    let burst: Vec<SosPacket> = sent[sent.len() - 3..]
        .iter()
        .map(|b| decode(b).unwrap())
        .collect();
    assert!(burst.iter().all(|p| p.unique_id() == safe.unique_id()));
    assert_eq!(a.store.latest_for(sos.user_id).await.unwrap().unwrap().packet.status, Status::Safe);

    // Nothing left to send, so no further ticks transmit
    let count = sent.len();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(a.radio.transmitted().len(), count);
    assert!(!a.mesh.stats().await.unwrap().broadcasting);

    a.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_alert_follows_safe_burst() {
    let ether = MemoryEther::new();
    let config = MeshConfig::default_with_overrides(|c| {
        c.relay.tick_interval = Duration::from_millis(1000);
        c.relay.jitter_max = Duration::from_millis(900);
    });
    let a = device_with(&ether, "A", config).await;

    a.mesh
        .start_broadcasting(37.7749, -122.4194, Status::Sos)
        .await
        .unwrap();
    // Let a tick schedule a jittered transmit, then stop while it may be pending
    sleep(Duration::from_millis(1001)).await;
    a.mesh.stop_broadcasting().await.unwrap().unwrap();
    sleep(Duration::from_secs(5)).await;

    let statuses: Vec<Status> = a
        .radio
        .transmitted()
        .iter()
        .map(|b| decode(b).unwrap().status)
        .collect();
    let first_safe = statuses
        .iter()
        .position(|s| *s == Status::Safe)
        .expect("safe burst sent");
    assert!(
        statuses[first_safe..].iter().all(|s| *s == Status::Safe),
        "alert transmitted after safe: {statuses:?}"
    );

    a.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_targeted_message_is_private() {
    let ether = MemoryEther::new();
    let a = device(&ether, "A").await;

    let sent = a
        .mesh
        .send_targeted_message(0xBEEF, 1.0, 2.0, Status::Medical)
        .await
        .unwrap();
    assert_eq!(sent.target_id, 0xBEEF);

    let on_air = decode(&a.radio.transmitted()[0]).unwrap();
    assert_eq!(on_air.target_id, 0xBEEF);
    assert!(a.store.unsynced_packets().await.unwrap().is_empty());
    assert!(!a.mesh.stats().await.unwrap().broadcasting);

    a.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_multi_hop_flood() {
    let ether = MemoryEther::new();
    ether.link("A", "B");
    ether.link("B", "C");
    let a = device(&ether, "A").await;
    let b = device(&ether, "B").await;
    let c = device(&ether, "C").await;
    let mut c_packets = c.mesh.subscribe_packets();
    let mut a_packets = a.mesh.subscribe_packets();

    let sos = a
        .mesh
        .start_broadcasting(-33.8688, 151.2093, Status::Sos)
        .await
        .unwrap();

    // C is out of A's range and only hears B's relay
    match next(&mut c_packets).await {
        PacketEvent::Alert { packet, source, .. } => {
            assert_eq!(packet.unique_id(), sos.unique_id());
            assert_eq!(source.as_str(), "B");
        }
        other => panic!("unexpected event {other:?}"),
    }
    // A hears its own packet bounced back by B
    assert!(matches!(next(&mut a_packets).await, PacketEvent::Echo { .. }));

    let active = c.store.active_packets().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].packet.user_id, sos.user_id);
    assert_eq!(b.mesh.stats().await.unwrap().handshake_count, 1);

    for d in [&a, &b, &c] {
        d.mesh.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_radio_availability_events() {
    let ether = MemoryEther::new();
    let a = device(&ether, "A").await;
    let mut state = a.mesh.subscribe_state();

    a.radio.set_available(false);
    assert_eq!(next(&mut state).await, StateEvent::RadioAvailability(false));
    assert!(!a.mesh.stats().await.unwrap().radio_available);

    a.radio.set_available(true);
    assert_eq!(next(&mut state).await, StateEvent::RadioAvailability(true));
    assert!(a.radio.is_scanning());

    a.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let ether = MemoryEther::new();
    let a = device(&ether, "A").await;
    a.mesh.start_broadcasting(1.0, 2.0, Status::Sos).await.unwrap();

    a.mesh.shutdown().await;
    assert!(!a.mesh.is_running());
    assert!(!a.radio.is_scanning());
    assert!(a.radio.advertising().is_none());
    assert!(matches!(
        a.mesh.stats().await,
        Err(MeshError::CoordinatorStopped)
    ));

    // Idempotent
    a.mesh.shutdown().await;
}
