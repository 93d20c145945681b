//! Mesh coordinator actor
//!
//! One tokio task owns the relay scheduler, the verification tracker and the
//! counters. Commands from [`MeshHandle`] and events from the radio arrive on
//! a single bounded channel and are processed one at a time, so relay and
//! store state never see two concurrent mutations.
//!
//! Timers live in the same `select!` loop: the relay tick (only while there is
//! something to send) and the expiry sweep. Jittered transmits run in a
//! `JoinSet` owned by the actor and are aborted when it stops.

use bytes::Bytes;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, trace, warn};

use super::events::{ErrorEvent, EventBus, MeshStats, PacketEvent, StateEvent};
use crate::config::{MeshConfig, RelayConfig};
use crate::core::codec::PacketCodec;
use crate::core::packet::{unix_now, SosPacket, Status, UniqueId};
use crate::error::{constants, MeshError, RadioError, Result};
use crate::radio::{PeerAddress, RadioEvent, RadioEventSink, RadioLink};
use crate::relay::{Confirmation, EnqueueOutcome, QueueEntry, RelayScheduler, VerificationTracker};
use crate::store::{SaveOutcome, StoreHandle};
use crate::utils::metrics::{Metrics, Timer};

enum Command {
    StartBroadcasting {
        latitude: f64,
        longitude: f64,
        status: Status,
        reply: oneshot::Sender<Result<SosPacket>>,
    },
    StopBroadcasting {
        reply: oneshot::Sender<Result<Option<SosPacket>>>,
    },
    SendTargeted {
        target_id: u32,
        latitude: f64,
        longitude: f64,
        status: Status,
        reply: oneshot::Sender<Result<SosPacket>>,
    },
    Stats {
        reply: oneshot::Sender<MeshStats>,
    },
    IsVerified {
        user_id: u32,
        reply: oneshot::Sender<bool>,
    },
    RelayQueue {
        reply: oneshot::Sender<Vec<QueueEntry>>,
    },
}

enum Input {
    Command(Command),
    Radio(RadioEvent),
}

/// Unstarted coordinator
pub struct MeshCoordinator {
    config: MeshConfig,
    store: StoreHandle,
    radio: Arc<dyn RadioLink>,
}

impl MeshCoordinator {
    pub fn new(config: MeshConfig, store: StoreHandle, radio: Arc<dyn RadioLink>) -> Self {
        Self {
            config,
            store,
            radio,
        }
    }

    /// Validate configuration, resolve the local identity and spawn the actor.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self))]
    pub async fn start(self) -> Result<MeshHandle> {
        self.config.validate_strict()?;
        let local_user_id = self.store.user_id().await?;

        let relay = self.config.relay.clone();
        let (inputs_tx, inputs_rx) = mpsc::channel(relay.command_buffer);
        let events = EventBus::new(relay.event_buffer);
        let cancel = CancellationToken::new();

        let actor = MeshActor {
            codec: PacketCodec::new(self.config.codec.profile),
            max_age_secs: self.store.config().max_age.as_secs(),
            sweep_interval: self.store.config().sweep_interval,
            scheduler: RelayScheduler::with_settings(
                local_user_id,
                relay.queue_ceiling,
                self.store.config().max_age,
            ),
            verification: VerificationTracker::with_window(
                self.config.verification.threshold,
                self.store.config().max_age,
            ),
            relay,
            store: self.store,
            radio: self.radio,
            local_user_id,
            scan_window: HashSet::new(),
            window_started: Instant::now(),
            metrics: Arc::new(Metrics::new()),
            events: events.clone(),
            transmits: JoinSet::new(),
            broadcasting: false,
            radio_available: true,
            online: false,
        };

        if let Err(e) = actor.radio.start_scanning() {
            actor.radio_failure(e);
        }

        let task = tokio::spawn(actor.run(inputs_rx, cancel.clone()));
        info!(local_user_id, "Mesh coordinator started");

        Ok(MeshHandle {
            inner: Arc::new(HandleInner {
                inputs: inputs_tx,
                events,
                local_user_id,
                cancel: cancel.clone(),
                task: Mutex::new(Some(task)),
                _guard: cancel.drop_guard(),
            }),
        })
    }
}

struct HandleInner {
    inputs: mpsc::Sender<Input>,
    events: EventBus,
    local_user_id: u32,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    // Cancels the actor when the last handle goes away
    _guard: DropGuard,
}

/// Control surface of a running coordinator. Cheap to clone.
#[derive(Clone)]
pub struct MeshHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for MeshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshHandle")
            .field("local_user_id", &self.inner.local_user_id)
            .field("running", &!self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl MeshHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .inputs
            .send(Input::Command(make(tx)))
            .await
            .map_err(|_| MeshError::CoordinatorStopped)?;
        rx.await.map_err(|_| MeshError::CoordinatorStopped)
    }

    pub fn local_user_id(&self) -> u32 {
        self.inner.local_user_id
    }

    /// Begin advertising our own alert. Returns the packet put on air.
    pub async fn start_broadcasting(
        &self,
        latitude: f64,
        longitude: f64,
        status: Status,
    ) -> Result<SosPacket> {
        self.request(|reply| Command::StartBroadcasting {
            latitude,
            longitude,
            status,
            reply,
        })
        .await?
    }

    /// Announce Safe and stop advertising. Returns the Safe packet, or `None`
    /// when nothing was being broadcast.
    pub async fn stop_broadcasting(&self) -> Result<Option<SosPacket>> {
        self.request(|reply| Command::StopBroadcasting { reply }).await?
    }

    /// Send a private message to `target_id`. It is flooded like any other
    /// packet but only surfaced by the recipient, and never synced.
    pub async fn send_targeted_message(
        &self,
        target_id: u32,
        latitude: f64,
        longitude: f64,
        status: Status,
    ) -> Result<SosPacket> {
        self.request(|reply| Command::SendTargeted {
            target_id,
            latitude,
            longitude,
            status,
            reply,
        })
        .await?
    }

    /// Feed a radio event into the coordinator, waiting for queue space
    pub async fn on_radio_event(&self, event: RadioEvent) -> Result<()> {
        self.inner
            .inputs
            .send(Input::Radio(event))
            .await
            .map_err(|_| MeshError::CoordinatorStopped)
    }

    /// Feed a received advertisement into the coordinator
    pub async fn on_packet_received(
        &self,
        bytes: Bytes,
        rssi: i32,
        source: impl Into<PeerAddress>,
    ) -> Result<()> {
        self.on_radio_event(RadioEvent::PacketReceived {
            bytes,
            rssi,
            source: source.into(),
        })
        .await
    }

    /// Non-blocking sink for radio callbacks
    pub fn radio_sink(&self) -> Arc<dyn RadioEventSink> {
        Arc::new(CoordinatorSink {
            inputs: self.inner.inputs.clone(),
        })
    }

    pub async fn stats(&self) -> Result<MeshStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn is_verified(&self, user_id: u32) -> Result<bool> {
        self.request(|reply| Command::IsVerified { user_id, reply })
            .await
    }

    /// Relay candidates in insertion order
    pub async fn relay_queue(&self) -> Result<Vec<QueueEntry>> {
        self.request(|reply| Command::RelayQueue { reply }).await
    }

    pub fn subscribe_packets(&self) -> BroadcastStream<PacketEvent> {
        BroadcastStream::new(self.inner.events.packets.subscribe())
    }

    pub fn subscribe_errors(&self) -> BroadcastStream<ErrorEvent> {
        BroadcastStream::new(self.inner.events.errors.subscribe())
    }

    pub fn subscribe_state(&self) -> BroadcastStream<StateEvent> {
        BroadcastStream::new(self.inner.events.state.subscribe())
    }

    /// Stop the actor and wait for it to finish. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Mesh coordinator task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }
}

struct CoordinatorSink {
    inputs: mpsc::Sender<Input>,
}

impl RadioEventSink for CoordinatorSink {
    fn deliver(&self, event: RadioEvent) -> bool {
        match self.inputs.try_send(Input::Radio(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Coordinator input queue full, radio event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct MeshActor {
    relay: RelayConfig,
    codec: PacketCodec,
    store: StoreHandle,
    radio: Arc<dyn RadioLink>,
    local_user_id: u32,
    max_age_secs: u64,
    sweep_interval: Duration,
    scheduler: RelayScheduler,
    verification: VerificationTracker,
    /// `(packet, source)` pairs heard since the window started
    scan_window: HashSet<(UniqueId, PeerAddress)>,
    window_started: Instant,
    metrics: Arc<Metrics>,
    events: EventBus,
    transmits: JoinSet<()>,
    broadcasting: bool,
    radio_available: bool,
    online: bool,
}

impl MeshActor {
    async fn run(mut self, mut inputs: mpsc::Receiver<Input>, cancel: CancellationToken) {
        let mut tick = time::interval(self.relay.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let had_work = self.scheduler.has_work();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Shutting down mesh coordinator");
                    break;
                }

                input = inputs.recv() => {
                    let Some(input) = input else {
                        debug!("All coordinator senders dropped");
                        break;
                    };
                    match input {
                        Input::Command(command) => self.on_command(command).await,
                        Input::Radio(event) => self.on_radio_event(event).await,
                    }
                    // Start the cadence one period after work appears
                    if !had_work && self.scheduler.has_work() {
                        tick.reset();
                    }
                }

                _ = tick.tick(), if had_work => self.on_tick(),

                _ = sweep.tick() => self.sweep().await,

                Some(joined) = self.transmits.join_next(), if !self.transmits.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Transmit task panicked");
                        }
                    }
                }
            }
        }

        self.transmits.shutdown().await;
        if let Err(e) = self.radio.stop_advertising() {
            debug!(error = %e, "stop_advertising failed during shutdown");
        }
        if let Err(e) = self.radio.stop_scanning() {
            debug!(error = %e, "stop_scanning failed during shutdown");
        }
        self.metrics.log_metrics();
        info!("Mesh coordinator stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartBroadcasting {
                latitude,
                longitude,
                status,
                reply,
            } => {
                let result = self.start_broadcasting(latitude, longitude, status).await;
                let _ = reply.send(result);
            }
            Command::StopBroadcasting { reply } => {
                let result = self.stop_broadcasting().await;
                let _ = reply.send(result);
            }
            Command::SendTargeted {
                target_id,
                latitude,
                longitude,
                status,
                reply,
            } => {
                let result = self
                    .send_targeted(target_id, latitude, longitude, status)
                    .await;
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::IsVerified { user_id, reply } => {
                let _ = reply.send(self.verification.is_verified(user_id));
            }
            Command::RelayQueue { reply } => {
                let _ = reply.send(self.scheduler.entries());
            }
        }
    }

    fn stats(&self) -> MeshStats {
        let counters = self.metrics.snapshot();
        MeshStats {
            local_user_id: self.local_user_id,
            broadcasting: self.broadcasting,
            radio_available: self.radio_available,
            online: self.online,
            echo_count: counters.echoes,
            handshake_count: counters.handshakes,
            queue_len: self.scheduler.len(),
            verified_count: self.verification.verified_count(),
            counters,
        }
    }

    /// Build a self-originated packet with a fresh, durable sequence number
    async fn own_packet(&self, latitude: f64, longitude: f64, status: Status) -> Result<SosPacket> {
        let sequence = self.store.increment_sequence().await?;
        Ok(SosPacket::new(
            self.local_user_id,
            sequence,
            latitude,
            longitude,
            status,
        ))
    }

    #[instrument(skip(self))]
    async fn start_broadcasting(
        &mut self,
        latitude: f64,
        longitude: f64,
        status: Status,
    ) -> Result<SosPacket> {
        if status.is_terminal() {
            return Err(MeshError::InvalidArgument(
                constants::ERR_SAFE_BROADCAST.into(),
            ));
        }

        let packet = self.own_packet(latitude, longitude, status).await?;
        self.store.save_local(packet.clone(), true).await?;
        self.scheduler.set_own_broadcast(packet.clone());

        // A failed first transmit is retried by the next tick
        self.transmit_now(&packet);

        if !self.broadcasting {
            self.broadcasting = true;
            self.events.state(StateEvent::Broadcasting(true));
        }
        info!(id = %packet.unique_id(), status = %packet.status, "Broadcasting");
        Ok(packet)
    }

    #[instrument(skip(self))]
    async fn stop_broadcasting(&mut self) -> Result<Option<SosPacket>> {
        let Some(current) = self.scheduler.own_broadcast().cloned() else {
            return Ok(None);
        };

        let safe = self
            .own_packet(current.latitude, current.longitude, Status::Safe)
            .await?;
        self.store.save_local(safe.clone(), true).await?;

        // Own alerts still waiting out their jitter must not follow the Safe
        self.transmits.abort_all();

        let count = self.relay.safe_burst_count;
        for attempt in 0..count {
            self.transmit_now(&safe);
            if attempt + 1 < count {
                time::sleep(self.relay.safe_burst_interval).await;
            }
        }

        self.scheduler.clear_own_broadcast();
        if let Err(e) = self.radio.stop_advertising() {
            self.radio_failure(e);
        }
        self.broadcasting = false;
        self.events.state(StateEvent::Broadcasting(false));
        info!(id = %safe.unique_id(), bursts = count, "Announced safe, broadcast stopped");
        Ok(Some(safe))
    }

    #[instrument(skip(self))]
    async fn send_targeted(
        &mut self,
        target_id: u32,
        latitude: f64,
        longitude: f64,
        status: Status,
    ) -> Result<SosPacket> {
        if target_id == 0 {
            return Err(MeshError::InvalidArgument(
                constants::ERR_TARGET_REQUIRED.into(),
            ));
        }

        let packet = self
            .own_packet(latitude, longitude, status)
            .await?
            .with_target(target_id);
        self.store.save_local(packet.clone(), false).await?;
        self.transmit_now(&packet);
        debug!(id = %packet.unique_id(), target = target_id, "Targeted message sent");
        Ok(packet)
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::PacketReceived {
                bytes,
                rssi,
                source,
            } => self.on_frame(&bytes, rssi, source).await,
            RadioEvent::AvailabilityChanged(available) => {
                self.radio_available = available;
                if available {
                    info!("Radio available, resuming scan");
                    if let Err(e) = self.radio.start_scanning() {
                        self.radio_failure(e);
                    }
                } else {
                    warn!("Radio unavailable");
                }
                self.events.state(StateEvent::RadioAvailability(available));
            }
            RadioEvent::ConnectivityChanged(online) => {
                self.online = online;
                self.events.state(StateEvent::Connectivity(online));
            }
        }
    }

    /// Inbound pipeline for one scan result
    async fn on_frame(&mut self, bytes: &[u8], rssi: i32, source: PeerAddress) {
        self.metrics.frame_received();

        let packet = match self.codec.decode(bytes) {
            Ok(packet) => packet.with_rssi(rssi),
            Err(e) => {
                self.metrics.decode_failure();
                trace!(error = %e, %source, "Ignoring undecodable frame");
                self.events.error(ErrorEvent::Decode(e));
                return;
            }
        };

        if packet.user_id == self.local_user_id {
            let count = self.metrics.echo();
            debug!(id = %packet.unique_id(), %source, count, "Echo");
            self.events.packet(PacketEvent::Echo { count });
            return;
        }

        if packet.status.is_terminal() {
            self.on_safe(packet).await;
            return;
        }

        if self.window_started.elapsed() >= self.relay.tick_interval {
            self.reset_scan_window();
        }
        if !self.scan_window.insert((packet.unique_id(), source.clone())) {
            self.metrics.scan_repeat();
            return;
        }

        // Private messages are not alerts and do not count toward a quorum
        let verified = packet.is_broadcast() && self.confirm(&packet, &source);

        let outcome = match self.store.save(packet.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store_failure(e.to_string());
                return;
            }
        };

        match outcome {
            SaveOutcome::New | SaveOutcome::SupersededExisting => {
                if outcome == SaveOutcome::New {
                    self.metrics.handshake();
                }
                self.accept(packet, source, verified);
            }
            SaveOutcome::DuplicateIgnored => self.metrics.duplicate(),
            SaveOutcome::Expired => {
                trace!(id = %packet.unique_id(), "Expired packet ignored");
            }
        }
    }

    /// Record `source` as a confirmation of `packet`. Returns whether the
    /// originator is verified.
    fn confirm(&mut self, packet: &SosPacket, source: &PeerAddress) -> bool {
        match self
            .verification
            .record(packet.user_id, packet.sequence, source, unix_now())
        {
            Confirmation::Verified => {
                self.metrics.alert_verified();
                self.events.packet(PacketEvent::Verified {
                    user_id: packet.user_id,
                    confirmations: self.verification.confirmations(packet.user_id),
                });
                true
            }
            Confirmation::AfterSafe => {
                trace!(id = %packet.unique_id(), %source, "Alert predates safe announcement");
                false
            }
            _ => self.verification.is_verified(packet.user_id),
        }
    }

    /// Relay and surface a packet the store accepted
    fn accept(&mut self, packet: SosPacket, source: PeerAddress, verified: bool) {
        let for_us = packet.is_targeted() && packet.target_id == self.local_user_id;

        if !for_us {
            match self.scheduler.enqueue(packet.clone(), packet.status.severity()) {
                EnqueueOutcome::InsertedWithEviction(evicted) => {
                    self.metrics.congestion_drop();
                    self.events.error(ErrorEvent::CongestionDrop(evicted));
                }
                outcome => trace!(?outcome, "Relay candidate offered"),
            }
        }

        if packet.is_addressed_to(self.local_user_id) {
            self.events.packet(PacketEvent::Alert {
                packet,
                source,
                verified,
            });
        }
    }

    /// A Safe that the store accepts kills relaying and verification for its
    /// user. A repeat, or one older than the user's latest alert, changes nothing.
    async fn on_safe(&mut self, packet: SosPacket) {
        match self.store.save(packet.clone()).await {
            Ok(SaveOutcome::New | SaveOutcome::SupersededExisting) => {
                let outcome = self.scheduler.enqueue(packet.clone(), 0);
                self.verification
                    .mark_safe(packet.user_id, packet.sequence, unix_now());
                self.metrics.safe_received();
                info!(id = %packet.unique_id(), ?outcome, "Peer announced safe");
                self.events.packet(PacketEvent::SafeAnnounced { packet });
            }
            Ok(_) => self.metrics.duplicate(),
            Err(e) => self.store_failure(e.to_string()),
        }
    }

    fn on_tick(&mut self) {
        self.reset_scan_window();

        let Some((source, packet)) = self.scheduler.next_tick() else {
            return;
        };
        let frame = self.codec.encode(&packet);
        let delay = jitter(self.relay.jitter_max);
        trace!(?source, id = %packet.unique_id(), delay_ms = delay.as_millis() as u64, "Scheduling transmit");

        let radio = Arc::clone(&self.radio);
        let metrics = Arc::clone(&self.metrics);
        let events = self.events.clone();
        self.transmits.spawn(async move {
            time::sleep(delay).await;
            transmit(radio.as_ref(), &frame, &metrics, &events);
        });
    }

    fn transmit_now(&self, packet: &SosPacket) {
        let frame = self.codec.encode(packet);
        transmit(self.radio.as_ref(), &frame, &self.metrics, &self.events);
    }

    async fn sweep(&mut self) {
        let _timer = Timer::start("expiry_sweep");
        if let Err(e) = self.store.expire_sweep().await {
            self.store_failure(e.to_string());
        }
        self.scheduler.drop_expired(unix_now(), self.max_age_secs);
        let pruned = self.scheduler.prune_tombstones();
        if pruned > 0 {
            debug!(pruned, "Safe tombstones expired");
        }
        let forgotten = self.verification.prune(unix_now());
        if forgotten > 0 {
            debug!(forgotten, "Verification state expired");
        }
        self.metrics.log_metrics();
    }

    fn reset_scan_window(&mut self) {
        self.scan_window.clear();
        self.window_started = Instant::now();
    }

    fn radio_failure(&self, error: RadioError) {
        warn!(error = %error, "Radio call failed");
        self.events.error(ErrorEvent::RadioUnavailable(error));
    }

    fn store_failure(&self, message: String) {
        self.metrics.store_error();
        warn!(error = %message, "Store operation failed");
        self.events.error(ErrorEvent::Store(message));
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Hand one frame to the radio. Failures are reported, never propagated.
fn transmit(radio: &dyn RadioLink, frame: &Bytes, metrics: &Metrics, events: &EventBus) {
    match radio.start_advertising(frame) {
        Ok(()) => metrics.transmission(),
        Err(e) => {
            metrics.transmit_failure();
            warn!(error = %e, "Transmit failed");
            events.error(ErrorEvent::RadioUnavailable(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(500)) <= Duration::from_millis(500));
        }
    }
}
