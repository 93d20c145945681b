//! In-process radio medium
//!
//! [`MemoryEther`] stands in for the air: every [`MemoryRadio`] joined to it
//! hears the advertisements of its neighbours while it is scanning. By default
//! every station hears every other one; once [`MemoryEther::link`] is used the
//! topology becomes explicit, which allows multi-hop flood scenarios.
//!
//! Failures are injected per radio with [`MemoryRadio::set_available`] and
//! [`MemoryRadio::fail_next`].

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::{PeerAddress, RadioEvent, RadioEventSink, RadioLink};
use crate::error::{constants, RadioError};

/// Signal strength reported for every simulated hop
pub const DEFAULT_RSSI: i32 = -60;

/// Largest payload a legacy advertisement can carry
pub const MAX_ADVERTISING_PAYLOAD: usize = 31;

#[derive(Default)]
struct Station {
    sink: Option<Arc<dyn RadioEventSink>>,
    scanning: bool,
    advertising: Option<Bytes>,
    available: bool,
    fail_next: Option<RadioError>,
    transmitted: Vec<Bytes>,
    rssi: i32,
}

#[derive(Default)]
struct EtherInner {
    stations: HashMap<PeerAddress, Station>,
    /// Explicit neighbour pairs, or `None` when everyone hears everyone
    links: Option<HashSet<(PeerAddress, PeerAddress)>>,
}

impl EtherInner {
    fn can_hear(&self, listener: &PeerAddress, speaker: &PeerAddress) -> bool {
        match &self.links {
            None => true,
            Some(links) => links.contains(&(speaker.clone(), listener.clone())),
        }
    }
}

/// Shared in-process medium
#[derive(Clone, Default)]
pub struct MemoryEther {
    inner: Arc<Mutex<EtherInner>>,
}

impl MemoryEther {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EtherInner> {
        // A poisoned medium is still usable: stations hold plain data
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a station at `address`
    pub fn join(&self, address: impl Into<PeerAddress>) -> MemoryRadio {
        let address = address.into();
        self.lock().stations.insert(
            address.clone(),
            Station {
                available: true,
                rssi: DEFAULT_RSSI,
                ..Station::default()
            },
        );
        debug!(%address, "Station joined ether");
        MemoryRadio {
            address,
            ether: self.clone(),
        }
    }

    /// Let `a` and `b` hear each other. The first call switches the ether
    /// from "everyone hears everyone" to explicit links.
    pub fn link(&self, a: impl Into<PeerAddress>, b: impl Into<PeerAddress>) {
        let (a, b) = (a.into(), b.into());
        let mut inner = self.lock();
        let links = inner.links.get_or_insert_with(HashSet::new);
        links.insert((a.clone(), b.clone()));
        links.insert((b, a));
    }

    /// Break the link between `a` and `b`
    pub fn unlink(&self, a: impl Into<PeerAddress>, b: impl Into<PeerAddress>) {
        let (a, b) = (a.into(), b.into());
        let mut inner = self.lock();
        if let Some(links) = inner.links.as_mut() {
            links.remove(&(a.clone(), b.clone()));
            links.remove(&(b, a));
        }
    }

    pub fn station_count(&self) -> usize {
        self.lock().stations.len()
    }

    fn broadcast(&self, speaker: &PeerAddress, payload: Bytes) {
        let inner = self.lock();
        let rssi = inner
            .stations
            .get(speaker)
            .map_or(DEFAULT_RSSI, |s| s.rssi);
        for (address, station) in &inner.stations {
            if address == speaker || !station.scanning || !station.available {
                continue;
            }
            if !inner.can_hear(address, speaker) {
                continue;
            }
            if let Some(sink) = &station.sink {
                let delivered = sink.deliver(RadioEvent::PacketReceived {
                    bytes: payload.clone(),
                    rssi,
                    source: speaker.clone(),
                });
                trace!(from = %speaker, to = %address, delivered, "Frame on air");
            }
        }
    }
}

/// One simulated radio attached to a [`MemoryEther`]
#[derive(Clone)]
pub struct MemoryRadio {
    address: PeerAddress,
    ether: MemoryEther,
}

impl MemoryRadio {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn with_station<R>(&self, f: impl FnOnce(&mut Station) -> R) -> Option<R> {
        self.ether.lock().stations.get_mut(&self.address).map(f)
    }

    /// Route events heard by this radio into `sink`
    pub fn attach(&self, sink: Arc<dyn RadioEventSink>) {
        self.with_station(|s| s.sink = Some(sink));
    }

    /// Power the radio on or off. Notifies the attached sink.
    pub fn set_available(&self, available: bool) {
        let sink = self.with_station(|s| {
            s.available = available;
            if !available {
                s.advertising = None;
                s.scanning = false;
            }
            s.sink.clone()
        });
        if let Some(Some(sink)) = sink {
            sink.deliver(RadioEvent::AvailabilityChanged(available));
        }
    }

    /// Make the next radio call fail with `error`
    pub fn fail_next(&self, error: RadioError) {
        self.with_station(|s| s.fail_next = Some(error));
    }

    /// Report `rssi` to everyone hearing this radio
    pub fn set_rssi(&self, rssi: i32) {
        self.with_station(|s| s.rssi = rssi);
    }

    /// Every payload this radio put on air, oldest first
    pub fn transmitted(&self) -> Vec<Bytes> {
        self.with_station(|s| s.transmitted.clone())
            .unwrap_or_default()
    }

    /// Payload currently being advertised
    pub fn advertising(&self) -> Option<Bytes> {
        self.with_station(|s| s.advertising.clone()).flatten()
    }

    pub fn is_scanning(&self) -> bool {
        self.with_station(|s| s.scanning).unwrap_or(false)
    }

    /// Inject a frame as if `source` had advertised it
    pub fn inject(&self, bytes: Bytes, source: impl Into<PeerAddress>) -> bool {
        let sink = self.with_station(|s| s.sink.clone()).flatten();
        match sink {
            Some(sink) => sink.deliver(RadioEvent::PacketReceived {
                bytes,
                rssi: DEFAULT_RSSI,
                source: source.into(),
            }),
            None => false,
        }
    }

    fn check(&self) -> Result<(), RadioError> {
        self.with_station(|s| {
            if let Some(error) = s.fail_next.take() {
                return Err(error);
            }
            if !s.available {
                return Err(RadioError::Unavailable(constants::ERR_RADIO_OFF.into()));
            }
            Ok(())
        })
        .unwrap_or_else(|| Err(RadioError::Unavailable(constants::ERR_RADIO_OFF.into())))
    }
}

impl RadioLink for MemoryRadio {
    fn start_advertising(&self, payload: &[u8]) -> Result<(), RadioError> {
        self.check()?;
        if payload.len() > MAX_ADVERTISING_PAYLOAD {
            return Err(RadioError::PayloadTooLarge(payload.len()));
        }
        let payload = Bytes::copy_from_slice(payload);
        self.with_station(|s| {
            s.advertising = Some(payload.clone());
            s.transmitted.push(payload.clone());
        });
        self.ether.broadcast(&self.address, payload);
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), RadioError> {
        self.with_station(|s| s.advertising = None);
        Ok(())
    }

    fn start_scanning(&self) -> Result<(), RadioError> {
        self.check()?;
        self.with_station(|s| s.scanning = true);
        Ok(())
    }

    fn stop_scanning(&self) -> Result<(), RadioError> {
        self.with_station(|s| s.scanning = false);
        Ok(())
    }
}
