//! Session registry: owns every live session, applies timer and packet
//! events to them, and fans state changes out to the route callbacks.
//!
//! The registry is not synchronized; the engine worker owns it and applies
//! events one at a time. Timer events carry the generation (and, for
//! detection timers, the rx epoch) they were armed with, and are ignored if
//! the session was replaced or the timer superseded in the meantime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::CreateError;
use crate::session::{PacketOutcome, Session, TimeoutOutcome, TransmitOutcome};
use crate::transport::SessionTransport;
use crate::types::{NotifyState, SessionConfig, SessionKey, SessionState, SessionUpdate};

/// Reachability and notification hooks supplied by the embedding daemon.
pub trait RouteCallbacks: Send + Sync {
    /// Whether `key` names a directly attached destination that may be
    /// monitored at all. Checked once, at session creation.
    fn is_direct_target(&self, key: &SessionKey) -> bool;

    /// Whether `key` is currently reachable. Checked on every transmit
    /// cycle and before sending the final teardown packet.
    fn is_reachable(&self, key: &SessionKey) -> bool;

    /// Reports an externally visible session state change.
    fn notify_state_change(&self, update: SessionUpdate);
}

/// Counters kept across all sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStats {
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_discarded: u64,
    pub discriminator_faults: u64,
    pub detection_timeouts: u64,
    pub state_notifications: u64,
}

struct SessionEntry {
    session: Session,
    transport: Option<Box<dyn SessionTransport>>,
}

/// Owner of all live sessions, keyed by `(interface, peer)`.
pub struct SessionRegistry {
    sessions: HashMap<SessionKey, SessionEntry>,
    discriminators: HashSet<u32>,
    callbacks: Arc<dyn RouteCallbacks>,
    stats: RegistryStats,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new(callbacks: Arc<dyn RouteCallbacks>) -> Self {
        Self {
            sessions: HashMap::new(),
            discriminators: HashSet::new(),
            callbacks,
            stats: RegistryStats::default(),
            next_generation: 1,
        }
    }

    /// Creates a session toward `config.key`. The session is registered
    /// before any transport is attached, so a concurrent duplicate create
    /// fails even while the socket is still being opened.
    ///
    /// Returns the local discriminator, the session's identity on the wire.
    pub fn create(&mut self, config: SessionConfig) -> Result<u32, CreateError> {
        if let Err(reason) = config.validate() {
            return Err(CreateError::InvalidConfig(reason));
        }
        if !self.callbacks.is_direct_target(&config.key) {
            return Err(CreateError::InvalidTarget(config.key.clone()));
        }
        if self.sessions.contains_key(&config.key) {
            return Err(CreateError::AlreadyMonitored(config.key.clone()));
        }

        let discriminator = self.alloc_discriminator();
        let generation = self.next_generation;
        self.next_generation += 1;

        let key = config.key.clone();
        let session = Session::new(config, discriminator, generation);
        info!(key = %key, discriminator, "session created");
        self.sessions.insert(
            key,
            SessionEntry {
                session,
                transport: None,
            },
        );
        self.stats.sessions_created += 1;
        Ok(discriminator)
    }

    /// Attaches the opened transport to a session created moments ago.
    /// Returns false if the session was destroyed in between.
    pub fn attach_transport(
        &mut self,
        key: &SessionKey,
        transport: Box<dyn SessionTransport>,
    ) -> bool {
        match self.sessions.get_mut(key) {
            Some(entry) => {
                entry.transport = Some(transport);
                true
            }
            None => false,
        }
    }

    /// Destroys a session. Idempotent: returns false if `key` is not
    /// monitored. If the session had progressed past Down and the peer is
    /// still reachable, a final AdminDown packet is sent best-effort so the
    /// peer finds out immediately instead of waiting out its detection time.
    pub fn destroy(&mut self, key: &SessionKey) -> bool {
        let Some(mut entry) = self.sessions.remove(key) else {
            return false;
        };
        self.discriminators
            .remove(&entry.session.local_discriminator());

        if entry.session.local_state() > SessionState::Down && self.callbacks.is_reachable(key) {
            entry.session.set_local_diag(crate::types::DiagCode::AdminDown);
            let raw = entry.session.build_final_packet().encode();
            if let Some(transport) = &entry.transport {
                if let Err(e) = transport.send(&raw) {
                    debug!(key = %key, error = %e, "final packet not sent");
                } else {
                    self.stats.packets_sent += 1;
                }
            }
        }

        info!(key = %key, "session destroyed");
        self.stats.sessions_destroyed += 1;
        // Dropping the entry closes the transport and stops inbound delivery.
        true
    }

    /// Read-only snapshot of a session.
    pub fn lookup(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.get(key).map(|entry| entry.session.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    /// Keys of all live sessions.
    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.keys().cloned().collect()
    }

    /// Destroys every session, with final packets where due.
    pub fn shutdown_all(&mut self) {
        for key in self.keys() {
            self.destroy(&key);
        }
    }

    pub(crate) fn generation_of(&self, key: &SessionKey) -> Option<u64> {
        self.sessions.get(key).map(|entry| entry.session.generation())
    }

    /// Runs one transmit cycle. Returns the jittered delay until the next
    /// cycle, or None if the event was stale.
    pub(crate) fn on_transmit_due(&mut self, key: &SessionKey, generation: u64) -> Option<u64> {
        let reachable = self.callbacks.is_reachable(key);
        let entry = self.sessions.get_mut(key)?;
        if entry.session.generation() != generation {
            return None;
        }

        match entry.session.transmit_cycle(reachable) {
            TransmitOutcome::Skip { went_down } => {
                if went_down {
                    self.stats.state_notifications += 1;
                    self.callbacks
                        .notify_state_change(SessionUpdate::new(key.clone(), NotifyState::Down));
                }
            }
            TransmitOutcome::Send(pkt) => {
                let raw = pkt.encode();
                if let Some(transport) = &entry.transport {
                    match transport.send(&raw) {
                        Ok(()) => self.stats.packets_sent += 1,
                        Err(e) => warn!(key = %key, error = %e, "control packet send failed"),
                    }
                }
            }
        }
        Some(entry.session.jittered_tx_delay_us())
    }

    /// Applies a received datagram. Returns a detection timer re-arm
    /// request `(delay_us, epoch)` when one is due.
    pub(crate) fn on_packet(&mut self, key: &SessionKey, raw: &[u8]) -> Option<(u32, u64)> {
        self.stats.packets_received += 1;
        let entry = self.sessions.get_mut(key)?;

        match entry.session.handle_packet(raw) {
            PacketOutcome::Discard(reason) => {
                debug!(key = %key, ?reason, "packet discarded");
                self.stats.packets_discarded += 1;
                None
            }
            PacketOutcome::Fault => {
                warn!(key = %key, "your-discriminator mismatch, notifying peer");
                self.stats.discriminator_faults += 1;
                let raw = entry.session.build_final_packet().encode();
                if let Some(transport) = &entry.transport {
                    if transport.send(&raw).is_ok() {
                        self.stats.packets_sent += 1;
                    }
                }
                None
            }
            PacketOutcome::Processed { notify, rearm_rx } => {
                if let Some(state) = notify {
                    self.stats.state_notifications += 1;
                    self.callbacks
                        .notify_state_change(SessionUpdate::new(key.clone(), state));
                }
                rearm_rx
            }
        }
    }

    /// Applies a detection timer expiry armed with `(generation, epoch)`.
    /// Returns a re-arm request when the session survives.
    pub(crate) fn on_detect_timeout(
        &mut self,
        key: &SessionKey,
        generation: u64,
        epoch: u64,
    ) -> Option<(u32, u64)> {
        let entry = self.sessions.get_mut(key)?;
        if entry.session.generation() != generation || entry.session.rx_epoch() != epoch {
            return None;
        }

        match entry.session.detect_timeout() {
            TimeoutOutcome::Expired => {
                info!(key = %key, "detection time expired");
                self.stats.detection_timeouts += 1;
                self.stats.state_notifications += 1;
                self.callbacks
                    .notify_state_change(SessionUpdate::new(key.clone(), NotifyState::Down));
                None
            }
            TimeoutOutcome::Rearm { delay_us, epoch } => Some((delay_us, epoch)),
        }
    }

    fn alloc_discriminator(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let discriminator = rng.gen_range(1..=u32::MAX);
            if self.discriminators.insert(discriminator) {
                return discriminator;
            }
        }
    }
}
