//! Per-peer BFD session: state machine, parameter negotiation and timing.
//!
//! A `Session` is pure protocol logic. It never performs I/O and never arms
//! a timer itself; every entry point returns an outcome describing what the
//! caller (the registry, driven by the engine's serialized worker) must do:
//! notify the reachability sink, send a packet, or re-arm a timer.
//!
//! State machine per RFC 5880 Figure 6:
//!
//! ```text
//!                              +--+
//!                              |  | UP, ADMIN DOWN, TIMER
//!                              |  V
//!                      DOWN  +------+  INIT
//!               +------------|      |------------+
//!               |            | DOWN |            |
//!               |  +-------->|      |<--------+  |
//!               |  |         +------+         |  |
//!               |  |                          |  |
//!               |  |ADMIN DOWN,     ADMIN DOWN,|  |
//!               |  |TIMER                TIMER|  |
//!               V  |                          |  V
//!             +------+                      +------+
//!        +----|      |                      |      |----+
//!   DOWN |    | INIT |--------------------->|  UP  |    | INIT, UP
//!        +--->|      | INIT, UP             |      |<---+
//!             +------+                      +------+
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::error::WireError;
use crate::types::{
    DiagCode, NotifyState, SessionConfig, SessionKey, SessionState, BFD_MIN_RX_FLOOR_US,
    BFD_REMOTE_MIN_RX_INIT_US, BFD_VERSION,
};
use crate::wire::{ControlPacket, CONTROL_PACKET_LEN};

/// Why a received packet was discarded. Discards are protocol-normal and are
/// not surfaced to callers; the reason exists for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Undecodable header.
    Malformed(WireError),
    /// Version field is not 1.
    BadVersion(u8),
    /// Advertised length does not match the bytes consumed.
    LengthMismatch(u8),
    /// Detect multiplier of zero.
    ZeroDetectMultiplier,
    /// "My Discriminator" of zero (the peer must identify itself).
    ZeroRemoteDiscriminator,
    /// "Your Discriminator" of zero while claiming a state above Down.
    UnlearnedButProgressed,
    /// Authentication bit inconsistent with session configuration.
    AuthMismatch,
    /// "My Discriminator" changed after it was learned.
    PeerIdentityChanged,
    /// Required-min-RX outside the accepted 10 ms..i32::MAX range.
    MinRxOutOfRange(u32),
    /// Valid packet, but no transition applies from the current state.
    NoTransition,
}

/// Result of feeding a received datagram to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Silently discarded; no externally visible effect.
    Discard(DiscardReason),
    /// "Your Discriminator" named somebody else: protocol fault. The caller
    /// sends a best-effort final notification toward the peer and discards.
    Fault,
    /// Packet accepted and processed.
    Processed {
        /// State change to report to the notification sink, if any.
        notify: Option<NotifyState>,
        /// Detection timer re-arm: `(delay_us, rx_epoch)`.
        rearm_rx: Option<(u32, u64)>,
    },
}

/// Result of one periodic transmit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// Target unreachable; no packet this cycle.
    Skip {
        /// The session had to drop out of Init/Up because of it.
        went_down: bool,
    },
    /// Send this packet.
    Send(ControlPacket),
}

/// Result of a detection timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Detection time expired: the session went Down with diag Expired.
    Expired,
    /// Not yet fatal; re-arm the detection timer.
    Rearm {
        /// Delay until the next expiry check, microseconds.
        delay_us: u32,
        /// Epoch the new timer must carry.
        epoch: u64,
    },
}

/// One BFD session toward a single monitored destination.
#[derive(Debug, Clone)]
pub struct Session {
    config: SessionConfig,
    local_discriminator: u32,
    remote_discriminator: u32,
    local_state: SessionState,
    remote_state: SessionState,
    local_diag: DiagCode,
    remote_diag: DiagCode,
    desired_min_tx_us: u32,
    required_min_rx_us: u32,
    remote_min_rx_us: u32,
    detect_multiplier: u8,
    effective_tx_us: u32,
    consecutive_errors: u32,
    demand_mode_local: bool,
    demand_mode_remote: bool,
    created_at: Instant,
    last_state_change_at: Instant,
    previous_state: SessionState,
    previous_state_duration: Duration,
    generation: u64,
    rx_epoch: u64,
}

impl Session {
    pub(crate) fn new(config: SessionConfig, local_discriminator: u32, generation: u64) -> Self {
        let now = Instant::now();
        let mut session = Self {
            local_discriminator,
            remote_discriminator: 0,
            local_state: SessionState::Down,
            remote_state: SessionState::Down,
            local_diag: DiagCode::None,
            remote_diag: DiagCode::None,
            desired_min_tx_us: config.desired_tx_us,
            required_min_rx_us: config.required_rx_us,
            remote_min_rx_us: BFD_REMOTE_MIN_RX_INIT_US,
            detect_multiplier: config.detect_multiplier,
            effective_tx_us: config.desired_tx_us,
            consecutive_errors: 0,
            demand_mode_local: false,
            demand_mode_remote: false,
            created_at: now,
            last_state_change_at: now,
            previous_state: SessionState::Down,
            previous_state_duration: Duration::ZERO,
            generation,
            rx_epoch: 0,
            config,
        };
        session.reset();
        session
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Monitored target identity.
    pub fn key(&self) -> &SessionKey {
        &self.config.key
    }

    /// Our discriminator; nonzero for the session's whole lifetime.
    pub fn local_discriminator(&self) -> u32 {
        self.local_discriminator
    }

    /// Peer's discriminator; 0 until learned from the first valid packet.
    pub fn remote_discriminator(&self) -> u32 {
        self.remote_discriminator
    }

    /// Current local state.
    pub fn local_state(&self) -> SessionState {
        self.local_state
    }

    /// Peer's last reported state.
    pub fn remote_state(&self) -> SessionState {
        self.remote_state
    }

    /// Reason for the most recent local state change.
    pub fn local_diag(&self) -> DiagCode {
        self.local_diag
    }

    /// Peer's last reported diagnostic.
    pub fn remote_diag(&self) -> DiagCode {
        self.remote_diag
    }

    /// Base transmit interval: `max(desired_min_tx, remote_min_rx)`.
    pub fn effective_tx_us(&self) -> u32 {
        self.effective_tx_us
    }

    /// Our detection timer period.
    pub fn required_min_rx_us(&self) -> u32 {
        self.required_min_rx_us
    }

    /// Peer's advertised required-min-RX (clamped to the 10 ms floor).
    pub fn remote_min_rx_us(&self) -> u32 {
        self.remote_min_rx_us
    }

    /// Detection multiplier in force.
    pub fn detect_multiplier(&self) -> u8 {
        self.detect_multiplier
    }

    /// Consecutive detection timer expirations without a valid packet.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Whether demand mode is locally active (set on reaching Up).
    pub fn demand_mode_local(&self) -> bool {
        self.demand_mode_local
    }

    /// Whether the peer requested demand mode.
    pub fn demand_mode_remote(&self) -> bool {
        self.demand_mode_remote
    }

    /// Time spent in the current state.
    pub fn state_duration(&self) -> Duration {
        self.last_state_change_at.elapsed()
    }

    /// State occupied before the current one, and how long it lasted.
    pub fn previous_state(&self) -> (SessionState, Duration) {
        (self.previous_state, self.previous_state_duration)
    }

    /// Session age.
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn rx_epoch(&self) -> u64 {
        self.rx_epoch
    }

    pub(crate) fn set_local_diag(&mut self, diag: DiagCode) {
        self.local_diag = diag;
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Restarts negotiation: clears everything learned from the peer and
    /// restores the administratively configured timing. The local diagnostic
    /// is deliberately left alone; callers set it before resetting so the
    /// reason for the restart survives.
    pub(crate) fn reset(&mut self) {
        self.remote_discriminator = 0;
        self.remote_state = SessionState::Down;
        self.remote_diag = DiagCode::None;
        self.demand_mode_local = false;
        self.demand_mode_remote = false;
        self.consecutive_errors = 0;
        self.desired_min_tx_us = self.config.desired_tx_us;
        self.required_min_rx_us = self.config.required_rx_us;
        self.remote_min_rx_us = BFD_REMOTE_MIN_RX_INIT_US;
        self.detect_multiplier = self.config.detect_multiplier;
        self.recompute_effective_tx();
        self.set_state(SessionState::Down);
        // Any armed detection timer is now stale.
        self.rx_epoch += 1;
    }

    /// Runs one periodic transmit cycle.
    pub(crate) fn transmit_cycle(&mut self, reachable: bool) -> TransmitOutcome {
        if !reachable {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            self.local_diag = DiagCode::AdminDown;
            let went_down = if self.local_state > SessionState::Down {
                debug!(key = %self.config.key, "target unreachable, session down");
                self.reset();
                true
            } else {
                false
            };
            return TransmitOutcome::Skip { went_down };
        }
        TransmitOutcome::Send(self.build_control_packet())
    }

    /// Processes a received datagram through validation, learning and the
    /// RFC 5880 Figure 6 transition table.
    pub(crate) fn handle_packet(&mut self, raw: &[u8]) -> PacketOutcome {
        let pkt = match ControlPacket::decode(raw) {
            Ok(pkt) => pkt,
            Err(e) => return PacketOutcome::Discard(DiscardReason::Malformed(e)),
        };

        if pkt.version != BFD_VERSION {
            return PacketOutcome::Discard(DiscardReason::BadVersion(pkt.version));
        }
        if pkt.length as usize != CONTROL_PACKET_LEN {
            return PacketOutcome::Discard(DiscardReason::LengthMismatch(pkt.length));
        }
        if pkt.detect_multiplier == 0 {
            return PacketOutcome::Discard(DiscardReason::ZeroDetectMultiplier);
        }
        if pkt.my_discriminator == 0 {
            return PacketOutcome::Discard(DiscardReason::ZeroRemoteDiscriminator);
        }
        if pkt.your_discriminator == 0 && pkt.state > SessionState::Down {
            return PacketOutcome::Discard(DiscardReason::UnlearnedButProgressed);
        }
        if pkt.your_discriminator != 0 && pkt.your_discriminator != self.local_discriminator {
            // The peer is talking to somebody it thinks is us: state has
            // diverged between the two ends.
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            self.local_diag = DiagCode::Expired;
            return PacketOutcome::Fault;
        }
        if pkt.auth_present && !self.config.auth_required {
            return PacketOutcome::Discard(DiscardReason::AuthMismatch);
        }
        if self.config.auth_required && !pkt.auth_present {
            return PacketOutcome::Discard(DiscardReason::AuthMismatch);
        }

        // Learning and negotiation.
        if self.remote_discriminator == 0 {
            self.remote_discriminator = pkt.my_discriminator;
        } else if self.remote_discriminator != pkt.my_discriminator {
            return PacketOutcome::Discard(DiscardReason::PeerIdentityChanged);
        }
        self.remote_state = pkt.state;
        self.remote_diag = pkt.diag;

        if pkt.required_min_rx < BFD_MIN_RX_FLOOR_US || pkt.required_min_rx > i32::MAX as u32 {
            return PacketOutcome::Discard(DiscardReason::MinRxOutOfRange(pkt.required_min_rx));
        }
        self.remote_min_rx_us = pkt.required_min_rx;

        // Until the session is Up, track the peer's desired TX to avoid
        // negotiation races; once Up, the configured value holds.
        if self.local_state != SessionState::Up {
            self.desired_min_tx_us = pkt.desired_min_tx;
        }
        self.recompute_effective_tx();

        // Transition table.
        let mut notify = None;
        if self.remote_state == SessionState::AdminDown {
            if self.local_state != SessionState::Down {
                self.local_diag = DiagCode::NeighborSignaledDown;
                self.set_state(SessionState::Down);
                notify = Some(NotifyState::Down);
            }
            // Nothing further to learn from an AdminDown peer; cancel any
            // armed detection timer instead of re-arming it.
            self.rx_epoch += 1;
            return PacketOutcome::Processed {
                notify,
                rearm_rx: None,
            };
        }

        match self.local_state {
            SessionState::Down => match self.remote_state {
                SessionState::Down => {
                    self.set_state(SessionState::Init);
                }
                SessionState::Init => {
                    self.local_diag = DiagCode::None;
                    self.set_state(SessionState::Up);
                    notify = Some(NotifyState::Up);
                }
                // Peer claims Up but has not seen us come up: no transition.
                _ => return PacketOutcome::Discard(DiscardReason::NoTransition),
            },
            SessionState::Init => {
                if self.remote_state >= SessionState::Init {
                    self.local_diag = DiagCode::None;
                    self.set_state(SessionState::Up);
                    notify = Some(NotifyState::Up);
                } else {
                    return PacketOutcome::Discard(DiscardReason::NoTransition);
                }
            }
            SessionState::Up => {
                if self.remote_state == SessionState::Down {
                    self.local_diag = DiagCode::NeighborSignaledDown;
                    self.set_state(SessionState::Down);
                    notify = Some(NotifyState::Down);
                }
            }
            // Terminal; the session is about to be destroyed.
            SessionState::AdminDown => {
                return PacketOutcome::Discard(DiscardReason::NoTransition)
            }
        }

        if self.local_state == SessionState::Up {
            self.local_diag = DiagCode::None;
            self.demand_mode_local = true;
            self.demand_mode_remote = pkt.demand;
        }

        self.consecutive_errors = 0;
        let epoch = self.arm_rx();
        PacketOutcome::Processed {
            notify,
            rearm_rx: Some((self.required_min_rx_us, epoch)),
        }
    }

    /// Handles a detection timer expiry: no valid packet arrived within one
    /// required-min-RX period.
    pub(crate) fn detect_timeout(&mut self) -> TimeoutOutcome {
        if self.local_state > SessionState::Down
            && self.consecutive_errors.saturating_add(1) >= u32::from(self.detect_multiplier)
        {
            self.local_diag = DiagCode::Expired;
            self.reset();
            TimeoutOutcome::Expired
        } else {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            TimeoutOutcome::Rearm {
                delay_us: self.required_min_rx_us,
                epoch: self.arm_rx(),
            }
        }
    }

    /// Next transmit delay: 70–90% of the effective interval, randomized to
    /// avoid self-synchronization with the peer (RFC 5880 §6.8.7).
    pub(crate) fn jittered_tx_delay_us(&self) -> u64 {
        let percent = rand::thread_rng().gen_range(70..=90u64);
        u64::from(self.effective_tx_us) * percent / 100
    }

    /// Builds the periodic control packet from current session fields.
    pub(crate) fn build_control_packet(&self) -> ControlPacket {
        ControlPacket {
            version: BFD_VERSION,
            diag: self.local_diag,
            state: self.local_state,
            poll: false,
            final_: false,
            control_plane_independent: false,
            auth_present: false,
            demand: self.demand_mode_local && self.local_state == SessionState::Up,
            multipoint: false,
            detect_multiplier: self.detect_multiplier,
            length: CONTROL_PACKET_LEN as u8,
            my_discriminator: self.local_discriminator,
            your_discriminator: self.remote_discriminator,
            desired_min_tx: self.desired_min_tx_us,
            required_min_rx: self.required_min_rx_us,
            // Echo is not supported, and 0 is the wire encoding for that.
            required_min_echo_rx: 0,
        }
    }

    /// Builds the final AdminDown packet sent at teardown or on a
    /// discriminator fault, so the peer need not wait out its detection time.
    pub(crate) fn build_final_packet(&self) -> ControlPacket {
        ControlPacket {
            state: SessionState::AdminDown,
            demand: false,
            ..self.build_control_packet()
        }
    }

    fn recompute_effective_tx(&mut self) {
        self.effective_tx_us = self.desired_min_tx_us.max(self.remote_min_rx_us);
    }

    fn arm_rx(&mut self) -> u64 {
        self.rx_epoch += 1;
        self.rx_epoch
    }

    fn set_state(&mut self, new: SessionState) {
        if new == self.local_state {
            return;
        }
        let now = Instant::now();
        debug!(
            key = %self.config.key,
            from = %self.local_state,
            to = %new,
            diag = %self.local_diag,
            "session state change"
        );
        self.previous_state = self.local_state;
        self.previous_state_duration = now.duration_since(self.last_state_change_at);
        self.last_state_change_at = now;
        self.local_state = new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionKey;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_session() -> Session {
        let key = SessionKey::new("Ethernet0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        Session::new(SessionConfig::new(key), 100, 1)
    }

    fn peer_packet(state: SessionState, my_disc: u32, your_disc: u32) -> ControlPacket {
        ControlPacket {
            version: BFD_VERSION,
            diag: DiagCode::None,
            state,
            poll: false,
            final_: false,
            control_plane_independent: false,
            auth_present: false,
            demand: false,
            multipoint: false,
            detect_multiplier: 3,
            length: CONTROL_PACKET_LEN as u8,
            my_discriminator: my_disc,
            your_discriminator: your_disc,
            desired_min_tx: 1_000_000,
            required_min_rx: 1_000_000,
            required_min_echo_rx: 0,
        }
    }

    fn feed(session: &mut Session, pkt: &ControlPacket) -> PacketOutcome {
        session.handle_packet(&pkt.encode())
    }

    fn bring_up(session: &mut Session, peer_disc: u32) {
        let disc = session.local_discriminator();
        feed(session, &peer_packet(SessionState::Down, peer_disc, 0));
        assert_eq!(session.local_state(), SessionState::Init);
        feed(session, &peer_packet(SessionState::Init, peer_disc, disc));
        assert_eq!(session.local_state(), SessionState::Up);
    }

    // --------------------------------------------------------------------
    // Defaults and reset
    // --------------------------------------------------------------------

    #[test]
    fn test_new_session_defaults() {
        let session = test_session();
        assert_eq!(session.local_state(), SessionState::Down);
        assert_eq!(session.remote_state(), SessionState::Down);
        assert_eq!(session.local_discriminator(), 100);
        assert_eq!(session.remote_discriminator(), 0);
        assert_eq!(session.desired_min_tx_us, 1_000_000);
        assert_eq!(session.required_min_rx_us(), 1_000_000);
        assert_eq!(session.remote_min_rx_us(), 1);
        assert_eq!(session.detect_multiplier(), 3);
        assert_eq!(session.effective_tx_us(), 1_000_000);
        assert_eq!(session.consecutive_errors(), 0);
    }

    #[test]
    fn test_reset_preserves_local_diag() {
        let mut session = test_session();
        bring_up(&mut session, 200);
        session.set_local_diag(DiagCode::Expired);
        session.reset();
        assert_eq!(session.local_diag(), DiagCode::Expired);
        assert_eq!(session.local_state(), SessionState::Down);
        assert_eq!(session.remote_discriminator(), 0);
        assert!(!session.demand_mode_local());
    }

    // --------------------------------------------------------------------
    // Validation discards
    // --------------------------------------------------------------------

    #[test]
    fn test_discard_truncated() {
        let mut session = test_session();
        let raw = peer_packet(SessionState::Down, 200, 0).encode();
        assert_eq!(
            session.handle_packet(&raw[..20]),
            PacketOutcome::Discard(DiscardReason::Malformed(WireError::Truncated(20)))
        );
    }

    #[test]
    fn test_discard_bad_version() {
        let mut session = test_session();
        let mut pkt = peer_packet(SessionState::Down, 200, 0);
        pkt.version = 0;
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::BadVersion(0))
        );
        assert_eq!(session.remote_discriminator(), 0);
    }

    #[test]
    fn test_discard_length_mismatch() {
        let mut session = test_session();
        let mut pkt = peer_packet(SessionState::Down, 200, 0);
        pkt.length = 48; // claims an auth section we did not consume
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::LengthMismatch(48))
        );
    }

    #[test]
    fn test_discard_zero_multiplier() {
        let mut session = test_session();
        let mut pkt = peer_packet(SessionState::Down, 200, 0);
        pkt.detect_multiplier = 0;
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::ZeroDetectMultiplier)
        );
    }

    #[test]
    fn test_discard_zero_my_discriminator() {
        let mut session = test_session();
        let pkt = peer_packet(SessionState::Down, 0, 0);
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::ZeroRemoteDiscriminator)
        );
    }

    #[test]
    fn test_discard_unlearned_but_progressed() {
        let mut session = test_session();
        // Peer claims Init without knowing our discriminator.
        let pkt = peer_packet(SessionState::Init, 200, 0);
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::UnlearnedButProgressed)
        );
    }

    #[test]
    fn test_your_discriminator_mismatch_is_fault() {
        let mut session = test_session();
        let pkt = peer_packet(SessionState::Down, 200, 999);
        assert_eq!(feed(&mut session, &pkt), PacketOutcome::Fault);
        assert_eq!(session.local_diag(), DiagCode::Expired);
        assert_eq!(session.consecutive_errors(), 1);
        // Nothing was learned from the faulting packet.
        assert_eq!(session.remote_discriminator(), 0);
    }

    #[test]
    fn test_discard_auth_bit_unexpected() {
        let mut session = test_session();
        let mut pkt = peer_packet(SessionState::Down, 200, 0);
        pkt.auth_present = true;
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::AuthMismatch)
        );
    }

    #[test]
    fn test_discard_auth_bit_missing_when_required() {
        let key = SessionKey::new("Ethernet0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let config = SessionConfig::new(key).with_auth_required(true);
        let mut session = Session::new(config, 100, 1);
        let pkt = peer_packet(SessionState::Down, 200, 0);
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::AuthMismatch)
        );
    }

    #[test]
    fn test_discard_peer_identity_changed() {
        let mut session = test_session();
        feed(&mut session, &peer_packet(SessionState::Down, 200, 0));
        assert_eq!(session.remote_discriminator(), 200);

        let outcome = feed(&mut session, &peer_packet(SessionState::Down, 201, 100));
        assert_eq!(
            outcome,
            PacketOutcome::Discard(DiscardReason::PeerIdentityChanged)
        );
        assert_eq!(session.remote_discriminator(), 200);
    }

    #[test]
    fn test_min_rx_floor_enforced() {
        let mut session = test_session();
        let mut pkt = peer_packet(SessionState::Down, 200, 0);
        pkt.required_min_rx = 5_000;
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::MinRxOutOfRange(5_000))
        );
        assert!(session.remote_min_rx_us() >= 1); // untouched initial value
        assert_eq!(session.remote_min_rx_us(), BFD_REMOTE_MIN_RX_INIT_US);

        pkt.required_min_rx = (i32::MAX as u32) + 1;
        assert_eq!(
            feed(&mut session, &pkt),
            PacketOutcome::Discard(DiscardReason::MinRxOutOfRange((i32::MAX as u32) + 1))
        );
    }

    #[test]
    fn test_reserved_diag_does_not_block_processing() {
        let mut session = test_session();
        let mut raw = peer_packet(SessionState::Down, 200, 0).encode();
        raw[0] = (BFD_VERSION << 5) | 9; // reserved diagnostic value

        match session.handle_packet(&raw) {
            PacketOutcome::Processed { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.local_state(), SessionState::Init);
        assert_eq!(session.remote_diag(), DiagCode::None);
    }

    // --------------------------------------------------------------------
    // Learning and negotiation
    // --------------------------------------------------------------------

    #[test]
    fn test_learns_remote_discriminator_and_state() {
        let mut session = test_session();
        let mut pkt = peer_packet(SessionState::Down, 200, 0);
        pkt.diag = DiagCode::Expired;
        feed(&mut session, &pkt);

        assert_eq!(session.remote_discriminator(), 200);
        assert_eq!(session.remote_state(), SessionState::Down);
        assert_eq!(session.remote_diag(), DiagCode::Expired);
    }

    #[test]
    fn test_effective_tx_tracks_remote_min_rx() {
        let mut session = test_session();
        let mut pkt = peer_packet(SessionState::Down, 200, 0);
        pkt.required_min_rx = 2_000_000;
        pkt.desired_min_tx = 500_000;
        feed(&mut session, &pkt);

        assert_eq!(session.remote_min_rx_us(), 2_000_000);
        // Not yet Up: peer's desired TX was adopted.
        assert_eq!(session.desired_min_tx_us, 500_000);
        assert_eq!(session.effective_tx_us(), 2_000_000);
    }

    #[test]
    fn test_desired_tx_retained_once_up() {
        let mut session = test_session();
        bring_up(&mut session, 200);
        let desired_before = session.desired_min_tx_us;

        let mut pkt = peer_packet(SessionState::Up, 200, 100);
        pkt.desired_min_tx = 50_000;
        feed(&mut session, &pkt);
        assert_eq!(session.desired_min_tx_us, desired_before);
    }

    // --------------------------------------------------------------------
    // Transition table
    // --------------------------------------------------------------------

    #[test]
    fn test_down_to_init_on_remote_down() {
        let mut session = test_session();
        let outcome = feed(&mut session, &peer_packet(SessionState::Down, 200, 0));
        assert_eq!(session.local_state(), SessionState::Init);
        // Init is externally still Down: no notification.
        match outcome {
            PacketOutcome::Processed { notify, rearm_rx } => {
                assert_eq!(notify, None);
                assert!(rearm_rx.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_down_to_up_on_remote_init() {
        let mut session = test_session();
        let outcome = feed(&mut session, &peer_packet(SessionState::Init, 200, 100));
        assert_eq!(session.local_state(), SessionState::Up);
        assert_eq!(session.local_diag(), DiagCode::None);
        assert!(session.demand_mode_local());
        match outcome {
            PacketOutcome::Processed { notify, .. } => {
                assert_eq!(notify, Some(NotifyState::Up))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_down_stays_down_on_remote_up() {
        let mut session = test_session();
        let outcome = feed(&mut session, &peer_packet(SessionState::Up, 200, 100));
        assert_eq!(
            outcome,
            PacketOutcome::Discard(DiscardReason::NoTransition)
        );
        assert_eq!(session.local_state(), SessionState::Down);
    }

    #[test]
    fn test_init_to_up_on_remote_init_or_up() {
        for remote in [SessionState::Init, SessionState::Up] {
            let mut session = test_session();
            feed(&mut session, &peer_packet(SessionState::Down, 200, 0));
            assert_eq!(session.local_state(), SessionState::Init);

            feed(&mut session, &peer_packet(remote, 200, 100));
            assert_eq!(session.local_state(), SessionState::Up);
            assert_eq!(session.local_diag(), DiagCode::None);
        }
    }

    #[test]
    fn test_init_stays_init_on_remote_down() {
        let mut session = test_session();
        feed(&mut session, &peer_packet(SessionState::Down, 200, 0));
        let outcome = feed(&mut session, &peer_packet(SessionState::Down, 200, 100));
        assert_eq!(
            outcome,
            PacketOutcome::Discard(DiscardReason::NoTransition)
        );
        assert_eq!(session.local_state(), SessionState::Init);
    }

    #[test]
    fn test_up_to_down_on_remote_down() {
        let mut session = test_session();
        bring_up(&mut session, 200);

        let outcome = feed(&mut session, &peer_packet(SessionState::Down, 200, 100));
        assert_eq!(session.local_state(), SessionState::Down);
        assert_eq!(session.local_diag(), DiagCode::NeighborSignaledDown);
        match outcome {
            PacketOutcome::Processed { notify, .. } => {
                assert_eq!(notify, Some(NotifyState::Down))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_up_stays_up_on_remote_up() {
        let mut session = test_session();
        bring_up(&mut session, 200);
        let outcome = feed(&mut session, &peer_packet(SessionState::Up, 200, 100));
        assert_eq!(session.local_state(), SessionState::Up);
        match outcome {
            PacketOutcome::Processed { notify, rearm_rx } => {
                assert_eq!(notify, None);
                assert!(rearm_rx.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_remote_admin_down_takes_session_down() {
        let mut session = test_session();
        bring_up(&mut session, 200);

        let outcome = feed(&mut session, &peer_packet(SessionState::AdminDown, 200, 100));
        assert_eq!(session.local_state(), SessionState::Down);
        assert_eq!(session.local_diag(), DiagCode::NeighborSignaledDown);
        match outcome {
            PacketOutcome::Processed { notify, rearm_rx } => {
                assert_eq!(notify, Some(NotifyState::Down));
                // No detection timer re-arm for an AdminDown peer.
                assert_eq!(rearm_rx, None);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_remote_admin_down_while_down_is_silent() {
        let mut session = test_session();
        feed(&mut session, &peer_packet(SessionState::Down, 200, 0));
        assert_eq!(session.local_state(), SessionState::Init);
        // Back to Down first.
        feed(&mut session, &peer_packet(SessionState::AdminDown, 200, 100));
        assert_eq!(session.local_state(), SessionState::Down);

        let outcome = feed(&mut session, &peer_packet(SessionState::AdminDown, 200, 100));
        match outcome {
            PacketOutcome::Processed { notify, rearm_rx } => {
                assert_eq!(notify, None);
                assert_eq!(rearm_rx, None);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_demand_flag_learned_on_up() {
        let mut session = test_session();
        feed(&mut session, &peer_packet(SessionState::Down, 200, 0));
        let mut pkt = peer_packet(SessionState::Init, 200, 100);
        pkt.demand = true;
        feed(&mut session, &pkt);

        assert!(session.demand_mode_local());
        assert!(session.demand_mode_remote());
    }

    #[test]
    fn test_valid_packet_resets_error_counter() {
        let mut session = test_session();
        bring_up(&mut session, 200);
        session.detect_timeout();
        assert_eq!(session.consecutive_errors(), 1);

        feed(&mut session, &peer_packet(SessionState::Up, 200, 100));
        assert_eq!(session.consecutive_errors(), 0);
    }

    // --------------------------------------------------------------------
    // Detection timeout
    // --------------------------------------------------------------------

    #[test]
    fn test_detect_timeout_counts_then_expires() {
        let mut session = test_session();
        bring_up(&mut session, 200);

        // Multiplier 3: two non-fatal expirations, the third takes it down.
        for expected in 1..=2u32 {
            match session.detect_timeout() {
                TimeoutOutcome::Rearm { delay_us, .. } => {
                    assert_eq!(delay_us, session.required_min_rx_us())
                }
                other => panic!("unexpected outcome {:?}", other),
            }
            assert_eq!(session.consecutive_errors(), expected);
            assert_eq!(session.local_state(), SessionState::Up);
        }

        assert_eq!(session.detect_timeout(), TimeoutOutcome::Expired);
        assert_eq!(session.local_state(), SessionState::Down);
        assert_eq!(session.local_diag(), DiagCode::Expired);
        // reset() wiped the learned peer identity.
        assert_eq!(session.remote_discriminator(), 0);
    }

    #[test]
    fn test_detect_timeout_while_down_only_counts() {
        let mut session = test_session();
        for i in 1..=5u32 {
            match session.detect_timeout() {
                TimeoutOutcome::Rearm { .. } => {}
                other => panic!("unexpected outcome {:?}", other),
            }
            assert_eq!(session.consecutive_errors(), i);
        }
        assert_eq!(session.local_state(), SessionState::Down);
    }

    #[test]
    fn test_error_counter_saturates() {
        let mut session = test_session();
        session.consecutive_errors = u32::MAX;

        // Perpetual-Down paths keep counting; the counter must pin at MAX
        // instead of wrapping.
        assert_eq!(
            session.transmit_cycle(false),
            TransmitOutcome::Skip { went_down: false }
        );
        assert_eq!(session.consecutive_errors(), u32::MAX);

        session.consecutive_errors = u32::MAX;
        match session.detect_timeout() {
            TimeoutOutcome::Rearm { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.consecutive_errors(), u32::MAX);
    }

    #[test]
    fn test_rx_epoch_advances_on_rearm() {
        let mut session = test_session();
        let before = session.rx_epoch();
        match session.detect_timeout() {
            TimeoutOutcome::Rearm { epoch, .. } => {
                assert_eq!(epoch, before + 1);
                assert_eq!(session.rx_epoch(), epoch);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    // --------------------------------------------------------------------
    // Transmit cycle
    // --------------------------------------------------------------------

    #[test]
    fn test_transmit_builds_packet_from_session() {
        let mut session = test_session();
        bring_up(&mut session, 200);

        match session.transmit_cycle(true) {
            TransmitOutcome::Send(pkt) => {
                assert_eq!(pkt.version, BFD_VERSION);
                assert_eq!(pkt.state, SessionState::Up);
                assert_eq!(pkt.diag, DiagCode::None);
                assert_eq!(pkt.my_discriminator, 100);
                assert_eq!(pkt.your_discriminator, 200);
                assert_eq!(pkt.detect_multiplier, 3);
                assert_eq!(pkt.length as usize, CONTROL_PACKET_LEN);
                assert_eq!(pkt.required_min_echo_rx, 0);
                assert!(pkt.demand);
                assert!(!pkt.poll && !pkt.final_ && !pkt.auth_present && !pkt.multipoint);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_transmit_unreachable_takes_up_session_down() {
        let mut session = test_session();
        bring_up(&mut session, 200);

        let outcome = session.transmit_cycle(false);
        assert_eq!(outcome, TransmitOutcome::Skip { went_down: true });
        assert_eq!(session.local_state(), SessionState::Down);
        assert_eq!(session.local_diag(), DiagCode::AdminDown);
        assert_eq!(session.remote_discriminator(), 0);
    }

    #[test]
    fn test_transmit_unreachable_while_down_just_counts() {
        let mut session = test_session();
        let outcome = session.transmit_cycle(false);
        assert_eq!(outcome, TransmitOutcome::Skip { went_down: false });
        assert_eq!(session.consecutive_errors(), 1);
        assert_eq!(session.local_state(), SessionState::Down);
    }

    #[test]
    fn test_final_packet_is_admin_down() {
        let mut session = test_session();
        bring_up(&mut session, 200);
        session.set_local_diag(DiagCode::AdminDown);

        let pkt = session.build_final_packet();
        assert_eq!(pkt.state, SessionState::AdminDown);
        assert_eq!(pkt.diag, DiagCode::AdminDown);
        assert_eq!(pkt.my_discriminator, 100);
        assert_eq!(pkt.your_discriminator, 200);
        assert!(!pkt.demand);
    }

    // --------------------------------------------------------------------
    // Jitter
    // --------------------------------------------------------------------

    #[test]
    fn test_jitter_bounds() {
        let session = test_session();
        let base = u64::from(session.effective_tx_us());
        for _ in 0..200 {
            let delay = session.jittered_tx_delay_us();
            assert!(delay >= base * 70 / 100, "delay {} below 70%", delay);
            assert!(delay <= base * 90 / 100, "delay {} above 90%", delay);
        }
    }

    // --------------------------------------------------------------------
    // Uptime bookkeeping
    // --------------------------------------------------------------------

    #[test]
    fn test_state_change_bookkeeping() {
        let mut session = test_session();
        bring_up(&mut session, 200);
        let (prev, _) = session.previous_state();
        assert_eq!(prev, SessionState::Init);

        feed(&mut session, &peer_packet(SessionState::Down, 200, 100));
        let (prev, _) = session.previous_state();
        assert_eq!(prev, SessionState::Up);
    }
}
