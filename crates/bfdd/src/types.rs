//! BFD types and data structures.

use std::fmt;
use std::net::IpAddr;

/// BFD protocol version carried in every control packet.
pub const BFD_VERSION: u8 = 1;

/// UDP destination port for single-hop BFD control packets (RFC 5881).
pub const BFD_CONTROL_PORT: u16 = 3784;

/// UDP port reserved for the BFD echo function (not processed by this engine).
pub const BFD_ECHO_PORT: u16 = 3785;

/// BFD source port range start (RFC 5881 §4).
pub const BFD_SRCPORT_INIT: u16 = 49152;

/// BFD source port range end.
pub const BFD_SRCPORT_MAX: u16 = 65535;

/// Number of source port bind attempts before giving up.
pub const NUM_BFD_SRCPORT_RETRIES: u8 = 3;

/// Default desired minimum TX interval in microseconds (RFC 5880 §6.8.1).
pub const BFD_DEFAULT_DESIRED_TX_US: u32 = 1_000_000;

/// Default required minimum RX interval in microseconds.
pub const BFD_DEFAULT_REQUIRED_RX_US: u32 = 1_000_000;

/// Default detection multiplier.
pub const BFD_DEFAULT_DETECT_MULTIPLIER: u8 = 3;

/// Lower bound the engine enforces on any required-min-RX value, microseconds.
pub const BFD_MIN_RX_FLOOR_US: u32 = 10_000;

/// Initial remote required-min-RX before the peer reports its real floor.
/// 1 µs means "as fast as you like" until the first valid packet arrives.
pub const BFD_REMOTE_MIN_RX_INIT_US: u32 = 1;

/// TTL set on outbound control packets (GTSM-style single-hop value).
pub const BFD_CONTROL_TTL: u32 = 255;

/// BFD session state.
///
/// Variant order matches the 2-bit wire encoding, so the derived `Ord`
/// reflects the protocol's `AdminDown < Down < Init < Up` progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SessionState {
    /// Administratively disabled; terminal, only reached during teardown.
    AdminDown,
    /// Not yet established.
    #[default]
    Down,
    /// Seen the peer, waiting for it to see us.
    Init,
    /// Session operational.
    Up,
}

impl SessionState {
    /// Returns the 2-bit wire value for this state.
    pub fn wire_value(&self) -> u8 {
        match self {
            Self::AdminDown => 0,
            Self::Down => 1,
            Self::Init => 2,
            Self::Up => 3,
        }
    }

    /// Creates a state from its 2-bit wire value.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AdminDown),
            1 => Some(Self::Down),
            2 => Some(Self::Init),
            3 => Some(Self::Up),
            _ => None,
        }
    }

    /// Collapses this state to the externally visible up/down status.
    ///
    /// Init is not yet usable, so it maps to Down for consumers.
    pub fn notify_state(&self) -> NotifyState {
        match self {
            Self::AdminDown => NotifyState::AdminDown,
            Self::Down | Self::Init => NotifyState::Down,
            Self::Up => NotifyState::Up,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AdminDown => "AdminDown",
            Self::Down => "Down",
            Self::Init => "Init",
            Self::Up => "Up",
        };
        write!(f, "{}", s)
    }
}

/// Externally visible session status reported to the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyState {
    /// Session administratively torn down.
    AdminDown,
    /// Path must not be treated as usable.
    Down,
    /// Path usable.
    Up,
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AdminDown => "AdminDown",
            Self::Down => "Down",
            Self::Up => "Up",
        };
        write!(f, "{}", s)
    }
}

/// BFD diagnostic code: the reason for the most recent state change
/// (RFC 5880 §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DiagCode {
    /// No diagnostic.
    #[default]
    None,
    /// Control detection time expired.
    Expired,
    /// Echo function failed (echo is out of scope; decoded for completeness).
    EchoFailed,
    /// Neighbor signaled session down.
    NeighborSignaledDown,
    /// Forwarding plane reset.
    ForwardingReset,
    /// Path down.
    PathDown,
    /// Concatenated path down.
    ConcatPathDown,
    /// Administratively down.
    AdminDown,
    /// Reverse concatenated path down.
    ReverseConcatPathDown,
}

impl DiagCode {
    /// Returns the 5-bit wire value for this diagnostic.
    pub fn wire_value(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Expired => 1,
            Self::EchoFailed => 2,
            Self::NeighborSignaledDown => 3,
            Self::ForwardingReset => 4,
            Self::PathDown => 5,
            Self::ConcatPathDown => 6,
            Self::AdminDown => 7,
            Self::ReverseConcatPathDown => 8,
        }
    }

    /// Creates a diagnostic from its 5-bit wire value.
    ///
    /// Values 9–31 are reserved by the RFC and yield `None`.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Expired),
            2 => Some(Self::EchoFailed),
            3 => Some(Self::NeighborSignaledDown),
            4 => Some(Self::ForwardingReset),
            5 => Some(Self::PathDown),
            6 => Some(Self::ConcatPathDown),
            7 => Some(Self::AdminDown),
            8 => Some(Self::ReverseConcatPathDown),
            _ => None,
        }
    }
}

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Expired => "detection time expired",
            Self::EchoFailed => "echo function failed",
            Self::NeighborSignaledDown => "neighbor signaled session down",
            Self::ForwardingReset => "forwarding plane reset",
            Self::PathDown => "path down",
            Self::ConcatPathDown => "concatenated path down",
            Self::AdminDown => "administratively down",
            Self::ReverseConcatPathDown => "reverse concatenated path down",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a monitored destination: the directly connected peer and the
/// interface it is reached through. At most one session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Interface name the peer is reached through.
    pub interface: String,
    /// Peer IP address.
    pub peer: IpAddr,
}

impl SessionKey {
    /// Creates a new session key.
    pub fn new(interface: impl Into<String>, peer: IpAddr) -> Self {
        Self {
            interface: interface.into(),
            peer,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.interface, self.peer)
    }
}

/// Per-session configuration supplied by the caller at creation time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session key.
    pub key: SessionKey,
    /// Local address to bind the transport to.
    pub local_addr: Option<IpAddr>,
    /// Administratively desired minimum TX interval, microseconds.
    pub desired_tx_us: u32,
    /// Locally required minimum RX interval, microseconds.
    pub required_rx_us: u32,
    /// Detection multiplier.
    pub detect_multiplier: u8,
    /// Whether received packets must carry the authentication bit.
    /// Payload validation itself is not performed by this engine.
    pub auth_required: bool,
}

impl SessionConfig {
    /// Creates a config with RFC default timing.
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            local_addr: None,
            desired_tx_us: BFD_DEFAULT_DESIRED_TX_US,
            required_rx_us: BFD_DEFAULT_REQUIRED_RX_US,
            detect_multiplier: BFD_DEFAULT_DETECT_MULTIPLIER,
            auth_required: false,
        }
    }

    /// Sets the local bind address.
    pub fn with_local_addr(mut self, addr: IpAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Sets the desired minimum TX interval in microseconds.
    pub fn with_desired_tx_us(mut self, us: u32) -> Self {
        self.desired_tx_us = us;
        self
    }

    /// Sets the required minimum RX interval in microseconds.
    pub fn with_required_rx_us(mut self, us: u32) -> Self {
        self.required_rx_us = us;
        self
    }

    /// Sets the detection multiplier.
    pub fn with_detect_multiplier(mut self, multiplier: u8) -> Self {
        self.detect_multiplier = multiplier;
        self
    }

    /// Requires received packets to carry the authentication bit.
    pub fn with_auth_required(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    /// Validates the configured timing against the engine's invariants.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.detect_multiplier == 0 {
            return Err("detect multiplier must be nonzero".to_string());
        }
        if self.required_rx_us < BFD_MIN_RX_FLOOR_US {
            return Err(format!(
                "required min rx {} µs below {} µs floor",
                self.required_rx_us, BFD_MIN_RX_FLOOR_US
            ));
        }
        if self.required_rx_us > i32::MAX as u32 {
            return Err(format!(
                "required min rx {} µs exceeds i32::MAX",
                self.required_rx_us
            ));
        }
        Ok(())
    }
}

/// Session state change notification delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    /// Monitored target.
    pub key: SessionKey,
    /// Externally visible status.
    pub state: NotifyState,
}

impl SessionUpdate {
    /// Creates a new update.
    pub fn new(key: SessionKey, state: NotifyState) -> Self {
        Self { key, state }
    }
}
