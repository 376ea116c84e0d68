//! BFD control packet wire codec.
//!
//! Encodes and decodes the fixed 24-byte mandatory section of the BFD
//! control header (RFC 5880 §4.1), network byte order:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       My Discriminator                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Your Discriminator                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Desired Min TX Interval                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Required Min RX Interval                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Required Min Echo RX Interval                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The codec is pure and stateless; semantic validation (version, length
//! consistency, discriminator rules) belongs to the session FSM.

use byteorder::{ByteOrder, NetworkEndian};

use crate::error::WireError;
use crate::types::{DiagCode, SessionState};

/// Length of the mandatory control packet section. This engine neither
/// produces nor accepts an authentication section, so packets are exactly
/// this long.
pub const CONTROL_PACKET_LEN: usize = 24;

/// A decoded BFD control packet. Ephemeral: built for one encode or
/// discarded after one decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacket {
    /// Protocol version (3 bits). Always 1 on transmit.
    pub version: u8,
    /// Diagnostic code (5 bits).
    pub diag: DiagCode,
    /// Session state (2 bits).
    pub state: SessionState,
    /// Poll flag.
    pub poll: bool,
    /// Final flag.
    pub final_: bool,
    /// Control plane independent flag.
    pub control_plane_independent: bool,
    /// Authentication present flag.
    pub auth_present: bool,
    /// Demand mode flag.
    pub demand: bool,
    /// Multipoint flag (RFC requires zero; carried verbatim).
    pub multipoint: bool,
    /// Detection multiplier.
    pub detect_multiplier: u8,
    /// Advertised packet length in bytes.
    pub length: u8,
    /// Sender's discriminator for this session.
    pub my_discriminator: u32,
    /// Sender's view of our discriminator; 0 until learned.
    pub your_discriminator: u32,
    /// Desired minimum TX interval, microseconds.
    pub desired_min_tx: u32,
    /// Required minimum RX interval, microseconds.
    pub required_min_rx: u32,
    /// Required minimum echo RX interval, microseconds.
    pub required_min_echo_rx: u32,
}

impl ControlPacket {
    /// Encodes this packet into its 24-byte wire representation.
    pub fn encode(&self) -> [u8; CONTROL_PACKET_LEN] {
        let mut buf = [0u8; CONTROL_PACKET_LEN];

        buf[0] = (self.version << 5) | (self.diag.wire_value() & 0x1f);

        let mut flags = self.state.wire_value() << 6;
        if self.poll {
            flags |= 0x20;
        }
        if self.final_ {
            flags |= 0x10;
        }
        if self.control_plane_independent {
            flags |= 0x08;
        }
        if self.auth_present {
            flags |= 0x04;
        }
        if self.demand {
            flags |= 0x02;
        }
        if self.multipoint {
            flags |= 0x01;
        }
        buf[1] = flags;

        buf[2] = self.detect_multiplier;
        buf[3] = self.length;
        NetworkEndian::write_u32(&mut buf[4..8], self.my_discriminator);
        NetworkEndian::write_u32(&mut buf[8..12], self.your_discriminator);
        NetworkEndian::write_u32(&mut buf[12..16], self.desired_min_tx);
        NetworkEndian::write_u32(&mut buf[16..20], self.required_min_rx);
        NetworkEndian::write_u32(&mut buf[20..24], self.required_min_echo_rx);

        buf
    }

    /// Decodes the mandatory section from the start of `bytes`.
    ///
    /// Consumes exactly [`CONTROL_PACKET_LEN`] bytes; trailing bytes are left
    /// for the caller to judge against the advertised length field.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < CONTROL_PACKET_LEN {
            return Err(WireError::Truncated(bytes.len()));
        }

        let version = bytes[0] >> 5;
        // Reserved diagnostic values (9-31) do not invalidate the packet;
        // the diagnostic is informational and unknown codes read as None.
        let diag = DiagCode::from_wire(bytes[0] & 0x1f).unwrap_or_default();

        let flags = bytes[1];
        // 2-bit field, from_wire covers all values 0..=3.
        let state = SessionState::from_wire(flags >> 6).unwrap_or_default();

        Ok(Self {
            version,
            diag,
            state,
            poll: flags & 0x20 != 0,
            final_: flags & 0x10 != 0,
            control_plane_independent: flags & 0x08 != 0,
            auth_present: flags & 0x04 != 0,
            demand: flags & 0x02 != 0,
            multipoint: flags & 0x01 != 0,
            detect_multiplier: bytes[2],
            length: bytes[3],
            my_discriminator: NetworkEndian::read_u32(&bytes[4..8]),
            your_discriminator: NetworkEndian::read_u32(&bytes[8..12]),
            desired_min_tx: NetworkEndian::read_u32(&bytes[12..16]),
            required_min_rx: NetworkEndian::read_u32(&bytes[16..20]),
            required_min_echo_rx: NetworkEndian::read_u32(&bytes[20..24]),
        })
    }
}
