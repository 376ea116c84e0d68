//! BFD (Bidirectional Forwarding Detection, RFC 5880/5881) session engine.
//!
//! Monitors liveness of directly attached destinations by exchanging
//! periodic control packets over per-session connected UDP sockets, and
//! reports Up/Down transitions through daemon-supplied callbacks.
//!
//! ```text
//!    +-----------+   commands    +--------------------+
//!    | BfdEngine | ------------> |   worker task      |
//!    |  (handle) |   (mpsc)      |  SessionRegistry   |
//!    +-----------+               |   Session FSMs     |
//!         ^                      +---------+----------+
//!         |                           |         |
//!    create/destroy/           RouteCallbacks  Transport
//!    lookup/shutdown           (reachability,  (UDP port 3784,
//!                               notifications)  TTL 255)
//! ```
//!
//! All session state lives in the single worker task; timers are detached
//! sleeps that enqueue commands carrying the generation and epoch they were
//! armed with, and stale ones are dropped by the worker. See
//! [`engine::BfdEngine`] for the entry point.

pub mod engine;
pub mod error;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;
pub mod wire;

pub use engine::BfdEngine;
pub use error::{CreateError, SendError, TransportError, WireError};
pub use registry::{RegistryStats, RouteCallbacks};
pub use session::Session;
pub use transport::{InboundSink, SessionTransport, Transport, UdpTransport};
pub use types::{
    DiagCode, NotifyState, SessionConfig, SessionKey, SessionState, SessionUpdate,
    BFD_CONTROL_PORT, BFD_ECHO_PORT,
};
pub use wire::{ControlPacket, CONTROL_PACKET_LEN};
