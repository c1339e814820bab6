//! The per-attached-session URB multiplexer (`spec.md` §4.C/§4.D): the
//! bidirectional pipeline between one client socket and the claimed USB
//! device, plus the connection-setup handshake that hands control to it.
//!
//! Grounded in the teacher's `ClientConnection` (`server/src/network/connection.rs`):
//! one struct owning per-client state, a `run()` loop built on
//! `tokio::select!`, and a cancellation-aware shutdown path. The teacher
//! multiplexes many device handles over one QUIC connection; this session
//! multiplexes many endpoints of one already-claimed device over one TCP
//! connection, so the device-handle bookkeeping collapses into the
//! endpoint-keyed maps `spec.md` §4.D describes.

pub mod endpoint;
pub mod multiplexer;
pub mod setup;

pub use endpoint::EndpointPipeline;
pub use multiplexer::{ReplyPacket, SessionMultiplexer, UnlinkRecord};
pub use setup::{SessionBinder, SessionSetup};

use protocol::header::{BasicHeader, Direction};

/// The combined endpoint-number + direction byte used throughout the core
/// to key endpoint pipelines and `abort_endpoint` calls (e.g. `0x81` for
/// endpoint 1 IN). The wire header carries endpoint number and direction as
/// separate fields; this folds them back into the one-byte form USB
/// descriptors and `rusb` both use.
pub fn raw_endpoint(basic: &BasicHeader) -> u8 {
    let ep = (basic.endpoint & 0x0f) as u8;
    match basic.direction {
        Direction::In => ep | 0x80,
        Direction::Out => ep,
    }
}

/// For control endpoint 0, the direction used for payload framing comes
/// from bit 7 of `bmRequestType` in the setup packet, not from the header's
/// `direction` field (`spec.md` §4.C, testable property 8). For every other
/// endpoint the header's own direction governs.
pub fn effective_direction(basic: &BasicHeader, setup: &[u8; 8]) -> Direction {
    if basic.endpoint == 0 {
        if setup[0] & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    } else {
        basic.direction
    }
}
