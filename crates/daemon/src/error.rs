//! Session-level error taxonomy (`spec.md` §7). URB-level failures never
//! appear here — they are translated to wire status bytes inline in
//! `EndpointPipeline` and never abort a session.
//!
//! Two rows of the spec's error table have no variant here, by design (see
//! `SPEC_FULL.md` §7): `PeerCancelled` ("client sent UNLINK for live URB") is
//! realized entirely inline as a `RET_UNLINK` reply in
//! `SessionMultiplexer::drain_unlinks` and never aborts the session, so no
//! caller would ever construct a session-level error for it. `Unbound`
//! ("operator removed share while attached") would require a live
//! notification path from `DeviceStore` back into a running session keyed by
//! `AttachHandle`, which in turn requires an operator-facing admin surface to
//! trigger the unbind in the first place — that surface is the CLI/TUI
//! front-end, an explicit Non-goal (`spec.md` §1). With no in-scope caller
//! able to ever trigger it, the variant would be permanently dead code.

use protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid protocol: {0}")]
    InvalidProtocol(#[from] ProtocolError),

    #[error("duplicate SUBMIT seqnum {0}: fatal per spec, not merely dropped")]
    DuplicateSeqnum(u32),

    #[error("too many in-flight SUBMITs: safety cap exceeded")]
    TooManyInFlight,

    #[error("client sent a reply-only URB command (RET_SUBMIT/RET_UNLINK)")]
    UnexpectedReply,

    #[error("device not found")]
    DeviceNotFound,

    #[error("device busy")]
    DeviceBusy,

    #[error("device error: {0}")]
    DeviceError(String),

    #[error("device unplugged")]
    Unplugged,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
