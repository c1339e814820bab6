//! Linux errno constants used as negative status values on the wire.
//!
//! USB/IP reports failures as the negated errno a Linux URB completion
//! would have carried. These are the handful the daemon actually produces.

pub const ECONNRESET: i32 = 104;
pub const EPIPE: i32 = 32;
pub const ETIME: i32 = 62;
pub const EOVERFLOW: i32 = 75;
pub const EPROTO: i32 = 71;

pub const STATUS_OK: i32 = 0;
pub const STATUS_ECONNRESET: i32 = -ECONNRESET;
pub const STATUS_EPIPE: i32 = -EPIPE;
pub const STATUS_ETIME: i32 = -ETIME;
pub const STATUS_EOVERFLOW: i32 = -EOVERFLOW;
pub const STATUS_EPROTO: i32 = -EPROTO;
