//! Protocol version constant

/// USB/IP wire protocol version, as carried in every op-code preamble.
///
/// This is a fixed value (1.1.1) defined by the Linux kernel's USB/IP
/// documentation, not a negotiated semantic version: a peer sending
/// anything else is a hard protocol mismatch.
pub const USBIP_VERSION: u16 = 0x0111;
