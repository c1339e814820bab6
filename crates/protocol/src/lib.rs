//! USB/IP wire protocol: the op-code preamble, the 48-byte URB header, and
//! exported-device descriptor encoding.
//!
//! All multi-byte integers are big-endian. Reads are length-exact: a short
//! read is always surfaced as [`error::ProtocolError::Io`], never silently
//! padded.

pub mod device;
pub mod errno;
pub mod error;
pub mod header;
pub mod iso;
pub mod op;
pub mod version;

pub use device::{BusId, ExportedDevice, InterfaceDescriptor, VidPid};
pub use error::{ProtocolError, Result};
pub use header::{
    BasicHeader, Command, Direction, HEADER_SIZE, RetSubmitFields, RetUnlinkFields, SubmitFields,
    UnlinkFields, UrbHeader, read_header, write_header,
};
pub use iso::{IsoPacketDescriptor, ISO_DESCRIPTOR_SIZE, recompute_actual_offsets};
pub use op::{BUSID_SIZE, OpCode, Status, SYSFS_PATH_SIZE};
pub use version::USBIP_VERSION;

#[cfg(feature = "async")]
pub use header::r#async::{read_header as read_header_async, write_header as write_header_async};
#[cfg(feature = "async")]
pub use iso::r#async::{
    read_iso_descriptor as read_iso_descriptor_async, write_iso_descriptor as write_iso_descriptor_async,
};
#[cfg(feature = "async")]
pub use op::r#async::{
    read_padded_string as read_padded_string_async, read_preamble as read_preamble_async,
    write_padded_string as write_padded_string_async, write_preamble as write_preamble_async,
};
