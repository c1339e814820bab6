//! Ambient stack shared by the daemon: error types, logging setup, and the
//! external-collaborator trait seams (`DeviceStore`, `DriverBinder`,
//! `PolicyEngine`, `DeviceEnumerator`) that keep platform-specific concerns
//! out of the core.

pub mod collaborators;
pub mod error;
pub mod logging;

pub use collaborators::{
    AttachHandle, ClaimError, DeviceEnumerator, DeviceStore, DriverBinder, PolicyEngine,
    SharedDevice,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
