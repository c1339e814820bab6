//! External collaborator traits.
//!
//! These model everything `spec.md` §1 calls out as deliberately out of
//! scope: persistent device bindings, driver binding, host enumeration, and
//! access policy. The daemon depends only on these trait objects, injected
//! at session construction (Design Notes §9: "global mutable state... passed
//! by parameter; never looked up ambiently"), the same way the teacher
//! passes a `UsbBridge` into `ClientConnection`/`IrohServer` rather than
//! reaching for a singleton.
//!
//! No real platform-binding implementation lives here; only the seam and an
//! in-memory test double, matching the Non-goals in `spec.md` §1.

use protocol::{BusId, ExportedDevice, VidPid};
use std::net::IpAddr;

/// A device the host currently knows about, independent of whether it is
/// being shared over USB/IP right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDevice {
    pub instance_id: String,
    pub description: String,
    pub guid: String,
    pub is_forced: bool,
    pub bus_id: Option<BusId>,
    pub remote_ip: Option<IpAddr>,
    pub stub_instance_id: Option<String>,
}

impl SharedDevice {
    /// A device currently attached to a remote client.
    pub fn is_attached(&self) -> bool {
        self.remote_ip.is_some()
    }
}

/// Opaque handle returned by [`DeviceStore::set_attached`], released via
/// [`DeviceStore::set_detached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachHandle(pub u64);

/// Persistent configuration store for device bindings and access policy
/// state. Deliberately out of scope for this crate's core: the daemon only
/// ever talks to this trait.
pub trait DeviceStore: Send + Sync {
    fn list_shared(&self) -> Vec<SharedDevice>;
    fn find_by_busid(&self, busid: BusId) -> Option<SharedDevice>;
    fn persist(&self, instance_id: &str, description: &str) -> String;
    fn set_attached(
        &self,
        guid: &str,
        busid: BusId,
        remote_ip: IpAddr,
        stub_id: &str,
    ) -> AttachHandle;
    fn set_detached(&self, handle: AttachHandle);
}

/// Errors the platform driver-binding layer can report while claiming or
/// releasing a device. Kept deliberately small: `spec.md` treats the binder
/// itself as an external collaborator, so only the outcomes the daemon must
/// react to are modeled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("device not found")]
    NotFound,
    #[error("device already claimed")]
    Busy,
    #[error("driver claim failed: {0}")]
    DriverError(String),
}

/// Platform-specific driver binding: forcing/unforcing a host driver and
/// managing stub-device lifecycle. Out of scope for the core per `spec.md`
/// §1; modeled here purely as a trait seam.
pub trait DriverBinder: Send + Sync {
    type Interface;

    fn claim(&self, instance_id: &str) -> Result<Self::Interface, ClaimError>;
    fn release(&self, interface: Self::Interface);
}

/// Access-control policy for auto-bind decisions during import and for
/// devlist visibility. `spec.md` §4.E requires DEVLIST enumeration to be
/// "policy-gated" by remote IP, a separate question from whether an import
/// may auto-bind the device, so the two are kept as distinct methods rather
/// than reusing one for both decisions.
pub trait PolicyEngine: Send + Sync {
    fn auto_bind_allowed(&self, device: &SharedDevice, remote_ip: IpAddr) -> bool;

    /// Whether `remote_ip` may see `device` in an `OP_REQ_DEVLIST` reply.
    fn visible_to(&self, device: &SharedDevice, remote_ip: IpAddr) -> bool;
}

/// Reads USB descriptors off a claimed device to produce its wire-visible
/// `ExportedDevice` record. Out of scope for the core (host enumeration);
/// modeled as a trait seam.
pub trait DeviceEnumerator: Send + Sync {
    fn describe(&self, device: &SharedDevice) -> Option<ExportedDevice>;
}

#[allow(dead_code)]
fn _assert_vidpid_usable(_: VidPid) {}
