//! Default, rusb-backed collaborator implementations that make the daemon
//! binary runnable end-to-end without a real persistent config store or
//! platform driver-binding layer (both remain genuine Non-goals per
//! `spec.md` §1): devices are discovered live from `rusb::devices()` on
//! every call and "shared" state lives only in memory for the life of the
//! process.
//!
//! Grounded in the teacher's `create_usb_bridge`/`UsbWorker` split
//! (`common/src/channel.rs`): a thin struct wrapping a `rusb::Context`,
//! constructed once in `main` and passed down by parameter rather than
//! reached for ambiently (Design Notes §9).

use crate::usb::interface::UsbInterface;
use crate::usb::rusb_interface::{RusbInterface, describe_device};
use common::{AttachHandle, ClaimError, DeviceEnumerator, DeviceStore, DriverBinder, PolicyEngine, SharedDevice};
use protocol::{BusId, ExportedDevice};
use rusb::UsbContext;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::warn;

fn find_rusb_device(context: &rusb::Context, busid: BusId) -> Option<rusb::Device<rusb::Context>> {
    context
        .devices()
        .ok()?
        .iter()
        .find(|d| d.bus_number() as u16 == busid.bus && d.address() as u16 == busid.port)
}

struct AttachState {
    remote_ip: IpAddr,
    stub_instance_id: String,
}

/// Ephemeral `DeviceStore`: every device `rusb` currently enumerates is
/// considered shared and importable; attach/detach state is tracked purely
/// in memory. No binding persists across a restart.
pub struct RusbDeviceStore {
    context: rusb::Context,
    attached: Mutex<HashMap<String, AttachState>>,
    next_handle: Mutex<u64>,
    handle_to_guid: Mutex<HashMap<u64, String>>,
}

impl RusbDeviceStore {
    pub fn new(context: rusb::Context) -> Self {
        Self {
            context,
            attached: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
            handle_to_guid: Mutex::new(HashMap::new()),
        }
    }

    fn to_shared(&self, device: &rusb::Device<rusb::Context>) -> Option<SharedDevice> {
        let descriptor = device.device_descriptor().ok()?;
        let busid = BusId::new(device.bus_number() as u16, device.address() as u16);
        let guid = format!("guid-{busid}");
        let attached = self.attached.lock().unwrap();
        let state = attached.get(&guid);
        Some(SharedDevice {
            instance_id: busid.to_string(),
            description: format!(
                "{:04x}:{:04x}",
                descriptor.vendor_id(),
                descriptor.product_id()
            ),
            guid,
            is_forced: false,
            bus_id: Some(busid),
            remote_ip: state.map(|s| s.remote_ip),
            stub_instance_id: state.map(|s| s.stub_instance_id.clone()),
        })
    }
}

impl DeviceStore for RusbDeviceStore {
    fn list_shared(&self) -> Vec<SharedDevice> {
        match self.context.devices() {
            Ok(list) => list.iter().filter_map(|d| self.to_shared(&d)).collect(),
            Err(e) => {
                warn!("failed to enumerate USB devices: {e}");
                Vec::new()
            }
        }
    }

    fn find_by_busid(&self, busid: BusId) -> Option<SharedDevice> {
        let device = find_rusb_device(&self.context, busid)?;
        self.to_shared(&device)
    }

    fn persist(&self, instance_id: &str, _description: &str) -> String {
        format!("guid-{instance_id}")
    }

    fn set_attached(&self, guid: &str, _busid: BusId, remote_ip: IpAddr, stub_id: &str) -> AttachHandle {
        self.attached.lock().unwrap().insert(
            guid.to_string(),
            AttachState {
                remote_ip,
                stub_instance_id: stub_id.to_string(),
            },
        );

        let mut next = self.next_handle.lock().unwrap();
        let handle = AttachHandle(*next);
        *next += 1;
        self.handle_to_guid.lock().unwrap().insert(handle.0, guid.to_string());
        handle
    }

    fn set_detached(&self, handle: AttachHandle) {
        if let Some(guid) = self.handle_to_guid.lock().unwrap().remove(&handle.0) {
            self.attached.lock().unwrap().remove(&guid);
        }
    }
}

/// Always-allow auto-bind policy: the real access-policy store is out of
/// scope for this core (`spec.md` §1); this is the default used when no
/// operator-configured policy is wired in.
pub struct AllowAllPolicy;

impl PolicyEngine for AllowAllPolicy {
    fn auto_bind_allowed(&self, _device: &SharedDevice, _remote_ip: IpAddr) -> bool {
        true
    }

    fn visible_to(&self, _device: &SharedDevice, _remote_ip: IpAddr) -> bool {
        true
    }
}

/// `DriverBinder` backed by `rusb`: parses `instance_id` back into a
/// `BusId`, re-resolves the live `rusb::Device`, and opens it via
/// [`RusbInterface::open`].
pub struct RusbDriverBinder {
    context: rusb::Context,
}

impl RusbDriverBinder {
    pub fn new(context: rusb::Context) -> Self {
        Self { context }
    }
}

impl DriverBinder for RusbDriverBinder {
    type Interface = Arc<dyn UsbInterface>;

    fn claim(&self, instance_id: &str) -> Result<Self::Interface, ClaimError> {
        let busid: BusId = instance_id.parse().map_err(|_| ClaimError::NotFound)?;
        let device = find_rusb_device(&self.context, busid).ok_or(ClaimError::NotFound)?;
        let interface = RusbInterface::open(self.context.clone(), device)
            .map_err(|e| ClaimError::DriverError(e.to_string()))?;
        Ok(Arc::new(interface))
    }

    fn release(&self, interface: Self::Interface) {
        interface.close();
    }
}

/// Reads live USB descriptors to build the wire-visible `ExportedDevice`.
pub struct RusbDeviceEnumerator {
    context: rusb::Context,
}

impl RusbDeviceEnumerator {
    pub fn new(context: rusb::Context) -> Self {
        Self { context }
    }
}

impl DeviceEnumerator for RusbDeviceEnumerator {
    fn describe(&self, device: &SharedDevice) -> Option<ExportedDevice> {
        let busid = device.bus_id?;
        let rusb_device = find_rusb_device(&self.context, busid)?;
        describe_device(&rusb_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_policy_always_allows() {
        let policy = AllowAllPolicy;
        let device = SharedDevice {
            instance_id: "1-1".to_string(),
            description: "x".to_string(),
            guid: "guid-1-1".to_string(),
            is_forced: false,
            bus_id: Some(BusId::new(1, 1)),
            remote_ip: None,
            stub_instance_id: None,
        };
        assert!(policy.auto_bind_allowed(&device, "127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn device_store_tracks_attach_detach_in_memory() {
        let context = match rusb::Context::new() {
            Ok(c) => c,
            Err(_) => return, // no libusb available in this sandbox; skip
        };
        let store = RusbDeviceStore::new(context);
        let busid = BusId::new(1, 1);
        let handle = store.set_attached("guid-1-1", busid, "10.0.0.1".parse().unwrap(), "stub-1-1");
        assert!(store.handle_to_guid.lock().unwrap().contains_key(&handle.0));
        store.set_detached(handle);
        assert!(store.attached.lock().unwrap().is_empty());
    }
}
