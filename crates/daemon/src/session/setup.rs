//! `SessionSetup` (`spec.md` §4.E): the connection-setup handshake —
//! version check, device-list reply, import reply, device claim — that
//! hands a successfully imported connection over to `SessionMultiplexer`.
//!
//! Grounded in the teacher's `IrohServer::handle_connection`
//! (`server/src/network/server.rs`): accept, validate, then construct and
//! run a per-connection handler, logging and returning on any failure.

use crate::capture::CaptureSink;
use crate::error::DaemonError;
use crate::session::multiplexer::SessionMultiplexer;
use crate::usb::interface::UsbInterface;
use byteorder::{BigEndian, WriteBytesExt};
use common::{ClaimError, DeviceEnumerator, DeviceStore, PolicyEngine};
use protocol::device::{write_exported_device, write_interfaces};
use protocol::{BUSID_SIZE, BusId, OpCode, Status};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Driver-binding collaborator, fixed to hand back a type-erased
/// `UsbInterface` so `SessionSetup` can stay free of a generic parameter for
/// the concrete rusb/platform binder (Design Notes §9: "dynamic dispatch
/// over device/interface types... abstract capability sets").
pub type SessionBinder = Arc<dyn common::DriverBinder<Interface = Arc<dyn UsbInterface>>>;

pub struct SessionSetup {
    store: Arc<dyn DeviceStore>,
    binder: SessionBinder,
    policy: Arc<dyn PolicyEngine>,
    enumerator: Arc<dyn DeviceEnumerator>,
    capture: Option<Arc<CaptureSink>>,
}

impl SessionSetup {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        binder: SessionBinder,
        policy: Arc<dyn PolicyEngine>,
        enumerator: Arc<dyn DeviceEnumerator>,
        capture: Option<Arc<CaptureSink>>,
    ) -> Self {
        Self {
            store,
            binder,
            policy,
            enumerator,
            capture,
        }
    }

    /// Run the handshake on `stream`, then (on a successful import) run the
    /// session multiplexer to completion. Any op other than
    /// `OP_REQ_DEVLIST`/`OP_REQ_IMPORT` is a fatal protocol violation.
    pub async fn run<S>(
        &self,
        mut stream: S,
        remote_ip: IpAddr,
        cancel: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (op, _status) = protocol::read_preamble_async(&mut stream).await?;

        match op {
            OpCode::ReqDevlist => self.handle_devlist(&mut stream, remote_ip).await,
            OpCode::ReqImport => self.handle_import(stream, remote_ip, cancel).await,
            OpCode::RepDevlist | OpCode::RepImport => {
                warn!(?op, "client sent a reply-only op code during setup; closing");
                Err(DaemonError::InvalidProtocol(protocol::ProtocolError::UnknownOp(
                    0,
                )))
            }
        }
    }

    /// `OP_REQ_DEVLIST`: enumerate every shared device `remote_ip` is
    /// permitted to see (`spec.md` §4.E, "policy-gated") and reply with the
    /// filtered list, then the caller closes the connection (E1).
    async fn handle_devlist<S: AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        remote_ip: IpAddr,
    ) -> Result<(), DaemonError> {
        let devices = self.store.list_shared();
        let exported: Vec<_> = devices
            .iter()
            .filter(|d| self.policy.visible_to(d, remote_ip))
            .filter_map(|d| self.enumerator.describe(d))
            .collect();

        let mut body = Vec::new();
        protocol::op::write_preamble(&mut body, OpCode::RepDevlist, Status::Ok as u32)?;
        body.write_u32::<BigEndian>(exported.len() as u32)?;
        for device in &exported {
            write_exported_device(&mut body, device)?;
            write_interfaces(&mut body, &device.interfaces)?;
        }

        stream.write_all(&body).await?;
        Ok(())
    }

    /// `OP_REQ_IMPORT`: resolve the requested busid, auto-bind and claim the
    /// device if policy allows, reply, then run the multiplexer for the
    /// remainder of the connection's life.
    async fn handle_import<S>(
        &self,
        mut stream: S,
        remote_ip: IpAddr,
        cancel: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let busid_str = protocol::read_padded_string_async(&mut stream, BUSID_SIZE).await?;
        let parsed_busid: Option<BusId> = busid_str.parse().ok();

        let device = match parsed_busid.and_then(|b| self.store.find_by_busid(b)) {
            Some(d) => d,
            None => return self.reject_import(&mut stream, Status::NoDev).await,
        };

        if device.is_attached() {
            return self.reject_import(&mut stream, Status::DevBusy).await;
        }

        if !self.policy.auto_bind_allowed(&device, remote_ip) {
            return self.reject_import(&mut stream, Status::Na).await;
        }

        let guid = self.store.persist(&device.instance_id, &device.description);

        let interface = match self.binder.claim(&device.instance_id) {
            Ok(i) => i,
            Err(ClaimError::Busy) => return self.reject_import(&mut stream, Status::DevBusy).await,
            Err(_) => return self.reject_import(&mut stream, Status::DevErr).await,
        };

        let exported = match self.enumerator.describe(&device) {
            Some(e) => e,
            None => {
                self.binder.release(interface);
                return self.reject_import(&mut stream, Status::DevErr).await;
            }
        };

        let busid = device
            .bus_id
            .or(parsed_busid)
            .expect("device was found by busid, so a busid exists");
        let stub_id = format!("stub-{busid}");
        let handle = self.store.set_attached(&guid, busid, remote_ip, &stub_id);

        let mut body = Vec::new();
        protocol::op::write_preamble(&mut body, OpCode::RepImport, Status::Ok as u32)?;
        write_exported_device(&mut body, &exported)?;
        write_interfaces(&mut body, &exported.interfaces)?;
        stream.write_all(&body).await?;

        info!(%busid, %remote_ip, "device imported, handing off to session multiplexer");

        let devid = (exported.bus_number << 16) | exported.dev_number;
        let multiplexer = Arc::new(SessionMultiplexer::new(devid, interface.clone(), self.capture.clone()));
        let result = multiplexer.run(stream, cancel).await;

        self.binder.release(interface);
        self.store.set_detached(handle);
        info!(%busid, "session ended, device detached");

        result
    }

    async fn reject_import<S: AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        status: Status,
    ) -> Result<(), DaemonError> {
        let mut body = Vec::new();
        protocol::op::write_preamble(&mut body, OpCode::RepImport, status as u32)?;
        stream.write_all(&body).await?;

        Err(match status {
            Status::NoDev => DaemonError::DeviceNotFound,
            Status::DevBusy => DaemonError::DeviceBusy,
            Status::Na => DaemonError::DeviceError("auto-bind denied by policy".to_string()),
            _ => DaemonError::DeviceError("import failed".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::interface::{CompletionResult, SubmitRequest};
    use common::SharedDevice;
    use protocol::{ExportedDevice, InterfaceDescriptor, VidPid};
    use std::io::Cursor;
    use std::sync::Mutex;
    use tokio::io::duplex;
    use tokio::sync::oneshot;

    /// Local in-memory `DeviceStore` double: `common`'s test doubles live
    /// behind its own `#[cfg(test)]` and aren't visible to this crate.
    #[derive(Default)]
    struct TestDeviceStore {
        devices: Mutex<Vec<SharedDevice>>,
    }

    impl TestDeviceStore {
        fn with_devices(devices: Vec<SharedDevice>) -> Self {
            Self { devices: Mutex::new(devices) }
        }
    }

    impl DeviceStore for TestDeviceStore {
        fn list_shared(&self) -> Vec<SharedDevice> {
            self.devices.lock().unwrap().clone()
        }

        fn find_by_busid(&self, busid: BusId) -> Option<SharedDevice> {
            self.devices.lock().unwrap().iter().find(|d| d.bus_id == Some(busid)).cloned()
        }

        fn persist(&self, instance_id: &str, _description: &str) -> String {
            format!("guid-{instance_id}")
        }

        fn set_attached(
            &self,
            _guid: &str,
            _busid: BusId,
            _remote_ip: IpAddr,
            _stub_id: &str,
        ) -> common::AttachHandle {
            common::AttachHandle(1)
        }

        fn set_detached(&self, _handle: common::AttachHandle) {}
    }

    struct AllowAllPolicy;
    impl PolicyEngine for AllowAllPolicy {
        fn auto_bind_allowed(&self, _device: &SharedDevice, _remote_ip: IpAddr) -> bool {
            true
        }
        fn visible_to(&self, _device: &SharedDevice, _remote_ip: IpAddr) -> bool {
            true
        }
    }

    struct DenyAllPolicy;
    impl PolicyEngine for DenyAllPolicy {
        fn auto_bind_allowed(&self, _device: &SharedDevice, _remote_ip: IpAddr) -> bool {
            false
        }
        fn visible_to(&self, _device: &SharedDevice, _remote_ip: IpAddr) -> bool {
            false
        }
    }

    struct NoopInterface;
    impl UsbInterface for NoopInterface {
        fn submit(&self, _request: SubmitRequest) -> oneshot::Receiver<CompletionResult> {
            let (_tx, rx) = oneshot::channel();
            rx
        }
        fn abort_endpoint(&self, _raw_endpoint: u8) {}
        fn close(&self) {}
    }

    struct TestBinder;
    impl common::DriverBinder for TestBinder {
        type Interface = Arc<dyn UsbInterface>;
        fn claim(&self, _instance_id: &str) -> Result<Self::Interface, ClaimError> {
            Ok(Arc::new(NoopInterface))
        }
        fn release(&self, _interface: Self::Interface) {}
    }

    struct TestEnumerator;
    impl DeviceEnumerator for TestEnumerator {
        fn describe(&self, device: &SharedDevice) -> Option<ExportedDevice> {
            Some(ExportedDevice {
                path: format!("/sys/bus/usb/devices/{}", device.instance_id),
                busid: device.bus_id.unwrap_or(BusId::INCOMPATIBLE_HUB),
                bus_number: device.bus_id.map(|b| b.bus as u32).unwrap_or(0),
                dev_number: device.bus_id.map(|b| b.port as u32).unwrap_or(0),
                speed: 3,
                ids: VidPid { vendor: 0x1234, product: 0x5678 },
                bcd_device: 0x0100,
                device_class: 0,
                device_subclass: 0,
                device_protocol: 0,
                configuration_value: 1,
                num_configurations: 1,
                interfaces: vec![InterfaceDescriptor { class: 8, subclass: 6, protocol: 0x50 }],
            })
        }
    }

    fn device(busid: BusId) -> SharedDevice {
        SharedDevice {
            instance_id: busid.to_string(),
            description: "Test Device".to_string(),
            guid: String::new(),
            is_forced: false,
            bus_id: Some(busid),
            remote_ip: None,
            stub_instance_id: None,
        }
    }

    fn setup(store: Arc<dyn DeviceStore>, allow: bool) -> SessionSetup {
        let policy: Arc<dyn PolicyEngine> = if allow { Arc::new(AllowAllPolicy) } else { Arc::new(DenyAllPolicy) };
        SessionSetup::new(store, Arc::new(TestBinder), policy, Arc::new(TestEnumerator), None)
    }

    #[tokio::test]
    async fn devlist_on_empty_store_replies_zero_count() {
        let store = Arc::new(TestDeviceStore::with_devices(Vec::new()));
        let setup = setup(store, true);

        let (mut client, server) = duplex(4096);
        let mut req = Vec::new();
        protocol::op::write_preamble(&mut req, OpCode::ReqDevlist, 0).unwrap();
        client.write_all(&req).await.unwrap();

        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let _ = cancel_tx;
        setup.run(server, "127.0.0.1".parse().unwrap(), cancel_rx).await.unwrap();

        let mut reply = vec![0u8; 12];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply).await.unwrap();
        let (op, status) = protocol::op::read_preamble(&mut Cursor::new(&reply[..8])).unwrap();
        assert_eq!(op, OpCode::RepDevlist);
        assert_eq!(status, 0);
        let count = u32::from_be_bytes(reply[8..12].try_into().unwrap());
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn devlist_hides_devices_the_policy_denies() {
        let busid = BusId::new(3, 3);
        let store = Arc::new(TestDeviceStore::with_devices(vec![device(busid)]));
        let setup = setup(store, false);

        let (mut client, server) = duplex(4096);
        let mut req = Vec::new();
        protocol::op::write_preamble(&mut req, OpCode::ReqDevlist, 0).unwrap();
        client.write_all(&req).await.unwrap();

        let (_cancel_tx, cancel_rx) = broadcast::channel(1);
        setup.run(server, "127.0.0.1".parse().unwrap(), cancel_rx).await.unwrap();

        let mut reply = vec![0u8; 12];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply).await.unwrap();
        let count = u32::from_be_bytes(reply[8..12].try_into().unwrap());
        assert_eq!(count, 0, "DenyAllPolicy must hide every device from devlist");
    }

    #[tokio::test]
    async fn import_unknown_busid_replies_nodev() {
        let store = Arc::new(TestDeviceStore::with_devices(Vec::new()));
        let setup = setup(store, true);

        let (mut client, server) = duplex(4096);
        let mut req = Vec::new();
        protocol::op::write_preamble(&mut req, OpCode::ReqImport, 0).unwrap();
        protocol::op::write_padded_string(&mut req, "9-9", BUSID_SIZE).unwrap();
        client.write_all(&req).await.unwrap();

        let (_cancel_tx, cancel_rx) = broadcast::channel(1);
        let err = setup.run(server, "127.0.0.1".parse().unwrap(), cancel_rx).await.unwrap_err();
        assert!(matches!(err, DaemonError::DeviceNotFound));

        let mut reply = vec![0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply).await.unwrap();
        let (op, status) = protocol::op::read_preamble(&mut Cursor::new(&reply)).unwrap();
        assert_eq!(op, OpCode::RepImport);
        assert_eq!(status, Status::NoDev as u32);
    }

    #[tokio::test]
    async fn import_denied_by_policy_replies_na() {
        let busid = BusId::new(1, 1);
        let store = Arc::new(TestDeviceStore::with_devices(vec![device(busid)]));
        let setup = setup(store, false);

        let (mut client, server) = duplex(4096);
        let mut req = Vec::new();
        protocol::op::write_preamble(&mut req, OpCode::ReqImport, 0).unwrap();
        protocol::op::write_padded_string(&mut req, "1-1", BUSID_SIZE).unwrap();
        client.write_all(&req).await.unwrap();

        let (_cancel_tx, cancel_rx) = broadcast::channel(1);
        let err = setup.run(server, "127.0.0.1".parse().unwrap(), cancel_rx).await.unwrap_err();
        assert!(matches!(err, DaemonError::DeviceError(_)));

        let mut reply = vec![0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply).await.unwrap();
        let (_op, status) = protocol::op::read_preamble(&mut Cursor::new(&reply)).unwrap();
        assert_eq!(status, Status::Na as u32);
    }

    #[tokio::test]
    async fn import_of_attached_device_replies_busy() {
        let busid = BusId::new(2, 2);
        let mut d = device(busid);
        d.remote_ip = Some("10.0.0.5".parse().unwrap());
        let store = Arc::new(TestDeviceStore::with_devices(vec![d]));
        let setup = setup(store, true);

        let (mut client, server) = duplex(4096);
        let mut req = Vec::new();
        protocol::op::write_preamble(&mut req, OpCode::ReqImport, 0).unwrap();
        protocol::op::write_padded_string(&mut req, "2-2", BUSID_SIZE).unwrap();
        client.write_all(&req).await.unwrap();

        let (_cancel_tx, cancel_rx) = broadcast::channel(1);
        let err = setup.run(server, "127.0.0.1".parse().unwrap(), cancel_rx).await.unwrap_err();
        assert!(matches!(err, DaemonError::DeviceBusy));

        let mut reply = vec![0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply).await.unwrap();
        let (_op, status) = protocol::op::read_preamble(&mut Cursor::new(&reply)).unwrap();
        assert_eq!(status, Status::DevBusy as u32);
    }
}
