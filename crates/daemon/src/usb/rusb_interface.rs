//! Concrete `UsbInterface` backed by `rusb`.
//!
//! Grounded in the teacher's `UsbDevice::open`/`close`
//! (`server/src/usb/device.rs`): detach kernel drivers from every interface
//! before claiming, and reattach them on close so the device returns to
//! normal host control. The worker thread itself (`usb::worker`) is
//! grounded in `UsbWorkerThread::run`.

use crate::error::DaemonError;
use crate::usb::interface::{CompletionResult, SubmitRequest, UsbInterface};
use crate::usb::worker::{UsbWorkerThread, WorkerCommand};
use async_channel::Sender;
use protocol::{BusId, ExportedDevice, InterfaceDescriptor, VidPid};
use rusb::UsbContext;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub struct RusbInterface {
    commands: Sender<WorkerCommand>,
    worker: Option<JoinHandle<()>>,
    num_interfaces: u8,
}

impl RusbInterface {
    /// Open `device`, detach kernel drivers, claim every interface, and
    /// spawn the dedicated worker thread.
    pub fn open(context: rusb::Context, device: rusb::Device<rusb::Context>) -> Result<Self, DaemonError> {
        let handle = device
            .open()
            .map_err(|e| DaemonError::DeviceError(e.to_string()))?;

        let num_interfaces = device
            .active_config_descriptor()
            .map(|c| c.num_interfaces())
            .unwrap_or(1);

        for iface in 0..num_interfaces {
            match handle.kernel_driver_active(iface) {
                Ok(true) => {
                    if let Err(e) = handle.detach_kernel_driver(iface) {
                        warn!("failed to detach kernel driver from interface {iface}: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("kernel driver status unavailable for interface {iface}: {e}"),
            }
            if let Err(e) = handle.claim_interface(iface) {
                warn!("failed to claim interface {iface}: {e}");
            }
        }

        let (tx, rx) = async_channel::unbounded();
        let worker_context = context.clone();
        let worker = std::thread::Builder::new()
            .name("usb-worker".to_string())
            .spawn(move || {
                UsbWorkerThread::new(worker_context, handle, rx).run();
            })
            .expect("failed to spawn usb worker thread");

        Ok(Self {
            commands: tx,
            worker: Some(worker),
            num_interfaces,
        })
    }
}

impl UsbInterface for RusbInterface {
    fn submit(&self, request: SubmitRequest) -> oneshot::Receiver<CompletionResult> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .try_send(WorkerCommand::Submit { request, reply })
            .is_err()
        {
            // Worker gone; resolving the receiver here would require the
            // sender we just moved, so the caller sees a dropped channel
            // instead, which it must already treat as "no reply coming".
        }
        rx
    }

    fn abort_endpoint(&self, raw_endpoint: u8) {
        let _ = self.commands.try_send(WorkerCommand::AbortEndpoint { raw_endpoint });
    }

    fn close(&self) {
        let _ = self.commands.try_send(WorkerCommand::Close);
    }
}

impl Drop for RusbInterface {
    fn drop(&mut self) {
        let _ = self.commands.try_send(WorkerCommand::Close);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        let _ = self.num_interfaces;
    }
}

/// Reads descriptors off `device` to produce its wire-visible
/// `ExportedDevice` record, grounded in the teacher's
/// `UsbDevice::device_info` string-descriptor reads.
pub fn describe_device(device: &rusb::Device<rusb::Context>) -> Option<ExportedDevice> {
    let descriptor = device.device_descriptor().ok()?;
    let config = device.active_config_descriptor().ok();

    let interfaces = config
        .as_ref()
        .map(|c| {
            c.interfaces()
                .filter_map(|iface| iface.descriptors().next())
                .map(|d| InterfaceDescriptor {
                    class: d.class_code(),
                    subclass: d.sub_class_code(),
                    protocol: d.protocol_code(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ExportedDevice {
        path: format!(
            "/sys/bus/usb/devices/{}-{}",
            device.bus_number(),
            device.address()
        ),
        busid: BusId::new(device.bus_number() as u16, device.address() as u16),
        bus_number: device.bus_number() as u32,
        dev_number: device.address() as u32,
        speed: speed_code(device.speed()),
        ids: VidPid {
            vendor: descriptor.vendor_id(),
            product: descriptor.product_id(),
        },
        bcd_device: bcd_from_version(descriptor.device_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value: config.as_ref().map(|c| c.number()).unwrap_or(0),
        num_configurations: descriptor.num_configurations(),
        interfaces,
    })
}

fn bcd_from_version(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | version.sub_minor() as u16
}

fn speed_code(speed: rusb::Speed) -> u32 {
    match speed {
        rusb::Speed::Low => 1,
        rusb::Speed::Full => 2,
        rusb::Speed::High => 3,
        rusb::Speed::Super | rusb::Speed::SuperPlus => 5,
        _ => 0,
    }
}
