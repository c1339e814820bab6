//! Wire-visible device identity and descriptor encoding.

use crate::error::Result;
use crate::op::{BUSID_SIZE, SYSFS_PATH_SIZE, read_padded_string, write_padded_string};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

/// `(bus, port)` pair identifying a physical USB location.
///
/// Both fields are non-zero for a real device; `INCOMPATIBLE_HUB` is the
/// sentinel the wire protocol reserves for a port behind an unsupported hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId {
    pub bus: u16,
    pub port: u16,
}

impl BusId {
    pub const INCOMPATIBLE_HUB: BusId = BusId { bus: 0, port: 0 };

    pub fn new(bus: u16, port: u16) -> Self {
        Self { bus, port }
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.port)
    }
}

impl std::str::FromStr for BusId {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (bus, port) = s.split_once('-').ok_or(())?;
        Ok(Self {
            bus: bus.parse().map_err(|_| ())?,
            port: port.parse().map_err(|_| ())?,
        })
    }
}

/// `(vendor, product)` USB ID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VidPid {
    pub vendor: u16,
    pub product: u16,
}

impl fmt::Display for VidPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// One USB interface's class triplet, as carried after the device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// The wire-visible description of an importable device (`OP_REP_DEVLIST`
/// entries and the body of `OP_REP_IMPORT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub path: String,
    pub busid: BusId,
    pub bus_number: u32,
    pub dev_number: u32,
    pub speed: u32,
    pub ids: VidPid,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Encode one `ExportedDevice` record (without its interface list) to `writer`.
pub fn write_exported_device<W: Write>(writer: &mut W, dev: &ExportedDevice) -> Result<()> {
    write_padded_string(writer, &dev.path, SYSFS_PATH_SIZE)?;
    write_padded_string(writer, &dev.busid.to_string(), BUSID_SIZE)?;
    writer.write_u32::<BigEndian>(dev.bus_number)?;
    writer.write_u32::<BigEndian>(dev.dev_number)?;
    writer.write_u32::<BigEndian>(dev.speed)?;
    writer.write_u16::<BigEndian>(dev.ids.vendor)?;
    writer.write_u16::<BigEndian>(dev.ids.product)?;
    writer.write_u16::<BigEndian>(dev.bcd_device)?;
    writer.write_u8(dev.device_class)?;
    writer.write_u8(dev.device_subclass)?;
    writer.write_u8(dev.device_protocol)?;
    writer.write_u8(dev.configuration_value)?;
    writer.write_u8(dev.num_configurations)?;
    writer.write_u8(dev.interfaces.len() as u8)?;
    Ok(())
}

/// Encode the per-interface class-triplet records that follow a device record.
pub fn write_interfaces<W: Write>(writer: &mut W, interfaces: &[InterfaceDescriptor]) -> Result<()> {
    for iface in interfaces {
        writer.write_u8(iface.class)?;
        writer.write_u8(iface.subclass)?;
        writer.write_u8(iface.protocol)?;
        writer.write_u8(0)?; // padding byte
    }
    Ok(())
}

/// Decode one `ExportedDevice` record plus its trailing interface list.
/// Used by tests and by any future client-side tooling; the daemon itself
/// only ever writes this shape.
pub fn read_exported_device<R: Read>(reader: &mut R) -> Result<ExportedDevice> {
    let path = read_padded_string(reader, SYSFS_PATH_SIZE)?;
    let busid_str = read_padded_string(reader, BUSID_SIZE)?;
    let busid = busid_str.parse().unwrap_or(BusId::INCOMPATIBLE_HUB);
    let bus_number = reader.read_u32::<BigEndian>()?;
    let dev_number = reader.read_u32::<BigEndian>()?;
    let speed = reader.read_u32::<BigEndian>()?;
    let vendor = reader.read_u16::<BigEndian>()?;
    let product = reader.read_u16::<BigEndian>()?;
    let bcd_device = reader.read_u16::<BigEndian>()?;
    let device_class = reader.read_u8()?;
    let device_subclass = reader.read_u8()?;
    let device_protocol = reader.read_u8()?;
    let configuration_value = reader.read_u8()?;
    let num_configurations = reader.read_u8()?;
    let num_interfaces = reader.read_u8()?;

    let mut interfaces = Vec::with_capacity(num_interfaces as usize);
    for _ in 0..num_interfaces {
        let class = reader.read_u8()?;
        let subclass = reader.read_u8()?;
        let protocol = reader.read_u8()?;
        let _padding = reader.read_u8()?;
        interfaces.push(InterfaceDescriptor {
            class,
            subclass,
            protocol,
        });
    }

    Ok(ExportedDevice {
        path,
        busid,
        bus_number,
        dev_number,
        speed,
        ids: VidPid { vendor, product },
        bcd_device,
        device_class,
        device_subclass,
        device_protocol,
        configuration_value,
        num_configurations,
        interfaces,
    })
}
