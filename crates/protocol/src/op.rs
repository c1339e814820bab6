//! Connection-setup op-code preamble (`OP_REQ_DEVLIST`, `OP_REQ_IMPORT`, ...)
//!
//! Every setup message starts with `{ version: u16, op: u16, status: u32 }`,
//! all big-endian. The two request/reply pairs used by this daemon are
//! `OP_REQ_DEVLIST`/`OP_REP_DEVLIST` and `OP_REQ_IMPORT`/`OP_REP_IMPORT`.

use crate::error::{ProtocolError, Result};
use crate::version::USBIP_VERSION;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Length of the NUL-padded busid string carried in `OP_REQ_IMPORT`.
pub const BUSID_SIZE: usize = 32;

/// Length of the NUL-padded sysfs device path carried in `ExportedDevice`.
pub const SYSFS_PATH_SIZE: usize = 256;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    ReqDevlist = 0x8005,
    RepDevlist = 0x0005,
    ReqImport = 0x8003,
    RepImport = 0x0003,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0x8005 => Ok(Self::ReqDevlist),
            0x0005 => Ok(Self::RepDevlist),
            0x8003 => Ok(Self::ReqImport),
            0x0003 => Ok(Self::RepImport),
            other => Err(ProtocolError::UnknownOp(other)),
        }
    }
}

/// Reply status codes carried in the 32-bit `status` preamble field.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Na = 1,
    DevBusy = 2,
    DevErr = 3,
    NoDev = 4,
    Error = 5,
}

impl Status {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Na),
            2 => Ok(Self::DevBusy),
            3 => Ok(Self::DevErr),
            4 => Ok(Self::NoDev),
            5 => Ok(Self::Error),
            other => Err(ProtocolError::PeerStatus(other as i32)),
        }
    }
}

/// Read the `{version, op, status}` preamble, rejecting a version mismatch
/// or unrecognized op code.
pub fn read_preamble<R: Read>(reader: &mut R) -> Result<(OpCode, u32)> {
    let version = reader.read_u16::<BigEndian>()?;
    if version != USBIP_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let op = reader.read_u16::<BigEndian>()?;
    let status = reader.read_u32::<BigEndian>()?;
    Ok((OpCode::from_u16(op)?, status))
}

/// Write the `{version, op, status}` preamble.
pub fn write_preamble<W: Write>(writer: &mut W, op: OpCode, status: u32) -> Result<()> {
    writer.write_u16::<BigEndian>(USBIP_VERSION)?;
    writer.write_u16::<BigEndian>(op as u16)?;
    writer.write_u32::<BigEndian>(status)?;
    Ok(())
}

/// Read a fixed-size, NUL-padded string field (busid or sysfs path).
pub fn read_padded_string<R: Read>(reader: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..nul]).into_owned())
}

/// Write a string into a fixed-size, NUL-padded field, truncating if needed.
pub fn write_padded_string<W: Write>(writer: &mut W, s: &str, len: usize) -> Result<()> {
    let mut buf = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    buf[..n].copy_from_slice(&bytes[..n]);
    writer.write_all(&buf)?;
    Ok(())
}

#[cfg(feature = "async")]
pub mod r#async {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(OpCode, u32)> {
        let version = reader.read_u16().await?;
        if version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let op = reader.read_u16().await?;
        let status = reader.read_u32().await?;
        Ok((OpCode::from_u16(op)?, status))
    }

    pub async fn write_preamble<W: AsyncWrite + Unpin>(
        writer: &mut W,
        op: OpCode,
        status: u32,
    ) -> Result<()> {
        writer.write_u16(USBIP_VERSION).await?;
        writer.write_u16(op as u16).await?;
        writer.write_u32(status).await?;
        Ok(())
    }

    pub async fn read_padded_string<R: AsyncRead + Unpin>(
        reader: &mut R,
        len: usize,
    ) -> Result<String> {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..nul]).into_owned())
    }

    pub async fn write_padded_string<W: AsyncWrite + Unpin>(
        writer: &mut W,
        s: &str,
        len: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; len];
        let bytes = s.as_bytes();
        let n = bytes.len().min(len.saturating_sub(1));
        buf[..n].copy_from_slice(&bytes[..n]);
        writer.write_all(&buf).await?;
        Ok(())
    }
}
