//! The 48-byte USB/IP URB header: `{ basic (20 bytes), command-specific (28 bytes) }`.
//!
//! All integers are big-endian. `UrbHeader` is modeled as an enum tagged by
//! command rather than one struct with optional fields, which is the
//! idiomatic-Rust shape for what the wire format expresses as a C tagged
//! union (see DESIGN.md / SPEC_FULL.md §3).

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const HEADER_SIZE: usize = 48;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Submit = 1,
    Unlink = 2,
    RetSubmit = 3,
    RetUnlink = 4,
}

impl Command {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Submit),
            2 => Ok(Self::Unlink),
            3 => Ok(Self::RetSubmit),
            4 => Ok(Self::RetUnlink),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Direction bit carried in the basic header (ignored for control endpoint
/// submissions, where bit 7 of `bmRequestType` governs instead — see
/// `EndpointPipeline`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_u32(value: u32) -> Self {
        if value == 0 { Self::Out } else { Self::In }
    }
}

/// Fields common to every URB header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub endpoint: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitFields {
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    pub setup: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmitFields {
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    pub setup: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkFields {
    pub unlinked_seqnum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlinkFields {
    pub status: i32,
}

/// A fully decoded 48-byte URB header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbHeader {
    Submit(BasicHeader, SubmitFields),
    Unlink(BasicHeader, UnlinkFields),
    RetSubmit(BasicHeader, RetSubmitFields),
    RetUnlink(BasicHeader, RetUnlinkFields),
}

impl UrbHeader {
    pub fn basic(&self) -> &BasicHeader {
        match self {
            Self::Submit(b, _) | Self::Unlink(b, _) | Self::RetSubmit(b, _) | Self::RetUnlink(b, _) => b,
        }
    }

    pub fn seqnum(&self) -> u32 {
        self.basic().seqnum
    }

    pub fn new_ret_submit(
        seqnum: u32,
        devid: u32,
        endpoint: u32,
        status: i32,
        actual_length: i32,
        error_count: i32,
    ) -> Self {
        Self::RetSubmit(
            BasicHeader {
                seqnum,
                devid,
                direction: Direction::Out,
                endpoint,
            },
            RetSubmitFields {
                status,
                actual_length,
                start_frame: 0,
                number_of_packets: 0,
                error_count,
                setup: [0; 8],
            },
        )
    }

    pub fn new_ret_unlink(seqnum: u32, devid: u32, status: i32) -> Self {
        Self::RetUnlink(
            BasicHeader {
                seqnum,
                devid,
                direction: Direction::Out,
                endpoint: 0,
            },
            RetUnlinkFields { status },
        )
    }
}

fn read_basic<R: Read>(reader: &mut R, command: u32) -> Result<BasicHeader> {
    let seqnum = reader.read_u32::<BigEndian>()?;
    let devid = reader.read_u32::<BigEndian>()?;
    let direction = Direction::from_u32(reader.read_u32::<BigEndian>()?);
    let endpoint = reader.read_u32::<BigEndian>()?;
    let _ = command;
    Ok(BasicHeader {
        seqnum,
        devid,
        direction,
        endpoint,
    })
}

fn write_basic<W: Write>(writer: &mut W, command: Command, basic: &BasicHeader) -> Result<()> {
    writer.write_u32::<BigEndian>(command as u32)?;
    writer.write_u32::<BigEndian>(basic.seqnum)?;
    writer.write_u32::<BigEndian>(basic.devid)?;
    writer.write_u32::<BigEndian>(basic.direction as u32)?;
    writer.write_u32::<BigEndian>(basic.endpoint)?;
    Ok(())
}

/// Read a 48-byte header. Short reads are fatal (propagate as `Io`).
pub fn read_header<R: Read>(reader: &mut R) -> Result<UrbHeader> {
    let command = reader.read_u32::<BigEndian>()?;
    let command = Command::from_u32(command)?;
    let basic = read_basic(reader, command as u32)?;

    match command {
        Command::Submit => {
            let transfer_flags = reader.read_u32::<BigEndian>()?;
            let transfer_buffer_length = reader.read_i32::<BigEndian>()?;
            let start_frame = reader.read_i32::<BigEndian>()?;
            let number_of_packets = reader.read_i32::<BigEndian>()?;
            let interval = reader.read_i32::<BigEndian>()?;
            let mut setup = [0u8; 8];
            reader.read_exact(&mut setup)?;
            Ok(UrbHeader::Submit(
                basic,
                SubmitFields {
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                },
            ))
        }
        Command::Unlink => {
            let unlinked_seqnum = reader.read_u32::<BigEndian>()?;
            let mut reserved = [0u8; 24];
            reader.read_exact(&mut reserved)?;
            Ok(UrbHeader::Unlink(basic, UnlinkFields { unlinked_seqnum }))
        }
        Command::RetSubmit => {
            let status = reader.read_i32::<BigEndian>()?;
            let actual_length = reader.read_i32::<BigEndian>()?;
            let start_frame = reader.read_i32::<BigEndian>()?;
            let number_of_packets = reader.read_i32::<BigEndian>()?;
            let error_count = reader.read_i32::<BigEndian>()?;
            let mut setup = [0u8; 8];
            reader.read_exact(&mut setup)?;
            Ok(UrbHeader::RetSubmit(
                basic,
                RetSubmitFields {
                    status,
                    actual_length,
                    start_frame,
                    number_of_packets,
                    error_count,
                    setup,
                },
            ))
        }
        Command::RetUnlink => {
            let status = reader.read_i32::<BigEndian>()?;
            let mut reserved = [0u8; 24];
            reader.read_exact(&mut reserved)?;
            Ok(UrbHeader::RetUnlink(basic, RetUnlinkFields { status }))
        }
    }
}

/// Write a 48-byte header.
pub fn write_header<W: Write>(writer: &mut W, header: &UrbHeader) -> Result<()> {
    match header {
        UrbHeader::Submit(basic, fields) => {
            write_basic(writer, Command::Submit, basic)?;
            writer.write_u32::<BigEndian>(fields.transfer_flags)?;
            writer.write_i32::<BigEndian>(fields.transfer_buffer_length)?;
            writer.write_i32::<BigEndian>(fields.start_frame)?;
            writer.write_i32::<BigEndian>(fields.number_of_packets)?;
            writer.write_i32::<BigEndian>(fields.interval)?;
            writer.write_all(&fields.setup)?;
        }
        UrbHeader::Unlink(basic, fields) => {
            write_basic(writer, Command::Unlink, basic)?;
            writer.write_u32::<BigEndian>(fields.unlinked_seqnum)?;
            writer.write_all(&[0u8; 24])?;
        }
        UrbHeader::RetSubmit(basic, fields) => {
            write_basic(writer, Command::RetSubmit, basic)?;
            writer.write_i32::<BigEndian>(fields.status)?;
            writer.write_i32::<BigEndian>(fields.actual_length)?;
            writer.write_i32::<BigEndian>(fields.start_frame)?;
            writer.write_i32::<BigEndian>(fields.number_of_packets)?;
            writer.write_i32::<BigEndian>(fields.error_count)?;
            writer.write_all(&fields.setup)?;
        }
        UrbHeader::RetUnlink(basic, fields) => {
            write_basic(writer, Command::RetUnlink, basic)?;
            writer.write_i32::<BigEndian>(fields.status)?;
            writer.write_all(&[0u8; 24])?;
        }
    }
    Ok(())
}

#[cfg(feature = "async")]
pub mod r#async {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<UrbHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf).await?;
        super::read_header(&mut std::io::Cursor::new(buf))
    }

    pub async fn write_header<W: AsyncWrite + Unpin>(
        writer: &mut W,
        header: &UrbHeader,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        super::write_header(&mut buf, header)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(h: UrbHeader) {
        let mut buf = Vec::new();
        write_header(&mut buf, &h).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let mut cur = Cursor::new(buf);
        let decoded = read_header(&mut cur).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn submit_roundtrip() {
        roundtrip(UrbHeader::Submit(
            BasicHeader {
                seqnum: 42,
                devid: 1,
                direction: Direction::In,
                endpoint: 1,
            },
            SubmitFields {
                transfer_flags: 0,
                transfer_buffer_length: 1,
                start_frame: 0,
                number_of_packets: 0,
                interval: 0,
                setup: [0; 8],
            },
        ));
    }

    #[test]
    fn unlink_roundtrip() {
        roundtrip(UrbHeader::Unlink(
            BasicHeader {
                seqnum: 101,
                devid: 1,
                direction: Direction::Out,
                endpoint: 2,
            },
            UnlinkFields {
                unlinked_seqnum: 100,
            },
        ));
    }

    #[test]
    fn ret_submit_roundtrip() {
        roundtrip(UrbHeader::new_ret_submit(42, 1, 0x81, 0, 1, 0));
    }

    #[test]
    fn ret_unlink_roundtrip() {
        roundtrip(UrbHeader::new_ret_unlink(101, 1, -104));
    }

    #[test]
    fn unknown_command_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&99u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 44]);
        let mut cur = Cursor::new(buf);
        let err = read_header(&mut cur).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(99)));
    }

    proptest::proptest! {
        #[test]
        fn submit_header_roundtrips_for_any_fields(
            seqnum: u32, devid: u32, endpoint: u32, dir: bool,
            transfer_flags: u32, transfer_buffer_length: i32,
            number_of_packets: i32, interval: i32, setup: [u8; 8]
        ) {
            let h = UrbHeader::Submit(
                BasicHeader { seqnum, devid, direction: if dir { Direction::In } else { Direction::Out }, endpoint },
                SubmitFields { transfer_flags, transfer_buffer_length, start_frame: 0, number_of_packets, interval, setup },
            );
            let mut buf = Vec::new();
            write_header(&mut buf, &h).unwrap();
            let mut cur = Cursor::new(buf);
            let decoded = read_header(&mut cur).unwrap();
            prop_assert_eq!(decoded, h);
        }
    }
}
