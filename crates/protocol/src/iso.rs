//! Isochronous packet descriptors trailing ISO URB payloads.

use crate::error::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const ISO_DESCRIPTOR_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

pub fn read_iso_descriptor<R: Read>(reader: &mut R) -> Result<IsoPacketDescriptor> {
    Ok(IsoPacketDescriptor {
        offset: reader.read_u32::<BigEndian>()?,
        length: reader.read_u32::<BigEndian>()?,
        actual_length: reader.read_u32::<BigEndian>()?,
        status: reader.read_i32::<BigEndian>()?,
    })
}

pub fn write_iso_descriptor<W: Write>(writer: &mut W, d: &IsoPacketDescriptor) -> Result<()> {
    writer.write_u32::<BigEndian>(d.offset)?;
    writer.write_u32::<BigEndian>(d.length)?;
    writer.write_u32::<BigEndian>(d.actual_length)?;
    writer.write_i32::<BigEndian>(d.status)?;
    Ok(())
}

/// Recompute `offset` for IN-direction completions as the running sum of
/// preceding `actual_length`s. The Linux reference implementation has a
/// known bug here (it echoes the requested offsets instead); we always emit
/// the corrected values.
pub fn recompute_actual_offsets(descriptors: &mut [IsoPacketDescriptor]) {
    let mut running = 0u32;
    for d in descriptors.iter_mut() {
        d.offset = running;
        running += d.actual_length;
    }
}

#[cfg(feature = "async")]
pub mod r#async {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn read_iso_descriptor<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<IsoPacketDescriptor> {
        let mut buf = [0u8; ISO_DESCRIPTOR_SIZE];
        reader.read_exact(&mut buf).await?;
        super::read_iso_descriptor(&mut std::io::Cursor::new(buf))
    }

    pub async fn write_iso_descriptor<W: AsyncWrite + Unpin>(
        writer: &mut W,
        d: &IsoPacketDescriptor,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(ISO_DESCRIPTOR_SIZE);
        super::write_iso_descriptor(&mut buf, d)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn descriptor_roundtrip() {
        let d = IsoPacketDescriptor {
            offset: 10,
            length: 100,
            actual_length: 80,
            status: 0,
        };
        let mut buf = Vec::new();
        write_iso_descriptor(&mut buf, &d).unwrap();
        assert_eq!(buf.len(), ISO_DESCRIPTOR_SIZE);
        let mut cur = Cursor::new(buf);
        assert_eq!(read_iso_descriptor(&mut cur).unwrap(), d);
    }

    #[test]
    fn recomputes_offsets_from_actual_lengths() {
        let mut descriptors = vec![
            IsoPacketDescriptor { offset: 999, length: 100, actual_length: 80, status: 0 },
            IsoPacketDescriptor { offset: 999, length: 100, actual_length: 0, status: 0 },
            IsoPacketDescriptor { offset: 999, length: 100, actual_length: 50, status: 0 },
        ];
        recompute_actual_offsets(&mut descriptors);
        let offsets: Vec<u32> = descriptors.iter().map(|d| d.offset).collect();
        assert_eq!(offsets, vec![0, 80, 80]);
    }
}
