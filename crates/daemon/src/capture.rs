//! `CaptureSink` (`spec.md` §4.F): an optional PcapNG writer for USB-mon and
//! synthesized-UNLINK traces.
//!
//! Grounded in the teacher's `AuditLogger`/`AuditWriter`
//! (`server/src/audit.rs`): a channel-fronted background task that owns the
//! one open file, driven by an `mpsc::UnboundedReceiver<AuditMessage>` loop
//! with a `Shutdown` variant for a final flush. This sink keeps the same
//! shape — callers never touch the file directly, only send prebuilt
//! blocks through the channel — and adds the 5-second flush timer and the
//! final Interface Statistics Block `spec.md` requires.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use protocol::header::Direction;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::num::Wrapping;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// `LINKTYPE_USB_LINUX_MMAPPED`: interface 0, carries real URB traffic.
const LINKTYPE_USB_LINUX_MMAPPED: u16 = 220;
/// `LINKTYPE_RAW`: interface 1, carries synthesized IPv4/TCP UNLINK frames.
const LINKTYPE_RAW: u16 = 101;

const USB_MON_INTERFACE: u32 = 0;
const UNLINK_INTERFACE: u32 = 1;

/// 100 ns capture resolution (`tsresol = 10^-7 s`), encoded as `0x80 | 7` in
/// the `if_tsresol` option (negative power-of-ten form).
const TSRESOL_100NS_OPTION: u8 = 0x87;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

enum CaptureMessage {
    Packet { interface: u32, bytes: Vec<u8> },
    Shutdown(oneshot::Sender<()>),
}

/// Optional PcapNG sink. Cloned handles share one background writer task
/// and one open file; constructing it is the only fallible operation.
pub struct CaptureSink {
    tx: mpsc::UnboundedSender<CaptureMessage>,
    start_epoch_100ns: u64,
    start_instant: Instant,
    snaplen: u32,
    /// Source port counter for synthesized UNLINK frames, starting at
    /// `0x8000` and wrapping on overflow. `spec.md` §9 Open Question 1: the
    /// source's wraparound point is ambiguous; we preserve "advances,
    /// eventually wraps" without asserting where, via native `u16`
    /// wrapping arithmetic (DESIGN.md decision 1).
    fake_port: Mutex<Wrapping<u16>>,
    packets_written: AtomicU64,
}

impl CaptureSink {
    /// Open `path`, write the Section Header Block and both Interface
    /// Description Blocks, and spawn the background writer task.
    /// `snaplen` is clamped to `[64, i32::MAX as u32]` per `spec.md` §4.F.
    pub fn open(path: &Path, snaplen: u32) -> std::io::Result<Self> {
        let snaplen = snaplen.clamp(64, i32::MAX as u32);

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        write_section_header(&mut writer)?;
        write_interface_description(&mut writer, LINKTYPE_USB_LINUX_MMAPPED, snaplen)?;
        write_interface_description(&mut writer, LINKTYPE_RAW, snaplen)?;
        writer.flush()?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(writer, rx));

        let start_epoch_100ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64 / 100)
            .unwrap_or(0);

        Ok(Self {
            tx,
            start_epoch_100ns,
            start_instant: Instant::now(),
            snaplen,
            fake_port: Mutex::new(Wrapping(0x8000)),
            packets_written: AtomicU64::new(0),
        })
    }

    /// Packets written so far, exposed for diagnostics/logging.
    pub fn packets_written(&self) -> u64 {
        self.packets_written.load(Ordering::Relaxed)
    }

    fn timestamp_100ns(&self) -> u64 {
        let elapsed = self.start_instant.elapsed();
        self.start_epoch_100ns + elapsed.as_nanos() as u64 / 100
    }

    /// Record a real URB (SUBMIT or RET_SUBMIT) on the USB-mon interface.
    /// `direction` here is the wire direction of the serialized bytes
    /// (`Out` for what the client sent us, `In` for what we send back),
    /// matching the USB-mon convention of tagging captured URBs by which
    /// way they travelled.
    pub fn dump_usbmon(&self, raw_endpoint: u8, direction: Direction, urb_bytes: &[u8]) {
        let _ = raw_endpoint;
        let _ = direction;
        self.enqueue(USB_MON_INTERFACE, urb_bytes.to_vec());
    }

    /// Record an UNLINK (CMD_UNLINK or RET_UNLINK) as a synthesized
    /// IPv4/TCP frame on the raw interface, since UNLINK has no USB-mon
    /// representation (`spec.md` §4.F).
    pub fn dump_unlink(&self, urb_header_bytes: &[u8]) {
        let src_port = {
            let mut port = self.fake_port.lock().unwrap();
            let current = port.0;
            *port += Wrapping(1);
            current
        };
        let frame = synthesize_ipv4_tcp(src_port, urb_header_bytes);
        self.enqueue(UNLINK_INTERFACE, frame);
    }

    fn enqueue(&self, interface: u32, payload: Vec<u8>) {
        let original_len = payload.len() as u32;
        let captured: Vec<u8> = if payload.len() as u32 > self.snaplen {
            payload[..self.snaplen as usize].to_vec()
        } else {
            payload
        };

        let ts = self.timestamp_100ns();
        let block = match build_enhanced_packet_block(interface, ts, &captured, original_len) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to build capture block: {e}");
                return;
            }
        };
        self.packets_written.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(CaptureMessage::Packet { interface, bytes: block }).is_err() {
            warn!("capture writer task is gone; dropping packet");
        }
    }

    /// Flush and write the final Interface Statistics Block, then stop the
    /// writer task. Idempotent only in the sense that a second call will
    /// simply fail to find a live channel; callers should call it once at
    /// session/process shutdown.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(CaptureMessage::Shutdown(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run_writer(mut writer: BufWriter<File>, mut rx: mpsc::UnboundedReceiver<CaptureMessage>) {
    let mut flush_timer = tokio::time::interval(FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(CaptureMessage::Packet { bytes, .. }) => {
                        if let Err(e) = writer.write_all(&bytes) {
                            warn!("capture write failed: {e}");
                        }
                    }
                    Some(CaptureMessage::Shutdown(ack)) => {
                        if let Err(e) = write_interface_statistics(&mut writer, USB_MON_INTERFACE) {
                            warn!("failed to write interface statistics block: {e}");
                        }
                        let _ = writer.flush();
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                }
            }
            _ = flush_timer.tick() => {
                if let Err(e) = writer.flush() {
                    warn!("periodic capture flush failed: {e}");
                }
                debug!("capture file flushed");
            }
        }
    }
}

fn pad4(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn write_block<W: Write>(writer: &mut W, block_type: u32, body: &[u8]) -> std::io::Result<()> {
    let total_len = 12 + body.len() as u32;
    writer.write_u32::<LittleEndian>(block_type)?;
    writer.write_u32::<LittleEndian>(total_len)?;
    writer.write_all(body)?;
    writer.write_u32::<LittleEndian>(total_len)?;
    Ok(())
}

fn block_bytes(block_type: u32, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(12 + body.len());
    write_block(&mut out, block_type, body)?;
    Ok(out)
}

fn write_section_header<W: Write>(writer: &mut W) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(0x1A2B3C4D)?; // byte-order magic
    body.write_u16::<LittleEndian>(1)?; // major version
    body.write_u16::<LittleEndian>(0)?; // minor version
    body.write_i64::<LittleEndian>(-1)?; // section length unknown
    write_block(writer, 0x0A0D0D0A, &body)
}

fn write_interface_description<W: Write>(writer: &mut W, linktype: u16, snaplen: u32) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.write_u16::<LittleEndian>(linktype)?;
    body.write_u16::<LittleEndian>(0)?; // reserved
    body.write_u32::<LittleEndian>(snaplen)?;
    write_option(&mut body, 9, &[TSRESOL_100NS_OPTION])?;
    write_option_end(&mut body)?;
    write_block(writer, 0x00000001, &body)
}

fn build_enhanced_packet_block(
    interface: u32,
    ts_100ns: u64,
    captured: &[u8],
    original_len: u32,
) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(interface)?;
    body.write_u32::<LittleEndian>((ts_100ns >> 32) as u32)?;
    body.write_u32::<LittleEndian>((ts_100ns & 0xFFFF_FFFF) as u32)?;
    body.write_u32::<LittleEndian>(captured.len() as u32)?;
    body.write_u32::<LittleEndian>(original_len)?;
    body.write_all(captured)?;
    body.write_all(&vec![0u8; pad4(captured.len())])?;
    block_bytes(0x00000006, &body)
}

fn write_interface_statistics<W: Write>(writer: &mut W, interface: u32) -> std::io::Result<()> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64 / 100)
        .unwrap_or(0);
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(interface)?;
    body.write_u32::<LittleEndian>((ts >> 32) as u32)?;
    body.write_u32::<LittleEndian>((ts & 0xFFFF_FFFF) as u32)?;
    write_option_end(&mut body)?;
    write_block(writer, 0x00000005, &body)
}

fn write_option<W: Write>(writer: &mut W, code: u16, value: &[u8]) -> std::io::Result<()> {
    writer.write_u16::<LittleEndian>(code)?;
    writer.write_u16::<LittleEndian>(value.len() as u16)?;
    writer.write_all(value)?;
    writer.write_all(&vec![0u8; pad4(value.len())])?;
    Ok(())
}

fn write_option_end<W: Write>(writer: &mut W) -> std::io::Result<()> {
    writer.write_u16::<LittleEndian>(0)?;
    writer.write_u16::<LittleEndian>(0)?;
    Ok(())
}

/// Build an IPv4/TCP frame carrying `payload` (the 48-byte UrbHeader) so
/// capture tools can see UNLINKs as ordinary packets. Flags are
/// `SYN|ACK|PSH|FIN` to keep analysers from trying to track this as a real
/// TCP stream (`spec.md` §4.F).
fn synthesize_ipv4_tcp(src_port: u16, payload: &[u8]) -> Vec<u8> {
    const SRC_IP: [u8; 4] = [127, 0, 0, 1];
    const DST_IP: [u8; 4] = [127, 0, 0, 2];
    const DST_PORT: u16 = 3240; // USBIP_PORT

    let tcp_len = 20 + payload.len();
    let mut tcp = Vec::with_capacity(tcp_len);
    tcp.write_u16::<BigEndian>(src_port).unwrap();
    tcp.write_u16::<BigEndian>(DST_PORT).unwrap();
    tcp.write_u32::<BigEndian>(0).unwrap(); // seq
    tcp.write_u32::<BigEndian>(0).unwrap(); // ack
    tcp.write_u8(5 << 4).unwrap(); // data offset, no options
    tcp.write_u8(0b0010_1011).unwrap(); // FIN|PSH|ACK|SYN
    tcp.write_u16::<BigEndian>(65535).unwrap(); // window
    tcp.write_u16::<BigEndian>(0).unwrap(); // checksum placeholder
    tcp.write_u16::<BigEndian>(0).unwrap(); // urgent pointer
    tcp.extend_from_slice(payload);

    let checksum = tcp_checksum(&SRC_IP, &DST_IP, &tcp);
    tcp[16] = (checksum >> 8) as u8;
    tcp[17] = (checksum & 0xFF) as u8;

    let total_len = 20 + tcp.len();
    let mut ip = Vec::with_capacity(total_len);
    ip.write_u8(0x45).unwrap(); // version 4, IHL 5
    ip.write_u8(0).unwrap(); // DSCP/ECN
    ip.write_u16::<BigEndian>(total_len as u16).unwrap();
    ip.write_u16::<BigEndian>(0).unwrap(); // identification
    ip.write_u16::<BigEndian>(0).unwrap(); // flags/fragment offset
    ip.write_u8(64).unwrap(); // TTL
    ip.write_u8(6).unwrap(); // protocol: TCP
    ip.write_u16::<BigEndian>(0).unwrap(); // checksum placeholder
    ip.extend_from_slice(&SRC_IP);
    ip.extend_from_slice(&DST_IP);

    let ip_checksum = ip_header_checksum(&ip);
    ip[10] = (ip_checksum >> 8) as u8;
    ip[11] = (ip_checksum & 0xFF) as u8;

    ip.extend_from_slice(&tcp);
    ip
}

fn ones_complement_sum(words: impl Iterator<Item = u16>) -> u16 {
    let mut sum: u32 = 0;
    for w in words {
        sum += w as u32;
        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + 1;
        }
    }
    !(sum as u16)
}

fn be_words(bytes: &[u8]) -> Vec<u16> {
    let mut words = Vec::with_capacity(bytes.len().div_ceil(2));
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        words.push(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        words.push(u16::from_be_bytes([*last, 0]));
    }
    words
}

fn ip_header_checksum(header: &[u8]) -> u16 {
    ones_complement_sum(be_words(header).into_iter())
}

fn tcp_checksum(src_ip: &[u8; 4], dst_ip: &[u8; 4], tcp_segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + tcp_segment.len() + 1);
    pseudo.extend_from_slice(src_ip);
    pseudo.extend_from_slice(dst_ip);
    pseudo.push(0);
    pseudo.push(6); // protocol: TCP
    pseudo.extend_from_slice(&(tcp_segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(tcp_segment);
    ones_complement_sum(be_words(&pseudo).into_iter())
}
