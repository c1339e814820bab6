//! `SessionMultiplexer` (`spec.md` §4.D): the reader loop, the writer loop,
//! the pending-submit and pending-unlink maps, and the race-resolution
//! rules between SUBMIT completions and UNLINK commands.
//!
//! Grounded in the teacher's `ClientConnection::run` (split reader/background
//! task pair driven by `tokio::select!`) and its `broadcast::Sender<()>`
//! cancellation style (`PendingTransfer::cancel_tx` in the same file).

use crate::capture::CaptureSink;
use crate::error::DaemonError;
use crate::session::endpoint::{EndpointPipeline, transfer_type_for};
use crate::session::raw_endpoint;
use crate::usb::interface::{TransferType, UsbInterface};
use protocol::header::{self, BasicHeader, Direction, SubmitFields};
use protocol::{UrbHeader, errno};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Maximum simultaneously in-flight SUBMITs this session will track. Client
/// flow control and the OS driver's own URB limit are expected to keep
/// real traffic far below this; it exists only as a backstop against a
/// misbehaving or hostile peer (`spec.md` §3 lifecycle note).
const MAX_IN_FLIGHT: usize = 4096;

/// A fully serialized reply ready to go out on the wire, tagged with the
/// SUBMIT seqnum it answers. Used both for real completions and for the
/// reader's zero-length "wake the writer" packets on UNLINK.
pub struct ReplyPacket {
    pub seqnum: u32,
    pub bytes: Vec<u8>,
}

/// Queued by the reader when `CMD_UNLINK` arrives; drained by the writer.
#[derive(Debug, Clone, Copy)]
pub struct UnlinkRecord {
    pub unlink_seqnum: u32,
    pub target_seqnum: u32,
}

/// `seqnum -> raw_endpoint`, single-writer (reader inserts), with removal
/// the single source of truth for "who gets to reply" (`spec.md` §5): an
/// atomic `HashMap::remove` is sufficient, no broader lock is needed because
/// every caller treats "did my remove return `Some`" as the whole answer.
type PendingSubmits = Arc<Mutex<HashMap<u32, u8>>>;

pub struct SessionMultiplexer {
    devid: u32,
    usb: Arc<dyn UsbInterface>,
    capture: Option<Arc<CaptureSink>>,
    pending_submits: PendingSubmits,
    endpoints: Mutex<HashMap<u8, Arc<EndpointPipeline>>>,
    reply_tx: mpsc::UnboundedSender<ReplyPacket>,
    reply_rx: Mutex<Option<mpsc::UnboundedReceiver<ReplyPacket>>>,
    unlink_tx: mpsc::UnboundedSender<UnlinkRecord>,
    unlink_rx: Mutex<Option<mpsc::UnboundedReceiver<UnlinkRecord>>>,
}

impl SessionMultiplexer {
    pub fn new(devid: u32, usb: Arc<dyn UsbInterface>, capture: Option<Arc<CaptureSink>>) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (unlink_tx, unlink_rx) = mpsc::unbounded_channel();
        Self {
            devid,
            usb,
            capture,
            pending_submits: Arc::new(Mutex::new(HashMap::new())),
            endpoints: Mutex::new(HashMap::new()),
            reply_tx,
            reply_rx: Mutex::new(Some(reply_rx)),
            unlink_tx,
            unlink_rx: Mutex::new(Some(unlink_rx)),
        }
    }

    fn endpoint_for(
        &self,
        raw_ep: u8,
        transfer_type: TransferType,
    ) -> Arc<EndpointPipeline> {
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints
            .entry(raw_ep)
            .or_insert_with(|| {
                EndpointPipeline::new(
                    raw_ep,
                    transfer_type,
                    self.usb.clone(),
                    self.reply_tx.clone(),
                    self.capture.clone(),
                )
            })
            .clone()
    }

    /// Run reader and writer concurrently until the connection ends or
    /// `cancel` fires. Returns once both sides have stopped; the caller
    /// owns closing the `UsbInterface` and notifying the device store.
    pub async fn run<S>(self: Arc<Self>, stream: S, mut cancel: broadcast::Receiver<()>) -> Result<(), DaemonError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let reply_rx = self
            .reply_rx
            .lock()
            .unwrap()
            .take()
            .expect("run() called twice on one session");
        let unlink_rx = self
            .unlink_rx
            .lock()
            .unwrap()
            .take()
            .expect("run() called twice on one session");

        // `done` tells the writer the reader has stopped, independent of
        // the external cancellation token: a protocol error or plain EOF
        // ends the reader without anyone broadcasting on `cancel`, and the
        // writer must not block forever waiting for replies that will
        // never arrive once the socket is effectively half-dead.
        let (done_tx, done_rx) = oneshot::channel();
        let writer_session = self.clone();
        let mut writer_cancel = cancel.resubscribe();
        let writer = tokio::spawn(async move {
            writer_session
                .writer_loop(&mut write_half, reply_rx, unlink_rx, &mut writer_cancel, done_rx)
                .await
        });

        let reader_result = tokio::select! {
            result = self.reader_loop(&mut read_half) => result,
            _ = cancel.recv() => Err(DaemonError::Unplugged),
        };

        let _ = done_tx.send(());
        let _ = writer.await;

        // Best-effort cleanup on every exit path: abort whatever is still
        // outstanding on each endpoint and release the device (`spec.md`
        // §5 cancellation semantics).
        let endpoints: Vec<_> = self.endpoints.lock().unwrap().values().cloned().collect();
        for pipeline in endpoints {
            pipeline.handle_unlink();
        }
        self.usb.close();

        reader_result
    }

    async fn reader_loop<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<(), DaemonError> {
        loop {
            let header = header::r#async::read_header(reader).await?;

            match header {
                UrbHeader::Submit(basic, fields) => {
                    self.handle_submit(reader, basic, fields).await?;
                }
                UrbHeader::Unlink(basic, fields) => {
                    self.handle_unlink(basic, fields);
                }
                UrbHeader::RetSubmit(..) | UrbHeader::RetUnlink(..) => {
                    warn!("client sent a reply-only command; closing session");
                    return Err(DaemonError::UnexpectedReply);
                }
            }
        }
    }

    async fn handle_submit<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        basic: BasicHeader,
        fields: SubmitFields,
    ) -> Result<(), DaemonError> {
        {
            let mut pending = self.pending_submits.lock().unwrap();
            if pending.len() >= MAX_IN_FLIGHT {
                warn!("in-flight SUBMIT cap exceeded; closing session");
                return Err(DaemonError::TooManyInFlight);
            }
            if pending.contains_key(&basic.seqnum) {
                warn!(seqnum = basic.seqnum, "duplicate SUBMIT seqnum; closing session");
                return Err(DaemonError::DuplicateSeqnum(basic.seqnum));
            }
            let raw_ep = raw_endpoint(&basic);
            pending.insert(basic.seqnum, raw_ep);
        }

        let direction = crate::session::effective_direction(&basic, &fields.setup);
        let payload = if matches!(direction, Direction::Out) && fields.transfer_buffer_length > 0 {
            let mut buf = vec![0u8; fields.transfer_buffer_length as usize];
            reader.read_exact(&mut buf).await.map_err(|e| {
                self.pending_submits.lock().unwrap().remove(&basic.seqnum);
                DaemonError::Io(e)
            })?;
            buf
        } else {
            Vec::new()
        };

        let mut iso_request = Vec::with_capacity(fields.number_of_packets.max(0) as usize);
        for _ in 0..fields.number_of_packets.max(0) {
            let descriptor = protocol::iso::r#async::read_iso_descriptor(reader)
                .await
                .map_err(|e| {
                    self.pending_submits.lock().unwrap().remove(&basic.seqnum);
                    DaemonError::from(e)
                })?;
            iso_request.push(descriptor);
        }

        if let Some(cap) = &self.capture {
            let mut preview = Vec::new();
            protocol::write_header(&mut preview, &UrbHeader::Submit(basic, fields)).ok();
            preview.extend_from_slice(&payload);
            cap.dump_usbmon(raw_endpoint(&basic), Direction::Out, &preview);
        }

        let raw_ep = raw_endpoint(&basic);
        let transfer_type = transfer_type_for(&basic, &fields);
        let pipeline = self.endpoint_for(raw_ep, transfer_type);
        pipeline.handle_submit(basic, fields, payload, iso_request);
        Ok(())
    }

    fn handle_unlink(&self, basic: BasicHeader, fields: header::UnlinkFields) {
        let record = UnlinkRecord {
            unlink_seqnum: basic.seqnum,
            target_seqnum: fields.unlinked_seqnum,
        };

        let owning_endpoint = self
            .pending_submits
            .lock()
            .unwrap()
            .get(&record.target_seqnum)
            .copied();

        if let Some(raw_ep) = owning_endpoint {
            if let Some(pipeline) = self.endpoints.lock().unwrap().get(&raw_ep).cloned() {
                pipeline.handle_unlink();
            }
        }

        if let Some(cap) = &self.capture {
            let mut bytes = Vec::new();
            protocol::write_header(&mut bytes, &UrbHeader::Unlink(basic, fields)).ok();
            cap.dump_unlink(&bytes);
        }

        let _ = self.unlink_tx.send(record);
        // Zero-length wake packet: guarantees the writer observes the
        // UNLINK even if no SUBMIT completion ever arrives for this
        // endpoint again (`spec.md` §4.D step 4).
        let _ = self.reply_tx.send(ReplyPacket {
            seqnum: 0,
            bytes: Vec::new(),
        });
    }

    async fn writer_loop<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        mut reply_rx: mpsc::UnboundedReceiver<ReplyPacket>,
        mut unlink_rx: mpsc::UnboundedReceiver<UnlinkRecord>,
        cancel: &mut broadcast::Receiver<()>,
        mut done: oneshot::Receiver<()>,
    ) -> Result<(), DaemonError> {
        loop {
            let packet = tokio::select! {
                packet = reply_rx.recv() => match packet {
                    Some(p) => p,
                    None => return Ok(()),
                },
                _ = cancel.recv() => return Ok(()),
                _ = &mut done => return Ok(()),
            };

            // Drain every queued UNLINK before writing anything else: the
            // protocol prefers client intent (`spec.md` §4.D, testable
            // property 4).
            self.drain_unlinks(writer, &mut unlink_rx).await?;

            if packet.bytes.is_empty() {
                continue;
            }

            let delivered = self.pending_submits.lock().unwrap().remove(&packet.seqnum).is_some();
            if delivered {
                writer.write_all(&packet.bytes).await?;
            } else {
                debug!(
                    seqnum = packet.seqnum,
                    "dropping SUBMIT completion for an already-UNLINKed URB"
                );
            }
        }
    }

    async fn drain_unlinks<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        unlink_rx: &mut mpsc::UnboundedReceiver<UnlinkRecord>,
    ) -> Result<(), DaemonError> {
        let mut drained: VecDeque<UnlinkRecord> = VecDeque::new();
        while let Ok(record) = unlink_rx.try_recv() {
            drained.push_back(record);
        }

        for record in drained {
            let won = self
                .pending_submits
                .lock()
                .unwrap()
                .remove(&record.target_seqnum)
                .is_some();
            let status = if won { errno::STATUS_ECONNRESET } else { errno::STATUS_OK };
            let header = UrbHeader::new_ret_unlink(record.unlink_seqnum, self.devid, status);
            let mut bytes = Vec::new();
            protocol::write_header(&mut bytes, &header)?;
            if let Some(cap) = &self.capture {
                cap.dump_unlink(&bytes);
            }
            writer.write_all(&bytes).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::interface::{CompletionResult, SubmitRequest};
    use protocol::header::RetUnlinkFields;
    use tokio::io::{AsyncReadExt, duplex};

    /// A `UsbInterface` whose completions are triggered by the test, not by
    /// the interface itself — needed to put a SUBMIT's completion on either
    /// side of an UNLINK deterministically.
    #[derive(Default)]
    struct ControllableInterface {
        pending: Mutex<HashMap<u32, oneshot::Sender<CompletionResult>>>,
    }

    impl ControllableInterface {
        fn complete(&self, seqnum: u32, completion: CompletionResult) {
            if let Some(tx) = self.pending.lock().unwrap().remove(&seqnum) {
                let _ = tx.send(completion);
            }
        }
    }

    impl UsbInterface for ControllableInterface {
        fn submit(&self, request: SubmitRequest) -> oneshot::Receiver<CompletionResult> {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().insert(request.seqnum, tx);
            rx
        }

        fn abort_endpoint(&self, _raw_endpoint: u8) {}
        fn close(&self) {}
    }

    fn ok_completion() -> CompletionResult {
        CompletionResult {
            status: 0,
            actual_length: 0,
            buffer_out: Vec::new(),
            iso_descriptors_out: Vec::new(),
            error_count: 0,
        }
    }

    fn submit_bytes(seqnum: u32, endpoint: u32) -> Vec<u8> {
        let basic = BasicHeader {
            seqnum,
            devid: 1,
            direction: Direction::In,
            endpoint,
        };
        let fields = SubmitFields {
            transfer_flags: 0,
            transfer_buffer_length: 64,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
        };
        let mut bytes = Vec::new();
        protocol::write_header(&mut bytes, &UrbHeader::Submit(basic, fields)).unwrap();
        bytes
    }

    fn unlink_bytes(unlink_seqnum: u32, target_seqnum: u32) -> Vec<u8> {
        let basic = BasicHeader {
            seqnum: unlink_seqnum,
            devid: 1,
            direction: Direction::Out,
            endpoint: 0,
        };
        let fields = header::UnlinkFields { unlinked_seqnum: target_seqnum };
        let mut bytes = Vec::new();
        protocol::write_header(&mut bytes, &UrbHeader::Unlink(basic, fields)).unwrap();
        bytes
    }

    async fn read_header_from(client: &mut (impl AsyncReadExt + Unpin)) -> UrbHeader {
        let mut buf = [0u8; 48];
        client.read_exact(&mut buf).await.unwrap();
        protocol::read_header(&mut std::io::Cursor::new(&buf)).unwrap()
    }

    /// E4 — UNLINK wins: a CMD_UNLINK for a seqnum still in flight closes out
    /// with RET_UNLINK(-ECONNRESET) and no RET_SUBMIT is ever written for it,
    /// even once the driver eventually completes.
    #[tokio::test]
    async fn unlink_wins_when_submit_not_yet_complete() {
        let interface = Arc::new(ControllableInterface::default());
        let mux = Arc::new(SessionMultiplexer::new(1, interface.clone(), None));
        let (mut client, server) = duplex(4096);
        let (_cancel_tx, cancel_rx) = broadcast::channel(1);

        let run_handle = tokio::spawn(mux.clone().run(server, cancel_rx));

        client.write_all(&submit_bytes(100, 2)).await.unwrap();
        client.write_all(&unlink_bytes(101, 100)).await.unwrap();

        let reply = read_header_from(&mut client).await;
        match reply {
            UrbHeader::RetUnlink(b, RetUnlinkFields { status }) => {
                assert_eq!(b.seqnum, 101);
                assert_eq!(status, errno::STATUS_ECONNRESET);
            }
            other => panic!("expected RetUnlink, got {other:?}"),
        }

        // Completing the SUBMIT now must not produce a second reply.
        interface.complete(100, ok_completion());
        drop(client);
        let _ = run_handle.await;
    }

    /// E5 — UNLINK loses: once RET_SUBMIT has already been written for a
    /// seqnum, a later UNLINK targeting it gets RET_UNLINK(status=0).
    #[tokio::test]
    async fn unlink_loses_after_submit_already_replied() {
        let interface = Arc::new(ControllableInterface::default());
        let mux = Arc::new(SessionMultiplexer::new(1, interface.clone(), None));
        let (mut client, server) = duplex(4096);
        let (_cancel_tx, cancel_rx) = broadcast::channel(1);

        let run_handle = tokio::spawn(mux.clone().run(server, cancel_rx));

        client.write_all(&submit_bytes(200, 2)).await.unwrap();
        interface.complete(200, ok_completion());

        let reply = read_header_from(&mut client).await;
        match reply {
            UrbHeader::RetSubmit(b, fields) => {
                assert_eq!(b.seqnum, 200);
                assert_eq!(fields.status, 0);
            }
            other => panic!("expected RetSubmit, got {other:?}"),
        }
        // `ok_completion()` reports zero actual_length, so no payload bytes
        // follow the 48-byte header here.

        client.write_all(&unlink_bytes(201, 200)).await.unwrap();
        let reply = read_header_from(&mut client).await;
        match reply {
            UrbHeader::RetUnlink(b, RetUnlinkFields { status }) => {
                assert_eq!(b.seqnum, 201);
                assert_eq!(status, errno::STATUS_OK);
            }
            other => panic!("expected RetUnlink, got {other:?}"),
        }

        drop(client);
        let _ = run_handle.await;
    }

    /// Property 6: UNLINK for a seqnum the session never saw is a no-op
    /// reply, not an error.
    #[tokio::test]
    async fn unlink_for_unknown_seqnum_replies_ok() {
        let interface = Arc::new(ControllableInterface::default());
        let mux = Arc::new(SessionMultiplexer::new(1, interface, None));
        let (mut client, server) = duplex(4096);
        let (_cancel_tx, cancel_rx) = broadcast::channel(1);

        let run_handle = tokio::spawn(mux.clone().run(server, cancel_rx));

        client.write_all(&unlink_bytes(9, 999)).await.unwrap();
        let reply = read_header_from(&mut client).await;
        match reply {
            UrbHeader::RetUnlink(b, RetUnlinkFields { status }) => {
                assert_eq!(b.seqnum, 9);
                assert_eq!(status, errno::STATUS_OK);
            }
            other => panic!("expected RetUnlink, got {other:?}"),
        }

        drop(client);
        let _ = run_handle.await;
    }

    /// Property 7: a duplicate SUBMIT seqnum on a live session is fatal.
    #[tokio::test]
    async fn duplicate_submit_seqnum_closes_session() {
        let interface = Arc::new(ControllableInterface::default());
        let mux = Arc::new(SessionMultiplexer::new(1, interface, None));
        let (mut client, server) = duplex(4096);
        let (_cancel_tx, cancel_rx) = broadcast::channel(1);

        let run_handle = tokio::spawn(mux.clone().run(server, cancel_rx));

        client.write_all(&submit_bytes(5, 2)).await.unwrap();
        client.write_all(&submit_bytes(5, 2)).await.unwrap();

        let result = run_handle.await.unwrap();
        assert!(matches!(result, Err(DaemonError::DuplicateSeqnum(5))));
    }
}

