//! `EndpointPipeline` (`spec.md` §4.C): one per-endpoint FIFO that preserves
//! submission order, handles the control-endpoint setup packet, and tracks
//! in-flight URBs for cancel-by-endpoint.
//!
//! Grounded in the teacher's per-connection task-per-concern style
//! (`server/src/network/connection.rs` spawns a dedicated keep-alive task
//! alongside its main loop): here, one dedicated task per endpoint drains
//! completions strictly in submission order and turns each into a
//! `ReplyPacket` for the session's writer.

use crate::capture::CaptureSink;
use crate::session::effective_direction;
use crate::usb::interface::{CompletionResult, SubmitRequest, TransferType, UsbInterface};
use crate::session::multiplexer::ReplyPacket;
use protocol::header::{BasicHeader, Direction, SubmitFields};
use protocol::iso::{self, IsoPacketDescriptor};
use protocol::{UrbHeader, errno};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// One in-flight submission, queued for its completion to be awaited in
/// order by the endpoint's single completion task.
struct QueuedCompletion {
    seqnum: u32,
    devid: u32,
    raw_endpoint: u8,
    direction: Direction,
    number_of_packets: i32,
    rx: oneshot::Receiver<CompletionResult>,
}

/// Determine SUBMIT transfer type purely from header fields: endpoint 0 is
/// always control; a non-zero `number_of_packets` marks isochronous;
/// anything else is treated as bulk/interrupt (the wire header does not
/// distinguish the two, and neither the client nor this core need to: both
/// are FIFO, unbounded-length, non-iso transfers).
pub(crate) fn transfer_type_for(basic: &BasicHeader, fields: &SubmitFields) -> TransferType {
    if basic.endpoint == 0 {
        TransferType::Control
    } else if fields.number_of_packets > 0 {
        TransferType::Isochronous
    } else {
        TransferType::Bulk
    }
}

pub struct EndpointPipeline {
    raw_endpoint: u8,
    transfer_type: TransferType,
    usb: Arc<dyn UsbInterface>,
    queue_tx: mpsc::UnboundedSender<QueuedCompletion>,
}

impl EndpointPipeline {
    /// Create a pipeline for `raw_endpoint` and spawn its completion task.
    /// `transfer_type` is fixed at creation from the first SUBMIT seen for
    /// this endpoint, matching the lazy-creation lifecycle in `spec.md` §3.
    pub fn new(
        raw_endpoint: u8,
        transfer_type: TransferType,
        usb: Arc<dyn UsbInterface>,
        reply_tx: mpsc::UnboundedSender<ReplyPacket>,
        capture: Option<Arc<CaptureSink>>,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<QueuedCompletion>();

        tokio::spawn(async move {
            while let Some(queued) = queue_rx.recv().await {
                let completion = match queued.rx.await {
                    Ok(c) => c,
                    // Interface dropped the reply without completing: the
                    // submission never reached the driver (e.g. the worker
                    // thread was already shutting down).
                    Err(_) => CompletionResult {
                        status: errno::STATUS_EPROTO,
                        actual_length: 0,
                        buffer_out: Vec::new(),
                        iso_descriptors_out: Vec::new(),
                        error_count: 0,
                    },
                };

                let bytes = encode_ret_submit(&queued, completion);
                if let Some(cap) = &capture {
                    cap.dump_usbmon(queued.raw_endpoint, Direction::In, &bytes);
                }
                if reply_tx
                    .send(ReplyPacket {
                        seqnum: queued.seqnum,
                        bytes,
                    })
                    .is_err()
                {
                    // Session writer already gone; nothing left to deliver to.
                    break;
                }
            }
            trace!(raw_endpoint, "endpoint pipeline completion task exiting");
        });

        Arc::new(Self {
            raw_endpoint,
            transfer_type,
            usb,
            queue_tx,
        })
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    /// Enqueue one SUBMIT. Returns immediately; the completion task handles
    /// the reply once the underlying transfer finishes.
    pub fn handle_submit(
        &self,
        basic: BasicHeader,
        fields: SubmitFields,
        payload: Vec<u8>,
        iso_request: Vec<IsoPacketDescriptor>,
    ) {
        let direction = effective_direction(&basic, &fields.setup);
        let setup = if basic.endpoint == 0 {
            Some(fields.setup)
        } else {
            None
        };

        let buffer = match direction {
            // OUT: the client already sent the real payload.
            Direction::Out => payload,
            // IN: allocate a scratch buffer of the requested length; the
            // interface fills (and truncates) it on completion.
            Direction::In => vec![0u8; fields.transfer_buffer_length.max(0) as usize],
        };

        let request = SubmitRequest {
            seqnum: basic.seqnum,
            raw_endpoint: self.raw_endpoint,
            transfer_type: self.transfer_type,
            transfer_flags: fields.transfer_flags,
            setup,
            buffer,
            iso_descriptors: iso_request,
        };

        let rx = self.usb.submit(request);

        let _ = self.queue_tx.send(QueuedCompletion {
            seqnum: basic.seqnum,
            devid: basic.devid,
            raw_endpoint: self.raw_endpoint,
            direction,
            number_of_packets: fields.number_of_packets,
            rx,
        });
    }

    /// Best-effort cancellation of every in-flight URB on this endpoint.
    /// Idempotent: the underlying interface collapses repeated calls.
    pub fn handle_unlink(&self) {
        self.usb.abort_endpoint(self.raw_endpoint);
    }
}

fn encode_ret_submit(queued: &QueuedCompletion, completion: CompletionResult) -> Vec<u8> {
    let mut iso_out = completion.iso_descriptors_out;
    if queued.number_of_packets > 0 && matches!(queued.direction, Direction::In) {
        iso::recompute_actual_offsets(&mut iso_out);
    }

    let header = UrbHeader::new_ret_submit(
        queued.seqnum,
        queued.devid,
        queued.raw_endpoint as u32,
        completion.status,
        completion.actual_length,
        completion.error_count,
    );

    let mut bytes = Vec::new();
    protocol::write_header(&mut bytes, &header).expect("writing to a Vec cannot fail");
    if matches!(queued.direction, Direction::In) {
        bytes.extend_from_slice(&completion.buffer_out);
    }
    for d in &iso_out {
        iso::write_iso_descriptor(&mut bytes, d).expect("writing to a Vec cannot fail");
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::interface::SubmitRequest as Req;
    use std::sync::Mutex;

    /// A deterministic `UsbInterface` test double: resolves submissions in
    /// FIFO order against a queue of pre-programmed completions, and
    /// records `abort_endpoint` calls.
    struct FakeInterface {
        completions: Mutex<std::collections::VecDeque<CompletionResult>>,
        aborted: Mutex<Vec<u8>>,
    }

    impl FakeInterface {
        fn new(completions: Vec<CompletionResult>) -> Self {
            Self {
                completions: Mutex::new(completions.into()),
                aborted: Mutex::new(Vec::new()),
            }
        }
    }

    impl UsbInterface for FakeInterface {
        fn submit(&self, _request: Req) -> oneshot::Receiver<CompletionResult> {
            let (tx, rx) = oneshot::channel();
            let completion = self
                .completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(CompletionResult::cancelled);
            let _ = tx.send(completion);
            rx
        }

        fn abort_endpoint(&self, raw_endpoint: u8) {
            self.aborted.lock().unwrap().push(raw_endpoint);
        }

        fn close(&self) {}
    }

    fn basic(seqnum: u32, endpoint: u32, direction: Direction) -> BasicHeader {
        BasicHeader {
            seqnum,
            devid: 1,
            direction,
            endpoint,
        }
    }

    fn submit_fields(len: i32) -> SubmitFields {
        SubmitFields {
            transfer_flags: 0,
            transfer_buffer_length: len,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
        }
    }

    #[tokio::test]
    async fn bulk_in_roundtrip_produces_one_reply() {
        let usb = Arc::new(FakeInterface::new(vec![CompletionResult {
            status: 0,
            actual_length: 1,
            buffer_out: vec![0xAB],
            iso_descriptors_out: Vec::new(),
            error_count: 0,
        }]));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let pipeline = EndpointPipeline::new(0x81, TransferType::Bulk, usb, reply_tx, None);

        pipeline.handle_submit(basic(42, 1, Direction::In), submit_fields(1), Vec::new(), Vec::new());

        let packet = reply_rx.recv().await.unwrap();
        assert_eq!(packet.seqnum, 42);
        let decoded = protocol::read_header(&mut std::io::Cursor::new(&packet.bytes[..48])).unwrap();
        match decoded {
            UrbHeader::RetSubmit(b, f) => {
                assert_eq!(b.seqnum, 42);
                assert_eq!(f.status, 0);
                assert_eq!(f.actual_length, 1);
            }
            other => panic!("expected RetSubmit, got {other:?}"),
        }
        assert_eq!(&packet.bytes[48..], &[0xAB]);
    }

    #[tokio::test]
    async fn endpoint_fifo_preserves_submission_order() {
        let usb = Arc::new(FakeInterface::new(vec![
            CompletionResult {
                status: 0,
                actual_length: 0,
                buffer_out: Vec::new(),
                iso_descriptors_out: Vec::new(),
                error_count: 0,
            },
            CompletionResult {
                status: 0,
                actual_length: 0,
                buffer_out: Vec::new(),
                iso_descriptors_out: Vec::new(),
                error_count: 0,
            },
        ]));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let pipeline = EndpointPipeline::new(0x02, TransferType::Bulk, usb, reply_tx, None);

        pipeline.handle_submit(basic(1, 2, Direction::Out), submit_fields(0), Vec::new(), Vec::new());
        pipeline.handle_submit(basic(2, 2, Direction::Out), submit_fields(0), Vec::new(), Vec::new());

        let first = reply_rx.recv().await.unwrap();
        let second = reply_rx.recv().await.unwrap();
        assert_eq!(first.seqnum, 1);
        assert_eq!(second.seqnum, 2);
    }

    #[tokio::test]
    async fn iso_in_offsets_are_recomputed() {
        let usb = Arc::new(FakeInterface::new(vec![CompletionResult {
            status: 0,
            actual_length: 130,
            buffer_out: vec![0u8; 130],
            iso_descriptors_out: vec![
                IsoPacketDescriptor { offset: 0, length: 100, actual_length: 80, status: 0 },
                IsoPacketDescriptor { offset: 100, length: 100, actual_length: 0, status: 0 },
                IsoPacketDescriptor { offset: 200, length: 100, actual_length: 50, status: 0 },
            ],
            error_count: 0,
        }]));
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let pipeline = EndpointPipeline::new(0x83, TransferType::Isochronous, usb, reply_tx, None);

        let mut fields = submit_fields(300);
        fields.number_of_packets = 3;
        pipeline.handle_submit(basic(300, 3, Direction::In), fields, Vec::new(), vec![
            IsoPacketDescriptor { offset: 0, length: 100, actual_length: 0, status: 0 },
            IsoPacketDescriptor { offset: 100, length: 100, actual_length: 0, status: 0 },
            IsoPacketDescriptor { offset: 200, length: 100, actual_length: 0, status: 0 },
        ]);

        let packet = reply_rx.recv().await.unwrap();
        let payload_end = 48 + 130;
        let mut cur = std::io::Cursor::new(&packet.bytes[payload_end..]);
        let mut offsets = Vec::new();
        for _ in 0..3 {
            offsets.push(iso::read_iso_descriptor(&mut cur).unwrap().offset);
        }
        assert_eq!(offsets, vec![0, 80, 80]);
    }

    #[tokio::test]
    async fn handle_unlink_forwards_abort() {
        let usb = Arc::new(FakeInterface::new(Vec::new()));
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();
        let pipeline = EndpointPipeline::new(0x81, TransferType::Bulk, usb.clone(), reply_tx, None);
        pipeline.handle_unlink();
        pipeline.handle_unlink();
        assert_eq!(usb.aborted.lock().unwrap().as_slice(), &[0x81, 0x81]);
    }
}
