//! The `UsbInterface` collaborator (`spec.md` §4.B): an opaque handle to a
//! claimed device that submits URBs asynchronously and reports completions.
//!
//! Unlike the teacher's handle-keyed request/response enum
//! (`common::UsbCommand` / `UsbWorker`), completions here are per-URB: each
//! `submit` gets its own `oneshot` reply, so the endpoint pipeline can treat
//! it directly as the URB's future without an intermediate dispatch table.

use protocol::IsoPacketDescriptor;
use tokio::sync::oneshot;

/// Transfer type, carried alongside the raw endpoint so the interface knows
/// which rusb call to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// One URB submission, addressed to `raw_endpoint` (bit 7 set for IN).
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub seqnum: u32,
    pub raw_endpoint: u8,
    pub transfer_type: TransferType,
    pub transfer_flags: u32,
    /// Present only for control transfers; direction is read from bit 7 of
    /// `bmRequestType` here, not from the header's direction field.
    pub setup: Option<[u8; 8]>,
    /// OUT payload, or the requested buffer length for IN transfers encoded
    /// as that many zero bytes.
    pub buffer: Vec<u8>,
    pub iso_descriptors: Vec<IsoPacketDescriptor>,
}

/// The result of one completed (or failed) URB.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    /// `0` on success, a negative errno-style value otherwise.
    pub status: i32,
    pub actual_length: i32,
    pub buffer_out: Vec<u8>,
    pub iso_descriptors_out: Vec<IsoPacketDescriptor>,
    pub error_count: i32,
}

impl CompletionResult {
    pub fn cancelled() -> Self {
        Self {
            status: protocol::errno::STATUS_ECONNRESET,
            actual_length: 0,
            buffer_out: Vec::new(),
            iso_descriptors_out: Vec::new(),
            error_count: 0,
        }
    }
}

/// Contract used by the core (`spec.md` §4.B). A platform driver may only be
/// able to cancel at endpoint granularity, not per-URB, so `abort_endpoint`
/// takes a raw endpoint and lets already in-flight `submit` futures resolve
/// with a cancelled status rather than being dropped.
pub trait UsbInterface: Send + Sync {
    /// Enqueue a submission; returns immediately with a future that resolves
    /// on completion. Synchronous enqueue failures are reported by resolving
    /// the receiver with an errno-style `CompletionResult` rather than by
    /// returning an error here, so callers always get exactly one reply.
    fn submit(&self, request: SubmitRequest) -> oneshot::Receiver<CompletionResult>;

    /// Best-effort cancellation of all in-flight URBs on `raw_endpoint`.
    /// Idempotent: calling it with nothing in flight is a no-op.
    fn abort_endpoint(&self, raw_endpoint: u8);

    /// Idempotent shutdown of the underlying device/thread.
    fn close(&self);
}
