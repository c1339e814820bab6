//! USB collaborator: the `UsbInterface` trait and its `rusb`-backed
//! implementation, plus the dedicated worker thread that drives it.

pub mod interface;
pub mod rusb_interface;
pub mod worker;

pub use interface::{CompletionResult, SubmitRequest, TransferType, UsbInterface};
pub use rusb_interface::{RusbInterface, describe_device};
