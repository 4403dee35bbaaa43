//! Telemetry dispatch pipeline
//!
//! ```text
//! serial reader ──► line queue ──► dispatcher worker ──► SessionHandle::publish
//!                                   ▲
//!                     start / stop ─┘
//! ```
//!
//! 1. [`queue`] - bounded hand-off with a block or drop-oldest policy
//! 2. [`reading`] - line tokenizer and value normalization
//! 3. [`topics`] - fixed tag to topic table
//! 4. [`dispatcher`] - sending gate state machine
//! 5. [`dispatcher_handle`] - worker task and its control API

pub mod dispatcher;
pub mod dispatcher_handle;
pub mod queue;
pub mod reading;
pub mod topics;

pub use dispatcher::{DispatchSummary, DispatcherGate};
pub use dispatcher_handle::DispatcherHandle;
pub use queue::{line_queue, LineReceiver, LineSender, OverflowPolicy};
