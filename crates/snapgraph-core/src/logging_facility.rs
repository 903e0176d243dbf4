//! Structured logging for session operations
//!
//! Every public session operation that reaches storage (`select`, fault
//! resolution, `commit`, `rollback`, `flush_to_parent`) logs exactly one
//! `start` event and then either one `end` or one `end_error` event, all with
//! the field names from [`snapgraph_core_types::schema`]. Binaries pick an
//! output shape once with [`init`]; tests install [`init_test_capture`]
//! instead and assert on the recorded boundaries.

pub mod init;
pub mod macros;
pub mod test_capture;

pub use init::{init, Profile};
pub use test_capture::{init_test_capture, CapturedEvent, TestCapture};
