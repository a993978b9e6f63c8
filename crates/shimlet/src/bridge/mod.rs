//! Wire layer between the host process and the worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Request/response envelopes and correlation ids
//! - **codec**: Newline framing and JSON-lines codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
