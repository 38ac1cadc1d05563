//! Wire layer for host-worker communication.
//!
//! # Architecture
//!
//! - **codec**: newline framing for AsyncRead/AsyncWrite
//! - **protocol**: request envelope, inbound classification

pub mod codec;
pub mod protocol;
