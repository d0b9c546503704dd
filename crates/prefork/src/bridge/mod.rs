//! Control-plane bridge between the master and its workers.
//!
//! A worker holds exactly one control connection to the master for its whole
//! life; the connection closing (from either side) is the authoritative
//! "worker is gone" signal.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerMessage/MasterMessage, LaunchSpec)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

pub use codec::JsonCodec;
pub use protocol::{LaunchSpec, MasterMessage, WorkerMessage};
