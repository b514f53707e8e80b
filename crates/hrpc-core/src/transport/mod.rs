//! Network transport for remote calls.
//!
//! Length-prefixed frames over TCP, each carrying the request id it belongs
//! to.
//!
//! # Architecture
//!
//! - **Client**: the correlator opens shared connections lazily and pairs responses with pending calls
//! - **Server**: accepts connections and dispatches requests to the local service table
//! - **Frame**: shared framing used by both sides

pub mod client;
pub mod frame;
pub mod pending;
pub mod server;

pub use client::{Correlator, ResponseFuture};
pub use frame::{encode_frame, read_frame, write_frame, Frame};
pub use pending::PendingCalls;
pub use server::{ReceiveServer, ServerContext, ServerHandle, TcpReceiveServer};
