//! Framed TCP transport.
//!
//! A connection-oriented, ordered, length-preserving message stream: each
//! `put` of a byte string surfaces as exactly one message on the peer,
//! zero-length included. Framing and the reassembly decoder live in
//! [`framing`]; per-connection read/write tasks in [`conn`]; the broker-side
//! accept loop in [`server`].

pub mod conn;
pub mod framing;
pub mod server;

pub use conn::{ConnEvent, Connection};
pub use framing::{encode_message, MessageDecoder, MAX_MESSAGE_SIZE};
pub use server::TransportServer;
