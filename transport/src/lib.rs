//! Wire protocol for the remote script debugger.
//!
//! Both sides of a debug session speak the same framing: every message is a
//! single JSON object on a single line, terminated by `\n`. The object carries
//! a `method` naming what the message means and a `params` object holding the
//! method-specific payload, which always includes a `procuuid` correlating the
//! debuggee process the message concerns.
//!
//! # Architecture
//!
//! - [`Method`] is the closed protocol vocabulary, with an [`Method::Unknown`]
//!   fallback so that peers speaking a newer protocol revision never break us
//! - [`Message`] is the envelope: method + procuuid + params
//! - [`MessageReader`] turns a buffered byte stream into messages, one line at
//!   a time, with both blocking and bounded polling flavors
//! - [`MessageWriter`] frames and flushes outgoing messages, one write per
//!   message
//! - [`Connection`] dials the controller with bounded timeout and splits the
//!   socket into a reader/writer pair
//! - [`params`] holds the typed payload structs shared by both sides
//!
//! # Scope
//!
//! This crate handles only transport concerns: framing, the method
//! vocabulary, typed payloads, and the two bounded "wait for this specific
//! method" points the session lifecycle needs (handshake and epilogue).
//! Session state machines, dispatch tables, and breakpoint bookkeeping belong
//! in the `client` and `debugger` crates.

mod connection;
mod error;
mod message;
mod method;
mod reader;
mod writer;

pub mod bindings;
pub mod params;

pub use connection::{connect, resolve_host, Connection, CONNECT_TIMEOUT, DEFAULT_CONTROL_PORT};
pub use error::CodecError;
pub use message::Message;
pub use method::Method;
pub use reader::{MessageReader, Poll, SocketReader};
pub use writer::MessageWriter;
