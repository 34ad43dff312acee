//! LAN chat server and client speaking a JSON line protocol over TCP.
//!
//! Every frame is one JSON object terminated by a newline and stamped with
//! the protocol version. Each module owns one concern:
//!
//! - [`message`] defines the frames and reads/writes them on async streams.
//! - [`registry`] maps online identities to their outbound queues.
//! - [`router`] decides who receives each message a client sends.
//! - [`session`] drives one accepted connection from handshake to teardown.
//! - [`server`] accepts connections and spawns a session for each.
//! - [`transfer`] chunks outgoing files and reassembles incoming ones.
//! - [`client`] is the connection-level client API used by front-ends.
//! - [`console`] and [`terminal`] make up the line-oriented front-end.
//! - [`cli`] parses the command line for server and client modes.
//!
//! Integration tests drive real TCP servers through this crate directly.

pub mod cli;
pub mod client;
pub mod console;
pub mod error;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod terminal;
pub mod transfer;
