//! cairnd: a peer-to-peer file replication node.
//!
//! `transport` moves frames and raw streams over TCP, `server` turns
//! `store`/`get` calls into replication traffic on top of it.

pub mod server;
pub mod transport;

pub use server::{FileServer, FileServerOpts, ServerError};
pub use transport::{Rpc, TcpTransport, TcpTransportOpts, TransportError};
