//! An RPC runtime for kernel-bypass-class datagram fabrics.
//!
//! Endpoints own their transport, buffer arena, and session state, and are
//! driven by polling a single-threaded event loop; nothing on the datapath
//! blocks or takes a lock.

mod config;
mod error;
mod handler;
mod msgbuf;
mod nexus;
mod pkthdr;
mod request;
mod rpc;
mod session;
mod transport;
pub mod type_alias;
mod util;

pub use self::config::Config;
pub use self::error::Error;
pub use self::msgbuf::MsgBuf;
pub use self::nexus::Nexus;
pub use self::request::Request;
pub use self::rpc::{Rpc, RpcStats};
pub use self::session::SessionHandle as Session;

pub use self::handler::RequestHandle;

#[cfg(test)]
mod tests;
