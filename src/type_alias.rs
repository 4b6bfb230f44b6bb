//! Type aliases used in this library.

/// [`u8`]: Rpc endpoint identifier.
/// Note that this type distinguishes `Rpc` instances (control-plane), not RPC requests (data-plane).
pub type RpcId = u8;

/// [`u16`]: Session identifier.
pub type SessId = u16;

/// [`u8`]: Request type identifier.
pub type ReqType = u8;

/// [`u64`]: Request index within a session slot.
pub(crate) type ReqIdx = u64;

/// [`u16`]: Packet index within a message.
pub(crate) type PktIdx = u16;
