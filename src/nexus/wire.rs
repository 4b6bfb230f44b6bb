//! Out-of-band management frame codec.
//!
//! Frames travel as standalone UDP datagrams, big-endian:
//!
//! | field         | bytes        |
//! | ------------- | ------------ |
//! | magic         | 4            |
//! | version       | 1            |
//! | kind          | 1            |
//! | src URI       | 1 + len      |
//! | src endpoint  | 1            |
//! | src session   | 2            |
//! | dst endpoint  | 1            |
//! | dst session   | 2            |
//! | endpoint blob | 1 + len      |
//!
//! The endpoint blob is the transport-specific NIC address, opaque to this
//! layer. A `ConnectResp` with an empty blob is a refusal.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::type_alias::*;

pub(crate) const SM_MAGIC: u32 = 0xFAB5_C0DE;
pub(crate) const SM_VERSION: u8 = 1;

/// Longest URI a frame can carry.
pub(crate) const MAX_URI_LEN: usize = 255;

/// Longest endpoint blob a frame can carry.
pub(crate) const MAX_EP_BLOB_LEN: usize = 64;

/// Management frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SmPktKind {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
}

impl TryFrom<u8> for SmPktKind {
    type Error = WireError;

    fn try_from(val: u8) -> Result<Self, WireError> {
        match val {
            0 => Ok(Self::ConnectReq),
            1 => Ok(Self::ConnectResp),
            2 => Ok(Self::DisconnectReq),
            3 => Ok(Self::DisconnectResp),
            _ => Err(WireError::BadKind(val)),
        }
    }
}

/// Decode failure. Malformed frames are logged and dropped by the listener;
/// UDP gives no sender to complain to.
#[derive(Debug, Error)]
pub(crate) enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("bad magic {0:#x}")]
    BadMagic(u32),

    #[error("unsupported version {0}")]
    BadVersion(u8),

    #[error("unknown frame kind {0}")]
    BadKind(u8),

    #[error("URI is not valid UTF-8")]
    BadUri,
}

impl From<std::io::Error> for WireError {
    fn from(_: std::io::Error) -> Self {
        WireError::Truncated
    }
}

/// A decoded management frame.
#[derive(Debug, Clone)]
pub(crate) struct SmFrame {
    pub kind: SmPktKind,

    /// Management URI of the sending Nexus; replies go here.
    pub src_uri: String,
    pub src_rpc_id: RpcId,
    pub src_sess_id: SessId,

    pub dst_rpc_id: RpcId,
    pub dst_sess_id: SessId,

    /// Transport-specific NIC address of the sender.
    pub ep_blob: Vec<u8>,
}

impl SmFrame {
    pub fn encode(&self) -> Vec<u8> {
        assert!(self.src_uri.len() <= MAX_URI_LEN, "URI too long");
        assert!(self.ep_blob.len() <= MAX_EP_BLOB_LEN, "endpoint blob too long");

        let mut buf = Vec::with_capacity(16 + self.src_uri.len() + self.ep_blob.len());
        buf.write_u32::<BigEndian>(SM_MAGIC).unwrap();
        buf.write_u8(SM_VERSION).unwrap();
        buf.write_u8(self.kind as u8).unwrap();
        buf.write_u8(self.src_uri.len() as u8).unwrap();
        buf.write_all(self.src_uri.as_bytes()).unwrap();
        buf.write_u8(self.src_rpc_id).unwrap();
        buf.write_u16::<BigEndian>(self.src_sess_id).unwrap();
        buf.write_u8(self.dst_rpc_id).unwrap();
        buf.write_u16::<BigEndian>(self.dst_sess_id).unwrap();
        buf.write_u8(self.ep_blob.len() as u8).unwrap();
        buf.write_all(&self.ep_blob).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut rd = Cursor::new(bytes);

        let magic = rd.read_u32::<BigEndian>()?;
        if magic != SM_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = rd.read_u8()?;
        if version != SM_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let kind = SmPktKind::try_from(rd.read_u8()?)?;

        let uri_len = rd.read_u8()? as usize;
        let mut uri = vec![0u8; uri_len];
        rd.read_exact(&mut uri)?;
        let src_uri = String::from_utf8(uri).map_err(|_| WireError::BadUri)?;

        let src_rpc_id = rd.read_u8()?;
        let src_sess_id = rd.read_u16::<BigEndian>()?;
        let dst_rpc_id = rd.read_u8()?;
        let dst_sess_id = rd.read_u16::<BigEndian>()?;

        let blob_len = rd.read_u8()? as usize;
        if blob_len > MAX_EP_BLOB_LEN {
            return Err(WireError::Truncated);
        }
        let mut ep_blob = vec![0u8; blob_len];
        rd.read_exact(&mut ep_blob)?;

        Ok(Self {
            kind,
            src_uri,
            src_rpc_id,
            src_sess_id,
            dst_rpc_id,
            dst_sess_id,
            ep_blob,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SmFrame {
        SmFrame {
            kind: SmPktKind::ConnectReq,
            src_uri: "192.168.1.2:31850".to_owned(),
            src_rpc_id: 3,
            src_sess_id: 17,
            dst_rpc_id: 9,
            dst_sess_id: 0,
            ep_blob: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn roundtrip() {
        let frame = sample();
        let decoded = SmFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.kind, frame.kind);
        assert_eq!(decoded.src_uri, frame.src_uri);
        assert_eq!(decoded.src_rpc_id, frame.src_rpc_id);
        assert_eq!(decoded.src_sess_id, frame.src_sess_id);
        assert_eq!(decoded.dst_rpc_id, frame.dst_rpc_id);
        assert_eq!(decoded.dst_sess_id, frame.dst_sess_id);
        assert_eq!(decoded.ep_blob, frame.ep_blob);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            SmFrame::decode(&bytes),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_truncation() {
        let bytes = sample().encode();
        for cut in 0..bytes.len() {
            assert!(SmFrame::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut bytes = sample().encode();
        bytes[5] = 42;
        assert!(matches!(SmFrame::decode(&bytes), Err(WireError::BadKind(42))));
    }
}
