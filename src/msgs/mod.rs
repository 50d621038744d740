//! Wire messages: requests, responses, and replicated-log entries.
//!
//! Everything on the wire is built from the bincode primitives through the
//! [`Wire`] trait; message structs are declared with the `wire_struct!`
//! macro which derives symmetrical encode/decode plus the packed size used
//! by the read path's MTU budgeting.
//!
//! Container format: protocol version (u32), request id (u64), kind (u16),
//! kind-dependent body. Signed variants append an 8-byte CBC-MAC of the
//! preceding bytes.

use crate::bincode::{BincodeBuf, BincodeCursor};
use crate::crypto::{MacKey, MAC_SIZE};
use crate::error::{BincodeError, TernError};
use crate::policy::DirectoryInfo;
use crate::types::{
    AddrsInfo, BlockId, BlockServiceId, Crc, FailureDomain, InodeId, InodeIdExtra, Parity,
    ShortBytes, StorageClass, TernTime,
};

mod log;
mod req;
mod resp;

pub use self::log::*;
pub use self::req::*;
pub use self::resp::*;

pub const PROTOCOL_VERSION: u32 = 0x5348_5231; // "SHR1"
pub const SHARD_LOG_PROTOCOL_VERSION: u32 = 0x5348_4C31; // "SHL1"

pub const DEFAULT_UDP_MTU: u16 = 1472; // 1500 - IP header - UDP header
pub const MAX_UDP_MTU: u16 = 8972; // 9000 - IP header - UDP header

/// Envelope bytes of every response: version, request id, kind.
pub const MSG_STATIC_SIZE: usize = 4 + 8 + 2;

/// Effective MTU from the request hint.
pub fn pick_mtu(hint: u16) -> usize {
    hint.max(DEFAULT_UDP_MTU).min(MAX_UDP_MTU) as usize
}

// ----------------------------------------------------------------
// field codec

pub trait Wire: Sized {
    fn enc(&self, buf: &mut BincodeBuf);
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError>;
    fn size(&self) -> usize;
}

macro_rules! wire_scalar {
    ($ty:ty, $pack:ident, $unpack:ident, $sz:expr) => {
        impl Wire for $ty {
            fn enc(&self, buf: &mut BincodeBuf) {
                buf.$pack(*self);
            }
            fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
                cur.$unpack()
            }
            fn size(&self) -> usize {
                $sz
            }
        }
    };
}

wire_scalar!(u8, pack_u8, unpack_u8, 1);
wire_scalar!(u16, pack_u16, unpack_u16, 2);
wire_scalar!(u32, pack_u32, unpack_u32, 4);
wire_scalar!(u64, pack_u64, unpack_u64, 8);

impl Wire for bool {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u8(*self as u8);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(cur.unpack_u8()? != 0)
    }
    fn size(&self) -> usize {
        1
    }
}

impl<const N: usize> Wire for [u8; N] {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_fixed(self);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        cur.unpack_fixed()
    }
    fn size(&self) -> usize {
        N
    }
}

impl Wire for ShortBytes {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_bytes(self.as_slice());
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(ShortBytes::new(cur.unpack_bytes()?))
    }
    fn size(&self) -> usize {
        1 + self.len()
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_list_len(self.len());
        for el in self {
            el.enc(buf);
        }
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        let len = cur.unpack_list_len()?;
        let mut out = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            out.push(T::dec(cur)?);
        }
        Ok(out)
    }
    fn size(&self) -> usize {
        2 + self.iter().map(Wire::size).sum::<usize>()
    }
}

impl Wire for InodeId {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u64(self.u64());
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        let raw = cur.unpack_u64()?;
        InodeId::try_from_u64(raw)
            .ok_or(BincodeError::BadDiscriminant { what: "inode id", value: raw })
    }
    fn size(&self) -> usize {
        8
    }
}

impl Wire for InodeIdExtra {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u64(self.u64());
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(InodeIdExtra::from_u64(cur.unpack_u64()?))
    }
    fn size(&self) -> usize {
        8
    }
}

impl Wire for TernTime {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u64(self.0);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(TernTime(cur.unpack_u64()?))
    }
    fn size(&self) -> usize {
        8
    }
}

impl Wire for BlockId {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u64(self.0);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(BlockId(cur.unpack_u64()?))
    }
    fn size(&self) -> usize {
        8
    }
}

impl Wire for BlockServiceId {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u64(self.0);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(BlockServiceId(cur.unpack_u64()?))
    }
    fn size(&self) -> usize {
        8
    }
}

impl Wire for Crc {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u32(self.0);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(Crc(cur.unpack_u32()?))
    }
    fn size(&self) -> usize {
        4
    }
}

impl Wire for Parity {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u8(self.0);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(Parity(cur.unpack_u8()?))
    }
    fn size(&self) -> usize {
        1
    }
}

impl Wire for StorageClass {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_u8(self.0);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(StorageClass(cur.unpack_u8()?))
    }
    fn size(&self) -> usize {
        1
    }
}

impl Wire for FailureDomain {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_fixed(&self.0);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(FailureDomain(cur.unpack_fixed()?))
    }
    fn size(&self) -> usize {
        16
    }
}

impl Wire for AddrsInfo {
    fn enc(&self, buf: &mut BincodeBuf) {
        buf.pack_fixed(&self.addr1.0);
        buf.pack_u16(self.addr1.1);
        buf.pack_fixed(&self.addr2.0);
        buf.pack_u16(self.addr2.1);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        Ok(AddrsInfo {
            addr1: (cur.unpack_fixed()?, cur.unpack_u16()?),
            addr2: (cur.unpack_fixed()?, cur.unpack_u16()?),
        })
    }
    fn size(&self) -> usize {
        12
    }
}

impl Wire for DirectoryInfo {
    fn enc(&self, buf: &mut BincodeBuf) {
        self.encode(buf);
    }
    fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
        DirectoryInfo::decode(cur)
    }
    fn size(&self) -> usize {
        self.packed_size()
    }
}

macro_rules! wire_struct {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ty,)*
        }

        impl Wire for $name {
            #[allow(unused_variables)]
            fn enc(&self, buf: &mut BincodeBuf) {
                $(self.$field.enc(buf);)*
            }
            #[allow(unused_variables)]
            fn dec(cur: &mut BincodeCursor<'_>) -> Result<Self, BincodeError> {
                Ok(Self { $($field: Wire::dec(cur)?,)* })
            }
            fn size(&self) -> usize {
                0 $(+ self.$field.size())*
            }
        }
    };
}

pub(crate) use wire_struct;

// ----------------------------------------------------------------
// message kinds

/// Discriminants of the request/response containers. Stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ShardMessageKind {
    Error = 0x01,
    Lookup = 0x02,
    StatFile = 0x03,
    StatDirectory = 0x04,
    ReadDir = 0x05,
    StatTransientFile = 0x06,
    FullReadDir = 0x07,
    LocalFileSpans = 0x08,
    FileSpans = 0x09,
    BlockServiceFiles = 0x0A,
    VisitDirectories = 0x0B,
    VisitFiles = 0x0C,
    VisitTransientFiles = 0x0D,
    ConstructFile = 0x20,
    LinkFile = 0x21,
    SameDirectoryRename = 0x22,
    SameDirectoryRenameSnapshot = 0x23,
    SoftUnlinkFile = 0x24,
    CreateDirectoryInode = 0x25,
    CreateLockedCurrentEdge = 0x26,
    LockCurrentEdge = 0x27,
    UnlockCurrentEdge = 0x28,
    RemoveDirectoryOwner = 0x29,
    RemoveInode = 0x2A,
    SetDirectoryOwner = 0x2B,
    SetDirectoryInfo = 0x2C,
    RemoveNonOwnedEdge = 0x2D,
    SameShardHardFileUnlink = 0x2E,
    RemoveSpanInitiate = 0x2F,
    RemoveSpanCertify = 0x30,
    AddInlineSpan = 0x31,
    AddSpanInitiate = 0x32,
    AddSpanInitiateWithReference = 0x33,
    AddSpanAtLocationInitiate = 0x34,
    AddSpanCertify = 0x35,
    AddSpanLocation = 0x36,
    MakeFileTransient = 0x37,
    ScrapTransientFile = 0x38,
    MoveSpan = 0x39,
    SwapBlocks = 0x3A,
    SwapSpans = 0x3B,
    SetTime = 0x3C,
    RemoveZeroBlockServiceFiles = 0x3D,
    RemoveOwnedSnapshotFileEdge = 0x3E,
}

impl ShardMessageKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        use ShardMessageKind::*;
        let kind = match raw {
            0x01 => Error,
            0x02 => Lookup,
            0x03 => StatFile,
            0x04 => StatDirectory,
            0x05 => ReadDir,
            0x06 => StatTransientFile,
            0x07 => FullReadDir,
            0x08 => LocalFileSpans,
            0x09 => FileSpans,
            0x0A => BlockServiceFiles,
            0x0B => VisitDirectories,
            0x0C => VisitFiles,
            0x0D => VisitTransientFiles,
            0x20 => ConstructFile,
            0x21 => LinkFile,
            0x22 => SameDirectoryRename,
            0x23 => SameDirectoryRenameSnapshot,
            0x24 => SoftUnlinkFile,
            0x25 => CreateDirectoryInode,
            0x26 => CreateLockedCurrentEdge,
            0x27 => LockCurrentEdge,
            0x28 => UnlockCurrentEdge,
            0x29 => RemoveDirectoryOwner,
            0x2A => RemoveInode,
            0x2B => SetDirectoryOwner,
            0x2C => SetDirectoryInfo,
            0x2D => RemoveNonOwnedEdge,
            0x2E => SameShardHardFileUnlink,
            0x2F => RemoveSpanInitiate,
            0x30 => RemoveSpanCertify,
            0x31 => AddInlineSpan,
            0x32 => AddSpanInitiate,
            0x33 => AddSpanInitiateWithReference,
            0x34 => AddSpanAtLocationInitiate,
            0x35 => AddSpanCertify,
            0x36 => AddSpanLocation,
            0x37 => MakeFileTransient,
            0x38 => ScrapTransientFile,
            0x39 => MoveSpan,
            0x3A => SwapBlocks,
            0x3B => SwapSpans,
            0x3C => SetTime,
            0x3D => RemoveZeroBlockServiceFiles,
            0x3E => RemoveOwnedSnapshotFileEdge,
            _ => return None,
        };
        Some(kind)
    }
}

// ----------------------------------------------------------------
// containers

macro_rules! containers {
    ($( $kind:ident => $req:ident / $resp:ident ),* $(,)?) => {
        /// A decoded request body.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ShardReq {
            $($kind($req),)*
        }

        impl ShardReq {
            pub fn kind(&self) -> ShardMessageKind {
                match self {
                    $(ShardReq::$kind(_) => ShardMessageKind::$kind,)*
                }
            }

            pub fn enc(&self, buf: &mut BincodeBuf) {
                match self {
                    $(ShardReq::$kind(body) => body.enc(buf),)*
                }
            }

            pub fn dec(
                kind: ShardMessageKind,
                cur: &mut BincodeCursor<'_>,
            ) -> Result<Self, BincodeError> {
                match kind {
                    $(ShardMessageKind::$kind => Ok(ShardReq::$kind(Wire::dec(cur)?)),)*
                    ShardMessageKind::Error => Err(BincodeError::BadDiscriminant {
                        what: "request kind",
                        value: ShardMessageKind::Error as u64,
                    }),
                }
            }
        }

        /// A response body; `Error` carries the typed domain error.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ShardResp {
            Error(TernError),
            $($kind($resp),)*
        }

        impl ShardResp {
            pub fn kind(&self) -> ShardMessageKind {
                match self {
                    ShardResp::Error(_) => ShardMessageKind::Error,
                    $(ShardResp::$kind(_) => ShardMessageKind::$kind,)*
                }
            }

            pub fn enc(&self, buf: &mut BincodeBuf) {
                match self {
                    ShardResp::Error(err) => buf.pack_u16(err.code()),
                    $(ShardResp::$kind(body) => body.enc(buf),)*
                }
            }

            pub fn dec(
                kind: ShardMessageKind,
                cur: &mut BincodeCursor<'_>,
            ) -> Result<Self, BincodeError> {
                match kind {
                    ShardMessageKind::Error => {
                        let code = cur.unpack_u16()?;
                        let err = TernError::from_code(code).ok_or(
                            BincodeError::BadDiscriminant { what: "error code", value: code as u64 },
                        )?;
                        Ok(ShardResp::Error(err))
                    }
                    $(ShardMessageKind::$kind => Ok(ShardResp::$kind(Wire::dec(cur)?)),)*
                }
            }
        }
    };
}

containers! {
    Lookup => LookupReq / LookupResp,
    StatFile => StatFileReq / StatFileResp,
    StatDirectory => StatDirectoryReq / StatDirectoryResp,
    ReadDir => ReadDirReq / ReadDirResp,
    StatTransientFile => StatTransientFileReq / StatTransientFileResp,
    FullReadDir => FullReadDirReq / FullReadDirResp,
    LocalFileSpans => LocalFileSpansReq / LocalFileSpansResp,
    FileSpans => FileSpansReq / FileSpansResp,
    BlockServiceFiles => BlockServiceFilesReq / BlockServiceFilesResp,
    VisitDirectories => VisitDirectoriesReq / VisitDirectoriesResp,
    VisitFiles => VisitFilesReq / VisitFilesResp,
    VisitTransientFiles => VisitTransientFilesReq / VisitTransientFilesResp,
    ConstructFile => ConstructFileReq / ConstructFileResp,
    LinkFile => LinkFileReq / LinkFileResp,
    SameDirectoryRename => SameDirectoryRenameReq / SameDirectoryRenameResp,
    SameDirectoryRenameSnapshot => SameDirectoryRenameSnapshotReq / SameDirectoryRenameSnapshotResp,
    SoftUnlinkFile => SoftUnlinkFileReq / SoftUnlinkFileResp,
    CreateDirectoryInode => CreateDirectoryInodeReq / CreateDirectoryInodeResp,
    CreateLockedCurrentEdge => CreateLockedCurrentEdgeReq / CreateLockedCurrentEdgeResp,
    LockCurrentEdge => LockCurrentEdgeReq / LockCurrentEdgeResp,
    UnlockCurrentEdge => UnlockCurrentEdgeReq / UnlockCurrentEdgeResp,
    RemoveDirectoryOwner => RemoveDirectoryOwnerReq / RemoveDirectoryOwnerResp,
    RemoveInode => RemoveInodeReq / RemoveInodeResp,
    SetDirectoryOwner => SetDirectoryOwnerReq / SetDirectoryOwnerResp,
    SetDirectoryInfo => SetDirectoryInfoReq / SetDirectoryInfoResp,
    RemoveNonOwnedEdge => RemoveNonOwnedEdgeReq / RemoveNonOwnedEdgeResp,
    SameShardHardFileUnlink => SameShardHardFileUnlinkReq / SameShardHardFileUnlinkResp,
    RemoveSpanInitiate => RemoveSpanInitiateReq / RemoveSpanInitiateResp,
    RemoveSpanCertify => RemoveSpanCertifyReq / RemoveSpanCertifyResp,
    AddInlineSpan => AddInlineSpanReq / AddInlineSpanResp,
    AddSpanInitiate => AddSpanInitiateReq / AddSpanInitiateResp,
    AddSpanInitiateWithReference => AddSpanInitiateWithReferenceReq / AddSpanInitiateWithReferenceResp,
    AddSpanAtLocationInitiate => AddSpanAtLocationInitiateReq / AddSpanAtLocationInitiateResp,
    AddSpanCertify => AddSpanCertifyReq / AddSpanCertifyResp,
    AddSpanLocation => AddSpanLocationReq / AddSpanLocationResp,
    MakeFileTransient => MakeFileTransientReq / MakeFileTransientResp,
    ScrapTransientFile => ScrapTransientFileReq / ScrapTransientFileResp,
    MoveSpan => MoveSpanReq / MoveSpanResp,
    SwapBlocks => SwapBlocksReq / SwapBlocksResp,
    SwapSpans => SwapSpansReq / SwapSpansResp,
    SetTime => SetTimeReq / SetTimeResp,
    RemoveZeroBlockServiceFiles => RemoveZeroBlockServiceFilesReq / RemoveZeroBlockServiceFilesResp,
    RemoveOwnedSnapshotFileEdge => RemoveOwnedSnapshotFileEdgeReq / RemoveOwnedSnapshotFileEdgeResp,
}

// ----------------------------------------------------------------
// envelopes

fn encode_envelope(id: u64, kind: ShardMessageKind, body_enc: impl FnOnce(&mut BincodeBuf)) -> Vec<u8> {
    let mut buf = BincodeBuf::with_capacity(64);
    buf.pack_u32(PROTOCOL_VERSION);
    buf.pack_u64(id);
    buf.pack_u16(kind as u16);
    body_enc(&mut buf);
    buf.into_bytes()
}

fn decode_envelope(raw: &[u8]) -> Result<(u64, ShardMessageKind, BincodeCursor<'_>), BincodeError> {
    let mut cur = BincodeCursor::new(raw);
    let version = cur.unpack_u32()?;
    if version != PROTOCOL_VERSION {
        return Err(BincodeError::BadProtocolVersion { got: version, want: PROTOCOL_VERSION });
    }
    let id = cur.unpack_u64()?;
    let kind_raw = cur.unpack_u16()?;
    let kind = ShardMessageKind::from_u16(kind_raw).ok_or(BincodeError::BadDiscriminant {
        what: "message kind",
        value: kind_raw as u64,
    })?;
    Ok((id, kind, cur))
}

/// A request with its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardReqMsg {
    pub id: u64,
    pub body: ShardReq,
}

impl ShardReqMsg {
    pub fn encode(&self) -> Vec<u8> {
        encode_envelope(self.id, self.body.kind(), |buf| self.body.enc(buf))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BincodeError> {
        let (id, kind, mut cur) = decode_envelope(raw)?;
        let body = ShardReq::dec(kind, &mut cur)?;
        cur.ensure_finished()?;
        Ok(ShardReqMsg { id, body })
    }

    pub fn encode_signed(&self, key: &MacKey) -> Vec<u8> {
        let mut bytes = self.encode();
        let mac = key.cbc_mac(&bytes);
        bytes.extend_from_slice(&mac);
        bytes
    }

    pub fn decode_signed(raw: &[u8], key: &MacKey) -> Result<Self, BincodeError> {
        let payload = split_signed(raw, key)?;
        let (id, kind, mut cur) = decode_envelope(payload)?;
        let body = ShardReq::dec(kind, &mut cur)?;
        cur.ensure_finished()?;
        Ok(ShardReqMsg { id, body })
    }
}

/// A response with its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRespMsg {
    pub id: u64,
    pub body: ShardResp,
}

impl ShardRespMsg {
    pub fn encode(&self) -> Vec<u8> {
        encode_envelope(self.id, self.body.kind(), |buf| self.body.enc(buf))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BincodeError> {
        let (id, kind, mut cur) = decode_envelope(raw)?;
        let body = ShardResp::dec(kind, &mut cur)?;
        cur.ensure_finished()?;
        Ok(ShardRespMsg { id, body })
    }

    pub fn encode_signed(&self, key: &MacKey) -> Vec<u8> {
        let mut bytes = self.encode();
        let mac = key.cbc_mac(&bytes);
        bytes.extend_from_slice(&mac);
        bytes
    }

    pub fn decode_signed(raw: &[u8], key: &MacKey) -> Result<Self, BincodeError> {
        let payload = split_signed(raw, key)?;
        let (id, kind, mut cur) = decode_envelope(payload)?;
        let body = ShardResp::dec(kind, &mut cur)?;
        cur.ensure_finished()?;
        Ok(ShardRespMsg { id, body })
    }
}

fn split_signed<'a>(raw: &'a [u8], key: &MacKey) -> Result<&'a [u8], BincodeError> {
    if raw.len() < MAC_SIZE {
        return Err(BincodeError::Underflow { need: MAC_SIZE, have: raw.len() });
    }
    let (payload, mac) = raw.split_at(raw.len() - MAC_SIZE);
    if key.cbc_mac(payload).as_slice() != mac {
        return Err(BincodeError::BadMac);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InodeType, ShardId};

    fn sample_req() -> ShardReqMsg {
        ShardReqMsg {
            id: 77,
            body: ShardReq::Lookup(LookupReq {
                dir_id: InodeId::new(InodeType::Directory, ShardId(1), 4),
                name: ShortBytes::from("hello"),
            }),
        }
    }

    #[test]
    fn request_envelope_round_trips() {
        let msg = sample_req();
        let bytes = msg.encode();
        assert_eq!(ShardReqMsg::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn bad_protocol_version_is_rejected() {
        let mut bytes = sample_req().encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ShardReqMsg::decode(&bytes),
            Err(BincodeError::BadProtocolVersion { .. })
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = sample_req().encode();
        bytes.push(0);
        assert_eq!(
            ShardReqMsg::decode(&bytes),
            Err(BincodeError::TrailingBytes { remaining: 1 })
        );
    }

    #[test]
    fn signed_envelope_verifies_and_rejects_tampering() {
        let key = MacKey::new(&[3u8; 16]);
        let msg = sample_req();
        let bytes = msg.encode_signed(&key);
        assert_eq!(ShardReqMsg::decode_signed(&bytes, &key).unwrap(), msg);
        let mut tampered = bytes.clone();
        let at = tampered.len() - MAC_SIZE - 1;
        tampered[at] ^= 1;
        assert_eq!(ShardReqMsg::decode_signed(&tampered, &key), Err(BincodeError::BadMac));
        let other_key = MacKey::new(&[4u8; 16]);
        assert_eq!(ShardReqMsg::decode_signed(&bytes, &other_key), Err(BincodeError::BadMac));
    }

    #[test]
    fn error_response_round_trips() {
        let msg = ShardRespMsg { id: 1, body: ShardResp::Error(TernError::NameNotFound) };
        let bytes = msg.encode();
        assert_eq!(ShardRespMsg::decode(&bytes).unwrap(), msg);
    }
}
