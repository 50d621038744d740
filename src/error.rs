use thiserror::Error;

/// Domain errors returned to clients as response bodies. The discriminants
/// are stable and cross the wire as a `u16`; never reorder them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TernError {
    InternalError = 10,
    BadShard = 11,
    BadName = 12,
    BadCookie = 13,
    BadSpanBody = 14,
    BadBlockProof = 15,
    BadNumberOfBlocksProofs = 16,
    CouldNotPickBlockServices = 17,
    DirectoryNotFound = 18,
    DirectoryNotEmpty = 19,
    DirectoryHasOwner = 20,
    EdgeNotFound = 21,
    EdgeIsLocked = 22,
    EdgeNotOwned = 23,
    FileNotFound = 24,
    FileIsNotTransient = 25,
    FileNotEmpty = 26,
    FileEmpty = 27,
    LastSpanStateNotClean = 28,
    MismatchingTarget = 29,
    MismatchingCreationTime = 30,
    MismatchingOwner = 31,
    MoreRecentCurrentEdge = 32,
    MoreRecentSnapshotEdge = 33,
    MtimeIsTooRecent = 34,
    NameIsLocked = 35,
    NameNotFound = 36,
    CannotOverrideName = 37,
    CannotRemoveRootDirectory = 38,
    DeadlineNotPassed = 39,
    SameSourceAndDestination = 40,
    SpanNotFound = 41,
    BlockNotFound = 42,
    CannotCertifyBlocklessSpan = 43,
    TypeIsDirectory = 44,
    TypeIsNotDirectory = 45,
    TransientLocationCount = 46,
    SwapBlocksInlineStorage = 47,
    SwapBlocksMismatchingSize = 48,
    SwapBlocksMismatchingCrc = 49,
    SwapBlocksMismatchingState = 50,
    SwapBlocksMismatchingLocation = 51,
    SwapBlocksDuplicateBlockService = 52,
    SwapBlocksDuplicateFailureDomain = 53,
    SwapSpansInlineStorage = 54,
    SwapSpansMismatchingSize = 55,
    SwapSpansMismatchingCrc = 56,
    SwapSpansNotClean = 57,
    SwapSpansMismatchingBlocks = 58,
    AddSpanLocationInlineStorage = 59,
    AddSpanLocationMismatchingSize = 60,
    AddSpanLocationMismatchingCrc = 61,
    AddSpanLocationNotClean = 62,
    AddSpanLocationExists = 63,
}

impl TernError {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use TernError::*;
        let err = match code {
            10 => InternalError,
            11 => BadShard,
            12 => BadName,
            13 => BadCookie,
            14 => BadSpanBody,
            15 => BadBlockProof,
            16 => BadNumberOfBlocksProofs,
            17 => CouldNotPickBlockServices,
            18 => DirectoryNotFound,
            19 => DirectoryNotEmpty,
            20 => DirectoryHasOwner,
            21 => EdgeNotFound,
            22 => EdgeIsLocked,
            23 => EdgeNotOwned,
            24 => FileNotFound,
            25 => FileIsNotTransient,
            26 => FileNotEmpty,
            27 => FileEmpty,
            28 => LastSpanStateNotClean,
            29 => MismatchingTarget,
            30 => MismatchingCreationTime,
            31 => MismatchingOwner,
            32 => MoreRecentCurrentEdge,
            33 => MoreRecentSnapshotEdge,
            34 => MtimeIsTooRecent,
            35 => NameIsLocked,
            36 => NameNotFound,
            37 => CannotOverrideName,
            38 => CannotRemoveRootDirectory,
            39 => DeadlineNotPassed,
            40 => SameSourceAndDestination,
            41 => SpanNotFound,
            42 => BlockNotFound,
            43 => CannotCertifyBlocklessSpan,
            44 => TypeIsDirectory,
            45 => TypeIsNotDirectory,
            46 => TransientLocationCount,
            47 => SwapBlocksInlineStorage,
            48 => SwapBlocksMismatchingSize,
            49 => SwapBlocksMismatchingCrc,
            50 => SwapBlocksMismatchingState,
            51 => SwapBlocksMismatchingLocation,
            52 => SwapBlocksDuplicateBlockService,
            53 => SwapBlocksDuplicateFailureDomain,
            54 => SwapSpansInlineStorage,
            55 => SwapSpansMismatchingSize,
            56 => SwapSpansMismatchingCrc,
            57 => SwapSpansNotClean,
            58 => SwapSpansMismatchingBlocks,
            59 => AddSpanLocationInlineStorage,
            60 => AddSpanLocationMismatchingSize,
            61 => AddSpanLocationMismatchingCrc,
            62 => AddSpanLocationNotClean,
            63 => AddSpanLocationExists,
            _ => return None,
        };
        Some(err)
    }
}

impl std::fmt::Display for TernError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

impl std::error::Error for TernError {}

/// Codec failures. Malformed wire input surfaces here; malformed persisted
/// records do not (those panic, the store must never hold garbage).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BincodeError {
    #[error("buffer underflow: need {need} bytes, {have} remaining")]
    Underflow { need: usize, have: usize },
    #[error("{remaining} trailing bytes after message")]
    TrailingBytes { remaining: usize },
    #[error("bad protocol version {got:#x}, expected {want:#x}")]
    BadProtocolVersion { got: u32, want: u32 },
    #[error("bad signature on signed message")]
    BadMac,
    #[error("bad {what} discriminant {value:#x}")]
    BadDiscriminant { what: &'static str, value: u64 },
    #[error("byte string of length {len} exceeds 255")]
    BytesTooLong { len: usize },
    #[error("list of length {len} exceeds 65535")]
    ListTooLong { len: usize },
}

/// Errors opening a shard against its backing store.
#[derive(Debug, Error)]
pub enum ShardOpenError {
    #[error("store holds shard id {found}, configured shard id is {configured}")]
    ShardIdMismatch { configured: u8, found: u8 },
}
