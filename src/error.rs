//! Error taxonomy for meshbus.
//!
//! Integer error-code families mirror a fixed numeric layout: lifecycle
//! errors sit around `-1001`, routing errors around `-1101`, and CLI/boot
//! errors around `-1801`. [`ErrorCode::as_i32`] reproduces those magnitudes
//! so logs and wire responses stay numerically stable across releases.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeshError>;

/// Informational/error codes. Positive codes are informational; negative
/// codes are errors. `TRY_NEXT` is internal-only and must never be surfaced
/// to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    NotInited,
    AlreadyInited,
    WritePidFile,
    SetupTimer,
    AlreadyClosed,
    MissingConfigureFile,
    LoadConfigureFile,
    OperationTimeout,
    RecursiveCall,

    SetupBus,
    SendFailed,
    DiscoveryDisabled,
    DiscoveryNotFound,
    TopologyDeny,
    TopologyUnknown,
    TryNext,

    CommandIsNull,
    NoAvailableAddress,
    ConnectFailed,

    BadData,
    BufferLimit,
    ChannelNotSupport,
    NodeNotFound,
    NoConnection,
    InvalidId,
    Timeout,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        use ErrorCode::*;
        match self {
            Success => 0,
            NotInited => -1001,
            AlreadyInited => -1002,
            WritePidFile => -1003,
            SetupTimer => -1004,
            AlreadyClosed => -1005,
            MissingConfigureFile => -1006,
            LoadConfigureFile => -1007,
            OperationTimeout => -1008,
            RecursiveCall => -1009,

            SetupBus => -1101,
            SendFailed => -1102,
            DiscoveryDisabled => -1103,
            DiscoveryNotFound => -1104,
            TopologyDeny => -1105,
            TopologyUnknown => -1106,
            TryNext => -1107,

            CommandIsNull => -1801,
            NoAvailableAddress => -1802,
            ConnectFailed => -1803,

            BadData => -2001,
            BufferLimit => -2002,
            ChannelNotSupport => -2003,
            NodeNotFound => -2004,
            NoConnection => -2005,
            InvalidId => -2006,
            Timeout => -2007,
        }
    }
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("not initialized")]
    NotInited,

    #[error("already initialized")]
    AlreadyInited,

    #[error("recursive call into {0}")]
    RecursiveCall(&'static str),

    #[error("operation timed out")]
    OperationTimeout,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("registry client not ready")]
    RegistryNotReady,

    #[error("registry transport error: {0}")]
    RegistryTransport(String),

    #[error("registry authentication failed: {0}")]
    Authentication(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("discovery disabled")]
    DiscoveryDisabled,

    #[error("discovery record not found: {0}")]
    DiscoveryNotFound(String),

    #[error("topology policy denied connection to peer {0}")]
    TopologyDeny(u64),

    #[error("topology relation to peer {0} is not yet known")]
    TopologyUnknown(u64),

    #[error("send buffer limit reached")]
    BufferLimit,

    #[error("no connection available")]
    NoConnection,

    #[error("invalid connection handle id")]
    InvalidId,

    #[error("message delivery timed out")]
    MessageTimeout,

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("channel does not support this operation")]
    ChannelNotSupport,

    #[error("malformed data: {0}")]
    BadData(String),

    #[error("no available address to dial")]
    NoAvailableAddress,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MeshError::NotInited => ErrorCode::NotInited,
            MeshError::AlreadyInited => ErrorCode::AlreadyInited,
            MeshError::RecursiveCall(_) => ErrorCode::RecursiveCall,
            MeshError::OperationTimeout => ErrorCode::OperationTimeout,
            MeshError::Configuration(_) => ErrorCode::LoadConfigureFile,
            MeshError::RegistryNotReady => ErrorCode::SetupBus,
            MeshError::RegistryTransport(_) => ErrorCode::SendFailed,
            MeshError::Authentication(_) => ErrorCode::SendFailed,
            MeshError::Serialization(_) => ErrorCode::BadData,
            MeshError::DiscoveryDisabled => ErrorCode::DiscoveryDisabled,
            MeshError::DiscoveryNotFound(_) => ErrorCode::DiscoveryNotFound,
            MeshError::TopologyDeny(_) => ErrorCode::TopologyDeny,
            MeshError::TopologyUnknown(_) => ErrorCode::TopologyUnknown,
            MeshError::BufferLimit => ErrorCode::BufferLimit,
            MeshError::NoConnection => ErrorCode::NoConnection,
            MeshError::InvalidId => ErrorCode::InvalidId,
            MeshError::MessageTimeout => ErrorCode::Timeout,
            MeshError::NodeNotFound(_) => ErrorCode::NodeNotFound,
            MeshError::ChannelNotSupport => ErrorCode::ChannelNotSupport,
            MeshError::BadData(_) => ErrorCode::BadData,
            MeshError::NoAvailableAddress => ErrorCode::NoAvailableAddress,
            MeshError::ConnectFailed(_) => ErrorCode::ConnectFailed,
            MeshError::Http(_) => ErrorCode::SendFailed,
            MeshError::Io(_) => ErrorCode::SendFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_fixed_magnitudes() {
        assert_eq!(ErrorCode::Success.as_i32(), 0);
        assert_eq!(ErrorCode::NotInited.as_i32(), -1001);
        assert_eq!(ErrorCode::RecursiveCall.as_i32(), -1009);
        assert_eq!(ErrorCode::SetupBus.as_i32(), -1101);
        assert_eq!(ErrorCode::CommandIsNull.as_i32(), -1801);
    }

    #[test]
    fn mesh_error_maps_to_expected_code() {
        assert_eq!(MeshError::BufferLimit.code(), ErrorCode::BufferLimit);
        assert_eq!(
            MeshError::TopologyDeny(7).code(),
            ErrorCode::TopologyDeny
        );
    }
}
