//! Error types for Stratum v1 protocol.
//!
//! [`StratumError`] covers the connection itself: I/O, framing and protocol
//! violations, all of which end the session. [`ShareError`] is the catalog
//! of rejections reported back to the miner, each with a fixed code and
//! message; the session stays up after one of those.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;

/// Stratum connection errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unparseable or structurally invalid message from the miner
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A line or frame longer than the codec accepts
    #[error("Message exceeds {0} bytes")]
    MessageTooLong(usize),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,
}

impl From<tokio_util::codec::LinesCodecError> for StratumError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            // LinesCodec reports non-UTF-8 input this way.
            tokio_util::codec::LinesCodecError::Io(e)
                if e.kind() == std::io::ErrorKind::InvalidData =>
            {
                StratumError::Malformed(e.to_string())
            }
            tokio_util::codec::LinesCodecError::Io(e) => StratumError::Io(e),
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                StratumError::MessageTooLong(super::connection::MAX_LINE_LENGTH)
            }
        }
    }
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;

/// Numeric error codes sent to miners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(u16)]
pub enum ErrorCode {
    Other = 20,
    Stale = 21,
    Duplicate = 22,
    LowDifficulty = 23,
    UnauthorizedWorker = 24,
    NotSubscribed = 25,
}

/// Reasons a submitted share is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareError {
    #[error("Incorrect size of extranonce2")]
    IncorrectExtranonce2Size,

    #[error("Incorrect size of ntime")]
    IncorrectTimeSize,

    #[error("ntime out of range")]
    TimeOutOfRange,

    #[error("Incorrect size of nonce")]
    IncorrectNonceSize,

    #[error("Incorrect size of header hash")]
    IncorrectHeaderHashSize,

    #[error("Incorrect size of mix hash")]
    IncorrectMixHashSize,

    #[error("Incorrect size of MTP hash root")]
    IncorrectMtpHashRootSize,

    #[error("Incorrect size of MTP block")]
    IncorrectMtpBlockSize,

    #[error("Incorrect size of MTP proof")]
    IncorrectMtpProofSize,

    #[error("Incorrect nonce prefix")]
    IncorrectNoncePrefix,

    #[error("Incorrect header hash")]
    IncorrectHeaderHash,

    #[error("Proof of work verification failed")]
    ProofOfWorkVerifyFailed,

    #[error("Stale share - Job not found")]
    StaleShare,

    #[error("Duplicate share")]
    DuplicateShare,

    #[error("Low difficulty")]
    LowDifficulty,

    #[error("Unauthorized worker")]
    UnauthorizedWorker,

    #[error("Not subscribed")]
    NotSubscribed,
}

impl ShareError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ShareError::StaleShare => ErrorCode::Stale,
            ShareError::DuplicateShare => ErrorCode::Duplicate,
            ShareError::LowDifficulty => ErrorCode::LowDifficulty,
            ShareError::UnauthorizedWorker => ErrorCode::UnauthorizedWorker,
            ShareError::NotSubscribed => ErrorCode::NotSubscribed,
            _ => ErrorCode::Other,
        }
    }

    /// The `[code, message, null]` array used in error responses.
    pub fn to_response(&self) -> Value {
        json!([self.code() as u16, self.to_string(), null])
    }
}

impl Serialize for ShareError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ShareError", 2)?;
        state.serialize_field("code", &(self.code() as u16))?;
        state.serialize_field("error", &self.to_string())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ShareError::IncorrectExtranonce2Size, 20, "Incorrect size of extranonce2")]
    #[test_case(ShareError::IncorrectTimeSize, 20, "Incorrect size of ntime")]
    #[test_case(ShareError::TimeOutOfRange, 20, "ntime out of range")]
    #[test_case(ShareError::IncorrectNonceSize, 20, "Incorrect size of nonce")]
    #[test_case(ShareError::IncorrectMtpProofSize, 20, "Incorrect size of MTP proof")]
    #[test_case(ShareError::StaleShare, 21, "Stale share - Job not found")]
    #[test_case(ShareError::DuplicateShare, 22, "Duplicate share")]
    #[test_case(ShareError::LowDifficulty, 23, "Low difficulty")]
    #[test_case(ShareError::UnauthorizedWorker, 24, "Unauthorized worker")]
    #[test_case(ShareError::NotSubscribed, 25, "Not subscribed")]
    fn test_catalog(error: ShareError, code: u16, message: &str) {
        assert_eq!(error.code() as u16, code);
        assert_eq!(error.to_response(), json!([code, message, null]));
    }

    #[test]
    fn test_code_from_repr() {
        assert_eq!(ErrorCode::from_repr(23), Some(ErrorCode::LowDifficulty));
        assert_eq!(ErrorCode::from_repr(26), None);
    }

    #[test]
    fn test_serialize_share_error() {
        let value = serde_json::to_value(ShareError::DuplicateShare).unwrap();
        assert_eq!(value, json!({ "code": 22, "error": "Duplicate share" }));
    }
}
