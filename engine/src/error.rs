use std::path::PathBuf;

use certkeeper_common::Fingerprint;
use thiserror::Error;

use crate::crypto::aes::AesError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    #[error("Certificate and private key do not belong together")]
    KeyMismatch,

    #[error("Passphrase required: {0}")]
    PassphraseRequired(String),

    #[error("Passphrase could not be used: {0}")]
    PassphraseUnavailable(String),

    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    #[error("Certificate {0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Deployment action {kind} failed: {message}")]
    Deploy { kind: String, message: String },

    #[error("Operation canceled")]
    Canceled,

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid renewal schedule {expr:?}: {message}")]
    Schedule { expr: String, message: String },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(fingerprint: &Fingerprint) -> Self {
        Self::NotFound(fingerprint.to_string())
    }

    pub fn deploy(kind: &str, message: impl Into<String>) -> Self {
        Self::Deploy {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Short machine-readable code, suitable for activity data and adapters.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "ParseError",
            Self::KeyMismatch => "KeyMismatch",
            Self::PassphraseRequired(_) => "PassphraseRequired",
            Self::PassphraseUnavailable(_) => "PassphraseUnavailable",
            Self::VerifyFailed(_) => "VerifyFailed",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Io { .. } => "IOError",
            Self::Deploy { .. } => "DeployError",
            Self::Canceled => "Canceled",
            Self::Crypto(_) => "CryptoError",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Serialization(_) => "SerializationError",
            Self::Schedule { .. } => "ScheduleError",
        }
    }
}

impl From<openssl::error::ErrorStack> for EngineError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::Crypto(err.to_string())
    }
}

impl From<AesError> for EngineError {
    fn from(err: AesError) -> Self {
        match err {
            AesError::DecryptionFailed(msg) => Self::PassphraseUnavailable(msg),
            AesError::InvalidIv { .. } | AesError::InvalidKey { .. } => {
                Self::PassphraseUnavailable(err.to_string())
            }
            AesError::EncryptionFailed(msg) => Self::Crypto(msg),
        }
    }
}
