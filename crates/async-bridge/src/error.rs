use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error value decoded from a foreign runtime's `FfiError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignError {
    pub code: u32,
    pub message: String,
}

impl std::fmt::Display for ForeignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Error reported by the foreign runtime, from the start call or the
    /// completion callback.
    #[error("foreign error: {0}")]
    Foreign(ForeignError),

    /// The bridge or the foreign runtime broke the completion contract.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// The foreign error code, if the error came from the foreign runtime.
    pub const fn foreign_code(&self) -> Option<u32> {
        match self {
            Self::Foreign(err) => Some(err.code),
            _ => None,
        }
    }
}

impl From<ForeignError> for Error {
    fn from(err: ForeignError) -> Self {
        Self::Foreign(err)
    }
}
