//! # Error Definitions
//!
//! Protocol-level failures: a frame that cannot be understood. Any of these
//! tears down the connection that produced it.
//!
//! Application failures (service or method missing, operation failed) are not
//! errors at this layer; they travel inside a normal [`crate::Response`] and are
//! classified by [`ErrorSpot`].

/// Failures while encoding or decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The underlying Wirepack serialization failed (truncation, bad tag, depth).
    #[error("serialization failed: {0}")]
    Serialization(#[from] wirepack::Error),
    /// The frame was empty.
    #[error("empty frame")]
    EmptyFrame,
    /// The frame carries a version byte this build does not speak.
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    /// The top-level variant was neither `Request` nor `Response`.
    #[error("unknown frame type: {0}")]
    UnknownFrame(String),
    /// An `error_spot` tag outside the known set.
    #[error("unknown error spot: {0}")]
    UnknownErrorSpot(String),
    /// A required envelope field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// A specialized Result type for envelope operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies which resolution stage failed, if any.
///
/// Carried by every [`crate::Response`]. `None` means `answer` is the call's
/// result; any other spot means `answer` is a human-readable failure description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorSpot {
    #[default]
    None,
    /// The service name did not resolve.
    Service,
    /// The method name or parameter shape did not resolve.
    Method,
    /// The operation ran and failed.
    Execution,
}

impl ErrorSpot {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ErrorSpot::None => "none",
            ErrorSpot::Service => "service",
            ErrorSpot::Method => "method",
            ErrorSpot::Execution => "execution",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "none" => Ok(ErrorSpot::None),
            "service" => Ok(ErrorSpot::Service),
            "method" => Ok(ErrorSpot::Method),
            "execution" => Ok(ErrorSpot::Execution),
            other => Err(Error::UnknownErrorSpot(other.to_string())),
        }
    }

    pub fn is_error(&self) -> bool {
        *self != ErrorSpot::None
    }
}

impl std::fmt::Display for ErrorSpot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}
