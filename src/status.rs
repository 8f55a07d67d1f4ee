//! Call status codes
//!
//! A [`Status`] is the final word on a call that did not end with a regular
//! response. The codes are the well known rpc status codes, so that retry and
//! hedging policies can be written in terms of them.
use std::{error, fmt};

use serde::{Deserialize, Serialize};

/// Status codes for rpc calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Code {
    /// The call completed successfully
    Ok,
    /// The call was cancelled, typically by the caller
    Cancelled,
    /// Unknown error
    Unknown,
    /// The client specified an invalid argument
    InvalidArgument,
    /// The deadline expired before the call could complete
    DeadlineExceeded,
    /// Some requested entity was not found
    NotFound,
    /// The entity that a client attempted to create already exists
    AlreadyExists,
    /// The caller does not have permission to execute the call
    PermissionDenied,
    /// Some resource has been exhausted
    ResourceExhausted,
    /// The system is not in a state required for the call
    FailedPrecondition,
    /// The call was aborted
    Aborted,
    /// The call was attempted past the valid range
    OutOfRange,
    /// The call is not implemented or not supported
    Unimplemented,
    /// Internal error
    Internal,
    /// The service is currently unavailable. Usually transient.
    Unavailable,
    /// Unrecoverable data loss or corruption
    DataLoss,
    /// The caller is not authenticated
    Unauthenticated,
}

impl Code {
    /// The canonical name of the code, e.g. `UNAVAILABLE`
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal status of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Create a new status with the given code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The call completed successfully
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// The call was cancelled
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// The deadline of the call expired
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// The service is unavailable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// The status code
    pub fn code(&self) -> Code {
        self.code
    }

    /// The human readable message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl error::Error for Status {}

/// Errors that can be classified by a status code.
///
/// This is what retry and hedging policies look at to decide whether another
/// attempt is worth it.
pub trait ErrorCode {
    /// The status code for this error
    fn code(&self) -> Code;
}

impl ErrorCode for Status {
    fn code(&self) -> Code {
        self.code
    }
}
