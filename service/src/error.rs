// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use fs::FsError;
use serde::Serialize;

/// The closed set of wire error codes: filesystem kinds pass through by name, the rest are
/// protocol-level conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Fs(fs::ErrorKind),
    InvalidSession,
    Timeout,
    Cancelled,
    MethodNotFound,
    SizeMismatch,
    InvalidData,
    CompressionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Fs(kind) => kind.code(),
            ErrorCode::InvalidSession => "INVALID_SESSION",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::SizeMismatch => "SIZE_MISMATCH",
            ErrorCode::InvalidData => "INVALID_DATA",
            ErrorCode::CompressionFailed => "COMPRESSION_FAILED",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new<M: Into<String>>(code: ErrorCode, message: M) -> ServiceError {
        ServiceError {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_session(session_id: &str) -> ServiceError {
        Self::new(
            ErrorCode::InvalidSession,
            format!("unknown or expired session: {session_id}"),
        )
    }

    pub fn invalid_data<M: Into<String>>(message: M) -> ServiceError {
        Self::new(ErrorCode::InvalidData, message)
    }

    pub fn method_not_found(method: &str) -> ServiceError {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("unknown method: {method}"),
        )
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ServiceError {}

impl From<FsError> for ServiceError {
    fn from(e: FsError) -> ServiceError {
        ServiceError {
            code: ErrorCode::Fs(e.kind),
            message: e.to_string(),
        }
    }
}

/// The error half of the response envelope.
#[derive(Serialize)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
}

impl From<&ServiceError> for WireError {
    fn from(e: &ServiceError) -> WireError {
        WireError {
            code: e.code.as_str(),
            message: e.message.clone(),
        }
    }
}
