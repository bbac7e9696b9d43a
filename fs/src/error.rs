// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use serde::Serialize;

///
/// The closed set of failure kinds surfaced by filesystem operations.
///
/// Kinds are stable across releases and map one-to-one onto POSIX errno names via
/// [`ErrorKind::code`]; messages are advisory and may change.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum ErrorKind {
    /// ENOENT: a path component does not exist.
    NotFound,
    /// EEXIST: the target already exists.
    AlreadyExists,
    /// EISDIR: operation expecting a file was given a directory.
    IsADirectory,
    /// ENOTDIR: a non-final path component is not a directory.
    NotADirectory,
    /// ENOTEMPTY: directory is not empty.
    NotEmpty,
    /// EACCES: permission bits deny the requested access.
    AccessDenied,
    /// EPERM: the operation is not permitted on this object.
    NotPermitted,
    /// EBADF: the file handle is closed or lacks the needed capability.
    BadDescriptor,
    /// EINVAL: malformed argument.
    InvalidArgument,
    /// ELOOP: too many levels of symbolic links.
    TooManyLinks,
    /// ENAMETOOLONG.
    NameTooLong,
    /// ENOSPC: the substrate is out of space.
    NoSpace,
    /// EROFS: write to a read-only view.
    ReadOnly,
    /// EBUSY: the object is in use.
    Busy,
    /// EMFILE: per-instance handle limit reached.
    TooManyOpenFiles,
    /// ENFILE: substrate-wide handle limit reached.
    FileTableOverflow,
    /// EXDEV: operation would cross device boundaries.
    CrossDevice,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::AlreadyExists => "EEXIST",
            ErrorKind::IsADirectory => "EISDIR",
            ErrorKind::NotADirectory => "ENOTDIR",
            ErrorKind::NotEmpty => "ENOTEMPTY",
            ErrorKind::AccessDenied => "EACCES",
            ErrorKind::NotPermitted => "EPERM",
            ErrorKind::BadDescriptor => "EBADF",
            ErrorKind::InvalidArgument => "EINVAL",
            ErrorKind::TooManyLinks => "ELOOP",
            ErrorKind::NameTooLong => "ENAMETOOLONG",
            ErrorKind::NoSpace => "ENOSPC",
            ErrorKind::ReadOnly => "EROFS",
            ErrorKind::Busy => "EBUSY",
            ErrorKind::TooManyOpenFiles => "EMFILE",
            ErrorKind::FileTableOverflow => "ENFILE",
            ErrorKind::CrossDevice => "EXDEV",
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "no such file or directory",
            ErrorKind::AlreadyExists => "file already exists",
            ErrorKind::IsADirectory => "is a directory",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::NotEmpty => "directory not empty",
            ErrorKind::AccessDenied => "permission denied",
            ErrorKind::NotPermitted => "operation not permitted",
            ErrorKind::BadDescriptor => "bad file descriptor",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::TooManyLinks => "too many levels of symbolic links",
            ErrorKind::NameTooLong => "file name too long",
            ErrorKind::NoSpace => "no space left on device",
            ErrorKind::ReadOnly => "read-only file system",
            ErrorKind::Busy => "resource busy",
            ErrorKind::TooManyOpenFiles => "too many open files",
            ErrorKind::FileTableOverflow => "file table overflow",
            ErrorKind::CrossDevice => "cross-device link",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A structured filesystem failure: the kind, the offending path where one is meaningful, and
/// a short human message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FsError {
    pub kind: ErrorKind,
    pub path: Option<String>,
    pub message: String,
}

impl FsError {
    pub fn new<P: Into<String>>(kind: ErrorKind, path: P) -> FsError {
        FsError {
            kind,
            path: Some(path.into()),
            message: kind.default_message().to_string(),
        }
    }

    pub fn without_path(kind: ErrorKind) -> FsError {
        FsError {
            kind,
            path: None,
            message: kind.default_message().to_string(),
        }
    }

    pub fn with_message<M: Into<String>>(mut self, message: M) -> FsError {
        self.message = message.into();
        self
    }

    pub fn not_found<P: Into<String>>(path: P) -> FsError {
        Self::new(ErrorKind::NotFound, path)
    }

    pub fn already_exists<P: Into<String>>(path: P) -> FsError {
        Self::new(ErrorKind::AlreadyExists, path)
    }

    pub fn is_a_directory<P: Into<String>>(path: P) -> FsError {
        Self::new(ErrorKind::IsADirectory, path)
    }

    pub fn not_a_directory<P: Into<String>>(path: P) -> FsError {
        Self::new(ErrorKind::NotADirectory, path)
    }

    pub fn not_empty<P: Into<String>>(path: P) -> FsError {
        Self::new(ErrorKind::NotEmpty, path)
    }

    pub fn not_permitted<P: Into<String>>(path: P) -> FsError {
        Self::new(ErrorKind::NotPermitted, path)
    }

    pub fn bad_descriptor() -> FsError {
        Self::without_path(ErrorKind::BadDescriptor)
    }

    pub fn invalid_argument<M: Into<String>>(message: M) -> FsError {
        Self::without_path(ErrorKind::InvalidArgument).with_message(message)
    }

    pub fn too_many_links<P: Into<String>>(path: P) -> FsError {
        Self::new(ErrorKind::TooManyLinks, path)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}: {}", self.kind.code(), self.message, path),
            None => write!(f, "{}: {}", self.kind.code(), self.message),
        }
    }
}

impl std::error::Error for FsError {}
