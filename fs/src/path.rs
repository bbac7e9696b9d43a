// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::ops::Deref;

use serde::Serialize;

use crate::error::{ErrorKind, FsError};

/// Resolutions give up after this many symlink expansions.
pub const MAX_LINK_HOPS: u32 = 40;

const MAX_NAME_LEN: usize = 255;

///
/// An absolute path in canonical form: separator runs collapsed, `.` and `..` resolved
/// lexically, no trailing separator except at the root itself.
///
/// Canonicalization never consults the filesystem and never expands symlinks; `realpath` on
/// the backend does that. Names may contain any Unicode scalar except the separator and NUL.
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct CanonicalPath(String);

impl CanonicalPath {
    pub fn new(path: &str) -> Result<CanonicalPath, FsError> {
        if path.is_empty() {
            return Err(FsError::without_path(ErrorKind::InvalidArgument)
                .with_message("empty path"));
        }
        if !path.starts_with('/') {
            return Err(FsError::new(ErrorKind::InvalidArgument, path)
                .with_message("path must be absolute"));
        }
        if path.contains('\0') {
            return Err(FsError::new(ErrorKind::InvalidArgument, path)
                .with_message("path contains NUL"));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    // Lexical resolution: `..` above the root stays at the root.
                    segments.pop();
                }
                name => {
                    if name.len() > MAX_NAME_LEN {
                        return Err(FsError::new(ErrorKind::NameTooLong, path));
                    }
                    segments.push(name);
                }
            }
        }

        if segments.is_empty() {
            return Ok(CanonicalPath("/".to_string()));
        }
        Ok(CanonicalPath(format!("/{}", segments.join("/"))))
    }

    pub fn root() -> CanonicalPath {
        CanonicalPath("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, in order; empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// The final segment, or None at the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// The containing directory, or None at the root.
    pub fn parent(&self) -> Option<CanonicalPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(CanonicalPath::root()),
            Some(idx) => Some(CanonicalPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Appends a single name. The name must be a plain segment, already validated.
    pub fn child(&self, name: &str) -> CanonicalPath {
        if self.is_root() {
            CanonicalPath(format!("/{name}"))
        } else {
            CanonicalPath(format!("{}/{name}", self.0))
        }
    }

    /// The path relative to the root, without a leading separator. Empty for the root itself.
    pub fn relative(&self) -> &str {
        self.0.trim_start_matches('/')
    }

    /// True if `self` equals `ancestor` or sits below it.
    pub fn starts_with(&self, ancestor: &CanonicalPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0
            || (self.0.len() > ancestor.0.len()
                && self.0.starts_with(&ancestor.0)
                && self.0.as_bytes()[ancestor.0.len()] == b'/')
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for CanonicalPath {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CanonicalPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CanonicalPath> for String {
    fn from(path: CanonicalPath) -> String {
        path.0
    }
}
