// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A POSIX-semantic virtual filesystem for environments without a kernel VFS.
//!
//! The namespace (inodes, directories, hard and symbolic links, permissions, timestamps)
//! lives in [`MemFs`]; regular-file content lives in a content-addressed blob store and is
//! referenced by digest. On top of the plain operation surface sit positional
//! [`FileHandle`]s, a cancellable [`find`] traversal engine, and the filtered read-only
//! [`SparseView`].

mod error;
mod event;
mod find;
mod flags;
mod inode;
mod memfs;
mod path;
#[cfg(test)]
mod path_tests;
mod search;
mod sparse;
#[cfg(test)]
mod sparse_tests;

pub use crate::error::{ErrorKind, FsError};
pub use crate::event::{ChangeEvent, ChangeKind};
pub use crate::find::{find, Criteria, FindError, NameMatch, SizeFilter, TimeFilter};
pub use crate::flags::{
    Access, OpenOptions, O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_SYNC, O_TRUNC, O_WRONLY,
};
pub use crate::inode::{DirEntry, FileType, Ino, Metadata};
pub use crate::memfs::{FileHandle, FsStats, MemFs, MemFsOptions, WriteOutcome};
pub use crate::path::{CanonicalPath, MAX_LINK_HOPS};
pub use crate::search::{search, search_glob, SearchQuery};
pub use crate::sparse::{SparseView, WalkEntry, WalkOptions};
