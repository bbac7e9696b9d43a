// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashing::Digest;
use serde::Serialize;

pub type Ino = u64;

pub const ROOT_INO: Ino = 1;

/// The device id reported for every inode of a single instance.
pub const DEV: u64 = 1;

pub const BLKSIZE: u64 = 4096;

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;
pub const DEFAULT_SYMLINK_MODE: u32 = 0o777;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// The kind-tag bits used when the mode is rendered in full `st_mode` form.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::Regular => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
            FileType::BlockDevice => 0o060000,
            FileType::CharDevice => 0o020000,
            FileType::Fifo => 0o010000,
            FileType::Socket => 0o140000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Regular => "file",
            FileType::Directory => "directory",
            FileType::Symlink => "symlink",
            FileType::BlockDevice => "block-device",
            FileType::CharDevice => "char-device",
            FileType::Fifo => "fifo",
            FileType::Socket => "socket",
        }
    }
}

/// The attribute record returned by `stat`/`lstat`.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Metadata {
    pub ino: Ino,
    pub kind: FileType,
    /// The 12 permission bits (rwx triplets plus suid/sgid/sticky), without kind tags.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub dev: u64,
    pub rdev: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: SystemTime,
}

impl Metadata {
    pub fn is_file(&self) -> bool {
        self.kind == FileType::Regular
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileType::Symlink
    }

    /// The full `st_mode` rendering: permission bits or-ed with the kind tag.
    pub fn mode_with_type(&self) -> u32 {
        self.mode | self.kind.mode_bits()
    }

    pub fn atime_ms(&self) -> f64 {
        millis(self.atime)
    }

    pub fn mtime_ms(&self) -> f64 {
        millis(self.mtime)
    }

    pub fn ctime_ms(&self) -> f64 {
        millis(self.ctime)
    }

    pub fn birthtime_ms(&self) -> f64 {
        millis(self.birthtime)
    }
}

pub(crate) fn millis(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
        * 1000.0
}

/// A typed `readdir` entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// The kind-specific payload of an inode.
#[derive(Clone, Debug)]
pub(crate) enum Payload {
    File { blob: Digest },
    Directory { children: BTreeMap<String, Ino> },
    Symlink { target: String },
}

impl Payload {
    pub(crate) fn kind(&self) -> FileType {
        match self {
            Payload::File { .. } => FileType::Regular,
            Payload::Directory { .. } => FileType::Directory,
            Payload::Symlink { .. } => FileType::Symlink,
        }
    }
}

/// One filesystem object, independent of the names by which it is reached.
#[derive(Clone, Debug)]
pub(crate) struct Inode {
    pub payload: Payload,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Directory entries referring to this inode. Open handles add one more to the reported
    /// nlink, but are tracked separately.
    pub link_count: u64,
    pub open_handles: usize,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: SystemTime,
}

impl Inode {
    pub(crate) fn new(payload: Payload, mode: u32, now: SystemTime) -> Inode {
        Inode {
            payload,
            mode,
            uid: 0,
            gid: 0,
            link_count: 0,
            open_handles: 0,
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
        }
    }

    /// The nlink reported by stat: directory entries plus one iff any handle is open.
    pub(crate) fn nlink(&self) -> u64 {
        self.link_count + u64::from(self.open_handles > 0)
    }

    pub(crate) fn size(&self) -> u64 {
        match &self.payload {
            Payload::File { blob } => blob.size_bytes as u64,
            Payload::Directory { .. } => 0,
            Payload::Symlink { target } => target.len() as u64,
        }
    }

    pub(crate) fn metadata(&self, ino: Ino) -> Metadata {
        let size = self.size();
        Metadata {
            ino,
            kind: self.payload.kind(),
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            nlink: self.nlink(),
            size,
            blksize: BLKSIZE,
            blocks: size.div_ceil(512),
            dev: DEV,
            rdev: 0,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            birthtime: self.birthtime,
        }
    }
}
