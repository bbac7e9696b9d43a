// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::error::ErrorKind;
use crate::path::CanonicalPath;

#[test]
fn collapses_separator_runs_and_dots() {
    assert_eq!(
        CanonicalPath::new("/a//b/./c/../d").unwrap().as_str(),
        "/a/b/d"
    );
    assert_eq!(CanonicalPath::new("/").unwrap().as_str(), "/");
    assert_eq!(CanonicalPath::new("///").unwrap().as_str(), "/");
    assert_eq!(CanonicalPath::new("/a/b/").unwrap().as_str(), "/a/b");
}

#[test]
fn canonicalization_is_idempotent() {
    for raw in ["/a//b/./c/../d", "/", "/x/y/z/", "/../a", "/a/./."] {
        let once = CanonicalPath::new(raw).unwrap();
        let twice = CanonicalPath::new(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }
}

#[test]
fn dotdot_above_root_stays_at_root() {
    assert_eq!(CanonicalPath::new("/../../a").unwrap().as_str(), "/a");
    assert_eq!(CanonicalPath::new("/..").unwrap().as_str(), "/");
}

#[test]
fn empty_and_relative_paths_are_invalid() {
    assert_eq!(
        CanonicalPath::new("").unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        CanonicalPath::new("relative/path").unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
}

#[test]
fn nul_is_rejected_but_unicode_is_fine() {
    assert!(CanonicalPath::new("/a\0b").is_err());
    assert_eq!(
        CanonicalPath::new("/файл/数据.txt").unwrap().as_str(),
        "/файл/数据.txt"
    );
}

#[test]
fn overlong_names_are_rejected() {
    let long = format!("/{}", "x".repeat(300));
    assert_eq!(
        CanonicalPath::new(&long).unwrap_err().kind,
        ErrorKind::NameTooLong
    );
}

#[test]
fn parent_and_file_name() {
    let path = CanonicalPath::new("/a/b/c").unwrap();
    assert_eq!(path.file_name(), Some("c"));
    assert_eq!(path.parent().unwrap().as_str(), "/a/b");
    assert_eq!(
        CanonicalPath::new("/a").unwrap().parent().unwrap().as_str(),
        "/"
    );
    assert_eq!(CanonicalPath::root().parent(), None);
    assert_eq!(CanonicalPath::root().file_name(), None);
}

#[test]
fn starts_with_respects_segment_boundaries() {
    let a = CanonicalPath::new("/a").unwrap();
    let ab = CanonicalPath::new("/a/b").unwrap();
    let abc = CanonicalPath::new("/ab/c").unwrap();
    assert!(ab.starts_with(&a));
    assert!(!abc.starts_with(&a));
    assert!(a.starts_with(&CanonicalPath::root()));
}

#[test]
fn relative_strips_the_leading_separator() {
    assert_eq!(CanonicalPath::new("/a/b").unwrap().relative(), "a/b");
    assert_eq!(CanonicalPath::root().relative(), "");
}

#[test]
fn error_rendering_is_stable() {
    use crate::error::{ErrorKind, FsError};

    let e = FsError::not_found("/a/b");
    assert_eq!(e.to_string(), "ENOENT: no such file or directory: /a/b");
    assert_eq!(e.kind.code(), "ENOENT");

    let bare = FsError::bad_descriptor();
    assert_eq!(bare.to_string(), "EBADF: bad file descriptor");

    // Every kind renders its errno name.
    let kinds = [
        (ErrorKind::NotFound, "ENOENT"),
        (ErrorKind::AlreadyExists, "EEXIST"),
        (ErrorKind::IsADirectory, "EISDIR"),
        (ErrorKind::NotADirectory, "ENOTDIR"),
        (ErrorKind::NotEmpty, "ENOTEMPTY"),
        (ErrorKind::AccessDenied, "EACCES"),
        (ErrorKind::NotPermitted, "EPERM"),
        (ErrorKind::BadDescriptor, "EBADF"),
        (ErrorKind::InvalidArgument, "EINVAL"),
        (ErrorKind::TooManyLinks, "ELOOP"),
        (ErrorKind::NameTooLong, "ENAMETOOLONG"),
        (ErrorKind::NoSpace, "ENOSPC"),
        (ErrorKind::ReadOnly, "EROFS"),
        (ErrorKind::Busy, "EBUSY"),
        (ErrorKind::TooManyOpenFiles, "EMFILE"),
        (ErrorKind::FileTableOverflow, "ENFILE"),
        (ErrorKind::CrossDevice, "EXDEV"),
    ];
    for (kind, code) in kinds {
        assert_eq!(kind.code(), code);
    }
}

#[test]
fn metadata_mode_rendering_tags_kinds() {
    use crate::inode::FileType;

    assert_eq!(FileType::Regular.mode_bits(), 0o100000);
    assert_eq!(FileType::Directory.mode_bits(), 0o040000);
    assert_eq!(FileType::Symlink.mode_bits(), 0o120000);
    assert_eq!(FileType::Fifo.mode_bits(), 0o010000);
    assert_eq!(FileType::Socket.mode_bits(), 0o140000);
    assert_eq!(FileType::BlockDevice.as_str(), "block-device");
    assert_eq!(FileType::CharDevice.as_str(), "char-device");
}
