// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::error::FsError;

pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_CREAT: u32 = 64;
pub const O_EXCL: u32 = 128;
pub const O_TRUNC: u32 = 512;
pub const O_APPEND: u32 = 1024;
pub const O_SYNC: u32 = 4096;

const O_ACCMODE: u32 = 3;
const O_KNOWN: u32 = O_ACCMODE | O_CREAT | O_EXCL | O_TRUNC | O_APPEND | O_SYNC;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

///
/// A parsed open request: either numeric flags composed by bitwise OR over the stable value
/// set above, or one of the text flag spellings (`r`, `r+`, `w`, `wx`, `w+`, `a`, `ax`, `a+`,
/// each optionally carrying an `s` sync modifier). Anything else is EINVAL.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenOptions {
    pub access: Access,
    pub create: bool,
    pub excl: bool,
    pub truncate: bool,
    pub append: bool,
    pub sync: bool,
    pub must_exist: bool,
}

impl OpenOptions {
    pub fn read() -> OpenOptions {
        Self::from_text("r").unwrap()
    }

    pub fn write() -> OpenOptions {
        Self::from_text("w").unwrap()
    }

    pub fn from_numeric(flags: u32) -> Result<OpenOptions, FsError> {
        if flags & !O_KNOWN != 0 {
            return Err(FsError::invalid_argument(format!(
                "unknown open flag bits: 0o{:o}",
                flags & !O_KNOWN
            )));
        }
        let access = match flags & O_ACCMODE {
            O_RDONLY => Access::Read,
            O_WRONLY => Access::Write,
            O_RDWR => Access::ReadWrite,
            _ => {
                return Err(FsError::invalid_argument(
                    "access mode may not combine O_WRONLY with O_RDWR",
                ))
            }
        };
        let create = flags & O_CREAT != 0;
        Ok(OpenOptions {
            access,
            create,
            excl: flags & O_EXCL != 0,
            truncate: flags & O_TRUNC != 0,
            append: flags & O_APPEND != 0,
            sync: flags & O_SYNC != 0,
            must_exist: !create,
        })
    }

    pub fn from_text(flags: &str) -> Result<OpenOptions, FsError> {
        // At most one `s` modifier, anywhere after the first character.
        let sync = flags.matches('s').count() == 1;
        if flags.matches('s').count() > 1 {
            return Err(FsError::invalid_argument(format!(
                "invalid open flags: {flags:?}"
            )));
        }
        let base: String = flags.chars().filter(|c| *c != 's').collect();

        let (access, create, excl, truncate, append, must_exist) = match base.as_str() {
            "r" => (Access::Read, false, false, false, false, true),
            "r+" => (Access::ReadWrite, false, false, false, false, true),
            "w" => (Access::Write, true, false, true, false, false),
            "wx" => (Access::Write, true, true, true, false, false),
            "w+" => (Access::ReadWrite, true, false, true, false, false),
            "a" => (Access::Write, true, false, false, true, false),
            "ax" => (Access::Write, true, true, false, true, false),
            "a+" => (Access::ReadWrite, true, false, false, true, false),
            _ => {
                return Err(FsError::invalid_argument(format!(
                    "invalid open flags: {flags:?}"
                )))
            }
        };
        Ok(OpenOptions {
            access,
            create,
            excl,
            truncate,
            append,
            sync,
            must_exist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_flag_table() {
        let r = OpenOptions::from_text("r").unwrap();
        assert_eq!(r.access, Access::Read);
        assert!(r.must_exist && !r.create && !r.truncate && !r.append);

        let w = OpenOptions::from_text("w").unwrap();
        assert_eq!(w.access, Access::Write);
        assert!(w.create && w.truncate && !w.must_exist);

        let wx = OpenOptions::from_text("wx").unwrap();
        assert!(wx.excl);

        let a_plus = OpenOptions::from_text("a+").unwrap();
        assert_eq!(a_plus.access, Access::ReadWrite);
        assert!(a_plus.append && a_plus.create && !a_plus.truncate);
    }

    #[test]
    fn sync_modifier_composes() {
        let rs = OpenOptions::from_text("rs").unwrap();
        assert!(rs.sync);
        assert_eq!(rs.access, Access::Read);

        let rs_plus = OpenOptions::from_text("rs+").unwrap();
        assert!(rs_plus.sync);
        assert_eq!(rs_plus.access, Access::ReadWrite);

        let sr_plus = OpenOptions::from_text("sr+").unwrap();
        assert_eq!(sr_plus, rs_plus);
    }

    #[test]
    fn unknown_text_flags_are_invalid() {
        for bad in ["", "x", "rw", "wa", "r++", "ss", "rss"] {
            assert!(OpenOptions::from_text(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn numeric_flags_compose() {
        let opts = OpenOptions::from_numeric(O_WRONLY | O_CREAT | O_TRUNC).unwrap();
        assert_eq!(opts.access, Access::Write);
        assert!(opts.create && opts.truncate && !opts.must_exist);

        let append = OpenOptions::from_numeric(O_RDWR | O_CREAT | O_APPEND | O_SYNC).unwrap();
        assert!(append.append && append.sync);

        assert_eq!(
            OpenOptions::from_numeric(O_RDONLY).unwrap(),
            OpenOptions::from_text("r").unwrap()
        );
    }

    #[test]
    fn unknown_numeric_bits_are_invalid() {
        assert!(OpenOptions::from_numeric(O_WRONLY | O_RDWR).is_err());
        assert!(OpenOptions::from_numeric(1 << 20).is_err());
    }
}
