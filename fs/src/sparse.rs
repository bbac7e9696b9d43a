// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use bytes::Bytes;
use globs::{parse_gitignore, CheckerOptions, ConeSet, IncludeChecker};

use crate::error::FsError;
use crate::inode::{DirEntry, FileType, Metadata};
use crate::memfs::MemFs;
use crate::path::CanonicalPath;

/// Which selection machinery backs the view: full pattern lists or cone mode.
enum Selector {
    Patterns(Arc<IncludeChecker>),
    Cones(ConeSet),
}

impl Selector {
    fn includes(&self, relative: &str) -> bool {
        match self {
            Selector::Patterns(checker) => checker.should_include(relative),
            Selector::Cones(cones) => cones.should_include(relative),
        }
    }

    fn traverses(&self, relative: &str) -> bool {
        match self {
            Selector::Patterns(checker) => checker.should_traverse(relative),
            Selector::Cones(cones) => cones.should_traverse(relative),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WalkOptions {
    pub max_depth: Option<usize>,
    /// When false, dot-prefixed names are skipped entirely.
    pub include_hidden: bool,
}

impl Default for WalkOptions {
    fn default() -> WalkOptions {
        WalkOptions {
            max_depth: None,
            include_hidden: true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalkEntry {
    pub path: String,
    pub kind: FileType,
}

///
/// A filtered, read-only façade over a backend: paths outside the selection simply do not
/// exist (reads and stats fail with ENOENT, listings omit them). Directories are shown only
/// where the selection could still include something beneath them.
///
pub struct SparseView {
    fs: MemFs,
    selector: Selector,
}

impl SparseView {
    pub fn new(fs: MemFs, checker: Arc<IncludeChecker>) -> SparseView {
        SparseView {
            fs,
            selector: Selector::Patterns(checker),
        }
    }

    /// A cone-mode view: plain directory prefixes, git sparse-checkout semantics.
    pub fn with_cones<I: IntoIterator<Item = S>, S: AsRef<str>>(
        fs: MemFs,
        cones: I,
    ) -> SparseView {
        SparseView {
            fs,
            selector: Selector::Cones(ConeSet::new(cones)),
        }
    }

    ///
    /// Builds a view from `.gitignore` text: everything is included except what the ignore
    /// rules (and any extra exclude patterns) reject. User excludes are appended after the
    /// file's own, so they win ties in the ordered evaluation.
    ///
    pub fn from_gitignore(
        fs: MemFs,
        gitignore_text: &str,
        extra_excludes: Vec<String>,
    ) -> Result<SparseView, String> {
        let mut excludes = parse_gitignore(gitignore_text);
        excludes.extend(extra_excludes);
        let checker = IncludeChecker::new(
            vec!["**".to_string()],
            excludes,
            CheckerOptions::default(),
        )?;
        Ok(SparseView::new(fs, Arc::new(checker)))
    }

    pub async fn read(&self, path: &str) -> Result<Bytes, FsError> {
        let canonical = CanonicalPath::new(path)?;
        if !self.selector.includes(canonical.relative()) {
            return Err(FsError::not_found(canonical.as_str()));
        }
        self.fs.read(canonical.as_str()).await
    }

    pub async fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        let canonical = CanonicalPath::new(path)?;
        let meta = self.fs.stat(canonical.as_str()).await?;
        let visible = if meta.is_dir() {
            canonical.is_root() || self.selector.traverses(canonical.relative())
        } else {
            self.selector.includes(canonical.relative())
        };
        if !visible {
            return Err(FsError::not_found(canonical.as_str()));
        }
        Ok(meta)
    }

    /// Entries the selection permits: files by inclusion, directories by traversability.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let canonical = CanonicalPath::new(path)?;
        if !canonical.is_root() && !self.selector.traverses(canonical.relative()) {
            return Err(FsError::not_found(canonical.as_str()));
        }
        let entries = self.fs.readdir_typed(canonical.as_str()).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                let child = canonical.child(&entry.name);
                match entry.kind {
                    FileType::Directory => self.selector.traverses(child.relative()),
                    _ => self.selector.includes(child.relative()),
                }
            })
            .collect())
    }

    /// Walks the visible tree depth-first, shallow entries before deep ones within a branch.
    pub async fn walk(
        &self,
        path: &str,
        options: &WalkOptions,
    ) -> Result<Vec<WalkEntry>, FsError> {
        let root = CanonicalPath::new(path)?;
        let mut results = Vec::new();
        self.walk_dir(&root, 0, options, &mut results).await?;
        Ok(results)
    }

    async fn walk_dir(
        &self,
        dir: &CanonicalPath,
        depth: usize,
        options: &WalkOptions,
        results: &mut Vec<WalkEntry>,
    ) -> Result<(), FsError> {
        if let Some(max) = options.max_depth {
            if depth >= max {
                return Ok(());
            }
        }
        for entry in self.readdir(dir.as_str()).await? {
            if !options.include_hidden && entry.name.starts_with('.') {
                continue;
            }
            let child = dir.child(&entry.name);
            results.push(WalkEntry {
                path: child.to_string(),
                kind: entry.kind,
            });
            if entry.kind == FileType::Directory {
                Box::pin(self.walk_dir(&child, depth + 1, options, results)).await?;
            }
        }
        Ok(())
    }
}
