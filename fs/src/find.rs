// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use glob::Pattern;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::FsError;
use crate::inode::{FileType, Ino, Metadata};
use crate::memfs::MemFs;
use crate::path::CanonicalPath;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// How a find run failed. Cancellation and timeout never hand back partial results.
#[derive(Debug)]
pub enum FindError {
    Cancelled { root: String },
    TimedOut { root: String, elapsed: Duration },
    Fs(FsError),
}

impl FindError {
    pub fn code(&self) -> &'static str {
        match self {
            FindError::Cancelled { .. } => "CANCELLED",
            FindError::TimedOut { .. } => "TIMEOUT",
            FindError::Fs(e) => e.kind.code(),
        }
    }
}

impl fmt::Display for FindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindError::Cancelled { root } => write!(f, "search under {root} was cancelled"),
            FindError::TimedOut { root, elapsed } => {
                write!(f, "search under {root} timed out after {elapsed:?}")
            }
            FindError::Fs(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FindError {}

impl From<FsError> for FindError {
    fn from(e: FsError) -> FindError {
        FindError::Fs(e)
    }
}

/// Basename matching: a glob or an anchored regular expression.
#[derive(Debug, Clone)]
pub enum NameMatch {
    Glob(Pattern),
    Regex(Regex),
}

impl NameMatch {
    pub fn glob(pattern: &str) -> Result<NameMatch, String> {
        Pattern::new(pattern)
            .map(NameMatch::Glob)
            .map_err(|e| format!("Could not parse {pattern:?} as a glob: {e}"))
    }

    pub fn regex(pattern: &str) -> Result<NameMatch, String> {
        let anchored = format!("^(?:{pattern})$");
        Regex::new(&anchored)
            .map(NameMatch::Regex)
            .map_err(|e| format!("Could not parse {pattern:?} as a regex: {e}"))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Glob(pattern) => pattern.matches(name),
            NameMatch::Regex(regex) => regex.is_match(name),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Comparison {
    Greater,
    Less,
    Near,
}

/// `[+-]?N[BKMG]`: `+` strictly larger, `-` strictly smaller, unsigned exact.
#[derive(Clone, Copy, Debug)]
pub struct SizeFilter {
    comparison: Comparison,
    bytes: u64,
}

impl SizeFilter {
    pub fn parse(spec: &str) -> Result<SizeFilter, String> {
        let (comparison, rest) = split_sign(spec);
        let (number, suffix) = split_suffix(rest);
        let value: u64 = number
            .parse()
            .map_err(|_| format!("Invalid size filter: {spec:?}"))?;
        let unit: u64 = match suffix {
            "" | "B" => 1,
            "K" => 1024,
            "M" => 1024 * 1024,
            "G" => 1024 * 1024 * 1024,
            _ => return Err(format!("Invalid size suffix in {spec:?}")),
        };
        Ok(SizeFilter {
            comparison,
            bytes: value * unit,
        })
    }

    fn matches(&self, size: u64) -> bool {
        match self.comparison {
            Comparison::Greater => size > self.bytes,
            Comparison::Less => size < self.bytes,
            Comparison::Near => size == self.bytes,
        }
    }
}

///
/// `[+-]?N[mhdwM]`: `+` older than the threshold, `-` newer, unsigned within one day of it.
/// Suffixes are minutes, hours, days, weeks and ~30-day months; a missing suffix means days.
///
#[derive(Clone, Copy, Debug)]
pub struct TimeFilter {
    comparison: Comparison,
    age: Duration,
}

impl TimeFilter {
    pub fn parse(spec: &str) -> Result<TimeFilter, String> {
        let (comparison, rest) = split_sign(spec);
        let (number, suffix) = split_suffix(rest);
        let value: u64 = number
            .parse()
            .map_err(|_| format!("Invalid time filter: {spec:?}"))?;
        let unit_seconds: u64 = match suffix {
            "m" => 60,
            "h" => 60 * 60,
            "" | "d" => SECONDS_PER_DAY,
            "w" => 7 * SECONDS_PER_DAY,
            "M" => 30 * SECONDS_PER_DAY,
            _ => return Err(format!("Invalid time suffix in {spec:?}")),
        };
        Ok(TimeFilter {
            comparison,
            age: Duration::from_secs(value * unit_seconds),
        })
    }

    fn matches(&self, timestamp: SystemTime, now: SystemTime) -> bool {
        let age = now
            .duration_since(timestamp)
            .unwrap_or(Duration::ZERO);
        match self.comparison {
            Comparison::Greater => age > self.age,
            Comparison::Less => age < self.age,
            Comparison::Near => {
                let day = Duration::from_secs(SECONDS_PER_DAY);
                age >= self.age.saturating_sub(day) && age <= self.age + day
            }
        }
    }
}

fn split_sign(spec: &str) -> (Comparison, &str) {
    match spec.as_bytes().first() {
        Some(b'+') => (Comparison::Greater, &spec[1..]),
        Some(b'-') => (Comparison::Less, &spec[1..]),
        _ => (Comparison::Near, spec),
    }
}

fn split_suffix(spec: &str) -> (&str, &str) {
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    (&spec[..split], &spec[split..])
}

///
/// A find-like query: walk the namespace from `root`, applying predicates in a fixed
/// cheapest-first order. Symlinks are never followed. Prune patterns match directory
/// basenames and cut whole subtrees.
///
pub struct Criteria {
    pub root: String,
    pub min_depth: Option<usize>,
    pub max_depth: Option<usize>,
    pub entry_type: Option<FileType>,
    pub name: Option<NameMatch>,
    pub size: Option<SizeFilter>,
    pub mtime: Option<TimeFilter>,
    pub ctime: Option<TimeFilter>,
    pub atime: Option<TimeFilter>,
    pub empty: Option<bool>,
    pub prune: Vec<Pattern>,
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Criteria {
    pub fn new(root: &str) -> Criteria {
        Criteria {
            root: root.to_string(),
            min_depth: None,
            max_depth: None,
            entry_type: None,
            name: None,
            size: None,
            mtime: None,
            ctime: None,
            atime: None,
            empty: None,
            prune: Vec::new(),
            deadline: None,
            cancel: None,
        }
    }

    pub fn prune_names(mut self, names: &[&str]) -> Result<Criteria, String> {
        for name in names {
            self.prune.push(
                Pattern::new(name)
                    .map_err(|e| format!("Could not parse prune pattern {name:?}: {e}"))?,
            );
        }
        Ok(self)
    }
}

struct Walk<'a> {
    fs: &'a MemFs,
    criteria: &'a Criteria,
    started: Instant,
    now: SystemTime,
    visited: HashSet<Ino>,
    results: Vec<String>,
}

///
/// Runs the query, returning matching paths sorted ascending. Stat data is fetched once per
/// entry and shared across the predicate chain. A raised cancellation token or an exceeded
/// deadline fails the whole operation; no partial results escape.
///
pub async fn find(fs: &MemFs, criteria: &Criteria) -> Result<Vec<String>, FindError> {
    let root = CanonicalPath::new(&criteria.root).map_err(FindError::Fs)?;
    let root_meta = fs.lstat(root.as_str()).await?;
    let mut walk = Walk {
        fs,
        criteria,
        started: Instant::now(),
        now: SystemTime::now(),
        visited: HashSet::new(),
        results: Vec::new(),
    };
    walk.visit(&root, &root_meta, 0).await?;
    let mut results = walk.results;
    results.sort();
    Ok(results)
}

impl Walk<'_> {
    fn checkpoint(&self) -> Result<(), FindError> {
        if let Some(token) = &self.criteria.cancel {
            if token.is_cancelled() {
                return Err(FindError::Cancelled {
                    root: self.criteria.root.clone(),
                });
            }
        }
        if let Some(deadline) = self.criteria.deadline {
            let elapsed = self.started.elapsed();
            if elapsed > deadline {
                return Err(FindError::TimedOut {
                    root: self.criteria.root.clone(),
                    elapsed,
                });
            }
        }
        Ok(())
    }

    async fn visit(
        &mut self,
        path: &CanonicalPath,
        meta: &Metadata,
        depth: usize,
    ) -> Result<(), FindError> {
        self.checkpoint()?;

        // Cycle defense: the namespace is a tree and links are never followed, but a
        // misbehaving substrate could still alias directories.
        if meta.is_dir() && !self.visited.insert(meta.ino) {
            return Ok(());
        }

        if self.matches(path, meta, depth).await? {
            self.results.push(path.to_string());
        }

        let descend = meta.is_dir()
            && self
                .criteria
                .max_depth
                .map(|max| depth < max)
                .unwrap_or(true);
        if !descend {
            return Ok(());
        }

        let entries = self.fs.readdir_typed(path.as_str()).await?;
        for entry in entries {
            self.checkpoint()?;
            let child = path.child(&entry.name);
            if entry.kind == FileType::Directory
                && self.criteria.prune.iter().any(|p| p.matches(&entry.name))
            {
                continue;
            }
            let child_meta = self.fs.lstat(child.as_str()).await?;
            Box::pin(self.visit(&child, &child_meta, depth + 1)).await?;
        }
        Ok(())
    }

    /// The predicate chain, cheapest first: depth, type, name, size, mtime, ctime, atime,
    /// empty. The single stat fetched by the caller serves them all.
    async fn matches(
        &self,
        path: &CanonicalPath,
        meta: &Metadata,
        depth: usize,
    ) -> Result<bool, FindError> {
        let c = self.criteria;
        if let Some(min) = c.min_depth {
            if depth < min {
                return Ok(false);
            }
        }
        if let Some(max) = c.max_depth {
            if depth > max {
                return Ok(false);
            }
        }
        if let Some(kind) = c.entry_type {
            if meta.kind != kind {
                return Ok(false);
            }
        }
        if let Some(name) = &c.name {
            let basename = path.file_name().unwrap_or("");
            if !name.matches(basename) {
                return Ok(false);
            }
        }
        if let Some(size) = &c.size {
            if !size.matches(meta.size) {
                return Ok(false);
            }
        }
        if let Some(mtime) = &c.mtime {
            if !mtime.matches(meta.mtime, self.now) {
                return Ok(false);
            }
        }
        if let Some(ctime) = &c.ctime {
            if !ctime.matches(meta.ctime, self.now) {
                return Ok(false);
            }
        }
        if let Some(atime) = &c.atime {
            if !atime.matches(meta.atime, self.now) {
                return Ok(false);
            }
        }
        if let Some(want_empty) = c.empty {
            let is_empty = match meta.kind {
                FileType::Regular => meta.size == 0,
                FileType::Directory => self.fs.readdir(path.as_str()).await?.is_empty(),
                _ => false,
            };
            if is_empty != want_empty {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
