// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::num::NonZeroUsize;

use log::warn;
use lru::LruCache;
use parking_lot::Mutex;

use crate::pattern::{MatchOptions, PathGlob};

const DEFAULT_CACHE_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug)]
pub struct CheckerOptions {
    /// Capacity of each memoization cache (include decisions and traversal decisions).
    pub cache_size: usize,
    pub match_options: MatchOptions,
}

impl Default for CheckerOptions {
    fn default() -> CheckerOptions {
        CheckerOptions {
            cache_size: DEFAULT_CACHE_SIZE,
            match_options: MatchOptions::default(),
        }
    }
}

struct ListedPattern {
    negated: bool,
    glob: PathGlob,
}

///
/// An ordered include/exclude matcher with gitignore-style negation.
///
/// Both lists are evaluated front to back: a matching non-negated pattern sets the running
/// state to matched, a matching negated pattern clears it, and the final state decides. A path
/// is included iff the include list finally matches it and the exclude list does not.
///
/// `should_traverse` answers whether any path beneath a directory could still be included. It
/// is conservative (it may say yes where no match exists) but never prunes a directory that
/// holds matches. The fast path is a prefix index precomputed from the non-negated patterns;
/// both decisions are memoized in bounded LRU caches keyed by the canonical path string.
///
pub struct IncludeChecker {
    include: Vec<ListedPattern>,
    exclude: Vec<ListedPattern>,
    /// Directory basenames excluded at any depth by `**/NAME/**` patterns.
    excluded_dirs: HashSet<String>,
    /// Root-level directory names excluded by anchored `NAME/**` patterns.
    excluded_root_dirs: HashSet<String>,
    /// When the exclude list holds any negation, descendants of an excluded directory might be
    /// re-included, so basename pruning is disabled.
    exclude_has_negation: bool,
    /// Static prefixes of include patterns, plus all their ancestors.
    include_prefixes: HashSet<String>,
    include_cache: Mutex<LruCache<String, bool>>,
    traverse_cache: Mutex<LruCache<String, bool>>,
}

impl IncludeChecker {
    pub fn new(
        include: Vec<String>,
        exclude: Vec<String>,
        options: CheckerOptions,
    ) -> Result<IncludeChecker, String> {
        let include = parse_list(include, &options.match_options)?;
        let exclude = parse_list(exclude, &options.match_options)?;

        let mut include_prefixes = HashSet::new();
        for pattern in include.iter().filter(|p| !p.negated) {
            for alternative in pattern.glob.static_prefix_segments() {
                for depth in 1..=alternative.len() {
                    include_prefixes.insert(alternative[..depth].join("/"));
                }
            }
        }

        let mut excluded_dirs = HashSet::new();
        let mut excluded_root_dirs = HashSet::new();
        for pattern in exclude.iter().filter(|p| !p.negated) {
            match excluded_dir_name(pattern.glob.source()) {
                Some((name, true)) => {
                    excluded_dirs.insert(name);
                }
                Some((name, false)) => {
                    excluded_root_dirs.insert(name);
                }
                None => {}
            }
        }
        let exclude_has_negation = exclude.iter().any(|p| p.negated);

        let cache_size =
            NonZeroUsize::new(options.cache_size).unwrap_or(NonZeroUsize::new(1).unwrap());
        Ok(IncludeChecker {
            include,
            exclude,
            excluded_dirs,
            excluded_root_dirs,
            exclude_has_negation,
            include_prefixes,
            include_cache: Mutex::new(LruCache::new(cache_size)),
            traverse_cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Decides whether the (file) path is selected by the configured lists.
    pub fn should_include(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return false;
        }
        if let Some(&cached) = self.include_cache.lock().get(path) {
            return cached;
        }
        let decision = self.compute_include(path);
        self.include_cache
            .lock()
            .put(path.to_string(), decision);
        decision
    }

    fn compute_include(&self, path: &str) -> bool {
        if self.include.is_empty() {
            return false;
        }
        if !evaluate(&self.include, path) {
            return false;
        }
        if !self.exclude.is_empty() && evaluate(&self.exclude, path) {
            return false;
        }
        true
    }

    /// Decides whether a walk should descend into the directory: true iff some path below it
    /// could be included.
    pub fn should_traverse(&self, dir: &str) -> bool {
        let dir = dir.trim_start_matches('/');
        if dir.is_empty() {
            // The root is traversable whenever anything at all is includable.
            return !self.include.is_empty();
        }
        if let Some(&cached) = self.traverse_cache.lock().get(dir) {
            return cached;
        }
        let decision = self.compute_traverse(dir);
        self.traverse_cache.lock().put(dir.to_string(), decision);
        decision
    }

    pub fn include_patterns(&self) -> Vec<&str> {
        self.include.iter().map(|p| p.glob.source()).collect()
    }

    pub fn exclude_patterns(&self) -> Vec<&str> {
        self.exclude.iter().map(|p| p.glob.source()).collect()
    }

    fn compute_traverse(&self, dir: &str) -> bool {
        if self.include.is_empty() {
            return false;
        }
        let basename = dir.rsplit('/').next().unwrap_or(dir);
        let pruned = self.excluded_dirs.contains(basename)
            || (!dir.contains('/') && self.excluded_root_dirs.contains(dir));
        if pruned && !self.exclude_has_negation {
            return false;
        }
        if self.include_prefixes.contains(dir) {
            return true;
        }
        let segments: Vec<&str> = dir.split('/').collect();
        self.include
            .iter()
            .any(|p| !p.negated && p.glob.could_match_under(&segments))
    }
}

fn parse_list(
    patterns: Vec<String>,
    options: &MatchOptions,
) -> Result<Vec<ListedPattern>, String> {
    let mut out = Vec::with_capacity(patterns.len());
    for source in patterns {
        // An even number of leading `!` cancels out; `\!` is a literal bang and is handled by
        // the escape rules of the pattern compiler.
        let mut negated = false;
        let mut body = source.as_str();
        while let Some(stripped) = body.strip_prefix('!') {
            negated = !negated;
            body = stripped;
        }
        if body.is_empty() {
            warn!("skipping empty pattern {source:?}");
            continue;
        }
        let glob = PathGlob::parse(body, options)?;
        out.push(ListedPattern { negated, glob });
    }
    Ok(out)
}

fn evaluate(list: &[ListedPattern], path: &str) -> bool {
    let mut matched = false;
    for pattern in list {
        if pattern.glob.matches(path) {
            matched = !pattern.negated;
        }
    }
    matched
}

///
/// Recognizes exclude patterns of the shapes `**/NAME/**` and `NAME/**` whose NAME holds no
/// wildcards: these exclude a whole directory and power the prune fast path. The returned bool
/// is true for the `**/NAME/**` form, which applies at any depth; the anchored `NAME/**` form
/// only prunes the root-level directory of that name.
///
fn excluded_dir_name(source: &str) -> Option<(String, bool)> {
    let (rest, any_depth) = match source.strip_prefix("**/") {
        Some(rest) => (rest, true),
        None => (source, false),
    };
    let name = rest.strip_suffix("/**")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    let mut literal = String::new();
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' | '?' | '[' | '{' => return None,
            '\\' => literal.push(chars.next()?),
            c => literal.push(c),
        }
    }
    Some((literal, any_depth))
}
