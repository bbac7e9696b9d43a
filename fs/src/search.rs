// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use globs::{CheckerOptions, IncludeChecker};

use crate::error::FsError;
use crate::inode::FileType;
use crate::memfs::MemFs;
use crate::path::CanonicalPath;

///
/// Glob search over the namespace: every file path matching the include patterns (and not the
/// excludes), found without visiting directories the checker can prove fruitless.
///
/// This is the engine behind search tooling: the checker's traversal decision prunes whole
/// subtrees (a `!["**/*.rs"], ["**/target/**"]` query never descends into `target`), and
/// matching paths come back sorted ascending.
///
pub async fn search(fs: &MemFs, checker: &IncludeChecker) -> Result<Vec<String>, FsError> {
    let mut results = Vec::new();
    let root = CanonicalPath::root();
    search_dir(fs, checker, &root, &mut results).await?;
    results.sort();
    Ok(results)
}

/// One-shot convenience: compile the patterns, search, done.
pub async fn search_glob(
    fs: &MemFs,
    include: &[&str],
    exclude: &[&str],
) -> Result<Vec<String>, FsError> {
    let checker = IncludeChecker::new(
        include.iter().map(|s| s.to_string()).collect(),
        exclude.iter().map(|s| s.to_string()).collect(),
        CheckerOptions::default(),
    )
    .map_err(FsError::invalid_argument)?;
    search(fs, &checker).await
}

/// A reusable compiled query, for callers issuing the same patterns repeatedly. The embedded
/// checker keeps its decision caches warm across searches.
pub struct SearchQuery {
    checker: Arc<IncludeChecker>,
}

impl SearchQuery {
    pub fn compile(include: &[&str], exclude: &[&str]) -> Result<SearchQuery, FsError> {
        let checker = IncludeChecker::new(
            include.iter().map(|s| s.to_string()).collect(),
            exclude.iter().map(|s| s.to_string()).collect(),
            CheckerOptions::default(),
        )
        .map_err(FsError::invalid_argument)?;
        Ok(SearchQuery {
            checker: Arc::new(checker),
        })
    }

    pub async fn run(&self, fs: &MemFs) -> Result<Vec<String>, FsError> {
        search(fs, &self.checker).await
    }
}

async fn search_dir(
    fs: &MemFs,
    checker: &IncludeChecker,
    dir: &CanonicalPath,
    results: &mut Vec<String>,
) -> Result<(), FsError> {
    for entry in fs.readdir_typed(dir.as_str()).await? {
        let child = dir.child(&entry.name);
        match entry.kind {
            FileType::Directory => {
                if checker.should_traverse(child.relative()) {
                    Box::pin(search_dir(fs, checker, &child, results)).await?;
                }
            }
            _ => {
                if checker.should_include(child.relative()) {
                    results.push(child.to_string());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{search_glob, SearchQuery};
    use crate::memfs::MemFs;

    async fn project_tree() -> MemFs {
        let fs = MemFs::new();
        for dir in ["/src/core", "/src/util", "/target/debug", "/docs"] {
            fs.mkdir(dir, true, None).await.unwrap();
        }
        for file in [
            "/src/lib.rs",
            "/src/core/engine.rs",
            "/src/core/engine_tests.rs",
            "/src/util/mod.rs",
            "/target/debug/build.rs",
            "/docs/guide.md",
            "/README.md",
        ] {
            fs.write(file, b"content", None).await.unwrap();
        }
        fs
    }

    #[tokio::test]
    async fn search_finds_matching_files() {
        let fs = project_tree().await;
        let results = search_glob(&fs, &["**/*.rs"], &["**/target/**"]).await.unwrap();
        assert_eq!(
            results,
            vec![
                "/src/core/engine.rs",
                "/src/core/engine_tests.rs",
                "/src/lib.rs",
                "/src/util/mod.rs",
            ]
        );
    }

    #[tokio::test]
    async fn search_respects_negation() {
        let fs = project_tree().await;
        let results = search_glob(&fs, &["**/*.rs", "!**/*_tests.rs"], &["**/target/**"])
            .await
            .unwrap();
        assert!(!results.contains(&"/src/core/engine_tests.rs".to_string()));
        assert!(results.contains(&"/src/core/engine.rs".to_string()));
    }

    #[tokio::test]
    async fn search_with_anchored_pattern() {
        let fs = project_tree().await;
        let results = search_glob(&fs, &["docs/*.md"], &[]).await.unwrap();
        assert_eq!(results, vec!["/docs/guide.md"]);
    }

    #[tokio::test]
    async fn empty_include_finds_nothing() {
        let fs = project_tree().await;
        assert!(search_glob(&fs, &[], &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_patterns_surface_einval() {
        let fs = project_tree().await;
        assert!(search_glob(&fs, &["src/[broken"], &[]).await.is_err());
    }

    #[tokio::test]
    async fn compiled_queries_are_reusable() {
        let fs = project_tree().await;
        let query = SearchQuery::compile(&["**/*.md"], &[]).unwrap();
        let first = query.run(&fs).await.unwrap();
        assert_eq!(first, vec!["/README.md", "/docs/guide.md"]);

        fs.write("/docs/extra.md", b"more", None).await.unwrap();
        let second = query.run(&fs).await.unwrap();
        assert_eq!(second.len(), 3);
    }
}
