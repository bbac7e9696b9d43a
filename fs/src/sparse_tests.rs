// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use globs::{CheckerOptions, IncludeChecker};

use crate::error::ErrorKind;
use crate::inode::FileType;
use crate::memfs::MemFs;
use crate::sparse::{SparseView, WalkOptions};

async fn monorepo() -> MemFs {
    let fs = MemFs::new();
    for dir in [
        "/packages/core/src",
        "/packages/core/test",
        "/packages/other",
    ] {
        fs.mkdir(dir, true, None).await.unwrap();
    }
    for file in [
        "/package.json",
        "/packages/index.ts",
        "/packages/core/index.ts",
        "/packages/core/src/index.ts",
        "/packages/core/test/x.ts",
        "/packages/other/index.ts",
    ] {
        fs.write(file, b"{}", None).await.unwrap();
    }
    fs
}

#[tokio::test]
async fn cone_mode_matches_git_sparse_checkout() {
    let fs = monorepo().await;
    let view = SparseView::with_cones(fs, ["packages/core/src/"]);

    for included in [
        "/packages/core/src/index.ts",
        "/packages/core/index.ts",
        "/packages/index.ts",
        "/package.json",
    ] {
        assert!(view.read(included).await.is_ok(), "{included}");
    }
    for excluded in ["/packages/other/index.ts", "/packages/core/test/x.ts"] {
        assert_eq!(
            view.read(excluded).await.unwrap_err().kind,
            ErrorKind::NotFound,
            "{excluded}"
        );
        assert_eq!(
            view.stat(excluded).await.unwrap_err().kind,
            ErrorKind::NotFound,
            "{excluded}"
        );
    }
}

#[tokio::test]
async fn readdir_filters_to_the_selection() {
    let fs = monorepo().await;
    let view = SparseView::with_cones(fs, ["packages/core/src"]);

    let top: Vec<String> = view
        .readdir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(top, vec!["package.json", "packages"]);

    let core: Vec<String> = view
        .readdir("/packages/core")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    // Direct files of a cone ancestor are visible; sibling subdirectories are not.
    assert_eq!(core, vec!["index.ts", "src"]);
}

#[tokio::test]
async fn pattern_view_hides_excluded_paths() {
    let fs = MemFs::new();
    fs.mkdir("/src", false, None).await.unwrap();
    fs.mkdir("/target", false, None).await.unwrap();
    fs.write("/src/lib.rs", b"", None).await.unwrap();
    fs.write("/target/out.o", b"", None).await.unwrap();

    let checker = IncludeChecker::new(
        vec!["**/*.rs".to_string()],
        vec![],
        CheckerOptions::default(),
    )
    .unwrap();
    let view = SparseView::new(fs, Arc::new(checker));

    assert!(view.read("/src/lib.rs").await.is_ok());
    assert_eq!(
        view.read("/target/out.o").await.unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn gitignore_ingestion_builds_an_excluding_view() {
    let fs = MemFs::new();
    fs.mkdir("/dist", false, None).await.unwrap();
    fs.write("/app.js", b"", None).await.unwrap();
    fs.write("/app.log", b"", None).await.unwrap();
    fs.write("/keep.log", b"", None).await.unwrap();
    fs.write("/dist/bundle.js", b"", None).await.unwrap();

    let gitignore = "# build artifacts\n*.log\n!keep.log\ndist/**\n";
    let view = SparseView::from_gitignore(fs, gitignore, vec![]).unwrap();

    assert!(view.read("/app.js").await.is_ok());
    assert!(view.read("/keep.log").await.is_ok());
    assert_eq!(
        view.read("/app.log").await.unwrap_err().kind,
        ErrorKind::NotFound
    );
    assert_eq!(
        view.read("/dist/bundle.js").await.unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn extra_excludes_append_after_the_gitignore() {
    let fs = MemFs::new();
    fs.write("/a.tmp", b"", None).await.unwrap();
    fs.write("/b.txt", b"", None).await.unwrap();
    let view =
        SparseView::from_gitignore(fs, "", vec!["*.tmp".to_string()]).unwrap();
    assert!(view.read("/b.txt").await.is_ok());
    assert_eq!(
        view.read("/a.tmp").await.unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn walk_yields_filtered_entries_with_depth_and_hidden_policy() {
    let fs = MemFs::new();
    fs.mkdir("/src/deep", true, None).await.unwrap();
    fs.write("/src/lib.rs", b"", None).await.unwrap();
    fs.write("/src/deep/inner.rs", b"", None).await.unwrap();
    fs.write("/.hidden.rs", b"", None).await.unwrap();

    let checker = IncludeChecker::new(
        vec!["**/*.rs".to_string()],
        vec![],
        CheckerOptions::default(),
    )
    .unwrap();
    let view = SparseView::new(fs, Arc::new(checker));

    let all: Vec<String> = view
        .walk("/", &WalkOptions::default())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect();
    assert!(all.contains(&"/.hidden.rs".to_string()));
    assert!(all.contains(&"/src/deep/inner.rs".to_string()));

    let shallow = view
        .walk(
            "/",
            &WalkOptions {
                max_depth: Some(1),
                include_hidden: false,
            },
        )
        .await
        .unwrap();
    let paths: Vec<&str> = shallow.iter().map(|e| e.path.as_str()).collect();
    assert!(!paths.contains(&"/.hidden.rs"));
    assert!(paths.contains(&"/src"));
    assert!(!paths.iter().any(|p| p.starts_with("/src/")));
    assert_eq!(
        shallow.iter().find(|e| e.path == "/src").unwrap().kind,
        FileType::Directory
    );
}
