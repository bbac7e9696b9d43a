// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::include::{CheckerOptions, IncludeChecker};

fn checker(include: &[&str], exclude: &[&str]) -> IncludeChecker {
    IncludeChecker::new(
        include.iter().map(|s| s.to_string()).collect(),
        exclude.iter().map(|s| s.to_string()).collect(),
        CheckerOptions::default(),
    )
    .unwrap()
}

#[test]
fn empty_include_list_excludes_everything() {
    let c = checker(&[], &[]);
    assert!(!c.should_include("anything.rs"));
    assert!(!c.should_traverse("src"));
}

#[test]
fn empty_path_is_excluded() {
    let c = checker(&["**"], &[]);
    assert!(!c.should_include(""));
    assert!(!c.should_include("/"));
}

#[test]
fn include_then_exclude() {
    let c = checker(&["**/*.ts"], &["**/*.test.ts"]);
    assert!(c.should_include("src/app.ts"));
    assert!(!c.should_include("src/app.test.ts"));
    assert!(!c.should_include("src/app.js"));
}

#[test]
fn later_negation_flips_the_running_state() {
    // The log file is excluded, then the important one is re-included by negation.
    let c = checker(&["**"], &["**/*.log", "!**/important.log"]);
    assert!(!c.should_include("var/app.log"));
    assert!(c.should_include("var/important.log"));
    assert!(c.should_include("var/readme.txt"));
}

#[test]
fn negation_in_include_list() {
    let c = checker(&["src/**", "!src/generated/**"], &[]);
    assert!(c.should_include("src/main.rs"));
    assert!(!c.should_include("src/generated/schema.rs"));
}

#[test]
fn double_negation_cancels() {
    let c = checker(&["!!src/**"], &[]);
    assert!(c.should_include("src/main.rs"));
}

#[test]
fn escaped_bang_is_a_literal() {
    let c = checker(&["\\!readme"], &[]);
    assert!(c.should_include("!readme"));
    assert!(!c.should_include("readme"));
}

#[test]
fn order_matters_within_a_list() {
    // A negation that precedes the match it would cancel has no effect.
    let c = checker(&["**"], &["!**/keep.log", "**/*.log"]);
    assert!(!c.should_include("keep.log"));

    let c = checker(&["**"], &["**/*.log", "!**/keep.log"]);
    assert!(c.should_include("keep.log"));
}

#[test]
fn traversal_follows_include_prefixes() {
    let c = checker(&["packages/core/src/**/*.ts"], &[]);
    assert!(c.should_traverse("packages"));
    assert!(c.should_traverse("packages/core"));
    assert!(c.should_traverse("packages/core/src"));
    assert!(c.should_traverse("packages/core/src/deep"));
    assert!(!c.should_traverse("packages/other"));
    assert!(!c.should_traverse("docs"));
}

#[test]
fn traversal_prunes_excluded_dir_names() {
    let c = checker(&["**/*.ts"], &["**/node_modules/**"]);
    assert!(c.should_traverse("src"));
    assert!(!c.should_traverse("node_modules"));
    assert!(!c.should_traverse("src/node_modules"));
}

#[test]
fn anchored_dir_exclude_prunes_only_at_the_root() {
    let c = checker(&["**/*.ts"], &["build/**"]);
    assert!(!c.should_traverse("build"));
    assert!(c.should_traverse("src/build"));
    assert!(c.should_include("src/build/x.ts"));
    assert!(!c.should_include("build/x.ts"));
}

#[test]
fn negated_exclude_disables_pruning() {
    let c = checker(&["**"], &["**/dist/**", "!**/dist/keep/**"]);
    // Descendants might be re-included, so the walker must still descend.
    assert!(c.should_traverse("dist"));
    assert!(c.should_include("dist/keep/artifact"));
    assert!(!c.should_include("dist/other/artifact"));
}

#[test]
fn include_implies_ancestors_traversable() {
    let cases: &[(&[&str], &[&str], &str)] = &[
        (&["**/*.ts"], &[], "a/b/c/d.ts"),
        (&["src/**"], &[], "src/x/y"),
        (&["{lib,bin}/*.rs"], &[], "lib/main.rs"),
        (&["docs/api/*.md"], &[], "docs/api/index.md"),
    ];
    for (include, exclude, path) in cases {
        let c = checker(include, exclude);
        assert!(c.should_include(path), "{path} should be included");
        let segments: Vec<&str> = path.split('/').collect();
        for depth in 1..segments.len() {
            let dir = segments[..depth].join("/");
            assert!(
                c.should_traverse(&dir),
                "ancestor {dir} of included {path} must be traversable"
            );
        }
    }
}

#[test]
fn decisions_are_memoized() {
    let c = checker(&["**/*.ts"], &[]);
    // Same decision either way; this exercises the cached path.
    assert!(c.should_include("src/app.ts"));
    assert!(c.should_include("src/app.ts"));
    assert!(c.should_traverse("src"));
    assert!(c.should_traverse("src"));
}

#[test]
fn tiny_cache_still_answers_correctly() {
    let c = IncludeChecker::new(
        vec!["**/*.rs".to_string()],
        vec![],
        CheckerOptions {
            cache_size: 2,
            ..CheckerOptions::default()
        },
    )
    .unwrap();
    for i in 0..20 {
        assert!(c.should_include(&format!("src/file{i}.rs")));
        assert!(!c.should_include(&format!("src/file{i}.txt")));
    }
}

#[test]
fn leading_slashes_are_normalized() {
    let c = checker(&["src/**/*.rs"], &[]);
    assert!(c.should_include("/src/lib.rs"));
    assert!(c.should_traverse("/src"));
}

#[test]
fn pattern_accessors_report_parsed_bodies() {
    let c = checker(&["src/**", "!src/gen/**"], &["**/*.bak"]);
    assert_eq!(c.include_patterns(), vec!["src/**", "src/gen/**"]);
    assert_eq!(c.exclude_patterns(), vec!["**/*.bak"]);
}

#[test]
fn unicode_paths_match() {
    let c = checker(&["докум/**/*.md", "数据/*.csv"], &[]);
    assert!(c.should_include("докум/глава/intro.md"));
    assert!(c.should_include("数据/report.csv"));
    assert!(c.should_traverse("докум"));
    assert!(!c.should_include("docs/intro.md"));
}

#[test]
fn excludes_alone_never_include() {
    let c = checker(&[], &["!**/*.rs"]);
    // A negated exclude cannot conjure inclusions out of an empty include list.
    assert!(!c.should_include("src/lib.rs"));
}
