// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::cone::ConeSet;

#[test]
fn toplevel_files_are_always_included() {
    let cones = ConeSet::new(["packages/core/src/"]);
    assert!(cones.should_include("package.json"));
    assert!(cones.should_include("README.md"));

    let empty = ConeSet::new(Vec::<String>::new());
    assert!(empty.should_include("package.json"));
}

#[test]
fn cone_contents_are_included_recursively() {
    let cones = ConeSet::new(["packages/core/src/"]);
    assert!(cones.should_include("packages/core/src/index.ts"));
    assert!(cones.should_include("packages/core/src/deep/nested/util.ts"));
}

#[test]
fn ancestors_contribute_only_direct_files() {
    let cones = ConeSet::new(["packages/core/src/"]);
    assert!(cones.should_include("packages/core/index.ts"));
    assert!(cones.should_include("packages/index.ts"));
    assert!(!cones.should_include("packages/other/index.ts"));
    assert!(!cones.should_include("packages/core/test/x.ts"));
}

#[test]
fn empty_cone_list_admits_only_toplevel() {
    let cones = ConeSet::new(Vec::<String>::new());
    assert!(cones.is_empty());
    assert!(cones.should_include("file.txt"));
    assert!(!cones.should_include("dir/file.txt"));
}

#[test]
fn traversal_descends_cones_and_ancestors_only() {
    let cones = ConeSet::new(["packages/core/src"]);
    assert!(cones.should_traverse(""));
    assert!(cones.should_traverse("packages"));
    assert!(cones.should_traverse("packages/core"));
    assert!(cones.should_traverse("packages/core/src"));
    assert!(cones.should_traverse("packages/core/src/deep"));
    assert!(!cones.should_traverse("packages/other"));
    assert!(!cones.should_traverse("node_modules"));
}

#[test]
fn multiple_cones_union() {
    let cones = ConeSet::new(["a/b", "x/y/z"]);
    assert!(cones.should_include("a/b/file"));
    assert!(cones.should_include("x/y/z/file"));
    assert!(cones.should_include("x/y/file"));
    assert!(!cones.should_include("x/other/file"));
}

#[test]
fn cone_that_is_also_an_ancestor_keeps_cone_semantics() {
    // `a` is both a cone and an ancestor of `a/b/c`: everything under `a` is included.
    let cones = ConeSet::new(["a", "a/b/c"]);
    assert!(cones.should_include("a/anything/goes.txt"));
}

#[test]
fn similar_prefixes_do_not_leak() {
    let cones = ConeSet::new(["lib"]);
    assert!(cones.should_include("lib/x.rs"));
    assert!(!cones.should_include("library/x.rs"));
    assert!(!cones.should_traverse("library"));
}
