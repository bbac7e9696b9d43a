// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;

///
/// The restricted cone pattern mode used by sparse views, mirroring git sparse-checkout:
/// every cone is a bare directory prefix (no wildcards). Files at the top level are always
/// included, everything beneath a cone is included recursively, ancestors of cones contribute
/// only their direct files, and all other siblings are excluded.
///
/// Decisions are O(1) set lookups against the precomputed cone and ancestor sets, with one
/// O(|cones|) prefix scan as the fallback for paths deep inside a cone.
///
pub struct ConeSet {
    cones: HashSet<String>,
    ancestors: HashSet<String>,
}

impl ConeSet {
    /// Builds from directory prefixes. Separator decoration (`packages/core/src/`) is
    /// tolerated; the empty list yields a set which admits only top-level files.
    pub fn new<I: IntoIterator<Item = S>, S: AsRef<str>>(cones: I) -> ConeSet {
        let mut cone_set = HashSet::new();
        let mut ancestors = HashSet::new();
        for cone in cones {
            let cone = cone.as_ref().trim_matches('/');
            if cone.is_empty() {
                continue;
            }
            let segments: Vec<&str> = cone.split('/').collect();
            for depth in 1..segments.len() {
                ancestors.insert(segments[..depth].join("/"));
            }
            cone_set.insert(cone.to_string());
        }
        // A directory that is both a cone and an ancestor of a deeper cone acts as a cone.
        for cone in &cone_set {
            ancestors.remove(cone);
        }
        ConeSet {
            cones: cone_set,
            ancestors,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cones.is_empty()
    }

    /// Whether a file at the given path is inside the cone selection.
    pub fn should_include(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return false;
        }
        let Some((dir, _name)) = path.rsplit_once('/') else {
            // Top-level files are always included.
            return true;
        };
        if self.cones.contains(dir) || self.ancestors.contains(dir) {
            return true;
        }
        self.within_cone(dir)
    }

    /// Whether a walk should descend into the directory.
    pub fn should_traverse(&self, dir: &str) -> bool {
        let dir = dir.trim_start_matches('/');
        if dir.is_empty() {
            return true;
        }
        if self.cones.contains(dir) || self.ancestors.contains(dir) {
            return true;
        }
        self.within_cone(dir)
    }

    fn within_cone(&self, dir: &str) -> bool {
        self.cones
            .iter()
            .any(|cone| dir.len() > cone.len() && dir.starts_with(cone) && dir.as_bytes()[cone.len()] == b'/')
    }
}
