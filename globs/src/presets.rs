// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Named exclude-pattern bundles for common ecosystems. Pure data; consumers append these to
//! their own exclude lists.

pub static PRESETS: &[(&str, &[&str])] = &[
    (
        "node",
        &[
            "**/node_modules/**",
            "**/.next/**",
            "**/dist/**",
            "**/*.tsbuildinfo",
        ],
    ),
    (
        "rust",
        &["**/target/**", "**/*.rlib", "**/*.rmeta"],
    ),
    (
        "python",
        &[
            "**/__pycache__/**",
            "**/*.pyc",
            "**/.venv/**",
            "**/*.egg-info/**",
        ],
    ),
    (
        "vcs",
        &["**/.git/**", "**/.hg/**", "**/.svn/**"],
    ),
];

pub fn preset(name: &str) -> Option<&'static [&'static str]> {
    PRESETS
        .iter()
        .find(|(preset_name, _)| *preset_name == name)
        .map(|(_, patterns)| *patterns)
}
