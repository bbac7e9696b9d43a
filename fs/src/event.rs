// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::SystemTime;

use serde::Serialize;

/// What happened to a path. Renames carry the destination; the event's own path is the source.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed { to: String },
}

///
/// The shape of a change notification. Delivery beyond the in-process broadcast channel is a
/// transport concern and lives outside this crate.
///
#[derive(Clone, Debug, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub timestamp: SystemTime,
}
