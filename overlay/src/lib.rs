// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Copy-on-write branch overlays for a base filesystem.
//!
//! A [`BranchSet`] owns named branches over one base [`MemFs`]. Each branch records its own
//! writes in a per-path dirty map (blob id + monotonic write epoch) while reads fall through
//! to the parent branch or the base. The base is never touched until a branch is committed;
//! a discarded branch releases its blob references and vanishes without trace.
//!
//! Blob handoff follows the store's reference discipline: the first write to a base-backed
//! path takes a reference on the base blob (the logical copy), which is released as soon as
//! the freshly written blob supersedes it. Every dirty file entry therefore always holds
//! exactly one live store reference.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use fs::{
    CanonicalPath, DirEntry, ErrorKind, FileType, FsError, MemFs, Metadata, WriteOutcome,
    MAX_LINK_HOPS,
};
use hashing::Digest;
use log::debug;
use parking_lot::Mutex;

/// Metadata changes recorded against a dirty path, applied to the parent on commit.
#[derive(Clone, Copy, Debug, Default)]
struct AttrPatch {
    mode: Option<u32>,
    owner: Option<(u32, u32)>,
    times: Option<(SystemTime, SystemTime)>,
}

#[derive(Clone, Debug)]
enum DirtyEntry {
    File {
        blob: Digest,
        attrs: AttrPatch,
        mtime: SystemTime,
        epoch: u64,
    },
    Dir {
        attrs: AttrPatch,
        /// A fresh directory hides whatever the parent or base holds beneath this path; a
        /// non-fresh entry only carries attribute changes for an existing directory.
        fresh: bool,
        epoch: u64,
    },
    Symlink {
        target: String,
        epoch: u64,
    },
    Removed {
        epoch: u64,
    },
}

impl DirtyEntry {
    fn kind(&self) -> Option<FileType> {
        match self {
            DirtyEntry::File { .. } => Some(FileType::Regular),
            DirtyEntry::Dir { .. } => Some(FileType::Directory),
            DirtyEntry::Symlink { .. } => Some(FileType::Symlink),
            DirtyEntry::Removed { .. } => None,
        }
    }

    /// True if the entry hides everything beneath its path.
    fn is_barrier(&self) -> bool {
        matches!(
            self,
            DirtyEntry::Removed { .. } | DirtyEntry::Dir { fresh: true, .. }
        )
    }
}

struct Branch {
    parent: Option<String>,
    dirty: BTreeMap<String, DirtyEntry>,
    created_at: SystemTime,
}

impl Branch {
    fn barrier_at_or_above(&self, path: &str) -> bool {
        let mut current = Some(path);
        while let Some(p) = current {
            if let Some(entry) = self.dirty.get(p) {
                if entry.is_barrier() {
                    return true;
                }
            }
            current = parent_path(p);
        }
        false
    }
}

struct Registry {
    branches: HashMap<String, Branch>,
    next_epoch: u64,
}

impl Registry {
    fn branch(&self, name: &str) -> Result<&Branch, FsError> {
        self.branches.get(name).ok_or_else(|| unknown_branch(name))
    }

    fn branch_mut(&mut self, name: &str) -> Result<&mut Branch, FsError> {
        self.branches
            .get_mut(name)
            .ok_or_else(|| unknown_branch(name))
    }

    fn tick(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    fn has_children(&self, name: &str) -> bool {
        self.branches
            .values()
            .any(|b| b.parent.as_deref() == Some(name))
    }

    /// The branch's own view of a path: its entry, a barrier verdict, or a fall-through to
    /// the next layer down.
    fn view(&self, name: &str, path: &str) -> Result<Layered, FsError> {
        let branch = self.branch(name)?;
        if let Some(entry) = branch.dirty.get(path) {
            return Ok(Layered::Entry(entry.clone()));
        }
        // An ancestor barrier (tombstone or fresh directory) hides base/parent content.
        let mut ancestor = parent_path(path);
        while let Some(a) = ancestor {
            if let Some(entry) = branch.dirty.get(a) {
                if entry.is_barrier() {
                    return Ok(Layered::Hidden);
                }
            }
            ancestor = parent_path(a);
        }
        match &branch.parent {
            Some(parent) => self.view(parent, path),
            None => Ok(Layered::Base),
        }
    }

    /// Dirty children of `dir` across the branch chain, nearest branch winning per name. A
    /// branch with a barrier at or above `dir` cuts off everything from further down the
    /// chain.
    fn dirty_children(&self, name: &str, dir: &str) -> Result<BTreeMap<String, DirtyEntry>, FsError> {
        let branch = self.branch(name)?;
        let mut merged = if branch.barrier_at_or_above(dir) {
            BTreeMap::new()
        } else {
            match &branch.parent {
                Some(parent) => self.dirty_children(parent, dir)?,
                None => BTreeMap::new(),
            }
        };
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let range = branch
            .dirty
            .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded));
        for (path, entry) in range {
            if !path.starts_with(&prefix) {
                break;
            }
            let rest = &path[prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            merged.insert(rest.to_string(), entry.clone());
        }
        Ok(merged)
    }
}

enum Layered {
    Entry(DirtyEntry),
    Hidden,
    Base,
}

fn unknown_branch(name: &str) -> FsError {
    FsError::without_path(ErrorKind::NotFound).with_message(format!("no such branch: {name}"))
}

fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Surface info about one branch.
#[derive(Clone, Debug)]
pub struct BranchInfo {
    pub name: String,
    pub parent: Option<String>,
    pub dirty_paths: usize,
    pub created_at: SystemTime,
}

/// How one dirty path differs from the layer below, as reported by [`BranchFs::changes`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChangeSummary {
    Written { path: String, size: u64, epoch: u64 },
    DirectoryAdded { path: String, epoch: u64 },
    SymlinkAdded { path: String, epoch: u64 },
    Removed { path: String, epoch: u64 },
}

impl ChangeSummary {
    pub fn path(&self) -> &str {
        match self {
            ChangeSummary::Written { path, .. }
            | ChangeSummary::DirectoryAdded { path, .. }
            | ChangeSummary::SymlinkAdded { path, .. }
            | ChangeSummary::Removed { path, .. } => path,
        }
    }
}

///
/// The registry of branches over one base filesystem.
///
#[derive(Clone)]
pub struct BranchSet {
    base: MemFs,
    registry: Arc<Mutex<Registry>>,
}

impl BranchSet {
    pub fn new(base: MemFs) -> BranchSet {
        BranchSet {
            base,
            registry: Arc::new(Mutex::new(Registry {
                branches: HashMap::new(),
                next_epoch: 1,
            })),
        }
    }

    pub fn base(&self) -> &MemFs {
        &self.base
    }

    /// Creates a branch over the base state.
    pub fn create(&self, name: &str) -> Result<BranchFs, FsError> {
        self.insert(name, None)
    }

    /// Creates a branch whose reads fall through to another branch before the base.
    pub fn fork(&self, parent: &str, name: &str) -> Result<BranchFs, FsError> {
        {
            let registry = self.registry.lock();
            registry.branch(parent)?;
        }
        self.insert(name, Some(parent.to_string()))
    }

    fn insert(&self, name: &str, parent: Option<String>) -> Result<BranchFs, FsError> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::invalid_argument(format!(
                "invalid branch name: {name:?}"
            )));
        }
        let mut registry = self.registry.lock();
        if registry.branches.contains_key(name) {
            return Err(FsError::without_path(ErrorKind::AlreadyExists)
                .with_message(format!("branch {name} already exists")));
        }
        registry.branches.insert(
            name.to_string(),
            Branch {
                parent,
                dirty: BTreeMap::new(),
                created_at: SystemTime::now(),
            },
        );
        debug!("created branch {name}");
        Ok(BranchFs {
            set: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn branch(&self, name: &str) -> Result<BranchFs, FsError> {
        self.registry.lock().branch(name)?;
        Ok(BranchFs {
            set: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn list(&self) -> Vec<BranchInfo> {
        let registry = self.registry.lock();
        let mut out: Vec<BranchInfo> = registry
            .branches
            .iter()
            .map(|(name, branch)| BranchInfo {
                name: name.clone(),
                parent: branch.parent.clone(),
                dirty_paths: branch.dirty.len(),
                created_at: branch.created_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    ///
    /// Folds the branch into its parent and destroys it. Against the base, each dirty path is
    /// applied atomically: directories are materialized, file paths are re-pointed at the
    /// branch's blob (transferring the branch's store reference and releasing the base's
    /// previous one), tombstones unlink. Committing a forked branch merges its dirty map into
    /// the parent branch the same way.
    ///
    pub async fn commit(&self, name: &str) -> Result<(), FsError> {
        let (branch, parent) = {
            let mut registry = self.registry.lock();
            if registry.has_children(name) {
                return Err(FsError::without_path(ErrorKind::Busy)
                    .with_message(format!("branch {name} has forked children")));
            }
            let branch = registry
                .branches
                .remove(name)
                .ok_or_else(|| unknown_branch(name))?;
            let parent = branch.parent.clone();
            (branch, parent)
        };

        match parent {
            None => self.commit_to_base(name, branch).await,
            Some(parent) => self.commit_to_parent(name, branch, &parent).await,
        }
    }

    async fn commit_to_base(&self, name: &str, branch: Branch) -> Result<(), FsError> {
        // BTreeMap order puts every directory before its contents, so materializing in key
        // order never hits a missing parent.
        for (path, entry) in branch.dirty {
            match entry {
                DirtyEntry::Dir { attrs, fresh, .. } => {
                    if fresh && self.base.exists(&path).await? {
                        self.base.rmdir(&path, true).await?;
                    }
                    match self.base.mkdir(&path, true, attrs.mode).await {
                        Ok(()) => {}
                        Err(e) if e.kind == ErrorKind::AlreadyExists => {}
                        Err(e) => return Err(e),
                    }
                    self.apply_attrs(&path, &attrs).await?;
                }
                DirtyEntry::File { blob, attrs, .. } => {
                    let canonical = CanonicalPath::new(&path)?;
                    self.base.bind_blob(&canonical, blob, attrs.mode).await?;
                    self.apply_attrs(&path, &attrs).await?;
                }
                DirtyEntry::Symlink { target, .. } => {
                    match self.base.unlink(&path).await {
                        Ok(()) | Err(FsError {
                            kind: ErrorKind::NotFound,
                            ..
                        }) => {}
                        Err(e) => return Err(e),
                    }
                    self.base.symlink(&target, &path).await?;
                }
                DirtyEntry::Removed { .. } => match self.base.unlink(&path).await {
                    Ok(()) => {}
                    Err(FsError {
                        kind: ErrorKind::NotFound,
                        ..
                    }) => {}
                    Err(FsError {
                        kind: ErrorKind::IsADirectory,
                        ..
                    }) => self.base.rmdir(&path, true).await?,
                    Err(e) => return Err(e),
                },
            }
        }
        debug!("committed branch {name} to base");
        Ok(())
    }

    async fn commit_to_parent(
        &self,
        name: &str,
        branch: Branch,
        parent: &str,
    ) -> Result<(), FsError> {
        let displaced = {
            let mut registry = self.registry.lock();
            let parent_branch = registry.branch_mut(parent)?;
            let mut displaced = Vec::new();
            for (path, entry) in branch.dirty {
                if entry.is_barrier() {
                    displaced.extend(purge_subtree(&mut parent_branch.dirty, &path));
                }
                if let Some(DirtyEntry::File { blob, .. }) =
                    parent_branch.dirty.insert(path, entry)
                {
                    displaced.push(blob);
                }
            }
            displaced
        };
        for blob in displaced {
            self.release(blob).await;
        }
        debug!("committed branch {name} into {parent}");
        Ok(())
    }

    /// Destroys a branch, releasing every blob reference its dirty map holds.
    pub async fn discard(&self, name: &str) -> Result<(), FsError> {
        let branch = {
            let mut registry = self.registry.lock();
            if registry.has_children(name) {
                return Err(FsError::without_path(ErrorKind::Busy)
                    .with_message(format!("branch {name} has forked children")));
            }
            registry
                .branches
                .remove(name)
                .ok_or_else(|| unknown_branch(name))?
        };
        for entry in branch.dirty.into_values() {
            if let DirtyEntry::File { blob, .. } = entry {
                self.release(blob).await;
            }
        }
        debug!("discarded branch {name}");
        Ok(())
    }

    async fn apply_attrs(&self, path: &str, attrs: &AttrPatch) -> Result<(), FsError> {
        if let Some((uid, gid)) = attrs.owner {
            self.base.chown(path, uid, gid).await?;
        }
        if let Some((atime, mtime)) = attrs.times {
            self.base.utimes(path, atime, mtime).await?;
        }
        Ok(())
    }

    async fn release(&self, blob: Digest) {
        if let Err(e) = self.base.store().release_ref(blob.hash).await {
            log::warn!("failed to release displaced blob {}: {e}", blob.hash);
        }
    }
}

/// Removes every dirty entry strictly below `path`, returning blobs whose references the
/// caller must release.
fn purge_subtree(dirty: &mut BTreeMap<String, DirtyEntry>, path: &str) -> Vec<Digest> {
    let prefix = format!("{path}/");
    let doomed: Vec<String> = dirty
        .range::<str, _>((Bound::Excluded(path), Bound::Unbounded))
        .take_while(|(p, _)| p.starts_with(&prefix))
        .map(|(p, _)| p.clone())
        .collect();
    let mut blobs = Vec::new();
    for p in doomed {
        if let Some(DirtyEntry::File { blob, .. }) = dirty.remove(&p) {
            blobs.push(blob);
        }
    }
    blobs
}

///
/// One branch's read/write view. Reads prefer the branch's dirty state and fall through to
/// the parent chain and base; writes never escape the branch until commit.
///
#[derive(Clone)]
pub struct BranchFs {
    set: BranchSet,
    name: String,
}

impl std::fmt::Debug for BranchFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchFs").field("name", &self.name).finish()
    }
}

impl BranchFs {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&self, path: &str) -> Result<Bytes, FsError> {
        let mut path = CanonicalPath::new(path)?;
        for _ in 0..MAX_LINK_HOPS {
            let layered = self.set.registry.lock().view(&self.name, path.as_str())?;
            match layered {
                Layered::Entry(DirtyEntry::File { blob, .. }) => {
                    return self.load(blob).await;
                }
                Layered::Entry(DirtyEntry::Dir { .. }) => {
                    return Err(FsError::is_a_directory(path.as_str()));
                }
                Layered::Entry(DirtyEntry::Symlink { target, .. }) => {
                    path = resolve_link_target(&path, &target)?;
                }
                Layered::Entry(DirtyEntry::Removed { .. }) | Layered::Hidden => {
                    return Err(FsError::not_found(path.as_str()));
                }
                Layered::Base => return self.set.base.read(path.as_str()).await,
            }
        }
        Err(FsError::too_many_links(path.as_str()))
    }

    pub async fn write(
        &self,
        path: &str,
        bytes: &[u8],
        mode: Option<u32>,
    ) -> Result<WriteOutcome, FsError> {
        let path = CanonicalPath::new(path)?;
        if path.is_root() {
            return Err(FsError::is_a_directory("/"));
        }
        // Writing through a symlink lands on its target, wherever the link lives in the
        // layering; a dangling link creates the target.
        let path = self.resolve_for_write(&path).await?;
        self.ensure_parent_dir(&path).await?;

        // Establish the copy-on-write source before superseding it.
        let (own_blob, base_copy) = match self.layered(&path)? {
            Layered::Entry(DirtyEntry::File { blob, .. }) => {
                if self.owns_entry(&path) {
                    (Some(blob), None)
                } else {
                    (None, None)
                }
            }
            Layered::Entry(DirtyEntry::Dir { .. }) => {
                return Err(FsError::is_a_directory(path.as_str()))
            }
            Layered::Entry(_) | Layered::Hidden => (None, None),
            Layered::Base => match self.set.base.stat(path.as_str()).await {
                Ok(meta) if meta.is_dir() => {
                    return Err(FsError::is_a_directory(path.as_str()))
                }
                Ok(_) => (None, self.base_blob(&path).await?),
                Err(e) if e.kind == ErrorKind::NotFound => (None, None),
                Err(e) => return Err(e),
            },
        };

        if let Some(copied) = base_copy {
            // The logical copy: hold the base content by reference while it is still the
            // branch's view of the path.
            self.set
                .base
                .store()
                .add_ref(copied.hash)
                .await
                .map_err(|e| store_failure(&e))?;
            // Immediately superseded by the new content below.
            self.set
                .base
                .store()
                .release_ref(copied.hash)
                .await
                .map_err(|e| store_failure(&e))?;
        }

        let digest = self
            .set
            .base
            .store()
            .put(Bytes::copy_from_slice(bytes))
            .await
            .map_err(|e| store_failure(&e))?;

        {
            let mut registry = self.set.registry.lock();
            let epoch = registry.tick();
            let branch = registry.branch_mut(&self.name)?;
            // A rewrite keeps earlier attribute patches unless the caller supplies a mode.
            let mut attrs = match branch.dirty.get(path.as_str()) {
                Some(DirtyEntry::File { attrs, .. }) => *attrs,
                _ => AttrPatch::default(),
            };
            if mode.is_some() {
                attrs.mode = mode;
            }
            branch.dirty.insert(
                path.to_string(),
                DirtyEntry::File {
                    blob: digest,
                    attrs,
                    mtime: SystemTime::now(),
                    epoch,
                },
            );
        }
        if let Some(old) = own_blob {
            // The superseded entry held one reference; identical content still releases it,
            // cancelling the surplus reference the put granted.
            self.set.release(old).await;
        }

        let tier = self
            .set
            .base
            .store()
            .get_tier(digest.hash)
            .await
            .unwrap_or(store::Tier::Hot);
        Ok(WriteOutcome {
            bytes_written: bytes.len(),
            tier,
        })
    }

    pub async fn append(&self, path: &str, bytes: &[u8]) -> Result<WriteOutcome, FsError> {
        let existing = match self.read(path).await {
            Ok(content) => content.to_vec(),
            Err(e) if e.kind == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut content = existing;
        content.extend_from_slice(bytes);
        self.write(path, &content, None).await
    }

    pub async fn truncate(&self, path: &str, len: i64) -> Result<(), FsError> {
        if len < 0 {
            return Err(FsError::invalid_argument("cannot truncate to a negative length"));
        }
        let mut content = self.read(path).await?.to_vec();
        content.resize(len as usize, 0);
        self.write(path, &content, None).await?;
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        let owned = match self.layered(&path)? {
            Layered::Entry(DirtyEntry::File { blob, .. }) => {
                if self.owns_entry(&path) {
                    Some(blob)
                } else {
                    None
                }
            }
            Layered::Entry(DirtyEntry::Symlink { .. }) => None,
            Layered::Entry(DirtyEntry::Dir { .. }) => {
                return Err(FsError::is_a_directory(path.as_str()))
            }
            Layered::Entry(DirtyEntry::Removed { .. }) | Layered::Hidden => {
                return Err(FsError::not_found(path.as_str()))
            }
            Layered::Base => {
                let meta = self.set.base.stat(path.as_str()).await?;
                if meta.is_dir() {
                    return Err(FsError::is_a_directory(path.as_str()));
                }
                None
            }
        };
        {
            let mut registry = self.set.registry.lock();
            let epoch = registry.tick();
            let branch = registry.branch_mut(&self.name)?;
            branch
                .dirty
                .insert(path.to_string(), DirtyEntry::Removed { epoch });
        }
        if let Some(blob) = owned {
            self.set.release(blob).await;
        }
        Ok(())
    }

    pub async fn mkdir(&self, path: &str, recursive: bool, mode: Option<u32>) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        if path.is_root() {
            if recursive {
                return Ok(());
            }
            return Err(FsError::already_exists("/"));
        }
        if recursive {
            if let Some(parent) = path.parent() {
                if !parent.is_root() {
                    Box::pin(self.mkdir(parent.as_str(), true, mode)).await?;
                }
            }
        } else {
            self.ensure_parent_dir(&path).await?;
        }
        match self.kind_of(&path).await? {
            Some(FileType::Directory) => {
                if recursive {
                    return Ok(());
                }
                return Err(FsError::already_exists(path.as_str()));
            }
            Some(_) => {
                if recursive {
                    return Err(FsError::not_a_directory(path.as_str()));
                }
                return Err(FsError::already_exists(path.as_str()));
            }
            None => {}
        }
        let mut registry = self.set.registry.lock();
        let epoch = registry.tick();
        let branch = registry.branch_mut(&self.name)?;
        branch.dirty.insert(
            path.to_string(),
            DirtyEntry::Dir {
                attrs: AttrPatch {
                    mode,
                    ..AttrPatch::default()
                },
                fresh: true,
                epoch,
            },
        );
        Ok(())
    }

    pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        if path.is_root() {
            return Err(FsError::not_permitted("/").with_message("cannot remove the root"));
        }
        match self.kind_of(&path).await? {
            Some(FileType::Directory) => {}
            Some(_) => return Err(FsError::not_a_directory(path.as_str())),
            None => return Err(FsError::not_found(path.as_str())),
        }
        if !recursive && !self.readdir(path.as_str()).await?.is_empty() {
            return Err(FsError::not_empty(path.as_str()));
        }
        let displaced = {
            let mut registry = self.set.registry.lock();
            let epoch = registry.tick();
            let branch = registry.branch_mut(&self.name)?;
            let displaced = purge_subtree(&mut branch.dirty, path.as_str());
            branch
                .dirty
                .insert(path.to_string(), DirtyEntry::Removed { epoch });
            displaced
        };
        for blob in displaced {
            self.set.release(blob).await;
        }
        Ok(())
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let old_path = CanonicalPath::new(old)?;
        let new_path = CanonicalPath::new(new)?;
        if new_path.starts_with(&old_path) && new_path != old_path {
            return Err(FsError::invalid_argument(format!(
                "cannot move {old_path} into its own subtree {new_path}"
            )));
        }
        self.ensure_parent_dir(&new_path).await?;
        match self.kind_of(&old_path).await? {
            None => Err(FsError::not_found(old_path.as_str())),
            Some(FileType::Directory) => {
                let entries = self.collect_tree(&old_path).await?;
                // Mirror the subtree under the new prefix, then tombstone the old one.
                self.mkdir(new_path.as_str(), true, None).await?;
                for (sub, kind) in &entries {
                    let suffix = &sub[old_path.as_str().len()..];
                    let dest = format!("{}{suffix}", new_path.as_str());
                    match kind {
                        FileType::Directory => self.mkdir(&dest, true, None).await?,
                        FileType::Symlink => {
                            // Symlink targets move verbatim.
                            let layered = self.layered(&CanonicalPath::new(sub)?)?;
                            if let Layered::Entry(DirtyEntry::Symlink { target, .. }) = layered {
                                self.symlink(&target, &dest).await?;
                            } else if let Ok(target) = self.set.base.readlink(sub).await {
                                self.symlink(&target, &dest).await?;
                            }
                        }
                        _ => {
                            let content = self.read(sub).await?;
                            self.write(&dest, &content, None).await?;
                        }
                    }
                }
                self.rmdir(old_path.as_str(), true).await
            }
            Some(FileType::Symlink) => {
                let layered = self.layered(&old_path)?;
                let target = match layered {
                    Layered::Entry(DirtyEntry::Symlink { target, .. }) => target,
                    _ => self.set.base.readlink(old_path.as_str()).await?,
                };
                self.remove_any(&new_path).await?;
                self.symlink(&target, new_path.as_str()).await?;
                self.unlink(old_path.as_str()).await
            }
            Some(_) => {
                let content = self.read(old_path.as_str()).await?;
                self.remove_any(&new_path).await?;
                self.write(new_path.as_str(), &content, None).await?;
                self.unlink(old_path.as_str()).await
            }
        }
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.patch_attrs(path, |attrs| attrs.mode = Some(mode & 0o7777))
            .await
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        self.patch_attrs(path, |attrs| attrs.owner = Some((uid, gid)))
            .await
    }

    pub async fn utimes(
        &self,
        path: &str,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> Result<(), FsError> {
        self.patch_attrs(path, |attrs| attrs.times = Some((atime, mtime)))
            .await
    }

    pub async fn symlink(&self, target: &str, path: &str) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        self.ensure_parent_dir(&path).await?;
        if self.kind_of(&path).await?.is_some() {
            return Err(FsError::already_exists(path.as_str()));
        }
        let mut registry = self.set.registry.lock();
        let epoch = registry.tick();
        let branch = registry.branch_mut(&self.name)?;
        branch.dirty.insert(
            path.to_string(),
            DirtyEntry::Symlink {
                target: target.to_string(),
                epoch,
            },
        );
        Ok(())
    }

    /// A hard link materializes in the overlay as a second name for the same blob.
    pub async fn link(&self, existing: &str, new: &str) -> Result<(), FsError> {
        let existing_path = CanonicalPath::new(existing)?;
        let new_path = CanonicalPath::new(new)?;
        self.ensure_parent_dir(&new_path).await?;
        if self.kind_of(&new_path).await?.is_some() {
            return Err(FsError::already_exists(new_path.as_str()));
        }
        let blob = match self.layered(&existing_path)? {
            Layered::Entry(DirtyEntry::File { blob, .. }) => blob,
            Layered::Entry(DirtyEntry::Dir { .. }) => {
                return Err(FsError::not_permitted(existing_path.as_str())
                    .with_message("hard links to directories are not permitted"))
            }
            Layered::Entry(_) | Layered::Hidden => {
                return Err(FsError::not_found(existing_path.as_str()))
            }
            Layered::Base => {
                let meta = self.set.base.stat(existing_path.as_str()).await?;
                if meta.is_dir() {
                    return Err(FsError::not_permitted(existing_path.as_str())
                        .with_message("hard links to directories are not permitted"));
                }
                self.base_blob(&existing_path)
                    .await?
                    .ok_or_else(|| FsError::not_found(existing_path.as_str()))?
            }
        };
        self.set
            .base
            .store()
            .add_ref(blob.hash)
            .await
            .map_err(|e| store_failure(&e))?;
        let mut registry = self.set.registry.lock();
        let epoch = registry.tick();
        let branch = registry.branch_mut(&self.name)?;
        branch.dirty.insert(
            new_path.to_string(),
            DirtyEntry::File {
                blob,
                attrs: AttrPatch::default(),
                mtime: SystemTime::now(),
                epoch,
            },
        );
        Ok(())
    }

    /// Attributes of the target, following symlinks wherever they live in the layering.
    pub async fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        let mut path = CanonicalPath::new(path)?;
        for _ in 0..MAX_LINK_HOPS {
            match self.layered(&path)? {
                Layered::Base => {
                    let meta = self.set.base.lstat(path.as_str()).await?;
                    if !meta.is_symlink() {
                        return Ok(meta);
                    }
                    // A base-backed link may point at a branch-shadowed target, so resolution
                    // re-enters the layering rather than finishing in the base.
                    let target = self.set.base.readlink(path.as_str()).await?;
                    path = resolve_link_target(&path, &target)?;
                }
                Layered::Hidden => return Err(FsError::not_found(path.as_str())),
                Layered::Entry(DirtyEntry::Removed { .. }) => {
                    return Err(FsError::not_found(path.as_str()))
                }
                Layered::Entry(DirtyEntry::Symlink { target, .. }) => {
                    path = resolve_link_target(&path, &target)?;
                }
                Layered::Entry(entry) => return self.synthesize_metadata(&path, &entry).await,
            }
        }
        Err(FsError::too_many_links(path.as_str()))
    }

    /// Attributes of the link itself.
    pub async fn lstat(&self, path: &str) -> Result<Metadata, FsError> {
        let path = CanonicalPath::new(path)?;
        match self.layered(&path)? {
            Layered::Base => self.set.base.lstat(path.as_str()).await,
            Layered::Hidden => Err(FsError::not_found(path.as_str())),
            Layered::Entry(DirtyEntry::Removed { .. }) => {
                Err(FsError::not_found(path.as_str()))
            }
            Layered::Entry(entry) => self.synthesize_metadata(&path, &entry).await,
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, FsError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Merged listing: base entries (unless hidden) overlaid with dirty adds and removes.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = CanonicalPath::new(path)?;
        match self.kind_of(&path).await? {
            Some(FileType::Directory) => {}
            Some(_) => return Err(FsError::not_a_directory(path.as_str())),
            None => return Err(FsError::not_found(path.as_str())),
        }

        let mut entries: BTreeMap<String, FileType> = BTreeMap::new();
        let base_visible = matches!(self.layered(&path)?, Layered::Base)
            || matches!(
                self.layered(&path)?,
                Layered::Entry(DirtyEntry::Dir { fresh: false, .. })
            );
        if base_visible {
            match self.set.base.readdir_typed(path.as_str()).await {
                Ok(base_entries) => {
                    for entry in base_entries {
                        entries.insert(entry.name, entry.kind);
                    }
                }
                Err(e) if e.kind == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let dirty = self
            .set
            .registry
            .lock()
            .dirty_children(&self.name, path.as_str())?;
        for (name, entry) in dirty {
            match entry.kind() {
                Some(kind) => {
                    entries.insert(name, kind);
                }
                None => {
                    entries.remove(&name);
                }
            }
        }
        Ok(entries
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// The branch's dirty map rendered as an ordered change list.
    pub fn changes(&self) -> Result<Vec<ChangeSummary>, FsError> {
        let registry = self.set.registry.lock();
        let branch = registry.branch(&self.name)?;
        Ok(branch
            .dirty
            .iter()
            .map(|(path, entry)| match entry {
                DirtyEntry::File { blob, epoch, .. } => ChangeSummary::Written {
                    path: path.clone(),
                    size: blob.size_bytes as u64,
                    epoch: *epoch,
                },
                DirtyEntry::Dir { epoch, .. } => ChangeSummary::DirectoryAdded {
                    path: path.clone(),
                    epoch: *epoch,
                },
                DirtyEntry::Symlink { epoch, .. } => ChangeSummary::SymlinkAdded {
                    path: path.clone(),
                    epoch: *epoch,
                },
                DirtyEntry::Removed { epoch } => ChangeSummary::Removed {
                    path: path.clone(),
                    epoch: *epoch,
                },
            })
            .collect())
    }

    // ----- helpers -------------------------------------------------------------------------

    ///
    /// Expands a trailing symlink chain for a write-like operation, whether the links live in
    /// this branch, a parent branch, or the base. The returned path names a non-symlink entry
    /// or a nonexistent one.
    ///
    async fn resolve_for_write(&self, path: &CanonicalPath) -> Result<CanonicalPath, FsError> {
        let mut current = path.clone();
        for _ in 0..MAX_LINK_HOPS {
            match self.layered(&current)? {
                Layered::Entry(DirtyEntry::Symlink { target, .. }) => {
                    current = resolve_link_target(&current, &target)?;
                }
                Layered::Base => match self.set.base.lstat(current.as_str()).await {
                    Ok(meta) if meta.is_symlink() => {
                        let target = self.set.base.readlink(current.as_str()).await?;
                        current = resolve_link_target(&current, &target)?;
                    }
                    Ok(_) => return Ok(current),
                    Err(e) if e.kind == ErrorKind::NotFound => return Ok(current),
                    Err(e) => return Err(e),
                },
                _ => return Ok(current),
            }
        }
        Err(FsError::too_many_links(path.as_str()))
    }

    fn layered(&self, path: &CanonicalPath) -> Result<Layered, FsError> {
        self.set.registry.lock().view(&self.name, path.as_str())
    }

    fn owns_entry(&self, path: &CanonicalPath) -> bool {
        let registry = self.set.registry.lock();
        registry
            .branches
            .get(&self.name)
            .map(|b| b.dirty.contains_key(path.as_str()))
            .unwrap_or(false)
    }

    async fn load(&self, blob: Digest) -> Result<Bytes, FsError> {
        self.set
            .base
            .store()
            .load(blob.hash)
            .await
            .map_err(|e| store_failure(&e))?
            .ok_or_else(|| {
                FsError::without_path(ErrorKind::NotFound)
                    .with_message(format!("content blob {} is missing from the store", blob.hash))
            })
    }

    async fn base_blob(&self, path: &CanonicalPath) -> Result<Option<Digest>, FsError> {
        match self.set.base.file_digest(path.as_str()).await {
            Ok(digest) => Ok(Some(digest)),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn kind_of(&self, path: &CanonicalPath) -> Result<Option<FileType>, FsError> {
        if path.is_root() {
            return Ok(Some(FileType::Directory));
        }
        match self.layered(path)? {
            Layered::Entry(entry) => Ok(entry.kind()),
            Layered::Hidden => Ok(None),
            Layered::Base => match self.set.base.lstat(path.as_str()).await {
                Ok(meta) => Ok(Some(meta.kind)),
                Err(e) if e.kind == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    async fn ensure_parent_dir(&self, path: &CanonicalPath) -> Result<(), FsError> {
        let Some(parent) = path.parent() else {
            return Err(FsError::not_permitted("/"));
        };
        if parent.is_root() {
            return Ok(());
        }
        match self.kind_of(&parent).await? {
            Some(FileType::Directory) => Ok(()),
            Some(_) => Err(FsError::not_a_directory(parent.as_str())),
            None => Err(FsError::not_found(parent.as_str())),
        }
    }

    async fn remove_any(&self, path: &CanonicalPath) -> Result<(), FsError> {
        match self.kind_of(path).await? {
            None => Ok(()),
            Some(FileType::Directory) => self.rmdir(path.as_str(), true).await,
            Some(_) => self.unlink(path.as_str()).await,
        }
    }

    async fn patch_attrs<F: FnOnce(&mut AttrPatch)>(
        &self,
        path: &str,
        patch: F,
    ) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        let from_self = self.owns_entry(&path);

        // An entry already owned by this branch is patched in place and keeps its blob
        // reference. Anything else (a parent branch's entry or a base object) is copied on
        // write: file copies take a fresh store reference before they join this dirty map.
        if from_self {
            let mut registry = self.set.registry.lock();
            let epoch = registry.tick();
            let branch = registry.branch_mut(&self.name)?;
            match branch.dirty.get_mut(path.as_str()) {
                Some(DirtyEntry::File {
                    attrs, epoch: e, ..
                })
                | Some(DirtyEntry::Dir {
                    attrs, epoch: e, ..
                }) => {
                    patch(attrs);
                    *e = epoch;
                    return Ok(());
                }
                Some(DirtyEntry::Symlink { .. }) => return Ok(()),
                Some(DirtyEntry::Removed { .. }) | None => {
                    return Err(FsError::not_found(path.as_str()))
                }
            }
        }

        let mut new_entry = match self.layered(&path)? {
            Layered::Entry(DirtyEntry::Removed { .. }) | Layered::Hidden => {
                return Err(FsError::not_found(path.as_str()))
            }
            Layered::Entry(DirtyEntry::Symlink { .. }) => return Ok(()),
            Layered::Entry(DirtyEntry::File {
                blob,
                attrs,
                mtime,
                ..
            }) => {
                self.set
                    .base
                    .store()
                    .add_ref(blob.hash)
                    .await
                    .map_err(|e| store_failure(&e))?;
                DirtyEntry::File {
                    blob,
                    attrs,
                    mtime,
                    epoch: 0,
                }
            }
            Layered::Entry(entry @ DirtyEntry::Dir { .. }) => entry,
            Layered::Base => {
                let meta = self.set.base.stat(path.as_str()).await?;
                match meta.kind {
                    FileType::Directory => DirtyEntry::Dir {
                        attrs: AttrPatch::default(),
                        fresh: false,
                        epoch: 0,
                    },
                    FileType::Regular => {
                        let blob = self
                            .base_blob(&path)
                            .await?
                            .ok_or_else(|| FsError::not_found(path.as_str()))?;
                        self.set
                            .base
                            .store()
                            .add_ref(blob.hash)
                            .await
                            .map_err(|e| store_failure(&e))?;
                        DirtyEntry::File {
                            blob,
                            attrs: AttrPatch::default(),
                            mtime: meta.mtime,
                            epoch: 0,
                        }
                    }
                    _ => return Err(FsError::not_permitted(path.as_str())),
                }
            }
        };

        if let DirtyEntry::File { attrs, .. } | DirtyEntry::Dir { attrs, .. } = &mut new_entry {
            patch(attrs);
        }
        let mut registry = self.set.registry.lock();
        let epoch = registry.tick();
        if let DirtyEntry::File { epoch: e, .. } | DirtyEntry::Dir { epoch: e, .. } =
            &mut new_entry
        {
            *e = epoch;
        }
        let branch = registry.branch_mut(&self.name)?;
        branch.dirty.insert(path.to_string(), new_entry);
        Ok(())
    }

    async fn synthesize_metadata(
        &self,
        path: &CanonicalPath,
        entry: &DirtyEntry,
    ) -> Result<Metadata, FsError> {
        // Start from the base attributes when the object exists there, so untouched fields
        // survive into the branch view.
        let base_meta = match self.set.base.stat(path.as_str()).await {
            Ok(meta) => Some(meta),
            Err(e) if e.kind == ErrorKind::NotFound => None,
            Err(e) => Err(e)?,
        };
        let had_base = base_meta.is_some();
        let mut meta = base_meta.unwrap_or(Metadata {
            ino: 0,
            kind: FileType::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            nlink: 1,
            size: 0,
            blksize: 4096,
            blocks: 0,
            dev: 1,
            rdev: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            birthtime: SystemTime::UNIX_EPOCH,
        });
        match entry {
            DirtyEntry::File {
                blob,
                attrs,
                mtime,
                ..
            } => {
                meta.kind = FileType::Regular;
                meta.size = blob.size_bytes as u64;
                meta.blocks = meta.size.div_ceil(512);
                meta.mtime = *mtime;
                apply_patch(&mut meta, attrs);
            }
            DirtyEntry::Dir { attrs, .. } => {
                meta.kind = FileType::Directory;
                meta.size = 0;
                if !had_base {
                    meta.mode = 0o755;
                }
                apply_patch(&mut meta, attrs);
            }
            DirtyEntry::Symlink { target, .. } => {
                meta.kind = FileType::Symlink;
                meta.size = target.len() as u64;
                meta.mode = 0o777;
            }
            DirtyEntry::Removed { .. } => return Err(FsError::not_found(path.as_str())),
        }
        Ok(meta)
    }
}

fn apply_patch(meta: &mut Metadata, attrs: &AttrPatch) {
    if let Some(mode) = attrs.mode {
        meta.mode = mode;
    }
    if let Some((uid, gid)) = attrs.owner {
        meta.uid = uid;
        meta.gid = gid;
    }
    if let Some((atime, mtime)) = attrs.times {
        meta.atime = atime;
        meta.mtime = mtime;
    }
}

fn resolve_link_target(
    link: &CanonicalPath,
    target: &str,
) -> Result<CanonicalPath, FsError> {
    if target.starts_with('/') {
        CanonicalPath::new(target)
    } else {
        let parent = link.parent().unwrap_or_else(CanonicalPath::root);
        CanonicalPath::new(&format!("{}/{target}", parent.as_str()))
    }
}

fn store_failure(message: &str) -> FsError {
    FsError::without_path(ErrorKind::NoSpace).with_message(format!("blob store: {message}"))
}

async fn collect_tree_inner(
    branch: &BranchFs,
    dir: &CanonicalPath,
    out: &mut Vec<(String, FileType)>,
) -> Result<(), FsError> {
    for entry in branch.readdir(dir.as_str()).await? {
        let child = dir.child(&entry.name);
        out.push((child.to_string(), entry.kind));
        if entry.kind == FileType::Directory {
            Box::pin(collect_tree_inner(branch, &child, out)).await?;
        }
    }
    Ok(())
}

impl BranchFs {
    /// Every effective path under a directory, shallow before deep.
    async fn collect_tree(&self, dir: &CanonicalPath) -> Result<Vec<(String, FileType)>, FsError> {
        let mut out = Vec::new();
        collect_tree_inner(self, dir, &mut out).await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests;
