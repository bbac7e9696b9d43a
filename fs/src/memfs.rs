// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use hashing::{Digest, Fingerprint};
use log::debug;
use parking_lot::Mutex;
use store::{ByteStore, Tier};
use tokio::sync::broadcast;

use crate::error::{ErrorKind, FsError};
use crate::event::{ChangeEvent, ChangeKind};
use crate::flags::{Access, OpenOptions};
use crate::inode::{
    DirEntry, Ino, Inode, Metadata, Payload, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE,
    DEFAULT_SYMLINK_MODE, ROOT_INO,
};
use crate::path::{CanonicalPath, MAX_LINK_HOPS};

/// How many file deletions a recursive removal keeps in flight.
const REMOVAL_CONCURRENCY: usize = 16;

const DEFAULT_MAX_OPEN_FILES: usize = 1024;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct MemFsOptions {
    pub max_open_files: usize,
}

impl Default for MemFsOptions {
    fn default() -> MemFsOptions {
        MemFsOptions {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

/// The result of a whole-file write: how much was written and where the blob landed.
#[derive(Clone, Copy, Debug)]
pub struct WriteOutcome {
    pub bytes_written: usize,
    pub tier: Tier,
}

/// Instance-wide accounting, as reported by [`MemFs::stats`].
#[derive(Clone, Copy, Debug)]
pub struct FsStats {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub open_handles: usize,
    pub store: store::StoreStats,
}

struct Handle {
    ino: Ino,
    /// The resolved path the handle was opened at, for error context on later operations.
    path: CanonicalPath,
    access: Access,
    append: bool,
    position: u64,
}

struct Inner {
    inodes: HashMap<Ino, Inode>,
    next_ino: Ino,
    handles: HashMap<u32, Handle>,
    next_fd: u32,
    max_open_files: usize,
    last_timestamp: SystemTime,
}

struct ResolvedPath {
    ino: Ino,
    path: CanonicalPath,
}

struct State {
    inner: Mutex<Inner>,
    store: ByteStore,
    events: broadcast::Sender<ChangeEvent>,
}

///
/// A POSIX-semantic filesystem held entirely off-kernel: a hierarchical namespace of inodes
/// whose regular-file content lives in a content-addressed [`ByteStore`].
///
/// All operations are asynchronous; anything which touches the blob store may suspend. The
/// namespace itself is guarded by a per-instance mutex which is never held across a
/// suspension point, so concurrent operations interleave at substrate boundaries exactly as
/// a cooperative scheduler would interleave them.
///
#[derive(Clone)]
pub struct MemFs {
    state: Arc<State>,
}

impl MemFs {
    pub fn new() -> MemFs {
        Self::with_store(ByteStore::in_memory())
    }

    pub fn with_store(store: ByteStore) -> MemFs {
        Self::with_store_and_options(store, MemFsOptions::default())
    }

    pub fn with_store_and_options(store: ByteStore, options: MemFsOptions) -> MemFs {
        let now = SystemTime::now();
        let mut inodes = HashMap::new();
        let mut root = Inode::new(
            Payload::Directory {
                children: BTreeMap::new(),
            },
            DEFAULT_DIR_MODE,
            now,
        );
        root.link_count = 1;
        inodes.insert(ROOT_INO, root);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MemFs {
            state: Arc::new(State {
                inner: Mutex::new(Inner {
                    inodes,
                    next_ino: ROOT_INO + 1,
                    handles: HashMap::new(),
                    next_fd: 3,
                    max_open_files: options.max_open_files,
                    last_timestamp: now,
                }),
                store,
                events,
            }),
        }
    }

    pub fn store(&self) -> &ByteStore {
        &self.state.store
    }

    /// Subscribe to change notifications. Events are dropped, not buffered indefinitely, when
    /// a receiver lags.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.state.events.subscribe()
    }

    fn emit(&self, kind: ChangeKind, path: &CanonicalPath) {
        // Nobody listening is the common case and not an error.
        let _ = self.state.events.send(ChangeEvent {
            kind,
            path: path.to_string(),
            timestamp: SystemTime::now(),
        });
    }

    // ----- plain POSIX surface -------------------------------------------------------------

    /// Reads the whole content of a regular file, following symlinks.
    pub async fn read(&self, path: &str) -> Result<Bytes, FsError> {
        let path = CanonicalPath::new(path)?;
        let (blob, ino) = {
            let inner = self.state.inner.lock();
            let resolved = inner.resolve(&path, true)?;
            match &inner.inode(resolved.ino)?.payload {
                Payload::File { blob } => (*blob, resolved.ino),
                Payload::Directory { .. } => return Err(FsError::is_a_directory(path.as_str())),
                Payload::Symlink { .. } => return Err(FsError::not_found(path.as_str())),
            }
        };
        let bytes = self.load_blob(blob).await?;
        let mut inner = self.state.inner.lock();
        let now = inner.now();
        if let Some(inode) = inner.inodes.get_mut(&ino) {
            inode.atime = now;
        }
        Ok(bytes)
    }

    /// Writes (creating or replacing) the whole content of a regular file.
    pub async fn write(
        &self,
        path: &str,
        bytes: &[u8],
        mode: Option<u32>,
    ) -> Result<WriteOutcome, FsError> {
        let path = CanonicalPath::new(path)?;
        let digest = self.put_blob(bytes).await?;
        self.bind_or_release(&path, digest, mode).await
    }

    /// Appends to a regular file, creating it if absent.
    pub async fn append(&self, path: &str, bytes: &[u8]) -> Result<WriteOutcome, FsError> {
        let path = CanonicalPath::new(path)?;
        let existing = {
            let inner = self.state.inner.lock();
            match inner.resolve(&path, true) {
                Ok(resolved) => match &inner.inode(resolved.ino)?.payload {
                    Payload::File { blob } => Some(*blob),
                    Payload::Directory { .. } => {
                        return Err(FsError::is_a_directory(path.as_str()))
                    }
                    Payload::Symlink { .. } => None,
                },
                Err(e) if e.kind == ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            }
        };
        let mut content = match existing {
            Some(blob) => self.load_blob(blob).await?.to_vec(),
            None => Vec::new(),
        };
        content.extend_from_slice(bytes);
        let digest = self.put_blob(&content).await?;
        self.bind_or_release(&path, digest, None).await
    }

    /// Removes a directory entry for a non-directory. The inode (and blob reference) lingers
    /// while handles remain open on it.
    pub async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        let release = {
            let mut inner = self.state.inner.lock();
            let (parent_ino, name) = inner.resolve_parent(&path)?;
            let child_ino = inner.child(parent_ino, &name, &path)?;
            let child = inner.inode(child_ino)?;
            if matches!(child.payload, Payload::Directory { .. }) {
                return Err(FsError::is_a_directory(path.as_str()));
            }
            inner.remove_entry(parent_ino, &name, child_ino)?
        };
        self.apply_releases(release).await?;
        self.emit(ChangeKind::Removed, &path);
        Ok(())
    }

    ///
    /// Moves an entry, carrying a whole subtree when it names a directory. An existing file at
    /// the destination is replaced atomically; an existing directory must be empty.
    ///
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let old = CanonicalPath::new(old)?;
        let new = CanonicalPath::new(new)?;
        if old.is_root() {
            return Err(FsError::not_permitted("/").with_message("cannot rename the root"));
        }
        if new.starts_with(&old) && new != old {
            return Err(FsError::invalid_argument(format!(
                "cannot move {old} into its own subtree {new}"
            )));
        }
        let release = {
            let mut inner = self.state.inner.lock();
            let (old_parent, old_name) = inner.resolve_parent(&old)?;
            let moved_ino = inner.child(old_parent, &old_name, &old)?;
            let (new_parent, new_name) = inner.resolve_parent(&new)?;

            let mut release = Vec::new();
            if let Some(&existing) = inner.dir_children(new_parent, &new)?.get(&new_name) {
                if existing == moved_ino {
                    // Both names are hard links to the same inode: rename is a no-op.
                    return Ok(());
                }
                if let Payload::Directory { children } = &inner.inode(existing)?.payload {
                    let moved_is_dir =
                        matches!(inner.inode(moved_ino)?.payload, Payload::Directory { .. });
                    if !moved_is_dir {
                        return Err(FsError::is_a_directory(new.as_str()));
                    }
                    if !children.is_empty() {
                        return Err(FsError::not_empty(new.as_str()));
                    }
                }
                release = inner.remove_entry(new_parent, &new_name, existing)?;
            }

            let now = inner.now();
            inner.dir_children_mut(old_parent).remove(&old_name);
            inner
                .dir_children_mut(new_parent)
                .insert(new_name, moved_ino);
            if let Some(node) = inner.inodes.get_mut(&moved_ino) {
                node.ctime = now;
            }
            for ino in [old_parent, new_parent] {
                if let Some(node) = inner.inodes.get_mut(&ino) {
                    node.mtime = now;
                    node.ctime = now;
                }
            }
            release
        };
        self.apply_releases(release).await?;
        self.emit(
            ChangeKind::Renamed {
                to: new.to_string(),
            },
            &old,
        );
        Ok(())
    }

    /// Copies file content; the destination gets the source's mode and a fresh identity.
    pub async fn copy_file(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let src_path = CanonicalPath::new(src)?;
        let (blob, mode) = {
            let inner = self.state.inner.lock();
            let resolved = inner.resolve(&src_path, true)?;
            let node = inner.inode(resolved.ino)?;
            match &node.payload {
                Payload::File { blob } => (*blob, node.mode),
                Payload::Directory { .. } => {
                    return Err(FsError::is_a_directory(src_path.as_str()))
                }
                Payload::Symlink { .. } => return Err(FsError::not_found(src_path.as_str())),
            }
        };
        let content = self.load_blob(blob).await?;
        self.write(dst, &content, Some(mode)).await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str, recursive: bool, mode: Option<u32>) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        let mode = mode.map(|m| m & 0o7777).unwrap_or(DEFAULT_DIR_MODE);
        if path.is_root() {
            if recursive {
                return Ok(());
            }
            return Err(FsError::already_exists("/"));
        }
        let mut inner = self.state.inner.lock();
        if recursive {
            let mut current = CanonicalPath::root();
            for segment in path.segments().map(str::to_string).collect::<Vec<_>>() {
                current = current.child(&segment);
                match inner.resolve(&current, true) {
                    Ok(resolved) => {
                        if !matches!(inner.inode(resolved.ino)?.payload, Payload::Directory { .. })
                        {
                            return Err(FsError::not_a_directory(current.as_str()));
                        }
                    }
                    Err(e) if e.kind == ErrorKind::NotFound => {
                        inner.create_dir(&current, mode)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            drop(inner);
            self.emit(ChangeKind::Created, &path);
            return Ok(());
        }
        let (parent_ino, name) = inner.resolve_parent(&path)?;
        if inner.dir_children(parent_ino, &path)?.contains_key(&name) {
            return Err(FsError::already_exists(path.as_str()));
        }
        inner.create_dir(&path, mode)?;
        drop(inner);
        self.emit(ChangeKind::Created, &path);
        Ok(())
    }

    pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        if path.is_root() {
            return Err(FsError::not_permitted("/").with_message("cannot remove the root"));
        }
        if recursive {
            return self.remove_tree(&path).await;
        }
        let release = {
            let mut inner = self.state.inner.lock();
            let (parent_ino, name) = inner.resolve_parent(&path)?;
            let child_ino = inner.child(parent_ino, &name, &path)?;
            match &inner.inode(child_ino)?.payload {
                Payload::Directory { children } => {
                    if !children.is_empty() {
                        return Err(FsError::not_empty(path.as_str()));
                    }
                }
                _ => return Err(FsError::not_a_directory(path.as_str())),
            }
            inner.remove_entry(parent_ino, &name, child_ino)?
        };
        self.apply_releases(release).await?;
        self.emit(ChangeKind::Removed, &path);
        Ok(())
    }

    ///
    /// Recursive removal: every descendant file is deleted concurrently (bounded fan-out),
    /// directories are dismantled deepest-first, and the first failure aborts the operation.
    ///
    async fn remove_tree(&self, path: &CanonicalPath) -> Result<(), FsError> {
        let releases = {
            let mut inner = self.state.inner.lock();
            let (parent_ino, name) = inner.resolve_parent(path)?;
            let root_ino = inner.child(parent_ino, &name, path)?;
            if !matches!(inner.inode(root_ino)?.payload, Payload::Directory { .. }) {
                return Err(FsError::not_a_directory(path.as_str()));
            }

            // Collect the subtree: entries are removed in one critical section so that the
            // namespace never exposes a half-deleted tree; blob releases happen after.
            let mut releases: Vec<Fingerprint> = Vec::new();
            let mut stack = vec![root_ino];
            let mut dirs = Vec::new();
            while let Some(ino) = stack.pop() {
                dirs.push(ino);
                let children: Vec<(String, Ino)> = inner
                    .dir_children_of(ino)
                    .map(|c| c.iter().map(|(n, i)| (n.clone(), *i)).collect())
                    .unwrap_or_default();
                for (_, child_ino) in children {
                    match inner.inode(child_ino)?.payload.clone() {
                        Payload::Directory { .. } => stack.push(child_ino),
                        Payload::File { blob } => {
                            releases.push(blob.hash);
                            inner.drop_link(child_ino);
                        }
                        Payload::Symlink { .. } => {
                            inner.drop_link(child_ino);
                        }
                    }
                }
            }
            // Deepest-first: children were pushed after their parents, so reversing the
            // collection order tears down leaves before the directories that held them.
            for ino in dirs.iter().rev() {
                inner.inodes.remove(ino);
            }
            inner.dir_children_mut(parent_ino).remove(&name);
            let now = inner.now();
            if let Some(parent) = inner.inodes.get_mut(&parent_ino) {
                parent.mtime = now;
                parent.ctime = now;
            }
            releases
        };

        let store = self.state.store.clone();
        stream::iter(releases.into_iter().map(Ok::<_, FsError>))
            .try_for_each_concurrent(REMOVAL_CONCURRENCY, |fingerprint| {
                let store = store.clone();
                async move {
                    store
                        .release_ref(fingerprint)
                        .await
                        .map_err(|e| store_failure(&e))?;
                    Ok(())
                }
            })
            .await?;
        self.emit(ChangeKind::Removed, path);
        Ok(())
    }

    /// Entry names, sorted ascending.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        Ok(self
            .readdir_typed(path)
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Typed entries, sorted ascending by name.
    pub async fn readdir_typed(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = CanonicalPath::new(path)?;
        let inner = self.state.inner.lock();
        let resolved = inner.resolve(&path, true)?;
        let children = inner.dir_children(resolved.ino, &path)?;
        children
            .iter()
            .map(|(name, ino)| {
                Ok(DirEntry {
                    name: name.clone(),
                    kind: inner.inode(*ino)?.payload.kind(),
                })
            })
            .collect()
    }

    /// Attributes of the target, following symlinks.
    pub async fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        let path = CanonicalPath::new(path)?;
        let inner = self.state.inner.lock();
        let resolved = inner.resolve(&path, true)?;
        Ok(inner.inode(resolved.ino)?.metadata(resolved.ino))
    }

    /// Attributes of the link itself.
    pub async fn lstat(&self, path: &str) -> Result<Metadata, FsError> {
        let path = CanonicalPath::new(path)?;
        let inner = self.state.inner.lock();
        let resolved = inner.resolve(&path, false)?;
        Ok(inner.inode(resolved.ino)?.metadata(resolved.ino))
    }

    pub async fn exists(&self, path: &str) -> Result<bool, FsError> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Checks existence and, when `mode` is non-zero, the requested rwx bits against every
    /// permission triplet.
    pub async fn access(&self, path: &str, mode: Option<u32>) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        let inner = self.state.inner.lock();
        let resolved = inner.resolve(&path, true)?;
        let node = inner.inode(resolved.ino)?;
        let wanted = mode.unwrap_or(0) & 0o7;
        if wanted != 0 {
            let spread = wanted | wanted << 3 | wanted << 6;
            if node.mode & spread == 0 {
                return Err(FsError::new(ErrorKind::AccessDenied, path.as_str()));
            }
        }
        Ok(())
    }

    /// Sets permission bits. A trailing symlink is not followed: the mode lands on the link
    /// itself.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        {
            let mut inner = self.state.inner.lock();
            let resolved = inner.resolve(&path, false)?;
            let now = inner.now();
            let node = inner.inode_mut(resolved.ino)?;
            node.mode = mode & 0o7777;
            node.ctime = now;
        }
        self.emit(ChangeKind::Modified, &path);
        Ok(())
    }

    /// Sets ownership. Like `chmod`, a trailing symlink is not followed.
    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        {
            let mut inner = self.state.inner.lock();
            let resolved = inner.resolve(&path, false)?;
            let now = inner.now();
            let node = inner.inode_mut(resolved.ino)?;
            node.uid = uid;
            node.gid = gid;
            node.ctime = now;
        }
        self.emit(ChangeKind::Modified, &path);
        Ok(())
    }

    pub async fn utimes(
        &self,
        path: &str,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        {
            let mut inner = self.state.inner.lock();
            let resolved = inner.resolve(&path, true)?;
            let now = inner.now();
            let node = inner.inode_mut(resolved.ino)?;
            node.atime = atime;
            node.mtime = mtime;
            node.ctime = now;
        }
        self.emit(ChangeKind::Modified, &path);
        Ok(())
    }

    /// Creates a symbolic link at `path` holding `target` verbatim; dangling targets are fine.
    pub async fn symlink(&self, target: &str, path: &str) -> Result<(), FsError> {
        let path = CanonicalPath::new(path)?;
        {
            let mut inner = self.state.inner.lock();
            let (parent_ino, name) = inner.resolve_parent(&path)?;
            if inner.dir_children(parent_ino, &path)?.contains_key(&name) {
                return Err(FsError::already_exists(path.as_str()));
            }
            let now = inner.now();
            let ino = inner.insert_inode(Inode::new(
                Payload::Symlink {
                    target: target.to_string(),
                },
                DEFAULT_SYMLINK_MODE,
                now,
            ));
            inner.link_into(parent_ino, &name, ino, now);
        }
        self.emit(ChangeKind::Created, &path);
        Ok(())
    }

    /// Creates a hard link: a second directory entry for an existing file's inode.
    pub async fn link(&self, existing: &str, new: &str) -> Result<(), FsError> {
        let existing = CanonicalPath::new(existing)?;
        let new = CanonicalPath::new(new)?;
        let blob = {
            let mut inner = self.state.inner.lock();
            let resolved = inner.resolve(&existing, true)?;
            let blob = match &inner.inode(resolved.ino)?.payload {
                Payload::File { blob } => *blob,
                Payload::Directory { .. } => {
                    return Err(FsError::not_permitted(existing.as_str())
                        .with_message("hard links to directories are not permitted"))
                }
                Payload::Symlink { .. } => return Err(FsError::not_found(existing.as_str())),
            };
            let (parent_ino, name) = inner.resolve_parent(&new)?;
            if inner.dir_children(parent_ino, &new)?.contains_key(&name) {
                return Err(FsError::already_exists(new.as_str()));
            }
            let now = inner.now();
            inner.link_into(parent_ino, &name, resolved.ino, now);
            blob
        };
        self.state
            .store
            .add_ref(blob.hash)
            .await
            .map_err(|e| store_failure(&e))?;
        self.emit(ChangeKind::Created, &new);
        Ok(())
    }

    pub async fn readlink(&self, path: &str) -> Result<String, FsError> {
        let path = CanonicalPath::new(path)?;
        let inner = self.state.inner.lock();
        let resolved = inner.resolve(&path, false)?;
        match &inner.inode(resolved.ino)?.payload {
            Payload::Symlink { target } => Ok(target.clone()),
            _ => Err(FsError::new(ErrorKind::InvalidArgument, path.as_str())
                .with_message("not a symbolic link")),
        }
    }

    /// Instance-wide accounting: namespace object counts plus the blob store's view.
    pub async fn stats(&self) -> FsStats {
        let (files, directories, symlinks, open_handles) = {
            let inner = self.state.inner.lock();
            let mut files = 0;
            let mut directories = 0;
            let mut symlinks = 0;
            for inode in inner.inodes.values() {
                match inode.payload {
                    Payload::File { .. } => files += 1,
                    Payload::Directory { .. } => directories += 1,
                    Payload::Symlink { .. } => symlinks += 1,
                }
            }
            (files, directories, symlinks, inner.handles.len())
        };
        FsStats {
            files,
            directories,
            symlinks,
            open_handles,
            store: self.state.store.stats().await,
        }
    }

    /// The content digest a regular file's path currently binds to.
    pub async fn file_digest(&self, path: &str) -> Result<Digest, FsError> {
        let path = CanonicalPath::new(path)?;
        let inner = self.state.inner.lock();
        let resolved = inner.resolve(&path, true)?;
        match &inner.inode(resolved.ino)?.payload {
            Payload::File { blob } => Ok(*blob),
            Payload::Directory { .. } => Err(FsError::is_a_directory(path.as_str())),
            Payload::Symlink { .. } => Err(FsError::not_found(path.as_str())),
        }
    }

    /// Fully resolves symlinks and returns the canonical path of the target.
    pub async fn realpath(&self, path: &str) -> Result<String, FsError> {
        let path = CanonicalPath::new(path)?;
        let inner = self.state.inner.lock();
        let resolved = inner.resolve(&path, true)?;
        Ok(resolved.path.to_string())
    }

    // ----- file handles --------------------------------------------------------------------

    ///
    /// Opens a positional handle. Flags decide capability, creation, truncation and append
    /// behavior; `mode` applies only when a file is created.
    ///
    pub async fn open(
        &self,
        path: &str,
        options: &OpenOptions,
        mode: Option<u32>,
    ) -> Result<FileHandle, FsError> {
        let path = CanonicalPath::new(path)?;

        enum Plan {
            Existing(Ino, CanonicalPath),
            Create {
                parent: Ino,
                name: String,
                target: CanonicalPath,
            },
        }

        let plan = {
            let inner = self.state.inner.lock();
            if inner.handles.len() >= inner.max_open_files {
                return Err(FsError::without_path(ErrorKind::TooManyOpenFiles));
            }
            match inner.resolve(&path, true) {
                Ok(resolved) => {
                    if options.create && options.excl {
                        return Err(FsError::already_exists(path.as_str()));
                    }
                    let node = inner.inode(resolved.ino)?;
                    if matches!(node.payload, Payload::Directory { .. })
                        && (options.access.writable() || options.truncate)
                    {
                        return Err(FsError::is_a_directory(path.as_str()));
                    }
                    Plan::Existing(resolved.ino, resolved.path)
                }
                Err(e) if e.kind == ErrorKind::NotFound && options.create => {
                    // A dangling symlink at the final component creates its target.
                    let target = inner.resolve_for_write(&path)?;
                    let (parent, name) = inner.resolve_parent(&target)?;
                    Plan::Create {
                        parent,
                        name,
                        target,
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let (ino, opened_path) = match plan {
            Plan::Create {
                parent,
                name,
                target,
            } => {
                let digest = self.put_blob(&[]).await?;
                let mut inner = self.state.inner.lock();
                let now = inner.now();
                let mode = mode.map(|m| m & 0o7777).unwrap_or(DEFAULT_FILE_MODE);
                let ino = inner
                    .insert_inode(Inode::new(Payload::File { blob: digest }, mode, now));
                inner.link_into(parent, &name, ino, now);
                drop(inner);
                self.emit(ChangeKind::Created, &target);
                (ino, target)
            }
            Plan::Existing(ino, resolved) => {
                if options.truncate {
                    let digest = self.put_blob(&[]).await?;
                    self.replace_blob(ino, digest, &resolved).await?;
                }
                (ino, resolved)
            }
        };

        // Register the handle; the first open of a file inode takes one blob reference which
        // keeps content alive across an unlink of the final name.
        let (fd, first_open_blob) = {
            let mut inner = self.state.inner.lock();
            if inner.handles.len() >= inner.max_open_files {
                return Err(FsError::without_path(ErrorKind::TooManyOpenFiles));
            }
            let node = inner.inode_mut(ino)?;
            node.open_handles += 1;
            let first = node.open_handles == 1;
            let blob = match (&node.payload, first) {
                (Payload::File { blob }, true) => Some(blob.hash),
                _ => None,
            };
            let position = if options.append {
                inner.inode(ino)?.size()
            } else {
                0
            };
            let fd = inner.next_fd;
            inner.next_fd += 1;
            inner.handles.insert(
                fd,
                Handle {
                    ino,
                    path: opened_path,
                    access: options.access,
                    append: options.append,
                    position,
                },
            );
            (fd, blob)
        };
        if let Some(fingerprint) = first_open_blob {
            self.state
                .store
                .add_ref(fingerprint)
                .await
                .map_err(|e| store_failure(&e))?;
        }
        debug!("opened fd {fd} for {path}");
        Ok(FileHandle {
            fs: self.clone(),
            fd,
        })
    }

    async fn handle_read(
        &self,
        fd: u32,
        buf: &mut [u8],
        position: Option<u64>,
    ) -> Result<usize, FsError> {
        let (ino, blob, pos) = {
            let inner = self.state.inner.lock();
            let handle = inner.handle(fd)?;
            if !handle.access.readable() {
                return Err(FsError::bad_descriptor()
                    .with_message("handle is not open for reading"));
            }
            let node = inner.inode(handle.ino)?;
            let blob = match &node.payload {
                Payload::File { blob } => *blob,
                _ => return Err(FsError::is_a_directory(handle.path.as_str())),
            };
            (handle.ino, blob, position.unwrap_or(handle.position))
        };
        let content = self.load_blob(blob).await?;
        let start = (pos as usize).min(content.len());
        let n = (content.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&content[start..start + n]);

        let mut inner = self.state.inner.lock();
        let now = inner.now();
        if let Some(node) = inner.inodes.get_mut(&ino) {
            node.atime = now;
        }
        if position.is_none() {
            if let Some(handle) = inner.handles.get_mut(&fd) {
                handle.position = (start + n) as u64;
            }
        }
        Ok(n)
    }

    async fn handle_write(
        &self,
        fd: u32,
        data: &[u8],
        position: Option<u64>,
    ) -> Result<usize, FsError> {
        let (ino, handle_path, blob, pos, append) = {
            let inner = self.state.inner.lock();
            let handle = inner.handle(fd)?;
            if !handle.access.writable() {
                return Err(FsError::bad_descriptor()
                    .with_message("handle is not open for writing"));
            }
            let node = inner.inode(handle.ino)?;
            let blob = match &node.payload {
                Payload::File { blob } => *blob,
                _ => return Err(FsError::is_a_directory(handle.path.as_str())),
            };
            // In append mode every write lands at EOF, whatever position was supplied.
            let pos = if handle.append {
                node.size()
            } else {
                position.unwrap_or(handle.position)
            };
            (handle.ino, handle.path.clone(), blob, pos, handle.append)
        };

        let mut content = self.load_blob(blob).await?.to_vec();
        let pos = pos as usize;
        if pos > content.len() {
            // Writing past EOF extends the file with zeroes.
            content.resize(pos, 0);
        }
        let end = pos + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[pos..end].copy_from_slice(data);
        let new_len = content.len() as u64;

        let digest = self.put_blob(&content).await?;
        self.replace_blob(ino, digest, &handle_path).await?;

        let mut inner = self.state.inner.lock();
        if let Some(handle) = inner.handles.get_mut(&fd) {
            if append {
                handle.position = new_len;
            } else if position.is_none() {
                handle.position = end as u64;
            }
        }
        Ok(data.len())
    }

    async fn handle_truncate(&self, fd: u32, len: i64) -> Result<(), FsError> {
        if len < 0 {
            return Err(FsError::invalid_argument("cannot truncate to a negative length"));
        }
        let len = len as usize;
        let (ino, handle_path, blob) = {
            let inner = self.state.inner.lock();
            let handle = inner.handle(fd)?;
            if !handle.access.writable() {
                return Err(FsError::bad_descriptor()
                    .with_message("handle is not open for writing"));
            }
            let node = inner.inode(handle.ino)?;
            match &node.payload {
                Payload::File { blob } => (handle.ino, handle.path.clone(), *blob),
                _ => return Err(FsError::is_a_directory(handle.path.as_str())),
            }
        };
        let mut content = self.load_blob(blob).await?.to_vec();
        // Shrinking drops the tail; growing zero-fills it. Timestamps advance either way.
        content.resize(len, 0);
        let digest = self.put_blob(&content).await?;
        self.replace_blob(ino, digest, &handle_path).await?;

        let mut inner = self.state.inner.lock();
        if let Some(handle) = inner.handles.get_mut(&fd) {
            handle.position = handle.position.min(len as u64);
        }
        Ok(())
    }

    async fn handle_sync(&self, fd: u32) -> Result<(), FsError> {
        // A permitted no-op on an in-memory substrate, but the handle must still be open.
        let inner = self.state.inner.lock();
        inner.handle(fd)?;
        Ok(())
    }

    async fn handle_close(&self, fd: u32) -> Result<(), FsError> {
        let release = {
            let mut inner = self.state.inner.lock();
            let Some(handle) = inner.handles.remove(&fd) else {
                // close is idempotent.
                return Ok(());
            };
            let ino = handle.ino;
            let mut release = None;
            let mut reclaim = false;
            if let Some(node) = inner.inodes.get_mut(&ino) {
                node.open_handles = node.open_handles.saturating_sub(1);
                if node.open_handles == 0 {
                    if let Payload::File { blob } = &node.payload {
                        release = Some(blob.hash);
                    }
                    reclaim = node.link_count == 0;
                }
            }
            if reclaim {
                inner.inodes.remove(&ino);
            }
            release
        };
        if let Some(fingerprint) = release {
            self.state
                .store
                .release_ref(fingerprint)
                .await
                .map_err(|e| store_failure(&e))?;
        }
        Ok(())
    }

    // ----- internal helpers ----------------------------------------------------------------

    async fn put_blob(&self, bytes: &[u8]) -> Result<Digest, FsError> {
        self.state
            .store
            .put(Bytes::copy_from_slice(bytes))
            .await
            .map_err(|e| store_failure(&e))
    }

    async fn load_blob(&self, blob: Digest) -> Result<Bytes, FsError> {
        self.state
            .store
            .load(blob.hash)
            .await
            .map_err(|e| store_failure(&e))?
            .ok_or_else(|| {
                FsError::without_path(ErrorKind::NotFound)
                    .with_message(format!("content blob {} is missing from the store", blob.hash))
            })
    }

    ///
    /// Points a path at a blob whose store reference the caller already holds, creating the
    /// file if needed. This is the single content-binding primitive: `write`, `append` and the
    /// overlay's commit all funnel through it. Reference accounting: the bound blob ends up
    /// with one reference per directory entry plus one per open-handle set, and the previous
    /// blob loses the same number.
    ///
    pub async fn bind_blob(
        &self,
        path: &CanonicalPath,
        digest: Digest,
        mode: Option<u32>,
    ) -> Result<WriteOutcome, FsError> {
        if path.is_root() {
            return Err(FsError::is_a_directory("/"));
        }

        enum Applied {
            Created,
            Replaced { old: Digest, refs: u64 },
        }

        let (applied, path) = {
            let mut inner = self.state.inner.lock();
            let target = inner.resolve_for_write(path)?;
            let (parent_ino, name) = inner.resolve_parent(&target)?;
            let existing = inner.dir_children(parent_ino, &target)?.get(&name).copied();
            let applied = match existing {
                Some(child_ino) => {
                    let now = inner.now();
                    let node = inner.inode_mut(child_ino)?;
                    match &mut node.payload {
                        Payload::File { blob } => {
                            let old = *blob;
                            *blob = digest;
                            node.mtime = now;
                            node.ctime = now;
                            if let Some(mode) = mode {
                                node.mode = mode & 0o7777;
                            }
                            Applied::Replaced {
                                old,
                                refs: node.nlink(),
                            }
                        }
                        Payload::Directory { .. } => {
                            return Err(FsError::is_a_directory(target.as_str()))
                        }
                        Payload::Symlink { .. } => {
                            return Err(FsError::too_many_links(target.as_str()))
                        }
                    }
                }
                None => {
                    let now = inner.now();
                    let mode = mode.map(|m| m & 0o7777).unwrap_or(DEFAULT_FILE_MODE);
                    let ino =
                        inner.insert_inode(Inode::new(Payload::File { blob: digest }, mode, now));
                    inner.link_into(parent_ino, &name, ino, now);
                    Applied::Created
                }
            };
            (applied, target)
        };

        let (event, old_refs) = match applied {
            Applied::Created => (ChangeKind::Created, None),
            Applied::Replaced { old, refs } => (ChangeKind::Modified, Some((old, refs))),
        };

        if let Some((old, refs)) = old_refs {
            // The new blob needs one reference per name (and handle set); `put` granted one.
            for _ in 1..refs {
                self.state
                    .store
                    .add_ref(digest.hash)
                    .await
                    .map_err(|e| store_failure(&e))?;
            }
            for _ in 0..refs {
                self.state
                    .store
                    .release_ref(old.hash)
                    .await
                    .map_err(|e| store_failure(&e))?;
            }
        }

        let tier = self
            .state
            .store
            .get_tier(digest.hash)
            .await
            .unwrap_or(Tier::Hot);
        self.emit(event, &path);
        Ok(WriteOutcome {
            bytes_written: digest.size_bytes,
            tier,
        })
    }

    /// `bind_blob`, releasing the caller's blob reference if the binding fails so that a
    /// rejected write never leaks a reference.
    async fn bind_or_release(
        &self,
        path: &CanonicalPath,
        digest: Digest,
        mode: Option<u32>,
    ) -> Result<WriteOutcome, FsError> {
        match self.bind_blob(path, digest, mode).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let _ = self.state.store.release_ref(digest.hash).await;
                Err(e)
            }
        }
    }

    /// Re-points an already-resolved file inode at a new blob, fixing up references. Used by
    /// handle writes, truncation, and open(O_TRUNC).
    async fn replace_blob(
        &self,
        ino: Ino,
        digest: Digest,
        path: &CanonicalPath,
    ) -> Result<(), FsError> {
        let (old, refs) = {
            let mut inner = self.state.inner.lock();
            let now = inner.now();
            let node = inner.inode_mut(ino)?;
            match &mut node.payload {
                Payload::File { blob } => {
                    let old = *blob;
                    *blob = digest;
                    node.mtime = now;
                    node.ctime = now;
                    (old, node.nlink())
                }
                _ => return Err(FsError::is_a_directory(path.as_str())),
            }
        };
        for _ in 1..refs {
            self.state
                .store
                .add_ref(digest.hash)
                .await
                .map_err(|e| store_failure(&e))?;
        }
        for _ in 0..refs {
            self.state
                .store
                .release_ref(old.hash)
                .await
                .map_err(|e| store_failure(&e))?;
        }
        Ok(())
    }

    async fn apply_releases(&self, releases: Vec<Fingerprint>) -> Result<(), FsError> {
        for fingerprint in releases {
            self.state
                .store
                .release_ref(fingerprint)
                .await
                .map_err(|e| store_failure(&e))?;
        }
        Ok(())
    }
}

fn store_failure(message: &str) -> FsError {
    FsError::without_path(ErrorKind::NoSpace).with_message(format!("blob store: {message}"))
}

impl Inner {
    /// A monotone clock: explicit updates excepted, no timestamp ever moves backwards.
    fn now(&mut self) -> SystemTime {
        let mut now = SystemTime::now();
        if now <= self.last_timestamp {
            now = self.last_timestamp + Duration::from_nanos(100);
        }
        self.last_timestamp = now;
        now
    }

    fn inode(&self, ino: Ino) -> Result<&Inode, FsError> {
        self.inodes.get(&ino).ok_or_else(|| {
            FsError::without_path(ErrorKind::NotFound).with_message(format!("stale inode {ino}"))
        })
    }

    fn inode_mut(&mut self, ino: Ino) -> Result<&mut Inode, FsError> {
        self.inodes.get_mut(&ino).ok_or_else(|| {
            FsError::without_path(ErrorKind::NotFound).with_message(format!("stale inode {ino}"))
        })
    }

    fn handle(&self, fd: u32) -> Result<&Handle, FsError> {
        self.handles.get(&fd).ok_or_else(FsError::bad_descriptor)
    }

    fn insert_inode(&mut self, inode: Inode) -> Ino {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, inode);
        ino
    }

    /// Adds a directory entry and bumps the child's link count.
    fn link_into(&mut self, parent: Ino, name: &str, child: Ino, now: SystemTime) {
        if let Some(Payload::Directory { children }) =
            self.inodes.get_mut(&parent).map(|n| &mut n.payload)
        {
            children.insert(name.to_string(), child);
        }
        if let Some(node) = self.inodes.get_mut(&child) {
            node.link_count += 1;
        }
        if let Some(parent_node) = self.inodes.get_mut(&parent) {
            parent_node.mtime = now;
            parent_node.ctime = now;
        }
    }

    fn drop_link(&mut self, ino: Ino) {
        if let Some(node) = self.inodes.get_mut(&ino) {
            node.link_count = node.link_count.saturating_sub(1);
            if node.link_count == 0 && node.open_handles == 0 {
                self.inodes.remove(&ino);
            }
        }
    }

    ///
    /// Removes one directory entry, returning the blob references to release. The child inode
    /// survives while handles are open on it.
    ///
    fn remove_entry(
        &mut self,
        parent: Ino,
        name: &str,
        child: Ino,
    ) -> Result<Vec<Fingerprint>, FsError> {
        let now = self.now();
        if let Some(Payload::Directory { children }) =
            self.inodes.get_mut(&parent).map(|n| &mut n.payload)
        {
            children.remove(name);
        }
        if let Some(parent_node) = self.inodes.get_mut(&parent) {
            parent_node.mtime = now;
            parent_node.ctime = now;
        }
        let mut releases = Vec::new();
        if let Some(node) = self.inodes.get_mut(&child) {
            if let Payload::File { blob } = &node.payload {
                releases.push(blob.hash);
            }
            node.ctime = now;
        }
        self.drop_link(child);
        Ok(releases)
    }

    fn create_dir(&mut self, path: &CanonicalPath, mode: u32) -> Result<(), FsError> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        let now = self.now();
        let ino = self.insert_inode(Inode::new(
            Payload::Directory {
                children: BTreeMap::new(),
            },
            mode,
            now,
        ));
        self.link_into(parent_ino, &name, ino, now);
        Ok(())
    }

    fn dir_children(
        &self,
        ino: Ino,
        path: &CanonicalPath,
    ) -> Result<&BTreeMap<String, Ino>, FsError> {
        match &self.inode(ino)?.payload {
            Payload::Directory { children } => Ok(children),
            _ => Err(FsError::not_a_directory(path.as_str())),
        }
    }

    fn dir_children_of(&self, ino: Ino) -> Option<&BTreeMap<String, Ino>> {
        match self.inodes.get(&ino).map(|n| &n.payload) {
            Some(Payload::Directory { children }) => Some(children),
            _ => None,
        }
    }

    fn dir_children_mut(&mut self, ino: Ino) -> &mut BTreeMap<String, Ino> {
        match self.inodes.get_mut(&ino).map(|n| &mut n.payload) {
            Some(Payload::Directory { children }) => children,
            // Callers verify the ino names a directory before taking the mutable borrow.
            _ => unreachable!("dir_children_mut on non-directory inode {ino}"),
        }
    }

    fn child(&self, parent: Ino, name: &str, path: &CanonicalPath) -> Result<Ino, FsError> {
        self.dir_children(parent, path)?
            .get(name)
            .copied()
            .ok_or_else(|| FsError::not_found(path.as_str()))
    }

    ///
    /// Expands a trailing symlink chain for a write-like operation: writing through a symlink
    /// lands on its target, and writing through a dangling symlink creates the target. The
    /// returned path names a non-symlink entry or a nonexistent one.
    ///
    fn resolve_for_write(&self, path: &CanonicalPath) -> Result<CanonicalPath, FsError> {
        let mut current = path.clone();
        for _ in 0..MAX_LINK_HOPS {
            if current.is_root() {
                return Ok(current);
            }
            let parent = current
                .parent()
                .ok_or_else(|| FsError::not_permitted("/"))?;
            let name = match current.file_name() {
                Some(name) => name.to_string(),
                None => return Ok(current),
            };
            let parent_resolved = self.resolve(&parent, true)?;
            let children = self.dir_children(parent_resolved.ino, &parent)?;
            let Some(&child_ino) = children.get(&name) else {
                return Ok(parent_resolved.path.child(&name));
            };
            match &self.inode(child_ino)?.payload {
                Payload::Symlink { target } => {
                    current = if target.starts_with('/') {
                        CanonicalPath::new(target)?
                    } else {
                        CanonicalPath::new(&format!("{}/{}", parent_resolved.path, target))?
                    };
                }
                _ => return Ok(parent_resolved.path.child(&name)),
            }
        }
        Err(FsError::too_many_links(path.as_str()))
    }

    /// Resolves the parent directory of a path, which must exist and be a directory.
    fn resolve_parent(&self, path: &CanonicalPath) -> Result<(Ino, String), FsError> {
        let parent = path
            .parent()
            .ok_or_else(|| FsError::not_permitted("/"))?;
        let name = path
            .file_name()
            .ok_or_else(|| FsError::not_permitted("/"))?
            .to_string();
        let resolved = self.resolve(&parent, true)?;
        match &self.inode(resolved.ino)?.payload {
            Payload::Directory { .. } => Ok((resolved.ino, name)),
            _ => Err(FsError::not_a_directory(parent.as_str())),
        }
    }

    ///
    /// Walks a canonical path to an inode. Symlinks in non-final components are always
    /// expanded; the final component follows only when `follow_final` is set. Expansion is
    /// bounded at [`MAX_LINK_HOPS`] hops, after which resolution fails with ELOOP rather than
    /// silently truncating the chain.
    ///
    fn resolve(&self, path: &CanonicalPath, follow_final: bool) -> Result<ResolvedPath, FsError> {
        let mut chain: Vec<(Ino, String)> = vec![(ROOT_INO, String::new())];
        let mut work: VecDeque<String> = path.segments().map(str::to_string).collect();
        let mut hops: u32 = 0;

        while let Some(segment) = work.pop_front() {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                if chain.len() > 1 {
                    chain.pop();
                }
                continue;
            }
            let (dir_ino, _) = *chain.last().expect("resolution chain never empties");
            let dir = self.inode(dir_ino)?;
            let children = match &dir.payload {
                Payload::Directory { children } => children,
                _ => return Err(FsError::not_a_directory(path.as_str())),
            };
            let child_ino = *children
                .get(&segment)
                .ok_or_else(|| FsError::not_found(path.as_str()))?;
            let child = self.inode(child_ino)?;
            let is_final = work.is_empty();
            if let Payload::Symlink { target } = &child.payload {
                if !is_final || follow_final {
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return Err(FsError::too_many_links(path.as_str()));
                    }
                    if target.starts_with('/') {
                        chain.truncate(1);
                    }
                    for part in target.split('/').rev().filter(|s| !s.is_empty()) {
                        work.push_front(part.to_string());
                    }
                    continue;
                }
            }
            chain.push((child_ino, segment));
        }

        let (ino, _) = *chain.last().expect("resolution chain never empties");
        let mut rendered = String::new();
        for (_, name) in chain.iter().skip(1) {
            rendered.push('/');
            rendered.push_str(name);
        }
        if rendered.is_empty() {
            rendered.push('/');
        }
        Ok(ResolvedPath {
            ino,
            path: CanonicalPath::new(&rendered)?,
        })
    }
}

///
/// A positional handle on an open file. Capabilities (read/write/append) are captured at open
/// time and immutable; `close` is idempotent and later operations fail with EBADF.
///
pub struct FileHandle {
    fs: MemFs,
    fd: u32,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("fd", &self.fd).finish()
    }
}

impl FileHandle {
    pub fn fd(&self) -> u32 {
        self.fd
    }

    /// Reads into `buf`. A positional read leaves the implicit position alone; otherwise the
    /// position advances by the bytes read. Short reads happen only at EOF.
    pub async fn read(&self, buf: &mut [u8], position: Option<u64>) -> Result<usize, FsError> {
        self.fs.handle_read(self.fd, buf, position).await
    }

    /// Writes `data`. In append mode the write lands at EOF regardless of `position`. Writes
    /// past EOF zero-fill the gap.
    pub async fn write(&self, data: &[u8], position: Option<u64>) -> Result<usize, FsError> {
        self.fs.handle_write(self.fd, data, position).await
    }

    pub async fn truncate(&self, len: i64) -> Result<(), FsError> {
        self.fs.handle_truncate(self.fd, len).await
    }

    pub async fn sync(&self) -> Result<(), FsError> {
        self.fs.handle_sync(self.fd).await
    }

    pub async fn datasync(&self) -> Result<(), FsError> {
        self.fs.handle_sync(self.fd).await
    }

    pub async fn close(&self) -> Result<(), FsError> {
        self.fs.handle_close(self.fd).await
    }
}
