// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fs::{ErrorKind, FileType, MemFs};
use hashing::Digest;

use crate::BranchSet;

fn fp(content: &[u8]) -> hashing::Fingerprint {
    Digest::of_bytes(content).hash
}

async fn base_with_files() -> MemFs {
    let fs = MemFs::new();
    fs.mkdir("/dir", false, None).await.unwrap();
    fs.write("/dir/base.txt", b"base content", None).await.unwrap();
    fs.write("/top.txt", b"top", None).await.unwrap();
    fs
}

#[tokio::test]
async fn branch_reads_fall_through_to_base() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"top"[..]);
    assert_eq!(
        branch.read("/dir/base.txt").await.unwrap(),
        &b"base content"[..]
    );
}

#[tokio::test]
async fn branch_writes_do_not_leak_into_the_base() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();

    branch.write("/top.txt", b"branched", None).await.unwrap();
    branch.write("/fresh.txt", b"new file", None).await.unwrap();

    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"branched"[..]);
    assert_eq!(branch.read("/fresh.txt").await.unwrap(), &b"new file"[..]);

    // The base branch is unaffected by writes in the derived branch.
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"top"[..]);
    assert!(!set.base().exists("/fresh.txt").await.unwrap());
}

#[tokio::test]
async fn dirty_entries_always_hold_a_live_reference() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/top.txt", b"branched", None).await.unwrap();

    assert_eq!(set.base().store().ref_count(fp(b"branched")).await, Some(1));
    // The base blob kept its single reference through the copy-and-supersede dance.
    assert_eq!(set.base().store().ref_count(fp(b"top")).await, Some(1));

    // Even after an orphan sweep, the branch content survives.
    set.base().store().reclaim_orphans().await.unwrap();
    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"branched"[..]);
}

#[tokio::test]
async fn commit_folds_into_the_base() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/top.txt", b"committed", None).await.unwrap();
    branch.mkdir("/made", false, None).await.unwrap();
    branch.write("/made/inner.txt", b"inner", None).await.unwrap();
    branch.unlink("/dir/base.txt").await.unwrap();

    set.commit("feature").await.unwrap();

    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"committed"[..]);
    assert_eq!(
        set.base().read("/made/inner.txt").await.unwrap(),
        &b"inner"[..]
    );
    assert!(!set.base().exists("/dir/base.txt").await.unwrap());
    // The branch is destroyed by commit.
    assert!(set.branch("feature").is_err());

    // The old base blob was released when the commit re-pointed the path.
    assert_eq!(set.base().store().ref_count(fp(b"top")).await, Some(0));
    assert_eq!(set.base().store().ref_count(fp(b"committed")).await, Some(1));
}

#[tokio::test]
async fn discard_releases_branch_blobs() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("doomed").unwrap();
    branch.write("/top.txt", b"scratch", None).await.unwrap();
    set.discard("doomed").await.unwrap();

    assert_eq!(set.base().store().ref_count(fp(b"scratch")).await, Some(0));
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"top"[..]);
    assert!(set.branch("doomed").is_err());
}

#[tokio::test]
async fn readdir_merges_dirty_and_base_entries() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/dir/added.txt", b"x", None).await.unwrap();
    branch.unlink("/dir/base.txt").await.unwrap();

    let names: Vec<String> = branch
        .readdir("/dir")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["added.txt"]);

    let base_names = set.base().readdir("/dir").await.unwrap();
    assert_eq!(base_names, vec!["base.txt"]);
}

#[tokio::test]
async fn removed_directory_hides_base_subtree() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.rmdir("/dir", true).await.unwrap();

    assert!(!branch.exists("/dir").await.unwrap());
    assert!(!branch.exists("/dir/base.txt").await.unwrap());
    assert_eq!(
        branch.read("/dir/base.txt").await.unwrap_err().kind,
        ErrorKind::NotFound
    );

    // Re-creating the directory yields an empty one, not the base view.
    branch.mkdir("/dir", false, None).await.unwrap();
    assert!(branch.readdir("/dir").await.unwrap().is_empty());
    assert!(!branch.exists("/dir/base.txt").await.unwrap());
}

#[tokio::test]
async fn commit_of_recreated_directory_replaces_base_children() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.rmdir("/dir", true).await.unwrap();
    branch.mkdir("/dir", false, None).await.unwrap();
    branch.write("/dir/only.txt", b"only", None).await.unwrap();
    set.commit("feature").await.unwrap();

    let names = set.base().readdir("/dir").await.unwrap();
    assert_eq!(names, vec!["only.txt"]);
}

#[tokio::test]
async fn append_and_truncate_operate_on_the_branch_view() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();

    branch.append("/top.txt", b"+more").await.unwrap();
    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"top+more"[..]);

    branch.truncate("/top.txt", 3).await.unwrap();
    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"top"[..]);

    assert_eq!(
        branch.truncate("/top.txt", -1).await.unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"top"[..]);
}

#[tokio::test]
async fn rename_within_a_branch() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.rename("/top.txt", "/renamed.txt").await.unwrap();

    assert!(!branch.exists("/top.txt").await.unwrap());
    assert_eq!(branch.read("/renamed.txt").await.unwrap(), &b"top"[..]);
    assert!(set.base().exists("/top.txt").await.unwrap());

    set.commit("feature").await.unwrap();
    assert!(!set.base().exists("/top.txt").await.unwrap());
    assert_eq!(set.base().read("/renamed.txt").await.unwrap(), &b"top"[..]);
}

#[tokio::test]
async fn rename_of_a_directory_carries_the_subtree() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/dir/extra.txt", b"extra", None).await.unwrap();
    branch.rename("/dir", "/moved").await.unwrap();

    assert!(!branch.exists("/dir").await.unwrap());
    assert_eq!(
        branch.read("/moved/base.txt").await.unwrap(),
        &b"base content"[..]
    );
    assert_eq!(branch.read("/moved/extra.txt").await.unwrap(), &b"extra"[..]);
}

#[tokio::test]
async fn chmod_in_branch_stays_in_branch_until_commit() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.chmod("/top.txt", 0o600).await.unwrap();

    assert_eq!(branch.stat("/top.txt").await.unwrap().mode & 0o777, 0o600);
    assert_eq!(
        set.base().stat("/top.txt").await.unwrap().mode & 0o777,
        0o644
    );

    set.commit("feature").await.unwrap();
    assert_eq!(
        set.base().stat("/top.txt").await.unwrap().mode & 0o777,
        0o600
    );
    assert_eq!(
        set.base().read("/top.txt").await.unwrap(),
        &b"top"[..]
    );
}

#[tokio::test]
async fn forked_branches_layer_and_commit_into_their_parent() {
    let set = BranchSet::new(base_with_files().await);
    let parent = set.create("parent").unwrap();
    parent.write("/top.txt", b"parent view", None).await.unwrap();

    let child = set.fork("parent", "child").unwrap();
    assert_eq!(child.read("/top.txt").await.unwrap(), &b"parent view"[..]);

    child.write("/top.txt", b"child view", None).await.unwrap();
    assert_eq!(parent.read("/top.txt").await.unwrap(), &b"parent view"[..]);

    // A parent with forked children cannot be committed or discarded.
    assert_eq!(set.commit("parent").await.unwrap_err().kind, ErrorKind::Busy);

    set.commit("child").await.unwrap();
    assert_eq!(parent.read("/top.txt").await.unwrap(), &b"child view"[..]);
    // The displaced parent blob was released.
    assert_eq!(
        set.base().store().ref_count(fp(b"parent view")).await,
        Some(0)
    );

    set.commit("parent").await.unwrap();
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"child view"[..]);
}

#[tokio::test]
async fn symlinks_created_in_a_branch() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.symlink("/top.txt", "/ln").await.unwrap();
    assert_eq!(branch.read("/ln").await.unwrap(), &b"top"[..]);
    assert!(!set.base().exists("/ln").await.unwrap());

    set.commit("feature").await.unwrap();
    assert_eq!(set.base().read("/ln").await.unwrap(), &b"top"[..]);
    assert_eq!(set.base().readlink("/ln").await.unwrap(), "/top.txt");
}

#[tokio::test]
async fn link_in_branch_shares_the_blob() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.link("/top.txt", "/hard").await.unwrap();
    assert_eq!(branch.read("/hard").await.unwrap(), &b"top"[..]);
    assert_eq!(set.base().store().ref_count(fp(b"top")).await, Some(2));

    set.discard("feature").await.unwrap();
    assert_eq!(set.base().store().ref_count(fp(b"top")).await, Some(1));
}

#[tokio::test]
async fn branch_names_are_unique_and_validated() {
    let set = BranchSet::new(MemFs::new());
    set.create("one").unwrap();
    assert_eq!(
        set.create("one").unwrap_err().kind,
        ErrorKind::AlreadyExists
    );
    assert!(set.create("bad/name").is_err());
    assert!(set.fork("missing", "x").is_err());
}

#[tokio::test]
async fn list_reports_branch_shape() {
    let set = BranchSet::new(MemFs::new());
    let a = set.create("a").unwrap();
    a.write("/f", b"x", None).await.unwrap();
    set.fork("a", "b").unwrap();

    let info = set.list();
    assert_eq!(info.len(), 2);
    assert_eq!(info[0].name, "a");
    assert_eq!(info[0].dirty_paths, 1);
    assert_eq!(info[1].parent.as_deref(), Some("a"));
}

#[tokio::test]
async fn stat_reflects_branch_state() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/top.txt", b"longer than before", None).await.unwrap();

    let meta = branch.stat("/top.txt").await.unwrap();
    assert_eq!(meta.kind, FileType::Regular);
    assert_eq!(meta.size, 18);

    branch.mkdir("/newdir", false, None).await.unwrap();
    assert!(branch.stat("/newdir").await.unwrap().is_dir());
}

#[tokio::test]
async fn changes_render_the_dirty_map_in_path_order() {
    use crate::ChangeSummary;

    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/b.txt", b"bee", None).await.unwrap();
    branch.mkdir("/a-dir", false, None).await.unwrap();
    branch.unlink("/top.txt").await.unwrap();

    let changes = branch.changes().unwrap();
    let paths: Vec<&str> = changes.iter().map(|c| c.path()).collect();
    assert_eq!(paths, vec!["/a-dir", "/b.txt", "/top.txt"]);
    assert!(matches!(
        changes[0],
        ChangeSummary::DirectoryAdded { .. }
    ));
    assert!(matches!(
        changes[1],
        ChangeSummary::Written { size: 3, .. }
    ));
    assert!(matches!(changes[2], ChangeSummary::Removed { .. }));

    // Epochs are monotone in the order the writes happened.
    let epochs: Vec<u64> = changes
        .iter()
        .map(|c| match c {
            ChangeSummary::Written { epoch, .. }
            | ChangeSummary::DirectoryAdded { epoch, .. }
            | ChangeSummary::SymlinkAdded { epoch, .. }
            | ChangeSummary::Removed { epoch, .. } => *epoch,
        })
        .collect();
    assert!(epochs[1] < epochs[0] && epochs[0] < epochs[2]);
}

#[tokio::test]
async fn rewrites_supersede_within_the_branch() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/f", b"first", None).await.unwrap();
    branch.write("/f", b"second", None).await.unwrap();

    assert_eq!(branch.read("/f").await.unwrap(), &b"second"[..]);
    // The superseded blob lost its branch reference.
    assert_eq!(set.base().store().ref_count(fp(b"first")).await, Some(0));
    assert_eq!(set.base().store().ref_count(fp(b"second")).await, Some(1));
}

#[tokio::test]
async fn branch_mode_survives_rewrite() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.write("/f", b"v1", Some(0o700)).await.unwrap();
    branch.write("/f", b"v2", None).await.unwrap();
    assert_eq!(branch.stat("/f").await.unwrap().mode & 0o777, 0o700);

    set.commit("feature").await.unwrap();
    assert_eq!(set.base().stat("/f").await.unwrap().mode & 0o777, 0o700);
}

#[tokio::test]
async fn utimes_in_branch_folds_on_commit() {
    use std::time::{Duration, SystemTime};

    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_millis(1_600_000_000_000);
    branch.utimes("/top.txt", stamp, stamp).await.unwrap();

    assert_eq!(branch.stat("/top.txt").await.unwrap().mtime, stamp);
    assert_ne!(set.base().stat("/top.txt").await.unwrap().mtime, stamp);

    set.commit("feature").await.unwrap();
    assert_eq!(set.base().stat("/top.txt").await.unwrap().mtime, stamp);
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"top"[..]);
}

#[tokio::test]
async fn unlink_then_rewrite_recreates_the_path() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.unlink("/top.txt").await.unwrap();
    assert!(!branch.exists("/top.txt").await.unwrap());

    branch.write("/top.txt", b"reborn", None).await.unwrap();
    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"reborn"[..]);

    set.commit("feature").await.unwrap();
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"reborn"[..]);
}

#[tokio::test]
async fn mkdir_in_branch_requires_an_effective_parent() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    assert_eq!(
        branch
            .mkdir("/nowhere/deep", false, None)
            .await
            .unwrap_err()
            .kind,
        ErrorKind::NotFound
    );
    branch.mkdir("/nowhere/deep", true, None).await.unwrap();
    assert!(branch.stat("/nowhere/deep").await.unwrap().is_dir());
}

#[tokio::test]
async fn stat_follows_symlinks_and_lstat_does_not() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();

    // A branch-created symlink resolves like any other for stat.
    branch.symlink("/top.txt", "/branch-ln").await.unwrap();
    let followed = branch.stat("/branch-ln").await.unwrap();
    assert_eq!(followed.kind, FileType::Regular);
    assert_eq!(followed.size, 3);
    let link_itself = branch.lstat("/branch-ln").await.unwrap();
    assert_eq!(link_itself.kind, FileType::Symlink);

    // A base-backed symlink behaves identically through the branch view.
    set.base().symlink("/top.txt", "/base-ln").await.unwrap();
    assert_eq!(
        branch.stat("/base-ln").await.unwrap().kind,
        FileType::Regular
    );
    assert_eq!(
        branch.lstat("/base-ln").await.unwrap().kind,
        FileType::Symlink
    );
}

#[tokio::test]
async fn stat_through_a_symlink_loop_is_eloop() {
    let set = BranchSet::new(MemFs::new());
    let branch = set.create("feature").unwrap();
    branch.symlink("/b", "/a").await.unwrap();
    branch.symlink("/a", "/b").await.unwrap();
    assert_eq!(
        branch.stat("/a").await.unwrap_err().kind,
        ErrorKind::TooManyLinks
    );
}

#[tokio::test]
async fn branch_write_through_base_symlink_lands_on_target() {
    let set = BranchSet::new(base_with_files().await);
    set.base().symlink("/top.txt", "/ln").await.unwrap();
    let branch = set.create("feature").unwrap();

    branch.write("/ln", b"via link", None).await.unwrap();

    // The branch sees the new content at both names; the link survives.
    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"via link"[..]);
    assert_eq!(branch.read("/ln").await.unwrap(), &b"via link"[..]);
    assert_eq!(branch.lstat("/ln").await.unwrap().kind, FileType::Symlink);
    // The base is untouched until commit.
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"top"[..]);

    set.commit("feature").await.unwrap();
    assert_eq!(set.base().read("/top.txt").await.unwrap(), &b"via link"[..]);
    assert_eq!(set.base().readlink("/ln").await.unwrap(), "/top.txt");
}

#[tokio::test]
async fn branch_write_through_branch_symlink_lands_on_target() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.symlink("/top.txt", "/bln").await.unwrap();

    branch.write("/bln", b"patched", None).await.unwrap();
    assert_eq!(branch.read("/top.txt").await.unwrap(), &b"patched"[..]);
    assert_eq!(branch.lstat("/bln").await.unwrap().kind, FileType::Symlink);
}

#[tokio::test]
async fn branch_write_through_dangling_symlink_creates_target() {
    let set = BranchSet::new(base_with_files().await);
    let branch = set.create("feature").unwrap();
    branch.symlink("/materialized", "/dangling").await.unwrap();

    branch.write("/dangling", b"now real", None).await.unwrap();
    assert_eq!(branch.read("/materialized").await.unwrap(), &b"now real"[..]);
    assert_eq!(
        branch.lstat("/dangling").await.unwrap().kind,
        FileType::Symlink
    );
}
