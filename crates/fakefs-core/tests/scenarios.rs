// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end behavior of the engine through its public API.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;

use fakefs_core::{
    FsConfig, FsCore, FsErrorKind, NewFile, OpenOptions, OpenTarget, OsFlavor, PathSyntax,
};
use fakefs_logging::{capture_logs, Level, LogFormat};

fn posix() -> FsCore {
    FsCore::new(FsConfig::default()).expect("Failed to create filesystem")
}

fn windows() -> FsCore {
    FsCore::new(FsConfig::for_flavor(OsFlavor::Windows)).expect("Failed to create filesystem")
}

fn contents(fs: &FsCore, path: &str) -> Vec<u8> {
    fs.get_entry(path).expect("entry exists").contents().unwrap_or_default().to_vec()
}

/// Every (path, lstat) reachable from `top` without following symlinks.
fn all_entries(fs: &FsCore, top: &str) -> Vec<(String, fakefs_core::StatResult)> {
    let mut out = Vec::new();
    let mut pending = vec![top.to_string()];
    while let Some(dir) = pending.pop() {
        for entry in fs.scandir(&dir).expect("scandir") {
            if entry.lstat.is_dir() {
                pending.push(entry.path.clone());
            }
            out.push((entry.path, entry.lstat));
        }
    }
    out
}

fn assert_nlink_invariant(fs: &FsCore) {
    let entries = all_entries(fs, "/");
    let mut references: HashMap<u64, u64> = HashMap::new();
    for (_, stat) in &entries {
        *references.entry(stat.st_ino).or_default() += 1;
    }
    for (path, stat) in &entries {
        let expected = if stat.is_dir() {
            let subdirs = fs
                .scandir(path)
                .expect("scandir")
                .iter()
                .filter(|e| e.lstat.is_dir())
                .count() as u64;
            2 + subdirs
        } else {
            references[&stat.st_ino]
        };
        assert_eq!(stat.st_nlink, expected, "nlink of {path}");
    }
}

fn assert_used_size_invariant(fs: &FsCore) {
    for mount in fs.mount_points() {
        let mut seen = HashSet::new();
        let used: u64 = all_entries(fs, "/")
            .into_iter()
            .filter(|(_, stat)| !stat.is_dir() && stat.st_dev == mount.device_id)
            .filter(|(_, stat)| seen.insert(stat.st_ino))
            .map(|(_, stat)| stat.st_size)
            .sum();
        assert_eq!(mount.used_size, used, "used size of {}", mount.path);
    }
}

#[test]
fn scenario_a_create_directory_makes_ancestors() {
    let mut fs = posix();
    fs.create_directory("/a/b/c", 0o777).expect("create_directory");
    let leaf = fs.get_entry("/a/b/c").expect("leaf");
    assert!(leaf.is_dir());
    assert_eq!(leaf.name(), "c");
    assert!(fs.exists("/a/b").expect("exists"));
}

#[test]
fn scenario_b_set_size_truncates_and_pads() {
    let mut fs = posix();
    fs.create_file("/foo", NewFile::with_contents(b"dummy_file".to_vec())).expect("file");
    fs.set_size("/foo", 0).expect("shrink");
    assert_eq!(contents(&fs, "/foo"), b"");
    fs.set_contents("/foo", b"dummy_file".to_vec()).expect("refill");
    fs.set_size("/foo", 13).expect("grow");
    assert_eq!(contents(&fs, "/foo"), b"dummy_file\0\0\0");
}

#[test]
fn scenario_c_append_and_read_handles_stay_in_sync() {
    let mut fs = posix();
    fs.create_file("/log", NewFile::default()).expect("file");
    let writer = fs.open(OpenTarget::Path("/log"), &OpenOptions::new("a")).expect("append");
    let reader = fs.open(OpenTarget::Path("/log"), &OpenOptions::new("r")).expect("read");

    fs.write(writer, b"hello").expect("write");
    fs.flush(writer).expect("flush");
    assert_eq!(fs.read(reader, None).expect("read"), b"hello");

    fs.write(writer, b"world\n").expect("write");
    fs.flush(writer).expect("flush");
    assert_eq!(fs.read(reader, None).expect("read"), b"world\n");
}

#[test]
fn scenario_d_rename_directory_onto_directory() {
    for mut fs in [posix(), windows()] {
        let base = if fs.config().os_flavor.is_windows() { "C:\\foo" } else { "/foo" };
        let sep = fs.syntax().sep_str();
        let bar = format!("{base}{sep}bar");
        let baz = format!("{base}{sep}baz");
        fs.create_directory(&bar, 0o777).expect("bar");
        fs.create_directory(&baz, 0o777).expect("baz");
        let err = fs.rename(&bar, &baz, false).expect_err("destination exists");
        assert_eq!(err.kind(), FsErrorKind::AlreadyExists);
        assert!(fs.exists(&bar).expect("exists"));
    }
}

#[test]
fn scenario_e_disk_usage_follows_create_and_remove() {
    let mut fs = FsCore::new(FsConfig::default().with_total_size(100)).expect("fs");
    fs.create_file("/foo/bar", NewFile::with_contents(b"xyzzy".to_vec())).expect("file");
    let usage = fs.get_disk_usage(None).expect("usage");
    assert_eq!((usage.total, usage.used, usage.free), (100, 5, 95));
    fs.remove("/foo/bar").expect("remove");
    let usage = fs.get_disk_usage(None).expect("usage");
    assert_eq!((usage.total, usage.used, usage.free), (100, 0, 100));
}

#[test]
fn scenario_f_case_folding_depends_on_flavor() {
    let mut insensitive = FsCore::new(FsConfig::for_flavor(OsFlavor::MacOs)).expect("fs");
    insensitive.create_directory("/Foo/Bar", 0o777).expect("mkdir");
    let original = insensitive.get_entry("/Foo/Bar").expect("entry").stat().ino;
    let folded = insensitive.get_entry("/foo/bar").expect("folded lookup").stat().ino;
    assert_eq!(original, folded);
    assert_eq!(insensitive.get_entry("/foo/bar").expect("entry").name(), "Bar");

    let mut sensitive = posix();
    sensitive.create_directory("/Foo/Bar", 0o777).expect("mkdir");
    let err = sensitive.get_entry("/foo/bar").expect_err("different case");
    assert_eq!(err.kind(), FsErrorKind::NotFound);
}

#[test]
fn collapse_is_idempotent_and_agrees_with_join() {
    let syntax = PathSyntax::posix();
    let samples: [&[&str]; 5] = [
        &["a", "b", "c"],
        &["/a/", "../b", "./c"],
        &["a", "..", "..", "c"],
        &["/", "x//y", "z/."],
        &["a", "/abs", "tail"],
    ];
    for parts in samples {
        let joined = syntax.join(parts);
        let manual = parts.join("/");
        let manual = match parts.iter().rposition(|p| p.starts_with('/')) {
            Some(last_abs) => parts[last_abs..].join("/"),
            None => manual,
        };
        assert_eq!(syntax.collapse(&joined), syntax.collapse(&manual), "{parts:?}");
        let once = syntax.collapse(&joined);
        assert_eq!(syntax.collapse(&once), once);
    }
    for path in ["", ".", "..", "/..", "//", "a/../..", "/a/./b/../c/"] {
        let once = syntax.collapse(path);
        assert_eq!(syntax.collapse(&once), once, "{path:?}");
    }
}

#[test]
fn nlink_and_used_size_invariants_hold_through_mutations() {
    let mut fs = FsCore::new(FsConfig::default().with_total_size(1_000)).expect("fs");
    fs.create_file("/d/one", NewFile::with_contents(b"12345".to_vec())).expect("one");
    fs.create_file("/d/sub/two", NewFile::with_contents(b"abc".to_vec())).expect("two");
    fs.create_hardlink("/d/one", "/d/sub/one-again").expect("hardlink");
    fs.create_hardlink("/d/one", "/top-level").expect("hardlink");
    fs.create_symlink("/d/link", "/d/sub/two").expect("symlink");
    fs.create_directory("/d/empty/inner", 0o777).expect("dirs");
    fs.add_mount_point("/mnt", Some(100), false).expect("mount");
    fs.create_file("/mnt/x", NewFile::with_contents(b"on another device".to_vec())).expect("x");
    assert_nlink_invariant(&fs);
    assert_used_size_invariant(&fs);

    fs.remove("/d/one").expect("remove one name");
    fs.rename("/d/sub", "/d/moved", false).expect("rename dir");
    fs.rmdir("/d/empty/inner").expect("rmdir");
    fs.set_size("/d/moved/two", 40).expect("grow");
    assert_nlink_invariant(&fs);
    assert_used_size_invariant(&fs);

    fs.remove_object("/d").expect("remove tree");
    assert_nlink_invariant(&fs);
    assert_used_size_invariant(&fs);
    assert_eq!(fs.stat("/top-level", false).expect("stat").st_nlink, 1);
}

#[test]
fn symlink_depth_boundary() {
    let mut fs = posix();
    // 21 links in a ring: resolution gives up
    for i in 0..21 {
        fs.create_symlink(&format!("/ring{i}"), &format!("/ring{}", (i + 1) % 21)).expect("link");
    }
    let err = fs.resolve("/ring0", true).expect_err("cycle");
    assert_eq!(err.kind(), FsErrorKind::TooManyLinks);

    fs.create_file("/target", NewFile::with_contents(b"end".to_vec())).expect("target");
    fs.create_symlink("/chain18", "/target").expect("link");
    for i in (0..18).rev() {
        fs.create_symlink(&format!("/chain{i}"), &format!("/chain{}", i + 1)).expect("link");
    }
    // chain0 .. chain18 are 19 links
    assert_eq!(contents(&fs, "/chain0"), b"end");
}

#[test]
fn set_size_rejects_bad_sizes_without_side_effects() {
    let mut fs = FsCore::new(FsConfig::default().with_total_size(10)).expect("fs");
    fs.create_file("/f", NewFile::with_contents(b"abcd".to_vec())).expect("file");

    let err = fs.set_size("/f", -1).expect_err("negative");
    assert_eq!(err.kind(), FsErrorKind::InvalidArgument);
    let err = fs.set_size("/f", 11).expect_err("beyond capacity");
    assert_eq!(err.kind(), FsErrorKind::NoSpace);
    assert_eq!(contents(&fs, "/f"), b"abcd");
    assert_eq!(fs.get_disk_usage(None).expect("usage").used, 4);

    fs.set_size("/f", 10).expect("exactly full");
    assert_eq!(fs.get_disk_usage(None).expect("usage").free, 0);
    let err = fs.create_file("/declared", NewFile::with_size(-5)).expect_err("negative declared size");
    assert_eq!(err.kind(), FsErrorKind::InvalidArgument);
}

#[test]
fn rename_onto_existing_file_per_flavor() {
    let mut fs = posix();
    fs.create_file("/src", NewFile::with_contents(b"new".to_vec())).expect("src");
    fs.create_file("/dst", NewFile::with_contents(b"old".to_vec())).expect("dst");
    fs.rename("/src", "/dst", false).expect("posix replaces");
    assert_eq!(contents(&fs, "/dst"), b"new");
    assert!(!fs.exists("/src").expect("exists"));

    let mut win = windows();
    win.create_file("C:\\src", NewFile::with_contents(b"new".to_vec())).expect("src");
    win.create_file("C:\\dst", NewFile::with_contents(b"old".to_vec())).expect("dst");
    let err = win.rename("C:\\src", "C:\\dst", false).expect_err("windows refuses");
    assert_eq!(err.kind(), FsErrorKind::AlreadyExists);
    win.rename("C:\\src", "C:\\dst", true).expect("forced replace");
    assert_eq!(contents(&win, "C:\\dst"), b"new");
}

#[test]
fn hardlinked_large_file_is_size_only() {
    let mut fs = FsCore::new(FsConfig::default().with_total_size(1 << 20)).expect("fs");
    fs.create_file("/big", NewFile::with_size(4096)).expect("declared");
    fs.create_hardlink("/big", "/big-alias").expect("hardlink");
    assert_eq!(fs.stat("/big-alias", true).expect("stat").st_size, 4096);
    assert_eq!(fs.get_disk_usage(None).expect("usage").used, 4096);
    fs.rename("/big-alias", "/renamed", false).expect("rename");
    assert_eq!(fs.stat("/renamed", true).expect("stat").st_nlink, 2);
    assert!(fs.get_entry("/renamed").expect("entry").is_large_file());
    fs.remove("/big").expect("remove");
    fs.remove("/renamed").expect("remove");
    assert_eq!(fs.get_disk_usage(None).expect("usage").used, 0);
}

#[test]
fn no_space_through_symlink_leaves_tree_unchanged() {
    let mut fs = posix();
    fs.add_mount_point("/mnt", Some(8), false).expect("mount");
    fs.create_symlink("/link", "/mnt").expect("link");

    let err = fs
        .create_file("/link/sub/f", NewFile::with_contents(b"123456789".to_vec()))
        .expect_err("does not fit the small mount");
    assert_eq!(err.kind(), FsErrorKind::NoSpace);
    assert!(!fs.exists("/mnt/sub").expect("exists"));
    assert!(fs.listdir("/mnt").expect("listdir").is_empty());
    assert_used_size_invariant(&fs);

    fs.create_file("/link/sub/f", NewFile::with_contents(b"12345678".to_vec())).expect("fits exactly");
    let mount = fs.mount_points().into_iter().find(|m| m.path == "/mnt").expect("mount");
    assert_eq!(mount.used_size, 8);
    assert_used_size_invariant(&fs);
}

#[test]
fn growing_truncate_moves_append_read_cursors() {
    let mut fs = posix();
    fs.create_file("/f", NewFile::with_contents(b"abc".to_vec())).expect("file");
    let appender = fs.open(OpenTarget::Path("/f"), &OpenOptions::new("a+")).expect("append");
    fs.seek(appender, SeekFrom::Start(1)).expect("seek");
    let writer = fs.open(OpenTarget::Path("/f"), &OpenOptions::new("r+")).expect("update");

    assert_eq!(fs.truncate(writer, Some(6)).expect("grow"), 6);
    assert_eq!(contents(&fs, "/f"), b"abc\0\0\0");
    assert_eq!(fs.tell(appender).expect("tell"), 4);
    assert_eq!(fs.read(appender, None).expect("read"), vec![0, 0]);
}

#[test]
fn removed_entry_stays_open_until_closed() {
    let mut fs = posix();
    fs.create_file("/gone", NewFile::with_contents(b"payload".to_vec())).expect("file");
    let handle = fs.open(OpenTarget::Path("/gone"), &OpenOptions::new("rb")).expect("open");
    let fd = fs.fileno(handle).expect("fd");
    let id = fs.resolve("/gone", true).expect("node");

    fs.remove("/gone").expect("remove while open");
    assert!(!fs.lexists("/gone").expect("lexists"));
    assert_eq!(fs.fstat(fd).expect("fstat").st_nlink, 0);
    assert_eq!(fs.read(handle, Some(3)).expect("read"), b"pay");
    assert_eq!(fs.read(handle, None).expect("read"), b"load");
    assert_eq!(fs.node_size(id).expect("still allocated"), 7);

    fs.close(handle).expect("close");
    assert!(fs.node_size(id).is_err(), "node reaped after close");
    assert_used_size_invariant(&fs);
}

#[test]
fn windows_open_file_cannot_be_removed() {
    let mut fs = windows();
    fs.create_file("C:\\busy.txt", NewFile::default()).expect("file");
    let handle = fs.open(OpenTarget::Path("C:\\busy.txt"), &OpenOptions::new("r")).expect("open");
    let err = fs.remove("C:\\busy.txt").expect_err("open on windows");
    assert_eq!(err.kind(), FsErrorKind::PermissionDenied);
    fs.close(handle).expect("close");
    fs.remove("C:\\busy.txt").expect("removable once closed");
}

#[test]
fn tree_mutations_are_logged() {
    let (result, output) = capture_logs(Level::DEBUG, LogFormat::Plaintext, || {
        let mut fs = posix();
        fs.create_file("/a", NewFile::default())?;
        fs.rename("/a", "/b", false)?;
        fs.add_mount_point("/mnt", None, false).map(|_| ())
    });
    result.expect("operations succeed");
    assert!(output.contains("renamed entry"), "{output}");
    assert!(output.contains("mounted"), "{output}");
}
