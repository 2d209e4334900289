use flate2::{write::GzEncoder, Compression};
use sample_loader::{ExtractError, ExtractMode, Extractor};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tar::{EntryType, Header};

struct Member<'a> {
    name: &'a [u8],
    kind: EntryType,
    link: &'a [u8],
    data: &'a [u8],
}

impl<'a> Member<'a> {
    fn file(name: &'a str, data: &'a str) -> Self {
        Member {
            name: name.as_bytes(),
            kind: EntryType::Regular,
            link: b"",
            data: data.as_bytes(),
        }
    }

    fn symlink(name: &'a str, target: &'a str) -> Self {
        Member {
            name: name.as_bytes(),
            kind: EntryType::Symlink,
            link: target.as_bytes(),
            data: b"",
        }
    }
}

/// Builds a tar stream writing names verbatim, so that hostile names the
/// tar builder would refuse can be produced.
fn tar_bytes(members: &[Member<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for m in members {
        let mut header = Header::new_gnu();
        header.set_entry_type(m.kind);
        header.set_size(m.data.len() as u64);
        header.set_mode(if m.kind.is_dir() { 0o755 } else { 0o644 });
        header.set_mtime(1_456_304_492);
        {
            let old = header.as_old_mut();
            old.name[..m.name.len()].copy_from_slice(m.name);
            old.linkname[..m.link.len()].copy_from_slice(m.link);
        }
        header.set_cksum();
        builder.append(&header, m.data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

struct Fixture {
    root: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("tmp")).unwrap();
        fs::create_dir(root.path().join("corpus")).unwrap();
        Fixture { root }
    }

    fn extractor(&self) -> Extractor {
        Extractor::with_temp_root(self.tmp())
    }

    fn tmp(&self) -> PathBuf {
        self.root.path().join("tmp")
    }

    fn sample(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.root.path().join("corpus").join(name);
        fs::write(&path, data).unwrap();
        path
    }

    fn tmp_is_empty(&self) -> bool {
        fs::read_dir(self.tmp()).unwrap().next().is_none()
    }
}

fn list(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn tar_submission_is_unpacked_and_cleaned_up() {
    let fx = Fixture::new();
    let tar = tar_bytes(&[
        Member {
            name: b"./",
            kind: EntryType::Directory,
            link: b"",
            data: b"",
        },
        Member::file("main.tex", "\\documentclass{article}"),
        Member::file("figs/plot.eps", "%!PS"),
        Member::symlink("alias.tex", "main.tex"),
    ]);
    let sample = fx.sample("1501.00001.gz", &gzip(&tar));

    let ws = fx.extractor().extract(&sample, ExtractMode::Auto).unwrap();
    assert_eq!(list(ws.path()), ["alias.tex", "figs", "main.tex"]);
    assert_eq!(
        fs::read_to_string(ws.path().join("figs/plot.eps")).unwrap(),
        "%!PS"
    );
    let ws_path = ws.path().to_path_buf();
    drop(ws);
    assert!(!ws_path.exists());
    assert!(fx.tmp_is_empty());
}

#[test]
fn flat_submission_keeps_single_file() {
    let fx = Fixture::new();
    let sample = fx.sample("1501.00002.gz", &gzip(b"\\documentclass{article}\n"));
    let ws = fx.extractor().extract(&sample, ExtractMode::Auto).unwrap();
    assert_eq!(list(ws.path()), ["1501.00002"]);
    ws.close().unwrap();
    assert!(fx.tmp_is_empty());
}

#[test]
fn flat_mode_does_not_unpack() {
    let fx = Fixture::new();
    let tar = tar_bytes(&[Member::file("main.tex", "x")]);
    let sample = fx.sample("3.gz", &gzip(&tar));
    let ws = fx.extractor().extract(&sample, ExtractMode::Flat).unwrap();
    assert_eq!(list(ws.path()), ["3"]);
}

#[test]
fn tar_mode_requires_tar_content() {
    let fx = Fixture::new();
    let sample = fx.sample("4.gz", &gzip(b"plain text"));
    let err = fx.extractor().extract(&sample, ExtractMode::Tar).unwrap_err();
    assert!(matches!(err, ExtractError::Format { .. }), "{:?}", err);
    assert!(fx.tmp_is_empty());
}

#[test]
fn non_gzip_sample_is_rejected_by_content() {
    let fx = Fixture::new();
    // the name says gzip, the content does not
    let sample = fx.sample("5.gz", b"\\documentclass{article}");
    let err = fx.extractor().extract(&sample, ExtractMode::Auto).unwrap_err();
    match err {
        ExtractError::Format { found, .. } => assert_eq!(found, "text/x-tex"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(fx.tmp_is_empty());
}

fn assert_traversal(members: &[Member<'_>]) {
    let fx = Fixture::new();
    let sample = fx.sample("evil.gz", &gzip(&tar_bytes(members)));
    let err = fx.extractor().extract(&sample, ExtractMode::Auto).unwrap_err();
    assert!(
        matches!(err, ExtractError::PathTraversal { .. }),
        "expected traversal error, got {:?}",
        err
    );
    assert!(fx.tmp_is_empty(), "workspace left behind");
    assert_eq!(list(fx.root.path()), ["corpus", "tmp"]);
    assert_eq!(list(&fx.root.path().join("corpus")), ["evil.gz"]);
}

#[test]
fn parent_dir_members_are_rejected() {
    assert_traversal(&[
        Member::file("ok.tex", "fine"),
        Member::file("../evil.txt", "pwned"),
    ]);
    assert_traversal(&[Member::file("sub/../../evil.txt", "pwned")]);
    assert_traversal(&[Member::file("../corpus/evil.gz", "pwned")]);
}

#[test]
fn absolute_members_are_rejected() {
    assert_traversal(&[Member::file("/tmp/evil.txt", "pwned")]);
}

#[test]
fn empty_member_names_are_rejected() {
    assert_traversal(&[Member::file("", "pwned")]);
}

#[test]
fn escaping_symlinks_are_rejected() {
    assert_traversal(&[
        Member::symlink("up", ".."),
        Member::file("up/evil.txt", "pwned"),
    ]);
    assert_traversal(&[Member::symlink("etc", "/etc")]);
    assert_traversal(&[Member::symlink("a/b", "../../x")]);
}

#[test]
fn links_chained_through_earlier_symlinks_are_rejected() {
    // each target looks contained on its own, together they reach the host
    assert_traversal(&[
        Member::symlink("a/b/c/d/e/f/up", "../../../../../.."),
        Member::symlink("leak", "a/b/c/d/e/f/up/../../../../../../etc/hostname"),
    ]);
    assert_traversal(&[
        Member::symlink("a/b/c/d/e/f/up", "../../../../../.."),
        Member {
            name: b"copy",
            kind: EntryType::Link,
            link: b"a/b/c/d/e/f/up/../../../../../../etc/hostname",
            data: b"",
        },
    ]);
    assert_traversal(&[
        Member::symlink("dir", "."),
        Member::file("dir/main.tex", "\\documentclass{article}"),
    ]);
}

#[test]
fn contained_symlinks_are_kept() {
    let fx = Fixture::new();
    let tar = tar_bytes(&[
        Member::file("src/main.tex", "\\documentclass{article}"),
        Member::symlink("main.tex", "src/main.tex"),
        Member::symlink("src/self.tex", "../src/main.tex"),
    ]);
    let sample = fx.sample("links.gz", &gzip(&tar));
    let ws = fx.extractor().extract(&sample, ExtractMode::Auto).unwrap();
    let root = fs::canonicalize(ws.path()).unwrap();
    for link in &["main.tex", "src/self.tex"] {
        let resolved = fs::canonicalize(ws.path().join(link)).unwrap();
        assert_eq!(resolved, root.join("src/main.tex"));
    }
}

#[test]
fn escaping_hard_links_are_rejected() {
    assert_traversal(&[
        Member::file("main.tex", "x"),
        Member {
            name: b"copy.tex",
            kind: EntryType::Link,
            link: b"../outside",
            data: b"",
        },
    ]);
}
