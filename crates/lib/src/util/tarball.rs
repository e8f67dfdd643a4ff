//! Deterministic tarball creation and extraction.
//!
//! Archives written here are byte-for-byte reproducible: entries are sorted by
//! relative path and every header has mtime, uid, and gid zeroed with empty
//! user/group names. Modes collapse to 0755 (directories and anything
//! executable) or 0644, so the host umask never shows up in the hash. The gzip
//! header carries mtime 0 as well.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

/// Archive formats understood by [`extract`] and [`list_files`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
  Tar,
  TarGz,
}

impl ArchiveKind {
  /// Detect the format from the file name.
  pub fn detect(path: &Path) -> Option<Self> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
      Some(Self::TarGz)
    } else if name.ends_with(".tar") {
      Some(Self::Tar)
    } else {
      None
    }
  }
}

/// Write the contents of `src_dir` as a gzip-compressed tarball.
///
/// Paths inside the archive are relative to `src_dir`; the directory itself is
/// not an entry.
pub fn create_tar_gz<W: Write>(src_dir: &Path, out: W) -> io::Result<W> {
  let encoder = GzBuilder::new().mtime(0).write(out, Compression::default());
  let mut builder = Builder::new(encoder);

  let mut entries: Vec<(String, PathBuf)> = Vec::new();
  for entry in WalkDir::new(src_dir).follow_links(false) {
    let entry = entry.map_err(io::Error::other)?;
    let path = entry.path();
    if path == src_dir {
      continue;
    }
    let rel = path
      .strip_prefix(src_dir)
      .unwrap_or(path)
      .to_string_lossy()
      .replace('\\', "/");
    entries.push((rel, path.to_path_buf()));
  }
  entries.sort_by(|a, b| a.0.cmp(&b.0));

  for (rel, path) in entries {
    let md = fs::symlink_metadata(&path)?;
    let mut header = normalized_header(&md);

    if md.is_dir() {
      header.set_entry_type(EntryType::Directory);
      header.set_size(0);
      header.set_cksum();
      builder.append_data(&mut header, &rel, io::empty())?;
    } else if md.file_type().is_symlink() {
      let target = fs::read_link(&path)?;
      header.set_entry_type(EntryType::Symlink);
      header.set_size(0);
      builder.append_link(&mut header, &rel, &target).map_err(|e| {
        io::Error::new(
          e.kind(),
          format!("cannot archive symlink {rel} -> {}: {e}", target.display()),
        )
      })?;
    } else if md.is_file() {
      let mut file = File::open(&path)?;
      header.set_entry_type(EntryType::Regular);
      header.set_size(md.len());
      header.set_cksum();
      builder.append_data(&mut header, &rel, &mut file)?;
    }
    // Sockets, fifos and device nodes are never packaged.
  }

  let encoder = builder.into_inner()?;
  encoder.finish()
}

fn normalized_header(md: &fs::Metadata) -> Header {
  let mut header = Header::new_gnu();
  header.set_mtime(0);
  header.set_uid(0);
  header.set_gid(0);
  // Empty names cannot fail to encode.
  let _ = header.set_username("");
  let _ = header.set_groupname("");

  header.set_mode(if md.is_dir() || is_executable(md) { 0o755 } else { 0o644 });
  header
}

#[cfg(unix)]
fn is_executable(md: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  md.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_md: &fs::Metadata) -> bool {
  false
}

/// Extract an archive into `dest`, returning the relative paths of every
/// non-directory entry written, sorted.
///
/// Entries that would escape `dest` are skipped.
pub fn extract(archive: &Path, dest: &Path) -> io::Result<Vec<PathBuf>> {
  let file = File::open(archive)?;
  match detect_or_err(archive)? {
    ArchiveKind::TarGz => unpack(Archive::new(GzDecoder::new(file)), dest),
    ArchiveKind::Tar => unpack(Archive::new(file), dest),
  }
}

/// List the relative paths of every non-directory entry without extracting.
///
/// Uses the same path normalization as [`extract`], so the result equals the
/// set of files an extraction would create.
pub fn list_files(archive: &Path) -> io::Result<Vec<PathBuf>> {
  let file = File::open(archive)?;
  match detect_or_err(archive)? {
    ArchiveKind::TarGz => list(Archive::new(GzDecoder::new(file))),
    ArchiveKind::Tar => list(Archive::new(file)),
  }
}

fn detect_or_err(archive: &Path) -> io::Result<ArchiveKind> {
  ArchiveKind::detect(archive).ok_or_else(|| {
    io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("not a tarball: {}", archive.display()),
    )
  })
}

fn unpack<R: Read>(mut archive: Archive<R>, dest: &Path) -> io::Result<Vec<PathBuf>> {
  fs::create_dir_all(dest)?;
  archive.set_preserve_permissions(true);

  let mut files = Vec::new();
  for entry in archive.entries()? {
    let mut entry = entry?;
    let rel = normalize(&entry.path()?);
    let is_dir = entry.header().entry_type().is_dir();
    if !entry.unpack_in(dest)? {
      continue;
    }
    if let Some(rel) = rel
      && !is_dir
    {
      files.push(rel);
    }
  }

  files.sort();
  files.dedup();
  Ok(files)
}

fn list<R: Read>(mut archive: Archive<R>) -> io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  for entry in archive.entries()? {
    let entry = entry?;
    if entry.header().entry_type().is_dir() {
      continue;
    }
    if let Some(rel) = normalize(&entry.path()?) {
      files.push(rel);
    }
  }

  files.sort();
  files.dedup();
  Ok(files)
}

/// Strip `./` and leading `/`; reject paths that climb out with `..`.
fn normalize(path: &Path) -> Option<PathBuf> {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => out.push(part),
      Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
      Component::ParentDir => return None,
    }
  }
  if out.as_os_str().is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::hash_bytes;
  use tempfile::TempDir;

  fn populate(dir: &Path) {
    fs::create_dir_all(dir.join("lib")).unwrap();
    fs::create_dir_all(dir.join("include/foo")).unwrap();
    fs::write(dir.join("lib/libfoo.so"), b"\x7fELF fake").unwrap();
    fs::write(dir.join("include/foo/foo.h"), "int foo(void);").unwrap();
  }

  #[test]
  fn archive_is_reproducible() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    let first = create_tar_gz(temp.path(), Vec::new()).unwrap();
    let second = create_tar_gz(temp.path(), Vec::new()).unwrap();

    assert_eq!(hash_bytes(&first), hash_bytes(&second));
  }

  #[test]
  fn archive_ignores_mtime() {
    let a = TempDir::new().unwrap();
    populate(a.path());
    let first = create_tar_gz(a.path(), Vec::new()).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(1100));
    let b = TempDir::new().unwrap();
    populate(b.path());
    let second = create_tar_gz(b.path(), Vec::new()).unwrap();

    assert_eq!(hash_bytes(&first), hash_bytes(&second));
  }

  #[test]
  fn extract_reports_files_and_matches_listing() {
    let src = TempDir::new().unwrap();
    populate(src.path());
    let out = TempDir::new().unwrap();
    let tarball = out.path().join("pkg.tar.gz");
    create_tar_gz(src.path(), File::create(&tarball).unwrap()).unwrap();

    let dest = TempDir::new().unwrap();
    let extracted = extract(&tarball, dest.path()).unwrap();

    assert_eq!(
      extracted,
      vec![PathBuf::from("include/foo/foo.h"), PathBuf::from("lib/libfoo.so")]
    );
    assert_eq!(list_files(&tarball).unwrap(), extracted);
    assert!(dest.path().join("lib/libfoo.so").is_file());
  }

  #[test]
  #[cfg(unix)]
  fn symlinks_survive_round_trip() {
    let src = TempDir::new().unwrap();
    populate(src.path());
    std::os::unix::fs::symlink("libfoo.so", src.path().join("lib/libfoo.so.1")).unwrap();

    let out = TempDir::new().unwrap();
    let tarball = out.path().join("pkg.tar.gz");
    create_tar_gz(src.path(), File::create(&tarball).unwrap()).unwrap();

    let dest = TempDir::new().unwrap();
    extract(&tarball, dest.path()).unwrap();
    let target = fs::read_link(dest.path().join("lib/libfoo.so.1")).unwrap();
    assert_eq!(target, PathBuf::from("libfoo.so"));
  }

  #[test]
  #[cfg(unix)]
  fn host_permissions_do_not_change_the_hash() {
    use std::os::unix::fs::PermissionsExt;

    let strict = TempDir::new().unwrap();
    let loose = TempDir::new().unwrap();
    for (dir, file_mode, exec_mode) in [(strict.path(), 0o600, 0o700), (loose.path(), 0o664, 0o775)] {
      populate(dir);
      fs::write(dir.join("lib/run.sh"), "#!/bin/sh\n").unwrap();
      fs::set_permissions(dir.join("lib/libfoo.so"), fs::Permissions::from_mode(file_mode)).unwrap();
      fs::set_permissions(dir.join("lib/run.sh"), fs::Permissions::from_mode(exec_mode)).unwrap();
    }

    let first = create_tar_gz(strict.path(), Vec::new()).unwrap();
    let second = create_tar_gz(loose.path(), Vec::new()).unwrap();
    assert_eq!(hash_bytes(&first), hash_bytes(&second));

    let mut modes = Vec::new();
    for entry in Archive::new(GzDecoder::new(first.as_slice())).entries().unwrap() {
      let entry = entry.unwrap();
      modes.push((entry.path().unwrap().into_owned(), entry.header().mode().unwrap()));
    }
    assert!(modes.contains(&(PathBuf::from("lib/libfoo.so"), 0o644)));
    assert!(modes.contains(&(PathBuf::from("lib/run.sh"), 0o755)));
    assert!(modes.contains(&(PathBuf::from("lib"), 0o755)));
  }

  #[test]
  #[cfg(unix)]
  fn long_symlink_targets_are_archived() {
    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("lib")).unwrap();
    let target = format!("{}/libfoo.so", "nested".repeat(30));
    std::os::unix::fs::symlink(&target, src.path().join("lib/libfoo.so")).unwrap();

    let out = TempDir::new().unwrap();
    let tarball = out.path().join("pkg.tar.gz");
    create_tar_gz(src.path(), File::create(&tarball).unwrap()).unwrap();

    let dest = TempDir::new().unwrap();
    extract(&tarball, dest.path()).unwrap();
    assert_eq!(fs::read_link(dest.path().join("lib/libfoo.so")).unwrap(), PathBuf::from(target));
  }

  #[test]
  fn unknown_extension_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("source.zip");
    fs::write(&path, b"PK").unwrap();
    let err = extract(&path, temp.path()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
  }

  #[test]
  fn normalize_strips_dot_and_rejects_parent() {
    assert_eq!(normalize(Path::new("./lib/a.so")), Some(PathBuf::from("lib/a.so")));
    assert_eq!(normalize(Path::new("../etc/passwd")), None);
    assert_eq!(normalize(Path::new("./")), None);
  }
}
