// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Filesystem primitives for the repository layouts. Every operation
//! here is idempotent: repeating a call with the same arguments leaves
//! the tree unchanged and reports "no change".

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;

/// Create a directory and any missing parents
pub fn ensure_dir(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Place a symlink at `link` pointing to `target`.
///
/// An existing symlink with a different target is replaced. An existing
/// non-symlink is a conflict, never silently removed. Returns whether
/// the filesystem changed.
pub fn place_symlink(link: &Path, target: &Path) -> Result<bool, Error> {
    if link.symlink_metadata().is_ok_and(|m| m.is_symlink()) {
        if fs::read_link(link)? == target {
            return Ok(false);
        }
        fs::remove_file(link)?;
    } else if link.exists() {
        return Err(Error::PathConflict(link.to_owned()));
    } else if let Some(parent) = link.parent() {
        ensure_dir(parent)?;
    }

    fs::os::unix::fs::symlink(target, link)?;

    Ok(true)
}

/// Hardlink `source` to `target`.
///
/// Fails fast when the two paths live on different devices. An existing
/// `target` with a foreign inode (or a symlink) is replaced. Returns
/// whether the filesystem changed.
pub fn place_hardlink(source: &Path, target: &Path) -> Result<bool, Error> {
    if source == target {
        return Ok(false);
    }

    let source_stat = source
        .metadata()
        .map_err(|_| Error::MissingSource(source.to_owned()))?;

    let parent = target.parent().unwrap_or(Path::new("/")).to_owned();
    ensure_dir(&parent)?;

    if target.symlink_metadata().is_ok_and(|m| m.is_symlink()) {
        fs::remove_file(target)?;
    }

    let target_dev = match target.metadata() {
        Ok(stat) => {
            if stat.ino() != source_stat.ino() {
                fs::remove_file(target)?;
            }
            stat.dev()
        }
        Err(_) => parent.metadata().map(|m| m.dev())?,
    };

    if target_dev != source_stat.dev() {
        return Err(Error::CrossDevice {
            src: source.to_owned(),
            target: target.to_owned(),
        });
    }

    if target.exists() {
        return Ok(false);
    }

    fs::hard_link(source, target)?;

    Ok(true)
}

/// Remove `path` if a link or file exists there, without following
/// symlinks. Returns whether anything was removed.
pub fn remove_link(path: &Path) -> Result<bool, Error> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path)?;
        return Ok(true);
    }
    Ok(false)
}

/// Remove a directory tree if present
pub fn remove_dir_all(path: &Path) -> Result<(), Error> {
    if path.symlink_metadata().is_ok() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

/// Replace `out_dir` with a copy of `source_dir`
pub fn copy_dir(source_dir: &Path, out_dir: &Path) -> Result<(), Error> {
    remove_dir_all(out_dir)?;
    fs::create_dir_all(out_dir)?;

    for entry in fs::read_dir(source_dir)? {
        let entry = entry?;
        let path = entry.path();

        if let Some(file_name) = path.file_name() {
            let dest = out_dir.join(file_name);
            let meta = entry.metadata()?;

            if meta.is_dir() {
                copy_dir(&path, &dest)?;
            } else if meta.is_file() {
                fs::copy(&path, &dest)?;
            } else if meta.is_symlink() {
                fs::os::unix::fs::symlink(fs::read_link(&path)?, &dest)?;
            }
        }
    }

    Ok(())
}

/// Express `target` relative to `from_dir`, both taken as absolute
/// paths. Used for the version tree symlinks so a repository stays
/// relocatable.
pub fn relative_path(target: &Path, from_dir: &Path) -> PathBuf {
    let target: Vec<_> = target.components().collect();
    let from: Vec<_> = from_dir.components().collect();

    let common = target
        .iter()
        .zip(&from)
        .take_while(|(a, b)| a == b)
        .count();

    let mut path = PathBuf::new();
    for _ in common..from.len() {
        path.push("..");
    }
    for component in &target[common..] {
        path.push(component);
    }

    path
}

/// Recursively enumerate files under `dir`, following symlinks, keeping
/// paths accepted by `matcher`
pub fn enumerate_files(
    dir: &Path,
    matcher: impl Fn(&Path) -> bool + Copy,
) -> Result<Vec<PathBuf>, Error> {
    let mut paths = vec![];

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Follow symlinked subtrees, local repos are often composed of them
        let meta = fs::metadata(&path)?;

        if meta.is_dir() {
            paths.extend(enumerate_files(&path, matcher)?);
        } else if meta.is_file() && matcher(&path) {
            paths.push(path);
        }
    }

    Ok(paths)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} exists and is not a symlink")]
    PathConflict(PathBuf),
    #[error("{0:?} does not exist, cannot hardlink")]
    MissingSource(PathBuf),
    #[error("{src:?} and {target:?} are on different devices, cannot hardlink")]
    CrossDevice { src: PathBuf, target: PathBuf },
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn symlink_placement_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("latest");

        assert!(place_symlink(&link, Path::new("2024/01/02")).unwrap());
        assert!(!place_symlink(&link, Path::new("2024/01/02")).unwrap());

        // Retargeting replaces the link
        assert!(place_symlink(&link, Path::new("2024/01/03")).unwrap());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("2024/01/03"));
    }

    #[test]
    fn symlink_conflict_with_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("latest");
        fs::write(&link, b"not a link").unwrap();

        assert!(matches!(
            place_symlink(&link, Path::new("2024/01/02")),
            Err(Error::PathConflict(_))
        ));
    }

    #[test]
    fn hardlink_placement_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.rpm");
        let target = dir.path().join("packages").join("a.rpm");
        fs::write(&source, b"rpm bytes").unwrap();

        assert!(place_hardlink(&source, &target).unwrap());
        assert!(!place_hardlink(&source, &target).unwrap());

        assert_eq!(
            source.metadata().unwrap().ino(),
            target.metadata().unwrap().ino()
        );
    }

    #[test]
    fn hardlink_replaces_foreign_inode() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.rpm");
        let target = dir.path().join("b.rpm");
        fs::write(&source, b"new").unwrap();
        fs::write(&target, b"old").unwrap();

        assert!(place_hardlink(&source, &target).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn relative_paths() {
        assert_eq!(
            relative_path(Path::new("/out/repo/packages"), Path::new("/out/repo/2024/01/02")),
            Path::new("../../../packages")
        );
        assert_eq!(
            relative_path(Path::new("/out/repo/packages"), Path::new("/out/repo")),
            Path::new("packages")
        );
    }

    #[test]
    fn hardlink_requires_source() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            place_hardlink(&dir.path().join("missing"), &dir.path().join("out")),
            Err(Error::MissingSource(_))
        ));
    }
}
