//! On-disk scratch directory holding the checked-out state of the revision
//! currently being replayed.
//!
//! The directory contains exactly what `svn export --ignore-keywords` would
//! produce: no `.svn/` metadata, no keyword expansion, EOL-normalized file
//! contents (normalization happens before bytes are written here).

use std::io::Read as _;
use std::os::unix::ffi::{OsStrExt as _, OsStringExt as _};
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use crate::hash_tree::FileKind;

#[derive(Debug)]
pub enum WorkingTreeError {
    CreateDir {
        path: PathBuf,
        error: std::io::Error,
    },
    Remove {
        path: PathBuf,
        error: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        error: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        error: std::io::Error,
    },
    Symlink {
        path: PathBuf,
        error: std::io::Error,
    },
    Walk {
        path: PathBuf,
        error: std::io::Error,
    },
}

impl std::error::Error for WorkingTreeError {}

impl std::fmt::Display for WorkingTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::CreateDir {
                ref path,
                ref error,
            } => write!(f, "failed to create directory {path:?}: {error}"),
            Self::Remove {
                ref path,
                ref error,
            } => write!(f, "failed to remove {path:?}: {error}"),
            Self::WriteFile {
                ref path,
                ref error,
            } => write!(f, "failed to write file {path:?}: {error}"),
            Self::ReadFile {
                ref path,
                ref error,
            } => write!(f, "failed to read file {path:?}: {error}"),
            Self::Symlink {
                ref path,
                ref error,
            } => write!(f, "failed to create symlink {path:?}: {error}"),
            Self::Walk {
                ref path,
                ref error,
            } => write!(f, "failed to walk directory {path:?}: {error}"),
        }
    }
}

pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    /// Create (or reset) the scratch directory.
    pub fn create(root: PathBuf) -> Result<Self, WorkingTreeError> {
        if root.symlink_metadata().is_ok() {
            std::fs::remove_dir_all(&root).map_err(|e| WorkingTreeError::Remove {
                path: root.clone(),
                error: e,
            })?;
        }
        std::fs::create_dir_all(&root).map_err(|e| WorkingTreeError::CreateDir {
            path: root.clone(),
            error: e,
        })?;
        Ok(Self { root })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, path: &[u8]) -> PathBuf {
        let mut full = self.root.clone();
        if !path.is_empty() {
            full.push(std::ffi::OsStr::from_bytes(path));
        }
        full
    }

    pub fn add_dir(&self, path: &[u8]) -> Result<(), WorkingTreeError> {
        let full = self.full_path(path);
        std::fs::create_dir_all(&full).map_err(|e| WorkingTreeError::CreateDir {
            path: full,
            error: e,
        })
    }

    /// Remove a file, symlink or directory subtree. Removing a path that is
    /// already gone is an error; the replay stream never deletes twice.
    pub fn remove(&self, path: &[u8]) -> Result<(), WorkingTreeError> {
        let full = self.full_path(path);
        let meta = full
            .symlink_metadata()
            .map_err(|e| WorkingTreeError::Remove {
                path: full.clone(),
                error: e,
            })?;
        let r = if meta.is_dir() {
            std::fs::remove_dir_all(&full)
        } else {
            std::fs::remove_file(&full)
        };
        r.map_err(|e| WorkingTreeError::Remove {
            path: full,
            error: e,
        })
    }

    pub fn write_file(
        &self,
        path: &[u8],
        data: &[u8],
        kind: FileKind,
    ) -> Result<(), WorkingTreeError> {
        let full = self.full_path(path);

        // a stale symlink or file must not be written through
        match full.symlink_metadata() {
            Ok(meta) if !meta.is_dir() => {
                std::fs::remove_file(&full).map_err(|e| WorkingTreeError::Remove {
                    path: full.clone(),
                    error: e,
                })?;
            }
            _ => {}
        }

        match kind {
            FileKind::Symlink => {
                std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(data), &full).map_err(
                    |e| WorkingTreeError::Symlink {
                        path: full,
                        error: e,
                    },
                )
            }
            FileKind::Regular | FileKind::Executable => {
                std::fs::write(&full, data).map_err(|e| WorkingTreeError::WriteFile {
                    path: full.clone(),
                    error: e,
                })?;
                let mode = if kind == FileKind::Executable {
                    0o755
                } else {
                    0o644
                };
                std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).map_err(
                    |e| WorkingTreeError::WriteFile {
                        path: full,
                        error: e,
                    },
                )
            }
        }
    }

    /// File content in SVN's on-repository form, used as the base for text
    /// deltas: a symlink reads as `link <target>`, a missing file as empty.
    pub fn read_svn_form(&self, path: &[u8]) -> Result<Vec<u8>, WorkingTreeError> {
        let full = self.full_path(path);
        let Ok(meta) = full.symlink_metadata() else {
            return Ok(Vec::new());
        };

        if meta.is_symlink() {
            let target = std::fs::read_link(&full).map_err(|e| WorkingTreeError::ReadFile {
                path: full,
                error: e,
            })?;
            let mut data = b"link ".to_vec();
            data.extend(target.into_os_string().into_vec());
            Ok(data)
        } else {
            std::fs::read(&full).map_err(|e| WorkingTreeError::ReadFile {
                path: full,
                error: e,
            })
        }
    }

    #[inline]
    pub fn exists(&self, path: &[u8]) -> bool {
        self.full_path(path).symlink_metadata().is_ok()
    }
}

/// A single item yielded by [`walk`].
pub enum DiskEntry {
    Dir,
    File { data: Vec<u8>, executable: bool },
    Symlink { target: Vec<u8> },
}

/// Depth-first walk of `dir`, parents before children, names in byte order.
/// Paths passed to the callback are relative to `dir`.
pub fn walk<E: From<WorkingTreeError>>(
    dir: &Path,
    cb: &mut dyn FnMut(&[u8], DiskEntry) -> Result<(), E>,
) -> Result<(), E> {
    walk_inner(dir, &mut Vec::new(), cb)
}

fn walk_inner<E: From<WorkingTreeError>>(
    dir: &Path,
    rel_path: &mut Vec<u8>,
    cb: &mut dyn FnMut(&[u8], DiskEntry) -> Result<(), E>,
) -> Result<(), E> {
    let map_walk_err = |e: std::io::Error| WorkingTreeError::Walk {
        path: dir.to_path_buf(),
        error: e,
    };

    let mut names = Vec::new();
    for entry in dir.read_dir().map_err(map_walk_err)? {
        names.push(entry.map_err(map_walk_err)?.file_name());
    }
    names.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    for name in names {
        let full = dir.join(&name);
        let meta = full.symlink_metadata().map_err(map_walk_err)?;

        let prev_len = rel_path.len();
        if !rel_path.is_empty() {
            rel_path.push(b'/');
        }
        rel_path.extend(name.as_bytes());

        if meta.is_symlink() {
            let target = std::fs::read_link(&full).map_err(|e| WorkingTreeError::ReadFile {
                path: full.clone(),
                error: e,
            })?;
            cb(
                rel_path,
                DiskEntry::Symlink {
                    target: target.into_os_string().into_vec(),
                },
            )?;
        } else if meta.is_dir() {
            cb(rel_path, DiskEntry::Dir)?;
            walk_inner(&full, rel_path, cb)?;
        } else {
            let mut data = Vec::with_capacity(meta.len() as usize);
            std::fs::File::open(&full)
                .and_then(|mut f| f.read_to_end(&mut data))
                .map_err(|e| WorkingTreeError::ReadFile {
                    path: full.clone(),
                    error: e,
                })?;
            cb(
                rel_path,
                DiskEntry::File {
                    data,
                    executable: meta.permissions().mode() & 0o100 != 0,
                },
            )?;
        }

        rel_path.truncate(prev_len);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{walk, DiskEntry, WorkingTree, WorkingTreeError};
    use crate::hash_tree::FileKind;

    fn temp_tree(name: &str) -> WorkingTree {
        let mut root = std::env::temp_dir();
        root.push(format!("svnload-wt-test-{name}-{}", std::process::id()));
        WorkingTree::create(root).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let wt = temp_tree("roundtrip");
        wt.add_dir(b"d").unwrap();
        wt.write_file(b"d/f", b"content\n", FileKind::Regular).unwrap();
        assert_eq!(wt.read_svn_form(b"d/f").unwrap(), b"content\n");

        // overwrite as executable
        wt.write_file(b"d/f", b"#!/bin/sh\n", FileKind::Executable)
            .unwrap();
        assert_eq!(wt.read_svn_form(b"d/f").unwrap(), b"#!/bin/sh\n");

        std::fs::remove_dir_all(wt.root()).unwrap();
    }

    #[test]
    fn test_symlink_reads_in_svn_form() {
        let wt = temp_tree("symlink");
        wt.write_file(b"l", b"target/path", FileKind::Symlink).unwrap();
        assert_eq!(wt.read_svn_form(b"l").unwrap(), b"link target/path");

        // replacing a symlink with a regular file must not write through it
        wt.write_file(b"l", b"plain", FileKind::Regular).unwrap();
        assert_eq!(wt.read_svn_form(b"l").unwrap(), b"plain");

        std::fs::remove_dir_all(wt.root()).unwrap();
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let wt = temp_tree("missing");
        assert_eq!(wt.read_svn_form(b"absent").unwrap(), b"");
        assert!(!wt.exists(b"absent"));
        std::fs::remove_dir_all(wt.root()).unwrap();
    }

    #[test]
    fn test_walk_order_and_kinds() {
        let wt = temp_tree("walk");
        wt.add_dir(b"b").unwrap();
        wt.write_file(b"b/x", b"1", FileKind::Regular).unwrap();
        wt.write_file(b"a", b"2", FileKind::Executable).unwrap();
        wt.write_file(b"c", b"t", FileKind::Symlink).unwrap();

        let mut seen = Vec::new();
        walk::<WorkingTreeError>(wt.root(), &mut |path, entry| {
            let kind = match entry {
                DiskEntry::Dir => "dir",
                DiskEntry::File {
                    executable: true, ..
                } => "exec",
                DiskEntry::File { .. } => "file",
                DiskEntry::Symlink { .. } => "link",
            };
            seen.push((path.to_vec(), kind));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            [
                (b"a".to_vec(), "exec"),
                (b"b".to_vec(), "dir"),
                (b"b/x".to_vec(), "file"),
                (b"c".to_vec(), "link"),
            ],
        );

        std::fs::remove_dir_all(wt.root()).unwrap();
    }
}
