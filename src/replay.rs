//! The replay editor: receives one revision's editor callbacks and mutates
//! the working tree and the hash tree in lockstep.
//!
//! File contents move through two forms. Delta bases and pending baton
//! content are kept in the repository normal form (line endings as stored,
//! symlinks as `link <target>` files); `close_file` resolves the accumulated
//! properties and converts to the stored form that lands on disk and in the
//! archive. Since the disk holds the stored form, the repository form of an
//! untouched file is reconstructed from disk by undoing the EOL mapping
//! (with `svn:eol-style` set, the repository side is always LF-clean).

use gix_hash::ObjectId;

use crate::eol::{self, EolStyle};
use crate::errors::LoadError;
use crate::hash_tree::HashTree;
use crate::objects;
use crate::svn::{CopyFrom, FileProps, ReplayEditor, SvnSession, PROP_EOL_STYLE, PROP_EXECUTABLE, PROP_SPECIAL};
use crate::working_tree::{self, DiskEntry, WorkingTree};
use crate::FHashMap;

struct FileBaton {
    path: Vec<u8>,
    /// Pending repository-form content; `None` means untouched so far.
    content: Option<Vec<u8>>,
    /// Properties that produced the current on-disk bytes.
    old_props: FileProps,
    /// Properties accumulated for this revision.
    props: FileProps,
}

pub struct Replayer {
    revision: u32,
    working_tree: WorkingTree,
    hash_tree: HashTree,
    new_blobs: Vec<(ObjectId, Vec<u8>)>,
    /// Sticky per-file property state across revisions. A replay only
    /// carries property deltas, so the resolved values must survive between
    /// revisions (and get seeded from exports on resume and copies).
    file_states: FHashMap<Vec<u8>, FileProps>,
    /// Directory properties observed via `change_dir_prop`, recorded only
    /// (e.g. `svn:externals`); they never affect tree content.
    dir_props: FHashMap<Vec<u8>, FHashMap<Vec<u8>, Vec<u8>>>,
    open_file: Option<FileBaton>,
}

impl Replayer {
    pub fn new(working_tree: WorkingTree) -> Self {
        Self {
            revision: 0,
            working_tree,
            hash_tree: HashTree::new(),
            new_blobs: Vec::new(),
            file_states: FHashMap::default(),
            dir_props: FHashMap::default(),
            open_file: None,
        }
    }

    pub fn begin_revision(&mut self, revision: u32) {
        self.revision = revision;
        self.open_file = None;
    }

    #[inline]
    pub fn working_tree(&self) -> &WorkingTree {
        &self.working_tree
    }

    #[inline]
    pub fn hash_tree_mut(&mut self) -> &mut HashTree {
        &mut self.hash_tree
    }

    /// Blobs first materialized since the last call, ready for submission.
    pub fn take_new_blobs(&mut self) -> Vec<(ObjectId, Vec<u8>)> {
        std::mem::take(&mut self.new_blobs)
    }

    /// Rebuild the hash tree and the per-file property state from a bulk
    /// export already sitting in the working tree (resume path). One full
    /// walk; nothing is collected for submission.
    pub fn ingest_working_tree(
        &mut self,
        exported: &std::collections::HashMap<Vec<u8>, FileProps>,
    ) -> Result<(), LoadError> {
        for (path, props) in exported.iter() {
            self.file_states.insert(path.clone(), *props);
        }
        let root = self.working_tree.root().to_path_buf();
        let hash_tree = &mut self.hash_tree;
        let revision = self.revision;
        working_tree::walk(&root, &mut |path, entry| {
            let (kind, blob) = match entry {
                DiskEntry::Dir => {
                    hash_tree
                        .put_dir(path)
                        .map_err(|e| unsupported(revision, e))?;
                    return Ok(());
                }
                DiskEntry::File { data, executable } => {
                    let kind = if executable {
                        crate::hash_tree::FileKind::Executable
                    } else {
                        crate::hash_tree::FileKind::Regular
                    };
                    (kind, objects::blob_id(&data))
                }
                DiskEntry::Symlink { target } => (
                    crate::hash_tree::FileKind::Symlink,
                    objects::blob_id(&target),
                ),
            };
            hash_tree
                .put_file(path, kind, blob)
                .map_err(|e| unsupported(revision, e))
        })
    }

    // Ingest an exported subtree under `prefix` into the hash tree, the blob
    // queue and the file-state map. The bytes are already on disk (exports
    // write straight into the working tree).
    fn ingest_copied_subtree(
        &mut self,
        prefix: &[u8],
        exported: &std::collections::HashMap<Vec<u8>, FileProps>,
    ) -> Result<(), LoadError> {
        for (rel_path, props) in exported.iter() {
            self.file_states
                .insert(join_path(prefix, rel_path), *props);
        }

        let root = self.working_tree.full_path(prefix);
        let hash_tree = &mut self.hash_tree;
        let new_blobs = &mut self.new_blobs;
        let revision = self.revision;
        working_tree::walk(&root, &mut |rel_path, entry| {
            let path = join_path(prefix, rel_path);
            let (kind, data) = match entry {
                DiskEntry::Dir => {
                    hash_tree
                        .put_dir(&path)
                        .map_err(|e| unsupported(revision, e))?;
                    return Ok(());
                }
                DiskEntry::File { data, executable } => {
                    let kind = if executable {
                        crate::hash_tree::FileKind::Executable
                    } else {
                        crate::hash_tree::FileKind::Regular
                    };
                    (kind, data)
                }
                DiskEntry::Symlink { target } => (crate::hash_tree::FileKind::Symlink, target),
            };
            let blob = objects::blob_id(&data);
            new_blobs.push((blob, data));
            hash_tree
                .put_file(&path, kind, blob)
                .map_err(|e| unsupported(revision, e))
        })
    }

    // Repository-form content of an on-disk file that this revision has not
    // (yet) rewritten.
    fn repo_form_from_disk(&self, path: &[u8], props: FileProps) -> Result<Vec<u8>, LoadError> {
        let data = self.working_tree.read_svn_form(path)?;
        if props.special && eol::parse_special_link(&data).is_some() {
            return Ok(data);
        }
        match props.eol_style {
            // stored bytes are a lossless EOL mapping of the LF-clean
            // repository side; undo it
            Some(_) => Ok(eol::normalize(&data, EolStyle::Lf).into_owned()),
            None => Ok(data),
        }
    }

    fn open_baton(&mut self) -> Result<&mut FileBaton, LoadError> {
        let revision = self.revision;
        self.open_file
            .as_mut()
            .ok_or_else(|| LoadError::UnsupportedRevisionShape {
                revision,
                reason: "file callback without an open file".into(),
            })
    }
}

impl ReplayEditor for Replayer {
    fn open_root(&mut self) -> Result<(), LoadError> {
        Ok(())
    }

    fn add_directory(
        &mut self,
        session: &mut dyn SvnSession,
        path: &[u8],
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), LoadError> {
        tracing::trace!("r{}: add directory \"{}\"", self.revision, path.escape_ascii());
        self.working_tree.add_dir(path)?;
        self.hash_tree
            .put_dir(path)
            .map_err(|e| unsupported(self.revision, e))?;

        if let Some(copy_from) = copy_from {
            // materialize the copied subtree straight into place, then
            // absorb it
            let dest = self.working_tree.full_path(path);
            let exported = session.export(&copy_from.path, copy_from.revision, &dest)?;
            self.ingest_copied_subtree(path, &exported)?;
        }
        Ok(())
    }

    fn open_directory(&mut self, _path: &[u8]) -> Result<(), LoadError> {
        Ok(())
    }

    fn change_dir_prop(
        &mut self,
        path: &[u8],
        name: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(), LoadError> {
        let props = self.dir_props.entry(path.to_vec()).or_default();
        match value {
            Some(value) => {
                props.insert(name.to_vec(), value.to_vec());
            }
            None => {
                props.remove(name);
            }
        }
        Ok(())
    }

    fn delete_entry(&mut self, path: &[u8]) -> Result<(), LoadError> {
        tracing::trace!("r{}: delete \"{}\"", self.revision, path.escape_ascii());
        self.working_tree.remove(path)?;
        self.hash_tree
            .remove(path)
            .map_err(|e| unsupported(self.revision, e))?;

        // a path deleted and later re-added must not inherit stale state
        self.file_states.remove(path);
        self.dir_props.remove(path);
        let mut prefix = path.to_vec();
        prefix.push(b'/');
        self.file_states.retain(|p, _| !p.starts_with(&prefix));
        self.dir_props.retain(|p, _| !p.starts_with(&prefix));
        Ok(())
    }

    fn add_file(
        &mut self,
        session: &mut dyn SvnSession,
        path: &[u8],
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), LoadError> {
        let baton = if let Some(copy_from) = copy_from {
            let dest = self.working_tree.full_path(path);
            let exported = session.export(&copy_from.path, copy_from.revision, &dest)?;
            let props = exported.get(b"".as_slice()).copied().ok_or_else(|| {
                LoadError::UnsupportedRevisionShape {
                    revision: self.revision,
                    reason: format!(
                        "file copied from a non-file source \"{}\"",
                        copy_from.path.escape_ascii(),
                    ),
                }
            })?;
            FileBaton {
                path: path.to_vec(),
                content: Some(self.repo_form_from_disk(path, props)?),
                old_props: props,
                props,
            }
        } else {
            FileBaton {
                path: path.to_vec(),
                content: Some(Vec::new()),
                old_props: FileProps::default(),
                props: FileProps::default(),
            }
        };
        self.open_file = Some(baton);
        Ok(())
    }

    fn open_file(&mut self, path: &[u8]) -> Result<(), LoadError> {
        let props = self.file_states.get(path).copied().unwrap_or_default();
        self.open_file = Some(FileBaton {
            path: path.to_vec(),
            content: None,
            old_props: props,
            props,
        });
        Ok(())
    }

    fn apply_textdelta(&mut self, delta: &mut dyn std::io::Read) -> Result<(), LoadError> {
        let revision = self.revision;
        let Some(ref mut baton) = self.open_file else {
            return Err(LoadError::UnsupportedRevisionShape {
                revision,
                reason: "text delta without an open file".into(),
            });
        };

        let base = match baton.content.take() {
            Some(base) => base,
            None => {
                let data = self.working_tree.read_svn_form(&baton.path)?;
                if baton.old_props.special && eol::parse_special_link(&data).is_some() {
                    data
                } else if baton.old_props.eol_style.is_some() {
                    eol::normalize(&data, EolStyle::Lf).into_owned()
                } else {
                    data
                }
            }
        };

        let mut patched = Vec::new();
        crate::svn::svndiff::apply(delta, &base, &mut patched).map_err(|error| {
            LoadError::SvndiffApply {
                path: baton.path.clone(),
                error,
            }
        })?;
        baton.content = Some(patched);
        Ok(())
    }

    fn change_file_prop(&mut self, name: &[u8], value: Option<&[u8]>) -> Result<(), LoadError> {
        let baton = self.open_baton()?;
        if name == PROP_EOL_STYLE {
            baton.props.eol_style = value.and_then(EolStyle::from_prop);
        } else if name == PROP_EXECUTABLE {
            baton.props.executable = value.is_some();
        } else if name == PROP_SPECIAL {
            baton.props.special = value.is_some();
        }
        Ok(())
    }

    fn close_file(&mut self) -> Result<(), LoadError> {
        let baton = self
            .open_file
            .take()
            .ok_or_else(|| LoadError::UnsupportedRevisionShape {
                revision: self.revision,
                reason: "close_file without an open file".into(),
            })?;

        let repo_form = match baton.content {
            Some(content) => content,
            None => self.repo_form_from_disk(&baton.path, baton.old_props)?,
        };

        let stored = eol::stored_form(
            &repo_form,
            baton.props.eol_style,
            baton.props.executable,
            baton.props.special,
        );
        let blob = objects::blob_id(&stored.bytes);

        // disk first, so later copyfrom lookups observe this revision
        self.working_tree
            .write_file(&baton.path, &stored.bytes, stored.kind)?;
        self.hash_tree
            .put_file(&baton.path, stored.kind, blob)
            .map_err(|e| unsupported(self.revision, e))?;

        self.new_blobs.push((blob, stored.bytes.into_owned()));
        self.file_states.insert(baton.path, baton.props);
        Ok(())
    }

    fn close_directory(&mut self, _path: &[u8]) -> Result<(), LoadError> {
        Ok(())
    }

    fn close_edit(&mut self) -> Result<(), LoadError> {
        if self.open_file.is_some() {
            return Err(LoadError::UnsupportedRevisionShape {
                revision: self.revision,
                reason: "edit closed with a file still open".into(),
            });
        }
        Ok(())
    }
}

fn unsupported(revision: u32, e: crate::hash_tree::HashTreeError) -> LoadError {
    LoadError::UnsupportedRevisionShape {
        revision,
        reason: e.to_string(),
    }
}

fn join_path(prefix: &[u8], rel: &[u8]) -> Vec<u8> {
    if rel.is_empty() {
        return prefix.to_vec();
    }
    if prefix.is_empty() {
        return rel.to_vec();
    }
    let mut path = Vec::with_capacity(prefix.len() + 1 + rel.len());
    path.extend(prefix);
    path.push(b'/');
    path.extend(rel);
    path
}
