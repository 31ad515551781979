//! An [`SvnSession`] served entirely from a dump stream.
//!
//! The dump is scanned once up front: every revision's node records are
//! applied to an in-memory repository state (file contents shared through
//! `Arc`, so a snapshot per revision costs path-table space, not content
//! space), and distilled into the editor callbacks that `replay` later
//! emits. Keeping all snapshots is what lets `export` and copyfrom address
//! arbitrary past revisions, like a remote-access session would.
//!
//! Text payloads always reach the editor as svndiff streams; the dump's
//! actual deltas are resolved during the scan (against the repository normal
//! form they are based on) and re-emitted as single-window literal deltas,
//! so the editor has exactly one text path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::eol::{stored_form, EolStyle};
use crate::errors::LoadError;
use crate::hash_tree::FileKind;
use crate::objects::Timestamp;
use crate::svn::{
    dump, source, svndiff, CopyFrom, FileProps, LogEntry, ReplayEditor, SvnSession,
    PROP_EOL_STYLE, PROP_EXECUTABLE, PROP_REVISION_AUTHOR, PROP_REVISION_DATE, PROP_REVISION_LOG,
    PROP_SPECIAL,
};

type Props = HashMap<Vec<u8>, Vec<u8>>;

#[derive(Clone)]
enum NodeState {
    Dir { props: Arc<Props> },
    File { content: Arc<Vec<u8>>, props: Arc<Props> },
}

/// Editor calls distilled from one revision's node records.
enum Change {
    AddDir {
        path: Vec<u8>,
        copy_from: Option<CopyFrom>,
    },
    OpenDir {
        path: Vec<u8>,
    },
    DirProps {
        path: Vec<u8>,
        changes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    },
    Delete {
        path: Vec<u8>,
    },
    File {
        path: Vec<u8>,
        open: bool,
        copy_from: Option<CopyFrom>,
        /// Final repository-form content, present when the record carried text.
        text: Option<Arc<Vec<u8>>>,
        prop_changes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    },
}

struct RevisionData {
    log: LogEntry,
    // shared so that `replay` can hand the session back to the editor
    // while iterating
    changes: Arc<Vec<Change>>,
    /// Repository state after this revision.
    state: BTreeMap<Vec<u8>, NodeState>,
}

pub struct DumpSession {
    uuid: uuid::Uuid,
    revisions: Vec<RevisionData>,
}

impl DumpSession {
    /// Open a dump file (plain or compressed) or a repository directory.
    pub fn open(path: &std::path::Path) -> Result<Self, LoadError> {
        let mut dump_source = source::DumpSource::open(path).map_err(protocol_err)?;
        let session = Self::scan(dump_source.stream());
        let close_result = dump_source.close();
        let session = session?;
        close_result.map_err(protocol_err)?;
        Ok(session)
    }

    pub fn from_bytes(dump: &[u8]) -> Result<Self, LoadError> {
        let mut source = dump;
        Self::scan(&mut source)
    }

    fn scan(stream: &mut dyn std::io::BufRead) -> Result<Self, LoadError> {
        let mut reader = dump::DumpReader::new(stream).map_err(protocol_err)?;

        let mut scan = Scan {
            uuid: uuid::Uuid::nil(),
            revisions: Vec::new(),
            current: None,
        };

        while let Some(record) = reader.next_record().map_err(protocol_err)? {
            match record {
                dump::Record::Uuid(uuid) => {
                    scan.uuid = uuid;
                }
                dump::Record::Revision(rev_record) => {
                    scan.finish_revision();
                    scan.begin_revision(rev_record)?;
                }
                dump::Record::Node(node_record) => {
                    scan.apply_node(node_record, &mut reader)?;
                }
            }
        }
        scan.finish_revision();

        if scan.revisions.is_empty() {
            return Err(LoadError::SvnProtocol {
                message: "dump contains no revision records".into(),
            });
        }

        tracing::debug!(
            "scanned dump: uuid {}, head revision {}",
            scan.uuid,
            scan.revisions.len() - 1,
        );

        Ok(Self {
            uuid: scan.uuid,
            revisions: scan.revisions,
        })
    }

    fn revision(&self, revision: u32) -> Result<&RevisionData, LoadError> {
        self.revisions
            .get(revision as usize)
            .ok_or_else(|| LoadError::SvnProtocol {
                message: format!("revision r{revision} is beyond the dump head"),
            })
    }
}

impl SvnSession for DumpSession {
    fn uuid(&mut self) -> Result<uuid::Uuid, LoadError> {
        Ok(self.uuid)
    }

    fn head_revision(&mut self) -> Result<u32, LoadError> {
        Ok((self.revisions.len() - 1) as u32)
    }

    fn log(&mut self, from: u32, to: u32) -> Result<Vec<LogEntry>, LoadError> {
        self.revision(to)?;
        Ok((from..=to)
            .map(|rev| self.revisions[rev as usize].log.clone())
            .collect())
    }

    fn replay(
        &mut self,
        revision: u32,
        editor: &mut dyn ReplayEditor,
    ) -> Result<(), LoadError> {
        let changes = self.revision(revision)?.changes.clone();

        editor.open_root()?;
        for change in changes.iter() {
            match *change {
                Change::AddDir {
                    ref path,
                    ref copy_from,
                } => editor.add_directory(self, path, copy_from.as_ref())?,
                Change::OpenDir { ref path } => editor.open_directory(path)?,
                Change::DirProps {
                    ref path,
                    ref changes,
                } => {
                    for (name, value) in changes.iter() {
                        editor.change_dir_prop(path, name, value.as_deref())?;
                    }
                }
                Change::Delete { ref path } => editor.delete_entry(path)?,
                Change::File {
                    ref path,
                    open,
                    ref copy_from,
                    ref text,
                    ref prop_changes,
                } => {
                    if open {
                        editor.open_file(path)?;
                    } else {
                        editor.add_file(self, path, copy_from.as_ref())?;
                    }
                    for (name, value) in prop_changes.iter() {
                        editor.change_file_prop(name, value.as_deref())?;
                    }
                    if let Some(content) = text {
                        let delta = svndiff::encode_fulltext(content);
                        editor.apply_textdelta(&mut delta.as_slice())?;
                    }
                    editor.close_file()?;
                }
            }
        }
        editor.close_directory(b"")?;
        editor.close_edit()
    }

    fn export(
        &mut self,
        path: &[u8],
        revision: u32,
        dest: &std::path::Path,
    ) -> Result<HashMap<Vec<u8>, FileProps>, LoadError> {
        let state = &self.revision(revision)?.state;

        let mut exported = HashMap::new();
        let mut found = path.is_empty();
        let mut write_node =
            |rel_path: &[u8], node: &NodeState| -> Result<(), LoadError> {
                let full = if rel_path.is_empty() {
                    dest.to_path_buf()
                } else {
                    use std::os::unix::ffi::OsStrExt as _;
                    dest.join(std::ffi::OsStr::from_bytes(rel_path))
                };

                match *node {
                    NodeState::Dir { .. } => {
                        std::fs::create_dir_all(&full).map_err(|e| {
                            protocol_err(format!("failed to export {full:?}: {e}"))
                        })?;
                    }
                    NodeState::File {
                        ref content,
                        ref props,
                    } => {
                        let file_props = material_props(props);
                        let stored = stored_form(
                            content,
                            file_props.eol_style,
                            file_props.executable,
                            file_props.special,
                        );
                        write_exported_file(&full, stored.kind, &stored.bytes)?;
                        exported.insert(rel_path.to_vec(), file_props);
                    }
                }
                Ok(())
            };

        if !path.is_empty() {
            if let Some(node) = state.get(path) {
                found = true;
                write_node(b"", node)?;
            }
        }

        let mut prefix = path.to_vec();
        if !prefix.is_empty() {
            prefix.push(b'/');
        }
        for (node_path, node) in state.range(prefix.clone()..) {
            if !node_path.starts_with(&prefix) {
                break;
            }
            write_node(&node_path[prefix.len()..], node)?;
        }

        if !found {
            return Err(protocol_err(format!(
                "cannot export \"{}\" at r{revision}: no such node",
                path.escape_ascii(),
            )));
        }
        Ok(exported)
    }
}

fn write_exported_file(
    full: &std::path::Path,
    kind: FileKind,
    bytes: &[u8],
) -> Result<(), LoadError> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| protocol_err(format!("failed to export {full:?}: {e}")))?;
    }
    if full.symlink_metadata().is_ok() {
        std::fs::remove_file(full)
            .map_err(|e| protocol_err(format!("failed to export {full:?}: {e}")))?;
    }

    let r = match kind {
        FileKind::Symlink => {
            use std::os::unix::ffi::OsStrExt as _;
            std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(bytes), full)
        }
        FileKind::Regular | FileKind::Executable => std::fs::write(full, bytes).and_then(|()| {
            let mode = if kind == FileKind::Executable {
                0o755
            } else {
                0o644
            };
            std::fs::set_permissions(full, std::fs::Permissions::from_mode(mode))
        }),
    };
    r.map_err(|e| protocol_err(format!("failed to export {full:?}: {e}")))
}

struct CurrentRevision {
    log: LogEntry,
    changes: Vec<Change>,
    state: BTreeMap<Vec<u8>, NodeState>,
}

struct Scan {
    uuid: uuid::Uuid,
    revisions: Vec<RevisionData>,
    current: Option<CurrentRevision>,
}

impl Scan {
    fn begin_revision(&mut self, record: dump::RevisionRecord) -> Result<(), LoadError> {
        let number = self.revisions.len() as u32;
        if record.number != number {
            return Err(protocol_err(format!(
                "dump revision numbers are not contiguous: expected r{number}, got r{}",
                record.number,
            )));
        }

        // mirrored repositories carry the origin's identity in a property
        // of revision 0
        if number == 0 {
            if let Some(raw_uuid) = record.properties.get(b"svn:sync-from-uuid".as_slice()) {
                match uuid::Uuid::try_parse_ascii(raw_uuid) {
                    Ok(uuid) => self.uuid = uuid,
                    Err(_) => {
                        return Err(protocol_err(format!(
                            "invalid svn:sync-from-uuid: \"{}\"",
                            raw_uuid.escape_ascii(),
                        )));
                    }
                }
            }
        }

        let author = record
            .properties
            .get(PROP_REVISION_AUTHOR)
            .cloned()
            .unwrap_or_default();
        let message = record
            .properties
            .get(PROP_REVISION_LOG)
            .cloned()
            .unwrap_or_default();
        let date = record
            .properties
            .get(PROP_REVISION_DATE)
            .map(|raw| parse_svn_date(raw))
            .transpose()?
            .unwrap_or(Timestamp {
                seconds: 0,
                microseconds: 0,
            });

        let state = self
            .revisions
            .last()
            .map(|prev| prev.state.clone())
            .unwrap_or_default();

        self.current = Some(CurrentRevision {
            log: LogEntry {
                revision: number,
                author,
                date,
                message,
            },
            changes: Vec::new(),
            state,
        });
        Ok(())
    }

    fn finish_revision(&mut self) {
        if let Some(current) = self.current.take() {
            self.revisions.push(RevisionData {
                log: current.log,
                changes: Arc::new(current.changes),
                state: current.state,
            });
        }
    }

    fn apply_node(
        &mut self,
        record: dump::NodeRecord,
        reader: &mut dump::DumpReader<'_>,
    ) -> Result<(), LoadError> {
        let revision = self.revisions.len() as u32;
        let Some(ref mut current) = self.current else {
            return Err(protocol_err(
                "node record before the first revision record".to_string(),
            ));
        };

        let path = normalize_path(&record.path);
        let copy_from = record
            .copy_from
            .as_ref()
            .map(|&(rev, ref cf_path)| CopyFrom {
                path: normalize_path(cf_path),
                revision: rev,
            });
        if let Some(ref copy_from) = copy_from {
            if copy_from.revision >= revision {
                return Err(protocol_err(format!(
                    "r{revision} copies \"{}\" from future r{}",
                    copy_from.path.escape_ascii(),
                    copy_from.revision,
                )));
            }
        }

        let text = record
            .text
            .map(|section| Ok::<_, LoadError>((section, reader.take_text().map_err(protocol_err)?)))
            .transpose()?;

        match record.action {
            dump::NodeAction::Delete => {
                remove_subtree(&mut current.state, &path).ok_or_else(|| {
                    protocol_err(format!(
                        "r{revision} deletes non-existent path \"{}\"",
                        path.escape_ascii(),
                    ))
                })?;
                current.changes.push(Change::Delete { path });
                return Ok(());
            }
            dump::NodeAction::Replace => {
                remove_subtree(&mut current.state, &path).ok_or_else(|| {
                    protocol_err(format!(
                        "r{revision} replaces non-existent path \"{}\"",
                        path.escape_ascii(),
                    ))
                })?;
                current.changes.push(Change::Delete { path: path.clone() });
            }
            dump::NodeAction::Change | dump::NodeAction::Add => {}
        }
        let is_change = record.action == dump::NodeAction::Change;

        match record.kind {
            Some(dump::NodeKind::File) => self.apply_file_node(
                revision,
                path,
                is_change,
                copy_from,
                record.properties,
                text,
            ),
            Some(dump::NodeKind::Dir) => {
                self.apply_dir_node(revision, path, is_change, copy_from, record.properties)
            }
            None => Err(protocol_err(format!(
                "r{revision} node \"{}\" has no kind",
                path.escape_ascii(),
            ))),
        }
    }

    fn apply_file_node(
        &mut self,
        revision: u32,
        path: Vec<u8>,
        is_change: bool,
        copy_from: Option<CopyFrom>,
        prop_section: Option<dump::PropertySection>,
        text: Option<(dump::TextSection, Vec<u8>)>,
    ) -> Result<(), LoadError> {
        let (base_content, base_props) = if let Some(ref copy_from) = copy_from {
            if is_change {
                return Err(protocol_err(format!(
                    "r{revision} has copy-from on a change node",
                )));
            }
            match self.node_at(copy_from.revision, &copy_from.path) {
                Some(NodeState::File { content, props }) => (content, props),
                _ => {
                    return Err(protocol_err(format!(
                        "r{revision} copies non-existent file \"{}\" from r{}",
                        copy_from.path.escape_ascii(),
                        copy_from.revision,
                    )));
                }
            }
        } else if is_change {
            match self.current.as_ref().unwrap().state.get(&path) {
                Some(NodeState::File { content, props }) => (content.clone(), props.clone()),
                _ => {
                    return Err(protocol_err(format!(
                        "r{revision} changes non-existent file \"{}\"",
                        path.escape_ascii(),
                    )));
                }
            }
        } else {
            (Arc::new(Vec::new()), Arc::new(Props::new()))
        };

        let content = match text {
            Some((section, data)) if section.is_delta => {
                let mut patched = Vec::new();
                svndiff::apply(&mut data.as_slice(), &base_content, &mut patched).map_err(
                    |error| LoadError::SvndiffApply {
                        path: path.clone(),
                        error,
                    },
                )?;
                Some(Arc::new(patched))
            }
            Some((_, data)) => Some(Arc::new(data)),
            None => None,
        };

        let props = prop_section
            .map(|section| Arc::new(merge_props(&base_props, section)))
            .unwrap_or_else(|| base_props.clone());

        let prop_changes = prop_delta(&base_props, &props);
        let new_content = content.clone().unwrap_or_else(|| base_content.clone());

        let current = self.current.as_mut().unwrap();
        current.state.insert(
            path.clone(),
            NodeState::File {
                content: new_content,
                props,
            },
        );
        current.changes.push(Change::File {
            path,
            open: is_change,
            copy_from,
            text: content,
            prop_changes,
        });
        Ok(())
    }

    fn apply_dir_node(
        &mut self,
        revision: u32,
        path: Vec<u8>,
        is_change: bool,
        copy_from: Option<CopyFrom>,
        prop_section: Option<dump::PropertySection>,
    ) -> Result<(), LoadError> {
        if is_change {
            let base_props = match self.dir_props(&path) {
                Some(props) => props,
                None => {
                    return Err(protocol_err(format!(
                        "r{revision} changes non-existent directory \"{}\"",
                        path.escape_ascii(),
                    )));
                }
            };
            if let Some(section) = prop_section {
                let new_props = Arc::new(merge_props(&base_props, section));
                let changes = prop_delta(&base_props, &new_props);
                self.set_dir_props(&path, new_props);
                let current = self.current.as_mut().unwrap();
                current.changes.push(Change::OpenDir { path: path.clone() });
                if !changes.is_empty() {
                    current.changes.push(Change::DirProps { path, changes });
                }
            }
            return Ok(());
        }

        let base_props = if let Some(ref copy_from) = copy_from {
            // bring over the whole source subtree, contents shared
            let source_state = &self
                .revisions
                .get(copy_from.revision as usize)
                .ok_or_else(|| {
                    protocol_err(format!(
                        "r{revision} copies from unknown revision r{}",
                        copy_from.revision,
                    ))
                })?
                .state;

            let Some(NodeState::Dir { props }) = source_state.get(&copy_from.path).cloned()
            else {
                return Err(protocol_err(format!(
                    "r{revision} copies non-existent directory \"{}\" from r{}",
                    copy_from.path.escape_ascii(),
                    copy_from.revision,
                )));
            };

            let mut prefix = copy_from.path.clone();
            prefix.push(b'/');
            let copied: Vec<(Vec<u8>, NodeState)> = source_state
                .range(prefix.clone()..)
                .take_while(|(p, _)| p.starts_with(&prefix))
                .map(|(p, node)| {
                    let mut new_path = path.clone();
                    new_path.push(b'/');
                    new_path.extend(&p[prefix.len()..]);
                    (new_path, node.clone())
                })
                .collect();

            let current = self.current.as_mut().unwrap();
            current.state.extend(copied);
            props
        } else {
            Arc::new(Props::new())
        };

        let props = prop_section
            .map(|section| Arc::new(merge_props(&base_props, section)))
            .unwrap_or_else(|| base_props.clone());
        let changes = prop_delta(&base_props, &props);

        let current = self.current.as_mut().unwrap();
        current
            .state
            .insert(path.clone(), NodeState::Dir { props });
        current.changes.push(Change::AddDir {
            path: path.clone(),
            copy_from,
        });
        if !changes.is_empty() {
            current.changes.push(Change::DirProps { path, changes });
        }
        Ok(())
    }

    fn node_at(&self, revision: u32, path: &[u8]) -> Option<NodeState> {
        self.revisions
            .get(revision as usize)?
            .state
            .get(path)
            .cloned()
    }

    fn dir_props(&self, path: &[u8]) -> Option<Arc<Props>> {
        if path.is_empty() {
            // the root directory always exists; its properties are not
            // represented in the path table
            return Some(Arc::new(Props::new()));
        }
        match self.current.as_ref().unwrap().state.get(path) {
            Some(NodeState::Dir { props }) => Some(props.clone()),
            _ => None,
        }
    }

    fn set_dir_props(&mut self, path: &[u8], props: Arc<Props>) {
        if path.is_empty() {
            return;
        }
        self.current
            .as_mut()
            .unwrap()
            .state
            .insert(path.to_vec(), NodeState::Dir { props });
    }
}

fn remove_subtree(state: &mut BTreeMap<Vec<u8>, NodeState>, path: &[u8]) -> Option<()> {
    let existed = state.remove(path).is_some();
    if !existed {
        return None;
    }
    let mut prefix = path.to_vec();
    prefix.push(b'/');
    let children: Vec<Vec<u8>> = state
        .range(prefix.clone()..)
        .take_while(|(p, _)| p.starts_with(&prefix))
        .map(|(p, _)| p.clone())
        .collect();
    for child in children {
        state.remove(&child);
    }
    Some(())
}

fn merge_props(base: &Props, section: dump::PropertySection) -> Props {
    if section.is_delta {
        let mut props = base.clone();
        for (key, value) in section.properties {
            match value {
                Some(value) => {
                    props.insert(key, value);
                }
                None => {
                    props.remove(&key);
                }
            }
        }
        props
    } else {
        // a non-delta section is the complete property set
        section
            .properties
            .into_iter()
            .map(|(k, v)| (k, v.unwrap()))
            .collect()
    }
}

fn prop_delta(old: &Props, new: &Props) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    let mut changes = Vec::new();
    for (key, value) in new.iter() {
        if old.get(key) != Some(value) {
            changes.push((key.clone(), Some(value.clone())));
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changes.push((key.clone(), None));
        }
    }
    changes.sort();
    changes
}

fn material_props(props: &Props) -> FileProps {
    FileProps {
        eol_style: props
            .get(PROP_EOL_STYLE)
            .and_then(|value| EolStyle::from_prop(value)),
        executable: props.contains_key(PROP_EXECUTABLE),
        special: props.contains_key(PROP_SPECIAL),
    }
}

// svn:date is ISO-8601 with microseconds, e.g. `2006-01-27T05:50:38.645046Z`
fn parse_svn_date(raw: &[u8]) -> Result<Timestamp, LoadError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| protocol_err(format!("invalid svn:date: \"{}\"", raw.escape_ascii())))?;
    let parsed = chrono::DateTime::parse_from_rfc3339(text)
        .map_err(|e| protocol_err(format!("invalid svn:date \"{text}\": {e}")))?;
    Ok(Timestamp {
        seconds: parsed.timestamp(),
        microseconds: parsed.timestamp_subsec_micros(),
    })
}

fn normalize_path(path: &[u8]) -> Vec<u8> {
    let path = path.strip_prefix(b"/").unwrap_or(path);
    let path = path.strip_suffix(b"/").unwrap_or(path);
    path.to_vec()
}

fn protocol_err(e: impl std::fmt::Display) -> LoadError {
    LoadError::SvnProtocol {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_svn_date, DumpSession};
    use crate::objects::Timestamp;
    use crate::svn::SvnSession as _;

    #[test]
    fn test_parse_svn_date() {
        assert_eq!(
            parse_svn_date(b"2006-01-27T05:50:38.645046Z").unwrap(),
            Timestamp {
                seconds: 1138341038,
                microseconds: 645046,
            },
        );
        assert_eq!(
            parse_svn_date(b"1970-01-01T00:00:00.000000Z").unwrap(),
            Timestamp {
                seconds: 0,
                microseconds: 0,
            },
        );
        assert!(parse_svn_date(b"not a date").is_err());
    }

    #[test]
    fn test_scan_empty_repository() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            UUID: 3187e211-bb14-4c82-9596-0b59d67cd7f4\n\n\
            Revision-number: 0\n\
            Prop-content-length: 10\n\
            Content-length: 10\n\n\
            PROPS-END\n\n";

        let mut session = DumpSession::from_bytes(dump).unwrap();
        assert_eq!(session.head_revision().unwrap(), 0);
        assert_eq!(
            session.uuid().unwrap().to_string(),
            "3187e211-bb14-4c82-9596-0b59d67cd7f4",
        );
    }

    #[test]
    fn test_non_contiguous_revisions_rejected() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 0\n\n\
            Revision-number: 2\n\n";
        assert!(DumpSession::from_bytes(dump).is_err());
    }

    #[test]
    fn test_log_metadata() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 0\n\n\
            Revision-number: 1\n\
            Prop-content-length: 110\n\
            Content-length: 110\n\n\
            K 10\nsvn:author\nV 7\nseanius\n\
            K 8\nsvn:date\nV 27\n2006-01-27T05:50:38.645046Z\n\
            K 7\nsvn:log\nV 9\ntag stuff\n\
            PROPS-END\n\n";

        let mut session = DumpSession::from_bytes(dump).unwrap();
        let log = session.log(1, 1).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].author, b"seanius");
        assert_eq!(log[0].message, b"tag stuff");
        assert_eq!(log[0].date.seconds, 1138341038);
    }
}
