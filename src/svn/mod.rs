//! Interfaces to the Subversion side: the session that serves repository
//! data and the editor that receives one revision's worth of changes.

use std::collections::HashMap;

use crate::eol::EolStyle;
use crate::errors::LoadError;
use crate::objects::Timestamp;

pub mod dump;
pub mod dump_session;
pub mod source;
pub mod svndiff;

pub const PROP_EOL_STYLE: &[u8] = b"svn:eol-style";
pub const PROP_EXECUTABLE: &[u8] = b"svn:executable";
pub const PROP_SPECIAL: &[u8] = b"svn:special";
pub const PROP_EXTERNALS: &[u8] = b"svn:externals";

pub const PROP_REVISION_AUTHOR: &[u8] = b"svn:author";
pub const PROP_REVISION_DATE: &[u8] = b"svn:date";
pub const PROP_REVISION_LOG: &[u8] = b"svn:log";

/// One revision's log record.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub revision: u32,
    /// May be empty: some repositories have commits without an author.
    pub author: Vec<u8>,
    pub date: Timestamp,
    pub message: Vec<u8>,
}

/// Source of an editor `add_directory`/`add_file` with history.
#[derive(Clone, Debug)]
pub struct CopyFrom {
    pub path: Vec<u8>,
    pub revision: u32,
}

/// The SVN properties that affect byte-level tree content, resolved for one
/// file. Returned by [`SvnSession::export`] so the replay editor can seed
/// its per-file state after a bulk export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileProps {
    pub eol_style: Option<EolStyle>,
    pub executable: bool,
    pub special: bool,
}

/// Receiver of one revision's delta stream.
///
/// The session guarantees depth-first, open-before-child order with matched
/// open/close pairs; at most one file is open at a time, and the file-scoped
/// callbacks (`apply_textdelta`, `change_file_prop`, `close_file`) refer to
/// the most recently opened file. Callbacks that may carry a copy source
/// receive the driving session back, so the copied subtree can be pulled in
/// through its `export`.
///
/// Text deltas are based on the repository normal form of the previous
/// content (line endings as stored, symlinks as `link <target>` files),
/// which is also the form the editor keeps for its delta bases.
pub trait ReplayEditor {
    fn open_root(&mut self) -> Result<(), LoadError>;
    fn add_directory(
        &mut self,
        session: &mut dyn SvnSession,
        path: &[u8],
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), LoadError>;
    fn open_directory(&mut self, path: &[u8]) -> Result<(), LoadError>;
    fn change_dir_prop(
        &mut self,
        path: &[u8],
        name: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(), LoadError>;
    fn delete_entry(&mut self, path: &[u8]) -> Result<(), LoadError>;
    fn add_file(
        &mut self,
        session: &mut dyn SvnSession,
        path: &[u8],
        copy_from: Option<&CopyFrom>,
    ) -> Result<(), LoadError>;
    fn open_file(&mut self, path: &[u8]) -> Result<(), LoadError>;
    /// Consume an svndiff stream for the open file.
    fn apply_textdelta(&mut self, delta: &mut dyn std::io::Read) -> Result<(), LoadError>;
    fn change_file_prop(&mut self, name: &[u8], value: Option<&[u8]>) -> Result<(), LoadError>;
    fn close_file(&mut self) -> Result<(), LoadError>;
    fn close_directory(&mut self, path: &[u8]) -> Result<(), LoadError>;
    fn close_edit(&mut self) -> Result<(), LoadError>;
}

/// One load = one session. Implementations serve repository metadata, log
/// records, per-revision replays and bulk exports.
pub trait SvnSession {
    fn uuid(&mut self) -> Result<uuid::Uuid, LoadError>;
    fn head_revision(&mut self) -> Result<u32, LoadError>;
    /// Log records for `[from, to]`, in ascending revision order.
    fn log(&mut self, from: u32, to: u32) -> Result<Vec<LogEntry>, LoadError>;
    /// Drive `editor` with the delta between `revision - 1` and `revision`.
    fn replay(
        &mut self,
        revision: u32,
        editor: &mut dyn ReplayEditor,
    ) -> Result<(), LoadError>;
    /// Materialize `path` at `revision` under `dest`, with keyword expansion
    /// disabled and EOL normalization applied, and report the material
    /// properties of every exported file (keyed relative to `dest`).
    fn export(
        &mut self,
        path: &[u8],
        revision: u32,
        dest: &std::path::Path,
    ) -> Result<HashMap<Vec<u8>, FileProps>, LoadError>;
}
