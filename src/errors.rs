use gix_hash::ObjectId;

use crate::archive::ArchiveError;
use crate::svn::svndiff::ApplyError;
use crate::working_tree::WorkingTreeError;

/// Fatal outcome of a load. Except for transient archive failures (which are
/// retried before surfacing here), nothing is recovered: the visit is marked
/// failed and no snapshot is emitted.
#[derive(Debug)]
pub enum LoadError {
    /// Resume verification failed: the revision last ingested for this origin
    /// no longer hashes to the identifier recorded by the previous visit.
    HistoryAltered {
        revision: u32,
        expected: ObjectId,
        computed: ObjectId,
    },
    /// The SVN session failed (network, permission, malformed stream).
    SvnProtocol { message: String },
    /// A text delta could not be applied to the prior file content.
    SvndiffApply { path: Vec<u8>, error: ApplyError },
    /// Filesystem failure in the scratch directory.
    WorkingTreeIo(WorkingTreeError),
    /// The archive client rejected a batch even after retries.
    Archive(ArchiveError),
    /// The revision contains a construct the replay editor cannot classify.
    UnsupportedRevisionShape { revision: u32, reason: String },
}

impl std::error::Error for LoadError {}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::HistoryAltered {
                revision,
                expected,
                computed,
            } => write!(
                f,
                "history altered: revision r{revision} was ingested as {expected} but now hashes to {computed}",
            ),
            Self::SvnProtocol { ref message } => write!(f, "svn session error: {message}"),
            Self::SvndiffApply {
                ref path,
                ref error,
            } => write!(
                f,
                "failed to apply text delta to \"{}\": {error}",
                path.escape_ascii(),
            ),
            Self::WorkingTreeIo(ref e) => write!(f, "working tree error: {e}"),
            Self::Archive(ref e) => write!(f, "archive error: {e}"),
            Self::UnsupportedRevisionShape {
                revision,
                ref reason,
            } => write!(f, "unsupported construct in r{revision}: {reason}"),
        }
    }
}

impl From<WorkingTreeError> for LoadError {
    #[inline]
    fn from(e: WorkingTreeError) -> Self {
        Self::WorkingTreeIo(e)
    }
}

impl From<ArchiveError> for LoadError {
    #[inline]
    fn from(e: ArchiveError) -> Self {
        Self::Archive(e)
    }
}
