//! Archive client interface and the submission machinery in front of it.
//!
//! The archive's server-side existence check is authoritative; the
//! client-side seen-cache and `*_missing` filtering only elide redundant
//! traffic. Ordering is the correctness-bearing part: within a revision,
//! blobs land before the directories referencing them, directories before
//! the revision, and every revision before the next one; the snapshot goes
//! last.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use gix_hash::ObjectId;

use crate::errors::LoadError;
use crate::objects::{Revision, Snapshot};

/// A failure reported by the archive. Treated as transient and retried with
/// backoff; surfaced as [`LoadError::Archive`] once retries are exhausted.
#[derive(Clone, Debug)]
pub struct ArchiveError {
    pub message: String,
}

impl std::error::Error for ArchiveError {}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl ArchiveError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VisitStatus {
    Full,
    Uneventful,
    Failed,
}

impl VisitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Uneventful => "uneventful",
            Self::Failed => "failed",
        }
    }
}

/// What the bookkeeping layer remembers about the last successful visit of
/// an origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitState {
    pub last_svn_revision: u32,
    pub revision_id: ObjectId,
    pub snapshot_id: ObjectId,
    pub repo_uuid: uuid::Uuid,
}

pub trait Archive {
    fn content_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError>;
    fn content_add(&mut self, blobs: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError>;
    fn directory_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError>;
    fn directory_add(&mut self, dirs: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError>;
    fn revision_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError>;
    fn revision_add(&mut self, revisions: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError>;
    /// Raw manifest of a stored revision; used by resume verification.
    fn revision_get(&mut self, id: ObjectId) -> Result<Option<Vec<u8>>, ArchiveError>;
    fn snapshot_add(&mut self, id: ObjectId, manifest: Vec<u8>) -> Result<(), ArchiveError>;
    fn last_visit(&mut self, origin: &str) -> Result<Option<VisitState>, ArchiveError>;
    fn origin_visit_update(
        &mut self,
        origin: &str,
        status: VisitStatus,
        snapshot: Option<ObjectId>,
        state: Option<&VisitState>,
    ) -> Result<(), ArchiveError>;
}

#[derive(Clone, Debug)]
pub struct SubmitLimits {
    /// Objects per batch before an early flush.
    pub batch_objects: usize,
    /// Payload bytes per batch before an early flush.
    pub batch_bytes: usize,
    /// Seen-cache capacity (identifiers).
    pub cache_size: usize,
    /// Attempts per archive operation before giving up.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff.
    pub retry_delay: std::time::Duration,
}

impl Default for SubmitLimits {
    fn default() -> Self {
        Self {
            batch_objects: 2000,
            batch_bytes: 8 * 1024 * 1024,
            cache_size: 100_000,
            max_attempts: 4,
            retry_delay: std::time::Duration::from_millis(500),
        }
    }
}

/// Front end owning batching, the seen-cache and retries. One per load.
pub struct Submitter<'a> {
    archive: &'a mut dyn Archive,
    limits: SubmitLimits,
    seen: lru::LruCache<ObjectId, ()>,
    pending_blobs: Vec<(ObjectId, Vec<u8>)>,
    pending_blob_bytes: usize,
    pending_dirs: Vec<(ObjectId, Vec<u8>)>,
    pending_dir_bytes: usize,
}

impl<'a> Submitter<'a> {
    pub fn new(archive: &'a mut dyn Archive, limits: SubmitLimits) -> Self {
        let cache_size = NonZeroUsize::new(limits.cache_size.max(1)).unwrap();
        Self {
            archive,
            limits,
            seen: lru::LruCache::new(cache_size),
            pending_blobs: Vec::new(),
            pending_blob_bytes: 0,
            pending_dirs: Vec::new(),
            pending_dir_bytes: 0,
        }
    }

    pub fn push_blob(&mut self, id: ObjectId, data: Vec<u8>) -> Result<(), LoadError> {
        if self.seen.contains(&id) {
            return Ok(());
        }
        self.seen.put(id, ());
        self.pending_blob_bytes += data.len();
        self.pending_blobs.push((id, data));
        if self.pending_blobs.len() >= self.limits.batch_objects
            || self.pending_blob_bytes >= self.limits.batch_bytes
        {
            self.flush_blobs()?;
        }
        Ok(())
    }

    pub fn push_directory(&mut self, id: ObjectId, data: Vec<u8>) -> Result<(), LoadError> {
        if self.seen.contains(&id) {
            return Ok(());
        }
        self.seen.put(id, ());
        self.pending_dir_bytes += data.len();
        self.pending_dirs.push((id, data));
        if self.pending_dirs.len() >= self.limits.batch_objects
            || self.pending_dir_bytes >= self.limits.batch_bytes
        {
            // blobs must always land first
            self.flush_blobs()?;
            self.flush_directories()?;
        }
        Ok(())
    }

    /// Complete one revision: everything pending lands, in order, then the
    /// revision object itself.
    pub fn submit_revision(&mut self, revision: &Revision) -> Result<ObjectId, LoadError> {
        self.flush_blobs()?;
        self.flush_directories()?;

        let id = revision.id();
        let manifest = revision.manifest();
        let missing = self.with_retry("revision_missing", |archive| {
            archive.revision_missing(&[id])
        })?;
        if !missing.is_empty() {
            self.with_retry("revision_add", |archive| {
                archive.revision_add(vec![(id, manifest.clone())])
            })?;
        }
        Ok(id)
    }

    pub fn submit_snapshot(&mut self, snapshot: &Snapshot) -> Result<ObjectId, LoadError> {
        let id = snapshot.id();
        self.with_retry("snapshot_add", |archive| {
            archive.snapshot_add(id, snapshot.manifest())
        })?;
        Ok(id)
    }

    pub fn last_visit(&mut self, origin: &str) -> Result<Option<VisitState>, LoadError> {
        self.with_retry("last_visit", |archive| archive.last_visit(origin))
    }

    pub fn revision_get(&mut self, id: ObjectId) -> Result<Option<Vec<u8>>, LoadError> {
        self.with_retry("revision_get", |archive| archive.revision_get(id))
    }

    pub fn visit_update(
        &mut self,
        origin: &str,
        status: VisitStatus,
        snapshot: Option<ObjectId>,
        state: Option<&VisitState>,
    ) -> Result<(), LoadError> {
        self.with_retry("origin_visit_update", |archive| {
            archive.origin_visit_update(origin, status, snapshot, state)
        })
    }

    /// Mark the visit failed, without retry amplification on a path that is
    /// already failing.
    pub fn mark_failed(&mut self, origin: &str) {
        if let Err(e) = self
            .archive
            .origin_visit_update(origin, VisitStatus::Failed, None, None)
        {
            tracing::warn!("failed to mark visit of {origin} as failed: {e}");
        }
    }

    fn flush_blobs(&mut self) -> Result<(), LoadError> {
        if self.pending_blobs.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending_blobs);
        self.pending_blob_bytes = 0;

        let ids: Vec<ObjectId> = batch.iter().map(|&(id, _)| id).collect();
        let missing = self.with_retry("content_missing", |archive| {
            archive.content_missing(&ids)
        })?;
        if missing.is_empty() {
            return Ok(());
        }
        let to_add: Vec<(ObjectId, Vec<u8>)> = batch
            .into_iter()
            .filter(|(id, _)| missing.contains(id))
            .collect();
        self.with_retry("content_add", |archive| archive.content_add(to_add.clone()))
    }

    fn flush_directories(&mut self) -> Result<(), LoadError> {
        if self.pending_dirs.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending_dirs);
        self.pending_dir_bytes = 0;

        let ids: Vec<ObjectId> = batch.iter().map(|&(id, _)| id).collect();
        let missing = self.with_retry("directory_missing", |archive| {
            archive.directory_missing(&ids)
        })?;
        if missing.is_empty() {
            return Ok(());
        }
        let to_add: Vec<(ObjectId, Vec<u8>)> = batch
            .into_iter()
            .filter(|(id, _)| missing.contains(id))
            .collect();
        self.with_retry("directory_add", |archive| {
            archive.directory_add(to_add.clone())
        })
    }

    fn with_retry<T>(
        &mut self,
        op: &str,
        mut f: impl FnMut(&mut dyn Archive) -> Result<T, ArchiveError>,
    ) -> Result<T, LoadError> {
        let mut delay = self.limits.retry_delay;
        let mut attempt = 1;
        loop {
            match f(self.archive) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.limits.max_attempts => {
                    tracing::warn!(
                        "archive {op} failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                        self.limits.max_attempts,
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "archive {op} failed after {attempt} attempts: {e}",
                    );
                    return Err(LoadError::Archive(e));
                }
            }
        }
    }
}

/// In-memory archive. Backs the test suites and dry runs; records the order
/// of write operations so submission-ordering invariants can be asserted.
#[derive(Default)]
pub struct MemoryArchive {
    pub contents: std::collections::HashMap<ObjectId, Vec<u8>>,
    pub directories: std::collections::HashMap<ObjectId, Vec<u8>>,
    pub revisions: std::collections::HashMap<ObjectId, Vec<u8>>,
    pub snapshots: std::collections::HashMap<ObjectId, Vec<u8>>,
    pub visits: std::collections::HashMap<String, VisitState>,
    pub statuses: Vec<(String, VisitStatus)>,
    /// `(operation, object ids)` journal of every write.
    pub journal: Vec<(&'static str, Vec<ObjectId>)>,
    /// Objects that were actually new when added.
    pub new_objects: usize,
    /// When non-zero, the next N operations fail (for retry tests).
    pub fail_next: u32,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_fault(&mut self) -> Result<(), ArchiveError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(ArchiveError::new("injected fault"));
        }
        Ok(())
    }

    fn add_all(
        map: &mut std::collections::HashMap<ObjectId, Vec<u8>>,
        objects: Vec<(ObjectId, Vec<u8>)>,
        new_objects: &mut usize,
    ) -> Vec<ObjectId> {
        let mut ids = Vec::with_capacity(objects.len());
        for (id, data) in objects {
            ids.push(id);
            if map.insert(id, data).is_none() {
                *new_objects += 1;
            }
        }
        ids
    }
}

impl Archive for MemoryArchive {
    fn content_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError> {
        self.check_fault()?;
        Ok(ids
            .iter()
            .filter(|id| !self.contents.contains_key(*id))
            .copied()
            .collect())
    }

    fn content_add(&mut self, blobs: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError> {
        self.check_fault()?;
        let ids = Self::add_all(&mut self.contents, blobs, &mut self.new_objects);
        self.journal.push(("content_add", ids));
        Ok(())
    }

    fn directory_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError> {
        self.check_fault()?;
        Ok(ids
            .iter()
            .filter(|id| !self.directories.contains_key(*id))
            .copied()
            .collect())
    }

    fn directory_add(&mut self, dirs: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError> {
        self.check_fault()?;
        let ids = Self::add_all(&mut self.directories, dirs, &mut self.new_objects);
        self.journal.push(("directory_add", ids));
        Ok(())
    }

    fn revision_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError> {
        self.check_fault()?;
        Ok(ids
            .iter()
            .filter(|id| !self.revisions.contains_key(*id))
            .copied()
            .collect())
    }

    fn revision_add(&mut self, revisions: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError> {
        self.check_fault()?;
        let ids = Self::add_all(&mut self.revisions, revisions, &mut self.new_objects);
        self.journal.push(("revision_add", ids));
        Ok(())
    }

    fn revision_get(&mut self, id: ObjectId) -> Result<Option<Vec<u8>>, ArchiveError> {
        self.check_fault()?;
        Ok(self.revisions.get(&id).cloned())
    }

    fn snapshot_add(&mut self, id: ObjectId, manifest: Vec<u8>) -> Result<(), ArchiveError> {
        self.check_fault()?;
        if self.snapshots.insert(id, manifest).is_none() {
            self.new_objects += 1;
        }
        self.journal.push(("snapshot_add", vec![id]));
        Ok(())
    }

    fn last_visit(&mut self, origin: &str) -> Result<Option<VisitState>, ArchiveError> {
        self.check_fault()?;
        Ok(self.visits.get(origin).cloned())
    }

    fn origin_visit_update(
        &mut self,
        origin: &str,
        status: VisitStatus,
        _snapshot: Option<ObjectId>,
        state: Option<&VisitState>,
    ) -> Result<(), ArchiveError> {
        self.check_fault()?;
        self.statuses.push((origin.to_string(), status));
        if let Some(state) = state {
            self.visits.insert(origin.to_string(), state.clone());
        }
        self.journal.push(("origin_visit_update", Vec::new()));
        Ok(())
    }
}

/// Loose-object archive on the local filesystem, one file per object under
/// `content/`, `directory/`, `revision/` and `snapshot/`, with visit records
/// in `visits.toml`.
pub struct FsArchive {
    root: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct VisitsFile {
    #[serde(default)]
    origins: std::collections::BTreeMap<String, VisitRecord>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct VisitRecord {
    last_svn_revision: u32,
    revision_id: String,
    snapshot_id: String,
    repo_uuid: String,
    status: String,
}

impl FsArchive {
    pub fn open(root: PathBuf) -> Result<Self, ArchiveError> {
        for sub in ["content", "directory", "revision", "snapshot"] {
            std::fs::create_dir_all(root.join(sub))
                .map_err(|e| ArchiveError::new(format!("failed to create {sub}: {e}")))?;
        }
        Ok(Self { root })
    }

    fn object_path(&self, kind: &str, id: ObjectId) -> PathBuf {
        self.root.join(kind).join(id.to_hex().to_string())
    }

    fn missing_of(&self, kind: &str, ids: &[ObjectId]) -> Vec<ObjectId> {
        ids.iter()
            .filter(|&&id| !self.object_path(kind, id).is_file())
            .copied()
            .collect()
    }

    fn add_objects(
        &self,
        kind: &str,
        objects: Vec<(ObjectId, Vec<u8>)>,
    ) -> Result<(), ArchiveError> {
        for (id, data) in objects {
            let path = self.object_path(kind, id);
            if path.is_file() {
                continue;
            }
            std::fs::write(&path, data)
                .map_err(|e| ArchiveError::new(format!("failed to write {path:?}: {e}")))?;
        }
        Ok(())
    }

    fn read_visits(&self) -> Result<VisitsFile, ArchiveError> {
        let path = self.root.join("visits.toml");
        match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw)
                .map_err(|e| ArchiveError::new(format!("failed to parse {path:?}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VisitsFile::default()),
            Err(e) => Err(ArchiveError::new(format!("failed to read {path:?}: {e}"))),
        }
    }

    fn write_visits(&self, visits: &VisitsFile) -> Result<(), ArchiveError> {
        let path = self.root.join("visits.toml");
        let raw = toml::to_string_pretty(visits)
            .map_err(|e| ArchiveError::new(format!("failed to serialize visits: {e}")))?;
        std::fs::write(&path, raw)
            .map_err(|e| ArchiveError::new(format!("failed to write {path:?}: {e}")))
    }
}

impl Archive for FsArchive {
    fn content_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError> {
        Ok(self.missing_of("content", ids))
    }

    fn content_add(&mut self, blobs: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError> {
        self.add_objects("content", blobs)
    }

    fn directory_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError> {
        Ok(self.missing_of("directory", ids))
    }

    fn directory_add(&mut self, dirs: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError> {
        self.add_objects("directory", dirs)
    }

    fn revision_missing(&mut self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, ArchiveError> {
        Ok(self.missing_of("revision", ids))
    }

    fn revision_add(&mut self, revisions: Vec<(ObjectId, Vec<u8>)>) -> Result<(), ArchiveError> {
        self.add_objects("revision", revisions)
    }

    fn revision_get(&mut self, id: ObjectId) -> Result<Option<Vec<u8>>, ArchiveError> {
        let path = self.object_path("revision", id);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ArchiveError::new(format!("failed to read {path:?}: {e}"))),
        }
    }

    fn snapshot_add(&mut self, id: ObjectId, manifest: Vec<u8>) -> Result<(), ArchiveError> {
        self.add_objects("snapshot", vec![(id, manifest)])
    }

    fn last_visit(&mut self, origin: &str) -> Result<Option<VisitState>, ArchiveError> {
        // failed visits never write a record, so any record present carries
        // a usable resume point
        let visits = self.read_visits()?;
        let Some(record) = visits.origins.get(origin) else {
            return Ok(None);
        };

        let parse_id = |raw: &str| {
            ObjectId::from_hex(raw.as_bytes())
                .map_err(|e| ArchiveError::new(format!("corrupt visit record: {e}")))
        };
        Ok(Some(VisitState {
            last_svn_revision: record.last_svn_revision,
            revision_id: parse_id(&record.revision_id)?,
            snapshot_id: parse_id(&record.snapshot_id)?,
            repo_uuid: uuid::Uuid::parse_str(&record.repo_uuid)
                .map_err(|e| ArchiveError::new(format!("corrupt visit record: {e}")))?,
        }))
    }

    fn origin_visit_update(
        &mut self,
        origin: &str,
        status: VisitStatus,
        _snapshot: Option<ObjectId>,
        state: Option<&VisitState>,
    ) -> Result<(), ArchiveError> {
        let Some(state) = state else {
            // nothing durable to record for failed or stateless visits
            return Ok(());
        };
        let mut visits = self.read_visits()?;
        visits.origins.insert(
            origin.to_string(),
            VisitRecord {
                last_svn_revision: state.last_svn_revision,
                revision_id: state.revision_id.to_hex().to_string(),
                snapshot_id: state.snapshot_id.to_hex().to_string(),
                repo_uuid: state.repo_uuid.to_string(),
                status: status.as_str().to_string(),
            },
        );
        self.write_visits(&visits)
    }
}

#[cfg(test)]
mod tests {
    use super::{Archive as _, ArchiveError, MemoryArchive, SubmitLimits, Submitter};
    use crate::objects::blob_id;

    fn limits() -> SubmitLimits {
        SubmitLimits {
            retry_delay: std::time::Duration::from_millis(1),
            ..SubmitLimits::default()
        }
    }

    #[test]
    fn test_blob_dedup_via_seen_cache() {
        let mut archive = MemoryArchive::new();
        let mut submitter = Submitter::new(&mut archive, limits());

        let data = b"hello world\n".to_vec();
        let id = blob_id(&data);
        submitter.push_blob(id, data.clone()).unwrap();
        submitter.push_blob(id, data).unwrap();
        submitter.flush_blobs().unwrap();

        assert_eq!(archive.contents.len(), 1);
        assert_eq!(archive.new_objects, 1);
    }

    #[test]
    fn test_missing_filter_elides_known_objects() {
        let mut archive = MemoryArchive::new();
        let data = b"known".to_vec();
        let id = blob_id(&data);
        archive.content_add(vec![(id, data.clone())]).unwrap();
        archive.journal.clear();

        let mut submitter = Submitter::new(&mut archive, limits());
        submitter.push_blob(id, data).unwrap();
        submitter.flush_blobs().unwrap();

        // nothing new: no content_add call at all
        assert!(archive.journal.is_empty());
    }

    #[test]
    fn test_retry_then_success() {
        let mut archive = MemoryArchive::new();
        archive.fail_next = 2;
        let mut submitter = Submitter::new(&mut archive, limits());

        let data = b"x".to_vec();
        submitter.push_blob(blob_id(&data), data).unwrap();
        submitter.flush_blobs().unwrap();
        assert_eq!(archive.contents.len(), 1);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut archive = MemoryArchive::new();
        archive.fail_next = 10;
        let mut submitter = Submitter::new(&mut archive, limits());

        let data = b"x".to_vec();
        submitter.push_blob(blob_id(&data), data).unwrap();
        let r = submitter.flush_blobs();
        assert!(matches!(r, Err(crate::errors::LoadError::Archive(_))));
    }

    #[test]
    fn test_archive_error_display() {
        let e = ArchiveError::new("boom");
        assert_eq!(e.to_string(), "boom");
    }
}
