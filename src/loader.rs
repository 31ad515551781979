//! The history walker: iterates the repository's revisions from the resume
//! point (or 1) to head, replaying each one, emitting its objects, and
//! finishing the visit with a snapshot.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gix_hash::ObjectId;

use crate::archive::{Archive, SubmitLimits, Submitter, VisitState, VisitStatus};
use crate::errors::LoadError;
use crate::objects::{self, Snapshot, SnapshotTarget};
use crate::replay::Replayer;
use crate::revision::{build_revision, submit_revision};
use crate::svn::SvnSession;
use crate::working_tree::WorkingTree;

const HEAD_BRANCH: &[u8] = b"HEAD";

#[derive(Debug)]
pub enum LoadOutcome {
    /// New revisions were ingested through head.
    Full {
        head_revision: u32,
        snapshot_id: ObjectId,
    },
    /// Nothing new since the previous visit.
    Uneventful { snapshot_id: ObjectId },
    /// A cancel request was honored between revisions. The scratch
    /// directory is left behind; no visit record is written.
    Interrupted,
}

pub struct Loader<'a> {
    session: &'a mut dyn SvnSession,
    archive: &'a mut dyn Archive,
    origin: String,
    workdir: PathBuf,
    start_from_scratch: bool,
    limits: SubmitLimits,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Loader<'a> {
    pub fn new(
        session: &'a mut dyn SvnSession,
        archive: &'a mut dyn Archive,
        origin: impl Into<String>,
        workdir: PathBuf,
    ) -> Self {
        Self {
            session,
            archive,
            origin: origin.into(),
            workdir,
            start_from_scratch: false,
            limits: SubmitLimits::default(),
            cancel: None,
        }
    }

    /// Ignore any prior visit and reload the history from revision 1.
    pub fn start_from_scratch(mut self, start_from_scratch: bool) -> Self {
        self.start_from_scratch = start_from_scratch;
        self
    }

    pub fn limits(mut self, limits: SubmitLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Cooperative cancellation, checked between revisions only.
    pub fn cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn run(self) -> Result<LoadOutcome, LoadError> {
        let Self {
            session,
            archive,
            origin,
            workdir,
            start_from_scratch,
            limits,
            cancel,
        } = self;

        let mut submitter = Submitter::new(archive, limits);
        let result = run_inner(
            session,
            &mut submitter,
            &origin,
            workdir,
            start_from_scratch,
            cancel.as_deref(),
        );
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("visit of {origin} failed: {e}");
                submitter.mark_failed(&origin);
                Err(e)
            }
        }
    }
}

fn run_inner(
    session: &mut dyn SvnSession,
    submitter: &mut Submitter<'_>,
    origin: &str,
    workdir: PathBuf,
    start_from_scratch: bool,
    cancel: Option<&AtomicBool>,
) -> Result<LoadOutcome, LoadError> {
    let repo_uuid = session.uuid()?;
    let head = session.head_revision()?;

    let prior = if start_from_scratch {
        None
    } else {
        submitter.last_visit(origin)?
    };

    let working_tree = WorkingTree::create(workdir)?;
    let mut replayer = Replayer::new(working_tree);

    // (last svn revision, its revision id)
    let mut parent: Option<(u32, ObjectId)> = None;
    let start_rev = match prior {
        Some(state) => {
            verify_prior_visit(session, submitter, &mut replayer, &repo_uuid, &state)?;
            tracing::info!(
                "{origin}: resuming after r{} ({})",
                state.last_svn_revision,
                state.revision_id,
            );
            parent = Some((state.last_svn_revision, state.revision_id));
            state.last_svn_revision + 1
        }
        None => {
            tracing::info!("{origin}: loading from scratch, head is r{head}");
            1
        }
    };

    if start_rev > head {
        // nothing to replay; still leave a snapshot of what we know
        return finish_visit(submitter, origin, &repo_uuid, parent, start_rev > 1);
    }

    let logs = session.log(start_rev, head)?;
    if logs.len() != (head - start_rev + 1) as usize {
        return Err(LoadError::SvnProtocol {
            message: format!(
                "log of r{start_rev}..r{head} returned {} records",
                logs.len(),
            ),
        });
    }

    for log in logs {
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            tracing::info!("{origin}: cancelled before r{}", log.revision);
            return Ok(LoadOutcome::Interrupted);
        }

        let revnum = log.revision;
        replayer.begin_revision(revnum);
        session.replay(revnum, &mut replayer)?;

        let blobs = replayer.take_new_blobs();
        let mut new_trees = Vec::new();
        let root = replayer.hash_tree_mut().root_id(&mut new_trees);

        let revision = build_revision(&log, root, parent.map(|(_, id)| id), &repo_uuid);
        let revision_id = submit_revision(submitter, blobs, new_trees, &revision)?;

        tracing::debug!("{origin}: r{revnum} -> tree {root}, revision {revision_id}");
        parent = Some((revnum, revision_id));
    }

    finish_visit(submitter, origin, &repo_uuid, parent, false)
}

/// Resume verification: the tree of the previously ingested head revision is
/// rebuilt from a fresh export, its revision object is recomputed (reusing
/// the stored parent), and the identifier must match what the prior visit
/// recorded. Any mismatch means the source history was altered.
fn verify_prior_visit(
    session: &mut dyn SvnSession,
    submitter: &mut Submitter<'_>,
    replayer: &mut Replayer,
    repo_uuid: &uuid::Uuid,
    state: &VisitState,
) -> Result<(), LoadError> {
    let last_rev = state.last_svn_revision;

    let exported = session.export(b"", last_rev, replayer.working_tree().root())?;
    replayer.ingest_working_tree(&exported)?;

    let mut rebuilt_trees = Vec::new();
    let root = replayer.hash_tree_mut().root_id(&mut rebuilt_trees);

    let stored = submitter.revision_get(state.revision_id)?;
    let stored_parent = stored.as_deref().and_then(objects::manifest_parent);

    let log = session
        .log(last_rev, last_rev)?
        .into_iter()
        .next()
        .ok_or_else(|| LoadError::SvnProtocol {
            message: format!("no log record for r{last_rev}"),
        })?;

    // a vanished stored revision also counts as altered history
    let computed = build_revision(&log, root, stored_parent, repo_uuid).id();
    if stored.is_none() || computed != state.revision_id {
        return Err(LoadError::HistoryAltered {
            revision: last_rev,
            expected: state.revision_id,
            computed,
        });
    }
    Ok(())
}

fn finish_visit(
    submitter: &mut Submitter<'_>,
    origin: &str,
    repo_uuid: &uuid::Uuid,
    last: Option<(u32, ObjectId)>,
    uneventful: bool,
) -> Result<LoadOutcome, LoadError> {
    let mut snapshot = Snapshot::default();
    if let Some((_, revision_id)) = last {
        snapshot
            .branches
            .insert(HEAD_BRANCH.to_vec(), SnapshotTarget::Revision(revision_id));
    }
    let snapshot_id = submitter.submit_snapshot(&snapshot)?;

    let status = if uneventful {
        VisitStatus::Uneventful
    } else {
        VisitStatus::Full
    };
    let state = last.map(|(last_svn_revision, revision_id)| VisitState {
        last_svn_revision,
        revision_id,
        snapshot_id,
        repo_uuid: *repo_uuid,
    });
    submitter.visit_update(origin, status, Some(snapshot_id), state.as_ref())?;

    if uneventful {
        tracing::info!("{origin}: nothing new, snapshot {snapshot_id}");
        Ok(LoadOutcome::Uneventful { snapshot_id })
    } else {
        let head_revision = last.map(|(rev, _)| rev).unwrap_or(0);
        tracing::info!(
            "{origin}: visit complete at r{head_revision}, snapshot {snapshot_id}",
        );
        Ok(LoadOutcome::Full {
            head_revision,
            snapshot_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::{LoadOutcome, Loader};
    use crate::archive::MemoryArchive;
    use crate::svn::dump_session::DumpSession;

    const DUMP: &[u8] = b"SVN-fs-dump-format-version: 2\n\n\
        UUID: 3187e211-bb14-4c82-9596-0b59d67cd7f4\n\n\
        Revision-number: 0\n\n\
        Revision-number: 1\n\
        Prop-content-length: 55\n\
        Content-length: 55\n\n\
        K 10\nsvn:author\nV 2\nme\n\
        K 7\nsvn:log\nV 5\nfirst\n\
        PROPS-END\n\n\
        Node-path: f\n\
        Node-kind: file\n\
        Node-action: add\n\
        Text-content-length: 5\n\
        Content-length: 5\n\n\
        data\n\n\n";

    fn temp_workdir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("svnload-loader-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn test_cancel_between_revisions_records_nothing() {
        let mut session = DumpSession::from_bytes(DUMP).unwrap();
        let mut archive = MemoryArchive::new();

        let cancel = Arc::new(AtomicBool::new(true));
        let workdir = temp_workdir("cancel");
        let outcome = Loader::new(&mut session, &mut archive, "svn://x", workdir.clone())
            .cancel_flag(cancel.clone())
            .run()
            .unwrap();

        assert!(matches!(outcome, LoadOutcome::Interrupted));
        assert!(archive.revisions.is_empty());
        assert!(archive.snapshots.is_empty());
        assert!(archive.statuses.is_empty());
        // the scratch directory stays behind as a checkpoint
        assert!(workdir.is_dir());

        // clearing the flag lets the next run finish normally
        cancel.store(false, Ordering::Relaxed);
        let outcome = Loader::new(&mut session, &mut archive, "svn://x", workdir.clone())
            .cancel_flag(cancel)
            .run()
            .unwrap();
        assert!(matches!(
            outcome,
            LoadOutcome::Full {
                head_revision: 1,
                ..
            },
        ));
        assert_eq!(archive.revisions.len(), 1);

        std::fs::remove_dir_all(&workdir).unwrap();
    }
}
