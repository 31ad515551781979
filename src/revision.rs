//! Building the revision object for one SVN revision and driving its
//! submission.

use gix_hash::ObjectId;

use crate::archive::Submitter;
use crate::errors::LoadError;
use crate::objects::Revision;
use crate::svn::LogEntry;

/// Assemble the revision object from the root tree, the parent and the SVN
/// log record. The author is carried verbatim, the message untouched, and
/// the SVN identity lands in two extra headers, in this order.
pub fn build_revision(
    log: &LogEntry,
    tree: ObjectId,
    parent: Option<ObjectId>,
    repo_uuid: &uuid::Uuid,
) -> Revision {
    Revision {
        tree,
        parent,
        author: log.author.clone(),
        date: log.date,
        message: log.message.clone(),
        extra_headers: vec![
            (
                b"svn_repo_uuid".to_vec(),
                repo_uuid.to_string().into_bytes(),
            ),
            (
                b"svn_revision".to_vec(),
                log.revision.to_string().into_bytes(),
            ),
        ],
    }
}

/// Submit one revision's objects: blobs, then directories (already in
/// post-order), then the revision itself. Returns the revision identifier.
pub fn submit_revision(
    submitter: &mut Submitter<'_>,
    blobs: Vec<(ObjectId, Vec<u8>)>,
    trees: Vec<(ObjectId, Vec<u8>)>,
    revision: &Revision,
) -> Result<ObjectId, LoadError> {
    for (id, data) in blobs {
        submitter.push_blob(id, data)?;
    }
    for (id, data) in trees {
        submitter.push_directory(id, data)?;
    }
    submitter.submit_revision(revision)
}

#[cfg(test)]
mod tests {
    use super::build_revision;
    use crate::objects::Timestamp;
    use crate::svn::LogEntry;

    #[test]
    fn test_extra_header_order() {
        let log = LogEntry {
            revision: 6,
            author: b"seanius".to_vec(),
            date: Timestamp {
                seconds: 1138341038,
                microseconds: 645046,
            },
            message: b"tag stuff\n".to_vec(),
        };
        let uuid = uuid::Uuid::parse_str("3187e211-bb14-4c82-9596-0b59d67cd7f4").unwrap();
        let revision = build_revision(&log, crate::objects::empty_tree_id(), None, &uuid);

        assert_eq!(revision.extra_headers.len(), 2);
        assert_eq!(revision.extra_headers[0].0, b"svn_repo_uuid");
        assert_eq!(
            revision.extra_headers[0].1,
            b"3187e211-bb14-4c82-9596-0b59d67cd7f4",
        );
        assert_eq!(revision.extra_headers[1].0, b"svn_revision");
        assert_eq!(revision.extra_headers[1].1, b"6");

        // matches the manifest pinned in the objects tests
        assert_eq!(
            revision.id().to_hex().to_string(),
            "688523abe3375fa2cbd91f2258eb91bd629d55d1",
        );
    }
}
