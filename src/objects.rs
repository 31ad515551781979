//! Identifiers and manifests for the four content-addressed object kinds.
//!
//! Blobs and trees are plain git objects (`git hash-object` reproduces their
//! identifiers). Revisions use the archive's commit manifest, hashed with
//! git's `commit` framing; snapshots use the archive's branch-set manifest
//! with the same loose-object framing under a `snapshot` tag.

use std::collections::BTreeMap;

use gix_hash::ObjectId;
use gix_object::WriteTo as _;

pub const HASH_KIND: gix_hash::Kind = gix_hash::Kind::Sha1;

pub fn hash_object(kind: gix_object::Kind, data: &[u8]) -> ObjectId {
    let mut hasher = gix_hash::hasher(HASH_KIND);
    hasher.update(&gix_object::encode::loose_header(kind, data.len() as u64));
    hasher.update(data);
    hasher
        .try_finalize()
        .expect("SHA-1 collision attack detected")
}

// Snapshots are not a git object kind; they use the same framing with their
// own tag.
fn hash_snapshot_object(data: &[u8]) -> ObjectId {
    let mut hasher = gix_hash::hasher(HASH_KIND);
    hasher.update(format!("snapshot {}\0", data.len()).as_bytes());
    hasher.update(data);
    hasher
        .try_finalize()
        .expect("SHA-1 collision attack detected")
}

#[inline]
pub fn blob_id(data: &[u8]) -> ObjectId {
    hash_object(gix_object::Kind::Blob, data)
}

/// Serialize a tree (entries must already be sorted) and compute its
/// identifier. The raw bytes are what gets submitted to the archive.
pub fn tree_object(tree: &gix_object::Tree) -> (ObjectId, Vec<u8>) {
    let mut raw = Vec::with_capacity(tree.size() as usize);
    tree.write_to(&mut raw).expect("writing to Vec cannot fail");
    (hash_object(gix_object::Kind::Tree, &raw), raw)
}

pub fn empty_tree_id() -> ObjectId {
    hash_object(gix_object::Kind::Tree, b"")
}

/// A point in time as recorded by `svn:date`: seconds since the epoch plus
/// a microsecond fraction, always UTC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: u32,
}

impl Timestamp {
    fn push_to(&self, out: &mut Vec<u8>) {
        use std::io::Write as _;

        if self.microseconds == 0 {
            write!(out, "{}", self.seconds).unwrap();
        } else {
            // fractional timestamps elide trailing zeros
            let mut text = format!("{}.{:06}", self.seconds, self.microseconds);
            while text.ends_with('0') {
                text.pop();
            }
            out.extend(text.as_bytes());
        }
    }
}

/// A revision object: the archive's commit-shaped record tying a root tree to
/// SVN commit metadata.
#[derive(Clone, Debug)]
pub struct Revision {
    pub tree: ObjectId,
    pub parent: Option<ObjectId>,
    /// SVN author, verbatim. No email is synthesized.
    pub author: Vec<u8>,
    pub date: Timestamp,
    /// Commit message, verbatim; no trimming, no footer.
    pub message: Vec<u8>,
    /// Emitted in order after the committer line.
    pub extra_headers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Revision {
    pub fn manifest(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.message.len());

        push_header(&mut out, b"tree", self.tree.to_hex().to_string().as_bytes());
        if let Some(parent) = self.parent {
            push_header(&mut out, b"parent", parent.to_hex().to_string().as_bytes());
        }

        let mut person_line = self.author.clone();
        person_line.push(b' ');
        self.date.push_to(&mut person_line);
        person_line.extend(b" +0000");
        push_header(&mut out, b"author", &person_line);
        push_header(&mut out, b"committer", &person_line);

        for (key, value) in self.extra_headers.iter() {
            push_header(&mut out, key, value);
        }

        out.push(b'\n');
        out.extend(&self.message);
        out
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        hash_object(gix_object::Kind::Commit, &self.manifest())
    }
}

/// Extract the `parent` header of a stored revision manifest, if any.
/// Used by resume verification, which rebuilds the manifest of the last
/// ingested revision from fresh data but has to reuse its recorded parent.
pub fn manifest_parent(manifest: &[u8]) -> Option<ObjectId> {
    for line in manifest.split(|&b| b == b'\n') {
        if line.is_empty() {
            break;
        }
        if let Some(hex) = line.strip_prefix(b"parent ") {
            return ObjectId::from_hex(hex).ok();
        }
    }
    None
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SnapshotTarget {
    Revision(ObjectId),
}

/// A snapshot: the set of branches observed by one visit. This loader emits
/// a single `HEAD` branch (or none at all for an empty repository).
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub branches: BTreeMap<Vec<u8>, SnapshotTarget>,
}

impl Snapshot {
    pub fn manifest(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, target) in self.branches.iter() {
            let SnapshotTarget::Revision(id) = *target;
            out.extend(b"revision ");
            out.extend(name);
            out.push(b'\0');
            out.extend(format!("{}:", id.as_bytes().len()).as_bytes());
            out.extend(id.as_bytes());
        }
        out
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        hash_snapshot_object(&self.manifest())
    }
}

// Header values containing newlines continue on the next line after a
// single space, like git commit headers.
fn push_header(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.extend(key);
    out.push(b' ');
    for (i, line) in value.split(|&b| b == b'\n').enumerate() {
        if i != 0 {
            out.extend(b"\n ");
        }
        out.extend(line);
    }
    out.push(b'\n');
}
