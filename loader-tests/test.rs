use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gix_hash::ObjectId;

use svnload::archive::{MemoryArchive, SubmitLimits, VisitStatus};
use svnload::errors::LoadError;
use svnload::hash_tree::{FileKind, HashTree};
use svnload::loader::{LoadOutcome, Loader};
use svnload::objects;
use svnload::svn::dump_session::DumpSession;
use svnload::working_tree::{self, DiskEntry, WorkingTreeError};

use crate::defs;

pub(crate) fn run_test(test_path: &Path) -> Result<(), String> {
    let temp_dir = get_tmp_dir()?;

    let test_def_raw =
        std::fs::read(test_path).map_err(|e| format!("failed to read {test_path:?}: {e}"))?;
    let test_def: defs::Test = serde_yaml::from_slice(&test_def_raw)
        .map_err(|e| format!("failed to parse {test_path:?}: {e}"))?;

    let mut archive = MemoryArchive::new();
    let origin = "svn://example.org/repo";

    let mut last_good_run: Option<(usize, ObjectId)> = None;
    for (run_no, run) in test_def.runs.iter().enumerate() {
        let outcome = execute_run(&test_def, run, run_no, &mut archive, &temp_dir, origin)?;
        if let Some(snapshot_id) = outcome {
            last_good_run = Some((run_no, snapshot_id));
        }
    }

    // reloading an already-loaded origin must emit nothing new and arrive
    // at the same snapshot
    if let Some((run_no, prior_snapshot)) = last_good_run {
        let run = &test_def.runs[run_no];
        // an empty snapshot means no revision was ever recorded, so a
        // reload starts over instead of resuming
        let has_revisions = archive
            .snapshots
            .get(&prior_snapshot)
            .is_some_and(|manifest| !manifest.is_empty());
        if run.expect_error.is_none() && run.alter.is_none() && has_revisions {
            let objects_before = archive.new_objects;

            let dump = make_svn_dump(&test_def, run.head, None);
            let mut session = DumpSession::from_bytes(&dump)
                .map_err(|e| format!("reload: failed to scan dump: {e}"))?;
            let workdir = temp_dir.join("wc-reload");
            let outcome = Loader::new(&mut session, &mut archive, origin, workdir)
                .limits(test_limits())
                .run()
                .map_err(|e| format!("reload failed: {e}"))?;

            let LoadOutcome::Uneventful { snapshot_id } = outcome else {
                return Err(format!("reload was not uneventful: {outcome:?}"));
            };
            if snapshot_id != prior_snapshot {
                return Err(format!(
                    "reload snapshot {snapshot_id} differs from {prior_snapshot}",
                ));
            }
            if archive.new_objects != objects_before {
                return Err(format!(
                    "reload added {} new objects",
                    archive.new_objects - objects_before,
                ));
            }
        }
    }

    std::fs::remove_dir_all(&temp_dir)
        .map_err(|e| format!("failed to remove {temp_dir:?}: {e}"))?;
    Ok(())
}

// Returns the snapshot id for a successful run, `None` for an expected
// failure.
fn execute_run(
    test_def: &defs::Test,
    run: &defs::Run,
    run_no: usize,
    archive: &mut MemoryArchive,
    temp_dir: &Path,
    origin: &str,
) -> Result<Option<ObjectId>, String> {
    let ctx = |msg: String| format!("run {run_no}: {msg}");

    let dump = make_svn_dump(test_def, run.head, run.alter.as_ref());
    let mut session = DumpSession::from_bytes(&dump)
        .map_err(|e| ctx(format!("failed to scan dump: {e}")))?;

    let journal_start = archive.journal.len();
    let workdir = temp_dir.join(format!("wc-{run_no}"));
    let result = Loader::new(&mut session, archive, origin, workdir.clone())
        .start_from_scratch(run.start_from_scratch)
        .limits(test_limits())
        .run();

    match run.expect_error {
        Some(defs::ExpectError::HistoryAltered) => {
            return match result {
                Err(LoadError::HistoryAltered { .. }) => {
                    let statuses = &archive.statuses;
                    match statuses.last() {
                        Some(&(_, VisitStatus::Failed)) => Ok(None),
                        other => Err(ctx(format!("visit status is {other:?}, not failed"))),
                    }
                }
                Err(e) => Err(ctx(format!("expected HistoryAltered, got: {e}"))),
                Ok(o) => Err(ctx(format!("expected HistoryAltered, got success: {o:?}"))),
            };
        }
        None => {}
    }

    let outcome = result.map_err(|e| ctx(format!("load failed: {e}")))?;
    let snapshot_id = match outcome {
        LoadOutcome::Full { snapshot_id, .. } | LoadOutcome::Uneventful { snapshot_id } => {
            snapshot_id
        }
        LoadOutcome::Interrupted => return Err(ctx("load was interrupted".into())),
    };

    if let Some(ref expected) = run.snapshot {
        if snapshot_id.to_hex().to_string() != *expected {
            return Err(ctx(format!(
                "snapshot is {snapshot_id}, expected {expected}",
            )));
        }
    }

    if let Some(ref expected_status) = run.expect_status {
        let expected = match expected_status {
            defs::ExpectStatus::Full => VisitStatus::Full,
            defs::ExpectStatus::Uneventful => VisitStatus::Uneventful,
        };
        match archive.statuses.last() {
            Some(&(_, status)) if status == expected => {}
            other => return Err(ctx(format!("visit status is {other:?}"))),
        }
    }

    for (&revnum, expect) in run.revs.iter() {
        check_revision(archive, revnum, expect).map_err(&ctx)?;
    }

    check_submission_order(archive, journal_start).map_err(&ctx)?;

    if let Some(root_tree) = snapshot_root_tree(archive, snapshot_id)? {
        check_working_tree_matches(archive, &workdir, root_tree).map_err(&ctx)?;

        for pair in run.subtree_equal.iter() {
            let a = lookup_subtree(archive, root_tree, pair.a.as_bytes())
                .ok_or_else(|| ctx(format!("path {:?} not found in final tree", pair.a)))?;
            let b = lookup_subtree(archive, root_tree, pair.b.as_bytes())
                .ok_or_else(|| ctx(format!("path {:?} not found in final tree", pair.b)))?;
            if a != b {
                return Err(ctx(format!(
                    "subtrees {:?} ({a}) and {:?} ({b}) differ",
                    pair.a, pair.b,
                )));
            }
        }
    }

    Ok(Some(snapshot_id))
}

fn test_limits() -> SubmitLimits {
    SubmitLimits {
        // small batches so the flush logic actually runs in tests
        batch_objects: 3,
        batch_bytes: 1024,
        retry_delay: std::time::Duration::from_millis(1),
        ..SubmitLimits::default()
    }
}

fn check_revision(
    archive: &MemoryArchive,
    revnum: u32,
    expect: &defs::RevExpect,
) -> Result<(), String> {
    let revision_id = ObjectId::from_hex(expect.revision.as_bytes())
        .map_err(|e| format!("bad expected revision id {:?}: {e}", expect.revision))?;

    let manifest = archive
        .revisions
        .get(&revision_id)
        .ok_or_else(|| format!("r{revnum}: revision {revision_id} not in archive"))?;

    let headers = parse_manifest_headers(manifest);
    let tree = headers
        .get("tree")
        .ok_or_else(|| format!("r{revnum}: manifest has no tree header"))?;
    if *tree != expect.tree {
        return Err(format!(
            "r{revnum}: tree is {tree}, expected {}",
            expect.tree,
        ));
    }
    match headers.get("svn_revision") {
        Some(v) if *v == revnum.to_string() => Ok(()),
        other => Err(format!("r{revnum}: svn_revision header is {other:?}")),
    }
}

// Every object must be preceded by its transitive closure: blobs before the
// directories naming them, directories before their parents and before the
// revision, revisions before the snapshot.
fn check_submission_order(archive: &MemoryArchive, journal_start: usize) -> Result<(), String> {
    let mut available: std::collections::HashSet<ObjectId> = std::collections::HashSet::new();
    let mut seen_snapshot = false;

    // objects submitted by earlier runs are durable already
    for (op, ids) in &archive.journal[..journal_start] {
        if *op != "snapshot_add" && *op != "origin_visit_update" {
            available.extend(ids.iter().copied());
        }
    }

    for (op, ids) in &archive.journal[journal_start..] {
        match *op {
            "content_add" => available.extend(ids.iter().copied()),
            "directory_add" => {
                for id in ids {
                    let raw = &archive.directories[id];
                    for (_, _, child) in parse_tree_entries(raw) {
                        if !available.contains(&child) {
                            return Err(format!(
                                "directory {id} submitted before its entry {child}",
                            ));
                        }
                    }
                    available.insert(*id);
                }
            }
            "revision_add" => {
                for id in ids {
                    let headers = parse_manifest_headers(&archive.revisions[id]);
                    let tree: ObjectId = headers
                        .get("tree")
                        .and_then(|hex| ObjectId::from_hex(hex.as_bytes()).ok())
                        .ok_or_else(|| format!("revision {id} has no tree header"))?;
                    if !available.contains(&tree) {
                        return Err(format!("revision {id} submitted before its tree {tree}"));
                    }
                    available.insert(*id);
                }
            }
            "snapshot_add" => seen_snapshot = true,
            "origin_visit_update" => {}
            other => return Err(format!("unexpected journal entry {other:?}")),
        }
        if seen_snapshot && *op != "snapshot_add" && *op != "origin_visit_update" {
            return Err(format!("{op} submitted after the snapshot"));
        }
    }
    Ok(())
}

// Independent full walk of the working tree left on disk; its root tree id
// must equal what the incremental hash tree produced.
fn check_working_tree_matches(
    archive: &MemoryArchive,
    workdir: &Path,
    expected_root: ObjectId,
) -> Result<(), String> {
    if !workdir.is_dir() {
        // run resumed with nothing to replay: no working tree was written
        return Ok(());
    }

    let mut tree = HashTree::new();
    working_tree::walk::<WorkingTreeError>(workdir, &mut |path, entry| {
        match entry {
            DiskEntry::Dir => {
                tree.put_dir(path).unwrap();
            }
            DiskEntry::File { data, executable } => {
                let kind = if executable {
                    FileKind::Executable
                } else {
                    FileKind::Regular
                };
                tree.put_file(path, kind, objects::blob_id(&data)).unwrap();
            }
            DiskEntry::Symlink { target } => {
                tree.put_file(path, FileKind::Symlink, objects::blob_id(&target))
                    .unwrap();
            }
        }
        Ok(())
    })
    .map_err(|e| format!("failed to walk {workdir:?}: {e}"))?;

    let mut new_trees = Vec::new();
    let root = tree.root_id(&mut new_trees);
    if root != expected_root {
        return Err(format!(
            "working tree walk yields {root}, archive has {expected_root}",
        ));
    }
    // every tree of the full walk must already be archived
    for (id, _) in new_trees {
        if !archive.directories.contains_key(&id) {
            return Err(format!("tree {id} of the full walk is not archived"));
        }
    }
    Ok(())
}

fn snapshot_root_tree(
    archive: &MemoryArchive,
    snapshot_id: ObjectId,
) -> Result<Option<ObjectId>, String> {
    let manifest = archive
        .snapshots
        .get(&snapshot_id)
        .ok_or_else(|| format!("snapshot {snapshot_id} not in archive"))?;
    if manifest.is_empty() {
        return Ok(None);
    }

    let rest = manifest
        .strip_prefix(b"revision HEAD\x0020:")
        .ok_or_else(|| format!("unexpected snapshot manifest: {manifest:?}"))?;
    let revision_id = ObjectId::try_from(rest).map_err(|e| format!("bad snapshot target: {e}"))?;

    let revision = archive
        .revisions
        .get(&revision_id)
        .ok_or_else(|| format!("snapshot target {revision_id} not in archive"))?;
    let tree = parse_manifest_headers(revision)
        .get("tree")
        .and_then(|hex| ObjectId::from_hex(hex.as_bytes()).ok())
        .ok_or_else(|| format!("snapshot target {revision_id} has no tree"))?;
    Ok(Some(tree))
}

fn lookup_subtree(
    archive: &MemoryArchive,
    root_tree: ObjectId,
    path: &[u8],
) -> Option<ObjectId> {
    let mut current = root_tree;
    for component in path.split(|&c| c == b'/') {
        let raw = archive.directories.get(&current)?;
        current = parse_tree_entries(raw)
            .into_iter()
            .find(|(_, name, _)| name == component)?
            .2;
    }
    Some(current)
}

fn parse_manifest_headers(manifest: &[u8]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in manifest.split(|&b| b == b'\n') {
        if line.is_empty() {
            break;
        }
        if let Some(sep) = line.iter().position(|&b| b == b' ') {
            headers.insert(
                String::from_utf8_lossy(&line[..sep]).into_owned(),
                String::from_utf8_lossy(&line[(sep + 1)..]).into_owned(),
            );
        }
    }
    headers
}

fn parse_tree_entries(raw: &[u8]) -> Vec<(Vec<u8>, Vec<u8>, ObjectId)> {
    let mut entries = Vec::new();
    let mut rem = raw;
    while !rem.is_empty() {
        let space = rem.iter().position(|&b| b == b' ').unwrap();
        let mode = rem[..space].to_vec();
        rem = &rem[(space + 1)..];
        let nul = rem.iter().position(|&b| b == b'\0').unwrap();
        let name = rem[..nul].to_vec();
        rem = &rem[(nul + 1)..];
        let (oid, rest) = rem.split_at(20);
        entries.push((mode, name, ObjectId::try_from(oid).unwrap()));
        rem = rest;
    }
    entries
}

fn get_tmp_dir() -> Result<PathBuf, String> {
    use rand::{Rng as _, SeedableRng as _};

    let mut rng = rand::rngs::StdRng::from_os_rng();

    loop {
        let mut path = PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
        path.push(format!("loader-test-{:08x}", rng.random::<u32>()));

        match std::fs::create_dir(&path) {
            Ok(()) => {
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                continue;
            }
            Err(e) => {
                return Err(format!("failed to create directory {path:?}: {e}"));
            }
        }
    }
}

fn make_svn_dump(
    test_def: &defs::Test,
    head: Option<u32>,
    alter: Option<&defs::Alter>,
) -> Vec<u8> {
    use std::io::Write as _;

    let mut dump = Vec::<u8>::new();

    dump.extend(b"SVN-fs-dump-format-version: ");
    dump.extend(match test_def.svn_dump_version {
        defs::SvnDumpVersion::Two => b"2\n\n".as_slice(),
        defs::SvnDumpVersion::Three => b"3\n\n".as_slice(),
    });

    if let Some(ref svn_uuid) = test_def.svn_uuid {
        dump.extend(b"UUID: ");
        dump.extend(svn_uuid.as_bytes());
        dump.extend(b"\n\n");
    }

    let mut rev0_props = Vec::<u8>::new();
    end_svn_props(&mut rev0_props);

    dump.extend(b"Revision-number: 0\n");
    writeln!(dump, "Prop-content-length: {}", rev0_props.len()).unwrap();
    writeln!(dump, "Content-length: {}", rev0_props.len()).unwrap();
    dump.extend(b"\n");
    dump.extend(rev0_props);
    dump.extend(b"\n");

    let mut prev_svn_rev_no = 0;
    for svn_rev in test_def.svn_revs.iter() {
        let svn_rev_no = svn_rev.no.unwrap_or(prev_svn_rev_no + 1);
        if head.is_some_and(|head| svn_rev_no > head) {
            break;
        }

        let mut props = svn_rev.props.clone();
        if let Some(alter) = alter.filter(|alter| alter.rev == svn_rev_no) {
            if let Some(ref author) = alter.author {
                props.insert("svn:author".into(), author.clone());
            }
            if let Some(ref message) = alter.message {
                props.insert("svn:log".into(), message.clone());
            }
        }

        let mut rev_props = Vec::<u8>::new();
        for (prop_name, prop_value) in props.iter() {
            push_svn_prop(
                prop_name.as_bytes(),
                Some(prop_value.as_bytes()),
                &mut rev_props,
            );
        }
        end_svn_props(&mut rev_props);

        writeln!(dump, "Revision-number: {svn_rev_no}").unwrap();
        writeln!(dump, "Prop-content-length: {}", rev_props.len()).unwrap();
        writeln!(dump, "Content-length: {}", rev_props.len()).unwrap();
        dump.extend(b"\n");
        dump.extend(&rev_props);
        dump.extend(b"\n");

        for svn_node in svn_rev.nodes.iter() {
            let node_props = svn_node.props.as_ref().map(|props| {
                let mut node_props = Vec::<u8>::new();
                for (prop_name, prop_value) in props.iter() {
                    push_svn_prop(
                        prop_name.as_bytes(),
                        prop_value.as_ref().map(String::as_bytes),
                        &mut node_props,
                    );
                }
                end_svn_props(&mut node_props);
                node_props
            });

            dump.extend(b"Node-path: ");
            dump.extend(svn_node.path.as_bytes());
            dump.extend(b"\n");

            if let Some(ref kind) = svn_node.kind {
                dump.extend(b"Node-kind: ");
                dump.extend(match kind {
                    defs::SvnNodeKind::File => b"file".as_slice(),
                    defs::SvnNodeKind::Dir => b"dir".as_slice(),
                });
                dump.extend(b"\n");
            }

            dump.extend(b"Node-action: ");
            dump.extend(match svn_node.action {
                defs::SvnNodeAction::Change => b"change".as_slice(),
                defs::SvnNodeAction::Add => b"add".as_slice(),
                defs::SvnNodeAction::Delete => b"delete".as_slice(),
                defs::SvnNodeAction::Replace => b"replace".as_slice(),
            });
            dump.extend(b"\n");

            if let Some(ref copy_from_path) = svn_node.copy_from_path {
                dump.extend(b"Node-copyfrom-path: ");
                dump.extend(copy_from_path.as_bytes());
                dump.extend(b"\n");
                writeln!(
                    dump,
                    "Node-copyfrom-rev: {}",
                    svn_node.copy_from_rev.unwrap_or(prev_svn_rev_no),
                )
                .unwrap();
            }

            if let Some(prop_delta) = svn_node.prop_delta {
                writeln!(
                    dump,
                    "Prop-delta: {}",
                    if prop_delta { "true" } else { "false" },
                )
                .unwrap();
            }

            if let Some(text_delta) = svn_node.text_delta {
                writeln!(
                    dump,
                    "Text-delta: {}",
                    if text_delta { "true" } else { "false" },
                )
                .unwrap();
            }

            let props_len = node_props.as_ref().map(Vec::len);
            let text_len = svn_node.text.as_ref().map(defs::Bytes::len);
            if let Some(props_len) = props_len {
                writeln!(dump, "Prop-content-length: {props_len}").unwrap();
            }
            if let Some(text_len) = text_len {
                writeln!(dump, "Text-content-length: {text_len}").unwrap();
            }
            writeln!(
                dump,
                "Content-length: {}",
                props_len.unwrap_or(0) + text_len.unwrap_or(0)
            )
            .unwrap();
            dump.extend(b"\n");

            if let Some(ref node_props) = node_props {
                dump.extend(node_props);
            }
            if let Some(ref text) = svn_node.text {
                dump.extend(text.as_slice());
            }
            dump.extend(b"\n");
        }

        prev_svn_rev_no = svn_rev_no;
    }

    dump
}

fn push_svn_prop(k: &[u8], v: Option<&[u8]>, out: &mut Vec<u8>) {
    use std::io::Write as _;

    if let Some(v) = v {
        writeln!(out, "K {}", k.len()).unwrap();
        out.extend(k);
        writeln!(out, "\nV {}", v.len()).unwrap();
        out.extend(v);
    } else {
        writeln!(out, "D {}", k.len()).unwrap();
        out.extend(k);
    }
    out.push(b'\n');
}

fn end_svn_props(out: &mut Vec<u8>) {
    out.extend(b"PROPS-END\n");
}
