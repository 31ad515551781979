use std::collections::BTreeMap;

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Test {
    #[serde(rename = "svn-dump-version", default = "dump_version_2")]
    pub(crate) svn_dump_version: SvnDumpVersion,
    #[serde(rename = "svn-uuid")]
    pub(crate) svn_uuid: Option<String>,
    #[serde(rename = "svn-revs")]
    pub(crate) svn_revs: Vec<SvnRev>,
    /// Consecutive loads of the same origin into one archive.
    pub(crate) runs: Vec<Run>,
}

#[derive(serde::Deserialize, PartialEq, Eq)]
pub(crate) enum SvnDumpVersion {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
}

#[inline(always)]
fn dump_version_2() -> SvnDumpVersion {
    SvnDumpVersion::Two
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Run {
    /// Serve the dump truncated to this head revision (the full dump when
    /// absent), simulating a repository that grows between visits.
    pub(crate) head: Option<u32>,
    #[serde(rename = "start-from-scratch", default = "false_")]
    pub(crate) start_from_scratch: bool,
    /// Rewrite the revision properties of one revision before serving the
    /// dump, simulating altered history.
    pub(crate) alter: Option<Alter>,
    #[serde(rename = "expect-error")]
    pub(crate) expect_error: Option<ExpectError>,
    #[serde(rename = "expect-status")]
    pub(crate) expect_status: Option<ExpectStatus>,
    /// Expected snapshot identifier (hex).
    pub(crate) snapshot: Option<String>,
    /// Expected `(tree, revision)` identifiers per SVN revision.
    #[serde(default = "BTreeMap::new")]
    pub(crate) revs: BTreeMap<u32, RevExpect>,
    /// Pairs of paths whose subtree identifiers must match in the final
    /// root tree.
    #[serde(rename = "subtree-equal", default = "Vec::new")]
    pub(crate) subtree_equal: Vec<SubtreeEqual>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Alter {
    pub(crate) rev: u32,
    pub(crate) author: Option<String>,
    pub(crate) message: Option<String>,
}

#[derive(serde::Deserialize, PartialEq, Eq)]
pub(crate) enum ExpectError {
    #[serde(rename = "history-altered")]
    HistoryAltered,
}

#[derive(serde::Deserialize, PartialEq, Eq)]
pub(crate) enum ExpectStatus {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "uneventful")]
    Uneventful,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RevExpect {
    pub(crate) tree: String,
    pub(crate) revision: String,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SubtreeEqual {
    pub(crate) a: String,
    pub(crate) b: String,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SvnRev {
    pub(crate) no: Option<u32>,
    #[serde(default = "BTreeMap::new")]
    pub(crate) props: BTreeMap<String, String>,
    #[serde(default = "Vec::new")]
    pub(crate) nodes: Vec<SvnNode>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SvnNode {
    pub(crate) path: String,
    pub(crate) kind: Option<SvnNodeKind>,
    pub(crate) action: SvnNodeAction,
    #[serde(rename = "copy-from-path")]
    pub(crate) copy_from_path: Option<String>,
    #[serde(rename = "copy-from-rev")]
    pub(crate) copy_from_rev: Option<u32>,
    #[serde(rename = "prop-delta")]
    pub(crate) prop_delta: Option<bool>,
    #[serde(rename = "text-delta")]
    pub(crate) text_delta: Option<bool>,
    pub(crate) props: Option<BTreeMap<String, Option<String>>>,
    pub(crate) text: Option<Bytes>,
}

#[derive(serde::Deserialize, PartialEq, Eq)]
pub(crate) enum SvnNodeKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "dir")]
    Dir,
}

#[derive(serde::Deserialize, PartialEq, Eq)]
pub(crate) enum SvnNodeAction {
    #[serde(rename = "change")]
    Change,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "replace")]
    Replace,
}

pub(crate) struct Bytes(Vec<u8>);

impl Bytes {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl<'de> serde::Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(BytesVisitor).map(Self)
    }
}

struct BytesVisitor;

impl<'de> serde::de::Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a string or byte array")
    }

    fn visit_str<E>(self, v: &str) -> Result<Vec<u8>, E>
    where
        E: serde::de::Error,
    {
        Ok(v.as_bytes().to_vec())
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.into_bytes())
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}

#[inline(always)]
fn false_() -> bool {
    false
}
