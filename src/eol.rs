//! End-of-line and `svn:special` semantics.
//!
//! Subversion stores file contents with the line endings mandated by the
//! `svn:eol-style` property, and represents symbolic links as regular files
//! whose content starts with `link `. Both transformations happen before any
//! content is hashed, so that blob identifiers match what `svn export
//! --ignore-keywords` would produce.

use std::borrow::Cow;

use crate::hash_tree::FileKind;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EolStyle {
    Native,
    Lf,
    Crlf,
    Cr,
}

impl EolStyle {
    /// Parse the value of a `svn:eol-style` property. Unknown values
    /// (including `binary`) mean no normalization.
    pub fn from_prop(value: &[u8]) -> Option<Self> {
        match value {
            b"native" => Some(Self::Native),
            b"LF" => Some(Self::Lf),
            b"CRLF" => Some(Self::Crlf),
            b"CR" => Some(Self::Cr),
            _ => None,
        }
    }

    fn target(self) -> &'static [u8] {
        match self {
            Self::Native | Self::Lf => b"\n",
            Self::Crlf => b"\r\n",
            Self::Cr => b"\r",
        }
    }
}

/// Normalize line endings: every CRLF, lone CR and lone LF becomes the
/// ending mandated by `style`. Total, never fails; callers pass binary
/// content through without calling this.
pub fn normalize(data: &[u8], style: EolStyle) -> Cow<'_, [u8]> {
    let target = style.target();

    if target == b"\n" && !data.contains(&b'\r') {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut rem = data;
    while let Some((&byte, rest)) = rem.split_first() {
        match byte {
            b'\r' => {
                out.extend(target);
                rem = rest.strip_prefix(b"\n").unwrap_or(rest);
            }
            b'\n' => {
                out.extend(target);
                rem = rest;
            }
            _ => {
                out.push(byte);
                rem = rest;
            }
        }
    }
    Cow::Owned(out)
}

/// What a file's repository content becomes in the archive: its entry kind
/// and blob bytes (the link target for symlinks).
pub struct StoredFile<'a> {
    pub kind: FileKind,
    pub bytes: Cow<'a, [u8]>,
}

/// Resolve the stored form of a file from its repository content and its
/// material properties. This is the single place deciding how `svn:special`,
/// `svn:executable` and `svn:eol-style` combine, shared by the replay editor
/// and by bulk exports so both produce identical bytes.
pub fn stored_form(
    content: &[u8],
    eol_style: Option<EolStyle>,
    executable: bool,
    special: bool,
) -> StoredFile<'_> {
    if special {
        if let Some(target) = parse_special_link(content) {
            return StoredFile {
                kind: FileKind::Symlink,
                bytes: Cow::Borrowed(target),
            };
        }
        // svn:special set but the content is not a link: stays a file
    }

    let bytes = match eol_style {
        Some(style) => normalize(content, style),
        None => Cow::Borrowed(content),
    };
    StoredFile {
        kind: if executable {
            FileKind::Executable
        } else {
            FileKind::Regular
        },
        bytes,
    }
}

/// Extract the target of an svn link (`svn:special` file whose content is
/// `link <target>`). Only the first line is considered and no whitespace is
/// stripped from the target. Returns `None` when the content is not a link,
/// in which case the file stays a regular file.
pub fn parse_special_link(data: &[u8]) -> Option<&[u8]> {
    let first_line = data.split(|&b| b == b'\n').next().unwrap_or(b"");
    match first_line.split_first_chunk::<5>() {
        Some((b"link ", target)) => Some(target),
        _ if first_line == b"link" => Some(b""),
        _ => None,
    }
}
