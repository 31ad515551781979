// SVN dump file format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/dump-load-format.txt

use std::collections::HashMap;
use std::io::Read as _;

#[derive(Debug)]
pub enum ReadError {
    Io(std::io::Error),
    BrokenHeader,
    InvalidVersion { version: Vec<u8> },
    MissingHeaderEntry { key: &'static str },
    UnexpectedHeaderEntry { key: &'static str },
    InvalidHeaderEntry { key: &'static str, value: Vec<u8> },
    UnknownRecordType,
    MismatchedContentLen,
    BrokenProperties,
}

impl From<std::io::Error> for ReadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::error::Error for ReadError {}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read dump: {e}"),
            Self::BrokenHeader => write!(f, "broken record header"),
            Self::InvalidVersion { ref version } => {
                write!(f, "invalid dump version: \"{}\"", version.escape_ascii())
            }
            Self::MissingHeaderEntry { key } => write!(f, "missing header entry: \"{key}\""),
            Self::UnexpectedHeaderEntry { key } => {
                write!(f, "unexpected header entry: \"{key}\"")
            }
            Self::InvalidHeaderEntry { key, ref value } => write!(
                f,
                "invalid value for header entry \"{key}\": \"{}\"",
                value.escape_ascii(),
            ),
            Self::UnknownRecordType => write!(f, "unknown record type"),
            Self::MismatchedContentLen => write!(f, "mismatched content length"),
            Self::BrokenProperties => write!(f, "broken property section"),
        }
    }
}

pub enum Record {
    Uuid(uuid::Uuid),
    Revision(RevisionRecord),
    Node(NodeRecord),
}

pub struct RevisionRecord {
    pub number: u32,
    pub properties: HashMap<Vec<u8>, Vec<u8>>,
}

pub struct NodeRecord {
    pub path: Vec<u8>,
    pub kind: Option<NodeKind>,
    pub action: NodeAction,
    pub copy_from: Option<(u32, Vec<u8>)>,
    pub properties: Option<PropertySection>,
    /// When present, the text payload follows the record and must be drained
    /// with [`DumpReader::take_text`] before the next record is read.
    pub text: Option<TextSection>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeAction {
    Change,
    Add,
    Delete,
    Replace,
}

pub struct PropertySection {
    pub is_delta: bool,
    /// `None` values are deletions (only valid in delta sections).
    pub properties: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

#[derive(Copy, Clone)]
pub struct TextSection {
    pub is_delta: bool,
    pub length: u64,
}

pub struct DumpReader<'a> {
    source: &'a mut dyn std::io::BufRead,
    deltas_allowed: bool,
    rem_text_len: u64,
}

impl<'a> DumpReader<'a> {
    pub fn new(source: &'a mut dyn std::io::BufRead) -> Result<Self, ReadError> {
        let header = read_header_block(source)?
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;

        let raw_version = header
            .get(b"SVN-fs-dump-format-version".as_slice())
            .ok_or(ReadError::MissingHeaderEntry {
                key: "SVN-fs-dump-format-version",
            })?;
        let deltas_allowed = match raw_version.as_slice() {
            b"2" => false,
            b"3" => true,
            _ => {
                return Err(ReadError::InvalidVersion {
                    version: raw_version.clone(),
                });
            }
        };

        Ok(Self {
            source,
            deltas_allowed,
            rem_text_len: 0,
        })
    }

    pub fn next_record(&mut self) -> Result<Option<Record>, ReadError> {
        assert_eq!(self.rem_text_len, 0, "text payload has not been drained");

        let Some(header) = read_header_block(self.source)? else {
            return Ok(None);
        };

        let has_uuid = header.contains_key(b"UUID".as_slice());
        let has_rev = header.contains_key(b"Revision-number".as_slice());
        let has_node = header.contains_key(b"Node-path".as_slice());
        match (has_uuid, has_rev, has_node) {
            (true, false, false) => self.read_uuid_record(&header).map(Some),
            (false, true, false) => self.read_revision_record(&header).map(Some),
            (false, false, true) => self.read_node_record(header).map(Some),
            _ => Err(ReadError::UnknownRecordType),
        }
    }

    fn read_uuid_record(&mut self, header: &HeaderBlock) -> Result<Record, ReadError> {
        if header_u64(header, "Content-length")?.unwrap_or(0) != 0 {
            return Err(ReadError::MismatchedContentLen);
        }

        let raw_uuid = &header[b"UUID".as_slice()];
        let uuid =
            uuid::Uuid::try_parse_ascii(raw_uuid).map_err(|_| ReadError::InvalidHeaderEntry {
                key: "UUID",
                value: raw_uuid.clone(),
            })?;
        Ok(Record::Uuid(uuid))
    }

    fn read_revision_record(&mut self, header: &HeaderBlock) -> Result<Record, ReadError> {
        let number = header_u32(header, "Revision-number")?.unwrap();

        let prop_len = header_u64(header, "Prop-content-length")?;
        if prop_len.unwrap_or(0) != header_u64(header, "Content-length")?.unwrap_or(0) {
            return Err(ReadError::MismatchedContentLen);
        }

        let mut properties = HashMap::new();
        if let Some(prop_len) = prop_len {
            let section = self.read_property_section(prop_len, false)?;
            properties = section
                .properties
                .into_iter()
                .map(|(k, v)| (k, v.unwrap()))
                .collect();
        }

        Ok(Record::Revision(RevisionRecord { number, properties }))
    }

    fn read_node_record(&mut self, header: HeaderBlock) -> Result<Record, ReadError> {
        let path = header[b"Node-path".as_slice()].clone();

        let kind = match header.get(b"Node-kind".as_slice()).map(Vec::as_slice) {
            None => None,
            Some(b"file") => Some(NodeKind::File),
            Some(b"dir") => Some(NodeKind::Dir),
            Some(other) => {
                return Err(ReadError::InvalidHeaderEntry {
                    key: "Node-kind",
                    value: other.to_vec(),
                });
            }
        };

        let action = match header.get(b"Node-action".as_slice()).map(Vec::as_slice) {
            None => {
                return Err(ReadError::MissingHeaderEntry { key: "Node-action" });
            }
            Some(b"change") => NodeAction::Change,
            Some(b"add") => NodeAction::Add,
            Some(b"delete") => NodeAction::Delete,
            Some(b"replace") => NodeAction::Replace,
            Some(other) => {
                return Err(ReadError::InvalidHeaderEntry {
                    key: "Node-action",
                    value: other.to_vec(),
                });
            }
        };

        let copy_from_rev = header_u32(&header, "Node-copyfrom-rev")?;
        let copy_from_path = header.get(b"Node-copyfrom-path".as_slice());
        let copy_from = match (copy_from_rev, copy_from_path) {
            (None, None) => None,
            (Some(rev), Some(path)) => Some((rev, path.clone())),
            (Some(_), None) => {
                return Err(ReadError::MissingHeaderEntry {
                    key: "Node-copyfrom-path",
                });
            }
            (None, Some(_)) => {
                return Err(ReadError::MissingHeaderEntry {
                    key: "Node-copyfrom-rev",
                });
            }
        };

        let prop_len = header_u64(&header, "Prop-content-length")?;
        let text_len = header_u64(&header, "Text-content-length")?;
        let expected_content_len = prop_len
            .unwrap_or(0)
            .checked_add(text_len.unwrap_or(0))
            .ok_or(ReadError::MismatchedContentLen)?;
        if header_u64(&header, "Content-length")?.unwrap_or(0) != expected_content_len {
            return Err(ReadError::MismatchedContentLen);
        }

        let prop_delta = self.delta_flag(&header, "Prop-delta")?;
        let text_delta = self.delta_flag(&header, "Text-delta")?;

        let properties = prop_len
            .map(|len| self.read_property_section(len, prop_delta))
            .transpose()?;

        let text = text_len.map(|length| {
            self.rem_text_len = length;
            TextSection {
                is_delta: text_delta,
                length,
            }
        });

        Ok(Record::Node(NodeRecord {
            path,
            kind,
            action,
            copy_from,
            properties,
            text,
        }))
    }

    fn delta_flag(&self, header: &HeaderBlock, key: &'static str) -> Result<bool, ReadError> {
        match header.get(key.as_bytes()).map(Vec::as_slice) {
            None => Ok(false),
            Some(_) if !self.deltas_allowed => Err(ReadError::UnexpectedHeaderEntry { key }),
            Some(b"true") => Ok(true),
            Some(b"false") => Ok(false),
            Some(other) => Err(ReadError::InvalidHeaderEntry {
                key,
                value: other.to_vec(),
            }),
        }
    }

    fn read_property_section(
        &mut self,
        len: u64,
        is_delta: bool,
    ) -> Result<PropertySection, ReadError> {
        let mut stream = std::io::Read::take(&mut self.source, len);
        match parse_properties(&mut stream, is_delta) {
            Ok(properties) => {
                if stream.limit() != 0 {
                    Err(ReadError::BrokenProperties)
                } else {
                    Ok(PropertySection {
                        is_delta,
                        properties,
                    })
                }
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                    Err(ReadError::BrokenProperties)
                }
                _ => Err(ReadError::Io(e)),
            },
        }
    }

    /// Drain the pending text payload of the last node record.
    pub fn take_text(&mut self) -> Result<Vec<u8>, ReadError> {
        let len = usize::try_from(self.rem_text_len).expect("text payload too large");
        let mut data = vec![0; len];
        self.source.read_exact(&mut data)?;
        self.rem_text_len = 0;
        Ok(data)
    }
}

type HeaderBlock = HashMap<Vec<u8>, Vec<u8>>;

fn read_header_block(r: &mut dyn std::io::BufRead) -> Result<Option<HeaderBlock>, ReadError> {
    let mut line = Vec::new();
    r.read_until(b'\n', &mut line)?;
    while line == b"\n" {
        line.clear();
        r.read_until(b'\n', &mut line)?;
    }
    if line.is_empty() {
        return Ok(None);
    }

    let mut block = HashMap::new();
    while line != b"\n" {
        let entry = line.strip_suffix(b"\n").ok_or(ReadError::BrokenHeader)?;
        let sep = entry
            .windows(2)
            .position(|w| w == b": ")
            .ok_or(ReadError::BrokenHeader)?;
        block.insert(entry[..sep].to_vec(), entry[(sep + 2)..].to_vec());

        line.clear();
        r.read_until(b'\n', &mut line)?;
        if line.is_empty() {
            return Err(ReadError::BrokenHeader);
        }
    }

    Ok(Some(block))
}

fn header_u64(header: &HeaderBlock, key: &'static str) -> Result<Option<u64>, ReadError> {
    header
        .get(key.as_bytes())
        .map(|raw| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key,
                    value: raw.clone(),
                })
        })
        .transpose()
}

fn header_u32(header: &HeaderBlock, key: &'static str) -> Result<Option<u32>, ReadError> {
    header
        .get(key.as_bytes())
        .map(|raw| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key,
                    value: raw.clone(),
                })
        })
        .transpose()
}

// Property sections are `K <len>\n<key>\nV <len>\n<value>\n` pairs (plus
// `D <len>\n<key>\n` deletions in delta sections) ended by `PROPS-END`.
fn parse_properties(
    r: &mut dyn std::io::Read,
    is_delta: bool,
) -> Result<HashMap<Vec<u8>, Option<Vec<u8>>>, std::io::Error> {
    fn invalid() -> std::io::Error {
        std::io::Error::from(std::io::ErrorKind::InvalidData)
    }

    fn read_line(r: &mut dyn std::io::Read, buf: &mut Vec<u8>) -> Result<(), std::io::Error> {
        buf.clear();
        loop {
            let mut byte = [0];
            r.read_exact(&mut byte)?;
            if byte[0] == b'\n' {
                return Ok(());
            }
            buf.push(byte[0]);
        }
    }

    fn read_counted(r: &mut dyn std::io::Read, raw_len: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let len = std::str::from_utf8(raw_len)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(invalid)?;
        let mut data = vec![0; len];
        r.read_exact(&mut data)?;
        let mut newline = [0];
        r.read_exact(&mut newline)?;
        if newline != *b"\n" {
            return Err(invalid());
        }
        Ok(data)
    }

    let mut props = HashMap::new();
    let mut line = Vec::new();
    loop {
        read_line(r, &mut line)?;
        if line == b"PROPS-END" {
            return Ok(props);
        }

        if line.starts_with(b"K ") {
            let key = read_counted(r, &line[2..])?;
            read_line(r, &mut line)?;
            if !line.starts_with(b"V ") {
                return Err(invalid());
            }
            let value = read_counted(r, &line[2..])?;
            props.insert(key, Some(value));
        } else if line.starts_with(b"D ") {
            if !is_delta {
                return Err(invalid());
            }
            let key = read_counted(r, &line[2..])?;
            props.insert(key, None);
        } else {
            return Err(invalid());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DumpReader, NodeAction, NodeKind, Record};

    fn read_all(dump: &[u8]) -> Vec<Record> {
        let mut source = dump;
        let mut reader = DumpReader::new(&mut source).unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            if let Record::Node(ref node) = record {
                if node.text.is_some() {
                    reader.take_text().unwrap();
                }
            }
            records.push(record);
        }
        records
    }

    #[test]
    fn test_minimal_dump() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            UUID: 3187e211-bb14-4c82-9596-0b59d67cd7f4\n\n\
            Revision-number: 0\n\
            Prop-content-length: 10\n\
            Content-length: 10\n\n\
            PROPS-END\n\n\
            Revision-number: 1\n\
            Prop-content-length: 30\n\
            Content-length: 30\n\n\
            K 7\nsvn:log\nV 3\nmsg\n\
            PROPS-END\n\n\
            Node-path: foo\n\
            Node-kind: file\n\
            Node-action: add\n\
            Text-content-length: 4\n\
            Content-length: 4\n\n\
            data\n\n";

        let records = read_all(dump);
        assert_eq!(records.len(), 4);
        assert!(matches!(records[0], Record::Uuid(_)));
        let Record::Revision(ref rev1) = records[2] else {
            panic!("expected revision record");
        };
        assert_eq!(rev1.number, 1);
        assert_eq!(rev1.properties.get(b"svn:log".as_slice()).unwrap(), b"msg");
        let Record::Node(ref node) = records[3] else {
            panic!("expected node record");
        };
        assert_eq!(node.path, b"foo");
        assert_eq!(node.kind, Some(NodeKind::File));
        assert_eq!(node.action, NodeAction::Add);
        assert_eq!(node.text.unwrap().length, 4);
    }

    #[test]
    fn test_copyfrom_and_delete() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 1\n\n\
            Node-path: branches/b1\n\
            Node-kind: dir\n\
            Node-action: add\n\
            Node-copyfrom-rev: 7\n\
            Node-copyfrom-path: trunk\n\n\
            Node-path: trunk\n\
            Node-action: delete\n\n";

        let records = read_all(dump);
        let Record::Node(ref copied) = records[1] else {
            panic!("expected node record");
        };
        assert_eq!(copied.copy_from.as_ref().unwrap(), &(7, b"trunk".to_vec()));
        let Record::Node(ref deleted) = records[2] else {
            panic!("expected node record");
        };
        assert_eq!(deleted.action, NodeAction::Delete);
        assert_eq!(deleted.kind, None);
    }

    #[test]
    fn test_prop_delta_deletion() {
        let dump = b"SVN-fs-dump-format-version: 3\n\n\
            Revision-number: 1\n\n\
            Node-path: f\n\
            Node-kind: file\n\
            Node-action: change\n\
            Prop-delta: true\n\
            Prop-content-length: 29\n\
            Content-length: 29\n\n\
            D 13\nsvn:eol-style\n\
            PROPS-END\n\n";

        let records = read_all(dump);
        let Record::Node(ref node) = records[1] else {
            panic!("expected node record");
        };
        let props = node.properties.as_ref().unwrap();
        assert!(props.is_delta);
        assert_eq!(
            props.properties.get(b"svn:eol-style".as_slice()),
            Some(&None),
        );
    }

    #[test]
    fn test_delta_flag_rejected_in_v2() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 1\n\n\
            Node-path: f\n\
            Node-kind: file\n\
            Node-action: change\n\
            Text-delta: true\n\
            Text-content-length: 0\n\
            Content-length: 0\n\n";

        let mut source = &dump[..];
        let mut reader = DumpReader::new(&mut source).unwrap();
        reader.next_record().unwrap(); // r1
        assert!(reader.next_record().is_err());
    }
}
