// svndiff format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/svndiff

//! Window-at-a-time svndiff0 application. Memory stays bounded by the base
//! content plus one window's instructions, new data and target view; the
//! delta itself is consumed from a stream and never materialized whole.

// windows larger than this are considered malformed (svn produces ~100 KiB)
const MAX_WINDOW_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum ApplyError {
    DeltaIo(std::io::Error),
    InvalidHeader,
    UnsupportedVersion(u8),
    InvalidVarLenInt,
    WindowTooLarge,
    SourceViewOutOfBounds {
        source_len: usize,
        view_offset: u64,
        view_len: u64,
    },
    TruncatedWindow,
    CopyOutOfBounds,
    NotEnoughNewData,
    InvalidInstruction,
    MismatchedTargetLen,
}

impl std::error::Error for ApplyError {}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::DeltaIo(ref e) => write!(f, "failed to read delta: {e}"),
            Self::InvalidHeader => write!(f, "invalid delta header"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported svndiff version {v}"),
            Self::InvalidVarLenInt => write!(f, "invalid variable-length integer"),
            Self::WindowTooLarge => write!(f, "window exceeds maximum size"),
            Self::SourceViewOutOfBounds {
                source_len,
                view_offset,
                view_len,
            } => write!(
                f,
                "source view with offset {view_offset} and length {view_len} out of bounds, source length is {source_len}",
            ),
            Self::TruncatedWindow => write!(f, "truncated window"),
            Self::CopyOutOfBounds => write!(f, "copy instruction out of bounds"),
            Self::NotEnoughNewData => write!(f, "not enough new data"),
            Self::InvalidInstruction => write!(f, "invalid instruction"),
            Self::MismatchedTargetLen => write!(f, "mismatched target length"),
        }
    }
}

/// Apply an svndiff0 stream against `source`, appending the reconstructed
/// content to `target`.
pub fn apply(
    delta: &mut dyn std::io::Read,
    source: &[u8],
    target: &mut Vec<u8>,
) -> Result<(), ApplyError> {
    let mut header = [0u8; 4];
    read_exact(delta, &mut header)?;
    match header {
        [b'S', b'V', b'N', 0] => {}
        [b'S', b'V', b'N', version @ 1..=u8::MAX] => {
            // versions 1 and 2 add per-window compression
            return Err(ApplyError::UnsupportedVersion(version));
        }
        _ => return Err(ApplyError::InvalidHeader),
    }

    while let Some(window) = WindowHeader::read(delta)? {
        apply_window(delta, &window, source, target)?;
    }

    Ok(())
}

struct WindowHeader {
    source_view_offset: u64,
    source_view_len: u64,
    target_view_len: u64,
    instructions_len: u64,
    new_data_len: u64,
}

impl WindowHeader {
    // `None` on a clean end of stream between windows.
    fn read(delta: &mut dyn std::io::Read) -> Result<Option<Self>, ApplyError> {
        let Some(first) = read_byte_opt(delta)? else {
            return Ok(None);
        };

        let header = Self {
            source_view_offset: read_var_len_int(delta, Some(first))?,
            source_view_len: read_var_len_int(delta, None)?,
            target_view_len: read_var_len_int(delta, None)?,
            instructions_len: read_var_len_int(delta, None)?,
            new_data_len: read_var_len_int(delta, None)?,
        };

        if header.source_view_len > MAX_WINDOW_LEN
            || header.target_view_len > MAX_WINDOW_LEN
            || header.instructions_len > MAX_WINDOW_LEN
            || header.new_data_len > MAX_WINDOW_LEN
        {
            return Err(ApplyError::WindowTooLarge);
        }

        Ok(Some(header))
    }
}

fn apply_window(
    delta: &mut dyn std::io::Read,
    window: &WindowHeader,
    source: &[u8],
    target: &mut Vec<u8>,
) -> Result<(), ApplyError> {
    let view_offset = usize::try_from(window.source_view_offset)
        .ok()
        .filter(|&o| o <= source.len());
    let source_view = view_offset
        .and_then(|offset| source.get(offset..offset + window.source_view_len as usize))
        .ok_or(ApplyError::SourceViewOutOfBounds {
            source_len: source.len(),
            view_offset: window.source_view_offset,
            view_len: window.source_view_len,
        })?;

    let mut instructions = vec![0; window.instructions_len as usize];
    read_exact(delta, &mut instructions)?;
    let mut new_data = vec![0; window.new_data_len as usize];
    read_exact(delta, &mut new_data)?;

    let target_view_len = window.target_view_len as usize;
    let target_base = target.len();
    target.reserve(target_view_len);

    let mut instructions = instructions.as_slice();
    let mut rem_new_data = new_data.as_slice();
    while let Some((&first, rest)) = instructions.split_first() {
        instructions = rest;

        let opcode = first >> 6;
        let mut len = u64::from(first & 0x3F);
        if len == 0 {
            len = read_var_len_int_slice(&mut instructions)?;
        }
        let len = usize::try_from(len).map_err(|_| ApplyError::WindowTooLarge)?;

        let target_view_pos = target.len() - target_base;
        if len > target_view_len || target_view_pos + len > target_view_len {
            return Err(ApplyError::MismatchedTargetLen);
        }

        match opcode {
            0b00 => {
                // copy from source view
                let offset = read_var_len_int_slice(&mut instructions)?;
                let chunk = usize::try_from(offset)
                    .ok()
                    .and_then(|offset| offset.checked_add(len).map(|end| (offset, end)))
                    .and_then(|(offset, end)| source_view.get(offset..end))
                    .ok_or(ApplyError::CopyOutOfBounds)?;
                target.extend_from_slice(chunk);
            }
            0b01 => {
                // copy from target view; may overlap its own output,
                // which replicates the already-written bytes
                let offset = read_var_len_int_slice(&mut instructions)?;
                let offset = usize::try_from(offset).map_err(|_| ApplyError::CopyOutOfBounds)?;
                if offset >= target_view_pos {
                    return Err(ApplyError::CopyOutOfBounds);
                }
                for i in 0..len {
                    let byte = target[target_base + offset + i];
                    target.push(byte);
                }
            }
            0b10 => {
                // copy from new data
                if len > rem_new_data.len() {
                    return Err(ApplyError::NotEnoughNewData);
                }
                let chunk;
                (chunk, rem_new_data) = rem_new_data.split_at(len);
                target.extend_from_slice(chunk);
            }
            _ => return Err(ApplyError::InvalidInstruction),
        }
    }

    if target.len() - target_base != target_view_len {
        return Err(ApplyError::MismatchedTargetLen);
    }

    Ok(())
}

fn read_var_len_int(
    delta: &mut dyn std::io::Read,
    first: Option<u8>,
) -> Result<u64, ApplyError> {
    let mut value = 0u64;
    let mut byte = match first {
        Some(b) => b,
        None => read_byte(delta)?,
    };
    loop {
        if value > (u64::MAX >> 7) {
            return Err(ApplyError::InvalidVarLenInt);
        }
        value = (value << 7) | u64::from(byte & 0x7F);
        if (byte & 0x80) == 0 {
            return Ok(value);
        }
        byte = read_byte(delta)?;
    }
}

fn read_var_len_int_slice(src: &mut &[u8]) -> Result<u64, ApplyError> {
    let mut value = 0u64;
    loop {
        let byte;
        (byte, *src) = src.split_first().ok_or(ApplyError::TruncatedWindow)?;

        if value > (u64::MAX >> 7) {
            return Err(ApplyError::InvalidVarLenInt);
        }
        value = (value << 7) | u64::from(byte & 0x7F);
        if (byte & 0x80) == 0 {
            return Ok(value);
        }
    }
}

fn read_byte(delta: &mut dyn std::io::Read) -> Result<u8, ApplyError> {
    let mut buf = [0u8; 1];
    read_exact(delta, &mut buf)?;
    Ok(buf[0])
}

fn read_byte_opt(delta: &mut dyn std::io::Read) -> Result<Option<u8>, ApplyError> {
    let mut buf = [0u8; 1];
    loop {
        match delta.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ApplyError::DeltaIo(e)),
        }
    }
}

fn read_exact(delta: &mut dyn std::io::Read, buf: &mut [u8]) -> Result<(), ApplyError> {
    delta.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ApplyError::TruncatedWindow
        } else {
            ApplyError::DeltaIo(e)
        }
    })
}

/// Wrap plain content as an svndiff0 stream of new-data windows. Used when a
/// source hands over full text instead of a delta, so that the editor has a
/// single text path.
pub fn encode_fulltext(content: &[u8]) -> Vec<u8> {
    const ENCODE_WINDOW: usize = 100 * 1024;

    let mut out = Vec::with_capacity(content.len() + 16);
    out.extend(b"SVN\0");
    for chunk in content.chunks(ENCODE_WINDOW) {
        encode_uint(0, &mut out); // source view offset
        encode_uint(0, &mut out); // source view length
        encode_uint(chunk.len() as u64, &mut out); // target view length

        let mut instruction = Vec::with_capacity(8);
        if chunk.len() < 0x40 {
            instruction.push(0x80 | chunk.len() as u8);
        } else {
            instruction.push(0x80);
            encode_uint(chunk.len() as u64, &mut instruction);
        }

        encode_uint(instruction.len() as u64, &mut out);
        encode_uint(chunk.len() as u64, &mut out);
        out.extend(&instruction);
        out.extend(chunk);
    }
    out
}

fn encode_uint(mut value: u64, out: &mut Vec<u8>) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7F) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in (1..n).rev() {
        out.push(groups[i] | 0x80);
    }
    out.push(groups[0]);
}
