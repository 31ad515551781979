//! Minimal in-process pipe connecting the dump decompression thread to the
//! record reader. Bounded, so the producer cannot run arbitrarily far ahead
//! of the parser.

use std::sync::mpsc;

pub(crate) struct PipeReader {
    receiver: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

pub(crate) struct PipeWriter {
    sender: mpsc::SyncSender<Vec<u8>>,
}

pub(crate) fn create() -> (PipeReader, PipeWriter) {
    let (sender, receiver) = mpsc::sync_channel(16);
    (
        PipeReader {
            receiver,
            pending: Vec::new(),
            pos: 0,
        },
        PipeWriter { sender },
    )
}

impl std::io::Read for PipeReader {
    fn read(&mut self, dest: &mut [u8]) -> std::io::Result<usize> {
        while self.pos == self.pending.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                // writer dropped: end of stream
                Err(mpsc::RecvError) => return Ok(0),
            }
        }

        let n = dest.len().min(self.pending.len() - self.pos);
        dest[..n].copy_from_slice(&self.pending[self.pos..(self.pos + n)]);
        self.pos += n;
        Ok(n)
    }
}

impl std::io::Write for PipeWriter {
    fn write(&mut self, src: &[u8]) -> std::io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        match self.sender.send(src.to_vec()) {
            Ok(()) => Ok(src.len()),
            // reader dropped: behave like a closed pipe
            Err(mpsc::SendError(_)) => Ok(0),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};

    #[test]
    fn test_roundtrip_across_threads() {
        let (mut reader, mut writer) = super::create();

        let joiner = std::thread::spawn(move || {
            for chunk in [b"abc".as_slice(), b"", b"defg"] {
                writer.write_all(chunk).unwrap();
            }
        });

        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        joiner.join().unwrap();
        assert_eq!(data, b"abcdefg");
    }

    #[test]
    fn test_reader_sees_eof_on_writer_drop() {
        let (mut reader, writer) = super::create();
        drop(writer);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
