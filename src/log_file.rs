use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Bytes of length prefix in front of every entry.
pub const LEN_PREFIX: u32 = 4;

/// Largest accepted payload. Offsets are 32-bit; a length prefix above
/// this is treated as corruption on the read side.
pub const MAX_PAYLOAD: u32 = i32::max_value() as u32;

/// Size of `payload` once framed on disk or on the wire.
pub fn framed_len(payload: &[u8]) -> u32 {
    LEN_PREFIX + payload.len() as u32
}

/// Append half of the log file pair. Opened once, positioned at
/// end-of-file; the file's length is the node's initial `current`.
pub struct LogWriter {
    file: File,
    fsync_on_append: bool,
}

impl LogWriter {
    pub fn open<P: AsRef<Path>>(path: P, fsync_on_append: bool) -> io::Result<(LogWriter, u64)> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok((
            LogWriter {
                file,
                fsync_on_append,
            },
            len,
        ))
    }

    /// Writes the length prefix and payload. Returns the number of bytes
    /// the entry occupies on disk (`4 + payload.len()`).
    pub fn append(&mut self, payload: &[u8]) -> io::Result<u32> {
        let len = payload.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(payload)?;
        if self.fsync_on_append {
            self.file.sync_data()?;
        }
        Ok(LEN_PREFIX + len)
    }
}

/// Random-access half of the pair, used by recovery and the replicator.
/// Tracks its own position; `seek` repositions it on rewind or takeover.
pub struct LogReader {
    file: File,
    pos: u32,
}

impl LogReader {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<LogReader> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(LogReader { file, pos: 0 })
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn seek(&mut self, offset: u32) {
        self.pos = offset;
    }

    /// Reads the entry whose length prefix starts at the current position
    /// and advances past it. A short read at either step means the log is
    /// truncated mid-entry and fails the call.
    pub fn read_entry(&mut self) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; LEN_PREFIX as usize];
        self.file.read_exact_at(&mut len_buf, self.pos as u64)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry length {} at offset {} out of range", len, self.pos),
            ));
        }
        let next = match self.pos.checked_add(LEN_PREFIX + len) {
            Some(n) => n,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entry at {} ends past 32-bit offset space", self.pos),
                ))
            }
        };
        let mut payload = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut payload, self.pos as u64 + LEN_PREFIX as u64)?;
        self.pos = next;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("repl.log")
    }

    #[test]
    fn append_then_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, len) = LogWriter::open(log_path(&dir), false).unwrap();
        assert_eq!(len, 0);
        assert_eq!(writer.append(b"abc").unwrap(), 7);
        assert_eq!(writer.append(b"").unwrap(), 4);
        assert_eq!(writer.append(b"defg").unwrap(), 8);

        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        assert_eq!(reader.read_entry().unwrap(), b"abc");
        assert_eq!(reader.read_entry().unwrap(), b"");
        assert_eq!(reader.read_entry().unwrap(), b"defg");
        assert_eq!(reader.pos(), 19);
    }

    #[test]
    fn reopen_reports_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut writer, _) = LogWriter::open(log_path(&dir), false).unwrap();
            writer.append(b"hello").unwrap();
        }
        let (_, len) = LogWriter::open(log_path(&dir), false).unwrap();
        assert_eq!(len, 9);
    }

    #[test]
    fn seek_rereads_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _) = LogWriter::open(log_path(&dir), false).unwrap();
        writer.append(b"abc").unwrap();
        writer.append(b"xyz").unwrap();

        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        reader.read_entry().unwrap();
        reader.read_entry().unwrap();
        reader.seek(7);
        assert_eq!(reader.read_entry().unwrap(), b"xyz");
    }

    #[test]
    fn truncated_tail_fails_the_read() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut writer, _) = LogWriter::open(log_path(&dir), false).unwrap();
            writer.append(b"abc").unwrap();
        }
        // Lop off the last payload byte.
        let file = OpenOptions::new()
            .write(true)
            .open(log_path(&dir))
            .unwrap();
        file.set_len(6).unwrap();

        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        let err = reader.read_entry().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn short_length_prefix_fails_the_read() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut file = File::create(log_path(&dir)).unwrap();
            file.write_all(&[3u8, 0]).unwrap();
        }
        let mut reader = LogReader::open(log_path(&dir)).unwrap();
        assert!(reader.read_entry().is_err());
    }
}
