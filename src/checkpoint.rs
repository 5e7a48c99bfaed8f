use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Sidecar file persisting `applied`, consulted on restart so recovery
/// replays only the suffix the state machine has not seen. Four bytes,
/// little-endian, written atomically via a temp file and rename.
pub struct AppliedCheckpoint {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl AppliedCheckpoint {
    pub fn new(path: PathBuf) -> AppliedCheckpoint {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        AppliedCheckpoint {
            path,
            tmp_path: PathBuf::from(tmp),
        }
    }

    /// Absence is not an error: a node that has never checkpointed starts
    /// applying from offset zero.
    pub fn load(&self) -> io::Result<Option<u32>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf)?;
        Ok(Some(u32::from_le_bytes(buf)))
    }

    pub fn store(&self, applied: u32) -> io::Result<()> {
        let mut tmp = File::create(&self.tmp_path)?;
        tmp.write_all(&applied.to_le_bytes())?;
        tmp.sync_data()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}
