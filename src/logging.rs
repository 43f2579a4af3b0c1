use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;

/// Rotate `vboxctl.log` once it grows past this size.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

type Slot = Arc<Mutex<Option<File>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<File>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A `MakeWriter` that discards writes until a file is attached with
/// [`DeferredFileHandle::set_file`].
///
/// The subscriber is installed before the config (and with it the data
/// directory) is known.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Slot,
}

#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Slot,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`, creating parent directories.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Slot,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Move `path` to `path.1` when it is larger than `max_bytes`, replacing any
/// previous rotation. Returns the rotated path if a rotation happened.
pub fn rotate_if_large(path: &Path, max_bytes: u64) -> std::io::Result<Option<PathBuf>> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if size <= max_bytes {
        return Ok(None);
    }
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    let rotated = PathBuf::from(rotated);
    fs::rename(path, &rotated)?;
    Ok(Some(rotated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn discards_until_file_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("vboxctl.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"dropped\n").unwrap();
        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[test]
    fn rotates_only_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vboxctl.log");
        assert_eq!(rotate_if_large(&path, 4).unwrap(), None);

        fs::write(&path, "abc").unwrap();
        assert_eq!(rotate_if_large(&path, 4).unwrap(), None);

        fs::write(&path, "abcdef").unwrap();
        let rotated = rotate_if_large(&path, 4).unwrap().unwrap();
        assert!(rotated.ends_with("vboxctl.log.1"));
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(rotated).unwrap(), "abcdef");
    }
}
