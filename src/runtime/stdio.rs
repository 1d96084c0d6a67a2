//! Standard I/O wiring for sandboxes.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// Reader handed to a sandbox as its stdin.
pub type StdinSource = Box<dyn Read + Send + Sync>;

/// Writer handed to a sandbox as stdout or stderr.
pub type OutputSink = Box<dyn Write + Send + Sync>;

/// Shared in-memory writer.
///
/// Clones write to the same buffer, so one clone can be given to a
/// container while another reads what the sandbox printed.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        match self.inner.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the contents as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut buf = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("buffer lock poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
