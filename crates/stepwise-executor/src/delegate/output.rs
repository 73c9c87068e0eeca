//! Output streams handed to steps and workers.

use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use stepwise_events::{BuildEvent, BuildEventStore, Origin};

use crate::vars::RedactionTracker;

/// A shareable writer.
///
/// `flush` also emits any buffered partial line, so callers flush once
/// they are done writing.
#[derive(Clone)]
pub struct OutputStream {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputStream {
    /// Wraps a writer
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// A stream that discards everything
    #[must_use]
    pub fn sink() -> Self {
        Self::new(io::sink())
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream").finish_non_exhaustive()
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// Masks tracked credentials in whole lines before passing them on
pub struct RedactingWriter<W: Write> {
    inner: W,
    tracker: Arc<RedactionTracker>,
    partial: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    /// Wraps `inner`
    pub fn new(inner: W, tracker: Arc<RedactionTracker>) -> Self {
        Self {
            inner,
            tracker,
            partial: Vec::new(),
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        self.inner.write_all(self.tracker.redact(&text).as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.extend_from_slice(buf);
        if let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') {
            let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
            self.emit(&complete)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.emit(&rest)?;
        }
        self.inner.flush()
    }
}

/// Saves everything written as `Log` events of one plan node
pub struct EventWriter {
    store: Arc<dyn BuildEventStore>,
    build_id: u64,
    origin: Origin,
}

impl EventWriter {
    /// Writes into `build_id`'s event log with `origin`
    pub fn new(store: Arc<dyn BuildEventStore>, build_id: u64, origin: Origin) -> Self {
        Self {
            store,
            build_id,
            origin,
        }
    }
}

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let payload = String::from_utf8_lossy(buf).into_owned();
        self.store
            .save_event(self.build_id, BuildEvent::log(self.origin.clone(), payload))
            .map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
