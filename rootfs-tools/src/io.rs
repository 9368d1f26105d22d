//! I/O utilities.

use std::io::Write;

/// Byte sink decorator which keeps track of the total amount of data written and reports it to a
/// callback after every successful write.
///
/// The wrapped writer does not notice the wrapper, so it can be put in front of any output.
pub struct ProgressWriter<W> {
    writer: W,
    written: u64,
    callback: Box<dyn FnMut(u64) + Send>,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new<F>(writer: W, callback: F) -> Self
    where
        F: FnMut(u64) + Send + 'static,
    {
        Self {
            writer,
            written: 0,
            callback: Box::new(callback),
        }
    }

    /// Total number of bytes passed on to the inner writer so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        let count = self.writer.write(buf)?;
        if count > 0 {
            self.written += count as u64;
            (self.callback)(self.written);
        }
        Ok(count)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()
    }
}
