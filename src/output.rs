//! Operator-visible output.
//!
//! Every message rerun itself prints goes through a `Reporter`, which prefixes
//! the line with the tool tag and an optional elapsed-time stamp. Failure
//! output from the toolchain is passed through verbatim. The supervised
//! program writes straight to the inherited stdout/stderr and never passes
//! through here.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Formatting options for tool messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStyle {
    /// Use the `◆ rerun:` prefix instead of `[rerun]`.
    pub use_symbols: bool,
    /// Prepend an `mm:ss` stamp measured from startup.
    pub timestamp: bool,
}

/// A cloneable handle to the shared output stream.
#[derive(Clone)]
pub struct Reporter {
    style: OutputStyle,
    start: Instant,
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Reporter {
    /// Creates a reporter writing to the process's stdout.
    pub fn stdout(style: OutputStyle) -> Self {
        Self::to_writer(style, std::io::stdout())
    }

    /// Creates a reporter writing to an arbitrary sink.
    pub fn to_writer<W>(style: OutputStyle, writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            style,
            start: Instant::now(),
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Prints a prefixed tool message.
    pub fn info(&self, text: impl AsRef<str>) {
        let line = self.format_message(text.as_ref());
        self.write(&line);
    }

    /// Prints captured command output as-is, ending with a newline.
    pub fn raw(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if text.ends_with('\n') {
            self.write(text);
        } else {
            self.write(&format!("{}\n", text));
        }
    }

    fn format_message(&self, text: &str) -> String {
        let tag = format_tool_message(text, self.style.use_symbols);
        if self.style.timestamp {
            format!("{} {}\n", self.elapsed(), tag)
        } else {
            format!("{}\n", tag)
        }
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }

    fn write(&self, text: &str) {
        // A poisoned lock only means another writer panicked mid-line.
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

fn format_tool_message(text: &str, use_symbols: bool) -> String {
    if use_symbols {
        format!("◆ rerun: {}", text)
    } else {
        format!("[rerun] {}", text)
    }
}

/// An in-memory sink for asserting on printed output.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Captured {
    pub fn reporter(&self) -> Reporter {
        Reporter::to_writer(OutputStyle::default(), self.clone())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

#[cfg(test)]
impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
