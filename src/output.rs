//! Injectable terminal output.
//!
//! Commands receive a `Console` instead of printing through process-wide
//! state, so tests can hand in a capturing sink and assert on what the user
//! would have seen.

use std::fmt::Display;
use std::io::Write;
use std::sync::{Arc, Mutex};

pub mod icons {
    pub const INFO: &str = "ℹ";
    pub const SUCCESS: &str = "✓";
    pub const WARNING: &str = "⚠";
    pub const ERROR: &str = "✗";
}

pub struct Console {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    /// Console writing to process stdout.
    pub fn stdout() -> Self {
        Self {
            sink: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    /// Console writing into a shared buffer; returns the buffer for
    /// assertions.
    pub fn captured() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let console = Self {
            sink: Mutex::new(Box::new(SharedBuffer(Arc::clone(&buffer)))),
        };
        (console, buffer)
    }

    pub fn line(&self, msg: impl Display) {
        let mut sink = self.sink.lock().expect("console lock poisoned");
        writeln!(sink, "{msg}").ok();
    }

    pub fn info(&self, msg: impl Display) {
        self.line(format_args!("{} {msg}", icons::INFO));
    }

    pub fn success(&self, msg: impl Display) {
        self.line(format_args!("{} {msg}", icons::SUCCESS));
    }

    pub fn warn(&self, msg: impl Display) {
        self.line(format_args!("{} {msg}", icons::WARNING));
    }

    pub fn error(&self, msg: impl Display) {
        self.line(format_args!("{} {msg}", icons::ERROR));
    }

    /// Indented key/value detail line under a headline.
    pub fn detail(&self, key: impl Display, value: impl Display) {
        self.line(format_args!("  {key}: {value}"));
    }
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("console buffer lock poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_console_records_output() {
        let (console, buffer) = Console::captured();
        console.success("daemon started");
        console.detail("socket", "/tmp/x.sock");
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(text.contains("✓ daemon started"));
        assert!(text.contains("  socket: /tmp/x.sock"));
    }
}
