//! Output multiplexing for parallel groups.
//!
//! Every parallel group gets one [`Printer`]: a bounded channel drained by a
//! single dedicated thread, so concurrent branches never interleave partial
//! writes into the shared sink. Branch output is routed through a
//! [`PrefixWriter`] that tags each complete line with `[name]`, column
//! aligned across the group.
//!
//! Bodies that want to respect group routing (rather than writing straight
//! to stdout) call [`print_line`], which inspects the ambient group
//! attached to their [`crate::cx::Cx`] (see `Cx::child_with_group`).

use std::cell::RefCell;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use crate::cx::Cx;

/// A sink shared between a printer's drainer thread and whatever else wants
/// to write to the same destination once the drainer has finished (e.g. an
/// aggregate summary line printed after a parallel group completes).
pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

#[must_use]
pub fn stdout_sink() -> SharedSink {
    Arc::new(Mutex::new(Box::new(io::stdout()) as Box<dyn Write + Send>))
}

/// Handed to every branch of a parallel group; cloning just clones the
/// channel sender.
#[derive(Clone)]
pub struct Printer {
    sender: Sender<String>,
}

impl Printer {
    /// Spawns the drainer thread and returns the printer plus its join
    /// handle. The caller is responsible for dropping every clone of the
    /// returned `Printer` (which closes the channel) and then joining the
    /// handle before writing anything else to `sink`.
    pub fn new(sink: SharedSink, capacity: usize) -> (Self, thread::JoinHandle<()>) {
        let (sender, receiver) = bounded::<String>(capacity);
        let handle = thread::spawn(move || {
            for line in receiver {
                let mut guard = sink.lock();
                let _ = guard.write_all(line.as_bytes());
            }
            let mut guard = sink.lock();
            let _ = guard.flush();
        });
        (Self { sender }, handle)
    }

    pub fn send(&self, line: impl Into<String>) {
        let _ = self.sender.send(line.into());
    }
}

/// Computes the `[name]` prefix for a line, padded so every member of a
/// group lines up in the same column: `[a]     ` and `[build] ` share a
/// trailing-space count of `max_name_len + 1 - name.len()`.
#[must_use]
pub fn prefix_for(name: &str, max_name_len: usize) -> String {
    let pad = max_name_len + 1 - name.len().min(max_name_len);
    format!("[{name}]{}", " ".repeat(pad))
}

/// Buffers partial writes and emits one prefixed, newline-terminated line to
/// a [`Printer`] per complete input line.
pub struct PrefixWriter {
    prefix: String,
    buf: Vec<u8>,
    printer: Printer,
}

impl PrefixWriter {
    #[must_use]
    pub fn new(prefix: String, printer: Printer) -> Self {
        Self { prefix, buf: Vec::new(), printer }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = memchr::memchr(b'\n', &self.buf) {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.printer.send(format!("{}{}\n", self.prefix, text));
        }
    }
}

impl Write for PrefixWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        self.drain_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf);
            self.printer.send(format!("{}{}\n", self.prefix, text));
            self.buf.clear();
        }
        Ok(())
    }
}

impl Drop for PrefixWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

thread_local! {
    static DEFAULT_SINK: RefCell<Vec<SharedSink>> = const { RefCell::new(Vec::new()) };
}

/// Installs `sink` as the fallback destination for [`print_line`] calls made
/// from the current thread outside of any parallel group, for the lifetime
/// of the returned guard.
#[must_use]
pub fn install_default_sink(sink: SharedSink) -> DefaultSinkGuard {
    DEFAULT_SINK.with(|stack| stack.borrow_mut().push(sink));
    DefaultSinkGuard
}

pub struct DefaultSinkGuard;

impl Drop for DefaultSinkGuard {
    fn drop(&mut self) {
        DEFAULT_SINK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn write_default(text: &str) {
    DEFAULT_SINK.with(|stack| {
        if let Some(sink) = stack.borrow().last() {
            let mut guard = sink.lock();
            let _ = writeln!(guard, "{text}");
        } else {
            println!("{text}");
        }
    });
}

/// Writes `text` to the calling target's ambient destination: the owning
/// parallel group's prefixed printer if `cx` carries one, otherwise the
/// installed default sink (or stdout, if none is installed).
pub fn print_line(cx: &Cx, text: &str) {
    let Some(group) = cx.group() else {
        write_default(text);
        return;
    };
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    for line in lines {
        group.printer.send(format!("{}{}\n", group.prefix, line));
    }
}
