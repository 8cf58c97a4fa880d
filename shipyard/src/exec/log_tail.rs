//! Rolling view of the last few lines of build output.

use std::collections::VecDeque;
use std::io::{IsTerminal, Write};

/// Fixed-size window over the most recent output lines.
///
/// When stderr is a terminal, every push redraws the window in place so the
/// operator sees a live tail instead of an ever-growing scroll.
#[derive(Debug)]
pub struct LogTail {
    window: VecDeque<String>,
    capacity: usize,
    interactive: bool,
    width: usize,
    /// Lines currently painted on the terminal.
    drawn: usize,
}

impl LogTail {
    /// Window attached to stderr, drawing only if stderr is a terminal.
    pub fn new(capacity: usize) -> Self {
        let interactive = std::io::stderr().is_terminal();
        Self::with_mode(capacity, interactive, crate::util::terminal_width())
    }

    /// Window that only records, never draws.
    pub fn detached(capacity: usize) -> Self {
        Self::with_mode(capacity, false, 80)
    }

    fn with_mode(capacity: usize, interactive: bool, width: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            interactive,
            width: width.max(1),
            drawn: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(line.to_string());

        if self.interactive {
            let frame = self.render();
            self.paint(&frame);
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.window.iter().map(String::as_str)
    }

    /// Erase the painted window and forget its contents.
    pub fn clear(&mut self) {
        if self.interactive && self.drawn > 0 {
            let frame = self.erase_sequence();
            self.paint(&frame);
        }
        self.window.clear();
    }

    fn erase_sequence(&self) -> String {
        let mut out = String::new();
        for _ in 0..self.drawn {
            out.push_str("\x1b[1A\x1b[2K");
        }
        out
    }

    /// Escape sequence replacing the previous frame with the current window.
    fn render(&self) -> String {
        let mut out = self.erase_sequence();
        for line in &self.window {
            out.extend(line.chars().take(self.width));
            out.push('\n');
        }
        out
    }

    fn paint(&mut self, frame: &str) {
        let mut stderr = std::io::stderr().lock();
        if stderr.write_all(frame.as_bytes()).and_then(|_| stderr.flush()).is_ok() {
            self.drawn = self.window.len();
        }
    }
}

/// Strip `ESC [ ... m` colour sequences from command output.
pub(crate) fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.next() == Some('[') {
                for next_char in chars.by_ref() {
                    if next_char == 'm' {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}
