//! Line buffer for background sessions.
//!
//! Raw channel chunks are split into lines (`\r\n` and `\n` terminated) and
//! appended to a bounded ring. Once [`MAX_LINES`] is exceeded the ring is cut
//! back to the most recent [`TRIM_TO_LINES`]. Framing markers (text starting
//! with the session nonce) are cut out of each line; a line left blank by that,
//! or an echoed `echo "<marker>"` input line, is not stored.

use std::collections::VecDeque;

pub(crate) const MAX_LINES: usize = 10_000;
pub(crate) const TRIM_TO_LINES: usize = 5_000;

/// Longest unterminated line kept before it is flushed as a line of its own.
pub(crate) const MAX_PARTIAL_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct OutputRing {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    nonce: Option<String>,
}

impl OutputRing {
    /// With a `nonce`, framing markers built from it are removed from the output.
    pub fn new(nonce: Option<String>) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: Vec::new(),
            nonce,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.partial);
                self.push_line(line);
            } else {
                self.partial.push(byte);
                if self.partial.len() >= MAX_PARTIAL_BYTES {
                    let line = std::mem::take(&mut self.partial);
                    self.push_line(line);
                }
            }
        }
    }

    fn push_line(&mut self, mut raw: Vec<u8>) {
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        let Some(line) = self.without_markers(line) else {
            return;
        };
        self.lines.push_back(line);
        if self.lines.len() > MAX_LINES {
            let excess = self.lines.len() - TRIM_TO_LINES;
            self.lines.drain(..excess);
        }
    }

    /// Most recent `max_lines` lines (all when `None`), including an
    /// unterminated trailing line. With `clear` the buffer is emptied.
    pub fn snapshot(&mut self, max_lines: Option<usize>, clear: bool) -> Vec<String> {
        let mut all: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            let tail = String::from_utf8_lossy(&self.partial).into_owned();
            if let Some(tail) = self.without_markers(tail) {
                all.push(tail);
            }
        }
        if clear {
            self.lines.clear();
            self.partial.clear();
        }
        // Zero means no limit
        match max_lines {
            Some(n) if n > 0 && n < all.len() => all.split_off(all.len() - n),
            _ => all,
        }
    }

    fn without_markers(&self, line: String) -> Option<String> {
        match &self.nonce {
            Some(nonce) if line.contains(nonce.as_str()) => strip_markers(&line, nonce),
            _ => Some(line),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }
}

/// Remove every `<nonce>_START_<id>` and `<nonce>_END_<id>:<status>` from
/// `line`. `None` when nothing but markers and whitespace is left, or when the
/// line is the echoed framing input itself.
fn strip_markers(line: &str, nonce: &str) -> Option<String> {
    let mut kept = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = rest.find(nonce) {
        let before = &rest[..pos];
        if before.ends_with("echo \"") {
            return None;
        }
        kept.push_str(before);
        rest = skip_marker(&rest[pos + nonce.len()..]);
    }
    kept.push_str(rest);
    if kept.trim().is_empty() {
        None
    } else {
        Some(kept)
    }
}

/// Text following a marker whose nonce has already been consumed.
fn skip_marker(after: &str) -> &str {
    let digits = |c: char| c.is_ascii_digit();
    if let Some(tail) = after.strip_prefix("_START_") {
        tail.trim_start_matches(digits)
    } else if let Some(tail) = after.strip_prefix("_END_") {
        let tail = tail.trim_start_matches(digits);
        match tail.strip_prefix(':') {
            Some(status) => status.trim_start_matches(digits),
            None => tail,
        }
    } else if "_START_".starts_with(after) || "_END_".starts_with(after) {
        // Marker cut off at the end of an unterminated tail
        ""
    } else {
        after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_lines_and_strips_cr() {
        let mut ring = OutputRing::new(None);
        ring.push(b"one\r\ntwo\nthr");
        ring.push(b"ee\r\n");
        assert_eq!(ring.snapshot(None, false), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_partial_line_is_visible_but_not_counted() {
        let mut ring = OutputRing::new(None);
        ring.push(b"done\nprompt$ ");
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.snapshot(None, false), vec!["done", "prompt$ "]);
    }

    #[test]
    fn test_marker_lines_are_dropped() {
        let mut ring = OutputRing::new(Some("__LAB_9_x".to_string()));
        ring.push(b"__LAB_9_x_START_1\r\nhello\r\n__LAB_9_x_END_1:0\r\n");
        assert_eq!(ring.snapshot(None, false), vec!["hello"]);
    }

    #[test]
    fn test_output_sharing_a_line_with_end_marker_is_kept() {
        let mut ring = OutputRing::new(Some("__LAB_9_x".to_string()));
        ring.push(b"__LAB_9_x_START_1\r\ndone__LAB_9_x_END_1:0\r\n");
        assert_eq!(ring.snapshot(None, false), vec!["done"]);
    }

    #[test]
    fn test_unterminated_tail_is_stripped() {
        let mut ring = OutputRing::new(Some("__LAB_9_x".to_string()));
        ring.push(b"50%__LAB_9_x_END_3:130");
        assert_eq!(ring.snapshot(None, false), vec!["50%"]);
    }

    #[test]
    fn test_echoed_framing_input_is_dropped() {
        let mut ring = OutputRing::new(Some("__LAB_9_x".to_string()));
        ring.push(b"echo \"__LAB_9_x_START_2\"\r\nls\r\necho \"__LAB_9_x_END_2:$?\"\r\n");
        assert_eq!(ring.snapshot(None, false), vec!["ls"]);
    }

    #[test]
    fn test_zero_lines_means_all() {
        let mut ring = OutputRing::new(None);
        ring.push(b"a\nb\nc\n");
        assert_eq!(ring.snapshot(Some(0), false), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_last_n_lines() {
        let mut ring = OutputRing::new(None);
        ring.push(b"a\nb\nc\nd\n");
        assert_eq!(ring.snapshot(Some(2), false), vec!["c", "d"]);
        assert_eq!(ring.snapshot(Some(10), false).len(), 4);
    }

    #[test]
    fn test_clear_drains_everything() {
        let mut ring = OutputRing::new(None);
        ring.push(b"a\nb\npart");
        assert_eq!(ring.snapshot(Some(1), true), vec!["part"]);
        assert!(ring.snapshot(None, false).is_empty());
        ring.push(b"c\n");
        assert_eq!(ring.snapshot(None, false), vec!["c"]);
    }

    #[test]
    fn test_trims_to_most_recent_when_full() {
        let mut ring = OutputRing::new(None);
        for i in 0..=MAX_LINES {
            ring.push(format!("line {}\n", i).as_bytes());
        }
        assert_eq!(ring.len(), TRIM_TO_LINES);
        let lines = ring.snapshot(Some(1), false);
        assert_eq!(lines, vec![format!("line {}", MAX_LINES)]);
        let first = ring.snapshot(None, false).remove(0);
        assert_eq!(first, format!("line {}", MAX_LINES + 1 - TRIM_TO_LINES));
    }

    #[test]
    fn test_long_partial_is_flushed() {
        let mut ring = OutputRing::new(None);
        ring.push(&vec![b'x'; MAX_PARTIAL_BYTES + 10]);
        assert_eq!(ring.len(), 1);
        let lines = ring.snapshot(None, false);
        assert_eq!(lines[0].len(), MAX_PARTIAL_BYTES);
        assert_eq!(lines[1].len(), 10);
    }
}
