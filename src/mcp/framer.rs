//! Sentinel framing for commands sent through a shared interactive shell.
//!
//! A persistent shell is one continuous byte stream. To recover per-command
//! boundaries and exit status, every command is wrapped as
//!
//! ```text
//! echo "<nonce>_START_<id>"
//! <command>
//! echo "<nonce>_END_<id>:$?"
//! ```
//!
//! and the channel output is fed through a [`FrameParser`]. The parser is an
//! explicit state machine:
//!
//! - **AwaitingStart**: bytes are discarded until the start marker appears at
//!   the end of a line. The echoed input line `echo "<marker>"` is followed by
//!   a quote, so it never matches.
//! - **Capturing**: bytes accumulate until `<nonce>_END_<id>:` followed by one
//!   or more digits and a non-digit terminator. The echoed `...:$?` input line
//!   never matches because `$` is not a digit.
//! - **Complete**: the exit status has been read; further input is ignored.
//!
//! Memory is bounded in both live states: pre-start bytes are trimmed to the
//! marker length and the capture keeps at most [`MAX_CAPTURE_BYTES`], dropping
//! the oldest output.

use chrono::Utc;
use uuid::Uuid;

/// Largest command output kept in memory for one framed command.
pub(crate) const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Create a per-session nonce: millisecond timestamp plus a random suffix.
pub fn generate_nonce() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("__LAB_{}_{}", Utc::now().timestamp_millis(), &random[..9])
}

#[derive(Debug)]
pub struct CommandFramer {
    nonce: String,
    next_id: u64,
}

#[derive(Debug)]
pub struct FramedCommand {
    pub id: u64,
    /// Bytes to write to the shell, newline terminated.
    pub payload: String,
    pub parser: FrameParser,
}

/// Output of one completed framed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOutput {
    pub output: String,
    pub exit_code: i32,
}

impl CommandFramer {
    pub fn new(nonce: impl Into<String>) -> Self {
        Self {
            nonce: nonce.into(),
            next_id: 1,
        }
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn frame(&mut self, command: &str) -> FramedCommand {
        let id = self.next_id;
        self.next_id += 1;

        let start = format!("{}_START_{}", self.nonce, id);
        let end = format!("{}_END_{}:", self.nonce, id);
        let payload = format!(
            "echo \"{}\"\n{}\necho \"{}$?\"\n",
            start,
            command.trim_end_matches(['\r', '\n']),
            end
        );

        FramedCommand {
            id,
            payload,
            parser: FrameParser::new(start.into_bytes(), end.into_bytes()),
        }
    }
}

#[derive(Debug)]
enum FrameState {
    AwaitingStart {
        pending: Vec<u8>,
    },
    Capturing {
        buf: Vec<u8>,
        truncated: bool,
        scan_from: usize,
    },
    Complete,
}

#[derive(Debug)]
pub struct FrameParser {
    start_marker: Vec<u8>,
    end_prefix: Vec<u8>,
    state: FrameState,
}

impl FrameParser {
    fn new(start_marker: Vec<u8>, end_prefix: Vec<u8>) -> Self {
        Self {
            start_marker,
            end_prefix,
            state: FrameState::AwaitingStart {
                pending: Vec::new(),
            },
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, FrameState::Capturing { .. })
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        matches!(self.state, FrameState::Complete)
    }

    /// Feed a chunk of channel output. Returns the result once the end marker
    /// has been recognised; afterwards every call returns `None`.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<FrameOutput> {
        let leftover = match &mut self.state {
            FrameState::Complete => return None,
            FrameState::AwaitingStart { pending } => {
                pending.extend_from_slice(chunk);
                match find_line_marker(pending, &self.start_marker) {
                    Some(body_start) => pending.split_off(body_start),
                    None => {
                        let keep = self.start_marker.len();
                        if pending.len() > keep {
                            pending.drain(..pending.len() - keep);
                        }
                        return None;
                    }
                }
            }
            FrameState::Capturing { .. } => chunk.to_vec(),
        };

        if !self.is_capturing() {
            self.state = FrameState::Capturing {
                buf: Vec::with_capacity(4096),
                truncated: false,
                scan_from: 0,
            };
        }
        self.capture(&leftover)
    }

    fn capture(&mut self, data: &[u8]) -> Option<FrameOutput> {
        let FrameState::Capturing {
            buf,
            truncated,
            scan_from,
        } = &mut self.state
        else {
            return None;
        };

        buf.extend_from_slice(data);
        if buf.len() > MAX_CAPTURE_BYTES {
            let excess = buf.len() - MAX_CAPTURE_BYTES;
            buf.drain(..excess);
            *scan_from = scan_from.saturating_sub(excess);
            *truncated = true;
        }

        let mut from = *scan_from;
        while let Some(pos) = find(buf, &self.end_prefix, from) {
            let digits_start = pos + self.end_prefix.len();
            let digits = buf[digits_start..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();

            if digits == 0 {
                // `$?` from an echoed input line, or unrelated text
                if digits_start < buf.len() {
                    from = pos + 1;
                    continue;
                }
                *scan_from = pos;
                return None;
            }
            if digits_start + digits == buf.len() {
                // Status digits may continue in the next chunk
                *scan_from = pos;
                return None;
            }

            let exit_code = std::str::from_utf8(&buf[digits_start..digits_start + digits])
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(i32::MAX);
            let output = finish_output(&buf[..pos], *truncated);
            self.state = FrameState::Complete;
            return Some(FrameOutput { output, exit_code });
        }

        *scan_from = buf.len().saturating_sub(self.end_prefix.len());
        None
    }
}

/// Position just past `marker` and its line terminator, if `marker` occurs
/// followed by `\r` or `\n`. A `\r\n` pair is consumed as one terminator.
fn find_line_marker(haystack: &[u8], marker: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = find(haystack, marker, from) {
        let after = pos + marker.len();
        match haystack.get(after) {
            Some(b'\n') => return Some(after + 1),
            Some(b'\r') => {
                return Some(if haystack.get(after + 1) == Some(&b'\n') {
                    after + 2
                } else {
                    after + 1
                });
            }
            _ => from = pos + 1,
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|p| p + from)
}

fn finish_output(raw: &[u8], truncated: bool) -> String {
    let text = String::from_utf8_lossy(raw).replace("\r\n", "\n");
    let trimmed = text.trim_matches(['\r', '\n']);
    if truncated {
        format!(
            "[output truncated to the last {} bytes]\n{}",
            MAX_CAPTURE_BYTES, trimmed
        )
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer() -> CommandFramer {
        CommandFramer::new("__LAB_1_abc")
    }

    mod framing {
        use super::*;

        #[test]
        fn test_payload_layout() {
            let framed = framer().frame("ls -la");
            assert_eq!(framed.id, 1);
            assert_eq!(
                framed.payload,
                "echo \"__LAB_1_abc_START_1\"\nls -la\necho \"__LAB_1_abc_END_1:$?\"\n"
            );
        }

        #[test]
        fn test_ids_increase() {
            let mut f = framer();
            assert_eq!(f.frame("a").id, 1);
            assert_eq!(f.frame("b").id, 2);
            assert_eq!(f.frame("c").id, 3);
        }

        #[test]
        fn test_trailing_newlines_are_not_doubled() {
            let framed = framer().frame("pwd\n");
            assert!(framed.payload.contains("\npwd\necho"));
        }

        #[test]
        fn test_nonces_are_unique() {
            let a = generate_nonce();
            let b = generate_nonce();
            assert!(a.starts_with("__LAB_"));
            assert_ne!(a, b);
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_simple_output() {
            let mut parser = framer().frame("echo hi").parser;
            let out = parser
                .feed(b"__LAB_1_abc_START_1\r\nhi\r\n__LAB_1_abc_END_1:0\r\n")
                .unwrap();
            assert_eq!(out.output, "hi");
            assert_eq!(out.exit_code, 0);
            assert!(parser.is_complete());
        }

        #[test]
        fn test_exit_status_is_reported() {
            let mut parser = framer().frame("false").parser;
            let out = parser
                .feed(b"__LAB_1_abc_START_1\n__LAB_1_abc_END_1:1\n")
                .unwrap();
            assert_eq!(out.output, "");
            assert_eq!(out.exit_code, 1);
        }

        #[test]
        fn test_echoed_input_lines_are_skipped() {
            let mut parser = framer().frame("id").parser;
            let stream = concat!(
                "echo \"__LAB_1_abc_START_1\"\r\n",
                "id\r\n",
                "echo \"__LAB_1_abc_END_1:$?\"\r\n",
                "__LAB_1_abc_START_1\r\n",
                "uid=0(root)\r\n",
                "__LAB_1_abc_END_1:0\r\n"
            );
            let out = parser.feed(stream.as_bytes()).unwrap();
            assert_eq!(out.output, "uid=0(root)");
        }

        #[test]
        fn test_byte_at_a_time() {
            let mut parser = framer().frame("printf 'a\\nb'").parser;
            let stream = b"noise\n__LAB_1_abc_START_1\r\na\r\nb__LAB_1_abc_END_1:42\r\n";
            let mut result = None;
            for byte in stream.iter() {
                if let Some(out) = parser.feed(std::slice::from_ref(byte)) {
                    result = Some(out);
                }
            }
            let out = result.unwrap();
            assert_eq!(out.output, "a\nb");
            assert_eq!(out.exit_code, 42);
        }

        #[test]
        fn test_waits_for_status_terminator() {
            let mut parser = framer().frame("x").parser;
            assert!(parser.feed(b"__LAB_1_abc_START_1\nout\n__LAB_1_abc_END_1:12").is_none());
            let out = parser.feed(b"7\n").unwrap();
            assert_eq!(out.exit_code, 127);
        }

        #[test]
        fn test_stale_markers_from_other_commands_are_ignored() {
            let mut f = framer();
            let _first = f.frame("sleep 100");
            let mut parser = f.frame("echo ok").parser;
            let stream = concat!(
                "late output\n",
                "__LAB_1_abc_END_1:130\n",
                "__LAB_1_abc_START_2\n",
                "ok\n",
                "__LAB_1_abc_END_2:0\n"
            );
            let out = parser.feed(stream.as_bytes()).unwrap();
            assert_eq!(out.output, "ok");
            assert_eq!(out.exit_code, 0);
        }

        #[test]
        fn test_id_prefix_does_not_match_longer_id() {
            let mut f = framer();
            let mut parser = f.frame("a").parser;
            // START_1 must not match START_10
            assert!(parser.feed(b"__LAB_1_abc_START_10\n").is_none());
            assert!(!parser.is_capturing());
        }

        #[test]
        fn test_feed_after_complete_returns_none() {
            let mut parser = framer().frame("true").parser;
            parser.feed(b"__LAB_1_abc_START_1\n__LAB_1_abc_END_1:0\n").unwrap();
            assert!(parser.feed(b"__LAB_1_abc_END_1:0\n").is_none());
        }

        #[test]
        fn test_preserves_inner_blank_lines_and_indentation() {
            let mut parser = framer().frame("cat f").parser;
            let out = parser
                .feed(b"__LAB_1_abc_START_1\n\n  a\n\nb\n\n__LAB_1_abc_END_1:0\n")
                .unwrap();
            assert_eq!(out.output, "  a\n\nb");
        }
    }

    mod bounds {
        use super::*;

        #[test]
        fn test_pending_bytes_are_bounded() {
            let mut parser = framer().frame("x").parser;
            for _ in 0..100 {
                parser.feed(&[b'z'; 4096]);
            }
            match &parser.state {
                FrameState::AwaitingStart { pending } => {
                    assert!(pending.len() <= "__LAB_1_abc_START_1".len())
                }
                _ => panic!("parser should still await the start marker"),
            }
        }

        #[test]
        fn test_capture_keeps_most_recent_output() {
            let mut parser = framer().frame("yes | head").parser;
            parser.feed(b"__LAB_1_abc_START_1\n");
            let block = vec![b'y'; 64 * 1024];
            for _ in 0..20 {
                assert!(parser.feed(&block).is_none());
            }
            let out = parser.feed(b"\nTAIL\n__LAB_1_abc_END_1:0\n").unwrap();
            assert!(out.output.starts_with("[output truncated"));
            assert!(out.output.ends_with("TAIL"));
            assert!(out.output.len() <= MAX_CAPTURE_BYTES + 64);
        }
    }
}
