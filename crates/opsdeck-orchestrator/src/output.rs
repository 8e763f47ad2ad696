//! Run output handling: pipe decoding, color-escape stripping and the
//! sliding-window buffer.

use regex::Regex;
use std::sync::OnceLock;

/// Longest trailing escape fragment held back for the next read.
const MAX_HELD_ESCAPE_BYTES: usize = 32;

static SGR_REGEX: OnceLock<Regex> = OnceLock::new();
static PARTIAL_SGR_REGEX: OnceLock<Regex> = OnceLock::new();

fn sgr_regex() -> &'static Regex {
    // Select Graphic Rendition only: ESC [ <digits and semicolons> m
    SGR_REGEX.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("static SGR pattern"))
}

fn partial_sgr_regex() -> &'static Regex {
    PARTIAL_SGR_REGEX
        .get_or_init(|| Regex::new(r"^\x1b(\[[0-9;]*)?$").expect("static partial SGR pattern"))
}

/// Strip terminal color sequences from a chunk of process output.
pub fn sanitize_chunk(chunk: &str) -> String {
    sgr_regex().replace_all(chunk, "").into_owned()
}

/// Turns raw pipe reads into text chunks that never split a UTF-8 character
/// or a color sequence.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    held: String,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = std::mem::take(&mut self.held);
        text.push_str(&take_utf8_prefix(&mut self.pending));
        self.held = split_partial_escape(&mut text);
        text
    }

    /// Whatever is still held once the pipe has closed.
    pub fn finish(&mut self) -> String {
        let mut text = std::mem::take(&mut self.held);
        if !self.pending.is_empty() {
            text.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        text
    }
}

fn split_partial_escape(text: &mut String) -> String {
    let Some(start) = text.rfind('\x1b') else {
        return String::new();
    };
    let tail = &text[start..];
    if tail.len() <= MAX_HELD_ESCAPE_BYTES && partial_sgr_regex().is_match(tail) {
        text.split_off(start)
    } else {
        String::new()
    }
}

/// Append-only text buffer that keeps only the most recent `cap` characters.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    cap: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            cap,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.text.push_str(chunk);
        self.chars += chunk.chars().count();
        if self.chars <= self.cap {
            return;
        }
        let excess = self.chars - self.cap;
        let cut = self
            .text
            .char_indices()
            .nth(excess)
            .map(|(idx, _)| idx)
            .unwrap_or(self.text.len());
        self.text.drain(..cut);
        self.chars = self.cap;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Decode as much of `pending` as possible. Invalid bytes become U+FFFD; an
/// incomplete sequence at the very end stays in `pending`.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut consumed = 0;
    while consumed < pending.len() {
        match std::str::from_utf8(&pending[consumed..]) {
            Ok(rest) => {
                text.push_str(rest);
                consumed = pending.len();
            }
            Err(err) => {
                let valid_end = consumed + err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[consumed..valid_end]));
                match err.error_len() {
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        consumed = valid_end + invalid;
                    }
                    None => {
                        consumed = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..consumed);
    text
}
