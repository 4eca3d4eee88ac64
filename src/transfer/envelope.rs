//! Escape-code envelope carrying protocol payloads.
//!
//! Payloads travel as `ESC ] 5113 ; <payload> ESC \`. The parser is fed
//! whatever the channel delivers (keystrokes and screen output included) and
//! yields only complete payloads tagged with our code.

use bytes::{BufMut, Bytes, BytesMut};

/// OSC code reserved for file transfer.
pub const OSC_CODE: u32 = 5113;

/// Payloads larger than this are dropped as malformed.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Frame a payload as an escape code.
pub fn wrap(payload: &str) -> Bytes {
    let prefix = format!("\x1b]{};", OSC_CODE);
    let mut buf = BytesMut::with_capacity(prefix.len() + payload.len() + 2);
    buf.put_slice(prefix.as_bytes());
    buf.put_slice(payload.as_bytes());
    buf.put_slice(b"\x1b\\");
    buf.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Ground,
    Escape,
    Osc,
    OscEscape,
}

/// Incremental extractor of envelope payloads from a byte stream.
#[derive(Debug)]
pub struct EnvelopeParser {
    state: ParseState,
    buf: Vec<u8>,
    overflowed: bool,
}

impl Default for EnvelopeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Ground,
            buf: Vec::new(),
            overflowed: false,
        }
    }

    /// Feed bytes, returning every payload completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in data {
            match self.state {
                ParseState::Ground => {
                    if b == ESC {
                        self.state = ParseState::Escape;
                    }
                }
                ParseState::Escape => {
                    if b == b']' {
                        self.state = ParseState::Osc;
                        self.buf.clear();
                        self.overflowed = false;
                    } else if b != ESC {
                        self.state = ParseState::Ground;
                    }
                }
                ParseState::Osc => match b {
                    ESC => self.state = ParseState::OscEscape,
                    BEL => {
                        self.finish(&mut out);
                        self.state = ParseState::Ground;
                    }
                    _ => self.push(b),
                },
                ParseState::OscEscape => {
                    if b == b'\\' {
                        self.finish(&mut out);
                        self.state = ParseState::Ground;
                    } else if b == b']' {
                        // Unterminated sequence followed by a new one
                        self.buf.clear();
                        self.overflowed = false;
                        self.state = ParseState::Osc;
                    } else {
                        self.buf.clear();
                        self.state = ParseState::Ground;
                    }
                }
            }
        }
        out
    }

    fn push(&mut self, b: u8) {
        if self.buf.len() >= MAX_PAYLOAD_SIZE + 16 {
            self.overflowed = true;
            return;
        }
        self.buf.push(b);
    }

    fn finish(&mut self, out: &mut Vec<String>) {
        let body = std::mem::take(&mut self.buf);
        if self.overflowed {
            tracing::warn!("Dropping oversized escape code payload");
            self.overflowed = false;
            return;
        }
        let Some(sep) = body.iter().position(|&b| b == b';') else {
            return;
        };
        let code = std::str::from_utf8(&body[..sep])
            .ok()
            .and_then(|s| s.parse::<u32>().ok());
        if code != Some(OSC_CODE) {
            return;
        }
        match String::from_utf8(body[sep + 1..].to_vec()) {
            Ok(payload) => out.push(payload),
            Err(_) => tracing::warn!("Dropping escape code payload with invalid UTF-8"),
        }
    }
}
