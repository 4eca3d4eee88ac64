//! rsync-style engine: rolling checksum, signatures, delta ops and patching.
//!
//! Each phase is a [`Job`] that consumes bounded input and emits bounded
//! output, so whole files never have to be held in memory.
//!
//! Signature format: `TXSG | block_len:u32 | strong_len:u32 | (weak:u32 | strong)*`
//!
//! Delta ops (same layout as the sy delta wire format, plus an end marker):
//! - `0x00 | offset:u64 | len:u32` copy from base
//! - `0x01 | len:u32 | bytes` literal
//! - `0x02` end of delta

use super::{Job, Step};
use crate::error::{Result, TransferError};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::io;

pub const SIGNATURE_MAGIC: &[u8; 4] = b"TXSG";
const SIGNATURE_HEADER_LEN: usize = 12;

/// Bytes of the xxh3 hash kept per block.
pub const STRONG_LEN: u32 = 8;

pub const MIN_BLOCK_LEN: u32 = 2048;
pub const MAX_BLOCK_LEN: u32 = 128 * 1024;

/// Base I/O unit for the delta and patch phases.
pub const IO_UNIT: usize = 64 * 1024;

/// Literal runs are flushed at this size.
const MAX_LITERAL: usize = 64 * 1024;

/// Adjacent copies are merged up to this size.
const MAX_COPY: u64 = 16 * 1024 * 1024;

const OP_COPY: u8 = 0x00;
const OP_LITERAL: u8 = 0x01;
const OP_END: u8 = 0x02;

const CHAR_OFFSET: u32 = 31;

/// Pick a block length for a base file of `size` bytes.
pub fn block_len_for(size: u64) -> u32 {
    let root = (size as f64).sqrt().ceil() as u32;
    let rounded = root.div_ceil(8) * 8;
    rounded.clamp(MIN_BLOCK_LEN, MAX_BLOCK_LEN)
}

fn strong_hash(data: &[u8], len: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    let h = xxhash_rust::xxh3::xxh3_64(data).to_be_bytes();
    out[..len].copy_from_slice(&h[..len]);
    out
}

// =============================================================================
// Rolling checksum
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Rolling {
    s1: u32,
    s2: u32,
    count: u32,
}

impl Rolling {
    pub fn of(data: &[u8]) -> Self {
        let mut r = Self::default();
        r.update(data);
        r
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.s1 = self.s1.wrapping_add(b as u32 + CHAR_OFFSET);
            self.s2 = self.s2.wrapping_add(self.s1);
        }
        self.count = self.count.wrapping_add(data.len() as u32);
    }

    /// Slide the window one byte: drop `out`, append `inp`.
    pub fn rotate(&mut self, out: u8, inp: u8) {
        self.s1 = self.s1.wrapping_add(inp as u32).wrapping_sub(out as u32);
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub(self.count.wrapping_mul(out as u32 + CHAR_OFFSET));
    }

    pub fn digest(&self) -> u32 {
        (self.s1 & 0xffff) | (self.s2 << 16)
    }
}

// =============================================================================
// Signature
// =============================================================================

#[derive(Debug, Clone)]
struct BlockSig {
    weak: u32,
    strong: [u8; 8],
}

/// A parsed signature, indexed by weak checksum.
#[derive(Debug, Clone)]
pub struct Signature {
    block_len: u32,
    strong_len: u32,
    blocks: Vec<BlockSig>,
    index: HashMap<u32, Vec<usize>>,
}

impl Signature {
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() < SIGNATURE_HEADER_LEN || &data[..4] != SIGNATURE_MAGIC {
            return Err(TransferError::protocol("Invalid signature header"));
        }
        data.advance(4);
        let block_len = data.get_u32();
        let strong_len = data.get_u32();
        if !(1..=STRONG_LEN).contains(&strong_len) || block_len == 0 {
            return Err(TransferError::protocol(format!(
                "Invalid signature parameters: block_len={} strong_len={}",
                block_len, strong_len
            )));
        }
        let record = 4 + strong_len as usize;
        if data.remaining() % record != 0 {
            return Err(TransferError::protocol("Signature truncated"));
        }

        let mut blocks = Vec::with_capacity(data.remaining() / record);
        let mut index: HashMap<u32, Vec<usize>> = HashMap::new();
        while data.has_remaining() {
            let weak = data.get_u32();
            let mut strong = [0u8; 8];
            data.copy_to_slice(&mut strong[..strong_len as usize]);
            index.entry(weak).or_default().push(blocks.len());
            blocks.push(BlockSig { weak, strong });
        }

        Ok(Self {
            block_len,
            strong_len,
            blocks,
            index,
        })
    }

    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Find a base block equal to `window`. Only the last block may be short.
    fn find(&self, weak: u32, window: &[u8]) -> Option<usize> {
        let candidates = self.index.get(&weak)?;
        let full = window.len() == self.block_len as usize;
        let last = self.blocks.len().checked_sub(1)?;
        let strong = strong_hash(window, self.strong_len as usize);
        candidates
            .iter()
            .copied()
            .filter(|&idx| full || idx == last)
            .find(|&idx| {
                let b = &self.blocks[idx];
                b.weak == weak && b.strong == strong
            })
    }
}

// =============================================================================
// Signature job
// =============================================================================

/// Scans a whole base file into a signature.
pub struct SignatureJob {
    block_len: usize,
    strong_len: usize,
    header_written: bool,
    partial: Vec<u8>,
    finished: bool,
}

impl SignatureJob {
    pub fn new(block_len: u32) -> Self {
        Self {
            block_len: block_len as usize,
            strong_len: STRONG_LEN as usize,
            header_written: false,
            partial: Vec::with_capacity(block_len as usize),
            finished: false,
        }
    }

    fn emit_block(&self, block: &[u8], out: &mut Vec<u8>) {
        out.put_u32(Rolling::of(block).digest());
        out.put_slice(&strong_hash(block, self.strong_len)[..self.strong_len]);
    }
}

impl Job for SignatureJob {
    fn step(&mut self, input: &[u8], eof: bool, out: &mut Vec<u8>) -> Result<Step> {
        if self.finished {
            return Ok(Step::done(0));
        }
        if !self.header_written {
            out.put_slice(SIGNATURE_MAGIC);
            out.put_u32(self.block_len as u32);
            out.put_u32(self.strong_len as u32);
            self.header_written = true;
        }

        let mut consumed = 0;
        while consumed < input.len() {
            let rest = &input[consumed..];
            let need = self.block_len - self.partial.len();
            let take = need.min(rest.len());
            if self.partial.is_empty() && take == self.block_len {
                self.emit_block(&rest[..take], out);
            } else {
                self.partial.extend_from_slice(&rest[..take]);
                if self.partial.len() == self.block_len {
                    let block = std::mem::take(&mut self.partial);
                    self.emit_block(&block, out);
                }
            }
            consumed += take;
        }

        if eof {
            if !self.partial.is_empty() {
                let block = std::mem::take(&mut self.partial);
                self.emit_block(&block, out);
            }
            self.finished = true;
        }
        Ok(Step {
            consumed,
            finished: self.finished,
        })
    }

    fn input_size(&self) -> usize {
        4 * self.block_len
    }

    fn output_size(&self) -> usize {
        SIGNATURE_HEADER_LEN + 4 * (4 + self.strong_len)
    }
}

// =============================================================================
// Delta job
// =============================================================================

/// Computes the ops turning the signed base into the new file.
pub struct DeltaJob {
    sig: Signature,
    block_len: usize,
    /// `buf[..start]` is already emitted, `buf[start..pos]` is the pending
    /// literal run and the window starts at `pos`.
    buf: Vec<u8>,
    start: usize,
    pos: usize,
    rolling: Option<Rolling>,
    pending_copy: Option<(u64, u64)>,
    finished: bool,
}

impl DeltaJob {
    pub fn new(sig: Signature) -> Self {
        let block_len = sig.block_len as usize;
        Self {
            sig,
            block_len,
            buf: Vec::new(),
            start: 0,
            pos: 0,
            rolling: None,
            pending_copy: None,
            finished: false,
        }
    }

    fn flush_copy(&mut self, out: &mut Vec<u8>) {
        if let Some((offset, len)) = self.pending_copy.take() {
            out.put_u8(OP_COPY);
            out.put_u64(offset);
            out.put_u32(len as u32);
        }
    }

    fn push_copy(&mut self, offset: u64, len: u64, out: &mut Vec<u8>) {
        if let Some((start, pending)) = self.pending_copy.as_mut() {
            if *start + *pending == offset && *pending + len <= MAX_COPY {
                *pending += len;
                return;
            }
        }
        self.flush_copy(out);
        self.pending_copy = Some((offset, len));
    }

    /// Drop emitted bytes once they make up at least half the buffer.
    fn compact(&mut self) {
        if self.start > 0 && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
            self.pos -= self.start;
            self.start = 0;
        }
    }

    /// Emit `buf[start..end]` as literal data.
    fn flush_literal(&mut self, end: usize, out: &mut Vec<u8>) {
        if end <= self.start {
            return;
        }
        self.flush_copy(out);
        for chunk in self.buf[self.start..end].chunks(MAX_LITERAL) {
            out.put_u8(OP_LITERAL);
            out.put_u32(chunk.len() as u32);
            out.put_slice(chunk);
        }
        self.start = end;
        self.compact();
    }

    fn matched(&mut self, idx: usize, len: usize, out: &mut Vec<u8>) {
        let pos = self.pos;
        self.flush_literal(pos, out);
        let offset = idx as u64 * self.block_len as u64;
        self.push_copy(offset, len as u64, out);
        self.start = self.pos + len;
        self.pos = self.start;
        self.rolling = None;
        self.compact();
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        let tail = self.buf.len() - self.pos;
        if tail > 0 && tail < self.block_len {
            let window = &self.buf[self.pos..];
            let weak = Rolling::of(window).digest();
            if let Some(idx) = self.sig.find(weak, window) {
                self.matched(idx, tail, out);
            }
        }
        let end = self.buf.len();
        self.pos = end;
        self.flush_literal(end, out);
        self.flush_copy(out);
        out.put_u8(OP_END);
        self.finished = true;
    }
}

impl Job for DeltaJob {
    fn step(&mut self, input: &[u8], eof: bool, out: &mut Vec<u8>) -> Result<Step> {
        if self.finished {
            return Ok(Step::done(0));
        }
        self.buf.extend_from_slice(input);
        let consumed = input.len();

        if self.sig.blocks.is_empty() {
            // No base content: everything is literal
            if eof {
                self.finish(out);
            } else if self.buf.len() - self.start >= MAX_LITERAL {
                let live = self.buf.len() - self.start;
                let end = self.start + live - live % MAX_LITERAL;
                self.pos = self.buf.len();
                self.flush_literal(end, out);
            }
            return Ok(Step {
                consumed,
                finished: self.finished,
            });
        }

        let bl = self.block_len;
        loop {
            if self.buf.len() - self.pos < bl {
                if eof {
                    self.finish(out);
                }
                break;
            }

            let weak = match self.rolling {
                Some(r) => r.digest(),
                None => {
                    let r = Rolling::of(&self.buf[self.pos..self.pos + bl]);
                    self.rolling = Some(r);
                    r.digest()
                }
            };

            if let Some(idx) = self.sig.find(weak, &self.buf[self.pos..self.pos + bl]) {
                self.matched(idx, bl, out);
                continue;
            }

            if self.pos + bl < self.buf.len() {
                let (drop, add) = (self.buf[self.pos], self.buf[self.pos + bl]);
                if let Some(r) = self.rolling.as_mut() {
                    r.rotate(drop, add);
                }
                self.pos += 1;
            } else if eof {
                self.pos += 1;
                self.rolling = None;
            } else {
                break;
            }

            if self.pos - self.start >= MAX_LITERAL {
                let pos = self.pos;
                self.flush_literal(pos, out);
            }
        }

        Ok(Step {
            consumed,
            finished: self.finished,
        })
    }

    fn input_size(&self) -> usize {
        2 * IO_UNIT
    }

    fn output_size(&self) -> usize {
        4 * IO_UNIT
    }
}

// =============================================================================
// Patch job
// =============================================================================

/// Random access into the base file: fill `buf` from `offset`, return bytes read.
pub type ReadAt = Box<dyn FnMut(&mut [u8], u64) -> io::Result<usize> + Send>;

#[derive(Debug, Clone, Copy)]
enum PatchState {
    Op,
    Literal { remaining: usize },
    Copy { offset: u64, remaining: u64 },
}

/// Applies a delta stream to a base file reachable through `read_at`.
pub struct PatchJob {
    read_at: ReadAt,
    state: PatchState,
    scratch: Vec<u8>,
    finished: bool,
}

impl PatchJob {
    pub fn new(read_at: ReadAt) -> Self {
        Self {
            read_at,
            state: PatchState::Op,
            scratch: Vec::new(),
            finished: false,
        }
    }
}

impl Job for PatchJob {
    fn step(&mut self, input: &[u8], _eof: bool, out: &mut Vec<u8>) -> Result<Step> {
        let limit = self.output_size();
        let mut consumed = 0;

        while !self.finished && out.len() < limit {
            let rest = &input[consumed..];
            match self.state {
                PatchState::Op => {
                    let Some(&op) = rest.first() else { break };
                    match op {
                        OP_COPY => {
                            if rest.len() < 13 {
                                break;
                            }
                            let mut hdr = &rest[1..13];
                            let offset = hdr.get_u64();
                            let len = hdr.get_u32() as u64;
                            if len > MAX_COPY {
                                return Err(TransferError::protocol(format!(
                                    "Delta copy size {} exceeds max {}",
                                    len, MAX_COPY
                                )));
                            }
                            consumed += 13;
                            self.state = PatchState::Copy {
                                offset,
                                remaining: len,
                            };
                        }
                        OP_LITERAL => {
                            if rest.len() < 5 {
                                break;
                            }
                            let mut hdr = &rest[1..5];
                            let len = hdr.get_u32() as usize;
                            if len > MAX_LITERAL {
                                return Err(TransferError::protocol(format!(
                                    "Delta literal size {} exceeds max {}",
                                    len, MAX_LITERAL
                                )));
                            }
                            consumed += 5;
                            self.state = PatchState::Literal { remaining: len };
                        }
                        OP_END => {
                            consumed += 1;
                            self.finished = true;
                        }
                        other => {
                            return Err(TransferError::protocol(format!(
                                "Unknown delta op type: {}",
                                other
                            )))
                        }
                    }
                }
                PatchState::Literal { remaining } => {
                    if remaining == 0 {
                        self.state = PatchState::Op;
                        continue;
                    }
                    if rest.is_empty() {
                        break;
                    }
                    let n = remaining.min(rest.len()).min(limit - out.len());
                    out.extend_from_slice(&rest[..n]);
                    consumed += n;
                    self.state = if remaining == n {
                        PatchState::Op
                    } else {
                        PatchState::Literal {
                            remaining: remaining - n,
                        }
                    };
                }
                PatchState::Copy { offset, remaining } => {
                    if remaining == 0 {
                        self.state = PatchState::Op;
                        continue;
                    }
                    let n = (remaining as usize).min(limit - out.len());
                    self.scratch.resize(n, 0);
                    let got = (self.read_at)(&mut self.scratch[..n], offset)?;
                    if got == 0 {
                        return Err(TransferError::protocol(format!(
                            "Delta copy at offset {} beyond end of base file",
                            offset
                        )));
                    }
                    out.extend_from_slice(&self.scratch[..got]);
                    let left = remaining - got as u64;
                    self.state = if left == 0 {
                        PatchState::Op
                    } else {
                        PatchState::Copy {
                            offset: offset + got as u64,
                            remaining: left,
                        }
                    };
                }
            }
        }

        Ok(Step {
            consumed,
            finished: self.finished,
        })
    }

    fn input_size(&self) -> usize {
        IO_UNIT
    }

    fn output_size(&self) -> usize {
        4 * IO_UNIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_matches_fresh_checksum() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 7 % 251) as u8).collect();
        let window = 32;
        let mut r = Rolling::of(&data[..window]);
        for start in 1..data.len() - window {
            r.rotate(data[start - 1], data[start + window - 1]);
            assert_eq!(r.digest(), Rolling::of(&data[start..start + window]).digest());
        }
    }

    #[test]
    fn test_block_len_for() {
        assert_eq!(block_len_for(0), MIN_BLOCK_LEN);
        assert_eq!(block_len_for(100 * 1024 * 1024), 10240);
        assert_eq!(block_len_for(u64::MAX / 2), MAX_BLOCK_LEN);
        assert_eq!(block_len_for(10_000_000) % 8, 0);
    }

    #[test]
    fn test_signature_parse_rejects_garbage() {
        assert!(Signature::parse(b"nope").is_err());
        let mut bad = SIGNATURE_MAGIC.to_vec();
        bad.extend_from_slice(&2048u32.to_be_bytes());
        bad.extend_from_slice(&8u32.to_be_bytes());
        bad.extend_from_slice(&[1, 2, 3]);
        assert!(Signature::parse(&bad).is_err());
    }

    #[test]
    fn test_signature_block_count() {
        let mut job = SignatureJob::new(2048);
        let mut out = Vec::new();
        let data = vec![7u8; 5000];
        let step = job.step(&data, true, &mut out).unwrap();
        assert!(step.finished);
        assert_eq!(step.consumed, 5000);
        let sig = Signature::parse(&out).unwrap();
        assert_eq!(sig.block_count(), 3);
        assert_eq!(sig.block_len(), 2048);
    }

    #[test]
    fn test_delta_buffer_stays_bounded_on_long_match_runs() {
        let block = 2048;
        let base: Vec<u8> = (0..64 * block as u32).map(|i| (i.wrapping_mul(2654435761) >> 11) as u8).collect();
        let mut sig_out = Vec::new();
        SignatureJob::new(block as u32).step(&base, true, &mut sig_out).unwrap();
        let mut job = DeltaJob::new(Signature::parse(&sig_out).unwrap());

        let mut out = Vec::new();
        for _ in 0..16 {
            job.step(&base, false, &mut out).unwrap();
            assert!(job.buf.len() - job.start < block);
            assert!(job.buf.len() <= 2 * base.len());
        }
        job.step(&[], true, &mut out).unwrap();
        assert!(job.finished);
        // Whole input is copies of the base
        assert!(out.len() < 16 * 64 * 16);
    }

    #[test]
    fn test_patch_rejects_unknown_op() {
        let mut job = PatchJob::new(Box::new(|_buf, _off| Ok(0)));
        let mut out = Vec::new();
        assert!(job.step(&[0x09], true, &mut out).is_err());
    }

    #[test]
    fn test_patch_copy_beyond_base_fails() {
        let mut job = PatchJob::new(Box::new(|_buf, _off| Ok(0)));
        let mut ops = vec![OP_COPY];
        ops.extend_from_slice(&0u64.to_be_bytes());
        ops.extend_from_slice(&10u32.to_be_bytes());
        let mut out = Vec::new();
        assert!(job.step(&ops, true, &mut out).is_err());
    }
}
