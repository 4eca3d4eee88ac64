//! Incremental delta codec.
//!
//! The engine works on bounded buffers, so every phase is wrapped in a
//! pull-style job: callers push input chunks through a [`Driver`] and collect
//! whatever output the job produced, or pull output lazily from a reader with
//! [`drive_over_stream`].
//!
//! ```text
//! base ──signature──> sig
//! sig + new ──delta──> ops
//! base(read_at) + ops ──patch──> new
//! ```

pub mod engine;

pub use engine::{
    block_len_for, DeltaJob, PatchJob, ReadAt, Rolling, Signature, SignatureJob, IO_UNIT,
};

use crate::error::{Result, TransferError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Read};

/// Outcome of one engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Bytes of input taken by the job.
    pub consumed: usize,
    /// The job has emitted all of its output.
    pub finished: bool,
}

impl Step {
    pub fn done(consumed: usize) -> Self {
        Self {
            consumed,
            finished: true,
        }
    }
}

/// One phase of the engine.
pub trait Job {
    /// Consume a prefix of `input`, appending output to `out`.
    /// `eof` is set once no further input will arrive.
    fn step(&mut self, input: &[u8], eof: bool, out: &mut Vec<u8>) -> Result<Step>;

    /// Preferred size of input blocks.
    fn input_size(&self) -> usize;

    /// Preferred capacity of output buffers.
    fn output_size(&self) -> usize;
}

/// Owned handle on a running job. Unconsumed input is carried to the next call.
pub struct Driver<J: Job> {
    job: J,
    pending: Vec<u8>,
    finished: bool,
}

impl<J: Job> Driver<J> {
    pub fn new(job: J) -> Self {
        Self {
            job,
            pending: Vec::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn input_size(&self) -> usize {
        self.job.input_size()
    }

    /// Feed one chunk and collect the output it produced.
    pub fn drive(&mut self, chunk: &[u8], eof: bool) -> Result<Vec<Bytes>> {
        if self.finished {
            if chunk.is_empty() {
                return Ok(Vec::new());
            }
            return Err(TransferError::protocol("too much input"));
        }
        self.pending.extend_from_slice(chunk);

        let mut outputs = Vec::new();
        let mut stalls = 0;
        loop {
            let mut out = Vec::with_capacity(self.job.output_size());
            let step = self.job.step(&self.pending, eof, &mut out)?;
            self.pending.drain(..step.consumed);
            let progressed = step.consumed > 0 || !out.is_empty();
            if !out.is_empty() {
                outputs.push(Bytes::from(out));
            }

            if step.finished {
                self.finished = true;
                if !self.pending.is_empty() {
                    return Err(TransferError::protocol("too much input"));
                }
                break;
            }

            if progressed {
                stalls = 0;
                if self.pending.is_empty() && !eof {
                    break;
                }
            } else if !eof {
                break;
            } else {
                stalls += 1;
                if stalls > 1 {
                    return Err(TransferError::protocol("insufficient input data"));
                }
            }
        }
        Ok(outputs)
    }

    /// Release the job. Fails if it was abandoned before finishing.
    pub fn close(self) -> Result<()> {
        if self.finished {
            Ok(())
        } else {
            Err(TransferError::protocol("insufficient input data"))
        }
    }
}

/// Lazy, finite, non-restartable output of a job fed from a reader.
pub struct DeltaStream<J: Job, R: Read> {
    driver: Driver<J>,
    reader: R,
    buf: Vec<u8>,
    queue: VecDeque<Bytes>,
    done: bool,
}

/// Drive `job` with fixed-size blocks read from `reader`.
pub fn drive_over_stream<J: Job, R: Read>(job: J, reader: R) -> DeltaStream<J, R> {
    let size = job.input_size();
    DeltaStream {
        driver: Driver::new(job),
        reader,
        buf: vec![0u8; size],
        queue: VecDeque::new(),
        done: false,
    }
}

impl<J: Job, R: Read> DeltaStream<J, R> {
    fn read_block(&mut self) -> io::Result<usize> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<J: Job, R: Read> Iterator for DeltaStream<J, R> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.queue.pop_front() {
                return Some(Ok(chunk));
            }
            if self.done {
                return None;
            }

            let n = match self.read_block() {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            let eof = n == 0;
            let chunk = std::mem::take(&mut self.buf);
            let result = self.driver.drive(&chunk[..n], eof);
            self.buf = chunk;

            match result {
                Ok(outputs) => self.queue.extend(outputs),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }

            if eof {
                self.done = true;
                if !self.driver.is_finished() {
                    return Some(Err(TransferError::protocol(
                        "source exhausted before the job finished",
                    )));
                }
            }
        }
    }
}

pub fn signature_job(block_len: u32) -> SignatureJob {
    SignatureJob::new(block_len)
}

pub fn delta_job(signature: Signature) -> DeltaJob {
    DeltaJob::new(signature)
}

pub fn patch_job(read_at: ReadAt) -> PatchJob {
    PatchJob::new(read_at)
}
