//! Push side of a transfer.
//!
//! The sender is a pull-driven state machine: the session feeds it replies
//! with [`Sender::on_message`] and drains outbound messages with
//! [`Sender::poll_outbound`], which produces at most one data chunk per call.
//! Only one file is ever mid-stream, so chunks of a file stay in order.

use crate::delta::{drive_over_stream, DeltaJob, DeltaStream, Signature};
use crate::error::{Result, TransferError};
use crate::transfer::compression::{looks_compressible, Compressor};
use crate::transfer::file::{discover, DiscoveryOptions, File, FileState};
use crate::transfer::outbound::read_full;
use crate::transfer::paths;
use crate::transfer::progress::{NoopObserver, Progress, ProgressObserver, Throughput};
use crate::transfer::protocol::{
    bypass_token, new_transfer_id, Action, Compression, FileType, Message, TransmissionType,
    STATUS_CANCELED, STATUS_OK, STATUS_STARTED,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// Data chunk size before compression and base64.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk whose base64 form, with headers and zlib overhead, still fits one envelope.
pub const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Files smaller than this are neither delta-transferred nor compressed.
pub const RSYNC_MIN_SIZE: u64 = 4 * 1024;

/// How long a canceled sender waits for the terminal to confirm.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// At quiet level 1, how long after the last `end_data` errors may still arrive.
pub const QUIET_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressMode {
    #[default]
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for CompressMode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(TransferError::Config(format!(
                "Unknown compress mode: {}",
                other
            ))),
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub transfer_id: String,
    /// Shared password; when set the prompt is bypassed.
    pub bypass_password: Option<String>,
    pub quiet: u8,
    pub rsync: bool,
    pub compress: CompressMode,
    pub chunk_size: usize,
    pub rsync_min_size: u64,
    pub cancel_grace: Duration,
    pub quiet_grace: Duration,
    /// Pack everything into one tar container.
    pub archive: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            transfer_id: new_transfer_id(),
            bypass_password: None,
            quiet: 0,
            rsync: true,
            compress: CompressMode::Auto,
            chunk_size: DATA_CHUNK_SIZE,
            rsync_min_size: RSYNC_MIN_SIZE,
            cancel_grace: CANCEL_GRACE,
            quiet_grace: QUIET_GRACE,
            archive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    WaitingForPermission,
    PermissionGranted,
    PermissionDenied,
    Canceled,
    Complete,
}

enum Source {
    Plain {
        reader: std::fs::File,
        compressor: Option<Compressor>,
    },
    Delta {
        stream: DeltaStream<DeltaJob, std::fs::File>,
        compressor: Option<Compressor>,
    },
    /// Entries without content send a single `end_data` with this payload.
    Metadata(Bytes),
}

/// Sender state
pub struct Sender {
    config: SenderConfig,
    files: Vec<File>,
    state: SendState,
    outbound: VecDeque<Message>,
    sources: HashMap<usize, Source>,
    throughput: Throughput,
    total_bytes: u64,
    transmitted_bytes: u64,
    failures: Vec<String>,
    cancel_deadline: Option<Instant>,
    cancel_confirmed: bool,
    /// Quiet level 1: end of the wait for late error statuses.
    quiet_deadline: Option<Instant>,
    observer: Box<dyn ProgressObserver>,
    _archive: Option<NamedTempFile>,
}

impl Sender {
    pub fn new(files: Vec<File>, config: SenderConfig) -> Self {
        let total_bytes = files.iter().map(|f| f.size).sum();
        Self {
            config,
            files,
            state: SendState::WaitingForPermission,
            outbound: VecDeque::new(),
            sources: HashMap::new(),
            throughput: Throughput::default(),
            total_bytes,
            transmitted_bytes: 0,
            failures: Vec::new(),
            cancel_deadline: None,
            cancel_confirmed: false,
            quiet_deadline: None,
            observer: Box::new(NoopObserver),
            _archive: None,
        }
    }

    /// Discover `roots` and build a sender for them.
    pub fn from_roots(
        roots: &[PathBuf],
        discovery: &DiscoveryOptions,
        config: SenderConfig,
    ) -> Result<Self> {
        if config.archive {
            let (file, archive) = pack_archive(roots, discovery)?;
            let mut sender = Self::new(vec![file], config);
            sender._archive = Some(archive);
            return Ok(sender);
        }
        let files = discover(roots, discovery)?;
        Ok(Self::new(files, config))
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.transfer_id
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    /// One line per failed file.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Nothing more will happen on this transfer.
    pub fn is_finished(&self) -> bool {
        match self.state {
            SendState::Complete | SendState::PermissionDenied => self.outbound.is_empty(),
            SendState::Canceled => self.outbound.is_empty() && self.cancel_confirmed,
            _ => false,
        }
    }

    /// Queue the `send` request.
    pub fn start(&mut self) {
        let mut msg = Message::new(Action::Send).with_id(&self.config.transfer_id);
        msg.quiet = self.config.quiet;
        if let Some(password) = &self.config.bypass_password {
            msg.bypass = bypass_token(&self.config.transfer_id, password);
        }
        tracing::debug!(
            "Starting transfer {} with {} entries",
            self.config.transfer_id,
            self.files.len()
        );
        self.outbound.push_back(msg);
    }

    /// Abandon the transfer. The terminal is told, then we give up after the grace period.
    pub fn cancel(&mut self) {
        if matches!(
            self.state,
            SendState::Complete | SendState::Canceled | SendState::PermissionDenied
        ) {
            return;
        }
        self.state = SendState::Canceled;
        self.sources.clear();
        self.outbound.clear();
        self.quiet_deadline = None;
        self.outbound
            .push_back(Message::new(Action::Cancel).with_id(&self.config.transfer_id));
        self.cancel_deadline = Some(Instant::now() + self.config.cancel_grace);
    }

    /// Advance timers. Returns true once a pending cancel has timed out.
    pub fn tick(&mut self, now: Instant) -> bool {
        if matches!(self.quiet_deadline, Some(deadline) if now >= deadline) {
            self.quiet_deadline = None;
            // No error arrived in time, so the rest went through
            for idx in 0..self.files.len() {
                if self.files[idx].state == FileState::Finished {
                    self.acknowledge(idx);
                }
            }
        }
        match self.cancel_deadline {
            Some(deadline) if now >= deadline => {
                tracing::debug!("No reply to cancel of {}, giving up", self.config.transfer_id);
                self.cancel_deadline = None;
                self.cancel_confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// The next time [`Sender::tick`] has work to do.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.cancel_deadline, self.quiet_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Process a reply from the terminal.
    pub fn on_message(&mut self, msg: Message) -> Result<()> {
        if msg.id != self.config.transfer_id {
            return Ok(());
        }
        match msg.action {
            Action::Status if msg.file_id.is_empty() => self.on_transfer_status(msg),
            Action::Status => {
                self.on_file_status(msg);
                Ok(())
            }
            Action::Data | Action::EndData => self.on_signature_data(msg),
            other => {
                tracing::warn!("Ignoring unexpected {} message", other.as_str());
                Ok(())
            }
        }
    }

    fn on_transfer_status(&mut self, msg: Message) -> Result<()> {
        match self.state {
            SendState::WaitingForPermission => {
                if msg.status == STATUS_OK {
                    self.permission_granted();
                    Ok(())
                } else {
                    self.state = SendState::PermissionDenied;
                    self.outbound.clear();
                    self.observer.transfer_done(&[msg.status.clone()]);
                    Err(TransferError::PermissionDenied(msg.status))
                }
            }
            SendState::Canceled if msg.status == STATUS_CANCELED => {
                self.cancel_confirmed = true;
                self.cancel_deadline = None;
                Ok(())
            }
            SendState::Canceled => Ok(()),
            _ if msg.is_error_status() => {
                self.state = SendState::Canceled;
                self.cancel_confirmed = true;
                self.sources.clear();
                Err(TransferError::protocol(format!(
                    "Terminal aborted transfer: {}",
                    msg.status
                )))
            }
            _ => Ok(()),
        }
    }

    fn permission_granted(&mut self) {
        self.state = SendState::PermissionGranted;
        let min = self.config.rsync_min_size;
        for file in &mut self.files {
            let eligible = file.file_type.has_payload() && file.size >= min;
            if self.config.rsync && eligible && file.file_type == FileType::Regular {
                file.transmission_type = TransmissionType::Rsync;
            }
            file.compression = match self.config.compress {
                CompressMode::Never => Compression::None,
                CompressMode::Always if eligible => Compression::Zlib,
                CompressMode::Auto if eligible && looks_compressible(&file.local_path) => {
                    Compression::Zlib
                }
                _ => Compression::None,
            };
        }
        let id = self.config.transfer_id.clone();
        for file in &self.files {
            self.outbound.push_back(file.metadata_message(&id));
        }
        if self.files.is_empty() {
            self.complete();
        }
    }

    fn file_index(&self, file_id: &str) -> Option<usize> {
        self.files.iter().position(|f| f.file_id == file_id)
    }

    fn on_file_status(&mut self, msg: Message) {
        let Some(idx) = self.file_index(&msg.file_id) else {
            tracing::warn!("Status for unknown file id {}", msg.file_id);
            return;
        };
        let quiet = self.config.quiet;
        let file = &mut self.files[idx];

        if msg.status == STATUS_STARTED {
            if file.state != FileState::WaitingForStart {
                return;
            }
            file.transmission_type = msg.transmission_type;
            if msg.transmission_type == TransmissionType::Resume {
                file.remote_initial_size = msg.size.unwrap_or(0).min(file.size);
                file.transmitted_bytes = file.remote_initial_size;
            }
            file.state = if msg.transmission_type == TransmissionType::Rsync {
                FileState::WaitingForData
            } else {
                FileState::Transmitting
            };
            return;
        }

        if file.state == FileState::Acknowledged {
            return;
        }
        if msg.is_error_status() {
            if file.error.is_none() {
                let line = format!("{}: {}", file.display_name(), msg.status);
                file.error = Some(msg.status.clone());
                self.failures.push(line);
            }
            self.sources.remove(&idx);
        } else if msg.status != STATUS_OK {
            return;
        } else if quiet > 0 {
            tracing::debug!("Unexpected acknowledgement in quiet mode");
        }
        self.acknowledge(idx);
    }

    fn acknowledge(&mut self, idx: usize) {
        let file = &mut self.files[idx];
        file.state = FileState::Acknowledged;
        file.done_at = Some(Instant::now());
        let name = file.display_name();
        let error = file.error.clone();
        self.observer.file_done(&name, error.as_deref());

        if self.state == SendState::PermissionGranted
            && self
                .files
                .iter()
                .all(|f| f.state == FileState::Acknowledged)
        {
            self.complete();
        } else if self.config.quiet == 1 {
            self.await_quiet_errors();
        }
    }

    /// Errors are still reported at quiet level 1: once everything is sent,
    /// wait a little for them before declaring success.
    fn await_quiet_errors(&mut self) {
        if self.quiet_deadline.is_some() || self.state != SendState::PermissionGranted {
            return;
        }
        let all_sent = self
            .files
            .iter()
            .all(|f| matches!(f.state, FileState::Finished | FileState::Acknowledged));
        if all_sent {
            self.quiet_deadline = Some(Instant::now() + self.config.quiet_grace);
        }
    }

    fn complete(&mut self) {
        self.state = SendState::Complete;
        self.quiet_deadline = None;
        self.outbound
            .push_back(Message::new(Action::Finish).with_id(&self.config.transfer_id));
        self.observer.transfer_done(&self.failures);
    }

    fn on_signature_data(&mut self, msg: Message) -> Result<()> {
        let Some(idx) = self.file_index(&msg.file_id) else {
            return Err(TransferError::protocol(format!(
                "Signature for unknown file id {}",
                msg.file_id
            )));
        };
        let file = &mut self.files[idx];
        if file.state != FileState::WaitingForData {
            return Err(TransferError::protocol(format!(
                "Unexpected signature data for file {}",
                file.file_id
            )));
        }
        file.remote_signature.extend_from_slice(&msg.data);
        if msg.action == Action::EndData {
            file.state = FileState::Transmitting;
        }
        Ok(())
    }

    /// Next message to write, producing a data chunk if nothing else is queued.
    pub fn poll_outbound(&mut self) -> Option<Message> {
        if let Some(msg) = self.outbound.pop_front() {
            return Some(msg);
        }
        if self.state != SendState::PermissionGranted {
            return None;
        }
        let idx = (0..self.files.len()).find(|&i| self.ready_to_stream(i))?;
        match self.next_chunk(idx) {
            Ok(msg) => Some(msg),
            Err(e) => {
                // Close the file remotely, the terminal reports the short write
                let file = &mut self.files[idx];
                tracing::warn!("Failed to read {}: {}", file.display_name(), e);
                if file.error.is_none() {
                    self.failures
                        .push(format!("{}: {}", file.display_name(), e.status()));
                    file.error = Some(e.status());
                }
                self.sources.remove(&idx);
                Some(self.finish_file(idx, Bytes::new()))
            }
        }
    }

    /// Hard links wait until their target has been committed remotely.
    fn ready_to_stream(&self, idx: usize) -> bool {
        let file = &self.files[idx];
        if file.state != FileState::Transmitting {
            return false;
        }
        let target = match file.file_type {
            FileType::Hardlink => file.hard_link_target.as_deref(),
            _ => None,
        };
        match target.and_then(|fid| self.file_index(fid)) {
            Some(t) => matches!(
                self.files[t].state,
                FileState::Finished | FileState::Acknowledged
            ),
            None => true,
        }
    }

    fn open_source(&self, idx: usize) -> Result<Source> {
        let file = &self.files[idx];
        let compressor = (file.compression == Compression::Zlib).then(Compressor::new);
        match file.file_type {
            FileType::Directory => Ok(Source::Metadata(Bytes::new())),
            FileType::Symlink => Ok(Source::Metadata(Bytes::from(
                file.symlink_target.clone().unwrap_or_default(),
            ))),
            FileType::Hardlink => Ok(Source::Metadata(Bytes::from(
                file.hard_link_target.clone().unwrap_or_default(),
            ))),
            FileType::Regular | FileType::Archive => {
                let mut reader = std::fs::File::open(&file.expanded_path)?;
                match file.transmission_type {
                    TransmissionType::Rsync => {
                        let signature = Signature::parse(&file.remote_signature)?;
                        let stream = drive_over_stream(DeltaJob::new(signature), reader);
                        Ok(Source::Delta { stream, compressor })
                    }
                    TransmissionType::Resume => {
                        reader.seek(SeekFrom::Start(file.remote_initial_size))?;
                        Ok(Source::Plain { reader, compressor })
                    }
                    TransmissionType::Simple => Ok(Source::Plain { reader, compressor }),
                }
            }
        }
    }

    fn next_chunk(&mut self, idx: usize) -> Result<Message> {
        if !self.sources.contains_key(&idx) {
            let source = self.open_source(idx)?;
            self.sources.insert(idx, source);
            self.files[idx].transmit_started_at = Some(Instant::now());
        }
        let chunk_size = self.config.chunk_size;
        let source = self
            .sources
            .get_mut(&idx)
            .ok_or_else(|| TransferError::protocol("file source missing"))?;

        let (payload, raw_len, last) = match source {
            Source::Metadata(payload) => (payload.clone(), 0, true),
            Source::Plain { reader, compressor } => {
                let mut buf = vec![0u8; chunk_size];
                let mut payload = Vec::new();
                let mut raw_len = 0;
                let mut last = false;
                // zlib may swallow a whole chunk, keep reading until it emits
                while payload.is_empty() {
                    let n = read_full(reader, &mut buf)?;
                    raw_len += n;
                    if n == 0 {
                        last = true;
                        if let Some(c) = compressor.as_mut() {
                            payload = c.finish(&[])?;
                        }
                        break;
                    }
                    payload = match compressor.as_mut() {
                        Some(c) => c.compress(&buf[..n])?,
                        None => buf[..n].to_vec(),
                    };
                }
                (Bytes::from(payload), raw_len as u64, last)
            }
            Source::Delta { stream, compressor } => match stream.next() {
                Some(chunk) => {
                    let chunk = chunk?;
                    let raw_len = chunk.len() as u64;
                    let payload = match compressor.as_mut() {
                        Some(c) => Bytes::from(c.compress(&chunk)?),
                        None => chunk,
                    };
                    (payload, raw_len, false)
                }
                None => {
                    let payload = match compressor.as_mut() {
                        Some(c) => Bytes::from(c.finish(&[])?),
                        None => Bytes::new(),
                    };
                    (payload, 0, true)
                }
            },
        };

        self.record_progress(idx, raw_len);
        if last {
            self.sources.remove(&idx);
            Ok(self.finish_file(idx, payload))
        } else {
            Ok(Message::new(Action::Data)
                .with_id(&self.config.transfer_id)
                .with_file_id(&self.files[idx].file_id)
                .with_data(payload))
        }
    }

    fn finish_file(&mut self, idx: usize, payload: Bytes) -> Message {
        let quiet = self.config.quiet;
        let file = &mut self.files[idx];
        file.state = FileState::Finished;
        file.transmit_ended_at = Some(Instant::now());
        let msg = Message::new(Action::EndData)
            .with_id(&self.config.transfer_id)
            .with_file_id(&file.file_id)
            .with_data(payload);
        match quiet {
            0 => {}
            1 => self.await_quiet_errors(),
            // Nothing at all is coming
            _ => self.acknowledge(idx),
        }
        msg
    }

    fn record_progress(&mut self, idx: usize, raw_len: u64) {
        let now = Instant::now();
        self.throughput.add(now, raw_len);
        self.transmitted_bytes += raw_len;
        let rate = self.throughput.rate(now);

        let file = &mut self.files[idx];
        file.transmitted_bytes = (file.transmitted_bytes + raw_len).min(file.bytes_to_transmit);
        let file_progress = Progress::new(file.transmitted_bytes, file.bytes_to_transmit, rate);
        let name = file.display_name();
        self.observer.file_progress(&name, file_progress);
        self.observer.transfer_progress(Progress::new(
            self.transmitted_bytes.min(self.total_bytes),
            self.total_bytes,
            rate,
        ));
    }
}

/// Pack `roots` into a tar container sent as one `archive` entry.
fn pack_archive(roots: &[PathBuf], opts: &DiscoveryOptions) -> Result<(File, NamedTempFile)> {
    let archive = NamedTempFile::new()?;
    {
        let mut builder = tar::Builder::new(archive.reopen()?);
        builder.follow_symlinks(false);
        for root in roots {
            let expanded = paths::resolve(&root.to_string_lossy(), &opts.home, &opts.cwd);
            let name = expanded.file_name().map(PathBuf::from).ok_or_else(|| {
                TransferError::Config(format!("Cannot archive {}", root.display()))
            })?;
            if std::fs::symlink_metadata(&expanded)?.is_dir() {
                builder.append_dir_all(&name, &expanded)?;
            } else {
                builder.append_path_with_name(&expanded, &name)?;
            }
        }
        builder.finish()?;
    }

    let meta = std::fs::metadata(archive.path())?;
    let mut files = discover(&[archive.path().to_path_buf()], opts)?;
    let mut file = files
        .pop()
        .ok_or_else(|| TransferError::protocol("archive vanished"))?;
    file.file_type = FileType::Archive;
    file.size = meta.len();
    file.bytes_to_transmit = meta.len();
    file.file_id = "1".to_string();
    file.remote_path = if opts.remote_base.is_empty() {
        "~".to_string()
    } else {
        opts.remote_base.trim_end_matches('/').to_string()
    };
    Ok((file, archive))
}
