//! Terminal side of the protocol.
//!
//! The broker is an event-driven core owned by its session driver:
//!
//! - [`TerminalBroker::handle_payload`] for every envelope read from the channel
//! - [`TerminalBroker::take_permission_requests`] to find prompts to show
//! - [`TerminalBroker::permission_resolved`] with the user's answer
//! - [`TerminalBroker::sweep`] on a timer to expire idle transfers
//! - [`TerminalBroker::flush`] to write queued replies and pull data
//!
//! Nothing here blocks on the channel. When the channel reports it is full
//! the replies stay queued and the driver retries after
//! [`BrokerConfig::retry_delay`].

use crate::error::{Result, TransferError};
use crate::transfer::dest::DestFile;
use crate::transfer::outbound::{expand_spec, Match, OutboundStream};
use crate::transfer::paths;
use crate::transfer::protocol::{
    bypass_token, Action, FileType, Message, TransmissionType, STATUS_CANCELED, STATUS_END,
    STATUS_OK, STATUS_STARTED,
};
use crate::transfer::sender::DATA_CHUNK_SIZE;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Idle transfers are dropped after this long.
pub const EXPIRE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Delay before retrying a write the channel refused.
pub const RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// `~` and relative names resolve here.
    pub home: PathBuf,
    pub bypass_password: Option<String>,
    pub expire_after: Duration,
    pub retry_delay: Duration,
    pub chunk_size: usize,
}

impl BrokerConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            bypass_password: None,
            expire_after: EXPIRE_AFTER,
            retry_delay: RETRY_DELAY,
            chunk_size: DATA_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Pending,
    Granted,
    Denied,
}

/// A prompt the host must show before a transfer may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    pub transfer_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Full,
}

/// Where replies go. Must preserve the order of accepted writes.
pub trait ReplyChannel {
    fn try_write(&mut self, payload: &str) -> WriteOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued was written.
    Idle,
    /// The channel is full; retry later.
    Blocked,
}

#[derive(Debug, Clone, Copy)]
struct Quiet {
    acknowledgements: bool,
    errors: bool,
}

impl Quiet {
    fn from_level(level: u8) -> Self {
        Self {
            acknowledgements: level == 0,
            errors: level < 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    Drop,
}

#[derive(Default)]
struct ActiveReceive {
    files: HashMap<String, DestFile>,
    /// Directories created on `end_data`, whose times wait for `finish`.
    directories: Vec<String>,
}

impl ActiveReceive {
    /// Set directory times deepest first, once nothing more lands inside them.
    fn commit_directories(&mut self) {
        let ready = std::mem::take(&mut self.directories);
        let mut dirs: Vec<&mut DestFile> = self
            .files
            .iter_mut()
            .filter(|(fid, _)| ready.contains(fid))
            .map(|(_, d)| d)
            .collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(d.path.components().count()));
        for dir in dirs {
            if let Err(e) = dir.write_data(&[], true, &|_| None) {
                tracing::warn!("Cannot finish directory {}: {}", dir.path.display(), e);
            }
        }
    }
}

struct ActiveSend {
    spec_count: usize,
    specs: Vec<(String, String)>,
    answered: bool,
    matches: HashMap<String, Match>,
    streams: VecDeque<OutboundStream>,
}

impl ActiveSend {
    fn new(spec_count: usize) -> Self {
        Self {
            spec_count,
            specs: Vec::new(),
            answered: spec_count == 0,
            matches: HashMap::new(),
            streams: VecDeque::new(),
        }
    }
}

enum Direction {
    /// The remote side pushes files to us.
    Receive(ActiveReceive),
    /// The remote side pulls files from us.
    Send(ActiveSend),
}

struct Transfer {
    id: String,
    permission: PermissionState,
    quiet: Quiet,
    last_activity_at: Instant,
    suspended: VecDeque<Message>,
    direction: Direction,
}

impl Transfer {
    /// Release every open destination and stream.
    fn teardown(self) {
        match self.direction {
            Direction::Receive(mut r) => {
                for dest in r.files.values_mut().filter(|d| !d.is_closed()) {
                    dest.discard();
                }
            }
            Direction::Send(s) => drop(s.streams),
        }
    }
}

pub struct TerminalBroker {
    config: BrokerConfig,
    transfers: HashMap<String, Transfer>,
    permission_requests: VecDeque<PermissionRequest>,
    replies: VecDeque<Message>,
    next_remote_id: u64,
}

impl TerminalBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            transfers: HashMap::new(),
            permission_requests: VecDeque::new(),
            replies: VecDeque::new(),
            next_remote_id: 0,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn has_transfer(&self, id: &str) -> bool {
        self.transfers.contains_key(id)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    pub fn permission_state(&self, id: &str) -> Option<PermissionState> {
        self.transfers.get(id).map(|t| t.permission)
    }

    /// Prompts raised since the last call.
    pub fn take_permission_requests(&mut self) -> Vec<PermissionRequest> {
        self.permission_requests.drain(..).collect()
    }

    /// Whether replies or pull data are waiting to be flushed.
    pub fn has_pending_output(&self) -> bool {
        !self.replies.is_empty()
            || self.transfers.values().any(|t| match &t.direction {
                Direction::Send(s) => t.permission == PermissionState::Granted && !s.streams.is_empty(),
                Direction::Receive(_) => false,
            })
    }

    /// Parse and process one envelope payload.
    pub fn handle_payload(&mut self, payload: &str, now: Instant) {
        match Message::deserialize(payload) {
            Ok(msg) => self.handle_message(msg, now),
            Err(e) => tracing::warn!("Dropping malformed message: {}", e),
        }
    }

    pub fn handle_message(&mut self, msg: Message, now: Instant) {
        if msg.id.is_empty() {
            tracing::warn!("Dropping {} message without transfer id", msg.action.as_str());
            return;
        }
        let Some(mut transfer) = self.transfers.remove(&msg.id) else {
            self.start_transfer(msg, now);
            return;
        };
        transfer.last_activity_at = now;

        let disposition = match transfer.permission {
            PermissionState::Pending if msg.action == Action::Cancel => {
                self.replies
                    .push_back(Message::status(&transfer.id, STATUS_CANCELED));
                Disposition::Drop
            }
            PermissionState::Pending => {
                transfer.suspended.push_back(msg);
                Disposition::Keep
            }
            PermissionState::Denied => {
                self.replies.push_back(Message::status(
                    &transfer.id,
                    "EPERM:The transfer was refused",
                ));
                Disposition::Keep
            }
            PermissionState::Granted => self.process(&mut transfer, msg),
        };

        match disposition {
            Disposition::Keep => {
                self.transfers.insert(transfer.id.clone(), transfer);
            }
            Disposition::Drop => transfer.teardown(),
        }
    }

    fn start_transfer(&mut self, msg: Message, now: Instant) {
        let direction = match msg.action {
            Action::Send => Direction::Receive(ActiveReceive::default()),
            Action::Receive => Direction::Send(ActiveSend::new(msg.size.unwrap_or(0) as usize)),
            Action::Cancel => {
                self.replies.push_back(Message::status(&msg.id, STATUS_CANCELED));
                return;
            }
            Action::Finish => return,
            other => {
                tracing::warn!("{} for unknown transfer {}", other.as_str(), msg.id);
                self.replies.push_back(Message::status(
                    &msg.id,
                    "EINVAL:Unknown transfer id",
                ));
                return;
            }
        };

        let mut transfer = Transfer {
            id: msg.id.clone(),
            permission: PermissionState::Pending,
            quiet: Quiet::from_level(msg.quiet),
            last_activity_at: now,
            suspended: VecDeque::new(),
            direction,
        };

        if self.bypass_is_valid(&msg) {
            tracing::info!("Transfer {} accepted by password", msg.id);
            transfer.permission = PermissionState::Granted;
            self.replies.push_back(Message::status(&msg.id, STATUS_OK));
        } else {
            let prompt = match transfer.direction {
                Direction::Receive(_) => {
                    "A remote program wants to write files to this computer. Allow it?".to_string()
                }
                Direction::Send(_) => {
                    "A remote program wants to read files from this computer. Allow it?".to_string()
                }
            };
            tracing::info!("Transfer {} waiting for permission", msg.id);
            self.permission_requests.push_back(PermissionRequest {
                transfer_id: msg.id.clone(),
                prompt,
            });
        }
        self.transfers.insert(msg.id, transfer);
    }

    fn bypass_is_valid(&self, msg: &Message) -> bool {
        match &self.config.bypass_password {
            Some(password) if !msg.bypass.is_empty() => {
                let ok = msg.bypass == bypass_token(&msg.id, password);
                if !ok {
                    tracing::warn!("Invalid bypass token for transfer {}", msg.id);
                }
                ok
            }
            _ => false,
        }
    }

    /// Record the answer to a permission prompt and resume the transfer.
    pub fn permission_resolved(&mut self, id: &str, allowed: bool, now: Instant) {
        let Some(mut transfer) = self.transfers.remove(id) else {
            tracing::debug!("Permission answer for vanished transfer {}", id);
            return;
        };
        if transfer.permission != PermissionState::Pending {
            self.transfers.insert(transfer.id.clone(), transfer);
            return;
        }
        transfer.last_activity_at = now;

        if !allowed {
            tracing::info!("Transfer {} denied", id);
            transfer.permission = PermissionState::Denied;
            transfer.suspended.clear();
            self.replies
                .push_back(Message::status(id, "EPERM:User refused the transfer"));
            self.transfers.insert(transfer.id.clone(), transfer);
            return;
        }

        tracing::info!("Transfer {} accepted", id);
        transfer.permission = PermissionState::Granted;
        self.replies.push_back(Message::status(id, STATUS_OK));
        while let Some(msg) = transfer.suspended.pop_front() {
            if self.process(&mut transfer, msg) == Disposition::Drop {
                transfer.teardown();
                return;
            }
        }
        self.transfers.insert(transfer.id.clone(), transfer);
    }

    /// Drop transfers idle for longer than the expiry. Returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expire_after = self.config.expire_after;
        let expired: Vec<String> = self
            .transfers
            .values()
            .filter(|t| now.saturating_duration_since(t.last_activity_at) > expire_after)
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            if let Some(transfer) = self.transfers.remove(id) {
                tracing::info!("Transfer {} expired", id);
                transfer.teardown();
            }
        }
        expired.len()
    }

    /// Drop every transfer, as when the channel goes away.
    pub fn abandon_all(&mut self) {
        for (_, transfer) in self.transfers.drain() {
            transfer.teardown();
        }
    }

    /// Write queued replies, then pull data, until done or the channel is full.
    pub fn flush(&mut self, channel: &mut dyn ReplyChannel) -> Flush {
        loop {
            let msg = match self.replies.pop_front() {
                Some(msg) => msg,
                None => match self.next_pull_chunk() {
                    Some(msg) => msg,
                    None => return Flush::Idle,
                },
            };
            if channel.try_write(&msg.serialize()) == WriteOutcome::Full {
                self.replies.push_front(msg);
                return Flush::Blocked;
            }
        }
    }

    fn process(&mut self, transfer: &mut Transfer, msg: Message) -> Disposition {
        match msg.action {
            Action::Cancel => {
                tracing::info!("Transfer {} canceled", transfer.id);
                self.replies
                    .push_back(Message::status(&transfer.id, STATUS_CANCELED));
                Disposition::Drop
            }
            Action::Finish => {
                tracing::info!("Transfer {} finished", transfer.id);
                if let Direction::Receive(r) = &mut transfer.direction {
                    r.commit_directories();
                }
                Disposition::Drop
            }
            _ => {
                let Transfer {
                    id,
                    quiet,
                    direction,
                    ..
                } = transfer;
                match direction {
                    Direction::Receive(r) => self.process_receive(id, *quiet, r, msg),
                    Direction::Send(s) => self.process_send(id, *quiet, s, msg),
                }
            }
        }
    }

    fn reply_error(&mut self, id: &str, file_id: &str, quiet: Quiet, err: &TransferError) {
        tracing::warn!("Transfer {} file {}: {}", id, file_id, err);
        if quiet.errors {
            self.replies
                .push_back(Message::file_status(id, file_id, err.status()));
        }
    }

    // =========================================================================
    // Push: files written to this machine
    // =========================================================================

    fn process_receive(
        &mut self,
        id: &str,
        quiet: Quiet,
        r: &mut ActiveReceive,
        msg: Message,
    ) -> Disposition {
        match msg.action {
            Action::File => {
                if let Err(e) = self.open_file(id, r, &msg) {
                    self.reply_error(id, &msg.file_id, quiet, &e);
                }
            }
            Action::Data | Action::EndData => {
                let is_last = msg.action == Action::EndData;
                let peers: HashMap<String, PathBuf> = if is_last {
                    r.files
                        .iter()
                        .map(|(fid, f)| (fid.clone(), f.path.clone()))
                        .collect()
                } else {
                    HashMap::new()
                };
                let lookup = |fid: &str| peers.get(fid).cloned();

                let Some(dest) = r.files.get_mut(&msg.file_id) else {
                    let err = TransferError::transmission("EINVAL", "Unknown file id");
                    self.reply_error(id, &msg.file_id, quiet, &err);
                    return Disposition::Keep;
                };
                let written = if dest.file_type == FileType::Directory && !dest.is_closed() {
                    // Children still to come would bump the times
                    if is_last && !r.directories.contains(&msg.file_id) {
                        r.directories.push(msg.file_id.clone());
                    }
                    fs::create_dir_all(&dest.path).map_err(TransferError::from)
                } else {
                    dest.write_data(&msg.data, is_last, &lookup)
                };
                match written {
                    Ok(()) if is_last => {
                        tracing::debug!("Committed {}", dest.path.display());
                        if quiet.acknowledgements {
                            let mut ack = Message::file_status(id, &msg.file_id, STATUS_OK);
                            ack.size = Some(dest.bytes_written);
                            self.replies.push_back(ack);
                        }
                    }
                    Ok(()) => {}
                    Err(e) => self.reply_error(id, &msg.file_id, quiet, &e),
                }
            }
            other => {
                let err = TransferError::protocol(format!(
                    "Unexpected {} in a send transfer",
                    other.as_str()
                ));
                self.reply_error(id, "", quiet, &err);
                return Disposition::Drop;
            }
        }
        Disposition::Keep
    }

    fn open_file(&mut self, id: &str, r: &mut ActiveReceive, msg: &Message) -> Result<()> {
        if msg.file_id.is_empty() {
            return Err(TransferError::protocol("File message without file id"));
        }
        if r.files.contains_key(&msg.file_id) {
            return Err(TransferError::transmission(
                "EINVAL",
                "file already exists for this id",
            ));
        }
        if msg.name.is_empty() {
            return Err(TransferError::transmission("EINVAL", "File has no name"));
        }

        let path = paths::resolve(&msg.name, &self.config.home, &self.config.home);
        let mut dest = DestFile::new(path, msg);
        let mut signature = Vec::new();
        if dest.negotiate() == TransmissionType::Rsync {
            match dest.base_signature() {
                Ok(chunks) => signature = chunks,
                Err(e) => {
                    tracing::warn!("Cannot sign {}: {}", dest.path.display(), e);
                    dest.transmission_type = TransmissionType::Simple;
                }
            }
        }

        let mut started = Message::file_status(id, &msg.file_id, STATUS_STARTED);
        started.transmission_type = dest.transmission_type;
        if dest.transmission_type == TransmissionType::Resume {
            started.size = Some(dest.initial_size);
        }
        self.replies.push_back(started);
        if dest.transmission_type == TransmissionType::Rsync {
            self.queue_signature(id, &msg.file_id, signature);
        }
        r.files.insert(msg.file_id.clone(), dest);
        Ok(())
    }

    fn queue_signature(&mut self, id: &str, file_id: &str, chunks: Vec<Bytes>) {
        let signature = Bytes::from(chunks.concat());
        let chunk_size = self.config.chunk_size.max(1);
        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(signature.len());
            let last = end == signature.len();
            let action = if last { Action::EndData } else { Action::Data };
            self.replies.push_back(
                Message::new(action)
                    .with_id(id)
                    .with_file_id(file_id)
                    .with_data(signature.slice(offset..end)),
            );
            if last {
                break;
            }
            offset = end;
        }
    }

    // =========================================================================
    // Pull: files read from this machine
    // =========================================================================

    fn process_send(
        &mut self,
        id: &str,
        quiet: Quiet,
        s: &mut ActiveSend,
        msg: Message,
    ) -> Disposition {
        match msg.action {
            Action::File if !s.answered => {
                s.specs.push((msg.file_id, msg.name));
                if s.specs.len() >= s.spec_count {
                    self.answer_specs(id, quiet, s);
                }
            }
            Action::File => {
                let opened = match s.matches.get(&msg.file_id) {
                    Some(m) => OutboundStream::open(m, msg.compression, self.config.chunk_size),
                    None => Err(TransferError::transmission("EINVAL", "Unknown file id")),
                };
                match opened {
                    Ok(stream) => s.streams.push_back(stream),
                    Err(e) => self.reply_error(id, &msg.file_id, quiet, &e),
                }
            }
            other => {
                let err = TransferError::protocol(format!(
                    "Unexpected {} in a receive transfer",
                    other.as_str()
                ));
                self.reply_error(id, "", quiet, &err);
                return Disposition::Drop;
            }
        }
        Disposition::Keep
    }

    fn answer_specs(&mut self, id: &str, quiet: Quiet, s: &mut ActiveSend) {
        s.answered = true;
        let specs = std::mem::take(&mut s.specs);
        for (spec_id, pattern) in specs {
            match expand_spec(&pattern, &self.config.home, &mut self.next_remote_id) {
                Ok(matches) => {
                    let count = matches.len();
                    for m in matches {
                        self.replies.push_back(m.status_message(id, &spec_id));
                        s.matches.insert(m.file_id.clone(), m);
                    }
                    let mut end = Message::file_status(id, &spec_id, STATUS_END);
                    end.size = Some(count as u64);
                    self.replies.push_back(end);
                }
                Err(e) => self.reply_error(id, &spec_id, quiet, &e),
            }
        }
    }

    /// One chunk of pull data, from the first transfer with a stream in flight.
    fn next_pull_chunk(&mut self) -> Option<Message> {
        for transfer in self.transfers.values_mut() {
            if transfer.permission != PermissionState::Granted {
                continue;
            }
            let Direction::Send(s) = &mut transfer.direction else {
                continue;
            };
            let Some(stream) = s.streams.front_mut() else {
                continue;
            };
            transfer.last_activity_at = Instant::now();
            let file_id = stream.file_id.clone();
            let msg = match stream.next_chunk() {
                Ok((data, last)) => {
                    if last {
                        s.streams.pop_front();
                    }
                    let action = if last { Action::EndData } else { Action::Data };
                    Message::new(action)
                        .with_id(&transfer.id)
                        .with_file_id(&file_id)
                        .with_data(data)
                }
                Err(e) => {
                    s.streams.pop_front();
                    tracing::warn!("Failed to read {}: {}", file_id, e);
                    Message::file_status(&transfer.id, &file_id, e.status())
                }
            };
            return Some(msg);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::protocol::STATUS_MATCH;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    /// Collects writes, refusing them once `capacity` is reached.
    struct VecChannel {
        written: Vec<Message>,
        capacity: usize,
    }

    impl VecChannel {
        fn new() -> Self {
            Self {
                written: Vec::new(),
                capacity: usize::MAX,
            }
        }
    }

    impl ReplyChannel for VecChannel {
        fn try_write(&mut self, payload: &str) -> WriteOutcome {
            if self.written.len() >= self.capacity {
                return WriteOutcome::Full;
            }
            self.written.push(Message::deserialize(payload).unwrap());
            WriteOutcome::Written
        }
    }

    fn broker(tmp: &TempDir) -> TerminalBroker {
        let mut config = BrokerConfig::new(tmp.path());
        config.bypass_password = Some("pw".to_string());
        TerminalBroker::new(config)
    }

    fn replies(b: &mut TerminalBroker) -> Vec<Message> {
        let mut ch = VecChannel::new();
        assert_eq!(b.flush(&mut ch), Flush::Idle);
        ch.written
    }

    fn send_msg(id: &str, password: Option<&str>) -> Message {
        let mut msg = Message::new(Action::Send).with_id(id);
        if let Some(pw) = password {
            msg.bypass = bypass_token(id, pw);
        }
        msg
    }

    fn file_msg(id: &str, fid: &str, name: &str, size: u64) -> Message {
        let mut msg = Message::new(Action::File).with_id(id).with_file_id(fid);
        msg.name = name.to_string();
        msg.size = Some(size);
        msg
    }

    fn data(id: &str, fid: &str, bytes: &'static [u8], last: bool) -> Message {
        let action = if last { Action::EndData } else { Action::Data };
        Message::new(action)
            .with_id(id)
            .with_file_id(fid)
            .with_data(Bytes::from_static(bytes))
    }

    #[test]
    fn test_push_with_bypass() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();

        b.handle_message(send_msg("t", Some("pw")), now);
        assert!(b.take_permission_requests().is_empty());
        b.handle_message(file_msg("t", "1", "~/out/a.txt", 5), now);
        b.handle_message(data("t", "1", b"hel", false), now);
        b.handle_message(data("t", "1", b"lo", true), now);

        let out = replies(&mut b);
        let statuses: Vec<_> = out.iter().map(|m| m.status.as_str()).collect();
        assert_eq!(statuses, vec![STATUS_OK, STATUS_STARTED, STATUS_OK]);
        assert_eq!(out[2].file_id, "1");
        assert_eq!(out[2].size, Some(5));
        assert_eq!(fs::read(tmp.path().join("out/a.txt")).unwrap(), b"hello");

        b.handle_message(Message::new(Action::Finish).with_id("t"), now);
        assert!(!b.has_transfer("t"));
    }

    #[test]
    fn test_messages_suspended_until_permission() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();

        b.handle_message(send_msg("t", None), now);
        b.handle_message(file_msg("t", "1", "x.txt", 1), now);
        let requests = b.take_permission_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].transfer_id, "t");
        assert!(replies(&mut b).is_empty());
        assert_eq!(b.permission_state("t"), Some(PermissionState::Pending));

        b.permission_resolved("t", true, now);
        let out = replies(&mut b);
        assert_eq!(out[0].status, STATUS_OK);
        assert_eq!(out[1].status, STATUS_STARTED);
        assert_eq!(out[1].file_id, "1");
    }

    #[test]
    fn test_wrong_password_asks() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        b.handle_message(send_msg("t", Some("nope")), Instant::now());
        assert_eq!(b.take_permission_requests().len(), 1);
    }

    #[test]
    fn test_denied_transfer_rejects_everything_until_expiry() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();

        b.handle_message(send_msg("t", None), now);
        b.permission_resolved("t", false, now);
        let out = replies(&mut b);
        assert!(out[0].status.starts_with("EPERM:"));

        b.handle_message(file_msg("t", "1", "x", 1), now);
        b.handle_message(data("t", "1", b"x", true), now);
        let out = replies(&mut b);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.status.starts_with("EPERM:")));
        assert!(!tmp.path().join("x").exists());

        assert_eq!(b.sweep(now + Duration::from_secs(60)), 0);
        assert!(b.has_transfer("t"));
        assert_eq!(b.sweep(now + EXPIRE_AFTER + Duration::from_secs(1)), 1);
        assert!(!b.has_transfer("t"));
    }

    #[test]
    fn test_duplicate_file_id() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        b.handle_message(file_msg("t", "1", "a", 1), now);
        b.handle_message(file_msg("t", "1", "b", 1), now);
        let out = replies(&mut b);
        assert_eq!(out[2].status, "EINVAL:file already exists for this id");
    }

    #[test]
    fn test_no_data_after_end_data() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        b.handle_message(file_msg("t", "1", "a", 1), now);
        b.handle_message(data("t", "1", b"a", true), now);
        b.handle_message(data("t", "1", b"b", false), now);
        b.handle_message(data("t", "9", b"b", false), now);
        let out = replies(&mut b);
        assert_eq!(out[2].status, STATUS_OK);
        assert!(out[3].status.starts_with("EINVAL:"));
        assert!(out[4].status.starts_with("EINVAL:Unknown file id"));
        assert_eq!(fs::read(tmp.path().join("a")).unwrap(), b"a");
    }

    #[test]
    fn test_cancel_discards_partial_files() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        b.handle_message(file_msg("t", "1", "partial", 10), now);
        b.handle_message(data("t", "1", b"half", false), now);
        b.handle_message(Message::new(Action::Cancel).with_id("t"), now);

        let out = replies(&mut b);
        assert_eq!(out.last().unwrap().status, STATUS_CANCELED);
        assert!(!b.has_transfer("t"));
        assert!(!tmp.path().join("partial").exists());
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_expiry_discards_open_file() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        b.handle_message(file_msg("t", "1", "out/partial", 10), now);
        b.handle_message(data("t", "1", b"half", false), now);
        let out = tmp.path().join("out");
        assert_eq!(fs::read_dir(&out).unwrap().count(), 1, "temp file sits beside the target");

        assert_eq!(b.sweep(now + Duration::from_secs(1)), 0);
        assert_eq!(b.sweep(now + EXPIRE_AFTER + Duration::from_secs(1)), 1);
        assert!(!b.has_transfer("t"));
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);

        // A later chunk for the expired id is an unknown transfer
        b.handle_message(data("t", "1", b"rest", true), now + EXPIRE_AFTER * 2);
        let last = replies(&mut b).pop().unwrap();
        assert_eq!(last.status, "EINVAL:Unknown transfer id");
        assert!(!out.join("partial").exists());
    }

    #[test]
    fn test_wrong_action_drops_transfer() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        b.handle_message(file_msg("t", "1", "partial", 10), now);
        b.handle_message(data("t", "1", b"half", false), now);
        b.handle_message(Message::new(Action::Receive).with_id("t"), now);

        let out = replies(&mut b);
        assert_eq!(
            out.last().unwrap().status,
            "EINVAL:Unexpected receive in a send transfer"
        );
        assert!(!b.has_transfer("t"));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);

        let mut receive = Message::new(Action::Receive).with_id("p");
        receive.bypass = bypass_token("p", "pw");
        b.handle_message(receive, now);
        b.handle_message(data("p", "1", b"x", true), now);
        assert!(replies(&mut b).last().unwrap().status.starts_with("EINVAL:Unexpected"));
        assert!(!b.has_transfer("p"));
    }

    #[test]
    fn test_directory_times_set_after_contents() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        let mtime = 1_000_000_000 * 1_000_000_000i64;
        b.handle_message(send_msg("t", Some("pw")), now);
        for (fid, name) in [("1", "d"), ("2", "d/sub")] {
            let mut dir = file_msg("t", fid, name, 0);
            dir.file_type = FileType::Directory;
            dir.mtime = Some(mtime);
            b.handle_message(dir, now);
            b.handle_message(data("t", fid, b"", true), now);
        }
        b.handle_message(file_msg("t", "3", "d/sub/a.txt", 1), now);
        b.handle_message(data("t", "3", b"a", true), now);
        b.handle_message(file_msg("t", "4", "d/b.txt", 1), now);
        b.handle_message(data("t", "4", b"b", true), now);
        assert!(replies(&mut b).iter().all(|m| !m.is_error_status()));

        b.handle_message(Message::new(Action::Finish).with_id("t"), now);
        for dir in ["d", "d/sub"] {
            let meta = fs::metadata(tmp.path().join(dir)).unwrap();
            assert_eq!(meta.mtime(), 1_000_000_000, "{}", dir);
        }
    }

    #[test]
    fn test_write_under_regular_file_is_enotdir() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("blocker"), "not a directory").unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        b.handle_message(file_msg("t", "1", "blocker/sub/x", 1), now);
        b.handle_message(data("t", "1", b"x", true), now);

        let out = replies(&mut b);
        assert_eq!(out[1].status, STATUS_STARTED);
        assert_eq!(out[2].file_id, "1");
        assert_eq!(out[2].status, "ENOTDIR:Not a directory");
        assert!(b.has_transfer("t"));
    }

    #[test]
    fn test_write_into_read_only_dir_is_eacces() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        if fs::File::create(locked.join(".writable")).is_ok() {
            // Running with privileges that ignore mode bits
            return;
        }

        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        b.handle_message(file_msg("t", "1", "locked/x", 1), now);
        b.handle_message(data("t", "1", b"x", true), now);
        let out = replies(&mut b);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(out[2].status, "EACCES:Permission denied");
        assert!(!locked.join("x").exists());
    }

    #[test]
    fn test_quiet_levels() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        let mut send = send_msg("q1", Some("pw"));
        send.quiet = 1;
        b.handle_message(send, now);
        b.handle_message(file_msg("q1", "1", "a", 1), now);
        b.handle_message(data("q1", "1", b"a", true), now);
        b.handle_message(data("q1", "7", b"a", true), now);
        let statuses: Vec<_> = replies(&mut b).into_iter().map(|m| m.status).collect();
        assert_eq!(statuses[..2], [STATUS_OK, STATUS_STARTED]);
        assert_eq!(statuses.len(), 3, "errors still reported at q=1");

        let mut send = send_msg("q2", Some("pw"));
        send.quiet = 2;
        b.handle_message(send, now);
        b.handle_message(data("q2", "7", b"a", true), now);
        let statuses: Vec<_> = replies(&mut b).into_iter().map(|m| m.status).collect();
        assert_eq!(statuses, vec![STATUS_OK]);
    }

    #[test]
    fn test_backpressure_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        for i in 1..=5 {
            b.handle_message(file_msg("t", &i.to_string(), &format!("f{}", i), 0), now);
        }

        let mut ch = VecChannel::new();
        ch.capacity = 2;
        assert_eq!(b.flush(&mut ch), Flush::Blocked);
        assert!(b.has_pending_output());
        ch.capacity = 4;
        assert_eq!(b.flush(&mut ch), Flush::Blocked);
        ch.capacity = usize::MAX;
        assert_eq!(b.flush(&mut ch), Flush::Idle);

        let fids: Vec<_> = ch.written.iter().map(|m| m.file_id.as_str()).collect();
        assert_eq!(fids, vec!["", "1", "2", "3", "4", "5"]);
    }

    #[test]
    fn test_rsync_reply_carries_signature() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("base"), vec![7u8; 20_000]).unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();
        b.handle_message(send_msg("t", Some("pw")), now);
        let mut msg = file_msg("t", "1", "base", 20_000);
        msg.transmission_type = TransmissionType::Rsync;
        b.handle_message(msg, now);
        let mut msg = file_msg("t", "2", "missing", 20_000);
        msg.transmission_type = TransmissionType::Rsync;
        b.handle_message(msg, now);

        let out = replies(&mut b);
        assert_eq!(out[1].transmission_type, TransmissionType::Rsync);
        assert_eq!(out[2].action, Action::EndData);
        assert!(out[2].data.starts_with(b"TXSG"));
        assert_eq!(out[3].file_id, "2");
        assert_eq!(out[3].transmission_type, TransmissionType::Simple);
    }

    #[test]
    fn test_unknown_transfer() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        b.handle_message(data("ghost", "1", b"x", false), Instant::now());
        let out = replies(&mut b);
        assert_eq!(out[0].status, "EINVAL:Unknown transfer id");
        assert_eq!(b.transfer_count(), 0);
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let tmp = TempDir::new().unwrap();
        let mut b = broker(&tmp);
        b.handle_payload("ac=bogus;id=t", Instant::now());
        assert!(replies(&mut b).is_empty());
    }

    #[test]
    fn test_pull_serving() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("docs")).unwrap();
        fs::write(tmp.path().join("docs/a.txt"), "alpha").unwrap();
        fs::write(tmp.path().join("docs/b.txt"), "beta").unwrap();
        let mut b = broker(&tmp);
        let now = Instant::now();

        let mut receive = Message::new(Action::Receive).with_id("p");
        receive.bypass = bypass_token("p", "pw");
        receive.size = Some(2);
        b.handle_message(receive, now);
        let mut spec = Message::new(Action::File).with_id("p").with_file_id("1");
        spec.name = "~/docs/*.txt".to_string();
        b.handle_message(spec, now);
        let mut spec = Message::new(Action::File).with_id("p").with_file_id("2");
        spec.name = "nothing-here".to_string();
        b.handle_message(spec, now);

        let out = replies(&mut b);
        assert_eq!(out[0].status, STATUS_OK);
        let matches: Vec<_> = out.iter().filter(|m| m.status == STATUS_MATCH).collect();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].relative_path, "a.txt");
        assert_eq!(matches[0].file_type, FileType::Regular);
        let end = out.iter().find(|m| m.status == STATUS_END).unwrap();
        assert_eq!(end.size, Some(2));
        assert!(out.last().unwrap().status.starts_with("ENOENT:"));

        let remote_id = String::from_utf8(matches[1].data.to_vec()).unwrap();
        b.handle_message(
            Message::new(Action::File).with_id("p").with_file_id(&remote_id),
            now,
        );
        let out = replies(&mut b);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].action, Action::Data);
        assert_eq!(&out[0].data[..], b"beta");
        assert_eq!(out[1].action, Action::EndData);
        assert_eq!(out[1].file_id, remote_id);
    }
}
