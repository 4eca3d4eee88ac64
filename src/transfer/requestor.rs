//! Pull side of a transfer.
//!
//! The requestor names files on the terminal's machine by pattern, collects
//! the matches the terminal reports and then asks for each one, writing the
//! results below a local destination directory.

use crate::error::{Result, TransferError};
use crate::transfer::dest::DestFile;
use crate::transfer::progress::{NoopObserver, Progress, ProgressObserver, Throughput};
use crate::transfer::protocol::{
    bypass_token, new_transfer_id, Action, Compression, FileType, Message, STATUS_CANCELED,
    STATUS_END, STATUS_MATCH, STATUS_OK,
};
use crate::transfer::sender::CANCEL_GRACE;
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RequestorConfig {
    pub transfer_id: String,
    pub bypass_password: Option<String>,
    /// Local directory receiving the pulled files.
    pub dest_dir: PathBuf,
    pub compress: bool,
    pub cancel_grace: Duration,
}

impl RequestorConfig {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            transfer_id: new_transfer_id(),
            bypass_password: None,
            dest_dir: dest_dir.into(),
            compress: true,
            cancel_grace: CANCEL_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    WaitingForPermission,
    WaitingForFileMetadata,
    Transferring,
    Canceled,
    Finished,
}

#[derive(Debug, Clone)]
struct Spec {
    id: String,
    pattern: String,
    matches: usize,
    done: bool,
    error: Option<String>,
}

/// A file on the terminal's machine reported by a spec match.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub remote_id: String,
    pub name: String,
    pub relative_path: String,
    pub file_type: FileType,
    pub size: u64,
    pub mtime: Option<i64>,
    pub permissions: Option<u32>,
}

pub struct Requestor {
    config: RequestorConfig,
    state: RequestState,
    specs: Vec<Spec>,
    files: Vec<RemoteFile>,
    dests: HashMap<String, DestFile>,
    directories: Vec<DestFile>,
    outbound: VecDeque<Message>,
    in_flight: usize,
    failures: Vec<String>,
    throughput: Throughput,
    received_bytes: u64,
    total_bytes: u64,
    cancel_deadline: Option<Instant>,
    cancel_confirmed: bool,
    observer: Box<dyn ProgressObserver>,
}

impl Requestor {
    pub fn new(patterns: &[String], config: RequestorConfig) -> Self {
        let specs = patterns
            .iter()
            .enumerate()
            .map(|(i, pattern)| Spec {
                id: (i + 1).to_string(),
                pattern: pattern.clone(),
                matches: 0,
                done: false,
                error: None,
            })
            .collect();
        Self {
            config,
            state: RequestState::WaitingForPermission,
            specs,
            files: Vec::new(),
            dests: HashMap::new(),
            directories: Vec::new(),
            outbound: VecDeque::new(),
            in_flight: 0,
            failures: Vec::new(),
            throughput: Throughput::default(),
            received_bytes: 0,
            total_bytes: 0,
            cancel_deadline: None,
            cancel_confirmed: false,
            observer: Box::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.transfer_id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Files reported by the terminal.
    pub fn files(&self) -> &[RemoteFile] {
        &self.files
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn is_finished(&self) -> bool {
        match self.state {
            RequestState::Finished => self.outbound.is_empty(),
            RequestState::Canceled => self.outbound.is_empty() && self.cancel_confirmed,
            _ => false,
        }
    }

    /// Queue `receive` and one `file` message per spec.
    pub fn start(&mut self) {
        let id = self.config.transfer_id.clone();
        let mut receive = Message::new(Action::Receive).with_id(&id);
        receive.size = Some(self.specs.len() as u64);
        if let Some(password) = &self.config.bypass_password {
            receive.bypass = bypass_token(&id, password);
        }
        self.outbound.push_back(receive);
        for spec in &self.specs {
            let mut msg = Message::new(Action::File).with_id(&id).with_file_id(&spec.id);
            msg.name = spec.pattern.clone();
            self.outbound.push_back(msg);
        }
    }

    pub fn cancel(&mut self) {
        if matches!(self.state, RequestState::Canceled | RequestState::Finished) {
            return;
        }
        self.state = RequestState::Canceled;
        for dest in self.dests.values_mut() {
            dest.discard();
        }
        self.dests.clear();
        self.outbound.clear();
        self.outbound
            .push_back(Message::new(Action::Cancel).with_id(&self.config.transfer_id));
        self.cancel_deadline = Some(Instant::now() + self.config.cancel_grace);
    }

    pub fn tick(&mut self, now: Instant) -> bool {
        match self.cancel_deadline {
            Some(deadline) if now >= deadline => {
                self.cancel_deadline = None;
                self.cancel_confirmed = true;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_deadline(&self) -> Option<Instant> {
        self.cancel_deadline
    }

    pub fn poll_outbound(&mut self) -> Option<Message> {
        self.outbound.pop_front()
    }

    pub fn on_message(&mut self, msg: Message) -> Result<()> {
        if msg.id != self.config.transfer_id {
            return Ok(());
        }
        match (self.state, msg.action) {
            (RequestState::Canceled, Action::Status) if msg.file_id.is_empty() => {
                if msg.status == STATUS_CANCELED {
                    self.cancel_confirmed = true;
                    self.cancel_deadline = None;
                }
                Ok(())
            }
            (RequestState::Canceled, _) | (RequestState::Finished, _) => Ok(()),
            (RequestState::WaitingForPermission, Action::Status) if msg.file_id.is_empty() => {
                if msg.status == STATUS_OK {
                    self.state = RequestState::WaitingForFileMetadata;
                    Ok(())
                } else {
                    self.state = RequestState::Canceled;
                    self.cancel_confirmed = true;
                    self.outbound.clear();
                    Err(TransferError::PermissionDenied(msg.status))
                }
            }
            (RequestState::WaitingForFileMetadata, Action::Status) => self.on_spec_status(msg),
            (RequestState::Transferring, Action::Status) => {
                self.on_file_error(&msg);
                Ok(())
            }
            (RequestState::Transferring, Action::Data | Action::EndData) => {
                self.on_file_data(msg);
                Ok(())
            }
            (_, Action::Status) if msg.is_error_status() => {
                self.abandon();
                Err(TransferError::protocol(format!(
                    "Terminal aborted transfer: {}",
                    msg.status
                )))
            }
            (state, action) => {
                tracing::warn!("Ignoring {} while {:?}", action.as_str(), state);
                Ok(())
            }
        }
    }

    /// Stop without a `cancel`; the terminal is told we are done.
    fn abandon(&mut self) {
        self.state = RequestState::Canceled;
        self.cancel_confirmed = true;
        self.outbound.clear();
        self.outbound
            .push_back(Message::new(Action::Finish).with_id(&self.config.transfer_id));
    }

    fn on_spec_status(&mut self, msg: Message) -> Result<()> {
        let Some(spec) = self.specs.iter_mut().find(|s| s.id == msg.file_id) else {
            if msg.is_error_status() {
                self.abandon();
                return Err(TransferError::protocol(format!(
                    "Terminal aborted transfer: {}",
                    msg.status
                )));
            }
            return Ok(());
        };

        if msg.status == STATUS_MATCH {
            spec.matches += 1;
            let remote_id = String::from_utf8_lossy(&msg.data).into_owned();
            self.files.push(RemoteFile {
                remote_id,
                name: msg.name,
                relative_path: msg.relative_path,
                file_type: msg.file_type,
                size: msg.size.unwrap_or(0),
                mtime: msg.mtime,
                permissions: msg.permissions,
            });
            return Ok(());
        }
        if msg.status == STATUS_END {
            spec.done = true;
            if let Some(expected) = msg.size {
                if expected as usize != spec.matches {
                    tracing::warn!(
                        "Spec {} reported {} matches, {} received",
                        spec.pattern,
                        expected,
                        spec.matches
                    );
                }
            }
        } else if msg.is_error_status() {
            spec.done = true;
            spec.error = Some(msg.status.clone());
        } else {
            return Ok(());
        }

        if !self.specs.iter().all(|s| s.done) {
            return Ok(());
        }
        let unmatched: Vec<String> = self
            .specs
            .iter()
            .filter(|s| s.matches == 0)
            .map(|s| match &s.error {
                Some(e) => format!("{}: {}", s.pattern, e),
                None => format!("{}: no files matched", s.pattern),
            })
            .collect();
        if !unmatched.is_empty() {
            self.failures.extend(unmatched.iter().cloned());
            self.abandon();
            return Err(TransferError::transmission("ENOENT", unmatched.join("; ")));
        }
        self.begin_transfer();
        Ok(())
    }

    fn local_path(&self, relative: &str) -> Option<PathBuf> {
        let rel = Path::new(relative);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        (safe && !relative.is_empty()).then(|| self.config.dest_dir.join(rel))
    }

    fn begin_transfer(&mut self) {
        self.state = RequestState::Transferring;
        let id = self.config.transfer_id.clone();
        let compression = if self.config.compress {
            Compression::Zlib
        } else {
            Compression::None
        };

        for file in self.files.clone() {
            let Some(path) = self.local_path(&file.relative_path) else {
                self.failures
                    .push(format!("{}: unsafe placement {}", file.name, file.relative_path));
                continue;
            };
            let mut meta = Message::new(Action::File).with_file_id(&file.remote_id);
            meta.name = file.name.clone();
            meta.file_type = file.file_type;
            meta.size = Some(file.size);
            meta.mtime = file.mtime;
            meta.permissions = file.permissions;

            match file.file_type {
                FileType::Directory => {
                    if let Err(e) = std::fs::create_dir_all(&path) {
                        self.failures.push(format!("{}: {}", file.name, e));
                        continue;
                    }
                    self.directories.push(DestFile::new(path, &meta));
                }
                FileType::Regular | FileType::Symlink => {
                    if file.file_type == FileType::Regular {
                        meta.compression = compression;
                    }
                    self.total_bytes += file.size;
                    self.dests
                        .insert(file.remote_id.clone(), DestFile::new(path, &meta));
                    let mut request = Message::new(Action::File)
                        .with_id(&id)
                        .with_file_id(&file.remote_id);
                    request.compression = meta.compression;
                    self.outbound.push_back(request);
                    self.in_flight += 1;
                }
                other => {
                    tracing::debug!("Not pulling {} entry {}", other.as_str(), file.name);
                }
            }
        }
        self.maybe_finish();
    }

    fn on_file_data(&mut self, msg: Message) {
        let is_last = msg.action == Action::EndData;
        let Some(dest) = self.dests.get_mut(&msg.file_id) else {
            tracing::warn!("Data for unknown file {}", msg.file_id);
            return;
        };
        let name = dest.name.clone();
        let before = dest.bytes_written;
        let result = dest.write_data(&msg.data, is_last, &|_| None);
        let written = dest.bytes_written - before;
        let (so_far, size) = (dest.bytes_written, dest.declared_size.unwrap_or(0));

        let now = Instant::now();
        self.throughput.add(now, written);
        self.received_bytes += written;
        let rate = self.throughput.rate(now);
        self.observer
            .file_progress(&name, Progress::new(so_far, size, rate));
        self.observer.transfer_progress(Progress::new(
            self.received_bytes.min(self.total_bytes),
            self.total_bytes,
            rate,
        ));

        match result {
            Ok(()) if is_last => self.file_done(&msg.file_id, None),
            Ok(()) => {}
            Err(e) => self.file_done(&msg.file_id, Some(e.status())),
        }
    }

    fn on_file_error(&mut self, msg: &Message) {
        if !msg.is_error_status() {
            return;
        }
        if let Some(dest) = self.dests.get_mut(&msg.file_id) {
            dest.discard();
        }
        self.file_done(&msg.file_id, Some(msg.status.clone()));
    }

    fn file_done(&mut self, remote_id: &str, error: Option<String>) {
        let Some(dest) = self.dests.remove(remote_id) else {
            return;
        };
        if let Some(err) = &error {
            self.failures.push(format!("{}: {}", dest.name, err));
        }
        self.observer.file_done(&dest.name, error.as_deref());
        self.in_flight = self.in_flight.saturating_sub(1);
        self.maybe_finish();
    }

    fn maybe_finish(&mut self) {
        if self.state != RequestState::Transferring || self.in_flight > 0 {
            return;
        }
        // Directory times last, after their contents were written
        for dir in self.directories.iter_mut().rev() {
            if let Err(e) = dir.write_data(&[], true, &|_| None) {
                self.failures.push(format!("{}: {}", dir.name, e.status()));
            }
        }
        self.state = RequestState::Finished;
        self.outbound
            .push_back(Message::new(Action::Finish).with_id(&self.config.transfer_id));
        self.observer.transfer_done(&self.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::fs;
    use tempfile::TempDir;

    fn config(dest: &Path) -> RequestorConfig {
        RequestorConfig {
            transfer_id: "p".to_string(),
            compress: false,
            ..RequestorConfig::new(dest)
        }
    }

    fn matched(spec: &str, remote_id: &str, rel: &str, ft: FileType, size: u64) -> Message {
        let mut msg = Message::file_status("p", spec, STATUS_MATCH);
        msg.name = format!("/remote/{}", rel);
        msg.relative_path = rel.to_string();
        msg.file_type = ft;
        msg.size = Some(size);
        msg.permissions = Some(0o755);
        msg.data = Bytes::from(remote_id.to_string());
        msg
    }

    fn end(spec: &str, count: u64) -> Message {
        let mut msg = Message::file_status("p", spec, STATUS_END);
        msg.size = Some(count);
        msg
    }

    fn drain(r: &mut Requestor) -> Vec<Message> {
        std::iter::from_fn(|| r.poll_outbound()).collect()
    }

    #[test]
    fn test_receive_then_specs() {
        let tmp = TempDir::new().unwrap();
        let mut r = Requestor::new(&["~/a".to_string(), "*.txt".to_string()], config(tmp.path()));
        r.start();
        let out = drain(&mut r);
        assert_eq!(out[0].action, Action::Receive);
        assert_eq!(out[0].size, Some(2));
        assert_eq!(out[1].file_id, "1");
        assert_eq!(out[1].name, "~/a");
        assert_eq!(out[2].file_id, "2");
        assert_eq!(r.state(), RequestState::WaitingForPermission);
    }

    #[test]
    fn test_full_pull() {
        let tmp = TempDir::new().unwrap();
        let mut r = Requestor::new(&["~/docs".to_string()], config(tmp.path()));
        r.start();
        drain(&mut r);
        r.on_message(Message::status("p", STATUS_OK)).unwrap();
        assert_eq!(r.state(), RequestState::WaitingForFileMetadata);

        r.on_message(matched("1", "r1", "docs", FileType::Directory, 0)).unwrap();
        r.on_message(matched("1", "r2", "docs/a.txt", FileType::Regular, 5)).unwrap();
        r.on_message(end("1", 2)).unwrap();
        assert_eq!(r.state(), RequestState::Transferring);
        assert_eq!(r.files().len(), 2);
        assert!(tmp.path().join("docs").is_dir());

        let out = drain(&mut r);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, Action::File);
        assert_eq!(out[0].file_id, "r2");

        r.on_message(Message::new(Action::Data).with_id("p").with_file_id("r2").with_data(Bytes::from_static(b"alpha")))
            .unwrap();
        r.on_message(Message::new(Action::EndData).with_id("p").with_file_id("r2"))
            .unwrap();
        assert_eq!(r.state(), RequestState::Finished);
        assert_eq!(fs::read(tmp.path().join("docs/a.txt")).unwrap(), b"alpha");
        let out = drain(&mut r);
        assert_eq!(out[0].action, Action::Finish);
        assert!(r.is_finished());
        assert!(r.failures().is_empty());
    }

    #[test]
    fn test_unmatched_spec_fails() {
        let tmp = TempDir::new().unwrap();
        let mut r = Requestor::new(&["a".to_string(), "b".to_string()], config(tmp.path()));
        r.start();
        r.on_message(Message::status("p", STATUS_OK)).unwrap();
        r.on_message(matched("1", "r1", "a", FileType::Regular, 1)).unwrap();
        r.on_message(end("1", 1)).unwrap();
        let err = r
            .on_message(Message::file_status("p", "2", "ENOENT:No files matched: b"))
            .unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert_eq!(r.state(), RequestState::Canceled);
        assert_eq!(r.failures().len(), 1);
    }

    #[test]
    fn test_permission_denied() {
        let tmp = TempDir::new().unwrap();
        let mut r = Requestor::new(&["a".to_string()], config(tmp.path()));
        r.start();
        drain(&mut r);
        let err = r
            .on_message(Message::status("p", "EPERM:User refused the transfer"))
            .unwrap_err();
        assert!(matches!(err, TransferError::PermissionDenied(_)));
        assert!(r.is_finished());
    }

    #[test]
    fn test_unsafe_placement_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut r = Requestor::new(&["x".to_string()], config(tmp.path()));
        r.start();
        r.on_message(Message::status("p", STATUS_OK)).unwrap();
        r.on_message(matched("1", "r1", "../escape", FileType::Regular, 1)).unwrap();
        r.on_message(end("1", 1)).unwrap();
        assert_eq!(r.state(), RequestState::Finished);
        assert_eq!(r.failures().len(), 1);
    }

    #[test]
    fn test_remote_read_error_recorded() {
        let tmp = TempDir::new().unwrap();
        let mut r = Requestor::new(&["x".to_string()], config(tmp.path()));
        r.start();
        r.on_message(Message::status("p", STATUS_OK)).unwrap();
        r.on_message(matched("1", "r1", "x", FileType::Regular, 3)).unwrap();
        r.on_message(end("1", 1)).unwrap();
        r.on_message(Message::file_status("p", "r1", "EACCES:Permission denied"))
            .unwrap();
        assert_eq!(r.state(), RequestState::Finished);
        assert!(r.failures()[0].contains("EACCES"));
    }
}
