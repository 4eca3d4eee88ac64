//! Destination side of one file: writes incoming bytes and commits the entry.
//!
//! Regular files are written to a temporary file next to the destination and
//! renamed into place on commit; resumed files are appended to in place.
//! Rsync transfers run the patch job against the existing file.

use crate::delta::{
    block_len_for, drive_over_stream, patch_job, signature_job, Driver, PatchJob,
};
use crate::error::{Result, TransferError};
use crate::transfer::compression::Decompressor;
use crate::transfer::file::{SYMLINK_FID_PREFIX, SYMLINK_PATH_PREFIX};
use crate::transfer::paths::relative_path;
use crate::transfer::protocol::{Compression, FileType, Message, TransmissionType};
use bytes::Bytes;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Looks up where another entry of the same transfer was written.
pub type PeerLookup<'a> = &'a dyn Fn(&str) -> Option<PathBuf>;

enum Output {
    /// Nothing opened yet.
    Pending,
    Temp(NamedTempFile),
    Append(fs::File),
}

pub struct DestFile {
    pub file_id: String,
    pub name: String,
    pub path: PathBuf,
    pub file_type: FileType,
    pub transmission_type: TransmissionType,
    pub compression: Compression,
    /// Nanoseconds since the epoch.
    pub mtime: Option<i64>,
    pub permissions: Option<u32>,
    pub declared_size: Option<u64>,
    /// Bytes already present when resuming.
    pub initial_size: u64,
    pub bytes_written: u64,
    decompressor: Decompressor,
    output: Output,
    patcher: Option<Driver<PatchJob>>,
    link_payload: Vec<u8>,
    closed: bool,
}

impl DestFile {
    /// Describe the entry announced by a `file` message landing at `path`.
    pub fn new(path: PathBuf, msg: &Message) -> Self {
        Self {
            file_id: msg.file_id.clone(),
            name: msg.name.clone(),
            path,
            file_type: msg.file_type,
            transmission_type: msg.transmission_type,
            compression: msg.compression,
            mtime: msg.mtime,
            permissions: msg.permissions,
            declared_size: msg.size,
            initial_size: 0,
            bytes_written: 0,
            decompressor: Decompressor::new(msg.compression),
            output: Output::Pending,
            patcher: None,
            link_payload: Vec::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Settle the transmission type against what is on disk.
    ///
    /// Rsync needs an existing regular file as base and resume needs a
    /// prefix no longer than the declared size; otherwise fall back to simple.
    pub fn negotiate(&mut self) -> TransmissionType {
        let existing = fs::metadata(&self.path).ok().filter(|m| m.is_file());
        self.transmission_type = match (self.transmission_type, existing) {
            _ if !self.file_type.has_payload() || self.file_type == FileType::Archive => {
                TransmissionType::Simple
            }
            (TransmissionType::Rsync, Some(_)) => TransmissionType::Rsync,
            (TransmissionType::Resume, Some(meta))
                if meta.len() <= self.declared_size.unwrap_or(u64::MAX) =>
            {
                self.initial_size = meta.len();
                TransmissionType::Resume
            }
            _ => TransmissionType::Simple,
        };
        self.transmission_type
    }

    /// Signature of the existing file, chunked for `data` messages.
    pub fn base_signature(&self) -> Result<Vec<Bytes>> {
        let base = fs::File::open(&self.path)?;
        let size = base.metadata()?.len();
        drive_over_stream(signature_job(block_len_for(size)), base).collect()
    }

    fn open_output(&mut self) -> Result<()> {
        if !matches!(self.output, Output::Pending) {
            return Ok(());
        }
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        if self.file_type == FileType::Archive {
            fs::create_dir_all(&self.path)?;
            self.output = Output::Temp(NamedTempFile::new()?);
            return Ok(());
        }

        fs::create_dir_all(&parent)?;
        match self.transmission_type {
            TransmissionType::Resume => {
                let file = OpenOptions::new().append(true).open(&self.path)?;
                self.output = Output::Append(file);
            }
            TransmissionType::Rsync => {
                let base = fs::File::open(&self.path)?;
                let read_at =
                    Box::new(move |buf: &mut [u8], offset: u64| base.read_at(buf, offset));
                self.patcher = Some(Driver::new(patch_job(read_at)));
                self.output = Output::Temp(NamedTempFile::new_in(&parent)?);
            }
            TransmissionType::Simple => {
                self.output = Output::Temp(NamedTempFile::new_in(&parent)?);
            }
        }
        Ok(())
    }

    fn write_out(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.output {
            Output::Temp(temp) => temp.as_file_mut().write_all(data)?,
            Output::Append(file) => file.write_all(data)?,
            Output::Pending => return Err(TransferError::protocol("destination not open")),
        }
        Ok(())
    }

    /// Feed one `data`/`end_data` payload. Commits the entry when `is_last`.
    pub fn write_data(&mut self, data: &[u8], is_last: bool, peers: PeerLookup<'_>) -> Result<()> {
        if self.closed {
            return Err(TransferError::transmission(
                "EINVAL",
                "Data received for a file that is already closed",
            ));
        }
        if !self.file_type.has_payload() {
            self.link_payload.extend_from_slice(data);
            if is_last {
                self.closed = true;
                self.commit_entry(peers)?;
            }
            return Ok(());
        }

        let result = self.write_payload(data, is_last);
        if result.is_err() || is_last {
            self.closed = true;
        }
        if result.is_err() {
            self.discard();
        }
        result
    }

    fn write_payload(&mut self, data: &[u8], is_last: bool) -> Result<()> {
        self.open_output()?;
        let plain = self.decompressor.decompress(data, is_last)?;

        if let Some(patcher) = self.patcher.as_mut() {
            let outputs = patcher.drive(&plain, is_last)?;
            let finished = patcher.is_finished();
            for chunk in outputs {
                self.write_out(&chunk)?;
                self.bytes_written += chunk.len() as u64;
            }
            if is_last && !finished {
                return Err(TransferError::protocol("insufficient input data"));
            }
        } else {
            let total = self.initial_size + self.bytes_written + plain.len() as u64;
            if let Some(limit) = self.declared_size {
                if total > limit {
                    return Err(TransferError::transmission(
                        "EFBIG",
                        format!("More data than the declared {} bytes", limit),
                    ));
                }
            }
            self.write_out(&plain)?;
            self.bytes_written += plain.len() as u64;
        }

        if is_last {
            self.commit_payload()?;
        }
        Ok(())
    }

    fn commit_payload(&mut self) -> Result<()> {
        if self.patcher.is_none() {
            let total = self.initial_size + self.bytes_written;
            if let Some(limit) = self.declared_size {
                if total != limit && self.file_type == FileType::Regular {
                    return Err(TransferError::transmission(
                        "EIO",
                        format!("Received {} of {} bytes", total, limit),
                    ));
                }
            }
        }
        self.patcher = None;

        match std::mem::replace(&mut self.output, Output::Pending) {
            Output::Temp(temp) if self.file_type == FileType::Archive => {
                let mut archive = tar::Archive::new(temp.reopen()?);
                archive.set_preserve_mtime(true);
                archive.unpack(&self.path)?;
                tracing::debug!("Extracted archive into {}", self.path.display());
            }
            Output::Temp(mut temp) => {
                temp.as_file_mut().flush()?;
                temp.persist(&self.path).map_err(|e| e.error)?;
            }
            Output::Append(mut file) => file.flush()?,
            Output::Pending => {}
        }
        self.apply_metadata(false)
    }

    fn commit_entry(&mut self, peers: PeerLookup<'_>) -> Result<()> {
        let payload = String::from_utf8(std::mem::take(&mut self.link_payload))
            .map_err(|_| TransferError::protocol("Link payload is not UTF-8"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.file_type {
            FileType::Directory => {
                fs::create_dir_all(&self.path)?;
                self.apply_metadata(false)
            }
            FileType::Symlink => {
                let target = if let Some(fid) = payload.strip_prefix(SYMLINK_FID_PREFIX) {
                    let peer = peers(fid).ok_or_else(|| {
                        TransferError::transmission(
                            "EINVAL",
                            format!("Unknown symlink target id {}", fid),
                        )
                    })?;
                    let parent = self.path.parent().unwrap_or(Path::new("/"));
                    relative_path(&peer, parent)
                } else if let Some(target) = payload.strip_prefix(SYMLINK_PATH_PREFIX) {
                    PathBuf::from(target)
                } else {
                    return Err(TransferError::protocol(format!(
                        "Malformed symlink target: {}",
                        payload
                    )));
                };
                remove_existing(&self.path)?;
                std::os::unix::fs::symlink(&target, &self.path)?;
                self.apply_metadata(true)
            }
            FileType::Hardlink => {
                let peer = peers(&payload).ok_or_else(|| {
                    TransferError::transmission(
                        "EINVAL",
                        format!("Unknown hard link target id {}", payload),
                    )
                })?;
                remove_existing(&self.path)?;
                fs::hard_link(&peer, &self.path)?;
                Ok(())
            }
            FileType::Regular | FileType::Archive => Ok(()),
        }
    }

    fn apply_metadata(&self, is_symlink: bool) -> Result<()> {
        if let Some(mtime) = self.mtime {
            let time = filetime::FileTime::from_unix_time(
                mtime.div_euclid(1_000_000_000),
                mtime.rem_euclid(1_000_000_000) as u32,
            );
            let res = if is_symlink {
                filetime::set_symlink_file_times(&self.path, time, time)
            } else {
                filetime::set_file_times(&self.path, time, time)
            };
            if let Err(e) = res {
                tracing::warn!("Failed to set mtime on {}: {}", self.path.display(), e);
            }
        }
        if is_symlink || self.file_type == FileType::Archive {
            return Ok(());
        }
        if let Some(mode) = self.permissions {
            let perms = fs::Permissions::from_mode(mode & 0o7777);
            if let Err(e) = fs::set_permissions(&self.path, perms) {
                tracing::warn!("Failed to set permissions on {}: {}", self.path.display(), e);
            }
        }
        Ok(())
    }

    /// Release everything without committing. Temporary output is removed.
    pub fn discard(&mut self) {
        self.closed = true;
        self.patcher = None;
        self.output = Output::Pending;
    }
}

/// Remove a file or link in the way of a new link. Directories are left alone.
fn remove_existing(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{delta_job, Signature};
    use crate::transfer::compression::Compressor;
    use crate::transfer::protocol::Action;
    use std::collections::HashMap;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn no_peers(_: &str) -> Option<PathBuf> {
        None
    }

    fn file_msg(size: u64) -> Message {
        let mut msg = Message::new(Action::File).with_file_id("1");
        msg.size = Some(size);
        msg.mtime = Some(1_600_000_000_500_000_000);
        msg.permissions = Some(0o600);
        msg
    }

    #[test]
    fn test_simple_write_and_commit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sub/out.txt");
        let mut dest = DestFile::new(path.clone(), &file_msg(11));
        assert_eq!(dest.negotiate(), TransmissionType::Simple);

        dest.write_data(b"hello ", false, &no_peers).unwrap();
        assert!(!path.exists(), "nothing visible before commit");
        dest.write_data(b"world", true, &no_peers).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), 1_600_000_000);
        assert!(dest.is_closed());
        assert!(dest.write_data(b"more", true, &no_peers).is_err());
    }

    #[test]
    fn test_overflow_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        let mut dest = DestFile::new(path.clone(), &file_msg(3));
        let err = dest.write_data(b"toolong", false, &no_peers).unwrap_err();
        assert_eq!(err.code(), "EFBIG");
        assert!(dest.is_closed());
        assert!(!path.exists());
    }

    #[test]
    fn test_short_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut dest = DestFile::new(tmp.path().join("f"), &file_msg(10));
        let err = dest.write_data(b"abc", true, &no_peers).unwrap_err();
        assert_eq!(err.code(), "EIO");
    }

    #[test]
    fn test_compressed_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("z.txt");
        let text = "compress me please\n".repeat(500);
        let mut msg = file_msg(text.len() as u64);
        msg.compression = Compression::Zlib;
        let mut dest = DestFile::new(path.clone(), &msg);

        let mut c = Compressor::new();
        let first = c.compress(text.as_bytes()).unwrap();
        let last = c.finish(b"").unwrap();
        dest.write_data(&first, false, &no_peers).unwrap();
        dest.write_data(&last, true, &no_peers).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), text);
    }

    #[test]
    fn test_resume_appends() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r.bin");
        fs::write(&path, b"01234").unwrap();
        let mut msg = file_msg(10);
        msg.transmission_type = TransmissionType::Resume;
        let mut dest = DestFile::new(path.clone(), &msg);
        assert_eq!(dest.negotiate(), TransmissionType::Resume);
        assert_eq!(dest.initial_size, 5);
        dest.write_data(b"56789", true, &no_peers).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"0123456789");
    }

    #[test]
    fn test_rsync_without_base_downgrades() {
        let tmp = TempDir::new().unwrap();
        let mut msg = file_msg(10);
        msg.transmission_type = TransmissionType::Rsync;
        let mut dest = DestFile::new(tmp.path().join("missing"), &msg);
        assert_eq!(dest.negotiate(), TransmissionType::Simple);
    }

    #[test]
    fn test_rsync_patch_over_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.txt");
        let old: Vec<u8> = (0..50_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut new = old.clone();
        new[70_000..70_010].copy_from_slice(b"CHANGED!!!");
        fs::write(&path, &old).unwrap();

        let mut msg = file_msg(new.len() as u64);
        msg.transmission_type = TransmissionType::Rsync;
        let mut dest = DestFile::new(path.clone(), &msg);
        assert_eq!(dest.negotiate(), TransmissionType::Rsync);

        let sig: Vec<u8> = dest.base_signature().unwrap().concat();
        let signature = Signature::parse(&sig).unwrap();
        let delta: Vec<Bytes> = drive_over_stream(delta_job(signature), Cursor::new(new.clone()))
            .collect::<Result<_>>()
            .unwrap();
        let delta_len: usize = delta.iter().map(|c| c.len()).sum();
        assert!(delta_len < new.len() / 4);

        for chunk in &delta {
            dest.write_data(chunk, false, &no_peers).unwrap();
        }
        dest.write_data(b"", true, &no_peers).unwrap();
        assert_eq!(fs::read(&path).unwrap(), new);
    }

    #[test]
    fn test_links_and_directories() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("d/target.txt");
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(&target, "t").unwrap();
        let peers: HashMap<String, PathBuf> = [("1".to_string(), target.clone())].into();
        let lookup = |fid: &str| peers.get(fid).cloned();

        let mut msg = file_msg(0);
        msg.permissions = Some(0o755);
        msg.file_type = FileType::Directory;
        let mut dir = DestFile::new(tmp.path().join("d/sub"), &msg);
        dir.write_data(b"", true, &lookup).unwrap();
        assert!(tmp.path().join("d/sub").is_dir());

        msg.file_type = FileType::Symlink;
        let link = tmp.path().join("d/sub/link");
        let mut sym = DestFile::new(link.clone(), &msg);
        sym.write_data(b"fid:1", true, &lookup).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../target.txt"));

        let abs = tmp.path().join("d/abs");
        let mut sym = DestFile::new(abs.clone(), &msg);
        sym.write_data(b"path:/etc/hosts", true, &lookup).unwrap();
        assert_eq!(fs::read_link(&abs).unwrap(), PathBuf::from("/etc/hosts"));

        msg.file_type = FileType::Hardlink;
        let hard = tmp.path().join("d/hard.txt");
        let mut hl = DestFile::new(hard.clone(), &msg);
        hl.write_data(b"1", true, &lookup).unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(
            fs::metadata(&hard).unwrap().ino(),
            fs::metadata(&target).unwrap().ino()
        );
    }

    #[test]
    fn test_archive_extracted() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("inner")).unwrap();
        fs::write(src.join("inner/a.txt"), "A").unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all("src", &src).unwrap();
        let tarball = builder.into_inner().unwrap();

        let mut msg = file_msg(tarball.len() as u64);
        msg.file_type = FileType::Archive;
        let out = tmp.path().join("out");
        let mut dest = DestFile::new(out.clone(), &msg);
        dest.write_data(&tarball, true, &no_peers).unwrap();
        assert_eq!(fs::read_to_string(out.join("src/inner/a.txt")).unwrap(), "A");
    }
}
