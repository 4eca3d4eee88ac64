//! Serving pull requests: expanding file specs and streaming matched files.

use crate::error::{Result, TransferError};
use crate::transfer::compression::Compressor;
use crate::transfer::file::SYMLINK_PATH_PREFIX;
use crate::transfer::paths::{self, to_wire};
use crate::transfer::protocol::{Compression, FileType, Message, STATUS_MATCH};
use bytes::Bytes;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// One file matched by a pull spec.
#[derive(Debug, Clone)]
pub struct Match {
    /// Id the requestor uses to ask for this file.
    pub file_id: String,
    pub path: PathBuf,
    /// Placement below the requestor's destination directory.
    pub relative_path: String,
    pub file_type: FileType,
    pub size: u64,
    pub mtime: i64,
    pub permissions: u32,
}

impl Match {
    fn new(file_id: String, path: PathBuf, relative_path: String, meta: &std::fs::Metadata) -> Self {
        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::Regular
        };
        Self {
            file_id,
            path,
            relative_path,
            file_type,
            size: if file_type == FileType::Regular { meta.len() } else { 0 },
            mtime: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            permissions: meta.mode() & 0o7777,
        }
    }

    /// The `status st=MATCH` reply describing this file.
    pub fn status_message(&self, transfer_id: &str, spec_id: &str) -> Message {
        Message {
            file_type: self.file_type,
            mtime: Some(self.mtime),
            permissions: Some(self.permissions),
            size: Some(self.size),
            name: to_wire(&self.path),
            relative_path: self.relative_path.clone(),
            data: Bytes::from(self.file_id.clone()),
            ..Message::file_status(transfer_id, spec_id, STATUS_MATCH)
        }
    }
}

/// Expand one spec into the files it names.
///
/// `~` and relative patterns resolve against `home`. Matched directories are
/// recursed; placements are relative to the parent of each match.
pub fn expand_spec(pattern: &str, home: &Path, next_id: &mut u64) -> Result<Vec<Match>> {
    let resolved = paths::resolve(pattern, home, home);
    let pattern_text = resolved.to_string_lossy();
    let paths = glob::glob(&pattern_text).map_err(|e| {
        TransferError::transmission("EINVAL", format!("Bad pattern {}: {}", pattern, e.msg))
    })?;

    let mut matches = Vec::new();
    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!("Skipping unreadable match: {}", e);
                continue;
            }
        };
        let anchor = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let walker = ignore::WalkBuilder::new(&path)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();
        for item in walker {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let found = item.path().to_path_buf();
            let meta = std::fs::symlink_metadata(&found)?;
            let rel = found
                .strip_prefix(&anchor)
                .map(to_wire)
                .unwrap_or_else(|_| to_wire(&found));
            *next_id += 1;
            matches.push(Match::new(format!("r{}", next_id), found, rel, &meta));
        }
    }

    if matches.is_empty() {
        return Err(TransferError::transmission(
            "ENOENT",
            format!("No files matched: {}", pattern),
        ));
    }
    Ok(matches)
}

/// Chunked content of one matched file, produced on demand.
pub struct OutboundStream {
    pub file_id: String,
    reader: Option<std::fs::File>,
    compressor: Option<Compressor>,
    link_payload: Option<Bytes>,
    chunk_size: usize,
}

impl OutboundStream {
    pub fn open(m: &Match, compression: Compression, chunk_size: usize) -> Result<Self> {
        let (reader, link_payload) = match m.file_type {
            FileType::Symlink => {
                let target = std::fs::read_link(&m.path)?;
                let payload = format!("{}{}", SYMLINK_PATH_PREFIX, target.to_string_lossy());
                (None, Some(Bytes::from(payload)))
            }
            FileType::Regular => (Some(std::fs::File::open(&m.path)?), None),
            other => {
                return Err(TransferError::transmission(
                    "EINVAL",
                    format!("Cannot stream a {} entry", other.as_str()),
                ))
            }
        };
        let compressor =
            (compression == Compression::Zlib && reader.is_some()).then(Compressor::new);
        Ok(Self {
            file_id: m.file_id.clone(),
            reader,
            compressor,
            link_payload,
            chunk_size,
        })
    }

    /// Next payload and whether it is the last one.
    pub fn next_chunk(&mut self) -> Result<(Bytes, bool)> {
        if let Some(payload) = self.link_payload.take() {
            return Ok((payload, true));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok((Bytes::new(), true));
        };
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = read_full(reader, &mut buf)?;
            if n == 0 {
                self.reader = None;
                let tail = match self.compressor.as_mut() {
                    Some(c) => c.finish(&[])?,
                    None => Vec::new(),
                };
                return Ok((Bytes::from(tail), true));
            }
            let payload = match self.compressor.as_mut() {
                Some(c) => c.compress(&buf[..n])?,
                None => buf[..n].to_vec(),
            };
            if !payload.is_empty() {
                return Ok((Bytes::from(payload), false));
            }
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
