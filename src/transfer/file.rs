//! Sender-side file descriptors and discovery.
//!
//! Discovery walks the local roots, computes where each entry lands on the
//! terminal side, collapses hard links and rewrites internal symlinks so the
//! transferred tree keeps its link structure.

use crate::error::{Result, TransferError};
use crate::transfer::paths::{self, home_relative, join_wire, to_wire};
use crate::transfer::protocol::{Action, Compression, FileType, Message, TransmissionType};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Instant;

/// Prefix of a symlink payload naming another entry of the transfer.
pub const SYMLINK_FID_PREFIX: &str = "fid:";
/// Prefix of a symlink payload carrying a literal target.
pub const SYMLINK_PATH_PREFIX: &str = "path:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    WaitingForStart,
    /// Waiting for the signature of the remote base file.
    WaitingForData,
    Transmitting,
    Finished,
    Acknowledged,
}

#[derive(Debug, Clone)]
pub struct File {
    pub local_path: PathBuf,
    pub expanded_path: PathBuf,
    pub file_id: String,
    pub permissions: u32,
    /// Nanoseconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    pub dev_ino: (u64, u64),
    pub remote_path: String,
    pub file_type: FileType,
    pub hard_link_target: Option<String>,
    /// Wire form of the link target: `fid:<id>` or `path:<target>`.
    pub symlink_target: Option<String>,
    pub transmission_type: TransmissionType,
    pub compression: Compression,
    pub transmitted_bytes: u64,
    pub bytes_to_transmit: u64,
    pub transmit_started_at: Option<Instant>,
    pub transmit_ended_at: Option<Instant>,
    pub done_at: Option<Instant>,
    pub state: FileState,
    pub error: Option<String>,
    /// Signature of the remote base, collected while waiting for data.
    pub remote_signature: Vec<u8>,
    /// Bytes already present remotely when resuming.
    pub remote_initial_size: u64,
}

impl File {
    fn new(local_path: PathBuf, expanded_path: PathBuf, meta: &std::fs::Metadata) -> Self {
        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::Regular
        };
        let size = if file_type == FileType::Regular {
            meta.len()
        } else {
            0
        };
        Self {
            local_path,
            expanded_path,
            file_id: String::new(),
            permissions: meta.mode() & 0o7777,
            mtime: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            size,
            dev_ino: (meta.dev(), meta.ino()),
            remote_path: String::new(),
            file_type,
            hard_link_target: None,
            symlink_target: None,
            transmission_type: TransmissionType::Simple,
            compression: Compression::None,
            transmitted_bytes: 0,
            bytes_to_transmit: size,
            transmit_started_at: None,
            transmit_ended_at: None,
            done_at: None,
            state: FileState::WaitingForStart,
            error: None,
            remote_signature: Vec::new(),
            remote_initial_size: 0,
        }
    }

    /// Display name used in progress and failure reports.
    pub fn display_name(&self) -> String {
        self.local_path.display().to_string()
    }

    /// The `file` message announcing this entry.
    pub fn metadata_message(&self, transfer_id: &str) -> Message {
        Message {
            action: Action::File,
            compression: self.compression,
            file_type: self.file_type,
            transmission_type: self.transmission_type,
            id: transfer_id.to_string(),
            file_id: self.file_id.clone(),
            mtime: Some(self.mtime),
            permissions: Some(self.permissions),
            size: Some(self.size),
            name: self.remote_path.clone(),
            ..Default::default()
        }
    }
}

/// Where discovered entries land on the terminal side.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Mirror local absolute paths instead of joining onto `remote_base`.
    pub mirror: bool,
    pub remote_base: String,
    pub home: PathBuf,
    pub cwd: PathBuf,
}

impl DiscoveryOptions {
    pub fn new(home: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            mirror: false,
            remote_base: String::new(),
            home: home.into(),
            cwd: cwd.into(),
        }
    }
}

fn walk_error(err: ignore::Error) -> TransferError {
    match err.into_io_error() {
        Some(e) => TransferError::Io(e),
        None => TransferError::Io(io::Error::other("directory walk failed")),
    }
}

/// Walk `roots` and build the file list for a push.
pub fn discover(roots: &[PathBuf], opts: &DiscoveryOptions) -> Result<Vec<File>> {
    let base = if opts.remote_base.is_empty() {
        "~/".to_string()
    } else {
        opts.remote_base.clone()
    };
    let rename_single_root = roots.len() == 1 && !base.ends_with('/');

    let mut files: Vec<File> = Vec::new();
    for root in roots {
        let root_str = root.to_string_lossy();
        let expanded_root = paths::resolve(&root_str, &opts.home, &opts.cwd);
        std::fs::symlink_metadata(&expanded_root)?;

        let root_name = expanded_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let walker = ignore::WalkBuilder::new(&expanded_root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        for entry in walker {
            let entry = entry.map_err(walk_error)?;
            let path = entry.path().to_path_buf();
            let meta = std::fs::symlink_metadata(&path)?;
            let rel = path
                .strip_prefix(&expanded_root)
                .map(to_wire)
                .unwrap_or_default();

            let local_path = if rel.is_empty() {
                root.clone()
            } else {
                root.join(&rel)
            };
            let mut file = File::new(local_path, path.clone(), &meta);
            file.remote_path = if opts.mirror {
                home_relative(&path, &opts.home)
            } else if rename_single_root {
                join_wire(&base, &rel)
            } else {
                join_wire(&base, &join_wire(&root_name, &rel))
            };
            files.push(file);
        }
    }

    let mut files = collapse_hard_links(files);
    for (i, file) in files.iter_mut().enumerate() {
        file.file_id = (i + 1).to_string();
    }
    rewrite_symlinks(&mut files)?;
    Ok(files)
}

/// Later entries sharing a `(device, inode)` become hard links to the first.
fn collapse_hard_links(files: Vec<File>) -> Vec<File> {
    let mut seen: HashMap<(u64, u64), usize> = HashMap::new();
    let mut out: Vec<File> = Vec::with_capacity(files.len());
    let mut link_to: Vec<Option<usize>> = Vec::with_capacity(files.len());

    for file in files {
        match seen.get(&file.dev_ino) {
            Some(_) if file.file_type == FileType::Directory => {
                tracing::debug!("Skipping directory listed twice: {}", file.display_name());
                continue;
            }
            Some(&first) => {
                let mut file = file;
                file.file_type = FileType::Hardlink;
                file.size = 0;
                file.bytes_to_transmit = 0;
                out.push(file);
                link_to.push(Some(first));
            }
            None => {
                seen.insert(file.dev_ino, out.len());
                out.push(file);
                link_to.push(None);
            }
        }
    }

    // Ids are assigned after collapsing, so link by index here
    let ids: Vec<String> = (1..=out.len()).map(|i| i.to_string()).collect();
    for (file, target) in out.iter_mut().zip(link_to) {
        if let Some(idx) = target {
            file.hard_link_target = Some(ids[idx].clone());
        }
    }
    out
}

/// Point symlinks at transfer entries by id when their target is part of the transfer.
fn rewrite_symlinks(files: &mut [File]) -> Result<()> {
    let by_path: HashMap<PathBuf, String> = files
        .iter()
        .map(|f| (f.expanded_path.clone(), f.file_id.clone()))
        .collect();

    for file in files.iter_mut().filter(|f| f.file_type == FileType::Symlink) {
        let target = std::fs::read_link(&file.expanded_path)?;
        let resolved = match file.expanded_path.parent() {
            Some(parent) if target.is_relative() => paths::normalize_path(&parent.join(&target)),
            _ => paths::normalize_path(&target),
        };
        let payload = match by_path.get(&resolved) {
            Some(fid) => format!("{}{}", SYMLINK_FID_PREFIX, fid),
            None => format!("{}{}", SYMLINK_PATH_PREFIX, target.to_string_lossy()),
        };
        file.symlink_target = Some(payload);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn opts(tmp: &TempDir, base: &str) -> DiscoveryOptions {
        DiscoveryOptions {
            mirror: false,
            remote_base: base.to_string(),
            home: tmp.path().to_path_buf(),
            cwd: tmp.path().to_path_buf(),
        }
    }

    #[test]
    fn test_directory_before_children() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("tree/sub")).unwrap();
        fs::write(tmp.path().join("tree/a.txt"), "a").unwrap();
        fs::write(tmp.path().join("tree/sub/b.txt"), "bb").unwrap();

        let files = discover(&[PathBuf::from("tree")], &opts(&tmp, "~/dest/")).unwrap();
        let remote: Vec<_> = files.iter().map(|f| f.remote_path.as_str()).collect();
        assert_eq!(
            remote,
            vec!["~/dest/tree", "~/dest/tree/a.txt", "~/dest/tree/sub", "~/dest/tree/sub/b.txt"]
        );
        assert_eq!(files[0].file_type, FileType::Directory);
        assert_eq!(files[3].size, 2);
        let ids: Vec<_> = files.iter().map(|f| f.file_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_single_root_renamed_to_base() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let files = discover(&[PathBuf::from("a.txt")], &opts(&tmp, "~/b.txt")).unwrap();
        assert_eq!(files[0].remote_path, "~/b.txt");
    }

    #[test]
    fn test_mirror_mode_uses_home_relative_paths() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("m.txt"), "m").unwrap();
        let mut o = opts(&tmp, "");
        o.mirror = true;
        let files = discover(&[tmp.path().join("m.txt")], &o).unwrap();
        assert_eq!(files[0].remote_path, "~/m.txt");
    }

    #[test]
    fn test_hardlinks_collapse() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d/one"), "shared").unwrap();
        fs::hard_link(tmp.path().join("d/one"), tmp.path().join("d/two")).unwrap();

        let files = discover(&[PathBuf::from("d")], &opts(&tmp, "~/out/")).unwrap();
        let regular: Vec<_> = files.iter().filter(|f| f.file_type == FileType::Regular).collect();
        let links: Vec<_> = files.iter().filter(|f| f.file_type == FileType::Hardlink).collect();
        assert_eq!(regular.len(), 1);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].hard_link_target.as_deref(), Some(regular[0].file_id.as_str()));
        assert_eq!(links[0].size, 0);
    }

    #[test]
    fn test_symlink_rewriting() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d/target"), "t").unwrap();
        std::os::unix::fs::symlink("target", tmp.path().join("d/inner")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/elsewhere", tmp.path().join("d/outer")).unwrap();

        let files = discover(&[PathBuf::from("d")], &opts(&tmp, "~/out/")).unwrap();
        let target = files.iter().find(|f| f.remote_path.ends_with("/target")).unwrap();
        let inner = files.iter().find(|f| f.remote_path.ends_with("/inner")).unwrap();
        let outer = files.iter().find(|f| f.remote_path.ends_with("/outer")).unwrap();
        assert_eq!(inner.file_type, FileType::Symlink);
        assert_eq!(
            inner.symlink_target.as_deref(),
            Some(format!("fid:{}", target.file_id).as_str())
        );
        assert_eq!(outer.symlink_target.as_deref(), Some("path:/nonexistent/elsewhere"));
    }

    #[test]
    fn test_missing_root_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(discover(&[PathBuf::from("nope")], &opts(&tmp, "~/")).is_err());
    }
}
