use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{code}: {message}")]
    Transmission { code: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transfer canceled")]
    Canceled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransferError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn transmission(code: &'static str, message: impl Into<String>) -> Self {
        Self::Transmission {
            code,
            message: message.into(),
        }
    }

    /// Errno-style code used as the prefix of a `status` reply.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "EINVAL",
            Self::PermissionDenied(_) => "EPERM",
            Self::Transmission { code, .. } => code,
            Self::Io(e) => errno_name(e),
            Self::Canceled => "ECANCELED",
            Self::Config(_) => "EINVAL",
        }
    }

    /// Render as the text of a `status` field: `CODE:message`.
    pub fn status(&self) -> String {
        let message = match self {
            Self::Protocol(m) | Self::PermissionDenied(m) | Self::Config(m) => m.clone(),
            Self::Transmission { message, .. } => message.clone(),
            Self::Io(e) => io_message(e),
            Self::Canceled => "Transfer canceled".to_string(),
        };
        format!("{}:{}", self.code(), message)
    }
}

/// Map an OS error to its errno name, falling back on the error kind.
pub fn errno_name(err: &io::Error) -> &'static str {
    if let Some(code) = err.raw_os_error() {
        let name = match code {
            libc::EPERM => "EPERM",
            libc::ENOENT => "ENOENT",
            libc::EIO => "EIO",
            libc::EACCES => "EACCES",
            libc::EEXIST => "EEXIST",
            libc::ENOTDIR => "ENOTDIR",
            libc::EISDIR => "EISDIR",
            libc::EINVAL => "EINVAL",
            libc::EFBIG => "EFBIG",
            libc::ENOSPC => "ENOSPC",
            libc::EROFS => "EROFS",
            libc::EMLINK => "EMLINK",
            libc::ENAMETOOLONG => "ENAMETOOLONG",
            libc::ENOTEMPTY => "ENOTEMPTY",
            libc::ELOOP => "ELOOP",
            libc::EXDEV => "EXDEV",
            _ => "",
        };
        if !name.is_empty() {
            return name;
        }
    }
    match err.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => "EINVAL",
        io::ErrorKind::UnexpectedEof => "EIO",
        _ => "EIO",
    }
}

/// The OS description without the trailing "(os error N)".
fn io_message(err: &io::Error) -> String {
    let text = err.to_string();
    match text.rfind(" (os error") {
        Some(idx) => text[..idx].to_string(),
        None => text,
    }
}
