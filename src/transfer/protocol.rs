//! Wire messages for the file transfer protocol.
//!
//! A message is a `;`-separated list of `key=value` pairs. A literal `;`
//! inside a value is doubled. Fields at their default are omitted.
//! Names and raw data are base64 so that nothing inside a payload can be
//! mistaken for an escape code by the terminal.

use crate::error::{Result, TransferError};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Status text for a successful operation.
pub const STATUS_OK: &str = "OK";
/// Status text acknowledging a `file` message.
pub const STATUS_STARTED: &str = "STARTED";
/// Status text acknowledging a `cancel`.
pub const STATUS_CANCELED: &str = "CANCELED";
/// Status text for a pull spec match.
pub const STATUS_MATCH: &str = "MATCH";
/// Status text terminating the matches of a pull spec.
pub const STATUS_END: &str = "END";

// =============================================================================
// Enumerated fields
// =============================================================================

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_wire(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(
    /// What a message asks for or reports.
    Action {
        Send => "send",
        File => "file",
        Data => "data",
        EndData => "end_data",
        Receive => "receive",
        Cancel => "cancel",
        Status => "status",
        Finish => "finish",
        Invalid => "invalid",
    }
);

wire_enum!(
    Compression {
        None => "none",
        Zlib => "zlib",
    }
);

wire_enum!(
    FileType {
        Regular => "regular",
        Directory => "directory",
        Symlink => "symlink",
        Hardlink => "hardlink",
        Archive => "archive",
    }
);

wire_enum!(
    TransmissionType {
        Simple => "simple",
        Resume => "resume",
        Rsync => "rsync",
    }
);

impl Default for Action {
    fn default() -> Self {
        Action::Invalid
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

impl Default for FileType {
    fn default() -> Self {
        FileType::Regular
    }
}

impl Default for TransmissionType {
    fn default() -> Self {
        TransmissionType::Simple
    }
}

impl FileType {
    /// Whether entries of this type carry file content.
    pub fn has_payload(&self) -> bool {
        matches!(self, FileType::Regular | FileType::Archive)
    }
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub action: Action,
    pub compression: Compression,
    pub file_type: FileType,
    pub transmission_type: TransmissionType,
    pub id: String,
    pub file_id: String,
    pub bypass: String,
    pub quiet: u8,
    /// Nanoseconds since the epoch.
    pub mtime: Option<i64>,
    pub permissions: Option<u32>,
    pub size: Option<u64>,
    pub name: String,
    pub status: String,
    pub relative_path: String,
    pub data: Bytes,
}

/// One encoded field value. Each variant has a fixed textual encoding.
enum FieldValue<'a> {
    Enum(&'static str),
    Int(i128),
    Text(&'a str),
    Base64Text(&'a str),
    Bytes(&'a [u8]),
}

impl Message {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    /// Transfer-level status reply.
    pub fn status(id: &str, status: impl Into<String>) -> Self {
        Self {
            action: Action::Status,
            id: id.to_string(),
            status: status.into(),
            ..Default::default()
        }
    }

    /// File-level status reply.
    pub fn file_status(id: &str, file_id: &str, status: impl Into<String>) -> Self {
        Self {
            file_id: file_id.to_string(),
            ..Self::status(id, status)
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_file_id(mut self, file_id: &str) -> Self {
        self.file_id = file_id.to_string();
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// True when the status is an error code (`CODE:message`), false for `OK`, `STARTED` and the like.
    pub fn is_error_status(&self) -> bool {
        self.status.contains(':')
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue<'_>)> {
        let mut fields = vec![("ac", FieldValue::Enum(self.action.as_str()))];
        if self.compression != Compression::default() {
            fields.push(("zip", FieldValue::Enum(self.compression.as_str())));
        }
        if self.file_type != FileType::default() {
            fields.push(("ft", FieldValue::Enum(self.file_type.as_str())));
        }
        if self.transmission_type != TransmissionType::default() {
            fields.push(("tt", FieldValue::Enum(self.transmission_type.as_str())));
        }
        if !self.id.is_empty() {
            fields.push(("id", FieldValue::Text(&self.id)));
        }
        if !self.file_id.is_empty() {
            fields.push(("fid", FieldValue::Text(&self.file_id)));
        }
        if !self.bypass.is_empty() {
            fields.push(("pw", FieldValue::Text(&self.bypass)));
        }
        if self.quiet != 0 {
            fields.push(("q", FieldValue::Int(self.quiet as i128)));
        }
        if let Some(mtime) = self.mtime {
            fields.push(("mod", FieldValue::Int(mtime as i128)));
        }
        if let Some(permissions) = self.permissions {
            fields.push(("prm", FieldValue::Int(permissions as i128)));
        }
        if let Some(size) = self.size {
            fields.push(("sz", FieldValue::Int(size as i128)));
        }
        if !self.name.is_empty() {
            fields.push(("n", FieldValue::Base64Text(&self.name)));
        }
        if !self.status.is_empty() {
            fields.push(("st", FieldValue::Text(&self.status)));
        }
        if !self.relative_path.is_empty() {
            fields.push(("rp", FieldValue::Base64Text(&self.relative_path)));
        }
        if !self.data.is_empty() {
            fields.push(("d", FieldValue::Bytes(&self.data)));
        }
        fields
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.fields() {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(key);
            out.push('=');
            match value {
                FieldValue::Enum(s) => out.push_str(s),
                FieldValue::Int(n) => out.push_str(&n.to_string()),
                FieldValue::Text(s) => {
                    for c in sanitize(s).chars() {
                        if c == ';' {
                            out.push_str(";;");
                        } else {
                            out.push(c);
                        }
                    }
                }
                FieldValue::Base64Text(s) => out.push_str(&STANDARD_NO_PAD.encode(s.as_bytes())),
                FieldValue::Bytes(b) => out.push_str(&STANDARD_NO_PAD.encode(b)),
            }
        }
        out
    }

    pub fn deserialize(text: &str) -> Result<Self> {
        let mut msg = Message::default();
        let mut saw_action = false;

        for (key, value) in split_pairs(text) {
            match key.as_str() {
                "ac" => {
                    msg.action = parse_enum(&key, &value, Action::from_wire)?;
                    saw_action = true;
                }
                "zip" => msg.compression = parse_enum(&key, &value, Compression::from_wire)?,
                "ft" => msg.file_type = parse_enum(&key, &value, FileType::from_wire)?,
                "tt" => {
                    msg.transmission_type = parse_enum(&key, &value, TransmissionType::from_wire)?
                }
                "id" => msg.id = sanitize(&value),
                "fid" => msg.file_id = sanitize(&value),
                "pw" => msg.bypass = sanitize(&value),
                "q" => msg.quiet = parse_int(&key, &value)?,
                "mod" => msg.mtime = Some(parse_int(&key, &value)?),
                "prm" => msg.permissions = Some(parse_int(&key, &value)?),
                "sz" => msg.size = Some(parse_int(&key, &value)?),
                "n" => msg.name = parse_base64_text(&key, &value)?,
                "st" => msg.status = sanitize(&value),
                "rp" => msg.relative_path = parse_base64_text(&key, &value)?,
                "d" => msg.data = Bytes::from(parse_base64(&key, &value)?),
                _ => {
                    // Unknown keys come from newer peers
                }
            }
        }

        if !saw_action || msg.action == Action::Invalid {
            return Err(TransferError::protocol(format!(
                "Message has no valid action: {}",
                truncate_for_log(text)
            )));
        }
        Ok(msg)
    }
}

/// Split on unescaped `;`, turning `;;` back into `;`.
fn split_pairs(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == ';' {
            if chars.peek() == Some(&';') {
                chars.next();
                current.push(';');
            } else {
                push_pair(&mut pairs, std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    push_pair(&mut pairs, current);
    pairs
}

fn push_pair(pairs: &mut Vec<(String, String)>, item: String) {
    if item.is_empty() {
        return;
    }
    match item.split_once('=') {
        Some((k, v)) => pairs.push((k.to_string(), v.to_string())),
        None => pairs.push((item, String::new())),
    }
}

fn parse_enum<T>(key: &str, value: &str, f: fn(&str) -> Option<T>) -> Result<T> {
    f(value).ok_or_else(|| TransferError::protocol(format!("Unknown value for {}: {}", key, value)))
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| TransferError::protocol(format!("Invalid integer for {}: {}", key, value)))
}

fn parse_base64(key: &str, value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(value))
        .map_err(|e| TransferError::protocol(format!("Invalid base64 for {}: {}", key, e)))
}

fn parse_base64_text(key: &str, value: &str) -> Result<String> {
    let raw = parse_base64(key, value)?;
    String::from_utf8(raw)
        .map_err(|_| TransferError::protocol(format!("Invalid UTF-8 in {}", key)))
}

/// Strip control characters so free text can never inject escape codes.
pub fn sanitize(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

fn truncate_for_log(text: &str) -> String {
    text.chars().take(64).collect()
}

// =============================================================================
// Identifiers
// =============================================================================

/// Per-session transfer id: hex(pid) followed by four random hex digits.
pub fn new_transfer_id() -> String {
    format!("{:x}{:04x}", std::process::id(), rand::random::<u16>())
}

/// Token that lets a transfer skip the permission prompt.
pub fn bypass_token(transfer_id: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(transfer_id.as_bytes());
    hasher.update(b";");
    hasher.update(password.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

// =============================================================================
// Tests
// =============================================================================
