//! Per-file zlib streams and the heuristic deciding when to use them.

use crate::error::{Result, TransferError};
use crate::transfer::protocol::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use std::io::Write;
use std::path::Path;

/// Extensions of formats that are already compressed or are media containers.
const INCOMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "7z", "apk", "avi", "br", "bz2", "cab", "deb", "docx", "epub", "flac", "gif", "gz", "heic",
    "jar", "jpeg", "jpg", "lz", "lz4", "lzma", "m4a", "m4v", "mkv", "mov", "mp3", "mp4", "mpeg",
    "mpg", "odt", "ogg", "opus", "png", "pptx", "rar", "rpm", "tbz", "tgz", "txz", "webm",
    "webp", "whl", "xlsx", "xz", "zip", "zst",
];

/// Whether the file name suggests content worth compressing.
pub fn looks_compressible(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            !INCOMPRESSIBLE_EXTENSIONS.contains(&ext.as_str())
        }
        None => true,
    }
}

/// Streaming compressor for one file.
pub struct Compressor {
    encoder: Option<ZlibEncoder<Vec<u8>>>,
}

impl Compressor {
    pub fn new() -> Self {
        Self {
            encoder: Some(ZlibEncoder::new(Vec::new(), flate2::Compression::default())),
        }
    }

    /// Compress a chunk. May return an empty buffer while zlib accumulates.
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| TransferError::protocol("Compressor already finished"))?;
        encoder.write_all(data)?;
        Ok(std::mem::take(encoder.get_mut()))
    }

    /// Compress the last chunk and flush the zlib trailer.
    pub fn finish(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| TransferError::protocol("Compressor already finished"))?;
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming decompressor matching the negotiated compression of a file.
pub enum Decompressor {
    Identity,
    Zlib(Option<ZlibDecoder<Vec<u8>>>),
}

impl Decompressor {
    pub fn new(compression: Compression) -> Self {
        match compression {
            Compression::None => Decompressor::Identity,
            Compression::Zlib => Decompressor::Zlib(Some(ZlibDecoder::new(Vec::new()))),
        }
    }

    pub fn decompress(&mut self, data: &[u8], is_last: bool) -> Result<Vec<u8>> {
        match self {
            Decompressor::Identity => Ok(data.to_vec()),
            Decompressor::Zlib(slot) => {
                let decoder = slot
                    .as_mut()
                    .ok_or_else(|| TransferError::protocol("Data after end of compressed stream"))?;
                decoder
                    .write_all(data)
                    .map_err(|e| TransferError::protocol(format!("Corrupt zlib data: {}", e)))?;
                if is_last {
                    let decoder = slot.take().ok_or_else(|| {
                        TransferError::protocol("Data after end of compressed stream")
                    })?;
                    decoder
                        .finish()
                        .map_err(|e| TransferError::protocol(format!("Corrupt zlib data: {}", e)))
                } else {
                    Ok(std::mem::take(decoder.get_mut()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress_in_chunks() {
        let text = "the quick brown fox jumps over the lazy dog\n".repeat(2000);
        let mut compressor = Compressor::new();
        let mut wire = Vec::new();
        for chunk in text.as_bytes().chunks(1000) {
            wire.push(compressor.compress(chunk).unwrap());
        }
        wire.push(compressor.finish(b"").unwrap());
        let total: usize = wire.iter().map(|c| c.len()).sum();
        assert!(total < text.len() / 10);

        let mut decompressor = Decompressor::new(Compression::Zlib);
        let mut out = Vec::new();
        let last = wire.len() - 1;
        for (i, chunk) in wire.iter().enumerate() {
            out.extend(decompressor.decompress(chunk, i == last).unwrap());
        }
        assert_eq!(out, text.as_bytes());
        assert!(decompressor.decompress(b"x", false).is_err());
    }

    #[test]
    fn test_corrupt_stream_rejected() {
        let mut decompressor = Decompressor::new(Compression::Zlib);
        assert!(decompressor.decompress(b"definitely not zlib", true).is_err());
    }

    #[test]
    fn test_looks_compressible() {
        assert!(looks_compressible(Path::new("notes.txt")));
        assert!(looks_compressible(Path::new("Makefile")));
        assert!(!looks_compressible(Path::new("photo.JPG")));
        assert!(!looks_compressible(Path::new("backup.tar.gz")));
    }
}
