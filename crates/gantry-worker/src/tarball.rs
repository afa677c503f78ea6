//! Artifact archive packing: POSIX ustar with optional gzip or zstd
//! framing.
//!
//! Volumes are modeled as flat maps of relative path to file bytes.
//! `unpack` enforces the wire rules: entry paths must be relative and
//! must not contain `..` segments.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

/// Zstd level for artifact framing; transfers favor speed over ratio.
const ZSTD_COMPRESSION_LEVEL: i32 = 3;

/// Framing applied around the tar byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Raw,
    Gzip,
    Zstd,
}

impl Encoding {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Encoding {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" | "identity" => Ok(Self::Raw),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(WorkerError::Stream(format!("unknown encoding '{other}'"))),
        }
    }
}

/// Reject absolute paths, `..` segments, and empty paths.
///
/// # Errors
///
/// Returns [`WorkerError::UnsafeArchivePath`] when the path could
/// escape the destination directory.
pub fn validate_entry_path(path: &str) -> Result<(), WorkerError> {
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
        return Err(WorkerError::UnsafeArchivePath(path.to_string()));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(WorkerError::UnsafeArchivePath(path.to_string()));
    }
    Ok(())
}

/// Build a ustar archive from a file map.
///
/// # Errors
///
/// Returns [`WorkerError::Io`] if archive construction fails.
pub fn pack(entries: &BTreeMap<String, Bytes>) -> Result<Vec<u8>, WorkerError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_ref())?;
    }
    Ok(builder.into_inner()?)
}

/// Expand a ustar archive into a file map, enforcing path safety.
///
/// # Errors
///
/// Returns [`WorkerError::UnsafeArchivePath`] for absolute or `..`
/// paths, [`WorkerError::Io`] for a corrupt archive.
pub fn unpack(archive: &[u8]) -> Result<BTreeMap<String, Bytes>, WorkerError> {
    let mut entries = BTreeMap::new();
    let mut reader = tar::Archive::new(Cursor::new(archive));
    for entry in reader.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let path = raw_path.trim_end_matches('/').to_string();
        validate_entry_path(&path)?;
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        entries.insert(path, Bytes::from(content));
    }
    Ok(entries)
}

/// Apply framing to a raw tar stream.
///
/// # Errors
///
/// Returns [`WorkerError::Io`] if compression fails.
pub fn encode(encoding: Encoding, raw: &[u8]) -> Result<Vec<u8>, WorkerError> {
    match encoding {
        Encoding::Raw => Ok(raw.to_vec()),
        Encoding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            encoder.write_all(raw)?;
            Ok(encoder.finish()?)
        }
        Encoding::Zstd => Ok(zstd::bulk::compress(raw, ZSTD_COMPRESSION_LEVEL)?),
    }
}

/// Remove framing from a received stream.
///
/// # Errors
///
/// Returns [`WorkerError::Io`] if the frame is corrupt.
pub fn decode(encoding: Encoding, framed: &[u8]) -> Result<Vec<u8>, WorkerError> {
    match encoding {
        Encoding::Raw => Ok(framed.to_vec()),
        Encoding::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(framed);
            let mut raw = Vec::new();
            decoder.read_to_end(&mut raw)?;
            Ok(raw)
        }
        Encoding::Zstd => Ok(zstd::decode_all(Cursor::new(framed))?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> BTreeMap<String, Bytes> {
        let mut entries = BTreeMap::new();
        entries.insert("metadata.json".to_string(), Bytes::from_static(b"{}"));
        entries.insert(
            "rootfs/bin/sh".to_string(),
            Bytes::from_static(b"#!/bin/sh"),
        );
        entries
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let entries = sample_entries();
        let archive = pack(&entries).unwrap();
        let back = unpack(&archive).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn framed_roundtrip_gzip_and_zstd() {
        let entries = sample_entries();
        let archive = pack(&entries).unwrap();

        for encoding in [Encoding::Gzip, Encoding::Zstd] {
            let framed = encode(encoding, &archive).unwrap();
            let raw = decode(encoding, &framed).unwrap();
            assert_eq!(raw, archive, "{encoding} frame corrupted the stream");
        }
    }

    #[test]
    fn unpack_rejects_absolute_paths() {
        // Hand-craft an absolute entry; tar builders refuse to write one.
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "tmp/evil", &b"x"[..])
            .unwrap();
        let mut archive = builder.into_inner().unwrap();
        // Rewrite the stored path in place to be absolute.
        archive[0..9].copy_from_slice(b"/tmp/evil");
        fix_checksum(&mut archive);

        let err = unpack(&archive).unwrap_err();
        assert!(matches!(err, WorkerError::UnsafeArchivePath(_)), "{err}");
    }

    fn fix_checksum(archive: &mut [u8]) {
        let mut header = tar::Header::new_old();
        header.as_mut_bytes().copy_from_slice(&archive[..512]);
        header.set_cksum();
        archive[..512].copy_from_slice(header.as_bytes());
    }

    #[test]
    fn unpack_rejects_parent_traversal() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "a/../../evil", &b"x"[..])
            .unwrap();
        let archive = builder.into_inner().unwrap();

        let err = unpack(&archive).unwrap_err();
        assert!(matches!(err, WorkerError::UnsafeArchivePath(_)), "{err}");
    }

    #[test]
    fn validate_entry_path_rules() {
        assert!(validate_entry_path("a/b/c").is_ok());
        assert!(validate_entry_path("/abs").is_err());
        assert!(validate_entry_path("a/../b").is_err());
        assert!(validate_entry_path("..").is_err());
        assert!(validate_entry_path("").is_err());
    }

    #[test]
    fn encoding_parses_from_config_strings() {
        assert_eq!("gzip".parse::<Encoding>().unwrap(), Encoding::Gzip);
        assert_eq!("identity".parse::<Encoding>().unwrap(), Encoding::Raw);
        assert!("brotli".parse::<Encoding>().is_err());
    }
}
