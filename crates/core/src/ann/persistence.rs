//! Disk persistence for ANN indexes using bincode serialization.
//!
//! Blobs are written as `[bincode payload][magic 4 bytes][CRC32 BE]`. Writes
//! use temp-file + rename so a crash never leaves a half-written index at the
//! target path. Each backend has its own magic, so loading a blob with the
//! wrong backend fails instead of misinterpreting the bytes.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Serialize `value` and atomically write it to `path`.
pub fn write_blob<T: Serialize>(path: &Path, magic: &[u8; 4], value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| Error::CorruptIndex(e.to_string()))?;
    let crc = crc32fast::hash(&bytes);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut output = Vec::with_capacity(bytes.len() + 8);
    output.extend_from_slice(&bytes);
    output.extend_from_slice(magic);
    output.extend_from_slice(&crc.to_be_bytes());

    let tmp_path = temp_path(path);
    fs::write(&tmp_path, &output)?;
    fs::rename(&tmp_path, path)?;

    tracing::info!(
        "Saved index {:?} ({} bytes, CRC32={:#010x})",
        path,
        bytes.len(),
        crc
    );
    Ok(())
}

/// Read a blob written by [`write_blob`], verifying magic and CRC32.
pub fn read_blob<T: DeserializeOwned>(path: &Path, magic: &[u8; 4]) -> Result<T> {
    let raw = fs::read(path)?;
    if raw.len() < 8 {
        return Err(Error::CorruptIndex(format!(
            "{:?} is too short ({} bytes)",
            path,
            raw.len()
        )));
    }

    let (payload, footer) = raw.split_at(raw.len() - 8);
    if &footer[..4] != magic {
        return Err(Error::CorruptIndex(format!(
            "{:?} has magic {:?}, expected {:?}",
            path,
            &footer[..4],
            magic
        )));
    }
    let stored_crc = u32::from_be_bytes([footer[4], footer[5], footer[6], footer[7]]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(Error::CorruptIndex(format!(
            "CRC32 mismatch: expected {:#010x}, got {:#010x} in {:?}",
            stored_crc, computed_crc, path
        )));
    }
    tracing::debug!("Index CRC32 verified: {:#010x}", stored_crc);

    bincode::deserialize(payload).map_err(|e| Error::CorruptIndex(e.to_string()))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
