//! GGUF file validation
//!
//! Cheap header checks run before handing a path to llama.cpp, which reports
//! bad files far less clearly.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use thiserror::Error;

/// Magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Oldest GGUF version llama.cpp still reads
const MIN_GGUF_VERSION: u32 = 2;

/// Errors raised while validating a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Not a GGUF file (bad magic)")]
    InvalidMagic,

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("Truncated GGUF header")]
    Truncated,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Header fields read from a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Validates the GGUF header of `path`
pub fn validate_gguf(path: &Path) -> Result<GgufMetadata, ModelError> {
    if !path.is_file() {
        return Err(ModelError::NotFound(path.display().to_string()));
    }

    let mut file = File::open(path)?;
    let mut header = [0u8; 24];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled < 4 || header[..4] != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic);
    }
    if filled < header.len() {
        return Err(ModelError::Truncated);
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version < MIN_GGUF_VERSION {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut tensor_count = [0u8; 8];
    tensor_count.copy_from_slice(&header[8..16]);
    let mut kv_count = [0u8; 8];
    kv_count.copy_from_slice(&header[16..24]);

    Ok(GgufMetadata {
        version,
        tensor_count: u64::from_le_bytes(tensor_count),
        metadata_kv_count: u64::from_le_bytes(kv_count),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn header(version: u32, tensors: u64, kvs: u64) -> Vec<u8> {
        let mut bytes = GGUF_MAGIC.to_vec();
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&tensors.to_le_bytes());
        bytes.extend_from_slice(&kvs.to_le_bytes());
        bytes
    }

    #[test]
    fn test_valid_header() {
        let file = write_file(&header(3, 291, 24));
        let meta = validate_gguf(file.path()).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.tensor_count, 291);
        assert_eq!(meta.metadata_kv_count, 24);
    }

    #[test]
    fn test_missing_file() {
        let err = validate_gguf(Path::new("/definitely/not/here.gguf")).unwrap_err();
        assert!(matches!(err, ModelError::NotFound(_)));
    }

    #[test]
    fn test_bad_magic() {
        let file = write_file(b"GGML\x03\x00\x00\x00");
        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::InvalidMagic)
        ));
    }

    #[test]
    fn test_truncated_and_old_versions() {
        let file = write_file(&header(3, 1, 1)[..10]);
        assert!(matches!(validate_gguf(file.path()), Err(ModelError::Truncated)));

        let file = write_file(&header(1, 1, 1));
        assert!(matches!(
            validate_gguf(file.path()),
            Err(ModelError::UnsupportedVersion(1))
        ));
    }
}
