//! Transfer payload: a fixed unit length and the files that fill it

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Size of one transfer unit produced by the data generator (256 KiB).
pub const DEFAULT_UNIT_LEN: u64 = 256 * 1024;

/// Number of units the data generator writes by default (1 GiB in total).
pub const DEFAULT_FILE_COUNT: usize = 4096;

/// File name of the `index`-th generated data file.
pub fn data_file_name(index: usize) -> String {
    format!("file{}.bin", index)
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Transfer unit length must be greater than 0")]
    ZeroLength,

    #[error("Payload contains no source files")]
    NoFiles,

    #[error("Cannot stat source {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source {path} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

/// Ordered source files, each exactly `unit_len` bytes long.
///
/// Deserialized payloads go through [`TransferPayload::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPayload")]
pub struct TransferPayload {
    unit_len: u64,
    files: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct RawPayload {
    unit_len: u64,
    files: Vec<PathBuf>,
}

impl TryFrom<RawPayload> for TransferPayload {
    type Error = PayloadError;

    fn try_from(raw: RawPayload) -> Result<Self, Self::Error> {
        Self::new(raw.unit_len, raw.files)
    }
}

impl TransferPayload {
    /// Build a payload without touching the filesystem.
    pub fn new(unit_len: u64, files: Vec<PathBuf>) -> Result<Self, PayloadError> {
        if unit_len == 0 {
            return Err(PayloadError::ZeroLength);
        }
        if files.is_empty() {
            return Err(PayloadError::NoFiles);
        }
        Ok(Self { unit_len, files })
    }

    /// Build the `file0.bin .. file{count-1}.bin` sequence under `dir` and
    /// check that every file exists with the expected length.
    pub fn from_directory(dir: &Path, unit_len: u64, count: usize) -> Result<Self, PayloadError> {
        let files = (0..count).map(|i| dir.join(data_file_name(i))).collect();
        let payload = Self::new(unit_len, files)?;
        payload.verify()?;
        Ok(payload)
    }

    /// Check that every source file exists and is exactly one unit long.
    pub fn verify(&self) -> Result<(), PayloadError> {
        for path in &self.files {
            let metadata = std::fs::metadata(path).map_err(|source| PayloadError::Unreadable {
                path: path.clone(),
                source,
            })?;
            if metadata.len() != self.unit_len {
                return Err(PayloadError::LengthMismatch {
                    path: path.clone(),
                    expected: self.unit_len,
                    actual: metadata.len(),
                });
            }
        }
        Ok(())
    }

    pub fn unit_len(&self) -> u64 {
        self.unit_len
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Total bytes moved by one pass over the payload.
    pub fn total_bytes(&self) -> u64 {
        self.unit_len * self.files.len() as u64
    }

    /// The only file a single staged copy moves.
    pub fn first_file(&self) -> Option<&Path> {
        self.files.first().map(PathBuf::as_path)
    }

    /// The file whose content the destination holds after a full pass.
    pub fn last_file(&self) -> Option<&Path> {
        self.files.last().map(PathBuf::as_path)
    }

    /// A payload over the first `count` files only.
    pub fn truncated(&self, count: usize) -> Result<Self, PayloadError> {
        Self::new(self.unit_len, self.files.iter().take(count).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_file_name() {
        assert_eq!(data_file_name(0), "file0.bin");
        assert_eq!(data_file_name(4095), "file4095.bin");
    }

    #[test]
    fn test_rejects_zero_length_and_empty() {
        assert!(matches!(
            TransferPayload::new(0, vec![PathBuf::from("a")]),
            Err(PayloadError::ZeroLength)
        ));
        assert!(matches!(
            TransferPayload::new(16, vec![]),
            Err(PayloadError::NoFiles)
        ));
    }

    #[test]
    fn test_from_directory_checks_lengths() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            std::fs::write(dir.path().join(data_file_name(i)), vec![i as u8; 64]).unwrap();
        }

        let payload = TransferPayload::from_directory(dir.path(), 64, 3).unwrap();
        assert_eq!(payload.file_count(), 3);
        assert_eq!(payload.total_bytes(), 192);
        assert_eq!(payload.last_file().unwrap(), dir.path().join("file2.bin"));

        std::fs::write(dir.path().join(data_file_name(1)), vec![0u8; 10]).unwrap();
        let err = TransferPayload::from_directory(dir.path(), 64, 3).unwrap_err();
        assert!(matches!(err, PayloadError::LengthMismatch { actual: 10, .. }));

        let err = TransferPayload::from_directory(dir.path(), 64, 4).unwrap_err();
        assert!(matches!(err, PayloadError::Unreadable { .. }));
    }

    #[test]
    fn test_deserialize_applies_the_same_checks() {
        let payload: TransferPayload =
            serde_json::from_str(r#"{"unit_len":8,"files":["a","b"]}"#).unwrap();
        assert_eq!(payload.first_file(), Some(Path::new("a")));
        assert_eq!(payload.last_file(), Some(Path::new("b")));

        let err = serde_json::from_str::<TransferPayload>(r#"{"unit_len":8,"files":[]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("no source files"), "{}", err);
        assert!(serde_json::from_str::<TransferPayload>(r#"{"unit_len":0,"files":["a"]}"#).is_err());

        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(serde_json::from_str::<TransferPayload>(&json).unwrap(), payload);
    }

    #[test]
    fn test_truncated() {
        let payload = TransferPayload::new(8, vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let first = payload.truncated(1).unwrap();
        assert_eq!(first.files(), &[PathBuf::from("a")]);
        assert!(payload.truncated(0).is_err());
    }
}
