//! Transfer strategies
//!
//! Three ways of moving one unit per source file into the imported buffer:
//!
//! - [`StrategyKind::SingleStaged`]: one host-visible staging buffer and a
//!   one-shot copy on the secondary API's transfer queue.
//! - [`StrategyKind::ReusedStaged`]: staging buffer and copy recorded once,
//!   then refilled and resubmitted per file.
//! - [`StrategyKind::DmaQueue`]: the primary API's DMA-engine queue reads
//!   each file straight into the shared allocation, fenced per file.

pub mod dma;
pub mod staged;

use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use conduit_shared::{PayloadError, QueueFamilyBinding};

use crate::backend::{BufferUsage, SecondaryDevice};
use crate::error::{InteropError, InteropResult};

pub use dma::{DmaTransfer, FenceTimeline};
pub use staged::{single_staged_copy, ReusedStagedCopy, StagingBuffer, TransferCommands};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SingleStaged,
    ReusedStaged,
    DmaQueue,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [Self::SingleStaged, Self::ReusedStaged, Self::DmaQueue];

    /// Short name accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::SingleStaged => "single",
            Self::ReusedStaged => "reused",
            Self::DmaQueue => "dma",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SingleStaged => "single staged copy",
            Self::ReusedStaged => "reused staged copy",
            Self::DmaQueue => "DMA queue",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "a" => Ok(Self::SingleStaged),
            "reused" | "b" => Ok(Self::ReusedStaged),
            "dma" | "c" => Ok(Self::DmaQueue),
            other => Err(format!(
                "unknown strategy '{}' (expected single, reused or dma)",
                other
            )),
        }
    }
}

/// Outcome of one pass of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferReport {
    pub strategy: StrategyKind,
    pub units: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Fill `dst` with the first `dst.len()` bytes of the file at `path`.
///
/// Short reads are retried until `dst` is full; a file that ends early is
/// an error, never a partial unit.
pub fn fill_from_file(path: &Path, dst: &mut [u8]) -> InteropResult<()> {
    if dst.is_empty() {
        return Err(PayloadError::ZeroLength.into());
    }
    let mut file = File::open(path).map_err(|e| InteropError::io(path, e))?;
    let mut filled = 0;
    while filled < dst.len() {
        match file.read(&mut dst[filled..]) {
            Ok(0) => {
                return Err(InteropError::ShortSource {
                    path: path.to_path_buf(),
                    read: filled as u64,
                    expected: dst.len() as u64,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(InteropError::io(path, e)),
        }
    }
    Ok(())
}

/// Copy the first `len` bytes of `source` into a host-visible staging
/// buffer on `queue` and return them.
pub fn read_back<D: SecondaryDevice>(
    device: &D,
    queue: &QueueFamilyBinding<D::Queue>,
    source: D::Buffer,
    len: u64,
) -> InteropResult<Vec<u8>> {
    let staging = StagingBuffer::new(device, len, BufferUsage::TRANSFER_DST)?;
    let commands = TransferCommands::new(device, queue.family_index, true)?;
    commands.record_copy(source, staging.buffer(), len, true)?;
    commands.submit_and_wait(queue.queue)?;

    let mut bytes = vec![0u8; len as usize];
    staging.map(&mut |mapped| {
        bytes.copy_from_slice(mapped);
        Ok(())
    })?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fill_reads_whole_unit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();

        let mut dst = vec![0u8; data.len()];
        fill_from_file(file.path(), &mut dst).unwrap();
        assert_eq!(dst, data);
    }

    #[test]
    fn test_fill_takes_prefix_of_longer_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut dst = [0u8; 4];
        fill_from_file(file.path(), &mut dst).unwrap();
        assert_eq!(&dst, b"0123");
    }

    #[test]
    fn test_fill_rejects_short_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let mut dst = [0u8; 8];
        let err = fill_from_file(file.path(), &mut dst).unwrap_err();
        assert!(matches!(
            err,
            InteropError::ShortSource {
                read: 3,
                expected: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_fill_rejects_empty_unit_and_missing_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = fill_from_file(file.path(), &mut []).unwrap_err();
        assert!(matches!(err, InteropError::Payload(PayloadError::ZeroLength)));

        let dir = tempfile::tempdir().unwrap();
        let err = fill_from_file(&dir.path().join("absent.bin"), &mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, InteropError::Io { .. }));
    }

    #[test]
    fn test_strategy_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.name().parse::<StrategyKind>().unwrap(), kind);
        }
        assert_eq!("C".parse::<StrategyKind>().unwrap(), StrategyKind::DmaQueue);
        assert!("bounce".parse::<StrategyKind>().is_err());
        assert_eq!(
            serde_json::to_string(&StrategyKind::ReusedStaged).unwrap(),
            "\"reused_staged\""
        );
    }
}
