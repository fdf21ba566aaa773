//! DMA-engine transfers: file to GPU memory with no host staging

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::backend::DmaQueue;
use crate::error::{InteropError, InteropResult};

/// Strictly increasing fence targets. A value is handed out once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FenceTimeline {
    last: u64,
}

impl FenceTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start after `value`, e.g. a fence's current completed value.
    pub fn starting_after(value: u64) -> Self {
        Self { last: value }
    }

    pub fn next(&mut self) -> InteropResult<u64> {
        self.last = self
            .last
            .checked_add(1)
            .ok_or_else(|| InteropError::Backend("fence timeline exhausted".into()))?;
        Ok(self.last)
    }

    /// The most recently issued value.
    pub fn last(&self) -> u64 {
        self.last
    }
}

/// A DMA queue writing `len`-byte units at offset 0 of its destination.
pub struct DmaTransfer<Q: DmaQueue> {
    queue: Q,
    fence: FenceTimeline,
    len: u64,
}

impl<Q: DmaQueue> DmaTransfer<Q> {
    pub fn new(queue: Q, len: u64) -> Self {
        Self {
            queue,
            fence: FenceTimeline::new(),
            len,
        }
    }

    pub fn fence(&self) -> &FenceTimeline {
        &self.fence
    }

    /// Transfer one file and wait for it. The queue's error record is
    /// checked after the fence wait; any failure fails this file.
    pub fn transfer_file(&mut self, source: &Path) -> InteropResult<()> {
        let file = self.queue.open_file(source)?;
        let result = self.enqueue_and_wait(&file);
        self.queue.close_file(file);
        result?;

        if let Some(record) = self.queue.take_error_record()? {
            if record.failure_count > 0 {
                return Err(InteropError::DmaQueue {
                    path: source.to_path_buf(),
                    failures: record.failure_count,
                    code: record.first_failure_code,
                });
            }
        }
        Ok(())
    }

    fn enqueue_and_wait(&mut self, file: &Q::File) -> InteropResult<()> {
        let value = self.fence.next()?;
        self.queue.enqueue_file_to_buffer(file, self.len, 0)?;
        self.queue.enqueue_signal(value)?;
        self.queue.submit()?;
        self.queue.wait_for_fence(value)
    }

    /// Transfer every file in order, aborting at the first failure.
    pub fn run(&mut self, sources: &[PathBuf]) -> InteropResult<usize> {
        for (i, source) in sources.iter().enumerate() {
            self.transfer_file(source)?;
            debug!("Unit {}: {} (fence {})", i, source.display(), self.fence.last());
        }
        Ok(sources.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DmaErrorRecord;

    #[test]
    fn test_fence_values_strictly_increase() {
        let mut timeline = FenceTimeline::new();
        let values: Vec<u64> = (0..5).map(|_| timeline.next().unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(timeline.last(), 5);

        let mut resumed = FenceTimeline::starting_after(41);
        assert_eq!(resumed.next().unwrap(), 42);
    }

    #[test]
    fn test_fence_timeline_exhaustion() {
        let mut timeline = FenceTimeline::starting_after(u64::MAX);
        assert!(timeline.next().is_err());
    }

    /// Records calls instead of touching hardware.
    #[derive(Default)]
    struct ScriptedQueue {
        calls: Vec<String>,
        error: Option<DmaErrorRecord>,
        open_files: usize,
    }

    impl DmaQueue for ScriptedQueue {
        type File = PathBuf;

        fn open_file(&mut self, path: &Path) -> InteropResult<PathBuf> {
            self.open_files += 1;
            self.calls.push(format!("open {}", path.display()));
            Ok(path.to_path_buf())
        }

        fn enqueue_file_to_buffer(&mut self, _: &PathBuf, len: u64, offset: u64) -> InteropResult<()> {
            self.calls.push(format!("read {}@{}", len, offset));
            Ok(())
        }

        fn enqueue_signal(&mut self, value: u64) -> InteropResult<()> {
            self.calls.push(format!("signal {}", value));
            Ok(())
        }

        fn submit(&mut self) -> InteropResult<()> {
            self.calls.push("submit".into());
            Ok(())
        }

        fn wait_for_fence(&mut self, value: u64) -> InteropResult<()> {
            self.calls.push(format!("wait {}", value));
            Ok(())
        }

        fn take_error_record(&mut self) -> InteropResult<Option<DmaErrorRecord>> {
            Ok(self.error.take())
        }

        fn close_file(&mut self, _: PathBuf) {
            self.open_files -= 1;
            self.calls.push("close".into());
        }
    }

    #[test]
    fn test_request_sequence_per_file() {
        let mut transfer = DmaTransfer::new(ScriptedQueue::default(), 64);
        let files = vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")];
        assert_eq!(transfer.run(&files).unwrap(), 2);
        assert_eq!(
            transfer.queue.calls,
            vec![
                "open a.bin", "read 64@0", "signal 1", "submit", "wait 1", "close",
                "open b.bin", "read 64@0", "signal 2", "submit", "wait 2", "close",
            ]
        );
        assert_eq!(transfer.queue.open_files, 0);
    }

    #[test]
    fn test_error_record_aborts_remaining_files() {
        let queue = ScriptedQueue {
            error: Some(DmaErrorRecord {
                failure_count: 1,
                first_failure_code: 0x8007_0026u32 as i32,
            }),
            ..Default::default()
        };
        let mut transfer = DmaTransfer::new(queue, 64);
        let files = vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")];

        let err = transfer.run(&files).unwrap_err();
        match err {
            InteropError::DmaQueue { path, failures, code } => {
                assert_eq!(path, PathBuf::from("a.bin"));
                assert_eq!(failures, 1);
                assert_eq!(code as u32, 0x8007_0026);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!transfer.queue.calls.iter().any(|c| c == "open b.bin"));
        assert_eq!(transfer.queue.open_files, 0);
    }

    #[test]
    fn test_empty_error_record_is_success() {
        let queue = ScriptedQueue {
            error: Some(DmaErrorRecord {
                failure_count: 0,
                first_failure_code: 0,
            }),
            ..Default::default()
        };
        let mut transfer = DmaTransfer::new(queue, 8);
        transfer.transfer_file(Path::new("ok.bin")).unwrap();
    }
}
