//! Loopback DMA queue: a worker thread executing file reads into the shared
//! allocation, with a condition-variable fence.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::debug;

use super::{lock, write, SharedBytes, E_FILE_NOT_FOUND, E_HANDLE_EOF, E_INVALIDARG};
use crate::backend::{DmaErrorRecord, DmaQueue};
use crate::error::{InteropError, InteropResult};

/// A file opened through the loopback DMA queue.
#[derive(Debug, Clone)]
pub struct LoopbackFile {
    path: PathBuf,
    file: Arc<File>,
}

enum Request {
    Read {
        file: LoopbackFile,
        len: u64,
        dest_offset: u64,
    },
    Signal(u64),
}

#[derive(Debug, Default)]
struct FenceState {
    completed: u64,
    /// Set once the worker has exited; no further signals will arrive.
    stopped: bool,
}

#[derive(Debug, Default)]
struct Fence {
    state: Mutex<FenceState>,
    signalled: Condvar,
}

impl Fence {
    fn signal(&self, value: u64) {
        let mut state = lock(&self.state);
        state.completed = state.completed.max(value);
        self.signalled.notify_all();
    }

    fn stop(&self) {
        lock(&self.state).stopped = true;
        self.signalled.notify_all();
    }

    /// Block until `value` completes. False if the worker exited first.
    fn wait(&self, value: u64) -> bool {
        let mut state = lock(&self.state);
        while state.completed < value {
            if state.stopped {
                return false;
            }
            state = self
                .signalled
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        true
    }
}

/// Stops the fence when the worker returns or unwinds.
struct WorkerExit(Arc<Fence>);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.0.stop();
    }
}

pub struct LoopbackDmaQueue {
    capacity: usize,
    pending: Vec<Request>,
    tx: Option<Sender<Vec<Request>>>,
    fence: Arc<Fence>,
    errors: Arc<Mutex<Option<DmaErrorRecord>>>,
    worker: Option<JoinHandle<()>>,
}

impl LoopbackDmaQueue {
    pub(crate) fn spawn(dest: SharedBytes, capacity: u16) -> InteropResult<Self> {
        let (tx, rx) = channel::<Vec<Request>>();
        let fence = Arc::new(Fence::default());
        let errors = Arc::new(Mutex::new(None));

        let worker = {
            let fence = fence.clone();
            let errors = errors.clone();
            std::thread::Builder::new()
                .name("loopback-dma".into())
                .spawn(move || {
                    let _exit = WorkerExit(fence.clone());
                    for batch in rx {
                        for request in batch {
                            match request {
                                Request::Read {
                                    file,
                                    len,
                                    dest_offset,
                                } => {
                                    if let Err(code) = execute_read(&dest, &file, len, dest_offset) {
                                        debug!("DMA read of {} failed: {:#010x}", file.path.display(), code);
                                        let mut record = lock(&errors);
                                        let record = record.get_or_insert(DmaErrorRecord {
                                            failure_count: 0,
                                            first_failure_code: code,
                                        });
                                        record.failure_count += 1;
                                    }
                                }
                                Request::Signal(value) => fence.signal(value),
                            }
                        }
                    }
                })
                .map_err(|e| InteropError::Backend(format!("failed to start DMA worker: {}", e)))?
        };

        Ok(Self {
            capacity: usize::from(capacity),
            pending: Vec::new(),
            tx: Some(tx),
            fence,
            errors,
            worker: Some(worker),
        })
    }

    fn push(&mut self, request: Request) -> InteropResult<()> {
        if self.pending.len() >= self.capacity {
            self.submit()?;
        }
        self.pending.push(request);
        Ok(())
    }
}

fn execute_read(dest: &SharedBytes, file: &LoopbackFile, len: u64, dest_offset: u64) -> Result<(), i32> {
    let mut dest = write(dest);
    let end = dest_offset.checked_add(len).ok_or(E_INVALIDARG)?;
    if end > dest.len() as u64 {
        return Err(E_INVALIDARG);
    }
    let window = &mut dest[dest_offset as usize..end as usize];

    let mut reader = &*file.file;
    reader.seek(SeekFrom::Start(0)).map_err(|_| E_INVALIDARG)?;
    let mut filled = 0;
    while filled < window.len() {
        match reader.read(&mut window[filled..]) {
            Ok(0) => return Err(E_HANDLE_EOF),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.raw_os_error().unwrap_or(E_INVALIDARG)),
        }
    }
    Ok(())
}

impl DmaQueue for LoopbackDmaQueue {
    type File = LoopbackFile;

    fn open_file(&mut self, path: &Path) -> InteropResult<LoopbackFile> {
        let file = File::open(path).map_err(|_| InteropError::native("IDStorageFactory::OpenFile", E_FILE_NOT_FOUND))?;
        Ok(LoopbackFile {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    fn enqueue_file_to_buffer(
        &mut self,
        file: &LoopbackFile,
        len: u64,
        dest_offset: u64,
    ) -> InteropResult<()> {
        self.push(Request::Read {
            file: file.clone(),
            len,
            dest_offset,
        })
    }

    fn enqueue_signal(&mut self, value: u64) -> InteropResult<()> {
        self.push(Request::Signal(value))
    }

    fn submit(&mut self) -> InteropResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.tx
            .as_ref()
            .ok_or_else(|| InteropError::Backend("DMA queue closed".into()))?
            .send(batch)
            .map_err(|_| InteropError::Backend("DMA worker stopped".into()))
    }

    fn wait_for_fence(&mut self, value: u64) -> InteropResult<()> {
        if self.fence.wait(value) {
            Ok(())
        } else {
            Err(InteropError::Backend(format!(
                "DMA worker stopped before fence value {}",
                value
            )))
        }
    }

    fn take_error_record(&mut self) -> InteropResult<Option<DmaErrorRecord>> {
        Ok(lock(&self.errors).take())
    }

    fn close_file(&mut self, file: LoopbackFile) {
        drop(file);
    }
}

impl Drop for LoopbackDmaQueue {
    fn drop(&mut self) {
        // closing the channel ends the worker once queued batches are done
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::RwLock;

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn test_reads_land_in_destination() {
        let dest: SharedBytes = Arc::new(RwLock::new(vec![0u8; 6]));
        let mut queue = LoopbackDmaQueue::spawn(dest.clone(), 4).unwrap();
        let source = temp_file(b"abcdef");

        let file = queue.open_file(source.path()).unwrap();
        queue.enqueue_file_to_buffer(&file, 6, 0).unwrap();
        queue.enqueue_signal(1).unwrap();
        queue.submit().unwrap();
        queue.wait_for_fence(1).unwrap();
        queue.close_file(file);

        assert_eq!(&*dest.read().unwrap(), b"abcdef");
        assert!(queue.take_error_record().unwrap().is_none());
    }

    #[test]
    fn test_short_file_and_overflow_are_recorded() {
        let dest: SharedBytes = Arc::new(RwLock::new(vec![0u8; 8]));
        let mut queue = LoopbackDmaQueue::spawn(dest, 4).unwrap();
        let short = temp_file(b"abc");

        let file = queue.open_file(short.path()).unwrap();
        queue.enqueue_file_to_buffer(&file, 8, 0).unwrap();
        queue.enqueue_file_to_buffer(&file, 3, 6).unwrap();
        queue.enqueue_signal(1).unwrap();
        queue.submit().unwrap();
        queue.wait_for_fence(1).unwrap();

        let record = queue.take_error_record().unwrap().unwrap();
        assert_eq!(record.failure_count, 2);
        assert_eq!(record.first_failure_code, E_HANDLE_EOF);
        assert!(queue.take_error_record().unwrap().is_none());
    }

    #[test]
    fn test_full_queue_submits_automatically() {
        let dest: SharedBytes = Arc::new(RwLock::new(vec![0u8; 2]));
        let mut queue = LoopbackDmaQueue::spawn(dest, 1).unwrap();
        queue.enqueue_signal(1).unwrap();
        queue.enqueue_signal(2).unwrap();
        assert_eq!(queue.pending.len(), 1);
        queue.wait_for_fence(1).unwrap();
    }

    #[test]
    fn test_wait_fails_once_worker_exits() {
        let dest: SharedBytes = Arc::new(RwLock::new(vec![0u8; 2]));
        let mut queue = LoopbackDmaQueue::spawn(dest, 4).unwrap();
        queue.enqueue_signal(1).unwrap();
        queue.submit().unwrap();
        queue.wait_for_fence(1).unwrap();

        // closing the channel ends the worker; value 2 can never arrive
        queue.tx = None;
        let err = queue.wait_for_fence(2).unwrap_err();
        assert!(matches!(err, InteropError::Backend(_)), "{}", err);
        // values already reached still succeed
        queue.wait_for_fence(1).unwrap();
    }

    #[test]
    fn test_missing_file_fails_to_open() {
        let dest: SharedBytes = Arc::new(RwLock::new(vec![0u8; 2]));
        let mut queue = LoopbackDmaQueue::spawn(dest, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = queue.open_file(&dir.path().join("absent.bin")).unwrap_err();
        assert!(matches!(err, InteropError::Native { code, .. } if code == E_FILE_NOT_FOUND));
    }
}
