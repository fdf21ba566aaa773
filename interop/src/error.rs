use conduit_shared::{AdapterLuid, PayloadError, QueueCapabilities};
use std::path::PathBuf;
use thiserror::Error;

use crate::backend::{BufferUsage, ExternalHandleKind};

#[derive(Error, Debug)]
pub enum InteropError {
    #[error("No queue requests were supplied")]
    NoQueueRequests,

    #[error("No physical device exposes queue capabilities {requested}")]
    NoSuitableDevice { requested: QueueCapabilities },

    #[error("No queue family on the selected device satisfies request #{index} ({requested})")]
    NoSuitableFamily {
        index: usize,
        requested: QueueCapabilities,
    },

    #[error("Queue request #{index} asks for 0 queues")]
    InvalidQueueCount { index: usize },

    #[error("Queue family {family} exposes {available} queue(s) but {requested} were requested")]
    QueueCountExceeded {
        family: u32,
        requested: u32,
        available: u32,
    },

    #[error("Adapter mismatch: primary API selected {primary}, secondary API selected {}", describe_luid(.secondary))]
    AdapterMismatch {
        primary: AdapterLuid,
        secondary: Option<AdapterLuid>,
    },

    #[error("Importing {kind} handles is not supported for {usage} buffers")]
    ImportUnsupported {
        kind: ExternalHandleKind,
        usage: BufferUsage,
    },

    #[error("Payload units are {unit} bytes but the shared buffer holds {buffer}")]
    UnitLengthMismatch { unit: u64, buffer: u64 },

    #[error("No memory type matches {0}")]
    NoMemoryType(String),

    #[error("{call} failed with status {code:#010x}")]
    Native { call: &'static str, code: i32 },

    #[error("DMA queue reported {failures} failure(s) transferring {path}: status {code:#010x}")]
    DmaQueue {
        path: PathBuf,
        failures: u32,
        code: i32,
    },

    #[error("Source {path} ended after {read} of {expected} bytes")]
    ShortSource {
        path: PathBuf,
        read: u64,
        expected: u64,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Shared allocation torn down with {0} live import(s)")]
    LiveImports(usize),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl InteropError {
    /// Configuration and compatibility errors: raised before any transfer
    /// work, never worth retrying on the same machine.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoQueueRequests
                | Self::NoSuitableDevice { .. }
                | Self::NoSuitableFamily { .. }
                | Self::InvalidQueueCount { .. }
                | Self::QueueCountExceeded { .. }
                | Self::AdapterMismatch { .. }
                | Self::ImportUnsupported { .. }
                | Self::NoMemoryType(_)
                | Self::UnitLengthMismatch { .. }
                | Self::Payload(_)
        )
    }

    pub(crate) fn native(call: &'static str, code: i32) -> Self {
        Self::Native { call, code }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type InteropResult<T> = Result<T, InteropError>;

fn describe_luid(luid: &Option<AdapterLuid>) -> String {
    match luid {
        Some(luid) => luid.to_string(),
        None => "an adapter without a LUID".to_string(),
    }
}
