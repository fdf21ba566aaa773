//! Cross-API GPU memory interop
//!
//! One API (the primary, D3D12 on Windows) allocates a device-local buffer
//! and exports it as an OS handle; another (the secondary, Vulkan) imports
//! it and fills it. Three transfer strategies move file data into the
//! shared buffer:
//!
//! - single staged copy through a host-visible staging buffer
//! - reused staged copy with a prerecorded command buffer
//! - DMA-engine queue reading files straight into GPU memory
//!
//! Everything is generic over the [`backend`] traits. The [`loopback`]
//! backend runs the full flow in-process; `vulkan` and `d3d12` features
//! enable the native backends.

pub mod backend;
pub mod binding;
pub mod diagnostics;
pub mod error;
pub mod import;
pub mod loopback;
pub mod memory;
pub mod resolver;
pub mod session;
pub mod transfer;

#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(all(windows, feature = "d3d12"))]
pub mod d3d12;

pub use binding::{AdapterBinding, ImportLease};
pub use diagnostics::{DiagnosticPump, DiagnosticRecord, DiagnosticSink, Severity};
pub use error::{InteropError, InteropResult};
pub use import::{ImportedBuffer, MemoryImporter};
pub use resolver::{plan_queues, resolve_queues, QueuePlan, ResolvedQueues};
pub use session::{InteropSession, SessionConfig};
pub use transfer::{StrategyKind, TransferReport};
