//! Driver diagnostic message pump
//!
//! Backends push driver messages (D3D12 info-queue entries, loopback
//! events) into a bounded channel; a background task logs them. The channel
//! is a side channel only: nothing on the transfer path ever waits on it or
//! reads from it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default capacity of the diagnostic channel.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Corruption,
    Error,
    Warning,
    Info,
    Message,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Corruption => "CORRUPTION",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
            Self::Message => "MESSAGE",
        })
    }
}

/// One driver message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub severity: Severity,
    pub category: String,
    /// Which API produced the message (e.g. "D3D12").
    pub source: &'static str,
    pub message: String,
}

impl DiagnosticRecord {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        source: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category: category.into(),
            source,
            message: message.into(),
        }
    }
}

/// Producer side of the diagnostic channel. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    tx: Option<mpsc::Sender<DiagnosticRecord>>,
    dropped: Arc<AtomicU64>,
}

impl DiagnosticSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Offer a record to the pump. A full or closed channel drops the record
    /// and bumps the dropped counter.
    pub fn emit(&self, record: DiagnosticRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records lost to a full or closed channel so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Background task logging diagnostic records until stopped.
pub struct DiagnosticPump {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
    dropped: Arc<AtomicU64>,
}

impl DiagnosticPump {
    /// Spawn the pump on the current Tokio runtime. Returns the sink
    /// producers write to and the pump handle used to stop it.
    pub fn spawn(capacity: usize) -> (DiagnosticSink, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let dropped = Arc::new(AtomicU64::new(0));

        let sink = DiagnosticSink {
            tx: Some(tx),
            dropped: dropped.clone(),
        };
        let handle = tokio::spawn(run_pump(rx, cancel.clone()));

        (
            sink,
            Self {
                cancel,
                handle,
                dropped,
            },
        )
    }

    /// Token that stops the pump when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the pump and wait for it. Records already queued are still
    /// logged. Returns the number of records logged.
    pub async fn shutdown(self) -> u64 {
        self.cancel.cancel();
        let logged = self.handle.await.unwrap_or_else(|e| {
            warn!("Diagnostic pump task failed: {}", e);
            0
        });
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("{} diagnostic message(s) dropped (channel full)", dropped);
        }
        logged
    }
}

async fn run_pump(mut rx: mpsc::Receiver<DiagnosticRecord>, cancel: CancellationToken) -> u64 {
    let mut logged = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Ok(record) = rx.try_recv() {
                    log_record(&record);
                    logged += 1;
                }
                break;
            }
            record = rx.recv() => match record {
                Some(record) => {
                    log_record(&record);
                    logged += 1;
                }
                // every sink is gone
                None => break,
            },
        }
    }
    debug!("Diagnostic pump stopped after {} message(s)", logged);
    logged
}

fn log_record(record: &DiagnosticRecord) {
    match record.severity {
        Severity::Corruption | Severity::Error => error!(
            "{} {} (From {}): {}",
            record.severity, record.category, record.source, record.message
        ),
        Severity::Warning => warn!(
            "{} {} (From {}): {}",
            record.severity, record.category, record.source, record.message
        ),
        Severity::Info => info!(
            "{} {} (From {}): {}",
            record.severity, record.category, record.source, record.message
        ),
        Severity::Message => debug!(
            "{} {} (From {}): {}",
            record.severity, record.category, record.source, record.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message: &str) -> DiagnosticRecord {
        DiagnosticRecord::new(Severity::Info, "Execution", "test", message)
    }

    #[tokio::test]
    async fn test_pump_logs_queued_records_on_shutdown() {
        let (sink, pump) = DiagnosticPump::spawn(8);
        sink.emit(record("one"));
        sink.emit(record("two"));
        assert_eq!(pump.shutdown().await, 2);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = DiagnosticSink {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        sink.emit(record("kept"));
        sink.emit(record("dropped"));
        sink.emit(record("dropped too"));
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn test_pump_stops_when_sinks_are_gone() {
        let (sink, pump) = DiagnosticPump::spawn(4);
        sink.emit(record("last words"));
        drop(sink);
        let token = pump.cancellation_token();
        assert_eq!(pump.shutdown().await, 1);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_disabled_sink_ignores_records() {
        let sink = DiagnosticSink::disabled();
        sink.emit(record("nobody listens"));
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Corruption < Severity::Warning);
        assert_eq!(Severity::Warning.to_string(), "WARNING");
    }
}
