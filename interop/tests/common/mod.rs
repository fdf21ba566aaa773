#![allow(dead_code)]

use anyhow::Result;
use conduit_interop::loopback::{
    LoopbackPlatform, LoopbackPrimaryDevice, LoopbackSecondaryDevice,
};
use conduit_interop::{DiagnosticSink, InteropSession, SessionConfig};
use conduit_shared::{data_file_name, TransferPayload};
use rand::RngCore;
use std::path::Path;
use tempfile::TempDir;

pub type LoopbackSession = InteropSession<LoopbackPrimaryDevice, LoopbackSecondaryDevice>;

/// Write `count` random files of `unit_len` bytes named like the generator does.
pub fn write_payload(dir: &Path, unit_len: u64, count: usize) -> Result<TransferPayload> {
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; unit_len as usize];
    for i in 0..count {
        rng.fill_bytes(&mut buf);
        std::fs::write(dir.join(data_file_name(i)), &buf)?;
    }
    Ok(TransferPayload::from_directory(dir, unit_len, count)?)
}

pub fn payload(unit_len: u64, count: usize) -> Result<(TempDir, TransferPayload)> {
    let dir = tempfile::tempdir()?;
    let payload = write_payload(dir.path(), unit_len, count)?;
    Ok((dir, payload))
}

pub fn session(platform: &LoopbackPlatform, len: u64) -> Result<LoopbackSession> {
    Ok(InteropSession::establish(
        &platform.primary(),
        &platform.secondary(),
        &SessionConfig::new(len),
        DiagnosticSink::disabled(),
    )?)
}

pub fn contents(path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

/// Nothing the platform handed out is still alive.
pub fn assert_no_leaks(platform: &LoopbackPlatform) {
    assert_eq!(platform.live_imports(), 0, "imports still alive");
    assert_eq!(platform.open_handles(), 0, "export handles still open");
    assert_eq!(platform.live_allocations(), 0, "shared allocations still alive");
}
