//! Generate command implementation

use anyhow::{Context, Result};
use clap::Args;
use conduit_shared::data_file_name;
use conduit_shared::utils::{format_bytes, parse_size};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BenchConfig;
use crate::output;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Output directory (defaults to `data_dir` from the configuration)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Bytes per file (e.g., "256KiB")
    #[arg(short = 'u', long)]
    pub unit_len: Option<String>,

    /// Number of files
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

pub fn run(args: GenerateArgs, mut config: BenchConfig) -> Result<()> {
    if let Some(dir) = args.dir {
        config.data_dir = dir;
    }
    if let Some(unit_len) = &args.unit_len {
        config.unit_len = parse_size(unit_len).context("Failed to parse unit length")?;
    }
    if let Some(count) = args.count {
        config.file_count = count;
    }
    config.validate()?;

    let unit_len = usize::try_from(config.unit_len).context("Unit length too large")?;
    output::info(&format!(
        "Writing {} file(s) of {} into {}",
        config.file_count,
        format_bytes(config.unit_len),
        config.data_dir.display()
    ));

    write_payload(&config.data_dir, unit_len, config.file_count)?;

    output::success(&format!(
        "Generated {}",
        format_bytes(config.unit_len * config.file_count as u64)
    ));
    Ok(())
}

/// Write `count` files of `unit_len` random bytes each into `dir`.
fn write_payload(dir: &Path, unit_len: usize, count: usize) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let bar = output::progress_bar(count as u64, "files");
    let mut buffer = vec![0u8; unit_len];
    for index in 0..count {
        OsRng
            .try_fill_bytes(&mut buffer)
            .context("Failed to read from the OS random source")?;
        let path = dir.join(data_file_name(index));
        fs::write(&path, &buffer)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_shared::TransferPayload;

    #[test]
    fn test_generated_files_form_a_payload() {
        let dir = tempfile::tempdir().unwrap();
        write_payload(dir.path(), 1000, 3).unwrap();

        let payload = TransferPayload::from_directory(dir.path(), 1000, 3).unwrap();
        assert_eq!(payload.total_bytes(), 3000);
        assert!(payload.last_file().unwrap().ends_with("file2.bin"));

        // random contents differ between files
        let first = fs::read(&payload.files()[0]).unwrap();
        let second = fs::read(&payload.files()[1]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_arguments_override_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let args = GenerateArgs {
            dir: Some(dir.path().join("out")),
            unit_len: Some("4KiB".into()),
            count: Some(2),
        };
        run(args, BenchConfig::default()).unwrap();

        let payload = TransferPayload::from_directory(&dir.path().join("out"), 4096, 2).unwrap();
        assert_eq!(payload.file_count(), 2);
    }
}
