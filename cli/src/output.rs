//! Terminal output for CLI commands
//!
//! Status lines go to stdout except errors; tracing logs go to stderr so
//! benchmark tables stay clean when piped.

use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Success,
    Error,
    Info,
    Warning,
}

impl Status {
    fn marker(self) -> ColoredString {
        match self {
            Status::Success => "✓".green(),
            Status::Error => "✗".red(),
            Status::Info => "ℹ".blue(),
            Status::Warning => "⚠".yellow(),
        }
    }
}

fn line(status: Status, msg: impl Display) -> String {
    format!("{} {}", status.marker(), msg)
}

pub fn success(msg: impl Display) {
    println!("{}", line(Status::Success, msg));
}

pub fn error(msg: impl Display) {
    eprintln!("{}", line(Status::Error, msg));
}

pub fn info(msg: impl Display) {
    println!("{}", line(Status::Info, msg));
}

pub fn warning(msg: impl Display) {
    println!("{}", line(Status::Warning, msg));
}

pub fn heading(msg: impl Display) {
    println!("{}", msg.to_string().bold());
}

/// Progress bar over `len` steps
pub fn progress_bar(len: u64, msg: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    bar.set_style(style);
    bar.set_message(msg.to_string());
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines() {
        colored::control::set_override(false);
        assert_eq!(line(Status::Success, "done"), "✓ done");
        assert_eq!(line(Status::Error, format_args!("{} failed", 2)), "✗ 2 failed");
        assert_eq!(line(Status::Warning, 3), "⚠ 3");
        assert_eq!(line(Status::Info, ""), "ℹ ");
    }

    #[test]
    fn test_progress_bar_length() {
        let bar = progress_bar(7, "files");
        assert_eq!(bar.length(), Some(7));
        assert_eq!(bar.message(), "files");
    }
}
