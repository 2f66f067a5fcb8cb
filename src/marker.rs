//! Persistent boot-stage breadcrumbs.
//!
//! Marker files outlive the process image, so after a failed boot they show
//! how far the shim got even when no log sink was capturing.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::mount::ensure_dir;

/// One breadcrumb line.
#[derive(Debug, Clone)]
pub struct Marker {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Marker {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Rendered form: `<RFC 3339 timestamp> <message>`.
    pub fn line(&self) -> String {
        format!(
            "{} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.message
        )
    }
}

/// Appends markers to every configured destination.
#[derive(Debug, Clone, Default)]
pub struct MarkerWriter {
    destinations: Vec<PathBuf>,
}

impl MarkerWriter {
    pub fn new(destinations: Vec<PathBuf>) -> Self {
        Self { destinations }
    }

    pub fn destinations(&self) -> &[PathBuf] {
        &self.destinations
    }

    /// Record `message` everywhere. Returns how many destinations took it.
    pub fn write(&self, message: &str) -> usize {
        let marker = Marker::new(message);
        self.destinations
            .iter()
            .filter(|path| match append(path, &marker) {
                Ok(()) => true,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to write marker");
                    false
                }
            })
            .count()
    }
}

/// Append one marker line to `path`, creating parents and the file.
pub fn append(path: &Path, marker: &Marker) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)?;
    writeln!(file, "{}", marker.line())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_line_format() {
        let marker = Marker::new("wrapper starting");
        let line = marker.line();
        assert!(line.ends_with(" wrapper starting"));
        assert!(line.contains('T'));
        assert!(line.split(' ').next().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_append_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata/cf_init/marker.log");
        let writer = MarkerWriter::new(vec![path.clone()]);

        assert_eq!(writer.write("wrapper starting"), 1);
        assert_eq!(writer.write("handing off to /init.stock"), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("wrapper starting"));
        assert!(lines[1].ends_with("handing off to /init.stock"));
    }

    #[test]
    fn test_one_bad_destination_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let good = dir.path().join("cf_init_marker");
        // a regular file cannot be a parent directory
        let bad = blocker.join("marker");
        let writer = MarkerWriter::new(vec![bad, good.clone()]);

        assert_eq!(writer.write("stage"), 1);
        assert!(std::fs::read_to_string(&good).unwrap().ends_with("stage\n"));
    }
}
