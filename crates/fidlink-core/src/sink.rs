//! Log sinks
//!
//! The engine only appends lines to named logs. [`FileLogSink`] writes one
//! file per name under a directory; [`MemoryLogSink`] keeps lines in memory.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Destination for telemetry log lines
pub trait LogSink: Send {
    /// Append lines to the log called `name`, creating it if needed
    fn append_lines(&mut self, name: &str, lines: &[String]) -> io::Result<()>;

    /// Whether the log called `name` already exists
    fn exists(&self, name: &str) -> bool;
}

/// Appends to `<dir>/<name>`
pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    /// Create the sink, making `dir` if it does not exist
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl LogSink for FileLogSink {
    fn append_lines(&mut self, name: &str, lines: &[String]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(name))?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        file.flush()
    }

    fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }
}

/// In-memory sink; clones share the same storage
#[derive(Clone, Default)]
pub struct MemoryLogSink {
    logs: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the lines written to `name`
    pub fn lines(&self, name: &str) -> Vec<String> {
        self.logs
            .lock()
            .map(|logs| logs.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl LogSink for MemoryLogSink {
    fn append_lines(&mut self, name: &str, lines: &[String]) -> io::Result<()> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| io::Error::other("log storage poisoned"))?;
        logs.entry(name.to_string())
            .or_default()
            .extend(lines.iter().cloned());
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.logs
            .lock()
            .map(|logs| logs.contains_key(name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileLogSink::new(dir.path().join("logs")).unwrap();
        assert!(!sink.exists("run.csv"));
        sink.append_lines("run.csv", &["a".into(), "b".into()]).unwrap();
        sink.append_lines("run.csv", &["c".into()]).unwrap();
        assert!(sink.exists("run.csv"));
        let text = fs::read_to_string(sink.path_for("run.csv")).unwrap();
        assert_eq!(text, "a\nb\nc\n");
    }

    #[test]
    fn test_memory_sink_shared_between_clones() {
        let sink = MemoryLogSink::new();
        let mut writer = sink.clone();
        writer.append_lines("x", &["1".into()]).unwrap();
        assert_eq!(sink.lines("x"), vec!["1".to_string()]);
        assert!(sink.exists("x"));
    }
}
