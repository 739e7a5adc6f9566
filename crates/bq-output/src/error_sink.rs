// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local spill files for rows that could not be delivered.
//!
//! Each spill goes to `{directory}/{table}-{unix_timestamp}.log`, one message
//! per line. Files are only ever appended to and are never read back.

use crate::batcher::Message;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default spill directory.
pub const DEFAULT_ERROR_DIRECTORY: &str = "/tmp/bigquery_errors";

/// Writes undelivered messages to disk.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    directory: PathBuf,
}

impl ErrorSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Spill file path for a table at a given unix timestamp.
    pub fn path_for(&self, table: &str, unix_secs: u64) -> PathBuf {
        self.directory.join(format!("{}-{}.log", table, unix_secs))
    }

    /// Write messages to a new or existing spill file and return its path.
    pub fn write<'a, I>(&self, table: &str, messages: I) -> io::Result<PathBuf>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        fs::create_dir_all(&self.directory)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = self.path_for(table, now);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        for message in messages {
            writer.write_all(message.as_str().as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        Ok(path)
    }

    /// Best-effort [`write`](Self::write). Returns `false` if the rows are lost.
    pub fn spill(&self, table: &str, messages: &[Message]) -> bool {
        match self.write(table, messages) {
            Ok(path) => {
                tracing::info!(
                    table,
                    rows = messages.len(),
                    path = %path.display(),
                    "Problem data is being stored"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    table,
                    rows = messages.len(),
                    directory = %self.directory.display(),
                    error = %e,
                    "Error creating error file, rows lost"
                );
                false
            }
        }
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_DIRECTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(payloads: &[&str]) -> Vec<Message> {
        payloads.iter().map(|p| Message::new(*p)).collect()
    }

    #[test]
    fn test_write_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ErrorSink::new(dir.path().join("nested/errors"));

        let path = sink.write("logstash_x", &messages(&["a", "b"])).unwrap();

        assert!(path.starts_with(dir.path().join("nested/errors")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("logstash_x-") && name.ends_with(".log"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_write_appends_within_same_second() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ErrorSink::new(dir.path());

        let first = sink.write("t", &messages(&["one"])).unwrap();
        let second = sink.write("t", &messages(&["two"])).unwrap();

        let mut contents = fs::read_to_string(&first).unwrap();
        if first != second {
            contents.push_str(&fs::read_to_string(&second).unwrap());
        }
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test]
    fn test_spill_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        // A regular file where the directory should be.
        let sink = ErrorSink::new(&blocker);
        assert!(!sink.spill("t", &messages(&["a"])));
    }

    #[test]
    fn test_spill_success() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ErrorSink::new(dir.path());
        assert!(sink.spill("t", &messages(&["{\"a\":1}"])));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_path_format() {
        let sink = ErrorSink::new("/var/spool/bq");
        assert_eq!(
            sink.path_for("logstash_2012_09_08T07_00", 1347087960),
            PathBuf::from("/var/spool/bq/logstash_2012_09_08T07_00-1347087960.log")
        );
    }
}
