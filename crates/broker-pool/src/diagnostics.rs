//! Diagnostic log and pool identity marker.
//!
//! Every message is emitted as a `tracing` event. Messages at or below the
//! configured [`DebugLevel`] are also written as plain lines to the pool's
//! log file, which falls back to a temp file when the configured destination
//! cannot be opened.

use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::DebugLevel;
use crate::error::{PoolError, Result};

/// Line-oriented log gated by debug level.
pub(crate) struct DiagnosticLog {
    level: DebugLevel,
    path: PathBuf,
    writer: Mutex<Option<LineWriter<File>>>,
}

impl DiagnosticLog {
    /// Open the log at `destination`, or at a fresh temp file if that fails.
    pub(crate) fn open(
        destination: Option<&Path>,
        append: bool,
        level: DebugLevel,
    ) -> Result<Self> {
        let opened = destination.map(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(path)
                .map(|file| (file, path.to_path_buf()))
        });

        let (file, path) = match opened {
            Some(Ok(opened)) => opened,
            Some(Err(e)) => {
                tracing::warn!(
                    error = %e,
                    "cannot write to pool log file, falling back to a temp file"
                );
                temp_log()?
            }
            None => temp_log()?,
        };

        Ok(Self {
            level,
            path,
            writer: Mutex::new(Some(LineWriter::new(file))),
        })
    }

    /// Path of the log file actually in use.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the identity marker co-located with the log.
    pub(crate) fn marker_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".pid");
        PathBuf::from(name)
    }

    pub(crate) fn level(&self) -> DebugLevel {
        self.level
    }

    pub(crate) fn error(&self, message: &str) {
        tracing::error!("{message}");
        self.write_gated(DebugLevel::Errors, "ERROR", message);
    }

    pub(crate) fn warn(&self, message: &str) {
        tracing::warn!("{message}");
        self.write_gated(DebugLevel::Warnings, "WARN", message);
    }

    pub(crate) fn info(&self, message: &str) {
        tracing::debug!("{message}");
        self.write_gated(DebugLevel::Verbose, "INFO", message);
    }

    /// Lifecycle events written regardless of debug level.
    pub(crate) fn event(&self, message: &str) {
        tracing::info!("{message}");
        self.write_line("EVENT", message);
    }

    /// Flush and close the file. Later messages only reach `tracing`.
    pub(crate) fn close(&self) {
        if let Some(mut writer) = self.writer.lock().take() {
            let _ = writer.flush();
        }
    }

    fn write_gated(&self, required: DebugLevel, tag: &str, message: &str) {
        if self.level >= required {
            self.write_line(tag, message);
        }
    }

    fn write_line(&self, tag: &str, message: &str) {
        let mut guard = self.writer.lock();
        if let Some(writer) = guard.as_mut() {
            let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            if let Err(e) = writeln!(writer, "{stamp} {tag:<5} {message}") {
                tracing::warn!(error = %e, "failed to write pool log line");
            }
        }
    }
}

fn temp_log() -> Result<(File, PathBuf)> {
    tempfile::Builder::new()
        .prefix("dbbroker_pool")
        .suffix(".log")
        .tempfile()
        .map_err(PoolError::Log)?
        .keep()
        .map_err(|e| PoolError::Log(e.error))
}

/// Identity of a running pool instance, persisted next to its log.
///
/// A newer pool started against the same log path overwrites the marker;
/// the older pool notices on its next housekeeping cycle and shuts itself
/// down.
#[derive(Debug, Clone)]
pub(crate) struct IdentityMarker {
    path: PathBuf,
    id: String,
}

impl IdentityMarker {
    pub(crate) fn new(path: PathBuf) -> Self {
        let id = format!(
            "{} {}",
            Utc::now().format("%Y.%m.%d at %H:%M:%S%.6f UTC"),
            Uuid::new_v4()
        );
        Self { path, id }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn write(&self) -> io::Result<()> {
        tokio::fs::write(&self.path, format!("{}\n", self.id)).await
    }

    /// Whether the marker on disk still names this instance.
    pub(crate) async fn is_current(&self) -> io::Result<bool> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(contents.lines().next() == Some(self.id.as_str()))
    }
}
