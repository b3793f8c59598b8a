//! Operator-facing status lines and the optional status log file.

use crate::config::Destination;
use crate::transport::DeliveryOutcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Collector started towards this receiver.
    Started(Destination),
    /// Result of one cycle's send.
    Delivered(DeliveryOutcome),
    /// A cycle could not build its payload.
    EncodeFailed(String),
    Stopped,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started(dest) => write!(f, "device IP:{}", dest),
            Self::Delivered(outcome) => write!(f, "{}", outcome),
            Self::EncodeFailed(err) => write!(f, "fail in send[{}].", err),
            Self::Stopped => write!(f, "Stopped."),
        }
    }
}

/// One line of the status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub timestamp: DateTime<Utc>,
    pub event: StatusEvent,
}

impl StatusLine {
    pub fn now(event: StatusEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn outcome(&self) -> Option<&DeliveryOutcome> {
        match &self.event {
            StatusEvent::Delivered(outcome) => Some(outcome),
            _ => None,
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.format("%H:%M:%S"), self.event)
    }
}

/// Appends status lines to a text file.
pub struct StatusLog {
    writer: BufWriter<File>,
    lines_written: u64,
}

impl StatusLog {
    /// Appends to an existing file; a header marks each new session.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("Failed to open status log {}", path.as_ref().display()))?;

        let mut log = Self {
            writer: BufWriter::new(file),
            lines_written: 0,
        };
        writeln!(log.writer, "# compmon status log")?;
        writeln!(log.writer, "# Started: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))?;
        log.writer.flush()?;
        Ok(log)
    }

    pub fn log(&mut self, line: &StatusLine) -> Result<()> {
        writeln!(self.writer, "{}", line)?;
        self.lines_written += 1;

        if self.lines_written % 10 == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }
}

impl Drop for StatusLog {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
