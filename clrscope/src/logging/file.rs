//! JSON-lines logger with a background writer.
//!
//! Callbacks must never block on disk I/O, so `log` only does a `try_send`
//! into a bounded channel. When the writer falls behind, records are dropped
//! and counted.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::{LogRecord, Logger, Severity};

/// Records buffered before the logger starts dropping
pub const DEFAULT_CAPACITY: usize = 4096;

pub struct FileLogger {
    path: PathBuf,
    sender: RwLock<Option<Sender<LogRecord>>>,
    writer: Mutex<Option<JoinHandle<io::Result<()>>>>,
    dropped: AtomicU64,
}

impl FileLogger {
    /// Open `path` for appending and start the writer thread
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the thread cannot start
    pub fn create(path: &Path) -> io::Result<Self> {
        Self::with_capacity(path, DEFAULT_CAPACITY)
    }

    /// # Errors
    /// Returns an error if the file cannot be opened or the thread cannot start
    pub fn with_capacity(path: &Path, capacity: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = bounded(capacity);

        let writer = thread::Builder::new()
            .name("clrscope-log".to_string())
            .spawn(move || write_records(&rx, BufWriter::new(file)))?;

        Ok(Self {
            path: path.to_path_buf(),
            sender: RwLock::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            dropped: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records discarded because the channel was full or already closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn write_records(rx: &Receiver<LogRecord>, mut out: BufWriter<File>) -> io::Result<()> {
    for record in rx {
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

impl Logger for FileLogger {
    fn log(&self, severity: Severity, message: &str) {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match sender.try_send(LogRecord::now(severity, message)) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn shutdown(&self) {
        // Closing the channel ends the writer loop once it has drained
        drop(self.sender.write().unwrap_or_else(PoisonError::into_inner).take());

        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Log writer for {} failed: {e}", self.path.display()),
                Err(_) => log::error!("Log writer for {} panicked", self.path.display()),
            }
        }

        let dropped = self.dropped();
        if dropped > 0 {
            log::warn!("{dropped} log records were dropped");
        }
    }
}

impl Drop for FileLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn read_records(path: &Path) -> Vec<LogRecord> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.log");

        let logger = FileLogger::create(&path).unwrap();
        logger.log(Severity::Info, "Assembly loaded: System.Runtime (id=0x10)");
        logger.log(Severity::Warning, "GC finished");
        logger.shutdown();

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, Severity::Info);
        assert_eq!(records[1].message, "GC finished");
        assert_eq!(records[0].pid, std::process::id());
    }

    #[test]
    fn test_shutdown_is_idempotent_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.log");

        let logger = FileLogger::create(&path).unwrap();
        logger.log(Severity::Info, "before");
        logger.shutdown();
        logger.shutdown();
        logger.log(Severity::Info, "after");

        assert_eq!(read_records(&path).len(), 1);
        assert_eq!(logger.dropped(), 1);
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.log");

        for message in ["first", "second"] {
            let logger = FileLogger::create(&path).unwrap();
            logger.log(Severity::Debug, message);
        }

        let messages: Vec<String> = read_records(&path).into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }
}
