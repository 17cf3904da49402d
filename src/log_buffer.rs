//! In-memory log sink with explicit flushes to a rotated file.
//!
//! Every record also goes through the `log` facade, so a console logger sees it
//! straight away. The buffered copy only reaches disk when the owner calls
//! [`LogBuffer::flush`], which keeps flash writes to a handful per boot.

use log::Level;
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const LOG_FILE: &str = "main.log";

/// Older log files kept next to the current one
pub const BACKUP_COUNT: usize = 5;

pub struct LogBuffer {
    path: PathBuf,
    started: Instant,
    pending: Vec<String>,
    disabled: bool,
}

impl LogBuffer {
    /// Create `dir` if needed and rotate any log left over from the previous boot.
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        rotate(&path, BACKUP_COUNT)?;

        Ok(Self {
            path,
            started: Instant::now(),
            pending: Vec::new(),
            disabled: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines waiting for the next flush.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn record(&mut self, level: Level, message: &str) {
        log::log!(level, "{}", message);
        if self.disabled {
            return;
        }
        let uptime = self.started.elapsed().as_secs_f64();
        self.pending
            .push(format!("{:9.3} {:<8} {}", uptime, level.as_str(), message));
    }

    pub fn info(&mut self, message: &str) {
        self.record(Level::Info, message);
    }

    pub fn warn(&mut self, message: &str) {
        self.record(Level::Warn, message);
    }

    pub fn error(&mut self, message: &str) {
        self.record(Level::Error, message);
    }

    /// Log an error followed by each of its causes, indented.
    ///
    /// A cause whose text is already part of the message above it is skipped, so
    /// wrappers that print their source do not log it twice.
    pub fn error_chain(&mut self, err: &dyn Error) {
        let mut above = err.to_string();
        self.error(&above);
        let mut source = err.source();
        while let Some(cause) = source {
            let text = cause.to_string();
            if !above.contains(&text) {
                self.error(&format!("  -> {}", text));
            }
            above = text;
            source = cause.source();
        }
    }

    /// Append pending lines to the log file.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for line in &self.pending {
            writeln!(file, "{}", line)?;
        }
        self.pending.clear();
        Ok(())
    }

    /// Flush what has been collected so far and stop buffering from now on.
    ///
    /// Records still reach the `log` facade afterwards.
    pub fn discard_future(&mut self) -> io::Result<()> {
        self.flush()?;
        self.disabled = true;
        Ok(())
    }
}

/// Shift `path` to `path.1`, `path.1` to `path.2` and so on, dropping the oldest.
fn rotate(path: &Path, backups: usize) -> io::Result<()> {
    if backups == 0 || !path.exists() {
        return Ok(());
    }

    let numbered = |i: usize| {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{}", i));
        PathBuf::from(name)
    };

    for i in (1..backups).rev() {
        let src = numbered(i);
        if src.exists() {
            fs::rename(&src, numbered(i + 1))?;
        }
    }
    fs::rename(path, numbered(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flush_appends_formatted_lines() {
        let dir = TempDir::new().unwrap();
        let mut log = LogBuffer::new(dir.path()).unwrap();

        log.info("booting");
        log.error("no backend");
        assert_eq!(log.pending().len(), 2);
        assert!(!log.path().exists());

        log.flush().unwrap();
        assert!(log.pending().is_empty());

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" INFO     booting"));
        assert!(lines[1].ends_with(" ERROR    no backend"));
        // uptime is right aligned in 9 columns
        assert_eq!(lines[0].find(" INFO"), Some(9));

        log.warn("again");
        log.flush().unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_discard_future_flushes_then_stops_buffering() {
        let dir = TempDir::new().unwrap();
        let mut log = LogBuffer::new(dir.path()).unwrap();

        log.info("before");
        log.discard_future().unwrap();
        assert!(log.is_disabled());

        log.info("after");
        assert!(log.pending().is_empty());
        log.flush().unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("before"));
        assert!(!contents.contains("after"));
    }

    #[test]
    fn test_error_chain_logs_causes() {
        let dir = TempDir::new().unwrap();
        let mut log = LogBuffer::new(dir.path()).unwrap();

        let inner = io::Error::new(io::ErrorKind::Other, "socket closed");
        let outer = io::Error::new(io::ErrorKind::Other, inner);
        log.error_chain(&outer);

        assert!(!log.pending().is_empty());
        assert!(log.pending()[0].contains("socket closed"));
    }

    #[derive(thiserror::Error, Debug)]
    enum Wrapped {
        #[error("display: {0}")]
        Quoting(#[from] io::Error),

        #[error("startup failed")]
        Silent(#[source] io::Error),
    }

    #[test]
    fn test_error_chain_skips_cause_already_in_message() {
        let dir = TempDir::new().unwrap();
        let mut log = LogBuffer::new(dir.path()).unwrap();

        let err = Wrapped::from(io::Error::new(io::ErrorKind::Other, "spi write failed"));
        log.error_chain(&err);
        assert_eq!(log.pending().len(), 1);
        assert!(log.pending()[0].ends_with("display: spi write failed"));

        let err = Wrapped::Silent(io::Error::new(io::ErrorKind::Other, "spi write failed"));
        log.error_chain(&err);
        assert_eq!(log.pending().len(), 3);
        assert!(log.pending()[1].ends_with("startup failed"));
        assert!(log.pending()[2].ends_with("  -> spi write failed"));
    }

    #[test]
    fn test_rotation_keeps_five_backups() {
        let dir = TempDir::new().unwrap();

        for boot in 0..7 {
            let mut log = LogBuffer::new(dir.path()).unwrap();
            log.info(&format!("boot {}", boot));
            log.flush().unwrap();
        }

        let current = fs::read_to_string(dir.path().join("main.log")).unwrap();
        assert!(current.contains("boot 6"));
        let newest_backup = fs::read_to_string(dir.path().join("main.log.1")).unwrap();
        assert!(newest_backup.contains("boot 5"));
        let oldest_backup = fs::read_to_string(dir.path().join("main.log.5")).unwrap();
        assert!(oldest_backup.contains("boot 1"));
        assert!(!dir.path().join("main.log.6").exists());
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("var").join("logs");
        let mut log = LogBuffer::new(&nested).unwrap();
        log.info("hello");
        log.flush().unwrap();
        assert!(nested.join("main.log").exists());
    }
}
