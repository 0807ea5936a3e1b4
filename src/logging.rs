//! File-only logging.
//!
//! A CNI plugin owns neither stdout (reserved for the result document) nor
//! stderr, so all tracing output goes to a size-rotated file in the
//! configured log directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::NetConf;

pub const LOG_FILE_NAME: &str = "eni-cni.log";

/// Log file that rotates to `<name>.1 .. <name>.N` once it grows past a limit
pub struct RollingFile {
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
    max_backups: usize,
}

impl RollingFile {
    pub fn open(dir: &Path, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            max_bytes,
            max_backups,
        })
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            self.file = File::create(&self.path)?;
            self.size = 0;
            return Ok(());
        }

        let oldest = self.backup_path(self.max_backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Install the global subscriber for this invocation.
///
/// Failing to open the log directory silences logging instead of falling
/// back to stderr.
pub fn init(conf: &NetConf) {
    let filter = EnvFilter::try_new(&conf.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    let max_bytes = conf.log_max_size_mb.saturating_mul(1024 * 1024);
    // A subscriber installed earlier in this process keeps logging.
    let _ = match RollingFile::open(&conf.log_dir(), max_bytes, conf.log_max_backups) {
        Ok(file) => builder.with_writer(Mutex::new(file)).try_init(),
        Err(_) => builder.with_writer(io::sink).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_keeps_backups() {
        let dir = TempDir::new().unwrap();
        let mut log = RollingFile::open(dir.path(), 10, 2).unwrap();

        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            log.write_all(line.as_bytes()).unwrap();
        }
        log.flush().unwrap();

        let read = |name: &str| fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read(LOG_FILE_NAME), "dddddddd\n");
        assert_eq!(read("eni-cni.log.1"), "cccccccc\n");
        assert_eq!(read("eni-cni.log.2"), "bbbbbbbb\n");
        assert!(!dir.path().join("eni-cni.log.3").exists());
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = RollingFile::open(dir.path(), 1024, 1).unwrap();
            log.write_all(b"first\n").unwrap();
        }
        let mut log = RollingFile::open(dir.path(), 1024, 1).unwrap();
        log.write_all(b"second\n").unwrap();
        log.flush().unwrap();

        let contents = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn test_creates_log_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        RollingFile::open(&nested, 1024, 1).unwrap();
        assert!(nested.join(LOG_FILE_NAME).exists());
    }
}
