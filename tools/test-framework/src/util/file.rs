/*!
   Filesystem utilities.
*/

use eyre::eyre;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Error;

/**
   An append-only log file that can be shared between tasks.

   Every line is written with a single `write_all` while holding the
   lock, so lines from concurrent writers never interleave. Once
   closed, further writes fail.
*/
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&self, line: &str) -> Result<(), Error> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line.trim_end_matches('\n'));
        buf.push('\n');

        self.write_raw(buf.as_bytes())
    }

    pub fn write_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| eyre!("log sink {} is poisoned", self.path.display()))?;

        match guard.as_mut() {
            Some(file) => {
                file.write_all(bytes)?;
                Ok(())
            }
            None => Err(Error::generic(eyre!(
                "log sink {} is already closed",
                self.path.display()
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().map(|f| f.is_none()).unwrap_or(true)
    }

    /// Flush and close the file. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| eyre!("log sink {} is poisoned", self.path.display()))?;

        if let Some(mut file) = guard.take() {
            file.flush()?;
            file.sync_all()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_writers_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path().join("arb.log")).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        sink.write_line(&format!("writer-{i} line-{j}")).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        sink.close().unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 200);
        assert!(lines.iter().all(|l| l.starts_with("writer-")));

        assert!(sink.is_closed());
        assert!(sink.write_line("late").is_err());
        assert!(sink.close().is_ok());
    }
}
