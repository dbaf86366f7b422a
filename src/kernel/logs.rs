use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Rotation threshold per file.
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
/// Current file plus two rotated generations.
const MAX_FILES: usize = 3;

/// Size-rotated line sink for one log channel (`app`, `kernel`, `probe`).
///
/// `tracing-appender` rotates by time only; kernel/probe output wants the
/// 10 MB × 3 layout, so rotation is done here on the write path.
pub struct RollingLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RollingLog {
    pub fn new(dir: &std::path::Path, channel: &str) -> Self {
        Self {
            path: dir.join(format!("{}.log", channel)),
            file: Mutex::new(None),
        }
    }

    pub fn write_line(&self, line: &str) {
        let mut guard = self.file.lock().expect("log mutex poisoned");

        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    warn!("logs: open failed, path={}, error={}", self.path.display(), e);
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            if size >= MAX_FILE_SIZE {
                *guard = None;
                self.rotate();
                return self.reopen_and_write(&mut guard, line);
            }
            if let Err(e) = writeln!(file, "{}", line) {
                warn!("logs: write failed, path={}, error={}", self.path.display(), e);
            }
        }
    }

    fn reopen_and_write(&self, guard: &mut Option<File>, line: &str) {
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{}", line);
            *guard = Some(f);
        }
    }

    /// `x.log` → `x.log.1` → `x.log.2`; the oldest generation falls off.
    fn rotate(&self) {
        for i in (1..MAX_FILES).rev() {
            let from = if i == 1 {
                self.path.clone()
            } else {
                self.path.with_extension(format!("log.{}", i - 1))
            };
            let to = self.path.with_extension(format!("log.{}", i));
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// `std::io::Write` adapter so a tracing layer can target a `RollingLog`.
/// Buffers until newline; one tracing event maps to one log line.
pub struct LineWriter {
    log: std::sync::Arc<RollingLog>,
    buf: Vec<u8>,
}

impl LineWriter {
    pub fn new(log: std::sync::Arc<RollingLog>) -> Self {
        Self {
            log,
            buf: Vec::new(),
        }
    }
}

impl Write for LineWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.log.write_line(&line);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.log.write_line(&line);
            self.buf.clear();
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_creates_file() {
        let dir = std::env::temp_dir().join(format!("argus-logs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = RollingLog::new(&dir, "kernel");
        log.write_line("started");
        log.write_line("ready");
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("started"));
        assert!(content.contains("ready"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
