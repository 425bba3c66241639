//! Per-process run log.
//!
//! Lines are buffered in memory for the whole run and written once at
//! shutdown, each prefixed with `PROC-{rank:05} `.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arbor_shared::{log_file_name, log_preamble};

/// Buffered log for one rank.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    preamble: String,
    lines: Vec<String>,
    flushed: bool,
}

impl RunLog {
    /// Log for `rank` of `nprocs`, written to `dir/{base}` or
    /// `dir/{base}-{nprocs}-{rank}`.
    #[must_use]
    pub fn new(dir: &Path, base: &str, nprocs: usize, rank: usize) -> Self {
        Self {
            path: dir.join(log_file_name(base, nprocs, rank)),
            preamble: log_preamble(rank),
            lines: Vec::new(),
            flushed: false,
        }
    }

    /// Appends one line.
    pub fn line(&mut self, text: impl AsRef<str>) {
        self.lines.push(format!("{}{}", self.preamble, text.as_ref()));
    }

    /// Appends a phase timing line.
    pub fn phase(&mut self, name: &str, elapsed: Duration) {
        self.line(format!("{name} took {:.6} sec", elapsed.as_secs_f64()));
    }

    /// Destination file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffered lines.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Writes the buffer out. Later calls append whatever was added since.
    pub fn flush(&mut self) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.flushed)
            .truncate(!self.flushed)
            .open(&self.path)?;
        for line in self.lines.drain(..) {
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
        self.flushed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_carry_rank_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), "gpuLog.log", 4, 2);
        log.line("hello");
        log.phase("upload", Duration::from_millis(1500));
        assert_eq!(log.lines()[0], "PROC-00002 hello");
        assert_eq!(log.lines()[1], "PROC-00002 upload took 1.500000 sec");

        log.flush().unwrap();
        assert!(log.lines().is_empty());
        let text = fs::read_to_string(dir.path().join("gpuLog.log-4-2")).unwrap();
        assert_eq!(text.lines().count(), 2);

        log.line("more");
        log.flush().unwrap();
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().last(), Some("PROC-00002 more"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_single_process_name() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path(), "run.log", 1, 0);
        assert_eq!(log.path(), dir.path().join("run.log"));
    }
}
