//! `uftrace`-backed implementation of the trace-record contract.
//!
//! `record` traces one compile of the seed (children included, so the cc1
//! sub-process lands in `task.txt`); `replay` renders the stream with tid
//! columns for the pid filter.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::divergence::analyzer::TraceTool;
use crate::error::TraceError;

pub struct UftraceTool {
    binary: PathBuf,
    /// Extra compiler arguments appended after the seed path. The default
    /// compiles to a throwaway object so the run stays cheap.
    compile_args: Vec<String>,
}

impl UftraceTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            compile_args: vec!["-c".into(), "-o".into(), "/dev/null".into()],
        }
    }

    pub fn with_compile_args(mut self, args: Vec<String>) -> Self {
        self.compile_args = args;
        self
    }

    fn run(&self, cmd: &mut Command) -> Result<std::process::Output, TraceError> {
        cmd.output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TraceError::ToolNotFound(self.binary.display().to_string())
            } else {
                TraceError::Io(e)
            }
        })
    }
}

impl Default for UftraceTool {
    fn default() -> Self {
        Self::new("uftrace")
    }
}

impl TraceTool for UftraceTool {
    fn record(&self, compiler: &Path, seed: &Path, out_dir: &Path) -> Result<(), TraceError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("record")
            .arg("--force")
            .arg("-d")
            .arg(out_dir)
            .arg(compiler)
            .arg(seed)
            .args(&self.compile_args);
        let output = self.run(&mut cmd)?;
        // The compile itself may fail (broken seeds do); only a failed
        // recording without a task listing is a trace error.
        if !output.status.success() && !out_dir.join("task.txt").exists() {
            return Err(TraceError::Record(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }

    fn replay(&self, trace_dir: &Path) -> Result<String, TraceError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("replay").arg("-d").arg(trace_dir);
        let output = self.run(&mut cmd)?;
        if !output.status.success() {
            return Err(TraceError::Replay(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
