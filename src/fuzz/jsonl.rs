use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::CorpusError;
use crate::fuzz::seed::OracleVerdict;

/// One oracle-confirmed bug, appended to the campaign's bug log as it is
/// found (the corpus itself is checkpointed separately).
#[derive(Debug, Clone, Serialize)]
pub struct BugRecord {
    pub seed_id: u64,
    pub function: String,
    pub bb_id: u32,
    pub verdict: OracleVerdict,
    pub description: String,
    pub found_at: u64,
}

/// Append-only JSONL sink.
#[derive(Clone)]
pub struct JsonlWriter {
    path: PathBuf,
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl JsonlWriter {
    pub fn open_append(path: &Path) -> Result<Self, CorpusError> {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| CorpusError::Io { path: path.to_path_buf(), source })?;
        Ok(Self { path: path.to_path_buf(), inner: Arc::new(Mutex::new(BufWriter::new(f))) })
    }

    pub fn append_json_line<T: Serialize>(&self, value: &T) -> Result<(), CorpusError> {
        let line = serde_json::to_string(value)?;
        let mut w = self.inner.lock().unwrap();
        writeln!(w, "{line}")
            .map_err(|source| CorpusError::Io { path: self.path.clone(), source })?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), CorpusError> {
        let mut w = self.inner.lock().unwrap();
        w.flush().map_err(|source| CorpusError::Io { path: self.path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::seed::now_ts_secs;

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bugs.jsonl");
        let w = JsonlWriter::open_append(&path).unwrap();
        for i in 0..3u64 {
            w.append_json_line(&BugRecord {
                seed_id: i,
                function: "expand_binop".to_string(),
                bb_id: 7,
                verdict: OracleVerdict::Bug,
                description: "wrong code at -O2".to_string(),
                found_at: now_ts_secs(),
            })
            .unwrap();
        }
        w.flush().unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        let v: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(v["seed_id"], 2);
        assert_eq!(v["verdict"], "bug");
    }
}
