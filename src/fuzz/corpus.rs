//! Seed corpus contract and its JSONL-backed implementation.
//!
//! The engine only needs id allocation, a FIFO of unprocessed seeds,
//! keyed retrieval and result reporting; persistence details stay behind
//! the trait. The on-disk form is one JSON object per line (a meta row
//! carrying the id counter, then one row per seed), rewritten wholesale
//! through a temp file and an atomic rename.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CorpusError;
use crate::fuzz::seed::{FuzzResult, Seed};

pub trait SeedCorpus {
    /// Monotonic id for a new seed; never reused within or across runs.
    fn allocate_id(&mut self) -> u64;
    /// Next seed awaiting processing, oldest first.
    fn next(&mut self) -> Option<Seed>;
    fn add(&mut self, seed: Seed);
    fn get(&self, id: u64) -> Option<Seed>;
    fn report_result(&mut self, id: u64, result: FuzzResult);
    fn update_total_coverage(&mut self, bp: u32);
    fn save(&mut self) -> Result<(), CorpusError>;
    /// Final save at campaign end.
    fn finalize(&mut self) -> Result<(), CorpusError>;
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CorpusLine {
    Meta { next_id: u64, total_coverage_bp: u32 },
    Seed { seed: Seed, result: Option<FuzzResult> },
}

pub struct JsonlCorpus {
    path: PathBuf,
    seeds: BTreeMap<u64, Seed>,
    results: BTreeMap<u64, FuzzResult>,
    pending: VecDeque<u64>,
    next_id: u64,
    total_coverage_bp: u32,
}

impl JsonlCorpus {
    /// Open (or create) a corpus file. Existing rows are reloaded; seeds
    /// without a reported result re-enter the pending queue.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let path = path.into();
        let mut corpus = Self {
            path: path.clone(),
            seeds: BTreeMap::new(),
            results: BTreeMap::new(),
            pending: VecDeque::new(),
            next_id: 0,
            total_coverage_bp: 0,
        };
        if !path.exists() {
            return Ok(corpus);
        }
        let body =
            fs::read_to_string(&path).map_err(|source| CorpusError::Io { path, source })?;
        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<CorpusLine>(trimmed)? {
                CorpusLine::Meta { next_id, total_coverage_bp } => {
                    corpus.next_id = corpus.next_id.max(next_id);
                    corpus.total_coverage_bp = total_coverage_bp;
                }
                CorpusLine::Seed { seed, result } => {
                    corpus.next_id = corpus.next_id.max(seed.id + 1);
                    if let Some(result) = result {
                        corpus.results.insert(seed.id, result);
                    } else {
                        corpus.pending.push_back(seed.id);
                    }
                    corpus.seeds.insert(seed.id, seed);
                }
            }
        }
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn total_coverage_bp(&self) -> u32 {
        self.total_coverage_bp
    }

    pub fn result(&self, id: u64) -> Option<&FuzzResult> {
        self.results.get(&id)
    }
}

impl SeedCorpus for JsonlCorpus {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn next(&mut self) -> Option<Seed> {
        while let Some(id) = self.pending.pop_front() {
            if self.results.contains_key(&id) {
                continue;
            }
            if let Some(seed) = self.seeds.get(&id) {
                return Some(seed.clone());
            }
        }
        None
    }

    fn add(&mut self, seed: Seed) {
        self.next_id = self.next_id.max(seed.id + 1);
        let id = seed.id;
        let fresh = !self.seeds.contains_key(&id);
        self.seeds.insert(id, seed);
        if fresh && !self.results.contains_key(&id) {
            self.pending.push_back(id);
        }
    }

    fn get(&self, id: u64) -> Option<Seed> {
        self.seeds.get(&id).cloned()
    }

    fn report_result(&mut self, id: u64, result: FuzzResult) {
        if let Some(seed) = self.seeds.get_mut(&id) {
            seed.old_coverage_bp = result.old_coverage_bp;
            seed.new_coverage_bp = result.new_coverage_bp;
            seed.oracle_verdict = result.oracle_verdict;
            seed.bug_description = result.bug_description.clone();
        }
        self.results.insert(id, result);
    }

    fn update_total_coverage(&mut self, bp: u32) {
        self.total_coverage_bp = self.total_coverage_bp.max(bp);
    }

    fn save(&mut self) -> Result<(), CorpusError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|source| CorpusError::Io { path: self.path.clone(), source })?;
            }
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let file = fs::File::create(&tmp)
                .map_err(|source| CorpusError::Io { path: tmp.clone(), source })?;
            let mut w = BufWriter::new(file);
            let io_err = |source| CorpusError::Io { path: tmp.clone(), source };
            let meta = CorpusLine::Meta {
                next_id: self.next_id,
                total_coverage_bp: self.total_coverage_bp,
            };
            writeln!(w, "{}", serde_json::to_string(&meta)?).map_err(io_err)?;
            for (id, seed) in &self.seeds {
                let line = CorpusLine::Seed {
                    seed: seed.clone(),
                    result: self.results.get(id).cloned(),
                };
                writeln!(w, "{}", serde_json::to_string(&line)?).map_err(io_err)?;
            }
            w.flush().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|source| CorpusError::Io { path: self.path.clone(), source })
    }

    fn finalize(&mut self) -> Result<(), CorpusError> {
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::seed::OracleVerdict;

    fn result(hit: bool) -> FuzzResult {
        FuzzResult { hit_target: hit, oracle_verdict: OracleVerdict::Normal, ..FuzzResult::default() }
    }

    #[test]
    fn ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = JsonlCorpus::open(dir.path().join("corpus.jsonl")).unwrap();
        let a = c.allocate_id();
        let b = c.allocate_id();
        assert!(b > a);
        c.add(Seed::new(17, "int x;"));
        assert!(c.allocate_id() > 17);
    }

    #[test]
    fn next_drains_unprocessed_seeds_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = JsonlCorpus::open(dir.path().join("corpus.jsonl")).unwrap();
        for (id, src) in [(0, "int a;"), (1, "int b;"), (2, "int c;")] {
            c.add(Seed::new(id, src));
        }
        assert_eq!(c.next().unwrap().id, 0);
        c.report_result(1, result(false));
        // Seed 1 got a result before being drained; skip it.
        assert_eq!(c.next().unwrap().id, 2);
        assert!(c.next().is_none());
    }

    #[test]
    fn report_result_updates_the_stored_seed() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = JsonlCorpus::open(dir.path().join("corpus.jsonl")).unwrap();
        c.add(Seed::new(0, "int a;"));
        c.report_result(
            0,
            FuzzResult {
                old_coverage_bp: 100,
                new_coverage_bp: 250,
                oracle_verdict: OracleVerdict::Bug,
                bug_description: Some("miscompare".to_string()),
                ..FuzzResult::default()
            },
        );
        let seed = c.get(0).unwrap();
        assert_eq!(seed.new_coverage_bp, 250);
        assert_eq!(seed.oracle_verdict, OracleVerdict::Bug);
        assert_eq!(seed.bug_description.as_deref(), Some("miscompare"));
    }

    #[test]
    fn save_and_reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/corpus.jsonl");
        {
            let mut c = JsonlCorpus::open(&path).unwrap();
            c.add(Seed::new(0, "int a;"));
            c.add(Seed::new(1, "int b;"));
            c.report_result(0, result(true));
            let _ = c.allocate_id(); // id 2, handed out but never admitted
            c.update_total_coverage(1234);
            c.finalize().unwrap();
        }
        let mut c = JsonlCorpus::open(&path).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.total_coverage_bp(), 1234);
        // Allocated-but-unsaved ids are not reused after resume.
        assert_eq!(c.allocate_id(), 3);
        // Seed 1 never got a result; it is pending again.
        assert_eq!(c.next().unwrap().id, 1);
        assert!(c.next().is_none());
        assert!(c.result(0).unwrap().hit_target);
    }

    #[test]
    fn total_coverage_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = JsonlCorpus::open(dir.path().join("c.jsonl")).unwrap();
        c.update_total_coverage(500);
        c.update_total_coverage(300);
        assert_eq!(c.total_coverage_bp(), 500);
    }
}
