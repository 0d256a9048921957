//! Line -> seeds mapping with shared-read/exclusive-write access.
//!
//! Mutators take the write lock, queries the read lock; a reader never sees
//! a half-applied update. Persistence is a single JSON document keyed by
//! the canonical `file:line` form; seed arrays keep insertion order across
//! load/save. Interned file ids are an in-memory detail and never hit disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use libafl_bolts::rands::{Rand, StdRand};
use serde::{Deserialize, Serialize};

use crate::coverage::LineId;
use crate::error::CoverageMappingError;

fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

fn pack(file_id: u32, line: u32) -> u64 {
    ((file_id as u64) << 32) | line as u64
}

#[derive(Debug, Default)]
struct Inner {
    files: Vec<String>,
    file_ids: HashMap<String, u32>,
    /// Keyed by packed (file id, line); values are insertion-ordered,
    /// duplicate-free seed ids. An entry with an empty list counts as
    /// uncovered.
    line_to_seeds: HashMap<u64, Vec<u64>>,
}

impl Inner {
    fn file_id(&self, file: &str) -> Option<u32> {
        self.file_ids.get(file).copied()
    }

    fn intern_file(&mut self, file: &str) -> u32 {
        if let Some(&id) = self.file_ids.get(file) {
            return id;
        }
        let id = self.files.len() as u32;
        self.files.push(file.to_string());
        self.file_ids.insert(file.to_string(), id);
        id
    }

    fn seeds(&self, line: &LineId) -> Option<&Vec<u64>> {
        let id = self.file_id(&line.file)?;
        self.line_to_seeds.get(&pack(id, line.line))
    }

    fn unpack(&self, key: u64) -> LineId {
        let file_id = (key >> 32) as u32;
        LineId::new(self.files[file_id as usize].clone(), key as u32)
    }
}

/// On-disk form: `{"line_to_seeds": {"file:line": [seed ids]}}`.
#[derive(Serialize, Deserialize)]
struct MappingDoc {
    line_to_seeds: BTreeMap<String, Vec<u64>>,
}

#[derive(Debug)]
pub struct CoverageMapping {
    inner: RwLock<Inner>,
    rand: Mutex<StdRand>,
}

impl CoverageMapping {
    pub fn new(rng_seed: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            rand: Mutex::new(StdRand::with_seed(rng_seed)),
        }
    }

    /// Load a previously saved document.
    pub fn load(path: &Path, rng_seed: u64) -> Result<Self, CoverageMappingError> {
        let mapping = Self::new(rng_seed);
        mapping.load_from(path)?;
        Ok(mapping)
    }

    /// Attribute `seed_id` to `line`. Returns true iff the line went from
    /// uncovered to covered. Recording the same pair twice is a no-op.
    pub fn record_line(&self, line: &LineId, seed_id: u64) -> bool {
        let mut inner = self.inner.write().unwrap();
        let file_id = inner.intern_file(&line.file);
        let seeds = inner.line_to_seeds.entry(pack(file_id, line.line)).or_default();
        let newly_covered = seeds.is_empty();
        if !seeds.contains(&seed_id) {
            seeds.push(seed_id);
        }
        newly_covered
    }

    /// Bulk `record_line`; returns how many lines transitioned from
    /// uncovered to covered.
    pub fn record_lines(&self, lines: &[LineId], seed_id: u64) -> usize {
        let mut inner = self.inner.write().unwrap();
        let mut newly = 0;
        for line in lines {
            let file_id = inner.intern_file(&line.file);
            let seeds = inner.line_to_seeds.entry(pack(file_id, line.line)).or_default();
            if seeds.is_empty() {
                newly += 1;
            }
            if !seeds.contains(&seed_id) {
                seeds.push(seed_id);
            }
        }
        newly
    }

    /// A uniformly random seed among those covering `line`. The randomness
    /// keeps base-seed choice fair across equally good candidates.
    pub fn get_seed_for_line(&self, line: &LineId) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        let seeds = inner.seeds(line)?;
        if seeds.is_empty() {
            return None;
        }
        let idx = self.rand.lock().unwrap().below(nz(seeds.len()));
        Some(seeds[idx])
    }

    /// Owned copy of the seed list for `line`.
    pub fn get_seeds_for_line(&self, line: &LineId) -> Vec<u64> {
        let inner = self.inner.read().unwrap();
        inner.seeds(line).cloned().unwrap_or_default()
    }

    pub fn is_covered(&self, line: &LineId) -> bool {
        let inner = self.inner.read().unwrap();
        inner.seeds(line).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn total_covered_lines(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.line_to_seeds.values().filter(|s| !s.is_empty()).count()
    }

    pub fn get_covered_lines(&self) -> HashSet<LineId> {
        let inner = self.inner.read().unwrap();
        inner
            .line_to_seeds
            .iter()
            .filter(|(_, seeds)| !seeds.is_empty())
            .map(|(&key, _)| inner.unpack(key))
            .collect()
    }

    /// Covered line numbers within `file`, ascending.
    pub fn get_covered_lines_for_file(&self, file: &str) -> Vec<u32> {
        let inner = self.inner.read().unwrap();
        let Some(file_id) = inner.file_id(file) else {
            return Vec::new();
        };
        let mut lines: Vec<u32> = inner
            .line_to_seeds
            .iter()
            .filter_map(|(&key, seeds)| {
                if (key >> 32) as u32 == file_id && !seeds.is_empty() {
                    Some(key as u32)
                } else {
                    None
                }
            })
            .collect();
        lines.sort_unstable();
        lines
    }

    /// The greatest covered line <= `target_line` within `file`, with a
    /// uniformly random seed from its set.
    pub fn find_closest_covered_line(&self, file: &str, target_line: u32) -> Option<(LineId, u64)> {
        let (line, seeds) = {
            let inner = self.inner.read().unwrap();
            let file_id = inner.file_id(file)?;
            let mut best: Option<(u64, &Vec<u64>)> = None;
            for (&key, seeds) in &inner.line_to_seeds {
                if (key >> 32) as u32 != file_id || key as u32 > target_line || seeds.is_empty() {
                    continue;
                }
                if best.map(|(b, _)| key as u32 > b as u32).unwrap_or(true) {
                    best = Some((key, seeds));
                }
            }
            let (key, seeds) = best?;
            (inner.unpack(key), seeds.clone())
        };
        let idx = self.rand.lock().unwrap().below(nz(seeds.len()));
        Some((line, seeds[idx]))
    }

    /// Serialize the whole table. The document is rewritten wholesale; the
    /// parent directory is created if missing.
    pub fn save(&self, path: &Path) -> Result<(), CoverageMappingError> {
        let doc = {
            let inner = self.inner.read().unwrap();
            let mut line_to_seeds = BTreeMap::new();
            for (&key, seeds) in &inner.line_to_seeds {
                if seeds.is_empty() {
                    continue;
                }
                line_to_seeds.insert(inner.unpack(key).to_string(), seeds.clone());
            }
            MappingDoc { line_to_seeds }
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|source| CoverageMappingError::Io { path: path.to_path_buf(), source })?;
            }
        }
        let body = serde_json::to_string(&doc)?;
        fs::write(path, body)
            .map_err(|source| CoverageMappingError::Io { path: path.to_path_buf(), source })
    }

    /// Replace the in-memory table with the document at `path`.
    pub fn load_from(&self, path: &Path) -> Result<(), CoverageMappingError> {
        let body = fs::read_to_string(path)
            .map_err(|source| CoverageMappingError::Io { path: path.to_path_buf(), source })?;
        let doc: MappingDoc = serde_json::from_str(&body)?;

        let mut fresh = Inner::default();
        for (key, seeds) in doc.line_to_seeds {
            let Some(line) = LineId::parse(&key) else {
                continue;
            };
            let file_id = fresh.intern_file(&line.file);
            let entry = fresh.line_to_seeds.entry(pack(file_id, line.line)).or_default();
            for seed in seeds {
                if !entry.contains(&seed) {
                    entry.push(seed);
                }
            }
        }
        *self.inner.write().unwrap() = fresh;
        Ok(())
    }
}
