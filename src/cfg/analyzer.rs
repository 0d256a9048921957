//! Basic-block/line indexing and weighted frontier targeting.
//!
//! The analyzer owns the parsed function model and the per-BB weight table
//! for the lifetime of a campaign. Weights start at the outgoing branching
//! factor and only ever decay; selection walks the uncovered frontier and
//! breaks weight ties with the analyzer's own seeded RNG.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use libafl_bolts::rands::{Rand, StdRand};

use crate::cfg::{BasicBlock, CfgFunction};
use crate::config::{DEFAULT_RNG_SEED, DEFAULT_WEIGHT_DECAY};
use crate::coverage::{CoverageMapping, LineId};
use crate::error::{CoverageMappingError, TargetFunctionUnknown};

fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

fn pack(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerOptions {
    /// Factor in (0, 1] applied to a BB's weight after a failed round.
    pub weight_decay: f64,
    pub rng_seed: u64,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self { weight_decay: DEFAULT_WEIGHT_DECAY, rng_seed: DEFAULT_RNG_SEED }
    }
}

/// Targeting state of one basic block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BbWeightInfo {
    pub attempts: u32,
    pub weight: f64,
}

/// One selection round's outcome; consumed by the engine, never stored.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub function: String,
    pub bb_id: u32,
    pub successor_count: usize,
    pub lines: Vec<u32>,
    pub file: String,
    pub base_seed: Option<u64>,
    pub base_seed_line: Option<u32>,
    pub distance_from_base: u32,
}

#[derive(Debug)]
pub struct CfgAnalyzer {
    functions: BTreeMap<String, CfgFunction>,
    targets: Vec<String>,
    mapping: Arc<CoverageMapping>,

    fn_ids: HashMap<String, u32>,
    file_ids: HashMap<String, u32>,
    /// (file id, line) -> blocks annotated with that line, across functions.
    line_index: HashMap<u64, Vec<(u32, u32)>>,
    /// (function id, bb id) -> weight state, for every materialized block.
    weights: HashMap<u64, BbWeightInfo>,

    weight_decay: f64,
    rand: StdRand,
}

impl CfgAnalyzer {
    pub fn new(
        functions: BTreeMap<String, CfgFunction>,
        target_functions: Vec<String>,
        mapping: Arc<CoverageMapping>,
        options: AnalyzerOptions,
    ) -> Result<Self, TargetFunctionUnknown> {
        for name in &target_functions {
            if !functions.contains_key(name) {
                return Err(TargetFunctionUnknown(name.clone()));
            }
        }

        let mut fn_ids = HashMap::new();
        let mut file_ids = HashMap::new();
        let mut line_index: HashMap<u64, Vec<(u32, u32)>> = HashMap::new();
        let mut weights = HashMap::new();

        for (fn_idx, (name, func)) in functions.iter().enumerate() {
            let fid = fn_idx as u32;
            fn_ids.insert(name.clone(), fid);
            for (&bb_id, block) in &func.blocks {
                weights.insert(
                    pack(fid, bb_id),
                    BbWeightInfo { attempts: 0, weight: block.successors.len() as f64 },
                );
                if block.lines.is_empty() {
                    continue;
                }
                let next_file_id = file_ids.len() as u32;
                let file_id = *file_ids.entry(block.file.clone()).or_insert(next_file_id);
                for &line in &block.lines {
                    line_index.entry(pack(file_id, line)).or_default().push((fid, bb_id));
                }
            }
        }

        Ok(Self {
            functions,
            targets: target_functions,
            mapping,
            fn_ids,
            file_ids,
            line_index,
            weights,
            weight_decay: options.weight_decay,
            rand: StdRand::with_seed(options.rng_seed),
        })
    }

    pub fn get_function(&self, name: &str) -> Option<&CfgFunction> {
        self.functions.get(name)
    }

    pub fn mapping(&self) -> &Arc<CoverageMapping> {
        &self.mapping
    }

    /// Ids of blocks annotated with (file, line), in any function.
    pub fn basic_blocks_for_line(&self, file: &str, line: u32) -> Vec<u32> {
        let Some(&file_id) = self.file_ids.get(file) else {
            return Vec::new();
        };
        self.line_index
            .get(&pack(file_id, line))
            .map(|v| v.iter().map(|&(_, bb)| bb).collect())
            .unwrap_or_default()
    }

    pub fn successor_count(&self, function: &str, bb_id: u32) -> usize {
        self.functions
            .get(function)
            .and_then(|f| f.succs.get(&bb_id))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Pick the next basic block to attack, or none once every reachable
    /// target BB is fully line-covered.
    ///
    /// A candidate BB must (a) not be a sentinel, (b) still have an
    /// uncovered line, and (c) sit on the frontier: no resolved
    /// predecessors at all, or at least one predecessor with a covered
    /// line. Among the highest-weighted candidates one is drawn uniformly.
    pub fn select_target(&mut self, covered_lines: &HashSet<LineId>) -> Option<TargetInfo> {
        let covered = self.pack_covered(covered_lines);

        let mut candidates: Vec<(String, u32, f64)> = Vec::new();
        for name in &self.targets {
            let func = &self.functions[name];
            let fid = self.fn_ids[name];
            for (&bb_id, block) in &func.blocks {
                if bb_id <= 1 {
                    continue;
                }
                if !self.block_has_uncovered_line(block, &covered) {
                    continue;
                }
                let resolved = func.resolved_predecessors(bb_id);
                let reachable = resolved.is_empty()
                    || resolved.iter().any(|p| {
                        func.blocks
                            .get(p)
                            .map(|b| self.block_any_covered(b, &covered))
                            .unwrap_or(false)
                    });
                if !reachable {
                    continue;
                }
                let weight = self
                    .weights
                    .get(&pack(fid, bb_id))
                    .map(|i| i.weight)
                    .unwrap_or(0.0);
                candidates.push((name.clone(), bb_id, weight));
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let w_max = candidates.iter().map(|c| c.2).fold(f64::NEG_INFINITY, f64::max);
        let top: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.2 == w_max)
            .map(|(i, _)| i)
            .collect();
        let (name, bb_id, _) = candidates[top[self.rand.below(nz(top.len()))]].clone();

        let func = &self.functions[&name];
        let block = &func.blocks[&bb_id];
        let (base_seed, base_seed_line, distance_from_base) =
            self.pick_base_seed(func, bb_id, &covered);

        Some(TargetInfo {
            function: name,
            bb_id,
            successor_count: block.successors.len(),
            lines: block.lines.clone(),
            file: block.file.clone(),
            base_seed,
            base_seed_line,
            distance_from_base,
        })
    }

    /// Resolved predecessors of (function, bb) that carry a covered line.
    pub fn get_covered_predecessors(
        &self,
        function: &str,
        bb_id: u32,
        covered_lines: &HashSet<LineId>,
    ) -> Vec<u32> {
        let covered = self.pack_covered(covered_lines);
        let Some(func) = self.functions.get(function) else {
            return Vec::new();
        };
        func.resolved_predecessors(bb_id)
            .into_iter()
            .filter(|p| {
                func.blocks
                    .get(p)
                    .map(|b| self.block_any_covered(b, &covered))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// One failed targeting round: bump the attempt counter, decay the
    /// weight. Weights never recover.
    pub fn decay_bb_weight(&mut self, function: &str, bb_id: u32) {
        let Some(&fid) = self.fn_ids.get(function) else {
            return;
        };
        if let Some(info) = self.weights.get_mut(&pack(fid, bb_id)) {
            info.attempts += 1;
            info.weight *= self.weight_decay;
        }
    }

    /// A hit resets the attempt counter only; the decayed weight stands.
    pub fn record_success(&mut self, function: &str, bb_id: u32) {
        let Some(&fid) = self.fn_ids.get(function) else {
            return;
        };
        if let Some(info) = self.weights.get_mut(&pack(fid, bb_id)) {
            info.attempts = 0;
        }
    }

    pub fn weight_info(&self, function: &str, bb_id: u32) -> Option<BbWeightInfo> {
        let &fid = self.fn_ids.get(function)?;
        self.weights.get(&pack(fid, bb_id)).copied()
    }

    /// Covered BBs per ten thousand across `target_functions`, sentinels
    /// excluded. A BB counts as covered once any of its lines is.
    pub fn bb_coverage_basis_points(
        &self,
        target_functions: &[String],
        covered_lines: &HashSet<LineId>,
    ) -> u32 {
        let covered = self.pack_covered(covered_lines);
        let mut total: u64 = 0;
        let mut hit: u64 = 0;
        for name in target_functions {
            let Some(func) = self.functions.get(name) else {
                continue;
            };
            for (&bb_id, block) in &func.blocks {
                if bb_id <= 1 {
                    continue;
                }
                total += 1;
                if self.block_any_covered(block, &covered) {
                    hit += 1;
                }
            }
        }
        if total == 0 {
            return 0;
        }
        (hit * 10_000 / total) as u32
    }

    /// Source span of a function: (file, first line, last line) over all of
    /// its blocks. Used to excerpt a divergent function's body.
    pub fn function_line_span(&self, name: &str) -> Option<(String, u32, u32)> {
        let func = self.functions.get(name)?;
        let mut span: Option<(String, u32, u32)> = None;
        for block in func.blocks.values() {
            for &line in &block.lines {
                span = Some(match span {
                    None => (block.file.clone(), line, line),
                    Some((file, lo, hi)) => (file, lo.min(line), hi.max(line)),
                });
            }
        }
        span
    }

    pub fn save_mapping(&self, path: &Path) -> Result<(), CoverageMappingError> {
        self.mapping.save(path)
    }

    pub fn load_mapping(&self, path: &Path) -> Result<(), CoverageMappingError> {
        self.mapping.load_from(path)
    }

    fn pack_covered(&self, covered_lines: &HashSet<LineId>) -> HashSet<u64> {
        covered_lines
            .iter()
            .filter_map(|l| self.file_ids.get(&l.file).map(|&fid| pack(fid, l.line)))
            .collect()
    }

    fn line_is_covered(&self, block: &BasicBlock, line: u32, covered: &HashSet<u64>) -> bool {
        self.file_ids
            .get(&block.file)
            .map(|&fid| covered.contains(&pack(fid, line)))
            .unwrap_or(false)
    }

    fn block_any_covered(&self, block: &BasicBlock, covered: &HashSet<u64>) -> bool {
        block.lines.iter().any(|&l| self.line_is_covered(block, l, covered))
    }

    fn block_has_uncovered_line(&self, block: &BasicBlock, covered: &HashSet<u64>) -> bool {
        block.lines.iter().any(|&l| !self.line_is_covered(block, l, covered))
    }

    /// Base-seed choice for a selected target: a random seed covering a
    /// line of a covered predecessor (distance 1); for entry blocks with
    /// no such predecessor, any covered line of the same function
    /// (distance 0).
    fn pick_base_seed(
        &self,
        func: &CfgFunction,
        bb_id: u32,
        covered: &HashSet<u64>,
    ) -> (Option<u64>, Option<u32>, u32) {
        let resolved = func.resolved_predecessors(bb_id);
        for p in &resolved {
            let Some(pred) = func.blocks.get(p) else {
                continue;
            };
            for &line in &pred.lines {
                if !self.line_is_covered(pred, line, covered) {
                    continue;
                }
                let id = LineId::new(pred.file.clone(), line);
                if let Some(seed) = self.mapping.get_seed_for_line(&id) {
                    return (Some(seed), Some(line), 1);
                }
            }
        }
        if resolved.is_empty() {
            for block in func.blocks.values() {
                for &line in &block.lines {
                    if !self.line_is_covered(block, line, covered) {
                        continue;
                    }
                    let id = LineId::new(block.file.clone(), line);
                    if let Some(seed) = self.mapping.get_seed_for_line(&id) {
                        return (Some(seed), Some(line), 0);
                    }
                }
            }
        }
        (None, None, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::parser::parse_cfg_text;
    use crate::cfg::testutil::SAMPLE_DUMP;

    fn sample_analyzer(mapping: Arc<CoverageMapping>) -> CfgAnalyzer {
        CfgAnalyzer::new(
            parse_cfg_text(SAMPLE_DUMP),
            vec!["test_func".to_string(), "another_func".to_string()],
            mapping,
            AnalyzerOptions::default(),
        )
        .unwrap()
    }

    fn targets() -> Vec<String> {
        vec!["test_func".to_string(), "another_func".to_string()]
    }

    #[test]
    fn unknown_target_function_is_fatal() {
        let err = CfgAnalyzer::new(
            parse_cfg_text(SAMPLE_DUMP),
            vec!["no_such_func".to_string()],
            Arc::new(CoverageMapping::new(1)),
            AnalyzerOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.0, "no_such_func");
    }

    #[test]
    fn empty_coverage_selects_widest_entry_block() {
        // another_func BB2 branches three ways and outweighs test_func BB2.
        let mut a = sample_analyzer(Arc::new(CoverageMapping::new(1)));
        let t = a.select_target(&HashSet::new()).unwrap();
        assert_eq!(t.function, "another_func");
        assert_eq!(t.bb_id, 2);
        assert_eq!(t.successor_count, 3);
        assert_eq!(t.lines, vec![20]);
        assert_eq!(t.file, "t.c");
        assert_eq!(t.base_seed, None);
    }

    #[test]
    fn covering_a_block_shifts_selection() {
        let mapping = Arc::new(CoverageMapping::new(1));
        mapping.record_line(&LineId::new("t.c", 20), 7);
        let mut a = sample_analyzer(mapping.clone());
        // another_func BB2 has no uncovered line left; its children weigh 1
        // each, so test_func BB2 (weight 2) wins.
        let t = a.select_target(&mapping.get_covered_lines()).unwrap();
        assert_eq!(t.function, "test_func");
        assert_eq!(t.bb_id, 2);
        assert_eq!(t.successor_count, 2);
        // test_func has no coverage at all, so no base seed exists.
        assert_eq!(t.base_seed, None);
        assert_eq!(t.distance_from_base, 0);
    }

    #[test]
    fn base_seed_comes_from_a_covered_predecessor() {
        let mapping = Arc::new(CoverageMapping::new(1));
        mapping.record_line(&LineId::new("t.c", 20), 7);
        let mut a = sample_analyzer(mapping.clone());
        // Push test_func BB2 out of contention so a child of the covered
        // another_func BB2 is selected.
        for _ in 0..16 {
            a.decay_bb_weight("test_func", 2);
        }
        let t = a.select_target(&mapping.get_covered_lines()).unwrap();
        assert_eq!(t.function, "another_func");
        assert!([3, 4, 5].contains(&t.bb_id));
        assert_eq!(t.base_seed, Some(7));
        assert_eq!(t.base_seed_line, Some(20));
        assert_eq!(t.distance_from_base, 1);
    }

    #[test]
    fn decay_breaks_ties_deterministically() {
        // Two entry blocks, both weight 2; one decays to ~0.0036.
        let dump = "\
;; Function alpha (alpha, funcdef_no=0)

;; 0 succs { 2 }
;; 2 succs { 3 4 }
void alpha (void)
{
  <bb 2> :
  [p.c:5:1] a = 1;

}

;; Function beta (beta, funcdef_no=1)

;; 0 succs { 2 }
;; 2 succs { 3 4 }
void beta (void)
{
  <bb 2> :
  [p.c:15:1] b = 1;

}
";
        let mut a = CfgAnalyzer::new(
            parse_cfg_text(dump),
            vec!["alpha".to_string(), "beta".to_string()],
            Arc::new(CoverageMapping::new(1)),
            AnalyzerOptions { weight_decay: 0.9, rng_seed: 1 },
        )
        .unwrap();
        for _ in 0..64 {
            a.decay_bb_weight("alpha", 2);
        }
        let info = a.weight_info("alpha", 2).unwrap();
        assert_eq!(info.attempts, 64);
        assert!((info.weight - 2.0 * 0.9f64.powi(64)).abs() < 1e-12);
        for _ in 0..8 {
            let t = a.select_target(&HashSet::new()).unwrap();
            assert_eq!(t.function, "beta");
        }
    }

    #[test]
    fn decay_and_success_follow_the_weight_contract() {
        let mut a = sample_analyzer(Arc::new(CoverageMapping::new(1)));
        let initial = a.weight_info("another_func", 2).unwrap().weight;
        assert_eq!(initial, 3.0);
        for k in 1..=5u32 {
            a.decay_bb_weight("another_func", 2);
            let info = a.weight_info("another_func", 2).unwrap();
            assert_eq!(info.attempts, k);
            assert!((info.weight - initial * 0.8f64.powi(k as i32)).abs() < 1e-12);
        }
        let decayed = a.weight_info("another_func", 2).unwrap().weight;
        a.record_success("another_func", 2);
        let info = a.weight_info("another_func", 2).unwrap();
        assert_eq!(info.attempts, 0);
        assert_eq!(info.weight, decayed);
    }

    #[test]
    fn unreachable_blocks_stay_off_the_frontier() {
        let mapping = Arc::new(CoverageMapping::new(1));
        mapping.record_line(&LineId::new("t.c", 10), 1);
        let mut a = sample_analyzer(mapping.clone());
        // Only test_func BB2 is covered; BB5's predecessors (3, 4) are not,
        // so BB5 must never be selected. Decay the entry blocks so the
        // frontier children are what the draw rotates over.
        for _ in 0..32 {
            a.decay_bb_weight("test_func", 2);
            a.decay_bb_weight("another_func", 2);
        }
        for _ in 0..32 {
            let t = a.select_target(&mapping.get_covered_lines()).unwrap();
            assert!(
                !(t.function == "test_func" && t.bb_id == 5),
                "selected block behind an uncovered frontier"
            );
        }
    }

    #[test]
    fn covered_predecessors_are_reported() {
        let mapping = Arc::new(CoverageMapping::new(1));
        mapping.record_line(&LineId::new("t.c", 12), 4);
        let a = sample_analyzer(mapping.clone());
        let covered = mapping.get_covered_lines();
        assert_eq!(a.get_covered_predecessors("test_func", 5, &covered), vec![3]);
        assert!(a.get_covered_predecessors("test_func", 2, &covered).is_empty());
    }

    #[test]
    fn basis_points_grow_monotonically() {
        let mapping = Arc::new(CoverageMapping::new(1));
        let a = sample_analyzer(mapping.clone());
        // 9 non-sentinel blocks across both functions.
        assert_eq!(a.bb_coverage_basis_points(&targets(), &HashSet::new()), 0);
        let mut last = 0;
        for (line, seed) in [(20u32, 1u64), (10, 2), (21, 3), (25, 4)] {
            mapping.record_line(&LineId::new("t.c", line), seed);
            let bp = a.bb_coverage_basis_points(&targets(), &mapping.get_covered_lines());
            assert!(bp >= last);
            last = bp;
        }
        // 4 of 9 blocks covered.
        assert_eq!(last, 4 * 10_000 / 9);
    }

    #[test]
    fn saturated_targets_yield_no_selection() {
        let mapping = Arc::new(CoverageMapping::new(1));
        for line in [10, 11, 12, 14, 16, 20, 21, 22, 23, 25] {
            mapping.record_line(&LineId::new("t.c", line), 1);
        }
        let mut a = sample_analyzer(mapping.clone());
        assert!(a.select_target(&mapping.get_covered_lines()).is_none());
        assert_eq!(a.bb_coverage_basis_points(&targets(), &mapping.get_covered_lines()), 10_000);
    }

    #[test]
    fn line_index_and_successor_counts() {
        let a = sample_analyzer(Arc::new(CoverageMapping::new(1)));
        assert_eq!(a.basic_blocks_for_line("t.c", 20), vec![2]);
        assert_eq!(a.basic_blocks_for_line("t.c", 21), vec![3]);
        assert!(a.basic_blocks_for_line("t.c", 999).is_empty());
        assert!(a.basic_blocks_for_line("other.c", 20).is_empty());
        assert_eq!(a.successor_count("another_func", 2), 3);
        assert_eq!(a.successor_count("another_func", 0), 1);
        assert_eq!(a.successor_count("missing", 2), 0);
    }

    #[test]
    fn mapping_round_trips_through_the_analyzer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        let mapping = Arc::new(CoverageMapping::new(1));
        mapping.record_line(&LineId::new("t.c", 20), 7);
        let a = sample_analyzer(mapping);
        a.save_mapping(&path).unwrap();

        let fresh = sample_analyzer(Arc::new(CoverageMapping::new(1)));
        fresh.load_mapping(&path).unwrap();
        assert!(fresh.mapping().is_covered(&LineId::new("t.c", 20)));
        assert_eq!(fresh.mapping().get_seeds_for_line(&LineId::new("t.c", 20)), vec![7]);
    }

    #[test]
    fn function_span_covers_all_blocks() {
        let a = sample_analyzer(Arc::new(CoverageMapping::new(1)));
        let (file, lo, hi) = a.function_line_span("test_func").unwrap();
        assert_eq!(file, "t.c");
        assert_eq!((lo, hi), (10, 16));
        assert!(a.function_line_span("missing").is_none());
    }
}
