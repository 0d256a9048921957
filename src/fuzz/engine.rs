//! The constraint-solving fuzzing loop.
//!
//! Each iteration: pick an uncovered basic block, load a base seed next to
//! it, ask the LLM for a program that reaches it, compile, measure, record
//! coverage, consult the oracle, and retry with compiler diagnostics or
//! divergence context when the attempt misses. Non-fatal failures are
//! absorbed inside the iteration; the counter always advances.

use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use libafl_bolts::rands::{Rand, StdRand};

use crate::cfg::{CfgAnalyzer, TargetInfo};
use crate::config::FuzzConfig;
use crate::coverage::CoverageMapping;
use crate::divergence::DivergenceAnalyzer;
use crate::external::{Compiler, CoverageTool, LlmClient, Oracle};
use crate::fuzz::corpus::SeedCorpus;
use crate::fuzz::jsonl::{BugRecord, JsonlWriter};
use crate::fuzz::seed::{now_ts_secs, FuzzResult, OracleVerdict, Seed};
use crate::prompt::{self, CompileErrorInfo, DivergenceInfo, TargetContext};

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_BOLD_RED: &str = "\x1b[1;31m";
const ANSI_BOLD_GREEN: &str = "\x1b[1;32m";

fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

fn ansi_enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none()
        && std::env::var("TERM").map(|term| term != "dumb").unwrap_or(true)
}

fn colorize(text: &str, code: &str) -> String {
    if ansi_enabled() {
        format!("{code}{text}{ANSI_RESET}")
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub iterations: u64,
    pub target_hits: u64,
    pub llm_failures: u64,
    pub compile_failures: u64,
    pub oracle_skips: u64,
    pub bugs_found: u64,
}

enum Attempt {
    Hit,
    Miss,
    CompileFailed { output: String, exit_code: i32, code: String },
    LlmFailed,
}

pub struct FuzzEngine<C, V, L, O, S> {
    cfg: FuzzConfig,
    analyzer: CfgAnalyzer,
    mapping: Arc<CoverageMapping>,
    compiler: C,
    coverage: V,
    llm: L,
    oracle: Option<O>,
    divergence: Option<DivergenceAnalyzer>,
    corpus: S,

    stats: EngineStats,
    started: Instant,
    rand: StdRand,
    bug_writer: Option<JsonlWriter>,
    /// Seeds that went through a full evaluation and are retrievable from
    /// the corpus; the random phase draws from these.
    processed_seed_ids: Vec<u64>,
    last_base_seed_path: Option<PathBuf>,
    last_mutated_seed_path: Option<PathBuf>,
}

impl<C, V, L, O, S> FuzzEngine<C, V, L, O, S>
where
    C: Compiler,
    V: CoverageTool,
    L: LlmClient,
    O: Oracle,
    S: SeedCorpus,
{
    pub fn new(
        cfg: FuzzConfig,
        analyzer: CfgAnalyzer,
        compiler: C,
        coverage: V,
        llm: L,
        oracle: Option<O>,
        divergence: Option<DivergenceAnalyzer>,
        corpus: S,
    ) -> Self {
        let _ = fs::create_dir_all(&cfg.work_dir);
        let bug_writer = JsonlWriter::open_append(&cfg.work_dir.join("bugs.jsonl")).ok();
        let mapping = Arc::clone(analyzer.mapping());
        let rand = StdRand::with_seed(cfg.rng_seed);
        Self {
            cfg,
            analyzer,
            mapping,
            compiler,
            coverage,
            llm,
            oracle,
            divergence,
            corpus,
            stats: EngineStats::default(),
            started: Instant::now(),
            rand,
            bug_writer,
            processed_seed_ids: Vec::new(),
            last_base_seed_path: None,
            last_mutated_seed_path: None,
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn analyzer(&self) -> &CfgAnalyzer {
        &self.analyzer
    }

    pub fn corpus(&self) -> &S {
        &self.corpus
    }

    /// Drive the campaign: initial seeds, then the main loop until the
    /// iteration cap or coverage saturation, then one final save.
    pub fn run(&mut self) {
        self.started = Instant::now();
        self.process_initial_seeds();

        while self.stats.iterations < self.cfg.max_iterations {
            let covered = self.mapping.get_covered_lines();
            let Some(target) = self.analyzer.select_target(&covered) else {
                eprintln!("[engine] no uncovered reachable block left; coverage saturated");
                if self.cfg.enable_random_phase {
                    self.random_phase();
                }
                break;
            };

            let (hit, retries) = self.solve_constraint(&target);
            if hit {
                self.stats.target_hits += 1;
                self.analyzer.record_success(&target.function, target.bb_id);
            } else {
                self.analyzer.decay_bb_weight(&target.function, target.bb_id);
            }
            self.stats.iterations += 1;

            eprintln!(
                "[engine] iter={} target={}:bb{} hit={} retries={} coverage={}bp hits={} bugs={}",
                self.stats.iterations,
                target.function,
                target.bb_id,
                hit,
                retries,
                self.current_bp(),
                self.stats.target_hits,
                self.stats.bugs_found,
            );

            if self.stats.iterations % self.cfg.checkpoint_interval.max(1) == 0 {
                self.checkpoint();
            }
        }

        self.finalize_state();
    }

    /// Evaluate every pending seed so the mapping knows what the starting
    /// corpus already covers.
    fn process_initial_seeds(&mut self) {
        let mut processed = 0usize;
        while let Some(seed) = self.corpus.next() {
            self.evaluate_initial_seed(seed);
            processed += 1;
        }
        if processed > 0 {
            eprintln!(
                "[init] {processed} initial seed(s) evaluated, coverage {}bp, {} line(s)",
                self.current_bp(),
                self.mapping.total_covered_lines()
            );
        }
        self.checkpoint();
    }

    fn evaluate_initial_seed(&mut self, mut seed: Seed) {
        let old_bp = self.current_bp();
        let outcome = match self.compiler.compile(&seed) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("[init] seed {}: {e}", seed.id);
                return;
            }
        };
        if !outcome.success {
            self.stats.compile_failures += 1;
            self.corpus.report_result(
                seed.id,
                FuzzResult {
                    compile_failed: true,
                    compiler_output: outcome.stderr,
                    exit_code: outcome.exit_code,
                    ..FuzzResult::default()
                },
            );
            return;
        }
        let report = match self.coverage.measure(&seed) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("[init] seed {}: {e}", seed.id);
                return;
            }
        };
        let lines = self.coverage.extract_covered_lines(&report);
        self.mapping.record_lines(&lines, seed.id);
        self.coverage.merge(&report);
        let new_bp = self.current_bp();

        let (verdict, bug) = self.run_oracle(&seed, &outcome);
        seed.old_coverage_bp = old_bp;
        seed.new_coverage_bp = new_bp;
        let id = seed.id;
        self.processed_seed_ids.push(id);
        self.record_bug(&seed, "", 0, verdict, bug.as_deref());
        self.corpus.report_result(
            id,
            FuzzResult {
                compile_failed: false,
                exit_code: outcome.exit_code,
                hit_target: false,
                covered_new: new_bp > old_bp,
                old_coverage_bp: old_bp,
                new_coverage_bp: new_bp,
                oracle_verdict: verdict,
                bug_description: bug,
                ..FuzzResult::default()
            },
        );
        self.corpus.update_total_coverage(new_bp);
    }

    /// One targeting round. Returns `(true, n)` when attempt n hit the
    /// target block, `(false, max_retries)` after the full retry budget.
    fn solve_constraint(&mut self, target: &TargetInfo) -> (bool, usize) {
        self.last_base_seed_path = None;
        self.last_mutated_seed_path = None;

        let base_seed = target.base_seed.and_then(|id| self.corpus.get(id));
        if let Some(base) = &base_seed {
            self.last_base_seed_path = self.write_seed_file(base).ok();
        }
        let base_code = base_seed.as_ref().map(|s| s.content.clone());

        let ctx = TargetContext {
            function: target.function.clone(),
            bb_id: target.bb_id,
            file: target.file.clone(),
            target_lines: target.lines.clone(),
            successor_count: target.successor_count,
            base_seed_id: base_seed.as_ref().map(|s| s.id),
            base_seed_code: base_code.clone(),
            source_excerpt_around_target: self.source_excerpt(&target.file, &target.lines),
        };

        let mut last = self.attempt(target, base_seed.as_ref(), prompt::constraint_prompt(&ctx));
        if matches!(last, Attempt::Hit) {
            return (true, 0);
        }

        for retry in 1..=self.cfg.max_retries {
            let prompts = match &last {
                Attempt::CompileFailed { output, exit_code, code } => prompt::compile_error_prompt(
                    &ctx,
                    &CompileErrorInfo {
                        failed_seed_code: code.clone(),
                        compiler_output: output.clone(),
                        exit_code: *exit_code,
                        retry_attempt: retry,
                        max_retries: self.cfg.max_retries,
                    },
                ),
                _ => match self.divergence_refinement(&base_code) {
                    Some(info) => prompt::refined_prompt(&ctx, &info),
                    None => prompt::constraint_prompt(&ctx),
                },
            };
            last = self.attempt(target, base_seed.as_ref(), prompts);
            if matches!(last, Attempt::Hit) {
                return (true, retry);
            }
        }
        (false, self.cfg.max_retries)
    }

    /// One LLM round trip plus seed evaluation.
    fn attempt(
        &mut self,
        target: &TargetInfo,
        base: Option<&Seed>,
        (system, user): (String, String),
    ) -> Attempt {
        let response = match self.llm.completion(&system, &user) {
            Ok(r) => r,
            Err(e) => {
                self.stats.llm_failures += 1;
                eprintln!("[engine] llm: {e}");
                return Attempt::LlmFailed;
            }
        };
        let content = match prompt::parse_llm_response(&response) {
            Ok(c) => c,
            Err(e) => {
                self.stats.llm_failures += 1;
                eprintln!("[engine] llm: {e}");
                return Attempt::LlmFailed;
            }
        };
        let id = self.corpus.allocate_id();
        let seed = match base {
            Some(parent) => Seed::child_of(id, parent, content),
            None => Seed::new(id, content),
        };
        self.try_seed(seed, target)
    }

    /// Compile, measure, record, judge. The strict per-iteration order is
    /// compile -> measure -> record coverage -> oracle -> admit to corpus.
    fn try_seed(&mut self, mut seed: Seed, target: &TargetInfo) -> Attempt {
        self.last_mutated_seed_path = self.write_seed_file(&seed).ok();

        let outcome = match self.compiler.compile(&seed) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("[engine] compiler wrapper: {e}");
                return Attempt::CompileFailed {
                    output: e.to_string(),
                    exit_code: -1,
                    code: seed.content,
                };
            }
        };
        if !outcome.success {
            self.stats.compile_failures += 1;
            self.corpus.report_result(
                seed.id,
                FuzzResult {
                    compile_failed: true,
                    compiler_output: outcome.stderr.clone(),
                    exit_code: outcome.exit_code,
                    ..FuzzResult::default()
                },
            );
            return Attempt::CompileFailed {
                output: outcome.stderr,
                exit_code: outcome.exit_code,
                code: seed.content,
            };
        }

        let report = match self.coverage.measure(&seed) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("[engine] coverage: {e}");
                return Attempt::Miss;
            }
        };
        let lines = self.coverage.extract_covered_lines(&report);
        let hit_target =
            lines.iter().any(|l| l.file == target.file && target.lines.contains(&l.line));

        let old_bp = self.current_bp();
        self.mapping.record_lines(&lines, seed.id);
        let new_bp = self.current_bp();
        self.coverage.merge(&report);
        let covered_new = new_bp > old_bp;

        let (verdict, bug) = self.run_oracle(&seed, &outcome);
        seed.old_coverage_bp = old_bp;
        seed.new_coverage_bp = new_bp;
        seed.oracle_verdict = verdict;
        seed.bug_description = bug.clone();

        let found_bug = verdict == OracleVerdict::Bug;
        self.record_bug(&seed, &target.function, target.bb_id, verdict, bug.as_deref());

        if covered_new || hit_target || found_bug {
            self.processed_seed_ids.push(seed.id);
            self.corpus.add(seed.clone());
        }
        self.corpus.report_result(
            seed.id,
            FuzzResult {
                compile_failed: false,
                compiler_output: String::new(),
                exit_code: outcome.exit_code,
                hit_target,
                covered_new,
                old_coverage_bp: old_bp,
                new_coverage_bp: new_bp,
                oracle_verdict: verdict,
                bug_description: bug,
            },
        );
        self.corpus.update_total_coverage(new_bp);

        if hit_target {
            Attempt::Hit
        } else {
            Attempt::Miss
        }
    }

    /// Post-saturation phase: free-form mutations of known seeds, kept only
    /// when the oracle flags a bug. Coverage does not grow the corpus here.
    fn random_phase(&mut self) {
        if self.processed_seed_ids.is_empty() {
            return;
        }
        eprintln!("[random] entering random mutation phase");
        while self.stats.iterations < self.cfg.max_iterations {
            self.stats.iterations += 1;
            let idx = self.rand.below(nz(self.processed_seed_ids.len()));
            let pick = self.processed_seed_ids[idx];
            let Some(base) = self.corpus.get(pick) else {
                continue;
            };

            let (system, user) = prompt::random_mutation_prompt(&base.content, self.current_bp());
            let response = match self.llm.completion(&system, &user) {
                Ok(r) => r,
                Err(e) => {
                    self.stats.llm_failures += 1;
                    eprintln!("[random] llm: {e}");
                    continue;
                }
            };
            let Ok(content) = prompt::parse_llm_response(&response) else {
                self.stats.llm_failures += 1;
                continue;
            };

            let id = self.corpus.allocate_id();
            let mut seed = Seed::child_of(id, &base, content);
            let outcome = match self.compiler.compile(&seed) {
                Ok(o) if o.success => o,
                Ok(_) => {
                    self.stats.compile_failures += 1;
                    continue;
                }
                Err(e) => {
                    eprintln!("[random] compiler wrapper: {e}");
                    continue;
                }
            };

            let (verdict, bug) = self.run_oracle(&seed, &outcome);
            if verdict == OracleVerdict::Bug {
                seed.oracle_verdict = verdict;
                seed.bug_description = bug.clone();
                self.record_bug(&seed, "", 0, verdict, bug.as_deref());
                self.corpus.add(seed);
                self.corpus.report_result(
                    id,
                    FuzzResult {
                        oracle_verdict: verdict,
                        bug_description: bug,
                        ..FuzzResult::default()
                    },
                );
            }

            if self.stats.iterations % self.cfg.checkpoint_interval.max(1) == 0 {
                self.checkpoint();
            }
        }
    }

    fn run_oracle(
        &mut self,
        seed: &Seed,
        outcome: &crate::external::CompileOutcome,
    ) -> (OracleVerdict, Option<String>) {
        match self.oracle.as_mut() {
            None => (OracleVerdict::Skipped, None),
            Some(oracle) => match oracle.analyze(seed, outcome) {
                Ok(Some(bug)) => (OracleVerdict::Bug, Some(bug.description)),
                Ok(None) => (OracleVerdict::Normal, None),
                Err(e) => {
                    self.stats.oracle_skips += 1;
                    eprintln!("[engine] oracle: {e}");
                    (OracleVerdict::Skipped, None)
                }
            },
        }
    }

    fn record_bug(
        &mut self,
        seed: &Seed,
        function: &str,
        bb_id: u32,
        verdict: OracleVerdict,
        description: Option<&str>,
    ) {
        if verdict != OracleVerdict::Bug {
            return;
        }
        self.stats.bugs_found += 1;
        eprintln!(
            "{} seed={} target={}:bb{} {}",
            colorize("[BUG]", ANSI_BOLD_RED),
            seed.id,
            function,
            bb_id,
            description.unwrap_or(""),
        );
        if let Some(writer) = &self.bug_writer {
            let record = BugRecord {
                seed_id: seed.id,
                function: function.to_string(),
                bb_id,
                verdict,
                description: description.unwrap_or("").to_string(),
                found_at: now_ts_secs(),
            };
            if let Err(e) = writer.append_json_line(&record) {
                eprintln!("[engine] bug log: {e}");
            }
        }
    }

    /// Divergence-guided refinement for the current base/mutated pair;
    /// best-effort, any trace failure just drops the extra context.
    fn divergence_refinement(&mut self, base_code: &Option<String>) -> Option<DivergenceInfo> {
        let base = self.last_base_seed_path.clone()?;
        let mutated = self.last_mutated_seed_path.clone()?;
        let analyzer = self.divergence.as_mut()?;
        let point = match analyzer.analyze(&base, &mutated, &self.cfg.compiler_path) {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(e) => {
                eprintln!("[engine] divergence: {e}");
                return None;
            }
        };
        let divergent_function_code = self.divergent_excerpt(&point.function_1);
        Some(DivergenceInfo {
            point,
            divergent_function_code,
            base_seed_code: base_code.clone().unwrap_or_default(),
            mutated_seed_code: fs::read_to_string(&mutated).unwrap_or_default(),
        })
    }

    /// Body of a divergent function, cut from the compiler source by the
    /// line span of its basic blocks.
    fn divergent_excerpt(&self, function: &str) -> Option<String> {
        let (file, lo, hi) = self.analyzer.function_line_span(function)?;
        read_line_range(&file, lo, hi, 160)
    }

    fn source_excerpt(&self, file: &str, lines: &[u32]) -> Option<String> {
        let lo = *lines.iter().min()?;
        let hi = *lines.iter().max()?;
        read_line_range(file, lo.saturating_sub(5).max(1), hi + 5, 120)
    }

    fn current_bp(&self) -> u32 {
        self.analyzer
            .bb_coverage_basis_points(&self.cfg.target_functions, &self.mapping.get_covered_lines())
    }

    fn write_seed_file(&self, seed: &Seed) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.cfg.work_dir)?;
        let path = self.cfg.work_dir.join(format!("seed_{:06}.c", seed.id));
        fs::write(&path, &seed.content)?;
        Ok(path)
    }

    fn checkpoint(&mut self) {
        if let Err(e) = self.mapping.save(&self.cfg.mapping_path) {
            eprintln!("[engine] mapping checkpoint: {e}");
        }
        if let Err(e) = self.corpus.save() {
            eprintln!("[engine] corpus checkpoint: {e}");
        }
    }

    /// One last save of mapping and corpus; also run on signal-driven exits
    /// by the binary.
    pub fn finalize_state(&mut self) {
        self.checkpoint();
        if let Err(e) = self.corpus.finalize() {
            eprintln!("[engine] corpus finalize: {e}");
        }
        if let Some(divergence) = self.divergence.as_mut() {
            divergence.cleanup();
        }
        let line = format!(
            "[DONE] iters={} hits={} bugs={} coverage={}bp elapsed={}s",
            self.stats.iterations,
            self.stats.target_hits,
            self.stats.bugs_found,
            self.current_bp(),
            self.started.elapsed().as_secs(),
        );
        let color = if self.stats.bugs_found > 0 { ANSI_BOLD_RED } else { ANSI_BOLD_GREEN };
        eprintln!("{}", colorize(&line, color));
    }
}

fn read_line_range(file: &str, lo: u32, hi: u32, cap: usize) -> Option<String> {
    let body = fs::read_to_string(file).ok()?;
    let selected: Vec<&str> = body
        .lines()
        .enumerate()
        .filter(|(i, _)| {
            let line_no = (*i + 1) as u32;
            line_no >= lo && line_no <= hi
        })
        .take(cap)
        .map(|(_, l)| l)
        .collect();
    if selected.is_empty() {
        return None;
    }
    Some(selected.join("\n"))
}
