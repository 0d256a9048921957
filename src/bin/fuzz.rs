//! Campaign driver wiring the core engine to command-backed collaborators.
//!
//! The external contracts stay outside the core: the compiler wrapper, the
//! coverage reporter, the oracle and the LLM bridge are each an executable
//! the operator supplies. Protocols:
//!
//! - compiler cmd:  `<cmd> <seed.c>`; exit 0 = compiled (instrumentation is
//!   expected to drop coverage data as a side effect).
//! - coverage cmd:  `<cmd> <seed.c>`; stdout = one `file:line` per line.
//! - oracle cmd:    `<cmd> <seed.c>`; nonzero exit = bug, stderr/stdout is
//!   the description.
//! - llm cmd:       JSON `{"system": ..., "user": ...}` on stdin, the
//!   completion text on stdout.
//!
//! Usage:
//!   magpie-fuzz --cfg-dump unit.c.015t.cfg --target-function expand_binop \
//!       --compiler ./gcc-wrapper --compiler-cmd ./compile.sh \
//!       --coverage-cmd ./gcov-lines.sh --llm-cmd ./llm-bridge \
//!       [--oracle-cmd ./oracle.sh] [--seed-dir seeds/] [--uftrace] ...

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{exit, Command, Stdio};
use std::sync::Arc;

use magpie_core::cfg::analyzer::AnalyzerOptions;
use magpie_core::cfg::parse_cfg_dump;
use magpie_core::config::FuzzConfig;
use magpie_core::coverage::LineId;
use magpie_core::error::{CompilerError, CoverageToolError, LlmError, OracleError};
use magpie_core::external::{Bug, CompileOutcome, Compiler, CoverageTool, LlmClient, Oracle};
use magpie_core::fuzz::corpus::SeedCorpus;
use magpie_core::fuzz::seed::Seed;
use magpie_core::{CfgAnalyzer, CoverageMapping, DivergenceAnalyzer, FuzzEngine, JsonlCorpus, UftraceTool};

// ─── Command-backed collaborators ────────────────────────────────────────────

/// Writes the seed next to the work dir and hands it to the wrapper script.
struct CommandCompiler {
    cmd: PathBuf,
    scratch: PathBuf,
}

impl CommandCompiler {
    fn seed_path(&self, seed: &Seed) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(&self.scratch)?;
        let path = self.scratch.join(format!("compile_{:06}.c", seed.id));
        fs::write(&path, &seed.content)?;
        Ok(path)
    }
}

impl Compiler for CommandCompiler {
    fn compile(&mut self, seed: &Seed) -> Result<CompileOutcome, CompilerError> {
        let path = self.seed_path(seed).map_err(|e| CompilerError(e.to_string()))?;
        let output = Command::new(&self.cmd)
            .arg(&path)
            .output()
            .map_err(|e| CompilerError(format!("{}: {e}", self.cmd.display())))?;
        Ok(CompileOutcome {
            success: output.status.success(),
            binary_path: None,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Report = the covered lines plus the raw report bytes.
struct CommandCoverage {
    cmd: PathBuf,
    scratch: PathBuf,
    baseline: HashSet<LineId>,
}

struct CommandReport {
    lines: Vec<LineId>,
    raw: Vec<u8>,
}

impl CoverageTool for CommandCoverage {
    type Report = CommandReport;

    fn measure(&mut self, seed: &Seed) -> Result<Self::Report, CoverageToolError> {
        let path = self.scratch.join(format!("compile_{:06}.c", seed.id));
        let output = Command::new(&self.cmd)
            .arg(&path)
            .output()
            .map_err(|e| CoverageToolError(format!("{}: {e}", self.cmd.display())))?;
        if !output.status.success() {
            return Err(CoverageToolError(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let lines = text.lines().filter_map(LineId::parse).collect();
        Ok(CommandReport { lines, raw: output.stdout })
    }

    fn has_increased(&self, report: &Self::Report) -> bool {
        report.lines.iter().any(|l| !self.baseline.contains(l))
    }

    fn merge(&mut self, report: &Self::Report) {
        self.baseline.extend(report.lines.iter().cloned());
    }

    fn extract_covered_lines(&self, report: &Self::Report) -> Vec<LineId> {
        report.lines.clone()
    }

    fn report_bytes(&self, report: &Self::Report) -> Vec<u8> {
        report.raw.clone()
    }
}

struct CommandOracle {
    cmd: PathBuf,
    scratch: PathBuf,
}

impl Oracle for CommandOracle {
    fn analyze(&mut self, seed: &Seed, _compile: &CompileOutcome) -> Result<Option<Bug>, OracleError> {
        let path = self.scratch.join(format!("compile_{:06}.c", seed.id));
        let output = Command::new(&self.cmd)
            .arg(&path)
            .output()
            .map_err(|e| OracleError(format!("{}: {e}", self.cmd.display())))?;
        if output.status.success() {
            return Ok(None);
        }
        let mut description = String::from_utf8_lossy(&output.stderr).into_owned();
        if description.trim().is_empty() {
            description = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        Ok(Some(Bug { description: description.trim().to_string() }))
    }
}

struct CommandLlm {
    cmd: PathBuf,
}

impl LlmClient for CommandLlm {
    fn completion(&mut self, system: &str, user: &str) -> Result<String, LlmError> {
        let mut child = Command::new(&self.cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| LlmError::Completion(format!("{}: {e}", self.cmd.display())))?;
        let request = serde_json::json!({ "system": system, "user": user });
        child
            .stdin
            .take()
            .ok_or_else(|| LlmError::Completion("no stdin handle".to_string()))?
            .write_all(request.to_string().as_bytes())
            .map_err(|e| LlmError::Completion(e.to_string()))?;
        let output =
            child.wait_with_output().map_err(|e| LlmError::Completion(e.to_string()))?;
        if !output.status.success() {
            return Err(LlmError::Completion(format!(
                "bridge exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ─── CLI ─────────────────────────────────────────────────────────────────────

struct Args {
    cfg: FuzzConfig,
    corpus_path: PathBuf,
    seed_dir: Option<PathBuf>,
    compiler_cmd: PathBuf,
    coverage_cmd: PathBuf,
    llm_cmd: PathBuf,
    oracle_cmd: Option<PathBuf>,
    use_uftrace: bool,
}

fn usage() -> ! {
    eprintln!(
        "Usage: magpie-fuzz --cfg-dump FILE --target-function FN... \
--compiler PATH --compiler-cmd CMD --coverage-cmd CMD --llm-cmd CMD\n\
  [--oracle-cmd CMD] [--seed-dir DIR] [--corpus FILE] [--mapping FILE]\n\
  [--work-dir DIR] [--max-iterations N] [--max-retries N]\n\
  [--weight-decay F] [--divergence-context N] [--rng-seed N]\n\
  [--random-phase] [--uftrace]"
    );
    exit(2);
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut cfg = FuzzConfig::default();
    let mut corpus_path = PathBuf::from("out/corpus.jsonl");
    let mut seed_dir = None;
    let mut compiler_cmd = None;
    let mut coverage_cmd = None;
    let mut llm_cmd = None;
    let mut oracle_cmd = None;
    let mut use_uftrace = false;

    let mut i = 0;
    let value = |argv: &[String], i: &mut usize| -> String {
        *i += 1;
        if *i >= argv.len() {
            usage();
        }
        argv[*i].clone()
    };
    while i < argv.len() {
        match argv[i].as_str() {
            "--cfg-dump" => cfg.cfg_dump_path = PathBuf::from(value(&argv, &mut i)),
            "--target-function" => cfg.target_functions.push(value(&argv, &mut i)),
            "--compiler" => cfg.compiler_path = PathBuf::from(value(&argv, &mut i)),
            "--mapping" => cfg.mapping_path = PathBuf::from(value(&argv, &mut i)),
            "--work-dir" => cfg.work_dir = PathBuf::from(value(&argv, &mut i)),
            "--max-iterations" => {
                cfg.max_iterations = value(&argv, &mut i).parse().unwrap_or_else(|_| usage())
            }
            "--max-retries" => {
                cfg.max_retries = value(&argv, &mut i).parse().unwrap_or_else(|_| usage())
            }
            "--weight-decay" => {
                cfg.weight_decay = value(&argv, &mut i).parse().unwrap_or_else(|_| usage())
            }
            "--divergence-context" => {
                cfg.divergence_context = value(&argv, &mut i).parse().unwrap_or_else(|_| usage())
            }
            "--rng-seed" => cfg.rng_seed = value(&argv, &mut i).parse().unwrap_or_else(|_| usage()),
            "--random-phase" => cfg.enable_random_phase = true,
            "--uftrace" => use_uftrace = true,
            "--corpus" => corpus_path = PathBuf::from(value(&argv, &mut i)),
            "--seed-dir" => seed_dir = Some(PathBuf::from(value(&argv, &mut i))),
            "--compiler-cmd" => compiler_cmd = Some(PathBuf::from(value(&argv, &mut i))),
            "--coverage-cmd" => coverage_cmd = Some(PathBuf::from(value(&argv, &mut i))),
            "--llm-cmd" => llm_cmd = Some(PathBuf::from(value(&argv, &mut i))),
            "--oracle-cmd" => oracle_cmd = Some(PathBuf::from(value(&argv, &mut i))),
            other => {
                eprintln!("unknown flag: {other}");
                usage();
            }
        }
        i += 1;
    }

    if cfg.cfg_dump_path.as_os_str().is_empty() || cfg.target_functions.is_empty() {
        usage();
    }
    let (Some(compiler_cmd), Some(coverage_cmd), Some(llm_cmd)) =
        (compiler_cmd, coverage_cmd, llm_cmd)
    else {
        usage();
    };
    Args { cfg, corpus_path, seed_dir, compiler_cmd, coverage_cmd, llm_cmd, oracle_cmd, use_uftrace }
}

/// Seed an empty corpus from a directory of .c files, oldest name first.
fn load_seed_dir(corpus: &mut JsonlCorpus, dir: &Path) -> std::io::Result<usize> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|x| x == "c").unwrap_or(false))
        .collect();
    paths.sort();
    let mut loaded = 0;
    for path in paths {
        let content = fs::read_to_string(&path)?;
        let id = corpus.allocate_id();
        corpus.add(Seed::new(id, content));
        loaded += 1;
    }
    Ok(loaded)
}

fn main() {
    let args = parse_args();
    let cfg = args.cfg.clone();

    let functions = match parse_cfg_dump(&cfg.cfg_dump_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {e}");
            exit(1);
        }
    };

    let mapping = Arc::new(CoverageMapping::new(cfg.rng_seed));
    if cfg.mapping_path.exists() {
        match mapping.load_from(&cfg.mapping_path) {
            Ok(()) => eprintln!(
                "[main] resumed mapping with {} covered line(s)",
                mapping.total_covered_lines()
            ),
            Err(e) => {
                eprintln!("error: {e}");
                exit(1);
            }
        }
    }

    let analyzer = match CfgAnalyzer::new(
        functions,
        cfg.target_functions.clone(),
        mapping,
        AnalyzerOptions { weight_decay: cfg.weight_decay, rng_seed: cfg.rng_seed },
    ) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("error: {e}");
            exit(1);
        }
    };

    let mut corpus = match JsonlCorpus::open(&args.corpus_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            exit(1);
        }
    };
    if corpus.is_empty() {
        if let Some(dir) = &args.seed_dir {
            match load_seed_dir(&mut corpus, dir) {
                Ok(n) => eprintln!("[main] loaded {n} initial seed(s) from {}", dir.display()),
                Err(e) => {
                    eprintln!("error: reading {}: {e}", dir.display());
                    exit(1);
                }
            }
        }
    }

    let divergence = args
        .use_uftrace
        .then(|| DivergenceAnalyzer::new(Box::new(UftraceTool::default()), cfg.divergence_context));

    let scratch = cfg.work_dir.join("scratch");
    let compiler = CommandCompiler { cmd: args.compiler_cmd, scratch: scratch.clone() };
    let coverage = CommandCoverage {
        cmd: args.coverage_cmd,
        scratch: scratch.clone(),
        baseline: HashSet::new(),
    };
    let llm = CommandLlm { cmd: args.llm_cmd };
    let oracle = args.oracle_cmd.map(|cmd| CommandOracle { cmd, scratch });

    let mut engine =
        FuzzEngine::new(cfg, analyzer, compiler, coverage, llm, oracle, divergence, corpus);
    engine.run();
}
