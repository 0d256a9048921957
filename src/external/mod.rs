//! Contracts for the external collaborators of the engine.
//!
//! The compiler wrapper, coverage report tooling, bug oracle and LLM client
//! are consumed through these traits only; the engine is generic over them
//! (no dynamic dispatch on the iteration path). The trace-record contract
//! lives with the divergence analyzer.

use std::path::PathBuf;

use crate::coverage::LineId;
use crate::error::{CompilerError, CoverageToolError, LlmError, OracleError};
use crate::fuzz::seed::Seed;

pub use crate::divergence::analyzer::TraceTool;

/// Result of one compile of a seed. A seed the compiler rejects is a
/// regular outcome, not an error; errors mean the wrapper itself broke.
#[derive(Debug, Clone, Default)]
pub struct CompileOutcome {
    pub success: bool,
    pub binary_path: Option<PathBuf>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// The compiler-under-test, instrumented so that compiling a seed drops
/// coverage data into a known build directory as a side effect.
pub trait Compiler {
    fn compile(&mut self, seed: &Seed) -> Result<CompileOutcome, CompilerError>;
}

/// Coverage report boundary. The report itself is opaque to the engine
/// apart from line extraction and a byte serialization.
pub trait CoverageTool {
    type Report;

    fn measure(&mut self, seed: &Seed) -> Result<Self::Report, CoverageToolError>;
    fn has_increased(&self, report: &Self::Report) -> bool;
    /// Fold `report` into the tool's accumulated baseline.
    fn merge(&mut self, report: &Self::Report);
    /// Covered lines, filtered to the campaign's target functions when the
    /// underlying format allows it.
    fn extract_covered_lines(&self, report: &Self::Report) -> Vec<LineId>;
    fn report_bytes(&self, report: &Self::Report) -> Vec<u8>;
}

#[derive(Debug, Clone)]
pub struct Bug {
    pub description: String,
}

/// Bug oracle. Free to re-execute the compiled binary internally (e.g.
/// under cross-architecture emulation); failures downgrade the verdict to
/// skipped rather than aborting the iteration.
pub trait Oracle {
    fn analyze(&mut self, seed: &Seed, compile: &CompileOutcome) -> Result<Option<Bug>, OracleError>;
}

/// Type placeholder for campaigns that run without an oracle; pass
/// `None::<NoOracle>` when constructing the engine.
pub struct NoOracle;

impl Oracle for NoOracle {
    fn analyze(&mut self, _seed: &Seed, _compile: &CompileOutcome) -> Result<Option<Bug>, OracleError> {
        Ok(None)
    }
}

/// LLM boundary: one completion per prompt pair. Responses may be
/// malformed; the prompt module's extraction handles that.
pub trait LlmClient {
    fn completion(&mut self, system: &str, user: &str) -> Result<String, LlmError>;
}
