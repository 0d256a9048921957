use std::path::PathBuf;

use thiserror::Error;

/// Fatal at construction: the CFG dump could not be read or modeled.
#[derive(Debug, Error)]
pub enum CfgError {
    #[error("cfg dump {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cfg dump parse failed: {0}")]
    Parse(String),
}

/// Fatal at construction: the caller asked for a function the model does not have.
#[derive(Debug, Error)]
#[error("target function not present in cfg model: {0}")]
pub struct TargetFunctionUnknown(pub String);

/// Non-fatal during a run; the next checkpoint retries.
#[derive(Debug, Error)]
pub enum CoverageMappingError {
    #[error("coverage mapping {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("coverage mapping json: {0}")]
    Json(#[from] serde_json::Error),
}

/// LLM boundary failures. Both abandon the current attempt; the target's
/// weight decays as for any failed round.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm completion failed: {0}")]
    Completion(String),
    #[error("llm response unusable: {0}")]
    Parse(String),
}

/// Trace/divergence failures. The retry loop proceeds without divergence
/// information when one of these surfaces.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace tool not found: {0}")]
    ToolNotFound(String),
    #[error("trace record failed: {0}")]
    Record(String),
    #[error("trace replay failed: {0}")]
    Replay(String),
    #[error("no cc1 process in {0}")]
    Cc1PidNotFound(PathBuf),
    #[error("trace io: {0}")]
    Io(#[from] std::io::Error),
}

/// Infrastructure failure in the compiler wrapper (a seed that merely fails
/// to compile is not an error; see `CompileOutcome`).
#[derive(Debug, Error)]
#[error("compiler wrapper failed: {0}")]
pub struct CompilerError(pub String);

#[derive(Debug, Error)]
#[error("coverage measurement failed: {0}")]
pub struct CoverageToolError(pub String);

/// Oracle failures are logged and recorded as a skipped verdict.
#[derive(Debug, Error)]
#[error("oracle failed: {0}")]
pub struct OracleError(pub String);

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("corpus {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corpus json: {0}")]
    Json(#[from] serde_json::Error),
}
