//! Coverage-guided, LLM-assisted fuzzing for GCC-class compilers.
//!
//! The library models one campaign: a post-pass CFG dump of the
//! compiler-under-test is parsed and indexed, a persistent line -> seeds
//! mapping tracks what the corpus already reaches, and the engine walks the
//! uncovered frontier, asking an external LLM for programs that push the
//! compiler into the selected basic blocks. Divergence analysis between a
//! base seed and a failed mutant refines the retry prompts.
//!
//! External collaborators (compiler wrapper, coverage reporting, oracle,
//! LLM, trace recorder) enter through the traits in [`external`] and
//! [`divergence`]; everything else is concrete.

pub mod cfg;
pub mod config;
pub mod coverage;
pub mod divergence;
pub mod error;
pub mod external;
pub mod fuzz;
pub mod prompt;

pub use cfg::{source_file_from_cfg_path, BasicBlock, CfgAnalyzer, CfgFunction, TargetInfo};
pub use config::FuzzConfig;
pub use coverage::{CoverageMapping, LineId};
pub use divergence::{DivergenceAnalyzer, DivergencePoint, UftraceTool};
pub use fuzz::{EngineStats, FuzzEngine, FuzzResult, JsonlCorpus, OracleVerdict, Seed, SeedCorpus};
