//! Function-level execution-trace divergence between two seeds.
//!
//! Both seeds are compiled under an external record tool; the cc1-phase
//! call sequences are replayed, aligned at the parser entry, and diffed to
//! the first differing call. The result steers prompt refinement when a
//! generated seed keeps missing its target block.

pub mod analyzer;
pub mod replay;
pub mod uftrace;

pub use analyzer::{find_divergence, DivergenceAnalyzer, TraceTool};
pub use replay::{cc1_pid_from_task_file, parse_replay, parser_start_index, FunctionCall};
pub use uftrace::UftraceTool;

/// First call where two aligned sequences part ways, with surrounding
/// context for the refinement prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergencePoint {
    /// Offset from the parser-start alignment point.
    pub index: usize,
    /// Name on each side at the divergence; empty when that side ended.
    pub function_1: String,
    pub function_2: String,
    /// Last calls both sides share before the divergence.
    pub common_prefix: Vec<String>,
    /// Calls each side makes from the divergence on.
    pub path_1: Vec<String>,
    pub path_2: Vec<String>,
}
