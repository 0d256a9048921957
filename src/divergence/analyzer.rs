//! Trace recording orchestration and the first-divergence diff.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::divergence::replay::{cc1_pid_from_task_file, parse_replay, parser_start_index, FunctionCall};
use crate::divergence::DivergencePoint;
use crate::error::TraceError;

/// External record tool boundary. `record` traces one compiler invocation
/// into `out_dir` (leaving a `task.txt` there); `replay` renders the
/// recorded stream as text.
pub trait TraceTool {
    fn record(&self, compiler: &Path, seed: &Path, out_dir: &Path) -> Result<(), TraceError>;
    fn replay(&self, trace_dir: &Path) -> Result<String, TraceError>;
}

/// Diff two call sequences, each aligned at its own parser start. Returns
/// none for identical sequences; when one side is a strict prefix of the
/// other, the divergence sits at the end of the shorter side and the
/// exhausted side's function name is empty.
pub fn find_divergence(
    calls_1: &[FunctionCall],
    calls_2: &[FunctionCall],
    context: usize,
) -> Option<DivergencePoint> {
    let a = &calls_1[parser_start_index(calls_1)..];
    let b = &calls_2[parser_start_index(calls_2)..];

    let shared = a.len().min(b.len());
    let mut at = None;
    for i in 0..shared {
        if a[i].name != b[i].name {
            at = Some(i);
            break;
        }
    }
    let index = match at {
        Some(i) => i,
        None if a.len() == b.len() => return None,
        None => shared,
    };

    let names = |calls: &[FunctionCall], from: usize, to: usize| -> Vec<String> {
        calls[from.min(calls.len())..to.min(calls.len())]
            .iter()
            .map(|c| c.name.clone())
            .collect()
    };

    Some(DivergencePoint {
        index,
        function_1: a.get(index).map(|c| c.name.clone()).unwrap_or_default(),
        function_2: b.get(index).map(|c| c.name.clone()).unwrap_or_default(),
        common_prefix: names(a, index.saturating_sub(context), index),
        path_1: names(a, index, index + context),
        path_2: names(b, index, index + context),
    })
}

/// Records both seeds under the compiler, extracts the cc1 call sequences
/// and locates the first divergence. Trace directories are temporary and
/// vanish on `cleanup` or drop, whichever comes first.
pub struct DivergenceAnalyzer {
    tool: Box<dyn TraceTool>,
    context: usize,
    trace_dirs: Vec<TempDir>,
}

impl DivergenceAnalyzer {
    pub fn new(tool: Box<dyn TraceTool>, context: usize) -> Self {
        Self { tool, context, trace_dirs: Vec::new() }
    }

    pub fn analyze(
        &mut self,
        base_seed: &Path,
        mutated_seed: &Path,
        compiler: &Path,
    ) -> Result<Option<DivergencePoint>, TraceError> {
        let calls_1 = self.trace_calls(compiler, base_seed)?;
        let calls_2 = self.trace_calls(compiler, mutated_seed)?;
        Ok(find_divergence(&calls_1, &calls_2, self.context))
    }

    fn trace_calls(&mut self, compiler: &Path, seed: &Path) -> Result<Vec<FunctionCall>, TraceError> {
        let dir = tempfile::Builder::new().prefix("magpie-trace-").tempdir()?;
        self.tool.record(compiler, seed, dir.path())?;

        let task_path = dir.path().join("task.txt");
        let task = fs::read_to_string(&task_path)?;
        let pid = cc1_pid_from_task_file(&task).ok_or(TraceError::Cc1PidNotFound(task_path))?;

        let replay = self.tool.replay(dir.path())?;
        let calls = parse_replay(&replay, pid);
        self.trace_dirs.push(dir);
        Ok(calls)
    }

    /// Remove all trace directories produced so far.
    pub fn cleanup(&mut self) {
        for dir in self.trace_dirs.drain(..) {
            let _ = dir.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn calls(names: &[&str]) -> Vec<FunctionCall> {
        names.iter().map(|n| FunctionCall::new(*n, 1)).collect()
    }

    #[test]
    fn identical_sequences_have_no_divergence() {
        let a = calls(&["main", "parse_expr", "expr_primary", "add"]);
        let b = calls(&["main", "parse_expr", "expr_primary", "add"]);
        assert_eq!(find_divergence(&a, &b, 5), None);
    }

    #[test]
    fn first_differing_call_past_the_parser_start() {
        let a = calls(&["main", "c_parser_peek_token", "gen_addsi3", "start_sequence"]);
        let b = calls(&["main", "c_parser_peek_token", "optimize_insn_for_speed_p", "register_operand"]);
        let d = find_divergence(&a, &b, 5).unwrap();
        assert_eq!(d.index, 1);
        assert_eq!(d.function_1, "gen_addsi3");
        assert_eq!(d.function_2, "optimize_insn_for_speed_p");
        assert!(d.common_prefix.contains(&"c_parser_peek_token".to_string()));
        assert_eq!(d.path_1, vec!["gen_addsi3", "start_sequence"]);
        assert_eq!(d.path_2, vec!["optimize_insn_for_speed_p", "register_operand"]);
    }

    #[test]
    fn prefix_sequences_diverge_at_the_shorter_end() {
        let a = calls(&["parse_decl", "build_decl", "finish_decl"]);
        let b = calls(&["parse_decl", "build_decl"]);
        let d = find_divergence(&a, &b, 2).unwrap();
        assert_eq!(d.index, 2);
        assert_eq!(d.function_1, "finish_decl");
        assert_eq!(d.function_2, "");
        assert_eq!(d.common_prefix, vec!["parse_decl", "build_decl"]);
    }

    #[test]
    fn context_window_is_bounded() {
        let a = calls(&["parse_a", "x1", "x2", "x3", "x4", "x5", "diverge_a", "t1"]);
        let b = calls(&["parse_a", "x1", "x2", "x3", "x4", "x5", "diverge_b", "t2"]);
        let d = find_divergence(&a, &b, 3).unwrap();
        assert_eq!(d.index, 6);
        assert_eq!(d.common_prefix, vec!["x3", "x4", "x5"]);
        assert_eq!(d.path_1, vec!["diverge_a", "t1"]);
    }

    #[test]
    fn sides_align_at_their_own_parser_start() {
        // Side b carries extra pre-parser noise; alignment hides it.
        let a = calls(&["c_parser_peek_token", "gen_addsi3"]);
        let b = calls(&["init", "timevar_push", "c_parser_peek_token", "gen_addsi3"]);
        assert_eq!(find_divergence(&a, &b, 5), None);
    }

    struct ScriptedTool {
        replays: RefCell<VecDeque<String>>,
        task: String,
    }

    impl TraceTool for ScriptedTool {
        fn record(&self, _compiler: &Path, _seed: &Path, out_dir: &Path) -> Result<(), TraceError> {
            fs::write(out_dir.join("task.txt"), &self.task)?;
            Ok(())
        }

        fn replay(&self, _trace_dir: &Path) -> Result<String, TraceError> {
            Ok(self.replays.borrow_mut().pop_front().unwrap_or_default())
        }
    }

    #[test]
    fn analyze_runs_record_replay_and_diff() {
        let replay_1 = "\
            [  99] | c_parser_peek_token() {
   1.0 us [  99] |   gen_addsi3();
";
        let replay_2 = "\
            [  99] | c_parser_peek_token() {
   1.0 us [  99] |   optimize_insn_for_speed_p();
";
        let tool = ScriptedTool {
            replays: RefCell::new(VecDeque::from([replay_1.to_string(), replay_2.to_string()])),
            task: "TASK tid=99 pid=99 exename=\"cc1\"\n".to_string(),
        };
        let mut analyzer = DivergenceAnalyzer::new(Box::new(tool), 5);
        let d = analyzer
            .analyze(Path::new("base.c"), Path::new("mut.c"), Path::new("gcc"))
            .unwrap()
            .unwrap();
        assert_eq!(d.function_1, "gen_addsi3");
        assert_eq!(d.function_2, "optimize_insn_for_speed_p");
        analyzer.cleanup();
    }

    #[test]
    fn missing_cc1_row_is_surfaced() {
        let tool = ScriptedTool {
            replays: RefCell::new(VecDeque::new()),
            task: "TASK tid=1 pid=1 exename=\"as\"\n".to_string(),
        };
        let mut analyzer = DivergenceAnalyzer::new(Box::new(tool), 5);
        let err = analyzer
            .analyze(Path::new("a.c"), Path::new("b.c"), Path::new("gcc"))
            .unwrap_err();
        assert!(matches!(err, TraceError::Cc1PidNotFound(_)));
    }
}
