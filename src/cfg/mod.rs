//! Control-flow-graph model of the compiler-under-test.
//!
//! The parser reads one post-pass CFG dump (`*.NNNt.cfg`) into per-function
//! basic-block graphs; the analyzer indexes those graphs and drives target
//! selection for the fuzzing loop.

pub mod analyzer;
pub mod parser;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use analyzer::{AnalyzerOptions, BbWeightInfo, CfgAnalyzer, TargetInfo};
pub use parser::parse_cfg_dump;

/// One basic block of a dumped function.
///
/// Ids 0 (entry) and 1 (exit) are graph sentinels; they appear in edge lists
/// but are never materialized as blocks and are never targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: u32,
    pub function: String,
    /// Source file the block's line annotations refer to. Fixed by the first
    /// `[FILE:LINE:COL]` token seen in the block; tokens naming other files
    /// are debug-only references and are dropped.
    pub file: String,
    /// Ordered, duplicate-free source lines attributed to this block.
    pub lines: Vec<u32>,
    pub successors: Vec<u32>,
    pub predecessors: Vec<u32>,
}

impl BasicBlock {
    fn new(id: u32, function: &str) -> Self {
        Self {
            id,
            function: function.to_string(),
            file: String::new(),
            lines: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }
}

/// A function parsed out of a CFG dump.
#[derive(Debug, Clone, Default)]
pub struct CfgFunction {
    pub name: String,
    pub mangled_name: String,
    pub blocks: BTreeMap<u32, BasicBlock>,
    /// Successor lists as summarized by the dump, including sentinel-only
    /// ids (0/1) that never open as blocks.
    pub succs: BTreeMap<u32, Vec<u32>>,
    /// Reverse of `succs`, recomputed after the whole dump is read.
    pub preds: BTreeMap<u32, Vec<u32>>,
}

impl CfgFunction {
    /// Predecessors of `bb_id` that resolved to parsed blocks. Sentinels and
    /// summary-only ids do not count; a block whose predecessors all fail to
    /// resolve behaves as a function entry.
    pub fn resolved_predecessors(&self, bb_id: u32) -> Vec<u32> {
        self.preds
            .get(&bb_id)
            .map(|p| p.iter().copied().filter(|id| self.blocks.contains_key(id)).collect())
            .unwrap_or_default()
    }
}

/// Recover the translation-unit source path from a CFG dump path by
/// stripping the `.NNNt.cfg` pass suffix. The pass selector itself is
/// opaque; the caller chooses which dump to hand over.
pub fn source_file_from_cfg_path(cfg_path: &Path) -> PathBuf {
    let Some(name) = cfg_path.file_name().and_then(|n| n.to_str()) else {
        return cfg_path.to_path_buf();
    };
    let Some(stem) = name.strip_suffix(".cfg") else {
        return cfg_path.to_path_buf();
    };
    // The remaining extension is the pass selector, e.g. "015t".
    let source = match stem.rfind('.') {
        Some(dot) if is_pass_selector(&stem[dot + 1..]) => &stem[..dot],
        _ => stem,
    };
    cfg_path.with_file_name(source)
}

fn is_pass_selector(ext: &str) -> bool {
    let Some(num) = ext.strip_suffix('t') else {
        return false;
    };
    !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Two-function dump shared by the parser and analyzer tests. Matches
    /// the shapes exercised by the selection scenarios: `test_func` BB2 has
    /// two successors, `another_func` BB2 has three and carries only line 20.
    pub(crate) const SAMPLE_DUMP: &str = r#"
;; Function test_func (test_func, funcdef_no=0, decl_uid=1234, cgraph_uid=1, symbol_order=1)

;; 0 succs { 2 }
;; 2 succs { 3 4 }
;; 3 succs { 5 }
;; 4 succs { 5 }
;; 5 succs { 1 }
void test_func (int x)
{
  int y;

  <bb 2> :
  [t.c:10:5] y = x + 1;
  [t.c:11:5] if (y > 0)
    goto <bb 3>; [INV]
  else
    goto <bb 4>; [INV]

  <bb 3> :
  [t.c:12:7] y = y * 2;
  goto <bb 5>; [INV]

  <bb 4> :
  [t.c:14:7] y = 0;

  <bb 5> :
  [t.c:16:3] return;

}


;; Function another_func (another_func, funcdef_no=1, decl_uid=1250, cgraph_uid=2, symbol_order=2)

;; 0 succs { 2 }
;; 2 succs { 3 4 5 }
;; 3 succs { 6 }
;; 4 succs { 6 }
;; 5 succs { 6 }
;; 6 succs { 1 }
void another_func (int k)
{
  <bb 2> :
  [t.c:20:3] switch (k) <default: <L3> [INV], case 1: <L0> [INV], case 2: <L1> [INV]>

  <bb 3> :
  [t.c:21:5] k = k + 1;
  goto <bb 6>; [INV]

  <bb 4> :
  [t.c:22:5] k = k + 2;
  goto <bb 6>; [INV]

  <bb 5> :
  [t.c:23:5] k = 0;

  <bb 6> :
  [t.c:25:3] return;

}
"#;
}
