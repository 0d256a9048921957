//! Single-pass reader for GCC-style post-pass CFG dumps.
//!
//! The dump interleaves `;;` summary lines with the lowered function bodies.
//! Three line shapes are contractual:
//!
//! - `;; Function NAME (MANGLED, ...)` opens a function;
//! - `;; N succs { ... }` summarizes BB N's outgoing edges, ahead of the body;
//! - `<bb N>` (optional trailing `:` or count annotation) opens a block.
//!
//! Everything else is scanned only for `[FILE:LINE:COL]` location tokens.
//! Unknown lines are ignored; the parser fails on I/O alone.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::cfg::{BasicBlock, CfgFunction};
use crate::error::CfgError;

const FUNCTION_HEADER: &str = ";; Function ";

/// Macro-expanded bodies produce very long lines; anything past this is a
/// structurally broken dump rather than real compiler output.
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Parse one CFG dump into a name -> function model. Predecessor maps are
/// rebuilt from the successor summaries after the full pass.
pub fn parse_cfg_dump(path: &Path) -> Result<BTreeMap<String, CfgFunction>, CfgError> {
    let file = File::open(path).map_err(|source| CfgError::Io { path: path.to_path_buf(), source })?;
    // Large buffer: single statements routinely exceed 10 MiB after macro
    // expansion.
    let mut reader = BufReader::with_capacity(16 * 1024 * 1024, file);

    let mut parser = DumpParser::default();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|source| CfgError::Io { path: path.to_path_buf(), source })?;
        if n == 0 {
            break;
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(CfgError::Parse(format!(
                "line exceeds {MAX_LINE_BYTES} bytes in {}",
                path.display()
            )));
        }
        parser.feed(line.trim_end_matches(['\n', '\r']));
    }
    Ok(parser.finish())
}

/// In-memory variant used by tests and by callers that already hold the dump.
pub fn parse_cfg_text(text: &str) -> BTreeMap<String, CfgFunction> {
    let mut parser = DumpParser::default();
    for line in text.lines() {
        parser.feed(line);
    }
    parser.finish()
}

#[derive(Default)]
struct DumpParser {
    functions: BTreeMap<String, CfgFunction>,
    current: Option<CfgFunction>,
    current_bb: Option<u32>,
    in_body: bool,
}

impl DumpParser {
    fn feed(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix(FUNCTION_HEADER) {
            if let Some((name, mangled)) = parse_function_header(rest) {
                self.close_current();
                self.current = Some(CfgFunction {
                    name,
                    mangled_name: mangled,
                    ..CfgFunction::default()
                });
            }
            return;
        }

        let Some(func) = self.current.as_mut() else {
            return;
        };

        if line.starts_with(";;") {
            if let Some((bb, succs)) = parse_succs_summary(line) {
                func.succs.insert(bb, succs);
            }
            return;
        }

        if !self.in_body {
            // The body opens at the first non-`;;` line carrying the
            // function's name and a parameter list.
            if line.contains(func.name.as_str()) && line.contains('(') {
                self.in_body = true;
            }
            return;
        }

        if line == "}" {
            self.in_body = false;
            self.current_bb = None;
            return;
        }

        if let Some(bb_id) = parse_bb_start(line) {
            let name = func.name.clone();
            func.blocks.entry(bb_id).or_insert_with(|| BasicBlock::new(bb_id, &name));
            self.current_bb = Some(bb_id);
            return;
        }

        if let Some(bb_id) = self.current_bb {
            if let Some(block) = func.blocks.get_mut(&bb_id) {
                for (file, src_line) in extract_location_tokens(line) {
                    if block.file.is_empty() {
                        block.file = file.to_string();
                    }
                    if block.file == file && !block.lines.contains(&src_line) {
                        block.lines.push(src_line);
                    }
                }
            }
        }
    }

    fn close_current(&mut self) {
        if let Some(func) = self.current.take() {
            self.functions.insert(func.name.clone(), func);
        }
        self.current_bb = None;
        self.in_body = false;
    }

    fn finish(mut self) -> BTreeMap<String, CfgFunction> {
        self.close_current();
        for func in self.functions.values_mut() {
            attach_edges(func);
        }
        self.functions
    }
}

/// Reverse every summarized edge into the predecessor map and copy both
/// directions onto the materialized blocks.
fn attach_edges(func: &mut CfgFunction) {
    let mut preds: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (&from, succs) in &func.succs {
        for &to in succs {
            let entry = preds.entry(to).or_default();
            if !entry.contains(&from) {
                entry.push(from);
            }
        }
    }
    func.preds = preds;
    for (id, block) in func.blocks.iter_mut() {
        block.successors = func.succs.get(id).cloned().unwrap_or_default();
        block.predecessors = func.preds.get(id).cloned().unwrap_or_default();
    }
}

/// `NAME (MANGLED, ...` with NAME whitespace-terminated. Anonymous-namespace
/// names like `{anonymous}::ns::fn` sit whole in the name slot.
fn parse_function_header(rest: &str) -> Option<(String, String)> {
    let name = rest.split_whitespace().next()?;
    let after_name = rest[rest.find(name)? + name.len()..].trim_start();
    let inner = after_name.strip_prefix('(')?;
    let mangled_end = inner.find([',', ')'])?;
    let mangled = inner[..mangled_end].trim();
    if name.is_empty() || mangled.is_empty() {
        return None;
    }
    Some((name.to_string(), mangled.to_string()))
}

/// `;; <N> succs { <ints> }`; the list may be empty.
fn parse_succs_summary(line: &str) -> Option<(u32, Vec<u32>)> {
    let rest = line.strip_prefix(";;")?.trim_start();
    let mut tokens = rest.split_whitespace();
    let bb: u32 = tokens.next()?.parse().ok()?;
    if tokens.next()? != "succs" {
        return None;
    }
    if tokens.next()? != "{" {
        return None;
    }
    let mut succs = Vec::new();
    for tok in tokens {
        if tok == "}" {
            return Some((bb, succs));
        }
        succs.push(tok.parse().ok()?);
    }
    None
}

/// `<bb N>` at the start of the (trimmed) line, optionally followed by `:`
/// or a count annotation. `goto <bb N>;` statements do not start a block.
fn parse_bb_start(line: &str) -> Option<u32> {
    let rest = line.trim_start().strip_prefix("<bb ")?;
    let end = rest.find('>')?;
    rest[..end].trim().parse().ok()
}

/// All `[FILE:LINE:COL]` tokens of a body line; `discrim M` trailers are
/// tolerated, anything that does not shape up as file:int:int is skipped.
fn extract_location_tokens(line: &str) -> Vec<(&str, u32)> {
    let mut out = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'[' {
            i += 1;
            continue;
        }
        let Some(close) = line[i + 1..].find(']') else {
            break;
        };
        let inner = &line[i + 1..i + 1 + close];
        if let Some(loc) = parse_location(inner) {
            out.push(loc);
        }
        i += 1 + close + 1;
    }
    out
}

fn parse_location(inner: &str) -> Option<(&str, u32)> {
    let loc = match inner.find(" discrim ") {
        Some(at) => &inner[..at],
        None => inner,
    };
    let mut parts = loc.rsplitn(3, ':');
    let col = parts.next()?;
    let line = parts.next()?;
    let file = parts.next()?;
    col.trim().parse::<u32>().ok()?;
    let line_no = line.trim().parse::<u32>().ok()?;
    if file.is_empty() {
        return None;
    }
    Some((file, line_no))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::testutil::SAMPLE_DUMP;

    #[test]
    fn parses_both_functions_from_sample() {
        let funcs = parse_cfg_text(SAMPLE_DUMP);
        assert_eq!(funcs.len(), 2);
        let test_func = &funcs["test_func"];
        assert_eq!(test_func.mangled_name, "test_func");
        assert_eq!(
            test_func.blocks.keys().copied().collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );
        let another = &funcs["another_func"];
        assert_eq!(another.blocks[&2].successors, vec![3, 4, 5]);
        assert_eq!(another.blocks[&2].lines, vec![20]);
        assert_eq!(another.blocks[&2].file, "t.c");
    }

    #[test]
    fn goto_markers_do_not_open_blocks() {
        let funcs = parse_cfg_text(SAMPLE_DUMP);
        // `goto <bb 5>;` inside BB3 must not move line 14 into BB5.
        let test_func = &funcs["test_func"];
        assert_eq!(test_func.blocks[&3].lines, vec![12]);
        assert_eq!(test_func.blocks[&5].lines, vec![16]);
    }

    #[test]
    fn preds_are_reversed_succs() {
        let funcs = parse_cfg_text(SAMPLE_DUMP);
        for func in funcs.values() {
            for (&from, succs) in &func.succs {
                for to in succs {
                    assert!(
                        func.preds[to].contains(&from),
                        "{}: edge {from} -> {to} missing from preds",
                        func.name
                    );
                }
            }
        }
        let another = &funcs["another_func"];
        assert_eq!(another.preds[&6], vec![3, 4, 5]);
        assert_eq!(another.blocks[&6].predecessors, vec![3, 4, 5]);
    }

    #[test]
    fn succ_summaries_for_sentinels_are_kept_without_blocks() {
        let funcs = parse_cfg_text(SAMPLE_DUMP);
        let test_func = &funcs["test_func"];
        assert_eq!(test_func.succs[&0], vec![2]);
        assert!(!test_func.blocks.contains_key(&0));
        assert!(!test_func.blocks.contains_key(&1));
        // BB2's only pred is the entry sentinel, so it resolves to none.
        assert!(test_func.resolved_predecessors(2).is_empty());
        assert_eq!(test_func.resolved_predecessors(5), vec![3, 4]);
    }

    #[test]
    fn anonymous_namespace_headers_parse() {
        let dump = "\
;; Function {anonymous}::detail::run (_ZN12_GLOBAL__N_16detail3runEv, funcdef_no=3)

;; 2 succs { 1 }
void {anonymous}::detail::run ()
{
  <bb 2> :
  [ns.cc:7:2] return;

}
";
        let funcs = parse_cfg_text(dump);
        let f = &funcs["{anonymous}::detail::run"];
        assert_eq!(f.mangled_name, "_ZN12_GLOBAL__N_16detail3runEv");
        assert_eq!(f.blocks[&2].lines, vec![7]);
    }

    #[test]
    fn debug_only_foreign_file_lines_are_dropped() {
        let dump = "\
;; Function f (f, funcdef_no=0)

;; 2 succs { 1 }
int f (void)
{
  <bb 2> :
  [m.c:3:1] x = MACRO ();
  [/usr/include/stdlib.h:120:4] tmp = __builtin_alloca (8);
  [m.c:4:1] return x;

}
";
        let funcs = parse_cfg_text(dump);
        let bb = &funcs["f"].blocks[&2];
        assert_eq!(bb.file, "m.c");
        assert_eq!(bb.lines, vec![3, 4]);
    }

    #[test]
    fn discrim_trailers_and_duplicates_collapse() {
        let dump = "\
;; Function g (g, funcdef_no=0)

;; 2 succs { 1 }
int g (void)
{
  <bb 2> :
  [a.c:9:3 discrim 1] i = 0;
  [a.c:9:7 discrim 2] j = 0;
  [a.c:10:3] return i + j;

}
";
        let funcs = parse_cfg_text(dump);
        assert_eq!(funcs["g"].blocks[&2].lines, vec![9, 10]);
    }

    #[test]
    fn unknown_lines_and_empty_succ_lists_are_tolerated() {
        let dump = "\
;; Function h (h, funcdef_no=0)
;; some other summary the parser does not know
;; 2 succs { }
int h (void)
{
  <bb 2> :
  completely opaque statement
  [b.c:2:1] return;

}
";
        let funcs = parse_cfg_text(dump);
        assert!(funcs["h"].succs[&2].is_empty());
        assert_eq!(funcs["h"].blocks[&2].lines, vec![2]);
    }

    #[test]
    fn io_error_on_missing_file() {
        let err = parse_cfg_dump(Path::new("/nonexistent/x.015t.cfg")).unwrap_err();
        assert!(matches!(err, CfgError::Io { .. }));
    }
}
