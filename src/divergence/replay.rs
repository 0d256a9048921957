//! Extraction of cc1 call sequences from recorded trace directories.
//!
//! The record tool leaves a `task.txt` listing the traced processes and a
//! replay stream whose call lines look like
//!
//! ```text
//!    2.579 us [  4629] |   c_parser_peek_token();
//!             [  4629] | c_parser_translation_unit() {
//! ```
//!
//! Depth is the 2-space indent past the `|`. Scheduler events and
//! dynamic-library calls are noise and are dropped.

/// One call observed in a replayed trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    pub depth: usize,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, depth: usize) -> Self {
        Self { name: name.into(), depth }
    }
}

/// Pid of the cc1 sub-process: the first `task.txt` row naming cc1 and
/// carrying a `pid=<n>` token.
pub fn cc1_pid_from_task_file(text: &str) -> Option<u32> {
    text.lines()
        .filter(|line| line.contains("cc1"))
        .find_map(|line| int_after(line, "pid="))
}

fn int_after(line: &str, key: &str) -> Option<u32> {
    let at = line.find(key)? + key.len();
    let digits: String = line[at..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Ordered calls of `pid` from a replay stream. Lines without the pid
/// bracket, scope-closing lines, `linux:schedule` events, and `@`-marked
/// library calls are skipped.
pub fn parse_replay(text: &str, pid: u32) -> Vec<FunctionCall> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(open) = line.find('[') else {
            continue;
        };
        let Some(close) = line[open..].find(']') else {
            continue;
        };
        let Ok(tid) = line[open + 1..open + close].trim().parse::<u32>() else {
            continue;
        };
        if tid != pid {
            continue;
        }
        let rest = &line[open + close + 1..];
        let Some(bar) = rest.find('|') else {
            continue;
        };
        let body = &rest[bar + 1..];
        if body.contains("linux:schedule") {
            continue;
        }
        let indent = body.len() - body.trim_start_matches(' ').len();
        let depth = indent.saturating_sub(1) / 2;
        let trimmed = body.trim();
        let Some(paren) = trimmed.find('(') else {
            continue;
        };
        let name = trimmed[..paren].trim();
        if !is_function_name(name) || name.contains('@') {
            continue;
        }
        out.push(FunctionCall::new(name, depth));
    }
    out
}

fn is_function_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '.' || c == '@')
}

/// Index of the first parser-flavored call (`c_parser` or any name
/// containing `parse`, case-insensitive); 0 when none shows up.
pub fn parser_start_index(calls: &[FunctionCall]) -> usize {
    calls
        .iter()
        .position(|c| {
            c.name.contains("c_parser") || c.name.to_ascii_lowercase().contains("parse")
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK_TXT: &str = "\
SESS timestamp=1000.0 pid=4620 sid=abcd exename=\"/usr/bin/gcc\"
TASK timestamp=1000.1 tid=4620 pid=4620
TASK timestamp=1000.2 tid=4629 pid=4629 exename=\"/usr/libexec/gcc/cc1\"
TASK timestamp=1000.3 tid=4635 pid=4635 exename=\"/usr/bin/as\"
";

    #[test]
    fn cc1_pid_is_extracted() {
        assert_eq!(cc1_pid_from_task_file(TASK_TXT), Some(4629));
        assert_eq!(cc1_pid_from_task_file("TASK tid=1 pid=1 exename=\"as\""), None);
    }

    const REPLAY: &str = "\
# DURATION     TID       FUNCTION
            [  4629] | main() {
   1.100 us [  4629] |   toplev::start();
            [  4629] |   c_parser_translation_unit() {
   0.300 us [  4629] |     c_parser_peek_token();
   0.200 us [  4629] |     linux:schedule();
   0.250 us [  4629] |     malloc@plt();
   0.400 us [  4629] |     gen_addsi3();
            [  4629] |   } /* c_parser_translation_unit */
   9.000 us [  4635] | as_main();
            [  4629] | } /* main */
";

    #[test]
    fn replay_lines_are_filtered_to_pid_and_cleaned() {
        let calls = parse_replay(REPLAY, 4629);
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["main", "toplev::start", "c_parser_translation_unit", "c_parser_peek_token", "gen_addsi3"]
        );
        assert_eq!(calls[0].depth, 0);
        assert_eq!(calls[2].depth, 1);
        assert_eq!(calls[3].depth, 2);
    }

    #[test]
    fn other_pids_and_scope_closers_are_dropped() {
        let calls = parse_replay(REPLAY, 4635);
        assert_eq!(calls, vec![FunctionCall::new("as_main", 0)]);
    }

    #[test]
    fn parser_start_prefers_first_parser_call() {
        let calls = vec![
            FunctionCall::new("main", 0),
            FunctionCall::new("toplev::start", 1),
            FunctionCall::new("c_parser_translation_unit", 1),
            FunctionCall::new("gen_addsi3", 2),
        ];
        assert_eq!(parser_start_index(&calls), 2);

        let no_parser = vec![FunctionCall::new("main", 0), FunctionCall::new("expand", 1)];
        assert_eq!(parser_start_index(&no_parser), 0);

        let generic = vec![FunctionCall::new("main", 0), FunctionCall::new("ParseFile", 1)];
        assert_eq!(parser_start_index(&generic), 1);
    }
}
