//! Deterministic prompt assembly for the external LLM.
//!
//! Three shapes: the initial constraint prompt for a selected target block,
//! the divergence-guided refinement, and the compile-error retry. A fourth,
//! generic mutation prompt drives the post-saturation random phase. All
//! builders are pure formatters over typed contexts.

use crate::divergence::DivergencePoint;
use crate::error::LlmError;

/// Everything the prompts need to describe the selected target block.
#[derive(Debug, Clone, Default)]
pub struct TargetContext {
    pub function: String,
    pub bb_id: u32,
    pub file: String,
    pub target_lines: Vec<u32>,
    pub successor_count: usize,
    pub base_seed_id: Option<u64>,
    pub base_seed_code: Option<String>,
    pub source_excerpt_around_target: Option<String>,
}

/// Divergence context for the refinement prompt.
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub point: DivergencePoint,
    pub divergent_function_code: Option<String>,
    pub base_seed_code: String,
    pub mutated_seed_code: String,
}

/// Compiler feedback for the retry prompt.
#[derive(Debug, Clone)]
pub struct CompileErrorInfo {
    pub failed_seed_code: String,
    pub compiler_output: String,
    pub exit_code: i32,
    pub retry_attempt: usize,
    pub max_retries: usize,
}

const SYSTEM_PROMPT: &str = "\
You generate C test programs for a compiler fuzzing campaign. Every answer \
must be exactly one complete, self-contained C translation unit inside a \
single fenced code block tagged `c`. The program must compile on its own \
with no extra headers, inputs or build flags, and must terminate quickly \
when run. Do not explain your answer outside the code block.";

fn push_target_section(out: &mut String, ctx: &TargetContext) {
    out.push_str(&format!(
        "Target: basic block {} of function `{}` ({} outgoing edges).\n",
        ctx.bb_id, ctx.function, ctx.successor_count
    ));
    let lines: Vec<String> = ctx.target_lines.iter().map(u32::to_string).collect();
    out.push_str(&format!("Source lines to reach: {}:{}\n", ctx.file, lines.join(",")));
    if let Some(excerpt) = &ctx.source_excerpt_around_target {
        out.push_str("\nCompiler source around the target lines:\n```\n");
        out.push_str(excerpt);
        out.push_str("\n```\n");
    }
}

fn push_base_seed_section(out: &mut String, ctx: &TargetContext) {
    if let (Some(id), Some(code)) = (ctx.base_seed_id, &ctx.base_seed_code) {
        out.push_str(&format!(
            "\nStart from this program (seed {id}), which already drives \
execution next to the target:\n```c\n{code}\n```\n"
        ));
    }
}

/// Initial prompt: produce a translation unit that exercises the target BB.
pub fn constraint_prompt(ctx: &TargetContext) -> (String, String) {
    let mut user = String::new();
    push_target_section(&mut user, ctx);
    push_base_seed_section(&mut user, ctx);
    user.push_str(
        "\nWrite a C program whose compilation makes the compiler execute \
the target lines above. Prefer a minimal change of the base program when \
one is given; otherwise construct the smallest program with the language \
feature that reaches this code.\n",
    );
    (SYSTEM_PROMPT.to_string(), user)
}

/// Refinement prompt: the previous attempt compiled but the execution trace
/// departed from the expected path; steer it back into `function_1`.
pub fn refined_prompt(ctx: &TargetContext, info: &DivergenceInfo) -> (String, String) {
    let mut user = String::new();
    push_target_section(&mut user, ctx);

    let p = &info.point;
    user.push_str(&format!(
        "\nThe previous attempt diverged from the intended compiler path at \
call {} after the parser entry: the base program reaches `{}` but the \
mutated one reaches `{}`.\n",
        p.index, p.function_1, p.function_2
    ));
    if !p.common_prefix.is_empty() {
        user.push_str(&format!("Shared call prefix: {}\n", p.common_prefix.join(" -> ")));
    }
    user.push_str(&format!("Wanted path: {}\n", p.path_1.join(" -> ")));
    user.push_str(&format!("Observed path: {}\n", p.path_2.join(" -> ")));
    if let Some(code) = &info.divergent_function_code {
        user.push_str(&format!(
            "\nBody of `{}` for reference:\n```\n{code}\n```\n",
            p.function_1
        ));
    }
    user.push_str(&format!(
        "\nBase program:\n```c\n{}\n```\n\nPrevious mutated program:\n```c\n{}\n```\n",
        info.base_seed_code, info.mutated_seed_code
    ));
    user.push_str(&format!(
        "\nRewrite the mutated program so the compiler's execution is \
redirected into `{}` and on towards the target lines.\n",
        p.function_1
    ));
    (SYSTEM_PROMPT.to_string(), user)
}

/// Retry prompt after a failed compile: feed the diagnostics back.
pub fn compile_error_prompt(ctx: &TargetContext, info: &CompileErrorInfo) -> (String, String) {
    let mut user = String::new();
    push_target_section(&mut user, ctx);
    user.push_str(&format!(
        "\nAttempt {}/{} failed to compile (exit code {}).\n\nProgram:\n```c\n{}\n```\n\nCompiler diagnostics:\n```\n{}\n```\n",
        info.retry_attempt,
        info.max_retries,
        info.exit_code,
        info.failed_seed_code,
        info.compiler_output
    ));
    user.push_str(
        "\nFix the program so it compiles cleanly while still aiming for \
the target lines above.\n",
    );
    (SYSTEM_PROMPT.to_string(), user)
}

/// Post-saturation phase: free-form mutation of an existing corpus seed.
pub fn random_mutation_prompt(seed_code: &str, coverage_bp: u32) -> (String, String) {
    let user = format!(
        "Line coverage of the campaign's target functions has saturated at \
{}.{:02}%. Mutate the following program aggressively: change control flow, \
types, storage classes or operators, but keep it a valid C translation \
unit.\n\n```c\n{seed_code}\n```\n",
        coverage_bp / 100,
        coverage_bp % 100
    );
    (SYSTEM_PROMPT.to_string(), user)
}

#[derive(Debug)]
struct FencedBlock {
    lang: String,
    body: String,
}

fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<FencedBlock> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match current.take() {
                Some(block) => blocks.push(block),
                None => {
                    current = Some(FencedBlock {
                        lang: rest.trim().to_ascii_lowercase(),
                        body: String::new(),
                    })
                }
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            if !block.body.is_empty() {
                block.body.push('\n');
            }
            block.body.push_str(line);
        }
    }
    // An unterminated fence still counts; models trail off.
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

fn is_c_lang(lang: &str) -> bool {
    matches!(lang, "c" | "cpp" | "c++" | "cc")
}

/// Extract the seed source from a model response. A lone fenced block wins;
/// among several, the largest C-tagged block (falling back to the largest
/// of any tag); an unfenced response is taken verbatim.
pub fn parse_llm_response(text: &str) -> Result<String, LlmError> {
    let had_fence = text.contains("```");
    let mut blocks = fenced_blocks(text);
    blocks.retain(|b| !b.body.trim().is_empty());
    if blocks.is_empty() {
        let trimmed = text.trim();
        if trimmed.is_empty() || had_fence {
            return Err(LlmError::Parse("response carries no source".to_string()));
        }
        return Ok(trimmed.to_string());
    }

    let c_blocks: Vec<usize> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| is_c_lang(&b.lang))
        .map(|(i, _)| i)
        .collect();
    let pool: Vec<usize> = if c_blocks.is_empty() {
        (0..blocks.len()).collect()
    } else {
        c_blocks
    };
    let best = pool
        .into_iter()
        .max_by_key(|&i| blocks[i].body.len())
        .expect("pool is non-empty");
    Ok(blocks[best].body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TargetContext {
        TargetContext {
            function: "expand_binop".to_string(),
            bb_id: 14,
            file: "optabs.c".to_string(),
            target_lines: vec![1200, 1203],
            successor_count: 3,
            base_seed_id: Some(42),
            base_seed_code: Some("int main(void) { return 0; }".to_string()),
            source_excerpt_around_target: Some("if (shift_optab)".to_string()),
        }
    }

    #[test]
    fn constraint_prompt_names_the_target() {
        let (system, user) = constraint_prompt(&ctx());
        assert!(system.contains("fenced code block"));
        assert!(user.contains("basic block 14 of function `expand_binop`"));
        assert!(user.contains("optabs.c:1200,1203"));
        assert!(user.contains("seed 42"));
        assert!(user.contains("if (shift_optab)"));
    }

    #[test]
    fn constraint_prompt_without_base_seed_omits_the_section() {
        let mut c = ctx();
        c.base_seed_id = None;
        c.base_seed_code = None;
        let (_, user) = constraint_prompt(&c);
        assert!(!user.contains("Start from this program"));
    }

    #[test]
    fn refined_prompt_redirects_to_function_1() {
        let info = DivergenceInfo {
            point: DivergencePoint {
                index: 1,
                function_1: "gen_addsi3".to_string(),
                function_2: "optimize_insn_for_speed_p".to_string(),
                common_prefix: vec!["c_parser_peek_token".to_string()],
                path_1: vec!["gen_addsi3".to_string()],
                path_2: vec!["optimize_insn_for_speed_p".to_string()],
            },
            divergent_function_code: Some("rtx gen_addsi3 (...)".to_string()),
            base_seed_code: "int a;".to_string(),
            mutated_seed_code: "int b;".to_string(),
        };
        let (_, user) = refined_prompt(&ctx(), &info);
        assert!(user.contains("redirected into `gen_addsi3`"));
        assert!(user.contains("c_parser_peek_token"));
        assert!(user.contains("rtx gen_addsi3"));
        assert!(user.contains("int b;"));
    }

    #[test]
    fn compile_error_prompt_carries_diagnostics() {
        let info = CompileErrorInfo {
            failed_seed_code: "int main( {".to_string(),
            compiler_output: "error: expected declaration specifiers".to_string(),
            exit_code: 1,
            retry_attempt: 2,
            max_retries: 3,
        };
        let (_, user) = compile_error_prompt(&ctx(), &info);
        assert!(user.contains("Attempt 2/3"));
        assert!(user.contains("exit code 1"));
        assert!(user.contains("expected declaration specifiers"));
    }

    #[test]
    fn mutation_prompt_formats_basis_points() {
        let (_, user) = random_mutation_prompt("int main(void){}", 7243);
        assert!(user.contains("72.43%"));
        assert!(user.contains("int main(void){}"));
    }

    #[test]
    fn single_fence_is_extracted() {
        let text = "Here you go:\n```c\nint main(void) { return 1; }\n```\nGood luck!";
        assert_eq!(parse_llm_response(text).unwrap(), "int main(void) { return 1; }");
    }

    #[test]
    fn largest_c_block_wins_on_ambiguity() {
        let text = "\
```sh\ngcc -O2 t.c\n```\n\
```c\nint x;\n```\n\
```c\nint main(void) {\n  return 0;\n}\n```\n";
        assert_eq!(parse_llm_response(text).unwrap(), "int main(void) {\n  return 0;\n}");
    }

    #[test]
    fn untagged_blocks_fall_back_to_largest() {
        let text = "```\nshort\n```\n```\na much longer block of text\n```\n";
        assert_eq!(parse_llm_response(text).unwrap(), "a much longer block of text");
    }

    #[test]
    fn unfenced_text_is_taken_verbatim() {
        assert_eq!(parse_llm_response("  int main(void){}\n").unwrap(), "int main(void){}");
    }

    #[test]
    fn unterminated_fence_still_yields_code() {
        let text = "```c\nint main(void) { return 2; }";
        assert_eq!(parse_llm_response(text).unwrap(), "int main(void) { return 2; }");
    }

    #[test]
    fn empty_responses_are_errors() {
        assert!(matches!(parse_llm_response("   \n"), Err(LlmError::Parse(_))));
        assert!(matches!(parse_llm_response("```c\n```\n"), Err(LlmError::Parse(_))));
    }
}
