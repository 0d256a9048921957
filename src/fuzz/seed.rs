use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub fn now_ts_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::from_secs(0)).as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleVerdict {
    Normal,
    Bug,
    Skipped,
}

impl Default for OracleVerdict {
    fn default() -> Self {
        Self::Skipped
    }
}

/// One generated (or initial) test program with its bookkeeping. Ids are
/// handed out by the corpus and stay unique for the campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    pub id: u64,
    #[serde(default)]
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub depth: u32,
    pub content: String,
    pub created_at: u64,
    #[serde(default)]
    pub old_coverage_bp: u32,
    #[serde(default)]
    pub new_coverage_bp: u32,
    #[serde(default)]
    pub oracle_verdict: OracleVerdict,
    #[serde(default)]
    pub bug_description: Option<String>,
}

impl Seed {
    pub fn new(id: u64, content: impl Into<String>) -> Self {
        Self {
            id,
            parent_id: None,
            depth: 0,
            content: content.into(),
            created_at: now_ts_secs(),
            old_coverage_bp: 0,
            new_coverage_bp: 0,
            oracle_verdict: OracleVerdict::Skipped,
            bug_description: None,
        }
    }

    pub fn child_of(id: u64, parent: &Seed, content: impl Into<String>) -> Self {
        let mut seed = Self::new(id, content);
        seed.parent_id = Some(parent.id);
        seed.depth = parent.depth + 1;
        seed
    }
}

/// Outcome of one seed evaluation, reported back to the corpus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuzzResult {
    pub compile_failed: bool,
    #[serde(default)]
    pub compiler_output: String,
    #[serde(default)]
    pub exit_code: i32,
    pub hit_target: bool,
    pub covered_new: bool,
    pub old_coverage_bp: u32,
    pub new_coverage_bp: u32,
    pub oracle_verdict: OracleVerdict,
    #[serde(default)]
    pub bug_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_links_parent_and_depth() {
        let parent = Seed::new(4, "int a;");
        let child = Seed::child_of(9, &parent, "int b;");
        assert_eq!(child.parent_id, Some(4));
        assert_eq!(child.depth, 1);
        assert_eq!(child.oracle_verdict, OracleVerdict::Skipped);
    }

    #[test]
    fn jsonl_round_trip_tolerates_sparse_records() {
        let line = r#"{"id":3,"content":"int main(void){}","created_at":1700000000}"#;
        let seed: Seed = serde_json::from_str(line).unwrap();
        assert_eq!(seed.id, 3);
        assert_eq!(seed.depth, 0);
        assert_eq!(seed.oracle_verdict, OracleVerdict::Skipped);

        let full = serde_json::to_string(&seed).unwrap();
        let back: Seed = serde_json::from_str(&full).unwrap();
        assert_eq!(back.content, seed.content);
    }
}
