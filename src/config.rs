use std::path::PathBuf;

pub const DEFAULT_RNG_SEED: u64 = 2026;
pub const DEFAULT_WEIGHT_DECAY: f64 = 0.8;
pub const DEFAULT_DIVERGENCE_CONTEXT: usize = 5;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// One fuzzing campaign against a single compiler-under-test.
#[derive(Debug, Clone)]
pub struct FuzzConfig {
    /// Functions of the compiler-under-test the campaign drives coverage in.
    pub target_functions: Vec<String>,
    /// Post-pass CFG dump for the translation unit holding the targets.
    pub cfg_dump_path: PathBuf,
    /// Compiler-under-test driver, handed to the trace tool for divergence runs.
    pub compiler_path: PathBuf,
    /// Where the line -> seeds mapping is checkpointed.
    pub mapping_path: PathBuf,
    /// Working directory for generated seed sources.
    pub work_dir: PathBuf,

    pub max_iterations: u64,
    pub max_retries: usize,
    /// Factor in (0, 1] applied to a BB weight after each failed round.
    pub weight_decay: f64,
    /// Call-sequence context kept on each side of a divergence point.
    pub divergence_context: usize,
    /// Mapping + corpus are saved every this many iterations.
    pub checkpoint_interval: u64,
    /// Enter the random mutation phase once coverage saturates.
    pub enable_random_phase: bool,

    pub rng_seed: u64,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            target_functions: Vec::new(),
            cfg_dump_path: PathBuf::new(),
            compiler_path: PathBuf::new(),
            mapping_path: PathBuf::from("out/coverage_mapping.json"),
            work_dir: PathBuf::from("out/seeds"),
            max_iterations: 1000,
            max_retries: 3,
            weight_decay: DEFAULT_WEIGHT_DECAY,
            divergence_context: DEFAULT_DIVERGENCE_CONTEXT,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            enable_random_phase: false,
            rng_seed: DEFAULT_RNG_SEED,
        }
    }
}
