//! The fuzzing loop and its corpus plumbing.

pub mod corpus;
pub mod engine;
pub mod jsonl;
pub mod seed;

pub use corpus::{JsonlCorpus, SeedCorpus};
pub use engine::{EngineStats, FuzzEngine};
pub use seed::{FuzzResult, OracleVerdict, Seed};
