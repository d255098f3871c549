pub mod cache;
pub mod scheduler;

pub use cache::DedupCache;
pub use scheduler::{next_interval, AdaptiveScheduler, CycleReport};
