pub mod selector;
pub mod store;

pub use selector::HealthSelector;
pub use store::{MemoryRankingStore, RankingStore, ResourceStore};
