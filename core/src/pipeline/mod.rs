pub mod models;
pub mod traits;

pub use models::{
    derived_event_id, AnalysisContext, AnalysisResult, Comment, DerivedEvent, HarvestTask, Page,
    Post, Taxonomy,
};
pub use traits::{
    AnalyzerPlugin, IngestionSource, PersistencePlugin, RankingStore, ResourceStore,
    TaskQueuePlugin, UpstreamPlugin,
};
