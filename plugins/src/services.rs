//! `ServicesFactory` implementation: builds every pipeline collaborator from
//! config so the CLI never touches concrete plugin types.
use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::api::{AppConfig, CliError, Services, ServicesFactory};

use crate::factory;
use crate::handlers::HarvestDeps;
use crate::source::FeedSource;

#[derive(Default)]
pub struct PluginServicesFactory;

#[async_trait]
impl ServicesFactory for PluginServicesFactory {
    async fn build_services(&self, cfg: &AppConfig) -> Result<Services, CliError> {
        let upstream = factory::build_upstream(cfg)?;
        let analyzer = factory::build_analyzer(cfg)?;
        let persistence = factory::build_persistence(cfg).await?;
        let retry = factory::build_retry(cfg);
        let guard = factory::build_guard(cfg);
        let queue = factory::build_queue(cfg);

        let deps = HarvestDeps {
            upstream: upstream.clone(),
            analyzer: analyzer.clone(),
            persistence: persistence.clone(),
            guard: guard.clone(),
            retry: retry.clone(),
            max_comment_pages: cfg.upstream.max_comment_pages,
            recent_events_limit: cfg.analysis.recent_events_limit,
        };
        let engine = factory::build_engine(&deps, &cfg.engine)?;
        let source = Arc::new(FeedSource::new(upstream.clone(), guard.clone(), retry.clone()));

        tracing::debug!(
            upstream = upstream.name(),
            analyzer = analyzer.name(),
            persistence = persistence
                .directory()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "memory".into()),
            retry = retry.name(),
            accounts = cfg.accounts.len(),
            "services built"
        );

        Ok(Services {
            upstream,
            analyzer,
            persistence,
            queue,
            source,
            guard,
            retry,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_default_services() {
        let services = PluginServicesFactory
            .build_services(&AppConfig::default())
            .await
            .unwrap();
        assert_eq!(services.engine.registry().len(), 4);
        assert_eq!(services.analyzer.name(), "keyword");
    }
}
