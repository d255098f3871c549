use std::sync::Arc;

use crate::admission::{AdmissionGuard, RetryStrategyPlugin};
use crate::config::AppConfig;
use crate::error::CliError;
use crate::executor::WorkflowEngine;
use crate::pipeline::{
    AnalyzerPlugin, IngestionSource, PersistencePlugin, TaskQueuePlugin, UpstreamPlugin,
};

/// Every collaborator the pipeline needs, assembled once at process start.
#[derive(Clone)]
pub struct Services {
    pub upstream: Arc<dyn UpstreamPlugin>,
    pub analyzer: Arc<dyn AnalyzerPlugin>,
    pub persistence: Arc<dyn PersistencePlugin>,
    pub queue: Arc<dyn TaskQueuePlugin>,
    pub source: Arc<dyn IngestionSource>,
    pub guard: Arc<AdmissionGuard>,
    pub retry: Arc<dyn RetryStrategyPlugin>,
    pub engine: WorkflowEngine,
}

#[async_trait::async_trait]
pub trait ServicesFactory: Send + Sync {
    async fn build_services(&self, cfg: &AppConfig) -> Result<Services, CliError>;
}

#[derive(Clone)]
pub struct AppContext {
    cfg: AppConfig,
    services_factory: Option<Arc<dyn ServicesFactory>>,
}

impl AppContext {
    pub fn new(
        cfg: AppConfig,
        services_factory: Option<Arc<dyn ServicesFactory>>,
    ) -> Result<Self, CliError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            services_factory,
        })
    }

    pub fn cfg(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn with_config(&self, cfg: AppConfig) -> Self {
        Self {
            cfg,
            services_factory: self.services_factory.clone(),
        }
    }

    pub async fn build_services(&self) -> Result<Services, CliError> {
        let Some(factory) = self.services_factory.as_ref() else {
            return Err(CliError::Config(
                "services_factory missing (cannot build plugins/services)".into(),
            ));
        };
        factory.build_services(&self.cfg).await
    }
}
