use std::sync::Arc;

use crate::{config::AppConfig, orchestrator::Orchestrator, scheduler::Scheduler};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let scheduler = Scheduler::new(orchestrator.clone(), &config.sync);
        Self {
            config: Arc::new(config),
            orchestrator,
            scheduler,
        }
    }

    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let orchestrator = Orchestrator::from_config(&config)?;
        Ok(Self::new(config, orchestrator))
    }
}
