//! Application wiring: one shared clock, one spy bus, and the three
//! services composed for the HTTP shell and for embedded/test use.

use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::Result;
use crate::init::{InitApplier, InitConfig};
use crate::queue::QueueRegistry;
use crate::spy::SpyBus;
use crate::store::ObjectStore;
use crate::topic::{Publisher, TopicRegistry};

/// All engine state, shared behind `Arc`.
pub struct App {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub spy: Arc<SpyBus>,
    pub queues: Arc<QueueRegistry>,
    pub topics: Arc<TopicRegistry>,
    pub publisher: Publisher,
    pub store: Arc<ObjectStore>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build with a substitute clock (tests).
    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        let spy = Arc::new(SpyBus::new(config.spy_capacity));
        let queues = Arc::new(QueueRegistry::new(
            clock.clone(),
            spy.clone(),
            config.external_host.clone(),
        ));
        let topics = Arc::new(TopicRegistry::new());
        let endpoint_host = config
            .external_host
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", config.port));
        let publisher = Publisher::new(
            topics.clone(),
            queues.clone(),
            spy.clone(),
            clock.clone(),
            endpoint_host,
        );
        let store = Arc::new(ObjectStore::new(clock.clone(), spy.clone()));
        Self {
            config,
            clock,
            spy,
            queues,
            topics,
            publisher,
            store,
        }
    }

    /// Materialize a declarative init config.
    pub async fn apply_init(&self, config: &InitConfig) -> Result<()> {
        let host = self
            .config
            .external_host
            .clone()
            .unwrap_or_else(|| format!("localhost:{}", self.config.port));
        let applier = InitApplier::new(
            self.queues.clone(),
            self.topics.clone(),
            self.store.clone(),
            self.config.default_region.clone(),
            host,
        );
        applier.apply(config).await?;
        info!("startup resources ready");
        Ok(())
    }
}
