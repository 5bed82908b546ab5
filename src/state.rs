use crate::allowlist::AllowList;
use crate::codec::ImageCodec;
use crate::config::Config;
use crate::executor::TransformExecutor;
use crate::fetch::SourceFetcher;
use crate::jobs::JobCoordinator;
use crate::storage::BlobStore;
use crate::transform::PresetTable;
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub allow_list: Arc<AllowList>,
    pub store: Arc<dyn BlobStore>,
    pub jobs: JobCoordinator,
    pub executor: TransformExecutor,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn BlobStore>,
        fetcher: Arc<dyn SourceFetcher>,
        codec: Arc<dyn ImageCodec>,
    ) -> Result<Self> {
        let allow_list = match &config.allowed_urls {
            Some(patterns) => {
                AllowList::from_patterns(patterns).context("compile ALLOWED_URLS patterns")?
            }
            None => AllowList::allow_all(),
        };
        let jobs = JobCoordinator::new(config.max_parallel_transformations, config.job_timeout);
        let executor = TransformExecutor::new(fetcher, codec, store.clone());
        Ok(Self {
            config: Arc::new(config),
            allow_list: Arc::new(allow_list),
            store,
            jobs,
            executor,
        })
    }

    pub fn presets(&self) -> &PresetTable {
        &self.config.presets
    }
}
