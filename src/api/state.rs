use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::detect::{AlertStore, AnomalyDetector};
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub store: AlertStore,
    pub detector: Arc<AnomalyDetector>,
    pub config: Arc<PipelineConfig>,
}

impl AppState {
    pub fn new(pool: Pool, detector: Arc<AnomalyDetector>, config: PipelineConfig) -> Self {
        Self {
            store: detector.store().clone(),
            pool,
            detector,
            config: Arc::new(config),
        }
    }
}
