use std::sync::Arc;

use neo4rs::Graph;

use crate::{config::AppConfig, pipeline::Pipeline};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub graph: Arc<Graph>,
    pub pipeline: Arc<Pipeline>,
}
