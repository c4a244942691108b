//! Shared handler state.

use crate::{
    cache_controller::CacheController,
    services::{
        document_service::DocumentService, optimizer_service::OptimizerService,
        storage_service::StorageService,
    },
};
use axum::extract::FromRef;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub documents: DocumentService,
    pub optimizer: Arc<OptimizerService>,
    /// Present only when a web origin is configured and the controller
    /// installed and activated at startup.
    pub edge: Option<CacheController>,
}

impl FromRef<AppState> for StorageService {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}

impl FromRef<AppState> for DocumentService {
    fn from_ref(state: &AppState) -> Self {
        state.documents.clone()
    }
}

impl FromRef<AppState> for Arc<OptimizerService> {
    fn from_ref(state: &AppState) -> Self {
        state.optimizer.clone()
    }
}

impl FromRef<AppState> for Option<CacheController> {
    fn from_ref(state: &AppState) -> Self {
        state.edge.clone()
    }
}
