//! Shared application state.

use std::sync::Arc;

use cloudshop_core::CloudShopConfig;
use cloudshop_runtime::{Capability, Orchestrator};
use cloudshop_store::{Catalogue, DocumentStore, JobLedger, OrderBook, ResourceRegistry};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: CloudShopConfig,
    pub store: Arc<DocumentStore>,
    pub orders: OrderBook,
    pub registry: ResourceRegistry,
    pub ledger: JobLedger,
    pub catalogue: Catalogue,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(
        config: CloudShopConfig,
        store: Arc<DocumentStore>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            store.clone(),
            capability,
            config.orchestrator.clone(),
            config.default_region.clone(),
        );

        Self {
            orders: OrderBook::new(store.clone()),
            registry: ResourceRegistry::new(store.clone()),
            ledger: JobLedger::new(store.clone()),
            catalogue: Catalogue::new(store.clone()),
            orchestrator,
            store,
            config,
        }
    }
}
