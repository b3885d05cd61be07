//! Static model catalog built from configuration

use async_trait::async_trait;
use parking_lot::RwLock;

use super::traits::{BackendError, ModelCatalog};
use crate::routing::selector::ModelDescriptor;

/// Catalog serving a fixed, replaceable descriptor list
#[derive(Debug, Default)]
pub struct StaticCatalog {
    models: RwLock<Vec<ModelDescriptor>>,
}

impl StaticCatalog {
    /// Create a catalog from descriptors
    #[must_use]
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self {
            models: RwLock::new(models),
        }
    }

    /// Replace the descriptor list
    pub fn replace(&self, models: Vec<ModelDescriptor>) {
        *self.models.write() = models;
    }
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    async fn list(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        Ok(self.models.read().clone())
    }
}
