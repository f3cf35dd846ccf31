use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use escr_core::ContentRepositoryId;

use crate::content_repository::ContentRepository;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("content repository '{0}' is already registered")]
    AlreadyRegistered(ContentRepositoryId),

    #[error("content repository '{0}' is not registered")]
    Unknown(ContentRepositoryId),

    #[error("content repository registry lock poisoned")]
    Poisoned,
}

/// Process-wide lookup of content repositories by id.
///
/// Asynchronous catch-up triggers resolve the repository through the
/// registry at run time instead of holding it directly.
#[derive(Debug, Default)]
pub struct ContentRepositoryRegistry {
    repositories: RwLock<HashMap<ContentRepositoryId, Arc<ContentRepository>>>,
}

impl ContentRepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, repository: Arc<ContentRepository>) -> Result<(), RegistryError> {
        let mut repositories = self.repositories.write().map_err(|_| RegistryError::Poisoned)?;
        if repositories.contains_key(repository.id()) {
            return Err(RegistryError::AlreadyRegistered(repository.id().clone()));
        }
        repositories.insert(repository.id().clone(), repository);
        Ok(())
    }

    pub fn get(&self, id: &ContentRepositoryId) -> Result<Arc<ContentRepository>, RegistryError> {
        self.repositories
            .read()
            .map_err(|_| RegistryError::Poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(id.clone()))
    }

    pub fn ids(&self) -> Vec<ContentRepositoryId> {
        self.repositories
            .read()
            .map(|r| {
                let mut ids: Vec<_> = r.keys().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }
}
