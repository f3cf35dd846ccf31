use std::sync::Arc;

use escr_core::{ContentRepositoryId, ProjectionId};

use super::{ProjectionCatchUpTrigger, TriggerError, catch_up_each};
use crate::catch_up::CatchUpOptions;
use crate::registry::ContentRepositoryRegistry;

/// In-process trigger that looks the repository up in the registry on every
/// call, so it can be wired before the repository exists.
#[derive(Debug)]
pub struct RegistryCatchUpTrigger {
    registry: Arc<ContentRepositoryRegistry>,
    repository_id: ContentRepositoryId,
    options: CatchUpOptions,
}

impl RegistryCatchUpTrigger {
    pub fn new(registry: Arc<ContentRepositoryRegistry>, repository_id: ContentRepositoryId) -> Self {
        Self {
            registry,
            repository_id,
            options: CatchUpOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CatchUpOptions) -> Self {
        self.options = options;
        self
    }
}

impl ProjectionCatchUpTrigger for RegistryCatchUpTrigger {
    fn trigger_catch_up(&self, projections: &[ProjectionId]) -> Result<(), TriggerError> {
        let repository = self.registry.get(&self.repository_id)?;
        catch_up_each(&repository, projections, &self.options)
    }
}
