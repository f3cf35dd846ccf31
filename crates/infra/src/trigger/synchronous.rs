use std::sync::Arc;

use escr_core::ProjectionId;

use super::{ProjectionCatchUpTrigger, TriggerError, catch_up_each};
use crate::catch_up::CatchUpOptions;
use crate::content_repository::ContentRepository;

/// Runs catch-up on the calling thread before returning.
///
/// After `trigger_catch_up` returns `Ok`, every triggered projection has
/// applied everything committed so far.
#[derive(Debug)]
pub struct SynchronousCatchUpTrigger {
    repository: Arc<ContentRepository>,
    options: CatchUpOptions,
}

impl SynchronousCatchUpTrigger {
    pub fn new(repository: Arc<ContentRepository>) -> Self {
        Self {
            repository,
            options: CatchUpOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CatchUpOptions) -> Self {
        self.options = options;
        self
    }
}

impl ProjectionCatchUpTrigger for SynchronousCatchUpTrigger {
    fn trigger_catch_up(&self, projections: &[ProjectionId]) -> Result<(), TriggerError> {
        catch_up_each(&self.repository, projections, &self.options)
    }
}
