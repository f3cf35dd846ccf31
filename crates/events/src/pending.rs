//! Which projections a commit is waiting for, and how far.
//!
//! Projections subscribe selectively, so after a commit each projection only
//! has to reach the sequence number of the **last** committed event it can
//! handle. Waiting for the global highest sequence number instead would make
//! callers wait for unrelated work of unrelated projections.

use thiserror::Error;

use escr_core::{CoreError, ProjectionId, SequenceNumber};

use crate::{Event, Projections};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingProjectionsError {
    /// The committed batch cannot end at the reported highest sequence number.
    #[error("committed batch is not contiguous: {0}")]
    NonContiguousBatch(#[source] CoreError),
}

/// Projection -> sequence number it must reach before the caller may proceed.
///
/// Built once per commit, immutable afterwards. A projection is present iff at
/// least one committed event satisfies its `can_handle`; the mapped value is
/// the highest such event's sequence number. Entries keep the registration
/// order of the projections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingProjections {
    entries: Vec<(ProjectionId, SequenceNumber)>,
}

impl PendingProjections {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compute the pending projections for a just-committed batch.
    ///
    /// `committed` must be the exact, contiguous batch whose last element was
    /// committed at `highest_committed`. The walk is forward and only ever
    /// increases the sequence number, so overwriting an entry keeps the
    /// highest match.
    pub fn calculate(
        projections: &Projections,
        committed: &[Event],
        highest_committed: SequenceNumber,
    ) -> Result<Self, PendingProjectionsError> {
        if committed.is_empty() {
            return Ok(Self::empty());
        }

        let start = highest_committed
            .batch_start(committed.len())
            .map_err(PendingProjectionsError::NonContiguousBatch)?;

        let mut highest: Vec<Option<SequenceNumber>> = vec![None; projections.len()];
        let mut seq = start;
        for event in committed {
            for (slot, projection) in highest.iter_mut().zip(projections.iter()) {
                if projection.can_handle(event) {
                    *slot = Some(seq);
                }
            }
            seq = seq.next();
        }

        let entries = projections
            .iter()
            .zip(highest)
            .filter_map(|(projection, seq)| seq.map(|seq| (projection.id().clone(), seq)))
            .collect();

        Ok(Self { entries })
    }

    /// Sequence number `projection` must reach, if it is pending.
    pub fn get(&self, projection: &ProjectionId) -> Option<SequenceNumber> {
        self.entries
            .iter()
            .find(|(id, _)| id == projection)
            .map(|(_, seq)| *seq)
    }

    pub fn contains(&self, projection: &ProjectionId) -> bool {
        self.get(projection).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProjectionId, SequenceNumber)> {
        self.entries.iter().map(|(id, seq)| (id, *seq))
    }

    pub fn projection_ids(&self) -> Vec<ProjectionId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
