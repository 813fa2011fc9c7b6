use crate::Tipset;
use std::sync::Arc;

/// How a head-change event relates to the subscriber's view of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadChangeKind {
    /// The tipset extends the canonical chain.
    Apply,
    /// The tipset was abandoned by a reorganization.
    Revert,
    /// Snapshot of the current head, sent once on subscription.
    Current,
}

/// Head-change notification delivered to subscribers.
#[derive(Clone, Debug)]
pub struct HeadChange {
    /// Relation of the carried tipset to the canonical chain.
    pub kind: HeadChangeKind,
    /// The tipset the event refers to.
    pub tipset: Arc<Tipset>,
}
