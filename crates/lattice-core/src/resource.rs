//! Resource accounting contract.
//!
//! Installable intents reserve device resources under a consumer: the intent
//! key itself, or the shared resource group when the intent carries one. The
//! accounting service is delegated; the engine only drives releases when
//! withdrawals leave a consumer without live intents.

use std::fmt;

use crate::intent::{Key, ResourceGroup};

/// The entity a resource reservation is accounted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceConsumer {
    /// Reservation scoped to a single intent.
    Intent(Key),
    /// Reservation pooled across every intent sharing the group.
    Group(ResourceGroup),
}

impl fmt::Display for ResourceConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intent(key) => write!(f, "{key}"),
            Self::Group(group) => write!(f, "{group}"),
        }
    }
}

/// Resource accounting capability.
pub trait ResourceService: Send + Sync {
    /// Releases every reservation held by `consumer`. Returns `false` when
    /// the release could not be performed.
    fn release(&self, consumer: &ResourceConsumer) -> bool;
}

/// A resource service that accepts every release. Useful when no accounting
/// backend is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResourceService;

impl ResourceService for NoopResourceService {
    fn release(&self, _consumer: &ResourceConsumer) -> bool {
        true
    }
}
