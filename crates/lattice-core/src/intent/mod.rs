//! The intent subsystem.
//!
//! Applications submit declarative connectivity [`Intent`]s keyed by
//! [`Key`]. The [`IntentManager`] drives every accepted request through a
//! batched, per-key phase pipeline: compile (via the [`CompilerRegistry`]),
//! install (fanned out to [`IntentInstaller`]s by the
//! [`InstallCoordinator`]), withdraw, purge. The [`IntentStore`] owns all
//! durable intent state; the [`IntentAccumulator`] coalesces its
//! notifications into batches with at most one batch in flight.

pub mod accumulator;
pub mod compiler;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod event;
pub mod installer;
pub mod key;
pub mod manager;
pub(crate) mod phase;
pub mod simple_store;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use accumulator::IntentAccumulator;
pub use compiler::{CompilerRegistry, IntentCompiler, MAX_COMPILE_DEPTH};
pub use coordinator::{InstallCoordinator, InstallFeedback, InstallOutcome};
pub use data::{IntentData, IntentRequest, IntentState, Version};
pub use error::IntentError;
pub use event::{IntentEvent, IntentEventKind};
pub use installer::{InstallerRegistry, IntentInstaller, IntentOperationContext};
pub use key::Key;
pub use manager::{IntentManager, IntentTracker};
pub use simple_store::SimpleIntentStore;
pub use store::{IntentStore, IntentStoreDelegate};
pub use types::{kinds, Constraint, Intent, IntentBuilder, IntentKind, ResourceGroup};
