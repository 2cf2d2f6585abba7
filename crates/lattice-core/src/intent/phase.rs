//! The per-key phase pipeline.
//!
//! Each batched request walks a chain of phases until a final phase yields
//! the next durable [`IntentData`] (or nothing, for skips). Compiling is
//! synchronous; Installing and Withdrawing suspend on the coordinator's
//! completion handle, bounded by the install timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::coordinator::InstallOutcome;
use super::data::{IntentData, IntentRequest, IntentState};
use super::error::IntentError;
use super::event::{IntentEvent, IntentEventKind};
use super::key::Key;
use super::types::Intent;

/// The pipeline's window onto the manager: compilation, install dispatch, and
/// event announcement.
pub(crate) trait IntentProcessor: Send + Sync {
    /// Compiles `intent` down to installables.
    fn compile(
        &self,
        intent: &Intent,
        previous: Option<&[Intent]>,
    ) -> Result<Vec<Intent>, IntentError>;

    /// Dispatches an install operation and returns its completion handle.
    fn apply(
        &self,
        to_uninstall: Option<IntentData>,
        to_install: Option<IntentData>,
    ) -> oneshot::Receiver<InstallOutcome>;

    /// Abandons the pending operation for `key` so late reports are dropped.
    fn abandon(&self, key: &Key);

    /// Announces a transitional lifecycle event.
    fn announce(&self, event: IntentEvent);
}

pub(crate) struct PhaseContext {
    pub processor: Arc<dyn IntentProcessor>,
    pub install_timeout: Duration,
}

/// One step of the per-intent state machine.
pub(crate) enum IntentProcessPhase {
    Initial {
        pending: IntentData,
        current: Option<IntentData>,
    },
    Compiling {
        pending: IntentData,
        current: Option<IntentData>,
    },
    Installing {
        pending: IntentData,
        current: Option<IntentData>,
    },
    Withdrawing {
        pending: IntentData,
        current: Option<IntentData>,
    },
    Purging {
        pending: IntentData,
    },
    Installed(IntentData),
    Withdrawn(IntentData),
    Failed(IntentData),
    Corrupt(IntentData),
    Skipped,
}

/// Walks `phase` to completion and returns the datum to write, if any.
pub(crate) async fn execute(
    mut phase: IntentProcessPhase,
    ctx: &PhaseContext,
) -> Option<IntentData> {
    loop {
        phase = match phase {
            IntentProcessPhase::Initial { pending, current } => initial(pending, current),
            IntentProcessPhase::Compiling { pending, current } => {
                compiling(pending, current, ctx)
            }
            IntentProcessPhase::Installing { pending, current } => {
                installing(pending, current, ctx).await
            }
            IntentProcessPhase::Withdrawing { pending, current } => {
                withdrawing(pending, current, ctx).await
            }
            IntentProcessPhase::Purging { pending } => return Some(pending),
            IntentProcessPhase::Installed(data)
            | IntentProcessPhase::Withdrawn(data)
            | IntentProcessPhase::Failed(data)
            | IntentProcessPhase::Corrupt(data) => return Some(data),
            IntentProcessPhase::Skipped => return None,
        };
    }
}

fn initial(pending: IntentData, current: Option<IntentData>) -> IntentProcessPhase {
    match pending.request() {
        IntentRequest::Submit => {
            let stale = current
                .as_ref()
                .and_then(IntentData::version)
                .zip(pending.version())
                .is_some_and(|(cur, pen)| cur >= pen);
            if stale {
                debug!(key = %pending.key(), "skipping stale submit");
                IntentProcessPhase::Skipped
            } else {
                IntentProcessPhase::Compiling { pending, current }
            }
        }
        IntentRequest::Withdraw => IntentProcessPhase::Withdrawing { pending, current },
        IntentRequest::Purge => {
            let purgeable = current
                .as_ref()
                .map_or(true, |cur| cur.state().is_terminal());
            if purgeable {
                IntentProcessPhase::Purging { pending }
            } else {
                warn!(key = %pending.key(), "purge requested while not terminal");
                IntentProcessPhase::Failed(
                    pending
                        .advance(IntentState::Failed)
                        .with_error("purge requested while intent is not terminal"),
                )
            }
        }
    }
}

fn compiling(
    pending: IntentData,
    current: Option<IntentData>,
    ctx: &PhaseContext,
) -> IntentProcessPhase {
    ctx.processor.announce(IntentEvent::new(
        IntentEventKind::Compiling,
        pending.intent().clone(),
    ));
    let previous = current.as_ref().map(IntentData::installables);
    match ctx.processor.compile(pending.intent(), previous) {
        Ok(installables) => {
            let unchanged = current.as_ref().is_some_and(|cur| {
                cur.state() == IntentState::Installed
                    && cur.intent() == pending.intent()
                    && cur.installables() == installables.as_slice()
            });
            if unchanged {
                debug!(key = %pending.key(), "installables unchanged, skipping");
                return IntentProcessPhase::Skipped;
            }
            IntentProcessPhase::Installing {
                pending: pending
                    .advance(IntentState::Installing)
                    .with_installables(installables),
                current,
            }
        }
        Err(err) => {
            warn!(key = %pending.key(), "compilation failed: {err}");
            IntentProcessPhase::Failed(pending.advance(IntentState::Failed).with_error(err))
        }
    }
}

async fn installing(
    pending: IntentData,
    current: Option<IntentData>,
    ctx: &PhaseContext,
) -> IntentProcessPhase {
    ctx.processor.announce(IntentEvent::new(
        IntentEventKind::Installing,
        pending.intent().clone(),
    ));
    let to_uninstall = current
        .as_ref()
        .filter(|cur| !cur.installables().is_empty())
        .cloned();
    let done = ctx.processor.apply(to_uninstall, Some(pending.clone()));
    join_operation(pending, done, ctx, IntentState::Installed).await
}

async fn withdrawing(
    pending: IntentData,
    current: Option<IntentData>,
    ctx: &PhaseContext,
) -> IntentProcessPhase {
    ctx.processor.announce(IntentEvent::new(
        IntentEventKind::Withdrawing,
        pending.intent().clone(),
    ));
    let to_uninstall = current
        .as_ref()
        .filter(|cur| !cur.installables().is_empty())
        .cloned();
    if to_uninstall.is_none() {
        // Nothing was ever installed; the withdrawal is trivially complete.
        return IntentProcessPhase::Withdrawn(pending.advance(IntentState::Withdrawn));
    }
    let done = ctx.processor.apply(to_uninstall, None);
    join_operation(pending, done, ctx, IntentState::Withdrawn).await
}

async fn join_operation(
    pending: IntentData,
    done: oneshot::Receiver<InstallOutcome>,
    ctx: &PhaseContext,
    on_success: IntentState,
) -> IntentProcessPhase {
    match timeout(ctx.install_timeout, done).await {
        Ok(Ok(InstallOutcome::Success)) => match on_success {
            IntentState::Withdrawn => {
                IntentProcessPhase::Withdrawn(pending.advance(IntentState::Withdrawn))
            }
            _ => IntentProcessPhase::Installed(pending.advance(IntentState::Installed)),
        },
        Ok(Ok(InstallOutcome::Failure {
            errors,
            any_succeeded,
        })) => {
            warn!(key = %pending.key(), ?errors, "install operation failed");
            if pending.intent().allows_partial_failure() && any_succeeded {
                IntentProcessPhase::Corrupt(
                    pending.advance(IntentState::Corrupt).with_errors(errors),
                )
            } else {
                IntentProcessPhase::Failed(
                    pending.advance(IntentState::Failed).with_errors(errors),
                )
            }
        }
        Ok(Err(_)) => {
            warn!(key = %pending.key(), "install coordination aborted");
            IntentProcessPhase::Failed(
                pending
                    .advance(IntentState::Failed)
                    .with_error("install coordination aborted"),
            )
        }
        Err(_) => {
            let err = IntentError::InstallTimeout {
                key: pending.key().clone(),
                seconds: ctx.install_timeout.as_secs(),
            };
            warn!("{err}");
            ctx.processor.abandon(pending.key());
            IntentProcessPhase::Failed(pending.advance(IntentState::Failed).with_error(err))
        }
    }
}
