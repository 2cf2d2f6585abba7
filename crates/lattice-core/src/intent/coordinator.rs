//! Install coordination.
//!
//! The coordinator fans one intent's installables out to installers keyed by
//! installable kind, parks a completion handle for the key, and joins the
//! installers' reports back into a single outcome. The phase pipeline awaits
//! the handle; installers report through [`InstallFeedback`] exactly once per
//! context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::data::IntentData;
use super::installer::{InstallerRegistry, IntentOperationContext};
use super::key::Key;
use super::types::{Intent, IntentKind};

/// Joined result of one install operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Every installer reported success.
    Success,
    /// At least one installer failed or was missing.
    Failure {
        /// Aggregated installer errors.
        errors: Vec<String>,
        /// `true` when some installers did succeed; feeds the CORRUPT
        /// distinction for partial-failure-tolerant intents.
        any_succeeded: bool,
    },
}

struct PendingInstall {
    remaining: usize,
    succeeded: usize,
    failed: usize,
    errors: Vec<String>,
    done: Option<oneshot::Sender<InstallOutcome>>,
}

#[derive(Default)]
struct CoordinatorShared {
    pending: Mutex<HashMap<Key, PendingInstall>>,
}

/// Dispatches install operations and joins installer reports.
#[derive(Clone)]
pub struct InstallCoordinator {
    registry: Arc<InstallerRegistry>,
    shared: Arc<CoordinatorShared>,
}

impl InstallCoordinator {
    /// Creates a coordinator dispatching through `registry`.
    #[must_use]
    pub fn new(registry: Arc<InstallerRegistry>) -> Self {
        Self {
            registry,
            shared: Arc::new(CoordinatorShared::default()),
        }
    }

    /// Starts the install operation replacing `to_uninstall` with
    /// `to_install` and returns the completion handle the pipeline awaits.
    /// At least one side must be present.
    ///
    /// # Panics
    ///
    /// Panics when both sides are absent; the pipeline never dispatches an
    /// empty operation.
    #[must_use]
    pub fn install_intents(
        &self,
        to_uninstall: Option<IntentData>,
        to_install: Option<IntentData>,
    ) -> oneshot::Receiver<InstallOutcome> {
        let key = to_install
            .as_ref()
            .or(to_uninstall.as_ref())
            .map(|data| data.key().clone())
            .expect("install operation without data");

        let uninstall_by_kind = group_by_kind(
            to_uninstall
                .as_ref()
                .map(IntentData::installables)
                .unwrap_or_default(),
        );
        let install_by_kind = group_by_kind(
            to_install
                .as_ref()
                .map(IntentData::installables)
                .unwrap_or_default(),
        );

        let mut kinds: Vec<IntentKind> = Vec::new();
        for kind in uninstall_by_kind.keys().chain(install_by_kind.keys()) {
            if !kinds.contains(kind) {
                kinds.push(kind.clone());
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        if kinds.is_empty() {
            // Nothing to do on any device; the operation is trivially done.
            let _ = done_tx.send(InstallOutcome::Success);
            return done_rx;
        }

        let feedback = InstallFeedback {
            shared: Arc::downgrade(&self.shared),
        };
        let contexts: Vec<IntentOperationContext> = kinds
            .into_iter()
            .map(|kind| {
                IntentOperationContext::new(
                    key.clone(),
                    kind.clone(),
                    uninstall_by_kind.get(&kind).cloned().unwrap_or_default(),
                    install_by_kind.get(&kind).cloned().unwrap_or_default(),
                    to_uninstall.clone(),
                    to_install.clone(),
                    feedback.clone(),
                )
            })
            .collect();

        self.shared.pending.lock().expect("pending lock poisoned").insert(
            key.clone(),
            PendingInstall {
                remaining: contexts.len(),
                succeeded: 0,
                failed: 0,
                errors: Vec::new(),
                done: Some(done_tx),
            },
        );
        debug!(key = %key, installers = contexts.len(), "dispatching install operation");

        // The pending entry is in place before any installer runs, so a
        // synchronous report from apply() joins correctly.
        for context in contexts {
            match self.registry.get_installer(context.kind()) {
                Ok(installer) => installer.apply(context),
                Err(err) => {
                    warn!(key = %key, kind = %context.kind(), "{err}");
                    let mut failed = context;
                    failed.add_error(err.to_string());
                    feedback.failed(failed);
                }
            }
        }
        done_rx
    }

    /// Installer success report endpoint.
    pub fn success(&self, context: IntentOperationContext) {
        finish(&self.shared, &context, true);
    }

    /// Installer failure report endpoint.
    pub fn failed(&self, context: IntentOperationContext) {
        finish(&self.shared, &context, false);
    }

    /// Drops the pending operation for `key`; subsequent reports are
    /// discarded. Called by the pipeline when the install timed out.
    pub(crate) fn abandon(&self, key: &Key) {
        if self
            .shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(key)
            .is_some()
        {
            debug!(key = %key, "abandoned install operation");
        }
    }
}

/// Completion callback handed to installers inside their operation context.
#[derive(Clone)]
pub struct InstallFeedback {
    shared: Weak<CoordinatorShared>,
}

impl InstallFeedback {
    /// Reports that the context's operation succeeded.
    pub fn success(&self, context: IntentOperationContext) {
        if let Some(shared) = self.shared.upgrade() {
            finish(&shared, &context, true);
        }
    }

    /// Reports that the context's operation failed.
    pub fn failed(&self, context: IntentOperationContext) {
        if let Some(shared) = self.shared.upgrade() {
            finish(&shared, &context, false);
        }
    }
}

fn finish(shared: &CoordinatorShared, context: &IntentOperationContext, success: bool) {
    let mut pending = shared.pending.lock().expect("pending lock poisoned");
    let Some(entry) = pending.get_mut(context.key()) else {
        trace!(key = %context.key(), "late install report discarded");
        return;
    };
    if success {
        entry.succeeded += 1;
    } else {
        entry.failed += 1;
        entry.errors.extend(context.errors().iter().cloned());
    }
    entry.remaining -= 1;
    if entry.remaining > 0 {
        return;
    }

    let entry = pending.remove(context.key()).expect("entry present");
    drop(pending);
    let outcome = if entry.failed == 0 {
        InstallOutcome::Success
    } else {
        InstallOutcome::Failure {
            errors: entry.errors,
            any_succeeded: entry.succeeded > 0,
        }
    };
    if let Some(done) = entry.done {
        if done.send(outcome).is_err() {
            trace!(key = %context.key(), "install outcome dropped, pipeline gone");
        }
    }
}

fn group_by_kind(installables: &[Intent]) -> HashMap<IntentKind, Vec<Intent>> {
    let mut grouped: HashMap<IntentKind, Vec<Intent>> = HashMap::new();
    for installable in installables {
        grouped
            .entry(installable.kind().clone())
            .or_default()
            .push(installable.clone());
    }
    grouped
}
