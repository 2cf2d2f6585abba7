//! Intent installation dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::coordinator::InstallFeedback;
use super::data::IntentData;
use super::error::IntentError;
use super::key::Key;
use super::types::{Intent, IntentKind};

/// Applies installables of one kind to the network.
///
/// An installer MUST ultimately report exactly one of
/// [`InstallFeedback::success`] or [`InstallFeedback::failed`] for every
/// context it is handed; the feedback handle travels inside the context.
pub trait IntentInstaller: Send + Sync {
    /// Applies the operation described by `context`: uninstall
    /// `context.intents_to_uninstall()`, install
    /// `context.intents_to_install()`.
    fn apply(&self, context: IntentOperationContext);
}

/// One installer's slice of an install operation.
///
/// Holds the installables of a single kind to remove and to apply, the
/// whole-intent data the operation stems from, error annotations, and the
/// completion callback bound to the coordinator.
#[derive(Clone)]
pub struct IntentOperationContext {
    key: Key,
    kind: IntentKind,
    intents_to_uninstall: Vec<Intent>,
    intents_to_install: Vec<Intent>,
    to_uninstall: Option<IntentData>,
    to_install: Option<IntentData>,
    errors: Vec<String>,
    feedback: InstallFeedback,
}

impl IntentOperationContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: Key,
        kind: IntentKind,
        intents_to_uninstall: Vec<Intent>,
        intents_to_install: Vec<Intent>,
        to_uninstall: Option<IntentData>,
        to_install: Option<IntentData>,
        feedback: InstallFeedback,
    ) -> Self {
        Self {
            key,
            kind,
            intents_to_uninstall,
            intents_to_install,
            to_uninstall,
            to_install,
            errors: Vec::new(),
            feedback,
        }
    }

    /// The intent key the operation belongs to.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The installable kind this context dispatches on.
    #[must_use]
    pub fn kind(&self) -> &IntentKind {
        &self.kind
    }

    /// Installables to remove from the network.
    #[must_use]
    pub fn intents_to_uninstall(&self) -> &[Intent] {
        &self.intents_to_uninstall
    }

    /// Installables to apply to the network.
    #[must_use]
    pub fn intents_to_install(&self) -> &[Intent] {
        &self.intents_to_install
    }

    /// The data being replaced, when the operation replaces an installation.
    #[must_use]
    pub fn to_uninstall(&self) -> Option<&IntentData> {
        self.to_uninstall.as_ref()
    }

    /// The data being installed.
    #[must_use]
    pub fn to_install(&self) -> Option<&IntentData> {
        self.to_install.as_ref()
    }

    /// Errors the installer annotated before reporting failure.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Annotates a failure reason.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// The completion callback bound to the coordinator.
    #[must_use]
    pub fn feedback(&self) -> InstallFeedback {
        self.feedback.clone()
    }
}

impl std::fmt::Debug for IntentOperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentOperationContext")
            .field("key", &self.key)
            .field("kind", &self.kind.name())
            .field("uninstall", &self.intents_to_uninstall.len())
            .field("install", &self.intents_to_install.len())
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

/// Registry mapping installable kinds to installers.
///
/// Same shape as the compiler registry: lookup walks the kind's ancestor
/// chain.
#[derive(Default)]
pub struct InstallerRegistry {
    installers: Mutex<HashMap<String, Arc<dyn IntentInstaller>>>,
}

impl InstallerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `installer` for `kind`, replacing any previous registration.
    pub fn register(&self, kind: &IntentKind, installer: Arc<dyn IntentInstaller>) {
        self.installers
            .lock()
            .expect("installer registry lock poisoned")
            .insert(kind.name().to_string(), installer);
    }

    /// Removes the registration for `kind`.
    pub fn unregister(&self, kind: &IntentKind) {
        self.installers
            .lock()
            .expect("installer registry lock poisoned")
            .remove(kind.name());
    }

    /// Names of the kinds with a registered installer.
    #[must_use]
    pub fn registered_kinds(&self) -> Vec<String> {
        self.installers
            .lock()
            .expect("installer registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Resolves the installer for `kind`, walking its ancestor chain.
    ///
    /// # Errors
    ///
    /// Returns [`IntentError::NoInstaller`] when neither the kind nor any
    /// ancestor has a registration.
    pub fn get_installer(
        &self,
        kind: &IntentKind,
    ) -> Result<Arc<dyn IntentInstaller>, IntentError> {
        let installers = self
            .installers
            .lock()
            .expect("installer registry lock poisoned");
        for name in kind.lineage() {
            if let Some(installer) = installers.get(name) {
                return Ok(Arc::clone(installer));
            }
        }
        Err(IntentError::NoInstaller {
            kind: kind.name().to_string(),
        })
    }
}
