//! Intent subsystem errors.

use thiserror::Error;

use super::key::Key;

/// Errors raised while processing intents.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum IntentError {
    /// No compiler is registered for the intent's kind or any of its
    /// ancestors.
    #[error("no compiler for intent kind {kind}")]
    NoCompiler {
        /// The kind that failed dispatch.
        kind: String,
    },

    /// No installer is registered for the installable's kind or any of its
    /// ancestors.
    #[error("no installer for intent kind {kind}")]
    NoInstaller {
        /// The kind that failed dispatch.
        kind: String,
    },

    /// Compilation recursed past the depth bound.
    #[error("compilation of {key} exceeded {max} levels")]
    CompilationDepth {
        /// The intent being compiled.
        key: Key,
        /// The recursion bound.
        max: usize,
    },

    /// A compiler rejected the intent.
    #[error("compilation of {key} failed: {reason}")]
    CompilationFailed {
        /// The intent being compiled.
        key: Key,
        /// The compiler's reason.
        reason: String,
    },

    /// No installer reported within the install timeout.
    #[error("install of {key} timed out after {seconds}s")]
    InstallTimeout {
        /// The intent being installed.
        key: Key,
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// One or more installers reported failure.
    #[error("installers reported failure for {key}: {reasons:?}")]
    InstallerReported {
        /// The intent being installed.
        key: Key,
        /// Aggregated installer errors.
        reasons: Vec<String>,
    },

    /// This node does not own processing for the key. Callers skip silently.
    #[error("this node is not master for {key}")]
    NotMaster {
        /// The key owned elsewhere.
        key: Key,
    },

    /// The pending request is not newer than the current data.
    #[error("stale request for {key}")]
    StaleRequest {
        /// The key with the stale request.
        key: Key,
    },

    /// The store could not persist a batch.
    #[error("store write failed: {reason}")]
    StoreWrite {
        /// The store's reason.
        reason: String,
    },
}
