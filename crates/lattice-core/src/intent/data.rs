//! The mutable envelope around an intent.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::key::Key;
use super::types::Intent;

/// The request an [`IntentData`] is carrying through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentRequest {
    /// Install (or reinstall) the intent.
    Submit,
    /// Remove the intent from the network.
    Withdraw,
    /// Forget the intent entirely once terminal.
    Purge,
}

impl fmt::Display for IntentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submit => "SUBMIT",
            Self::Withdraw => "WITHDRAW",
            Self::Purge => "PURGE",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    /// A submit request was accepted and awaits processing.
    InstallReq,
    /// The intent is being compiled into installables.
    Compiling,
    /// Installables are being applied to devices.
    Installing,
    /// Every installable was applied. Terminal.
    Installed,
    /// A withdraw request was accepted and awaits processing.
    WithdrawReq,
    /// Installables are being removed from devices.
    Withdrawing,
    /// Every installable was removed. Terminal.
    Withdrawn,
    /// Compilation or installation failed. Terminal.
    Failed,
    /// A purge request was accepted; the key is about to disappear.
    PurgeReq,
    /// Some installables failed while the intent tolerates partial failure.
    /// Terminal.
    Corrupt,
}

impl IntentState {
    /// `true` for states that end a request's lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Installed | Self::Withdrawn | Self::Failed | Self::Corrupt
        )
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InstallReq => "INSTALL_REQ",
            Self::Compiling => "COMPILING",
            Self::Installing => "INSTALLING",
            Self::Installed => "INSTALLED",
            Self::WithdrawReq => "WITHDRAW_REQ",
            Self::Withdrawing => "WITHDRAWING",
            Self::Withdrawn => "WITHDRAWN",
            Self::Failed => "FAILED",
            Self::PurgeReq => "PURGE_REQ",
            Self::Corrupt => "CORRUPT",
        };
        f.write_str(name)
    }
}

/// Ordering stamp for intent requests: wall-clock milliseconds plus a
/// node-local logical counter that breaks same-millisecond ties.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    millis: i64,
    counter: u64,
}

impl Version {
    /// Creates a version stamp.
    #[must_use]
    pub fn new(millis: i64, counter: u64) -> Self {
        Self { millis, counter }
    }

    /// `true` when `self` strictly succeeds `other`.
    #[must_use]
    pub fn is_newer_than(self, other: Self) -> bool {
        self > other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.millis, self.counter)
    }
}

/// The mutable envelope the store keeps per intent key.
///
/// Two slots exist per key: the **current** data (last durable outcome) and
/// the **pending** data (most recent request awaiting processing). Only the
/// phase pipeline mutates data, and only under batch ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentData {
    intent: Intent,
    request: IntentRequest,
    state: IntentState,
    version: Option<Version>,
    installables: Vec<Intent>,
    errors: Vec<String>,
}

impl IntentData {
    /// Envelope for a submit request.
    #[must_use]
    pub fn submit(intent: Intent) -> Self {
        Self::new(intent, IntentRequest::Submit, IntentState::InstallReq)
    }

    /// Envelope for a withdraw request.
    #[must_use]
    pub fn withdraw(intent: Intent) -> Self {
        Self::new(intent, IntentRequest::Withdraw, IntentState::WithdrawReq)
    }

    /// Envelope for a purge request.
    #[must_use]
    pub fn purge(intent: Intent) -> Self {
        Self::new(intent, IntentRequest::Purge, IntentState::PurgeReq)
    }

    fn new(intent: Intent, request: IntentRequest, state: IntentState) -> Self {
        Self {
            intent,
            request,
            state,
            version: None,
            installables: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Clone of `current` advanced to `state`, version untouched. Used when a
    /// batch fails wholesale and the key must land in FAILED with its
    /// installables unchanged.
    #[must_use]
    pub fn next_state(current: &IntentData, state: IntentState) -> Self {
        let mut next = current.clone();
        next.state = state;
        next
    }

    /// The intent's key.
    #[must_use]
    pub fn key(&self) -> &Key {
        self.intent.key()
    }

    /// The wrapped intent.
    #[must_use]
    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    /// The carried request.
    #[must_use]
    pub fn request(&self) -> IntentRequest {
        self.request
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IntentState {
        self.state
    }

    /// The ordering stamp, once the store assigned one.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// The compiled installables.
    #[must_use]
    pub fn installables(&self) -> &[Intent] {
        &self.installables
    }

    /// Errors annotated by the pipeline.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }

    pub(crate) fn advance(mut self, state: IntentState) -> Self {
        self.state = state;
        self
    }

    pub(crate) fn with_installables(mut self, installables: Vec<Intent>) -> Self {
        self.installables = installables;
        self
    }

    pub(crate) fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.errors.push(error.to_string());
        self
    }

    pub(crate) fn with_errors(mut self, errors: impl IntoIterator<Item = String>) -> Self {
        self.errors.extend(errors);
        self
    }
}
