//! Intent lifecycle events.

use std::fmt;

use super::data::IntentState;
use super::key::Key;
use super::types::Intent;

/// What happened to an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentEventKind {
    /// A submit request was accepted.
    InstallReq,
    /// Compilation started.
    Compiling,
    /// Installation started.
    Installing,
    /// Installation completed.
    Installed,
    /// A withdraw request was accepted.
    WithdrawReq,
    /// Withdrawal started.
    Withdrawing,
    /// Withdrawal completed.
    Withdrawn,
    /// Processing failed.
    Failed,
    /// Partial installation failure on a tolerant intent.
    Corrupt,
    /// The key was purged from the store.
    Purged,
}

impl IntentEventKind {
    /// The event kind announcing `state`, when one exists.
    #[must_use]
    pub fn from_state(state: IntentState) -> Option<Self> {
        match state {
            IntentState::InstallReq => Some(Self::InstallReq),
            IntentState::Compiling => Some(Self::Compiling),
            IntentState::Installing => Some(Self::Installing),
            IntentState::Installed => Some(Self::Installed),
            IntentState::WithdrawReq => Some(Self::WithdrawReq),
            IntentState::Withdrawing => Some(Self::Withdrawing),
            IntentState::Withdrawn => Some(Self::Withdrawn),
            IntentState::Failed => Some(Self::Failed),
            IntentState::Corrupt => Some(Self::Corrupt),
            IntentState::PurgeReq => None,
        }
    }
}

impl fmt::Display for IntentEventKind {
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
            Self::Corrupt => "CORRUPT",
            Self::Purged => "PURGED",
        };
        f.write_str(name)
    }
}

/// An intent lifecycle transition, published on the intent event bus.
#[derive(Debug, Clone)]
pub struct IntentEvent {
    kind: IntentEventKind,
    subject: Intent,
}

impl IntentEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(kind: IntentEventKind, subject: Intent) -> Self {
        Self { kind, subject }
    }

    /// What happened.
    #[must_use]
    pub fn kind(&self) -> IntentEventKind {
        self.kind
    }

    /// The intent it happened to.
    #[must_use]
    pub fn subject(&self) -> &Intent {
        &self.subject
    }

    /// The subject's key.
    #[must_use]
    pub fn key(&self) -> &Key {
        self.subject.key()
    }
}

impl fmt::Display for IntentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.subject.key())
    }
}
