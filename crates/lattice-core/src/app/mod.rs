//! The application subsystem.
//!
//! Applications are installable units of controller functionality. The
//! [`DistributedAppStore`] keeps the cluster-wide inventory in a replicated
//! map, drives reference-counted dependency activation through a replicated
//! topic, and fetches application archives from peers when a node is asked to
//! run an application whose bits it never received.

pub mod archive;
pub mod id;
pub(crate) mod loader;
pub mod store;

#[cfg(test)]
mod tests;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use archive::ApplicationArchive;
pub use id::{ApplicationIdStore, InMemoryAppIdStore};
pub use store::DistributedAppStore;

/// Name of the synthetic core "application" that stands in as the requester
/// for explicit user activations.
pub const CORE_APP_NAME: &str = "lattice.core";

/// Identity of an application: a cluster-registered short id plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId {
    id: u32,
    name: String,
}

impl AppId {
    /// Creates an application id.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The registered short id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The portable description parsed from an application archive's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDescription {
    /// The application name, unique across the cluster.
    pub name: String,
    /// The application version string.
    pub version: String,
    /// Who produced the application.
    #[serde(default)]
    pub origin: String,
    /// Human-readable summary.
    #[serde(default)]
    pub description: String,
    /// Names of applications that must be installed first and are activated
    /// alongside this one.
    #[serde(default)]
    pub required_apps: Vec<String>,
    /// Permissions the application requests.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Feature names the archive carries.
    #[serde(default)]
    pub features: Vec<String>,
}

/// A registered application: its cluster id plus its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    id: AppId,
    description: ApplicationDescription,
}

impl Application {
    /// Creates an application from a registered id and its manifest.
    #[must_use]
    pub fn new(id: AppId, description: ApplicationDescription) -> Self {
        Self { id, description }
    }

    /// The application's id.
    #[must_use]
    pub fn id(&self) -> &AppId {
        &self.id
    }

    /// The application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.description.name
    }

    /// The application version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.description.version
    }

    /// Names of the applications this one requires.
    #[must_use]
    pub fn required_apps(&self) -> &[String] {
        &self.description.required_apps
    }

    /// Permissions the application requests.
    #[must_use]
    pub fn permissions(&self) -> &[String] {
        &self.description.permissions
    }

    /// The full manifest.
    #[must_use]
    pub fn description(&self) -> &ApplicationDescription {
        &self.description
    }
}

/// Replicated activation state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalState {
    /// Installed but not running.
    Installed,
    /// Running (or expected to run) on every node.
    Activated,
    /// Explicitly stopped; stays installed.
    Deactivated,
}

impl fmt::Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Installed => "INSTALLED",
            Self::Activated => "ACTIVATED",
            Self::Deactivated => "DEACTIVATED",
        };
        f.write_str(name)
    }
}

/// Externally visible application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    /// The application is installed.
    Installed,
    /// The application is active.
    Active,
}

/// The envelope replicated per application in the app map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationHolder {
    app: Application,
    state: InternalState,
    permissions: Option<Vec<String>>,
}

impl ApplicationHolder {
    /// Creates a holder.
    #[must_use]
    pub fn new(app: Application, state: InternalState, permissions: Option<Vec<String>>) -> Self {
        Self {
            app,
            state,
            permissions,
        }
    }

    /// The wrapped application.
    #[must_use]
    pub fn app(&self) -> &Application {
        &self.app
    }

    /// The replicated state.
    #[must_use]
    pub fn state(&self) -> InternalState {
        self.state
    }

    /// Granted permissions, when set explicitly.
    #[must_use]
    pub fn permissions(&self) -> Option<&[String]> {
        self.permissions.as_deref()
    }

    pub(crate) fn with_state(&self, state: InternalState) -> Self {
        Self {
            app: self.app.clone(),
            state,
            permissions: self.permissions.clone(),
        }
    }

    pub(crate) fn with_permissions(&self, permissions: Vec<String>) -> Self {
        Self {
            app: self.app.clone(),
            state: self.state,
            permissions: Some(permissions),
        }
    }
}

/// What happened to an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEventKind {
    /// The application (and its bits) became available on this node.
    Installed,
    /// The application was activated on this node.
    Activated,
    /// The application was deactivated.
    Deactivated,
    /// The application was removed from the inventory.
    Uninstalled,
    /// The application's granted permissions changed.
    PermissionsChanged,
}

impl fmt::Display for AppEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Installed => "APP_INSTALLED",
            Self::Activated => "APP_ACTIVATED",
            Self::Deactivated => "APP_DEACTIVATED",
            Self::Uninstalled => "APP_UNINSTALLED",
            Self::PermissionsChanged => "APP_PERMISSIONS_CHANGED",
        };
        f.write_str(name)
    }
}

/// An application lifecycle transition, published on the app event bus.
#[derive(Debug, Clone)]
pub struct ApplicationEvent {
    kind: AppEventKind,
    app: Application,
}

impl ApplicationEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(kind: AppEventKind, app: Application) -> Self {
        Self { kind, app }
    }

    /// What happened.
    #[must_use]
    pub fn kind(&self) -> AppEventKind {
        self.kind
    }

    /// The application it happened to.
    #[must_use]
    pub fn app(&self) -> &Application {
        &self.app
    }
}

/// Errors surfaced by the application subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    /// An application's prerequisites are not installed.
    #[error("missing dependencies for app {name}")]
    MissingDependencies {
        /// The application whose install was rejected.
        name: String,
    },

    /// No such application on this node.
    #[error("application {name} not found")]
    NotFound {
        /// The missing application name.
        name: String,
    },

    /// A dependency cycle was found while loading from disk.
    #[error("circular app dependency involving {name}")]
    CircularDependency {
        /// The application whose load was abandoned.
        name: String,
    },

    /// No cluster peer served the application's archive in time.
    #[error("bits for application {name} are unavailable")]
    BitsUnavailable {
        /// The application lacking bits.
        name: String,
    },

    /// Archive I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The archive manifest could not be parsed.
    #[error("invalid application manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}
