//! Intents and their kind tags.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::key::Key;
use crate::app::AppId;

/// Default priority assigned to intents that do not choose one.
pub const DEFAULT_INTENT_PRIORITY: u32 = 100;

/// Kind tag of an intent.
///
/// Kinds form a declared hierarchy: a kind created with
/// [`IntentKind::extending`] records its whole ancestor chain, and the
/// compiler and installer registries fall back along that chain when no entry
/// matches the kind itself. Installable kinds mark device-ready sub-intents;
/// compilation recurses until only installables remain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentKind {
    name: Cow<'static, str>,
    ancestors: Vec<Cow<'static, str>>,
    installable: bool,
}

impl IntentKind {
    /// Creates a kind with no parent.
    pub fn root(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            ancestors: Vec::new(),
            installable: false,
        }
    }

    /// Creates a kind extending `parent`. Installability is inherited.
    pub fn extending(name: impl Into<Cow<'static, str>>, parent: &IntentKind) -> Self {
        let mut ancestors = Vec::with_capacity(parent.ancestors.len() + 1);
        ancestors.push(parent.name.clone());
        ancestors.extend(parent.ancestors.iter().cloned());
        Self {
            name: name.into(),
            ancestors,
            installable: parent.installable,
        }
    }

    /// Marks the kind as installable.
    #[must_use]
    pub fn installable(mut self) -> Self {
        self.installable = true;
        self
    }

    /// The kind's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` when intents of this kind are device-ready.
    #[must_use]
    pub fn is_installable(&self) -> bool {
        self.installable
    }

    /// The kind's name followed by its ancestors, nearest first. This is the
    /// order registries probe on lookup.
    pub fn lineage(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_ref()).chain(self.ancestors.iter().map(Cow::as_ref))
    }
}

impl PartialEq for IntentKind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for IntentKind {}

impl Hash for IntentKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The built-in kind hierarchy.
///
/// Connectivity variants compile into installables; the installable kinds are
/// what installers dispatch on. Providers register additional kinds freely;
/// these are merely the ones the stock compilers and installers use.
pub mod kinds {
    use std::sync::OnceLock;

    use super::IntentKind;

    macro_rules! kind_fn {
        ($(#[$doc:meta])* $fn_name:ident, $init:expr) => {
            $(#[$doc])*
            pub fn $fn_name() -> &'static IntentKind {
                static KIND: OnceLock<IntentKind> = OnceLock::new();
                KIND.get_or_init(|| $init)
            }
        };
    }

    kind_fn!(
        /// Root of every connectivity request.
        connectivity,
        IntentKind::root("connectivity")
    );
    kind_fn!(
        /// Connectivity between two explicit connection points.
        point_to_point,
        IntentKind::extending("point-to-point", connectivity())
    );
    kind_fn!(
        /// Connectivity between two end-station hosts.
        host_to_host,
        IntentKind::extending("host-to-host", connectivity())
    );
    kind_fn!(
        /// Connectivity across an explicit set of links.
        link_collection,
        IntentKind::extending("link-collection", connectivity())
    );
    kind_fn!(
        /// Connectivity delegated to an external network domain.
        domain,
        IntentKind::extending("domain", connectivity())
    );
    kind_fn!(
        /// Installable: a set of device flow rules.
        flow_rule,
        IntentKind::root("flow-rule").installable()
    );
    kind_fn!(
        /// Installable: forwarding objectives handed to the pipeliner.
        flow_objective,
        IntentKind::root("flow-objective").installable()
    );
    kind_fn!(
        /// Installable: protection switching endpoints.
        protection,
        IntentKind::root("protection").installable()
    );
}

/// Shared tag for pooled resource reservations across intents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceGroup(String);

impl ResourceGroup {
    /// Creates a resource group tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Constraints attached to an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Constraint {
    /// The intent tolerates a subset of its installables failing; a partial
    /// failure lands it in CORRUPT rather than FAILED, and topology changes
    /// renominate it for compilation.
    AllowPartialFailure,
}

/// An immutable declarative connectivity request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    key: Key,
    app_id: AppId,
    kind: IntentKind,
    resource_group: Option<ResourceGroup>,
    priority: u32,
    constraints: Vec<Constraint>,
    params: serde_json::Value,
}

impl Intent {
    /// Starts building an intent.
    #[must_use]
    pub fn builder(key: Key, app_id: AppId) -> IntentBuilder {
        IntentBuilder {
            key,
            app_id,
            kind: kinds::connectivity().clone(),
            resource_group: None,
            priority: DEFAULT_INTENT_PRIORITY,
            constraints: Vec::new(),
            params: serde_json::Value::Null,
        }
    }

    /// The intent's key.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The submitting application.
    #[must_use]
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// The kind tag.
    #[must_use]
    pub fn kind(&self) -> &IntentKind {
        &self.kind
    }

    /// The resource group, when pooled accounting applies.
    #[must_use]
    pub fn resource_group(&self) -> Option<&ResourceGroup> {
        self.resource_group.as_ref()
    }

    /// The intent's priority.
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The attached constraints.
    #[must_use]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Kind-specific parameters, interpreted by compilers and installers.
    #[must_use]
    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// `true` when the intent is device-ready as-is.
    #[must_use]
    pub fn is_installable(&self) -> bool {
        self.kind.is_installable()
    }

    /// `true` when the intent tolerates partial installation failure.
    #[must_use]
    pub fn allows_partial_failure(&self) -> bool {
        self.constraints.contains(&Constraint::AllowPartialFailure)
    }
}

/// Builder for [`Intent`].
#[derive(Debug, Clone)]
pub struct IntentBuilder {
    key: Key,
    app_id: AppId,
    kind: IntentKind,
    resource_group: Option<ResourceGroup>,
    priority: u32,
    constraints: Vec<Constraint>,
    params: serde_json::Value,
}

impl IntentBuilder {
    /// Sets the kind tag.
    #[must_use]
    pub fn kind(mut self, kind: IntentKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the resource group.
    #[must_use]
    pub fn resource_group(mut self, group: ResourceGroup) -> Self {
        self.resource_group = Some(group);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Sets the kind-specific parameters.
    #[must_use]
    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Finishes the intent.
    #[must_use]
    pub fn build(self) -> Intent {
        Intent {
            key: self.key,
            app_id: self.app_id,
            kind: self.kind,
            resource_group: self.resource_group,
            priority: self.priority,
            constraints: self.constraints,
            params: self.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_walks_nearest_first() {
        let lineage: Vec<&str> = kinds::point_to_point().lineage().collect();
        assert_eq!(lineage, vec!["point-to-point", "connectivity"]);
    }

    #[test]
    fn installability_is_inherited() {
        let special = IntentKind::extending("metered-flow-rule", kinds::flow_rule());
        assert!(special.is_installable());
        assert!(!kinds::host_to_host().is_installable());
    }

    #[test]
    fn partial_failure_constraint_is_visible() {
        let app = AppId::new(1, "lattice.test");
        let intent = Intent::builder(Key::of("k", app.clone()), app)
            .constraint(Constraint::AllowPartialFailure)
            .build();
        assert!(intent.allows_partial_failure());
    }
}
