//! # lattice-core
//!
//! Core library for the lattice SDN controller: the intent lifecycle engine
//! and the cluster-wide application store.
//!
//! Two subsystems carry the weight:
//!
//! - **Intents** (`intent`): applications submit declarative connectivity
//!   requests; the engine compiles them into installable sub-intents,
//!   coordinates installation through pluggable installers, and drives each
//!   key through a batched, ordered phase pipeline (submit, compile, install,
//!   withdraw, purge, recompile on topology change).
//! - **Applications** (`app`): a replicated inventory of installable
//!   applications with reference-counted, dependency-driven activation and
//!   on-demand archive transfer between cluster peers.
//!
//! The subsystems consume their surroundings through capability traits:
//! cluster messaging (`cluster`), replicated map/topic primitives (`store`),
//! and resource accounting (`resource`). In-process implementations of each
//! are bundled, so a single node (or a simulated multi-node cluster in
//! tests) runs without any external services.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lattice_core::config::IntentManagerConfig;
//! use lattice_core::intent::{Intent, IntentManager, Key, SimpleIntentStore, kinds};
//! use lattice_core::resource::NoopResourceService;
//! use lattice_core::app::AppId;
//!
//! # async fn demo() {
//! let store = Arc::new(SimpleIntentStore::new());
//! let manager = IntentManager::start(
//!     store,
//!     Arc::new(NoopResourceService),
//!     IntentManagerConfig::default(),
//! );
//!
//! let app_id = AppId::new(1, "lattice.fwd");
//! let intent = Intent::builder(Key::of("h1-h2", app_id.clone()), app_id)
//!     .kind(kinds::host_to_host().clone())
//!     .build();
//! manager.submit(intent);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

pub mod app;
pub mod cluster;
pub mod config;
pub mod intent;
pub mod resource;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::app::{AppId, Application, ApplicationEvent, DistributedAppStore};
    pub use crate::config::{AppStoreConfig, ControllerConfig, IntentManagerConfig};
    pub use crate::intent::{
        Intent, IntentData, IntentEvent, IntentManager, IntentState, Key, SimpleIntentStore,
    };
    pub use crate::resource::{ResourceConsumer, ResourceService};
}

pub use config::ControllerConfig;
pub use intent::{Intent, IntentManager, Key};
