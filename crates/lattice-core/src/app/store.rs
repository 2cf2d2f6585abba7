//! The distributed application store.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::archive::ApplicationArchive;
use super::id::ApplicationIdStore;
use super::loader;
use super::{
    AppError, AppEventKind, AppId, Application, ApplicationDescription, ApplicationEvent,
    ApplicationHolder, ApplicationState, InternalState, CORE_APP_NAME,
};
use crate::cluster::{ClusterCommunicator, ClusterService, MessageSubject};
use crate::config::AppStoreConfig;
use crate::store::{ConsistentMap, LocalStorageFabric, MapEvent, Topic, Versioned};

/// Wire subject used to fetch application archives from peers.
pub const APP_BITS_REQUEST: &str = "app-bits-request";

const APPS_MAP_NAME: &str = "lattice-apps";
const ACTIVATION_TOPIC_NAME: &str = "lattice-apps-activation";
const EVENT_CHANNEL_CAPACITY: usize = 1024;

enum ActivationWork {
    Activate(Application),
    Map(MapEvent<AppId, ApplicationHolder>),
}

/// Cluster-wide inventory of applications.
///
/// State lives in a replicated map of [`ApplicationHolder`]s; activation
/// fans out through a replicated topic so every node runs its local
/// side-effects (bits fetch, active flag, readiness-gated `APP_ACTIVATED`)
/// on its own single activation task. Dependencies are reference-counted in
/// the `required_by` multimap: an application stays activated while at least
/// one requester remains.
pub struct DistributedAppStore {
    pub(crate) inner: Arc<AppStoreInner>,
}

pub(crate) struct AppStoreInner {
    pub(crate) archive: ApplicationArchive,
    pub(crate) apps: ConsistentMap<AppId, ApplicationHolder>,
    activation_topic: Topic<Application>,
    cluster: Arc<dyn ClusterCommunicator>,
    membership: Arc<dyn ClusterService>,
    pub(crate) id_store: Arc<dyn ApplicationIdStore>,
    pub(crate) config: AppStoreConfig,
    core_app_id: AppId,
    pub(crate) required_by: Mutex<HashMap<AppId, HashSet<AppId>>>,
    local_started: Mutex<HashSet<String>>,
    events: broadcast::Sender<ApplicationEvent>,
}

impl DistributedAppStore {
    /// Wires a store instance for one node.
    ///
    /// Handles built from the same `fabric` (and joined to the same cluster)
    /// behave as replicas: they share the app map and activation topic while
    /// keeping per-node archives and event buses.
    ///
    /// # Errors
    ///
    /// Fails when the archive root cannot be prepared.
    pub fn new(
        archive_root: impl Into<PathBuf>,
        fabric: &LocalStorageFabric,
        cluster: Arc<dyn ClusterCommunicator>,
        membership: Arc<dyn ClusterService>,
        id_store: Arc<dyn ApplicationIdStore>,
        config: AppStoreConfig,
    ) -> Result<Self, AppError> {
        let archive = ApplicationArchive::new(archive_root)?;
        let core_app_id = id_store.register_application(CORE_APP_NAME);

        // Rolling-upgrade reconciliation: holders written by another software
        // version are rebuilt from this node's on-disk manifest when the
        // versions disagree.
        let compat_archive = archive.clone();
        let apps = fabric
            .consistent_map_builder::<AppId, ApplicationHolder>()
            .with_name(APPS_MAP_NAME)
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_compatibility_function(move |holder: ApplicationHolder| {
                convert_application(&compat_archive, &holder)
            })
            .build();
        let activation_topic = fabric
            .topic_builder::<Application>()
            .with_name(ACTIVATION_TOPIC_NAME)
            .build();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(AppStoreInner {
            archive,
            apps,
            activation_topic,
            cluster,
            membership,
            id_store,
            config,
            core_app_id,
            required_by: Mutex::new(HashMap::new()),
            local_started: Mutex::new(HashSet::new()),
            events,
        });

        // Serve peers' bits requests off the hot path.
        let serving = inner.archive.clone();
        inner.cluster.subscribe(
            MessageSubject::new(APP_BITS_REQUEST),
            Arc::new(move |payload: Bytes| {
                let name = String::from_utf8_lossy(&payload).into_owned();
                match serving.application_bits(&name) {
                    Ok(bits) => {
                        info!("sending bits for application {name}");
                        Some(bits)
                    }
                    Err(_) => {
                        warn!("bits for application {name} are not available on this node yet");
                        None
                    }
                }
            }),
        );

        // Map events and activation messages serialize on one task, so every
        // node applies side-effects in a single stream.
        let (work_tx, mut work_rx) = mpsc::unbounded_channel();
        let map_tx = work_tx.clone();
        inner.apps.subscribe(move |event| {
            let _ = map_tx.send(ActivationWork::Map(event));
        });
        let topic_tx = work_tx;
        inner.activation_topic.subscribe(move |app| {
            let _ = topic_tx.send(ActivationWork::Activate(app));
        });

        let weak: Weak<AppStoreInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(work) = work_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match work {
                    ActivationWork::Activate(app) => inner.activate_locally(app).await,
                    ActivationWork::Map(event) => inner.handle_map_event(event).await,
                }
            }
        });

        Ok(Self { inner })
    }

    /// Brings this node up to date: replays the replicated map, downloads
    /// missing bits, re-marks locally active apps, and loads the disk
    /// inventory (activating apps flagged active, with dependency-cycle
    /// detection).
    pub async fn start(&self) {
        self.inner.bootstrap_existing_applications().await;
        self.inner.download_missing_applications().await;
        self.inner.activate_existing_applications();
        loader::load_from_disk(&self.inner).await;
        info!("application store started");
    }

    /// Installs an application from its archive bytes.
    ///
    /// # Errors
    ///
    /// [`AppError::MissingDependencies`] when a required app is not
    /// installed; the archive is purged from disk so the install can be
    /// retried later. Parse and I/O failures propagate.
    pub fn create(&self, bytes: &[u8]) -> Result<Application, AppError> {
        let description = self.inner.archive.save_application(bytes)?;
        if !self.inner.has_prerequisites(&description) {
            // Purge bits off disk so the app can be reinstalled later.
            self.inner.archive.purge_application(&description.name);
            return Err(AppError::MissingDependencies {
                name: description.name,
            });
        }
        self.inner.create_from_description(description, true)
    }

    /// Every application in the inventory.
    #[must_use]
    pub fn get_applications(&self) -> Vec<Application> {
        self.inner
            .apps
            .values()
            .into_iter()
            .map(|holder| holder.into_value().app().clone())
            .collect()
    }

    /// The application registered under `app_id`.
    #[must_use]
    pub fn get_application(&self, app_id: &AppId) -> Option<Application> {
        self.inner.get_application(app_id)
    }

    /// The id registered for `name`.
    #[must_use]
    pub fn get_id(&self, name: &str) -> Option<AppId> {
        self.inner.id_store.get_app_id(name)
    }

    /// The externally visible state of `app_id`.
    #[must_use]
    pub fn get_state(&self, app_id: &AppId) -> Option<ApplicationState> {
        self.inner.apps.get(app_id).map(|holder| {
            if holder.value().state() == InternalState::Activated {
                ApplicationState::Active
            } else {
                ApplicationState::Installed
            }
        })
    }

    /// Permissions granted to `app_id`.
    #[must_use]
    pub fn get_permissions(&self, app_id: &AppId) -> Vec<String> {
        self.inner
            .apps
            .get(app_id)
            .and_then(|holder| holder.value().permissions().map(<[String]>::to_vec))
            .unwrap_or_default()
    }

    /// Grants `permissions` to `app_id`, emitting
    /// `APP_PERMISSIONS_CHANGED` when the set actually changed.
    pub fn set_permissions(&self, app_id: &AppId, permissions: Vec<String>) {
        let updated = self.inner.apps.compute_if(
            app_id,
            |holder| holder.permissions() != Some(permissions.as_slice()),
            |_, holder| holder.with_permissions(permissions.clone()),
        );
        if let Some(updated) = updated {
            trace!("permissions changed for {app_id}");
            self.inner
                .emit(AppEventKind::PermissionsChanged, updated.value().app().clone());
        }
    }

    /// Activates `app_id` on behalf of the user (the synthetic core app).
    pub fn activate(&self, app_id: &AppId) {
        let core = self.inner.core_app_id.clone();
        self.inner.activate_for(app_id, core);
    }

    /// Deactivates `app_id`: dependents first, then the app itself, then any
    /// required apps nobody else needs.
    pub fn deactivate(&self, app_id: &AppId) {
        self.inner.deactivate_dependent_apps(app_id);
        let core = self.inner.core_app_id.clone();
        self.inner.deactivate_for(app_id, &core);
    }

    /// Uninstalls `app_id`, taking dependents down with it.
    pub fn remove(&self, app_id: &AppId) {
        self.inner.uninstall_dependent_apps(app_id);
        self.inner.apps.remove(app_id);
    }

    /// The raw archive bytes of `app_id` on this node.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] when the bits never reached this node.
    pub fn get_application_archive(&self, app_id: &AppId) -> Result<Bytes, AppError> {
        self.inner.archive.application_bits(app_id.name())
    }

    /// Subscribes to the application event bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ApplicationEvent> {
        self.inner.events.subscribe()
    }
}

impl AppStoreInner {
    pub(crate) fn get_application(&self, app_id: &AppId) -> Option<Application> {
        self.apps
            .get(app_id)
            .map(|holder| holder.into_value().app().clone())
    }

    fn has_prerequisites(&self, description: &ApplicationDescription) -> bool {
        let mut satisfied = true;
        for required in &description.required_apps {
            let installed = self
                .id_store
                .get_app_id(required)
                .and_then(|id| self.get_application(&id))
                .is_some();
            if !installed {
                error!("{required} required for {} not available", description.name);
                satisfied = false;
            }
        }
        satisfied
    }

    pub(crate) fn create_from_description(
        &self,
        description: ApplicationDescription,
        update_time: bool,
    ) -> Result<Application, AppError> {
        let app_id = self.id_store.register_application(&description.name);
        let app = Application::new(app_id, description);
        if update_time {
            self.archive.update_time(app.name());
        }
        let previous = self.apps.put_if_absent(
            app.id().clone(),
            ApplicationHolder::new(app.clone(), InternalState::Installed, None),
        );
        Ok(previous.map_or(app, |holder| holder.into_value().app().clone()))
    }

    pub(crate) fn activate_for(&self, app_id: &AppId, for_app: AppId) {
        self.required_by
            .lock()
            .expect("required_by lock poisoned")
            .entry(app_id.clone())
            .or_default()
            .insert(for_app);
        self.do_activate(app_id, true);
    }

    pub(crate) fn do_activate(&self, app_id: &AppId, update_time: bool) {
        let Some(holder) = self.apps.get(app_id) else {
            return;
        };
        trace!("activating {app_id}");
        if update_time {
            self.archive.update_time(app_id.name());
        }

        // Required apps activate first, each on behalf of this app, so their
        // topic messages precede ours and readiness resolves in order.
        let app = holder.value().app().clone();
        for required in app.required_apps() {
            if let Some(required_id) = self.id_store.get_app_id(required) {
                self.activate_for(&required_id, app_id.clone());
            }
        }

        self.apps.compute_if(
            app_id,
            |holder| holder.state() != InternalState::Activated,
            |_, holder| holder.with_state(InternalState::Activated),
        );
        self.activation_topic.publish(app);
    }

    fn deactivate_for(&self, app_id: &AppId, for_app: &AppId) {
        let now_unrequired = {
            let mut required_by = self.required_by.lock().expect("required_by lock poisoned");
            let requesters = required_by.entry(app_id.clone()).or_default();
            requesters.remove(for_app);
            requesters.is_empty()
        };
        if !now_unrequired {
            return;
        }
        let changed = self
            .apps
            .compute_if(
                app_id,
                |holder| holder.state() != InternalState::Deactivated,
                |_, holder| holder.with_state(InternalState::Deactivated),
            )
            .is_some();
        if changed {
            self.archive.update_time(app_id.name());
            self.deactivate_required_apps(app_id);
        }
    }

    /// Deactivates every activated app that requires `app_id`.
    fn deactivate_dependent_apps(&self, app_id: &AppId) {
        let dependents: Vec<AppId> = self
            .apps
            .values()
            .into_iter()
            .map(Versioned::into_value)
            .filter(|holder| holder.state() == InternalState::Activated)
            .filter(|holder| {
                holder
                    .app()
                    .required_apps()
                    .iter()
                    .any(|name| name == app_id.name())
            })
            .map(|holder| holder.app().id().clone())
            .collect();
        let core = self.core_app_id.clone();
        for dependent in dependents {
            self.deactivate_dependent_apps(&dependent);
            self.deactivate_for(&dependent, &core);
        }
    }

    /// Deactivates apps required by `app_id` that no one else needs.
    fn deactivate_required_apps(&self, app_id: &AppId) {
        let Some(app) = self.get_application(app_id) else {
            return;
        };
        for required in app.required_apps() {
            let Some(required_id) = self.id_store.get_app_id(required) else {
                continue;
            };
            let activated = self
                .apps
                .get(&required_id)
                .is_some_and(|holder| holder.value().state() == InternalState::Activated);
            if activated {
                self.deactivate_for(&required_id, app_id);
            }
        }
    }

    /// Uninstalls every app that requires `app_id`.
    fn uninstall_dependent_apps(&self, app_id: &AppId) {
        let dependents: Vec<AppId> = self
            .apps
            .values()
            .into_iter()
            .map(Versioned::into_value)
            .filter(|holder| {
                holder
                    .app()
                    .required_apps()
                    .iter()
                    .any(|name| name == app_id.name())
            })
            .map(|holder| holder.app().id().clone())
            .collect();
        for dependent in dependents {
            self.uninstall_dependent_apps(&dependent);
            self.apps.remove(&dependent);
        }
    }

    pub(crate) fn mark_required_by_core(&self, app_id: &AppId) {
        self.required_by
            .lock()
            .expect("required_by lock poisoned")
            .entry(app_id.clone())
            .or_default()
            .insert(self.core_app_id.clone());
    }

    fn emit(&self, kind: AppEventKind, app: Application) {
        debug!("{kind} {}", app.name());
        let _ = self.events.send(ApplicationEvent::new(kind, app));
    }

    // -- activation task ----------------------------------------------------

    async fn activate_locally(&self, app: Application) {
        trace!("received an activation for {}", app.id());
        let name = app.name().to_string();
        self.install_bits_if_needed(&app).await;
        self.archive.set_active(&name);

        let ready = {
            let started = self.local_started.lock().expect("local_started lock poisoned");
            app.required_apps().iter().all(|req| started.contains(req))
        };
        if ready {
            self.emit(AppEventKind::Activated, app);
            self.local_started
                .lock()
                .expect("local_started lock poisoned")
                .insert(name);
        } else {
            warn!("postponing app activation {name}: required apps not started yet");
        }
    }

    async fn handle_map_event(&self, event: MapEvent<AppId, ApplicationHolder>) {
        match event {
            MapEvent::Insert { key, new } => {
                self.setup_application(&key, &new.into_value()).await;
            }
            MapEvent::Update { key, old, new } => {
                let new = new.into_value();
                if old.value().state() == new.state() {
                    debug!("ignoring update without state change for {key}");
                    return;
                }
                self.setup_application(&key, &new).await;
            }
            MapEvent::Remove { key, old } => {
                trace!("{key} has been uninstalled");
                let holder = old.into_value();
                self.emit(AppEventKind::Uninstalled, holder.app().clone());
                self.archive.purge_application(key.name());
                self.local_started
                    .lock()
                    .expect("local_started lock poisoned")
                    .remove(key.name());
            }
        }
    }

    async fn setup_application(&self, app_id: &AppId, holder: &ApplicationHolder) {
        match holder.state() {
            InternalState::Installed => {
                self.fetch_bits_if_needed(holder.app()).await;
                trace!("{app_id} has been installed");
                self.emit(AppEventKind::Installed, holder.app().clone());
            }
            InternalState::Deactivated => {
                trace!("{app_id} has been deactivated");
                self.archive.clear_active(app_id.name());
                self.emit(AppEventKind::Deactivated, holder.app().clone());
                self.local_started
                    .lock()
                    .expect("local_started lock poisoned")
                    .remove(app_id.name());
            }
            // Activation side-effects ride the activation topic.
            InternalState::Activated => {}
        }
    }

    // -- bits transfer ------------------------------------------------------

    fn bits_available(&self, app: &Application) -> bool {
        self.archive
            .get_application_description(app.name())
            .map(|description| description.version == app.version())
            .unwrap_or(false)
    }

    async fn fetch_bits_if_needed(&self, app: &Application) {
        if !self.bits_available(app) {
            if let Err(err) = self.fetch_bits(app, false).await {
                warn!("{err}");
            }
        }
    }

    async fn install_bits_if_needed(&self, app: &Application) {
        if !self.bits_available(app) {
            if let Err(err) = self.fetch_bits(app, true).await {
                warn!("{err}");
            }
        }
    }

    async fn fetch_bits(
        &self,
        app: &Application,
        delegate_installation: bool,
    ) -> Result<(), AppError> {
        let local = self.membership.local_node().id;
        let subject = MessageSubject::new(APP_BITS_REQUEST);
        let payload = Bytes::copy_from_slice(app.name().as_bytes());
        info!(
            "downloading bits for application {} version {}",
            app.name(),
            app.version()
        );

        let mut requests: FuturesUnordered<_> = self
            .membership
            .nodes()
            .into_iter()
            .filter(|node| node.id != local)
            .map(|node| {
                let request = self.cluster.send_and_receive(&subject, payload.clone(), &node.id);
                async move { (node.id, request.await) }
            })
            .collect();

        let fetch = async {
            while let Some((node, result)) = requests.next().await {
                match result {
                    Ok(bits) if !bits.is_empty() => {
                        match self.archive.save_application(&bits) {
                            Ok(_) => {
                                info!(
                                    "downloaded bits for application {} from node {node}",
                                    app.name()
                                );
                                return true;
                            }
                            Err(err) => {
                                warn!("fetched bits for {} do not parse: {err}", app.name());
                            }
                        }
                    }
                    Ok(_) => trace!("node {node} lacks bits for {}", app.name()),
                    Err(err) => warn!(
                        "unable to fetch bits for application {} from node {node}: {err}",
                        app.name()
                    ),
                }
            }
            false
        };

        // Dropping the remaining requests on success or timeout discards any
        // late peer responses.
        let fetched = timeout(self.config.fetch_timeout(), fetch)
            .await
            .unwrap_or(false);
        if !fetched {
            return Err(AppError::BitsUnavailable {
                name: app.name().to_string(),
            });
        }
        if delegate_installation {
            trace!("delegate installation for {}", app.id());
            self.emit(AppEventKind::Installed, app.clone());
        }
        Ok(())
    }

    // -- bootstrap ----------------------------------------------------------

    /// Replays the replicated map so a staggered start misses no events.
    async fn bootstrap_existing_applications(&self) {
        for (app_id, holder) in self.apps.iter_entries() {
            self.setup_application(&app_id, holder.value()).await;
        }
    }

    /// Fetches bits for any installed application this node never received.
    async fn download_missing_applications(&self) {
        debug!("downloading missing applications");
        for holder in self.apps.values() {
            self.fetch_bits_if_needed(holder.value().app()).await;
        }
    }

    /// Re-marks locally archived apps whose stored state is ACTIVATED and
    /// whose disk version matches the stored version.
    fn activate_existing_applications(&self) {
        for name in self.archive.application_names() {
            let Some(app_id) = self.id_store.get_app_id(&name) else {
                continue;
            };
            let Ok(description) = self.archive.get_application_description(&name) else {
                continue;
            };
            let holder = self.apps.get(&app_id).map(Versioned::into_value);
            if let Some(holder) = holder {
                if holder.state() == InternalState::Activated
                    && holder.app().version() == description.version
                {
                    info!("activating existing application {app_id}");
                    self.archive.set_active(&name);
                    self.archive.update_time(&name);
                }
            }
        }
    }
}

/// Rebuilds a stored holder from the local manifest when the versions
/// disagree; the map builder applies this to every entry.
fn convert_application(
    archive: &ApplicationArchive,
    holder: &ApplicationHolder,
) -> Option<ApplicationHolder> {
    let name = holder.app().name();
    let description = match archive.get_application_description(name) {
        Ok(description) => description,
        Err(_) => {
            // Not present here yet; another node will serve the bits later.
            warn!("application {name} not found on disk");
            return None;
        }
    };
    if description.version == holder.app().version() {
        return None;
    }
    info!(
        "updating stored version of {name} to {}",
        description.version
    );
    let rebuilt = Application::new(holder.app().id().clone(), description);
    Some(ApplicationHolder::new(
        rebuilt,
        holder.state(),
        holder.permissions().map(<[String]>::to_vec),
    ))
}
