//! The intent service facade.

use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, trace, warn};

use super::accumulator::IntentAccumulator;
use super::compiler::{CompilerRegistry, IntentCompiler};
use super::coordinator::{InstallCoordinator, InstallOutcome};
use super::data::{IntentData, IntentState};
use super::error::IntentError;
use super::event::{IntentEvent, IntentEventKind};
use super::installer::{InstallerRegistry, IntentInstaller, IntentOperationContext};
use super::key::Key;
use super::phase::{self, IntentProcessPhase, IntentProcessor, PhaseContext};
use super::store::{IntentStore, IntentStoreDelegate};
use super::types::{Intent, IntentKind};
use crate::app::AppId;
use crate::config::IntentManagerConfig;
use crate::resource::{ResourceConsumer, ResourceService};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

const RECOMPILE: [IntentState; 3] = [
    IntentState::InstallReq,
    IntentState::Failed,
    IntentState::WithdrawReq,
];
const WITHDRAW: [IntentState; 3] = [
    IntentState::WithdrawReq,
    IntentState::Withdrawing,
    IntentState::Withdrawn,
];

/// Hook observing every written datum, used by the topology tracker to keep
/// its objective index current.
pub trait IntentTracker: Send + Sync {
    /// A datum became durable.
    fn track(&self, data: &IntentData);
}

/// The intent lifecycle engine.
///
/// Submitted requests land in the store as pending data; the store's delegate
/// feeds them through the accumulator into the single-flight batch executor,
/// where each key walks the phase pipeline on a bounded worker pool. Results
/// are written back in batch order and every transition is published on the
/// event bus.
pub struct IntentManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: Arc<dyn IntentStore>,
    compilers: Arc<CompilerRegistry>,
    installers: Arc<InstallerRegistry>,
    coordinator: InstallCoordinator,
    resources: Arc<dyn ResourceService>,
    tracker: Mutex<Option<Arc<dyn IntentTracker>>>,
    accumulator: IntentAccumulator,
    events: broadcast::Sender<IntentEvent>,
    workers: Arc<Semaphore>,
    config: IntentManagerConfig,
}

impl IntentManager {
    /// Wires the engine onto `store` and starts its batch executor.
    #[must_use]
    pub fn start(
        store: Arc<dyn IntentStore>,
        resources: Arc<dyn ResourceService>,
        config: IntentManagerConfig,
    ) -> Self {
        let compilers = Arc::new(CompilerRegistry::new());
        let installers = Arc::new(InstallerRegistry::new());
        let coordinator = InstallCoordinator::new(Arc::clone(&installers));
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let accumulator =
            IntentAccumulator::spawn(batch_tx, config.batch_window(), config.batch_max_items);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let workers = Arc::new(Semaphore::new(config.num_threads.max(1)));

        let inner = Arc::new(ManagerInner {
            store: Arc::clone(&store),
            compilers,
            installers,
            coordinator,
            resources,
            tracker: Mutex::new(None),
            accumulator,
            events,
            workers,
            config,
        });
        store.set_delegate(Arc::new(StoreDelegate {
            inner: Arc::downgrade(&inner),
        }));

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.process_batch(batch).await;
                inner.accumulator.ready();
            }
        });

        info!("intent manager started");
        Self { inner }
    }

    /// Requests installation of `intent`.
    pub fn submit(&self, intent: Intent) {
        self.inner.store.add_pending(IntentData::submit(intent));
    }

    /// Requests withdrawal of `intent`.
    pub fn withdraw(&self, intent: Intent) {
        self.inner.store.add_pending(IntentData::withdraw(intent));
    }

    /// Requests removal of `intent` from the store once terminal.
    pub fn purge(&self, intent: Intent) {
        self.inner.store.add_pending(IntentData::purge(intent));
    }

    /// The intent stored under `key`.
    #[must_use]
    pub fn get_intent(&self, key: &Key) -> Option<Intent> {
        self.inner.store.get_intent(key)
    }

    /// Every current intent.
    #[must_use]
    pub fn get_intents(&self) -> Vec<Intent> {
        self.inner.store.get_intents()
    }

    /// Every current intent submitted by `app_id`.
    #[must_use]
    pub fn get_intents_by_app_id(&self, app_id: &AppId) -> Vec<Intent> {
        self.inner
            .store
            .get_intents()
            .into_iter()
            .filter(|intent| intent.app_id() == app_id)
            .collect()
    }

    /// The current state of `key`.
    #[must_use]
    pub fn get_intent_state(&self, key: &Key) -> Option<IntentState> {
        self.inner.store.get_intent_state(key)
    }

    /// The installables compiled for `key`.
    #[must_use]
    pub fn get_installable_intents(&self, key: &Key) -> Vec<Intent> {
        self.inner.store.get_installable_intents(key)
    }

    /// Number of current intents.
    #[must_use]
    pub fn intent_count(&self) -> usize {
        self.inner.store.intent_count()
    }

    /// Every intent with an unprocessed pending request.
    #[must_use]
    pub fn pending(&self) -> Vec<Intent> {
        self.inner.store.pending()
    }

    /// `true` iff this node owns processing for `key`.
    #[must_use]
    pub fn is_local(&self, key: &Key) -> bool {
        self.inner.store.is_master(key)
    }

    /// Registers a compiler for `kind`.
    pub fn register_compiler(&self, kind: &IntentKind, compiler: Arc<dyn IntentCompiler>) {
        self.inner.compilers.register(kind, compiler);
    }

    /// Unregisters the compiler for `kind`.
    pub fn unregister_compiler(&self, kind: &IntentKind) {
        self.inner.compilers.unregister(kind);
    }

    /// Registers an installer for `kind`.
    pub fn register_installer(&self, kind: &IntentKind, installer: Arc<dyn IntentInstaller>) {
        self.inner.installers.register(kind, installer);
    }

    /// Unregisters the installer for `kind`.
    pub fn unregister_installer(&self, kind: &IntentKind) {
        self.inner.installers.unregister(kind);
    }

    /// Names of kinds with a registered compiler.
    #[must_use]
    pub fn registered_compiler_kinds(&self) -> Vec<String> {
        self.inner.compilers.registered_kinds()
    }

    /// Names of kinds with a registered installer.
    #[must_use]
    pub fn registered_installer_kinds(&self) -> Vec<String> {
        self.inner.installers.registered_kinds()
    }

    /// Installer success feedback endpoint.
    pub fn install_success(&self, context: IntentOperationContext) {
        self.inner.coordinator.success(context);
    }

    /// Installer failure feedback endpoint.
    pub fn install_failed(&self, context: IntentOperationContext) {
        self.inner.coordinator.failed(context);
    }

    /// Subscribes to the intent lifecycle event bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IntentEvent> {
        self.inner.events.subscribe()
    }

    /// Installs the tracking hook observing every written datum.
    pub fn set_tracker(&self, tracker: Arc<dyn IntentTracker>) {
        *self.inner.tracker.lock().expect("tracker lock poisoned") = Some(tracker);
    }

    /// Topology-change hook: re-submits the named intents, and, when
    /// `compile_all_failed` is set, sweeps every intent stuck in a
    /// recompilable state (or tolerating partial failure) into a fresh
    /// submit or withdraw.
    pub fn trigger_compile(
        &self,
        keys: impl IntoIterator<Item = Key>,
        compile_all_failed: bool,
    ) {
        let store = &self.inner.store;
        for key in keys {
            if !store.is_master(&key) {
                continue;
            }
            let Some(intent) = store.get_intent(&key) else {
                continue;
            };
            if store.get_pending_data(&key).is_some() {
                continue;
            }
            self.submit(intent);
        }

        if compile_all_failed {
            for intent in store.get_intents() {
                let key = intent.key().clone();
                if !store.is_master(&key) || store.get_pending_data(&key).is_some() {
                    continue;
                }
                let Some(state) = store.get_intent_state(&key) else {
                    continue;
                };
                if RECOMPILE.contains(&state) || intent.allows_partial_failure() {
                    if WITHDRAW.contains(&state) {
                        self.withdraw(intent);
                    } else {
                        self.submit(intent);
                    }
                }
            }
        }
    }
}

impl ManagerInner {
    async fn process_batch(self: &Arc<Self>, batch: Vec<IntentData>) {
        debug!(operations = batch.len(), "executing intent batch");
        let processor: Arc<dyn IntentProcessor> = Arc::new(Processor {
            inner: Arc::downgrade(self),
        });

        let tasks = batch.into_iter().map(|data| {
            let inner = Arc::clone(self);
            let processor = Arc::clone(&processor);
            async move {
                let key = data.key().clone();
                let request_state = data.state();
                let Ok(permit) = inner.workers.clone().acquire_owned().await else {
                    return None;
                };
                let worker = tokio::spawn({
                    let inner = Arc::clone(&inner);
                    async move { inner.process_one(data, &processor).await }
                });
                let result = worker.await;
                drop(permit);
                match result {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(key = %key, "phase worker failed: {err}");
                        inner.fail_current(&key, request_state)
                    }
                }
            }
        });

        let outputs: Vec<IntentData> = join_all(tasks).await.into_iter().flatten().collect();
        if outputs.is_empty() {
            return;
        }
        if let Err(err) = self.store.batch_write(outputs) {
            error!("batch write failed: {err}");
        }
    }

    async fn process_one(
        &self,
        data: IntentData,
        processor: &Arc<dyn IntentProcessor>,
    ) -> Option<IntentData> {
        let key = data.key().clone();
        if !self.store.is_master(&key) {
            trace!(key = %key, "not master, skipping");
            return None;
        }
        match self.store.get_pending_data(&key) {
            // Already handled by an earlier batch.
            None => return None,
            // A newer request will be compiled with the next batch.
            Some(pending) if pending.version() > data.version() => return None,
            Some(_) => {}
        }
        let current = self.store.get_intent_data(&key);
        debug!(
            key = %key,
            request = %data.request(),
            version = ?data.version(),
            "start processing"
        );
        let ctx = PhaseContext {
            processor: Arc::clone(processor),
            install_timeout: self.config.install_timeout(),
        };
        phase::execute(IntentProcessPhase::Initial {
            pending: data,
            current,
        }, &ctx)
        .await
    }

    /// Failure fallback when a worker dies mid-phase: land the key in FAILED
    /// with its current installables unchanged so a reconciliation sweep can
    /// retry.
    fn fail_current(&self, key: &Key, request_state: IntentState) -> Option<IntentData> {
        match request_state {
            IntentState::InstallReq
            | IntentState::Installing
            | IntentState::WithdrawReq
            | IntentState::Withdrawing => self
                .store
                .get_intent_data(key)
                .map(|current| IntentData::next_state(&current, IntentState::Failed)),
            _ => None,
        }
    }

    fn release_resources(&self, intent: &Intent) {
        let consumer = match intent.resource_group() {
            None => ResourceConsumer::Intent(intent.key().clone()),
            Some(group) => {
                let remaining = self
                    .store
                    .intent_data()
                    .into_iter()
                    .filter(|data| {
                        data.intent().resource_group() == Some(group)
                            && data.state() != IntentState::Withdrawn
                    })
                    .count();
                if remaining > 0 {
                    trace!(
                        group = %group,
                        remaining,
                        "resource group still in use, holding reservations"
                    );
                    return;
                }
                ResourceConsumer::Group(group.clone())
            }
        };
        if !self.resources.release(&consumer) {
            error!("failed to release resources allocated to {consumer}");
        }
    }
}

struct StoreDelegate {
    inner: Weak<ManagerInner>,
}

impl IntentStoreDelegate for StoreDelegate {
    fn process(&self, data: IntentData) {
        if let Some(inner) = self.inner.upgrade() {
            inner.accumulator.add(data);
        }
    }

    fn notify(&self, event: IntentEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if event.kind() == IntentEventKind::Withdrawn
            && !inner.config.skip_release_resources_on_withdrawal
        {
            inner.release_resources(event.subject());
        }
        let _ = inner.events.send(event);
    }

    fn on_update(&self, data: IntentData) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let tracker = inner.tracker.lock().expect("tracker lock poisoned").clone();
        if let Some(tracker) = tracker {
            tracker.track(&data);
        }
    }
}

struct Processor {
    inner: Weak<ManagerInner>,
}

impl IntentProcessor for Processor {
    fn compile(
        &self,
        intent: &Intent,
        previous: Option<&[Intent]>,
    ) -> Result<Vec<Intent>, IntentError> {
        match self.inner.upgrade() {
            Some(inner) => inner.compilers.compile(intent, previous),
            None => Err(IntentError::CompilationFailed {
                key: intent.key().clone(),
                reason: "intent manager stopped".to_string(),
            }),
        }
    }

    fn apply(
        &self,
        to_uninstall: Option<IntentData>,
        to_install: Option<IntentData>,
    ) -> oneshot::Receiver<InstallOutcome> {
        match self.inner.upgrade() {
            Some(inner) => inner.coordinator.install_intents(to_uninstall, to_install),
            None => {
                let (_tx, rx) = oneshot::channel();
                rx
            }
        }
    }

    fn abandon(&self, key: &Key) {
        if let Some(inner) = self.inner.upgrade() {
            inner.coordinator.abandon(key);
        }
    }

    fn announce(&self, event: IntentEvent) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.events.send(event);
        }
    }
}
