//! Tests for the intent subsystem, driving the full engine: store →
//! accumulator → batch executor → phase pipeline → coordinator → installers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use super::coordinator::InstallOutcome;
use super::*;
use crate::app::AppId;
use crate::config::IntentManagerConfig;
use crate::resource::{ResourceConsumer, ResourceService};

/// Routes engine tracing into the test harness; `RUST_LOG` controls what
/// shows on failure output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn app() -> AppId {
    AppId::new(1, "lattice.test")
}

fn intent(name: &str) -> Intent {
    Intent::builder(Key::of(name, app()), app())
        .kind(kinds::point_to_point().clone())
        .build()
}

fn grouped_intent(name: &str, group: &str) -> Intent {
    Intent::builder(Key::of(name, app()), app())
        .kind(kinds::point_to_point().clone())
        .resource_group(ResourceGroup::new(group))
        .build()
}

/// Compiles any connectivity intent into one flow-rule and one
/// flow-objective installable, deterministically derived from the intent so
/// recompilation reproduces the same output.
struct TwoKindCompiler;

impl IntentCompiler for TwoKindCompiler {
    fn compile(
        &self,
        intent: &Intent,
        _previous: Option<&[Intent]>,
    ) -> Result<Vec<Intent>, IntentError> {
        let rule = Intent::builder(intent.key().clone(), intent.app_id().clone())
            .kind(kinds::flow_rule().clone())
            .params(intent.params().clone())
            .build();
        let objective = Intent::builder(intent.key().clone(), intent.app_id().clone())
            .kind(kinds::flow_objective().clone())
            .params(intent.params().clone())
            .build();
        Ok(vec![rule, objective])
    }
}

/// Compiles into a single flow-rule installable.
struct OneKindCompiler;

impl IntentCompiler for OneKindCompiler {
    fn compile(
        &self,
        intent: &Intent,
        _previous: Option<&[Intent]>,
    ) -> Result<Vec<Intent>, IntentError> {
        Ok(vec![Intent::builder(intent.key().clone(), intent.app_id().clone())
            .kind(kinds::flow_rule().clone())
            .params(intent.params().clone())
            .build()])
    }
}

/// Reports success as soon as it is applied.
struct InstantInstaller;

impl IntentInstaller for InstantInstaller {
    fn apply(&self, context: IntentOperationContext) {
        context.feedback().success(context);
    }
}

/// Never reports; the coordinator times the operation out.
struct SilentInstaller;

impl IntentInstaller for SilentInstaller {
    fn apply(&self, _context: IntentOperationContext) {}
}

/// Holds its first context for the test to resolve; succeeds the rest.
struct GatedInstaller {
    hold_first: AtomicBool,
    held: Mutex<Option<IntentOperationContext>>,
}

impl GatedInstaller {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            hold_first: AtomicBool::new(true),
            held: Mutex::new(None),
        })
    }

    fn take_held(&self) -> Option<IntentOperationContext> {
        self.held.lock().unwrap().take()
    }
}

impl IntentInstaller for GatedInstaller {
    fn apply(&self, context: IntentOperationContext) {
        if self.hold_first.swap(false, Ordering::SeqCst) {
            *self.held.lock().unwrap() = Some(context);
        } else {
            context.feedback().success(context);
        }
    }
}

#[derive(Default)]
struct RecordingResources {
    released: Mutex<Vec<ResourceConsumer>>,
}

impl RecordingResources {
    fn released(&self) -> Vec<ResourceConsumer> {
        self.released.lock().unwrap().clone()
    }
}

impl ResourceService for RecordingResources {
    fn release(&self, consumer: &ResourceConsumer) -> bool {
        self.released.lock().unwrap().push(consumer.clone());
        true
    }
}

struct Harness {
    manager: IntentManager,
    store: Arc<SimpleIntentStore>,
    resources: Arc<RecordingResources>,
}

fn harness() -> Harness {
    harness_with(IntentManagerConfig::default())
}

fn harness_with(config: IntentManagerConfig) -> Harness {
    init_tracing();
    let store = Arc::new(SimpleIntentStore::new());
    let resources = Arc::new(RecordingResources::default());
    let manager = IntentManager::start(
        Arc::clone(&store) as Arc<dyn IntentStore>,
        Arc::clone(&resources) as Arc<dyn ResourceService>,
        config,
    );
    Harness {
        manager,
        store,
        resources,
    }
}

/// Receives events until `kind` arrives, returning everything seen in order.
async fn events_until(
    rx: &mut broadcast::Receiver<IntentEvent>,
    kind: IntentEventKind,
) -> Vec<IntentEventKind> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("timed out waiting for intent event")
            .expect("event bus closed");
        seen.push(event.kind());
        if event.kind() == kind {
            return seen;
        }
    }
}

// =============================================================================
// Submit / install
// =============================================================================

#[tokio::test(start_paused = true)]
async fn submit_compiles_installs_and_lands_installed() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(TwoKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    h.manager
        .register_installer(kinds::flow_objective(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("a");
    h.manager.submit(submitted.clone());

    let seen = events_until(&mut events, IntentEventKind::Installed).await;
    assert_eq!(
        seen,
        vec![
            IntentEventKind::InstallReq,
            IntentEventKind::Compiling,
            IntentEventKind::Installing,
            IntentEventKind::Installed,
        ]
    );
    assert_eq!(
        h.manager.get_intent_state(submitted.key()),
        Some(IntentState::Installed)
    );
    assert_eq!(h.manager.get_installable_intents(submitted.key()).len(), 2);
    assert_eq!(h.manager.intent_count(), 1);
    assert_eq!(h.manager.get_intents_by_app_id(&app()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_compiler_fails_the_intent() {
    let h = harness();
    let mut events = h.manager.subscribe();

    h.manager.submit(intent("a"));

    let seen = events_until(&mut events, IntentEventKind::Failed).await;
    assert_eq!(
        seen,
        vec![
            IntentEventKind::InstallReq,
            IntentEventKind::Compiling,
            IntentEventKind::Failed,
        ]
    );
    assert_eq!(
        h.manager.get_intent_state(intent("a").key()),
        Some(IntentState::Failed)
    );
}

// =============================================================================
// Scenario: one installer succeeds, the other times out
// =============================================================================

#[tokio::test(start_paused = true)]
async fn install_timeout_fails_the_intent_and_holds_resources() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(TwoKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    h.manager
        .register_installer(kinds::flow_objective(), Arc::new(SilentInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("a");
    h.manager.submit(submitted.clone());

    let seen = events_until(&mut events, IntentEventKind::Failed).await;
    assert_eq!(
        seen,
        vec![
            IntentEventKind::InstallReq,
            IntentEventKind::Compiling,
            IntentEventKind::Installing,
            IntentEventKind::Failed,
        ]
    );
    let current = h.store.get_intent_data(submitted.key()).unwrap();
    assert_eq!(current.state(), IntentState::Failed);
    assert!(current.errors().iter().any(|e| e.contains("timed out")));
    // No withdrawal happened, so reservations stay.
    assert!(h.resources.released().is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_failure_tolerant_intent_lands_corrupt() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(TwoKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    // flow-objective has no installer: that slice fails while flow-rule
    // succeeds, which is exactly a partial failure.
    let mut events = h.manager.subscribe();

    let tolerant = Intent::builder(Key::of("a", app()), app())
        .kind(kinds::point_to_point().clone())
        .constraint(Constraint::AllowPartialFailure)
        .build();
    h.manager.submit(tolerant.clone());

    let seen = events_until(&mut events, IntentEventKind::Corrupt).await;
    assert_eq!(*seen.last().unwrap(), IntentEventKind::Corrupt);
    assert_eq!(
        h.manager.get_intent_state(tolerant.key()),
        Some(IntentState::Corrupt)
    );
}

// =============================================================================
// Scenario: submit then withdraw, resources released
// =============================================================================

#[tokio::test(start_paused = true)]
async fn submit_then_withdraw_traverses_the_full_lifecycle() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("b");
    h.manager.submit(submitted.clone());
    let installed = events_until(&mut events, IntentEventKind::Installed).await;
    assert_eq!(
        installed,
        vec![
            IntentEventKind::InstallReq,
            IntentEventKind::Compiling,
            IntentEventKind::Installing,
            IntentEventKind::Installed,
        ]
    );

    h.manager.withdraw(submitted.clone());
    let withdrawn = events_until(&mut events, IntentEventKind::Withdrawn).await;
    assert_eq!(
        withdrawn,
        vec![
            IntentEventKind::WithdrawReq,
            IntentEventKind::Withdrawing,
            IntentEventKind::Withdrawn,
        ]
    );
    assert_eq!(
        h.resources.released(),
        vec![ResourceConsumer::Intent(submitted.key().clone())]
    );
}

#[tokio::test(start_paused = true)]
async fn submit_withdraw_purge_round_trip_forgets_the_intent() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("c");
    h.manager.submit(submitted.clone());
    events_until(&mut events, IntentEventKind::Installed).await;
    h.manager.withdraw(submitted.clone());
    events_until(&mut events, IntentEventKind::Withdrawn).await;
    h.manager.purge(submitted.clone());
    events_until(&mut events, IntentEventKind::Purged).await;

    assert!(h.manager.get_intent(submitted.key()).is_none());
    assert_eq!(h.manager.intent_count(), 0);
    assert_eq!(
        h.resources.released(),
        vec![ResourceConsumer::Intent(submitted.key().clone())]
    );
}

// =============================================================================
// Resource groups
// =============================================================================

#[tokio::test(start_paused = true)]
async fn group_resources_release_only_when_the_last_member_withdraws() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let first = grouped_intent("g1", "pool");
    let second = grouped_intent("g2", "pool");
    h.manager.submit(first.clone());
    events_until(&mut events, IntentEventKind::Installed).await;
    h.manager.submit(second.clone());
    events_until(&mut events, IntentEventKind::Installed).await;

    h.manager.withdraw(first.clone());
    events_until(&mut events, IntentEventKind::Withdrawn).await;
    assert!(
        h.resources.released().is_empty(),
        "group still has a live member"
    );

    h.manager.withdraw(second.clone());
    events_until(&mut events, IntentEventKind::Withdrawn).await;
    assert_eq!(
        h.resources.released(),
        vec![ResourceConsumer::Group(ResourceGroup::new("pool"))]
    );
}

#[tokio::test(start_paused = true)]
async fn skip_release_flag_suppresses_resource_release() {
    let config = IntentManagerConfig {
        skip_release_resources_on_withdrawal: true,
        ..IntentManagerConfig::default()
    };
    let h = harness_with(config);
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("d");
    h.manager.submit(submitted.clone());
    events_until(&mut events, IntentEventKind::Installed).await;
    h.manager.withdraw(submitted);
    events_until(&mut events, IntentEventKind::Withdrawn).await;

    assert!(h.resources.released().is_empty());
}

// =============================================================================
// Skips and ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn resubmit_with_unchanged_installables_is_skipped() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("e");
    h.manager.submit(submitted.clone());
    events_until(&mut events, IntentEventKind::Installed).await;
    let installed_version = h
        .store
        .get_intent_data(submitted.key())
        .unwrap()
        .version();

    h.manager.submit(submitted.clone());
    // The resubmission compiles to identical installables and is skipped:
    // COMPILING is announced, then nothing further is written.
    let seen = events_until(&mut events, IntentEventKind::Compiling).await;
    assert_eq!(
        seen,
        vec![IntentEventKind::InstallReq, IntentEventKind::Compiling]
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(events.try_recv().is_err(), "no further events expected");
    assert_eq!(
        h.store.get_intent_data(submitted.key()).unwrap().version(),
        installed_version,
        "skipped request must not rewrite current data"
    );
}

#[tokio::test(start_paused = true)]
async fn stale_pending_request_is_skipped() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("f");
    h.manager.submit(submitted.clone());
    events_until(&mut events, IntentEventKind::Installed).await;

    // A request stamped behind the current data must be dropped in the
    // Initial phase without a write.
    let mut stale = IntentData::submit(submitted.clone());
    stale.set_version(Version::new(0, 0));
    h.store.add_pending(stale);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        h.manager.get_intent_state(submitted.key()),
        Some(IntentState::Installed)
    );
}

#[tokio::test(start_paused = true)]
async fn newer_request_mid_batch_is_processed_after_the_inflight_batch() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    let gated = GatedInstaller::new();
    h.manager
        .register_installer(kinds::flow_rule(), gated.clone());
    let mut events = h.manager.subscribe();

    let submitted = intent("g");
    h.manager.submit(submitted.clone());
    events_until(&mut events, IntentEventKind::Installing).await;

    // The install is parked inside the coordinator; a newer request arrives
    // while the batch is still in flight.
    h.manager.withdraw(submitted.clone());
    let held = gated.take_held().expect("installer holds the context");
    h.manager.install_success(held);

    let seen = events_until(&mut events, IntentEventKind::Withdrawn).await;
    let installed_at = seen
        .iter()
        .position(|k| *k == IntentEventKind::Installed)
        .expect("in-flight batch result must be written");
    let withdrawing_at = seen
        .iter()
        .position(|k| *k == IntentEventKind::Withdrawing)
        .unwrap();
    assert!(
        installed_at < withdrawing_at,
        "in-flight install completes before the newer request runs"
    );
    assert_eq!(
        h.manager.get_intent_state(submitted.key()),
        Some(IntentState::Withdrawn)
    );
}

#[tokio::test(start_paused = true)]
async fn writes_for_a_key_carry_strictly_increasing_versions() {
    struct VersionTracker(Mutex<Vec<Version>>);
    impl IntentTracker for VersionTracker {
        fn track(&self, data: &IntentData) {
            self.0.lock().unwrap().push(data.version().unwrap());
        }
    }

    let h = harness();
    let tracker = Arc::new(VersionTracker(Mutex::new(Vec::new())));
    h.manager.set_tracker(tracker.clone());
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    h.manager
        .register_installer(kinds::flow_rule(), Arc::new(InstantInstaller));
    let mut events = h.manager.subscribe();

    let submitted = intent("h");
    h.manager.submit(submitted.clone());
    events_until(&mut events, IntentEventKind::Installed).await;
    h.manager.withdraw(submitted.clone());
    events_until(&mut events, IntentEventKind::Withdrawn).await;

    let versions = tracker.0.lock().unwrap().clone();
    assert!(versions.len() >= 2);
    for pair in versions.windows(2) {
        assert!(pair[1].is_newer_than(pair[0]), "versions must increase");
    }
}

// =============================================================================
// Topology-change sweep
// =============================================================================

#[tokio::test(start_paused = true)]
async fn compile_all_failed_resubmits_every_failed_intent() {
    // A very long window and an oversized batch keep resubmissions pending
    // while we count them.
    let config = IntentManagerConfig {
        batch_window_ms: 3_600_000,
        batch_max_items: 100_000,
        ..IntentManagerConfig::default()
    };
    let h = harness_with(config);

    const FAILED_INTENTS: usize = 10_000;
    let mut seed = Vec::with_capacity(FAILED_INTENTS);
    for i in 0..FAILED_INTENTS {
        let mut data = IntentData::submit(intent(&format!("fail-{i}")));
        data.set_version(Version::new(1, i as u64));
        seed.push(data.advance(IntentState::Failed));
    }
    h.store.batch_write(seed).unwrap();
    assert_eq!(h.manager.intent_count(), FAILED_INTENTS);

    h.manager.trigger_compile(Vec::new(), true);

    assert_eq!(
        h.manager.pending().len(),
        FAILED_INTENTS,
        "every failed intent is resubmitted exactly once"
    );
}

#[tokio::test(start_paused = true)]
async fn trigger_compile_skips_keys_with_pending_work() {
    let config = IntentManagerConfig {
        batch_window_ms: 3_600_000,
        ..IntentManagerConfig::default()
    };
    let h = harness_with(config);

    let mut data = IntentData::submit(intent("busy"));
    data.set_version(Version::new(1, 0));
    h.store.batch_write(vec![data.advance(IntentState::Failed)]).unwrap();
    h.manager.submit(intent("busy"));
    assert_eq!(h.manager.pending().len(), 1);

    h.manager.trigger_compile(vec![intent("busy").key().clone()], true);

    // The key already had pending work; the sweep must not duplicate it.
    assert_eq!(h.manager.pending().len(), 1);
}

// =============================================================================
// Coordinator feedback endpoints
// =============================================================================

#[tokio::test(start_paused = true)]
async fn manager_feedback_endpoints_resolve_the_coordinator() {
    let h = harness();
    h.manager
        .register_compiler(kinds::connectivity(), Arc::new(OneKindCompiler));
    let gated = GatedInstaller::new();
    h.manager
        .register_installer(kinds::flow_rule(), gated.clone());
    let mut events = h.manager.subscribe();

    h.manager.submit(intent("i"));
    events_until(&mut events, IntentEventKind::Installing).await;

    let mut held = gated.take_held().expect("installer holds the context");
    held.add_error("unit test failure");
    h.manager.install_failed(held);

    let seen = events_until(&mut events, IntentEventKind::Failed).await;
    assert_eq!(*seen.last().unwrap(), IntentEventKind::Failed);
    let data = h.store.get_intent_data(intent("i").key()).unwrap();
    assert_eq!(data.errors(), ["unit test failure".to_string()]);
}

// Quiet check that the outcome type prints usefully in failure logs.
#[test]
fn install_outcome_failure_carries_errors() {
    let outcome = InstallOutcome::Failure {
        errors: vec!["x".to_string()],
        any_succeeded: false,
    };
    assert_ne!(format!("{outcome:?}"), String::new());
}
