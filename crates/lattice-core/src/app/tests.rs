//! Tests for the application subsystem, including simulated multi-node
//! clusters: stores share a storage fabric and a local cluster hub but keep
//! per-node archives, exactly as replicas do.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use super::store::DistributedAppStore;
use super::{
    AppError, AppEventKind, ApplicationEvent, ApplicationState, InMemoryAppIdStore,
};
use crate::cluster::LocalCluster;
use crate::config::AppStoreConfig;
use crate::store::LocalStorageFabric;

struct ClusterEnv {
    fabric: LocalStorageFabric,
    cluster: LocalCluster,
    ids: Arc<InMemoryAppIdStore>,
}

/// Routes store tracing into the test harness; `RUST_LOG` controls what
/// shows on failure output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn cluster_env() -> ClusterEnv {
    init_tracing();
    ClusterEnv {
        fabric: LocalStorageFabric::new(),
        cluster: LocalCluster::new(),
        ids: Arc::new(InMemoryAppIdStore::new()),
    }
}

struct Node {
    store: DistributedAppStore,
    events: broadcast::Receiver<ApplicationEvent>,
    dir: TempDir,
}

fn node(env: &ClusterEnv, name: &str) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let member = Arc::new(env.cluster.join(name));
    let store = DistributedAppStore::new(
        dir.path(),
        &env.fabric,
        member.clone(),
        member,
        Arc::clone(&env.ids) as Arc<dyn super::ApplicationIdStore>,
        AppStoreConfig::default(),
    )
    .unwrap();
    let events = store.subscribe();
    Node { store, events, dir }
}

fn manifest(name: &str, version: &str, required: &[&str]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "name": name,
        "version": version,
        "required_apps": required,
    }))
    .unwrap()
}

/// Receives events until `kind` arrives, returning everything seen in order.
async fn events_until(
    rx: &mut broadcast::Receiver<ApplicationEvent>,
    kind: AppEventKind,
) -> Vec<AppEventKind> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for application event")
            .expect("event bus closed");
        seen.push(event.kind());
        if event.kind() == kind {
            return seen;
        }
    }
}

// =============================================================================
// Install
// =============================================================================

#[tokio::test(start_paused = true)]
async fn install_with_missing_dependency_is_rejected_and_purged() {
    let env = cluster_env();
    let n = node(&env, "a");

    let err = n.store.create(&manifest("foo", "1.0.0", &["bar"])).unwrap_err();
    assert!(matches!(err, AppError::MissingDependencies { ref name } if name == "foo"));

    // The archive is purged so the app can be reinstalled later, and no map
    // entry was created.
    assert!(n.store.inner.archive.application_names().is_empty());
    assert!(n.store.get_applications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn install_is_idempotent() {
    let env = cluster_env();
    let n = node(&env, "a");

    let first = n.store.create(&manifest("foo", "1.0.0", &[])).unwrap();
    let second = n.store.create(&manifest("foo", "1.0.0", &[])).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(n.store.get_applications().len(), 1);
}

// =============================================================================
// Reference-counted activation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn shared_requirement_stays_active_until_the_last_dependent_leaves() {
    let env = cluster_env();
    let n = node(&env, "a");

    n.store.create(&manifest("z", "1.0.0", &[])).unwrap();
    n.store.create(&manifest("x", "1.0.0", &["z"])).unwrap();
    n.store.create(&manifest("y", "1.0.0", &["z"])).unwrap();
    let z = n.store.get_id("z").unwrap();
    let x = n.store.get_id("x").unwrap();
    let y = n.store.get_id("y").unwrap();

    n.store.activate(&x);
    n.store.activate(&y);
    assert_eq!(n.store.get_state(&z), Some(ApplicationState::Active));

    n.store.deactivate(&x);
    assert_eq!(
        n.store.get_state(&z),
        Some(ApplicationState::Active),
        "z is still required by y"
    );
    {
        let required_by = n.store.inner.required_by.lock().unwrap();
        assert_eq!(
            required_by.get(&z).map(std::collections::HashSet::len),
            Some(1)
        );
        assert!(required_by.get(&z).unwrap().contains(&y));
    }

    n.store.deactivate(&y);
    assert_eq!(n.store.get_state(&z), Some(ApplicationState::Installed));
}

#[tokio::test(start_paused = true)]
async fn deactivating_a_requirement_takes_dependents_down_first() {
    let env = cluster_env();
    let n = node(&env, "a");

    n.store.create(&manifest("base", "1.0.0", &[])).unwrap();
    n.store.create(&manifest("top", "1.0.0", &["base"])).unwrap();
    let base = n.store.get_id("base").unwrap();
    let top = n.store.get_id("top").unwrap();

    n.store.activate(&top);
    assert_eq!(n.store.get_state(&base), Some(ApplicationState::Active));

    n.store.deactivate(&base);
    assert_eq!(n.store.get_state(&top), Some(ApplicationState::Installed));
    assert_eq!(n.store.get_state(&base), Some(ApplicationState::Installed));
}

// =============================================================================
// Round trip
// =============================================================================

#[tokio::test(start_paused = true)]
async fn install_activate_deactivate_remove_round_trip() {
    let env = cluster_env();
    let mut n = node(&env, "a");

    let app = n.store.create(&manifest("foo", "1.0.0", &[])).unwrap();
    let id = app.id().clone();
    events_until(&mut n.events, AppEventKind::Installed).await;

    n.store.activate(&id);
    events_until(&mut n.events, AppEventKind::Activated).await;

    n.store.deactivate(&id);
    events_until(&mut n.events, AppEventKind::Deactivated).await;

    n.store.remove(&id);
    let seen = events_until(&mut n.events, AppEventKind::Uninstalled).await;
    assert_eq!(
        seen.iter()
            .filter(|kind| **kind == AppEventKind::Uninstalled)
            .count(),
        1,
        "APP_UNINSTALLED is emitted exactly once"
    );

    assert!(n.store.get_application(&id).is_none());
    assert!(n.store.get_applications().is_empty());
    assert!(
        n.store.inner.archive.application_names().is_empty(),
        "archive is purged on uninstall"
    );
}

#[tokio::test(start_paused = true)]
async fn removing_a_requirement_uninstalls_dependents() {
    let env = cluster_env();
    let n = node(&env, "a");

    n.store.create(&manifest("base", "1.0.0", &[])).unwrap();
    n.store.create(&manifest("top", "1.0.0", &["base"])).unwrap();
    let base = n.store.get_id("base").unwrap();

    n.store.remove(&base);
    assert!(n.store.get_applications().is_empty());
}

// =============================================================================
// Permissions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn permission_changes_emit_exactly_when_the_set_changes() {
    let env = cluster_env();
    let mut n = node(&env, "a");

    n.store.create(&manifest("foo", "1.0.0", &[])).unwrap();
    let id = n.store.get_id("foo").unwrap();
    events_until(&mut n.events, AppEventKind::Installed).await;

    n.store.set_permissions(&id, vec!["packet-read".to_string()]);
    let seen = events_until(&mut n.events, AppEventKind::PermissionsChanged).await;
    assert_eq!(*seen.last().unwrap(), AppEventKind::PermissionsChanged);
    assert_eq!(n.store.get_permissions(&id), vec!["packet-read".to_string()]);

    // Setting the same permissions again is a no-op.
    n.store.set_permissions(&id, vec!["packet-read".to_string()]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(n.events.try_recv().is_err());
}

// =============================================================================
// Bits transfer between nodes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn bits_travel_from_the_installing_node_to_its_peers() {
    let env = cluster_env();
    let mut a = node(&env, "a");
    let mut b = node(&env, "b");
    a.store.start().await;
    b.store.start().await;

    let app = a.store.create(&manifest("p", "1.0.0", &[])).unwrap();
    let id = app.id().clone();

    // Node b observes the inserted holder, requests the bits from a, and
    // only then reports the installation.
    let seen_b = events_until(&mut b.events, AppEventKind::Installed).await;
    assert_eq!(*seen_b.last().unwrap(), AppEventKind::Installed);
    assert!(b.store.get_application_archive(&id).is_ok());

    a.store.activate(&id);
    let seen_b = events_until(&mut b.events, AppEventKind::Activated).await;
    assert_eq!(*seen_b.last().unwrap(), AppEventKind::Activated);
    assert_eq!(b.store.get_state(&id), Some(ApplicationState::Active));

    // The installing node went through the same lifecycle.
    let seen_a = events_until(&mut a.events, AppEventKind::Activated).await;
    assert!(seen_a.contains(&AppEventKind::Installed));
}

// =============================================================================
// Disk bootstrap
// =============================================================================

#[tokio::test(start_paused = true)]
async fn disk_bootstrap_abandons_dependency_cycles() {
    let env = cluster_env();
    let dir = tempfile::tempdir().unwrap();

    // u and v require each other; w is healthy and flagged active.
    for (name, required) in [("u", vec!["v"]), ("v", vec!["u"]), ("w", vec![])] {
        let app_dir = dir.path().join(name);
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(app_dir.join("app.json"), manifest(name, "1.0.0", &required)).unwrap();
    }
    fs::write(dir.path().join("w").join("active"), b"").unwrap();

    let member = Arc::new(env.cluster.join("a"));
    let store = DistributedAppStore::new(
        dir.path(),
        &env.fabric,
        member.clone(),
        member,
        Arc::clone(&env.ids) as Arc<dyn super::ApplicationIdStore>,
        AppStoreConfig::default(),
    )
    .unwrap();
    let mut events = store.subscribe();
    store.start().await;

    // Both cycle members were abandoned; only w made it in, activated.
    let names: Vec<String> = store
        .get_applications()
        .iter()
        .map(|app| app.name().to_string())
        .collect();
    assert_eq!(names, vec!["w"]);
    let w = store.get_id("w").unwrap();
    let seen = events_until(&mut events, AppEventKind::Activated).await;
    assert!(seen.contains(&AppEventKind::Installed));
    assert_eq!(store.get_state(&w), Some(ApplicationState::Active));
}

// =============================================================================
// Version reconciliation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn stored_version_is_rebuilt_from_disk_on_upgrade() {
    let env = cluster_env();
    let n = node(&env, "a");

    n.store.create(&manifest("r", "1.0.0", &[])).unwrap();
    let id = n.store.get_id("r").unwrap();

    // Simulate an upgraded node: the on-disk archive now carries 2.0.0 while
    // the replicated holder still says 1.0.0.
    let app_dir = n.dir.path().join("r");
    fs::write(app_dir.join("app.json"), manifest("r", "2.0.0", &[])).unwrap();

    // A store handle built against the same fabric reconciles the entry.
    let upgraded_dir = n.dir.path().to_path_buf();
    let member = Arc::new(env.cluster.join("a"));
    let upgraded = DistributedAppStore::new(
        upgraded_dir,
        &env.fabric,
        member.clone(),
        member,
        Arc::clone(&env.ids) as Arc<dyn super::ApplicationIdStore>,
        AppStoreConfig::default(),
    )
    .unwrap();

    assert_eq!(
        upgraded.get_application(&id).unwrap().version(),
        "2.0.0"
    );
    assert_eq!(n.store.get_application(&id).unwrap().version(), "2.0.0");
}
