//! Disk bootstrap of the application inventory.
//!
//! Walks the local archive directory, installing every archived application
//! (dependencies first) and activating the ones flagged active on disk.
//! Dependency cycles abandon the affected branch; transient archive errors
//! retry with a jittered delay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::time::sleep;
use tracing::{error, warn};

use super::store::AppStoreInner;
use super::{AppError, Application};

pub(crate) async fn load_from_disk(inner: &Arc<AppStoreInner>) {
    let pending = Mutex::new(Vec::new());
    for name in inner.archive.application_names() {
        let Some(app) = load_app(inner, &pending, name.clone()).await else {
            continue;
        };
        if inner.archive.is_active(&name) {
            // Apps loaded from disk count as explicitly activated: they stay
            // up until the user deactivates them, not until their dependents
            // go away.
            inner.mark_required_by_core(app.id());
            inner.do_activate(app.id(), false);
        }
    }
}

fn load_app<'a>(
    inner: &'a Arc<AppStoreInner>,
    pending: &'a Mutex<Vec<String>>,
    name: String,
) -> BoxFuture<'a, Option<Application>> {
    async move {
        pending.lock().expect("pending lock poisoned").push(name.clone());
        let mut attempts = 0;
        let loaded = loop {
            match try_load(inner, pending, &name).await {
                Ok(app) => break Some(app),
                // Abandoned branches do not retry.
                Err(
                    err @ (AppError::CircularDependency { .. }
                    | AppError::MissingDependencies { .. }),
                ) => {
                    error!("unable to load application {name}: {err}");
                    break None;
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= inner.config.max_load_retries {
                        error!("unable to load application {name}: {err}");
                        break None;
                    }
                    warn!("unable to load application {name} from disk: {err}; retrying");
                    sleep(jittered(inner.config.retry_delay_ms)).await;
                }
            }
        };
        pending
            .lock()
            .expect("pending lock poisoned")
            .retain(|pending_name| pending_name != &name);
        loaded
    }
    .boxed()
}

async fn try_load(
    inner: &Arc<AppStoreInner>,
    pending: &Mutex<Vec<String>>,
    name: &str,
) -> Result<Application, AppError> {
    // Already installed, nothing to do.
    if let Some(app) = inner
        .id_store
        .get_app_id(name)
        .and_then(|id| inner.get_application(&id))
    {
        return Ok(app);
    }

    let description = inner.archive.get_application_description(name)?;

    let cycle = {
        let pending = pending.lock().expect("pending lock poisoned");
        description
            .required_apps
            .iter()
            .find(|required| pending.contains(required))
            .cloned()
    };
    if let Some(looped) = cycle {
        error!(
            "Circular app dependency detected: {:?} -> {looped}",
            pending.lock().expect("pending lock poisoned")
        );
        return Err(AppError::CircularDependency {
            name: name.to_string(),
        });
    }

    for required in &description.required_apps {
        if load_app(inner, pending, required.clone()).await.is_none() {
            error!("unable to load dependencies for application {name}");
            return Err(AppError::MissingDependencies {
                name: name.to_string(),
            });
        }
    }

    inner.create_from_description(description, false)
}

fn jittered(base_ms: u64) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=base_ms))
}
