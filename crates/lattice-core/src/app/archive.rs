//! On-disk application inventory.
//!
//! Each application owns a directory under the archive root:
//!
//! ```text
//! <root>/<name>/app.json     the archive bytes (a JSON manifest)
//! <root>/<name>/active       present iff the app is active on this node
//! <root>/<name>/timestamp    last-touched wall-clock millis
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::Utc;
use tracing::warn;

use super::{AppError, ApplicationDescription};

const MANIFEST_FILE: &str = "app.json";
const ACTIVE_FILE: &str = "active";
const TIMESTAMP_FILE: &str = "timestamp";

/// Per-node on-disk application archive.
#[derive(Debug, Clone)]
pub struct ApplicationArchive {
    root: PathBuf,
}

impl ApplicationArchive {
    /// Opens (creating if needed) the archive rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails when the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Parses `bytes` as an application archive and persists it.
    ///
    /// # Errors
    ///
    /// Fails when the manifest does not parse or the bytes cannot be written.
    pub fn save_application(&self, bytes: &[u8]) -> Result<ApplicationDescription, AppError> {
        let description: ApplicationDescription = serde_json::from_slice(bytes)?;
        let dir = self.app_dir(&description.name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(MANIFEST_FILE), bytes)?;
        Ok(description)
    }

    /// Re-parses the stored manifest of `name`.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] when the app has no archive on this node.
    pub fn get_application_description(
        &self,
        name: &str,
    ) -> Result<ApplicationDescription, AppError> {
        let bytes = self.application_bits(name)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The raw archive bytes of `name`.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] when the app has no archive on this node.
    pub fn application_bits(&self, name: &str) -> Result<Bytes, AppError> {
        match fs::read(self.app_dir(name).join(MANIFEST_FILE)) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(AppError::NotFound {
                name: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes every trace of `name` from this node's disk.
    pub fn purge_application(&self, name: &str) {
        if let Err(err) = fs::remove_dir_all(self.app_dir(name)) {
            if err.kind() != ErrorKind::NotFound {
                warn!("unable to purge application {name}: {err}");
            }
        }
    }

    /// Names of every application archived on this node.
    #[must_use]
    pub fn application_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().join(MANIFEST_FILE).is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    /// `true` when `name` is flagged active on this node's disk.
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.app_dir(name).join(ACTIVE_FILE).is_file()
    }

    /// Flags `name` active on disk.
    pub fn set_active(&self, name: &str) {
        if let Err(err) = fs::write(self.app_dir(name).join(ACTIVE_FILE), b"") {
            warn!("unable to mark application {name} active: {err}");
        }
    }

    /// Clears the on-disk active flag of `name`.
    pub fn clear_active(&self, name: &str) {
        if let Err(err) = fs::remove_file(self.app_dir(name).join(ACTIVE_FILE)) {
            if err.kind() != ErrorKind::NotFound {
                warn!("unable to clear active flag of {name}: {err}");
            }
        }
    }

    /// Touches the last-modified stamp of `name`.
    pub fn update_time(&self, name: &str) {
        let stamp = Utc::now().timestamp_millis().to_string();
        if let Err(err) = fs::write(self.app_dir(name).join(TIMESTAMP_FILE), stamp) {
            warn!("unable to update timestamp of {name}: {err}");
        }
    }

    fn app_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// The archive root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
