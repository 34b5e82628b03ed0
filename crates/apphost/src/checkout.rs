//! Prepared repository checkouts.
//!
//! Cloning and fetching are owned by an external repository manager; this module
//! only resolves an already prepared working directory for an instance key and
//! reads the optional `app.json` manifest in it.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::instance::InstanceKey;

/// Name of the per-app manifest inside a checkout.
pub const MANIFEST_FILE: &str = "app.json";

/// Per-app runtime settings shipped in the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppManifest {
    pub entry_file: Option<String>,
    pub env: HashMap<String, String>,
    pub cli_args: Vec<String>,
}

/// A working directory ready to launch from.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub working_dir: PathBuf,
    pub manifest: AppManifest,
}

/// Resolves the working directory for an instance.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn prepare(&self, key: &InstanceKey) -> HostResult<Checkout>;
}

/// Checkouts laid out as `<root>/<repository>/<ref>`.
#[derive(Debug, Clone)]
pub struct DirectoryCheckouts {
    root: PathBuf,
}

impl DirectoryCheckouts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &InstanceKey) -> PathBuf {
        self.root.join(key.repository()).join(key.git_ref())
    }
}

#[async_trait]
impl CheckoutProvider for DirectoryCheckouts {
    async fn prepare(&self, key: &InstanceKey) -> HostResult<Checkout> {
        let working_dir = self.path_for(key);
        if !tokio::fs::metadata(&working_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(HostError::SpawnFailed(format!(
                "working directory {} does not exist",
                working_dir.display()
            )));
        }

        let manifest_path = working_dir.join(MANIFEST_FILE);
        let manifest = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                HostError::SpawnFailed(format!("invalid {}: {}", manifest_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppManifest::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Checkout {
            working_dir,
            manifest,
        })
    }
}
