//! Launch convention for hosted apps.
//!
//! Turns a prepared checkout plus a leased port into a [`SpawnSpec`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::process::SpawnSpec;
use crate::checkout::Checkout;
use crate::instance::InstanceKey;

/// How hosted apps are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments; `{port}`, `{entry_file}` and `{workdir}` are expanded.
    pub args: Vec<String>,
    /// Virtualenv activate script, absolute or relative to the checkout.
    pub venv_activator: Option<String>,
    /// Environment variable carrying the leased port.
    pub port_env: String,
    /// Extra environment for every instance.
    pub env: HashMap<String, String>,
    /// Entry file when the checkout has no manifest entry.
    pub default_entry_file: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: "streamlit".to_string(),
            args: vec![
                "run".to_string(),
                "{entry_file}".to_string(),
                "--server.port".to_string(),
                "{port}".to_string(),
                "--server.headless".to_string(),
                "true".to_string(),
            ],
            venv_activator: None,
            port_env: "PORT".to_string(),
            env: HashMap::from([("RELEASE_MODE".to_string(), "true".to_string())]),
            default_entry_file: "app.py".to_string(),
        }
    }
}

impl LaunchConfig {
    /// Build the spawn spec for one instance generation.
    pub fn spawn_spec(
        &self,
        key: &InstanceKey,
        checkout: &Checkout,
        port: u16,
        log_path: PathBuf,
    ) -> SpawnSpec {
        let entry_file = checkout
            .manifest
            .entry_file
            .clone()
            .unwrap_or_else(|| self.default_entry_file.clone());
        let workdir = checkout.working_dir.display().to_string();

        let expand = |arg: &str| {
            arg.replace("{port}", &port.to_string())
                .replace("{entry_file}", &entry_file)
                .replace("{workdir}", &workdir)
        };

        let mut args: Vec<String> = self.args.iter().map(|a| expand(a)).collect();
        if !checkout.manifest.cli_args.is_empty() {
            args.push("--".to_string());
            args.extend(checkout.manifest.cli_args.iter().cloned());
        }

        let mut env = self.env.clone();
        env.extend(checkout.manifest.env.clone());
        env.insert(self.port_env.clone(), port.to_string());

        SpawnSpec {
            label: key.to_string(),
            program: self.program.clone(),
            args,
            working_dir: checkout.working_dir.clone(),
            env,
            port,
            activator: self
                .venv_activator
                .as_deref()
                .map(|a| resolve_activator(&checkout.working_dir, a)),
            log_path,
        }
    }
}

fn resolve_activator(working_dir: &Path, activator: &str) -> PathBuf {
    let expanded = shellexpand::tilde(activator).into_owned();
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        working_dir.join(path)
    }
}
