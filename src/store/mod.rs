//! Filesystem layout and atomic writes.
//!
//! Everything lives under one data directory (`CLOUDPLAN_HOME`, or
//! `~/.cloudplan`):
//!
//! ```text
//! config.json          flat key/value configuration
//! cloud.json           simulated control plane state
//! graph.json           last synced resource graph
//! history/<id>.json    one execution record per run
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::cloud::memory::CloudState;
use crate::config::Config;
use crate::graph::Graph;
use crate::template::TemplateExecution;

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "CLOUDPLAN_HOME";

/// Data directory manager.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `$CLOUDPLAN_HOME`, falling back to `$HOME/.cloudplan`.
    pub fn from_env() -> Self {
        if let Ok(home) = std::env::var(HOME_ENV) {
            return Self::new(home);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(Path::new(&home).join(".cloudplan"))
    }

    /// Data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `config.json`
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// `cloud.json`
    pub fn cloud_state_path(&self) -> PathBuf {
        self.root.join("cloud.json")
    }

    /// `graph.json`
    pub fn graph_path(&self) -> PathBuf {
        self.root.join("graph.json")
    }

    /// `history/`
    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    /// Create the directory layout.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.history_dir())
            .with_context(|| format!("Failed to create {:?}", self.history_dir()))
    }

    /// Configuration, default when absent.
    pub fn load_config(&self) -> Result<Config> {
        Config::load(&self.config_path())
    }

    /// Persist the configuration.
    pub fn save_config(&self, config: &Config) -> Result<()> {
        config.save(&self.config_path())
    }

    /// Persist an execution record under its id.
    pub fn save_execution(&self, exec: &TemplateExecution) -> Result<PathBuf> {
        self.init()?;
        let path = self.history_dir().join(format!("{}.json", exec.id()));
        let json = exec.to_json().context("Failed to serialize execution")?;
        write_atomic(&path, json.as_bytes())?;
        debug!(id = exec.id(), path = ?path, "execution saved");
        Ok(path)
    }

    /// Load the execution record `id`.
    pub fn load_execution(&self, id: &str) -> Result<TemplateExecution> {
        let path = self.history_dir().join(format!("{}.json", id));
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read execution {}", id))?;
        TemplateExecution::from_json(&text).with_context(|| format!("Failed to load execution {}", id))
    }

    /// Every execution record, oldest first.
    pub fn list_executions(&self) -> Result<Vec<TemplateExecution>> {
        let dir = self.history_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.iter().map(|id| self.load_execution(id)).collect()
    }

    /// Simulated cloud state, empty when absent.
    pub fn load_cloud_state(&self) -> Result<CloudState> {
        read_json_or_default(&self.cloud_state_path())
    }

    /// Persist the simulated cloud state.
    pub fn save_cloud_state(&self, state: &CloudState) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let json = serde_json::to_vec_pretty(state).context("Failed to serialize cloud state")?;
        write_atomic(&self.cloud_state_path(), &json)
    }

    /// Last synced graph, empty when absent.
    pub fn load_graph(&self) -> Result<Graph> {
        let path = self.graph_path();
        if !path.exists() {
            return Ok(Graph::new());
        }
        let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Graph::from_json(&text).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Persist the synced graph.
    pub fn save_graph(&self, graph: &Graph) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let json = graph.to_json().context("Failed to serialize graph")?;
        write_atomic(&self.graph_path(), json.as_bytes())
    }
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {:?}", path))
}

/// Replace `path` with `data` so readers never see a partial file.
///
/// Data lands in `<name>.tmp` next to the target first; the parent directory
/// is created when missing and synced after the rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).with_context(|| format!("cannot create store directory {:?}", dir))?;
    }
    let mut staged = path.as_os_str().to_owned();
    staged.push(".tmp");
    let staged = PathBuf::from(staged);

    let mut file =
        File::create(&staged).with_context(|| format!("cannot stage {:?}", staged))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("cannot flush {:?}", staged))?;
    drop(file);

    fs::rename(&staged, path).with_context(|| format!("cannot move {:?} into place", staged))?;
    trace!(path = ?path, bytes = data.len(), "stored");

    if let Some(dir) = parent {
        OpenOptions::new()
            .read(true)
            .open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("cannot sync store directory {:?}", dir))?;
    }
    Ok(())
}
