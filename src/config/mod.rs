//! Flat key/value configuration.
//!
//! Keys are dotted paths such as `aws.region`, `aws.infra.sync` or
//! `aws.infra.instance.sync`. Values are JSON scalars; booleans may also be
//! written as strings (`"false"`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::store::write_atomic;

/// Region key.
pub const REGION_KEY: &str = "aws.region";
/// Profile key.
pub const PROFILE_KEY: &str = "aws.profile";
/// Fetch page size key.
pub const PAGE_SIZE_KEY: &str = "aws.fetch.page_size";

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_PROFILE: &str = "default";

/// Flat configuration map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    values: BTreeMap<String, Json>,
}

impl Config {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration from `(key, value)` pairs.
    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Json)>) -> Self {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Load `path`; a missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = ?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// Save atomically to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;
        write_atomic(path, &json)
    }

    /// Raw value.
    pub fn get(&self, key: &str) -> Option<&Json> {
        self.values.get(key)
    }

    /// String value; numbers and booleans are rendered.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Json::String(s) => Some(s.clone()),
            Json::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Boolean value, accepting `true`/`false` strings.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(Json::Bool(b)) => *b,
            Some(Json::String(s)) => parse_bool(s).unwrap_or(default),
            _ => default,
        }
    }

    /// Integer value, accepting numeric strings.
    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(Json::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Json::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Set `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Json>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Json> {
        self.values.remove(key)
    }

    /// Every entry, sorted by key.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Json)> {
        self.values.iter()
    }

    /// Configured region.
    pub fn region(&self) -> String {
        self.get_str(REGION_KEY)
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    /// Configured profile.
    pub fn profile(&self) -> String {
        self.get_str(PROFILE_KEY)
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
    }

    /// Page size requested from paginated list methods, if configured.
    pub fn page_size(&self) -> Option<u64> {
        let size = self.get_int_or(PAGE_SIZE_KEY, 0);
        (size > 0).then_some(size as u64)
    }

    /// Whether `aws.<service>.sync` is false and not forced.
    pub fn is_service_sync_disabled(&self, service: &str) -> bool {
        if force_env(service) {
            return false;
        }
        !self.get_bool_or(&format!("aws.{}.sync", service), true)
    }

    /// Whether `aws.<service>.<type>.sync` is false and not forced.
    pub fn is_type_sync_disabled(&self, service: &str, resource_type: &str) -> bool {
        if force_env(service) {
            return false;
        }
        !self.get_bool_or(&format!("aws.{}.{}.sync", service, resource_type), true)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Whether `FORCE_<SERVICE>` is set to a true value.
pub fn force_env(service: &str) -> bool {
    std::env::var(format!("FORCE_{}", service.to_ascii_uppercase()))
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn typed_accessors() {
        let mut config = Config::from_pairs([
            ("aws.infra.sync", json!("false")),
            ("aws.fetch.page_size", json!("25")),
            ("aws.region", json!("eu-west-3")),
        ]);
        config.set("aws.storage.sync", true);
        assert!(!config.get_bool_or("aws.infra.sync", true));
        assert!(config.get_bool_or("aws.storage.sync", false));
        assert!(config.get_bool_or("aws.missing", true));
        assert_eq!(config.page_size(), Some(25));
        assert_eq!(config.region(), "eu-west-3");
        assert_eq!(config.profile(), "default");
        assert_eq!(config.remove("aws.region"), Some(json!("eu-west-3")));
        assert_eq!(config.region(), "us-east-1");
    }

    #[test]
    fn sync_knobs() {
        let config = Config::from_pairs([
            ("aws.messaging.sync", json!(false)),
            ("aws.dns.record.sync", json!(false)),
        ]);
        assert!(config.is_service_sync_disabled("messaging"));
        assert!(!config.is_service_sync_disabled("dns"));
        assert!(config.is_type_sync_disabled("dns", "record"));
        assert!(!config.is_type_sync_disabled("dns", "zone"));
    }

    #[test]
    fn load_missing_then_save() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sub").join("config.json");
        let mut config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
        config.set("aws.region", "ap-south-1");
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap().region(), "ap-south-1");
    }
}
