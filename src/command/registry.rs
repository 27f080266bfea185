//! Command registry.
//!
//! A global catalog collects commands before use; compilers read an immutable
//! snapshot so lookups never contend with late registrations.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::Command;
use super::definitions;

/// Global catalog of commands keyed by `action entity`.
pub struct CommandCatalog {
    commands: RwLock<BTreeMap<String, Arc<Command>>>,
}

static CATALOG: Lazy<CommandCatalog> = Lazy::new(|| {
    let catalog = CommandCatalog::new();
    definitions::register_all(&catalog);
    catalog
});

impl Default for CommandCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(BTreeMap::new()),
        }
    }

    /// The process-wide catalog, populated with the built-in definitions.
    pub fn global() -> &'static Self {
        &CATALOG
    }

    /// Register a command, replacing any previous one for the same pair.
    pub fn register(&self, command: Command) {
        let key = command.name();
        self.commands.write().insert(key, Arc::new(command));
    }

    /// Produce an immutable snapshot.
    pub fn snapshot(&self) -> CommandRegistry {
        CommandRegistry {
            commands: Arc::new(self.commands.read().clone()),
        }
    }
}

/// Immutable view of a [`CommandCatalog`].
#[derive(Clone)]
pub struct CommandRegistry {
    commands: Arc<BTreeMap<String, Arc<Command>>>,
}

impl CommandRegistry {
    /// Command for `(action, entity)`.
    pub fn get(&self, action: &str, entity: &str) -> Option<Arc<Command>> {
        self.commands.get(&format!("{} {}", action, entity)).cloned()
    }

    /// Whether `(action, entity)` is registered.
    pub fn contains(&self, action: &str, entity: &str) -> bool {
        self.commands.contains_key(&format!("{} {}", action, entity))
    }

    /// Every command, sorted by `action entity`.
    pub fn commands(&self) -> impl Iterator<Item = &Arc<Command>> {
        self.commands.values()
    }

    /// Commands talking to `api`.
    pub fn for_api<'a>(&'a self, api: &'a str) -> impl Iterator<Item = &'a Arc<Command>> + 'a {
        self.commands.values().filter(move |c| c.api == api)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Look up a command in the global catalog.
pub fn lookup(action: &str, entity: &str) -> Option<Arc<Command>> {
    CommandCatalog::global()
        .commands
        .read()
        .get(&format!("{} {}", action, entity))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::params::{Spec, opt};

    #[test]
    fn snapshots_are_immutable() {
        let catalog = CommandCatalog::new();
        catalog.register(Command::new("create", "vpc", "ec2", Spec::new(opt(&[])), |_, _| {
            Ok(serde_json::Value::Null)
        }));
        let snapshot = catalog.snapshot();
        catalog.register(Command::new("delete", "vpc", "ec2", Spec::new(opt(&[])), |_, _| {
            Ok(serde_json::Value::Null)
        }));
        assert!(snapshot.contains("create", "vpc"));
        assert!(!snapshot.contains("delete", "vpc"));
        assert_eq!(catalog.snapshot().len(), 2);
    }

    #[test]
    fn global_catalog_has_builtins() {
        assert!(lookup("create", "instance").is_some());
        assert!(lookup("check", "securitygroup").is_some());
        assert!(lookup("fly", "instance").is_none());
    }
}
