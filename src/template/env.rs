use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::value::Value;
use crate::cloud::ControlPlane;
use crate::command::{Command, registry};

pub use super::params::SuggestionMode;

/// Context keys under which a [`RunEnv`] exposes the variable map.
pub const CONTEXT_KEYS: &[&str] = &["AWLESS", "Variables", "References"];

/// Typed slots held by a [`CompileEnv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvSlot {
    /// Caller-supplied hole values.
    Fillers,
    /// Identifiers evaluated at compile time.
    ResolvedVars,
    /// Filler keys actually consumed.
    ProcessedFillers,
    /// Hole keys still unanswered after prompting.
    MissingHoles,
}

/// Finds the command registered for `[action, entity]`.
pub type LookupFn = Arc<dyn Fn(&[&str]) -> Option<Arc<Command>> + Send + Sync>;
/// Resolves `(entity, param key, alias)` to a provider id.
pub type AliasFn = Arc<dyn Fn(&str, &str, &str) -> Option<String> + Send + Sync>;
/// Asks for `(hole key, param paths, optional)`; `None` leaves the hole open.
pub type MissingHoleFn = Arc<dyn Fn(&str, &[String], bool) -> Option<Value> + Send + Sync>;

/// State threaded through compiler passes.
///
/// Cloning is cheap enough for pass-by-value: callbacks are shared and slots
/// are small maps.
#[derive(Clone)]
pub struct CompileEnv {
    slots: BTreeMap<EnvSlot, BTreeMap<String, Value>>,
    lookup: LookupFn,
    alias: Option<AliasFn>,
    missing_holes: Option<MissingHoleFn>,
    suggestion: SuggestionMode,
}

impl fmt::Debug for CompileEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileEnv")
            .field("slots", &self.slots)
            .field("alias", &self.alias.is_some())
            .field("missing_holes", &self.missing_holes.is_some())
            .field("suggestion", &self.suggestion)
            .finish()
    }
}

impl Default for CompileEnv {
    fn default() -> Self {
        CompileEnv::builder().build()
    }
}

impl CompileEnv {
    /// Start building an environment.
    pub fn builder() -> CompileEnvBuilder {
        CompileEnvBuilder {
            env: CompileEnv {
                slots: BTreeMap::new(),
                lookup: Arc::new(|tokens: &[&str]| match tokens {
                    [action, entity] => registry::lookup(action, entity),
                    _ => None,
                }),
                alias: None,
                missing_holes: None,
                suggestion: SuggestionMode::default(),
            },
        }
    }

    /// Content of a slot.
    pub fn get(&self, slot: EnvSlot) -> BTreeMap<String, Value> {
        self.slots.get(&slot).cloned().unwrap_or_default()
    }

    /// Insert one entry into a slot.
    pub fn push(&mut self, slot: EnvSlot, key: impl Into<String>, value: Value) {
        self.slots.entry(slot).or_default().insert(key.into(), value);
    }

    /// Merge entries into a slot.
    pub fn extend(&mut self, slot: EnvSlot, entries: BTreeMap<String, Value>) {
        self.slots.entry(slot).or_default().extend(entries);
    }

    /// Replace a slot.
    pub fn set(&mut self, slot: EnvSlot, entries: BTreeMap<String, Value>) {
        self.slots.insert(slot, entries);
    }

    /// [`EnvSlot::Fillers`]
    pub fn fillers(&self) -> BTreeMap<String, Value> {
        self.get(EnvSlot::Fillers)
    }

    /// [`EnvSlot::ProcessedFillers`]
    pub fn processed_fillers(&self) -> BTreeMap<String, Value> {
        self.get(EnvSlot::ProcessedFillers)
    }

    /// [`EnvSlot::ResolvedVars`]
    pub fn resolved_vars(&self) -> BTreeMap<String, Value> {
        self.get(EnvSlot::ResolvedVars)
    }

    /// Look up a command.
    pub fn lookup_command(&self, tokens: &[&str]) -> Option<Arc<Command>> {
        (self.lookup)(tokens)
    }

    /// Whether an alias resolver is configured.
    pub fn has_alias_resolver(&self) -> bool {
        self.alias.is_some()
    }

    /// Resolve an alias, if a resolver is configured.
    pub fn resolve_alias(&self, entity: &str, key: &str, alias: &str) -> Option<String> {
        self.alias.as_ref().and_then(|f| f(entity, key, alias))
    }

    /// Prompt for a hole, if a prompt is configured.
    pub fn ask_missing_hole(&self, key: &str, paths: &[String], optional: bool) -> Option<Value> {
        self.missing_holes
            .as_ref()
            .and_then(|f| f(key, paths, optional))
    }

    /// Configured suggestion mode.
    pub fn suggestion_mode(&self) -> SuggestionMode {
        self.suggestion
    }
}

/// Builder for [`CompileEnv`].
pub struct CompileEnvBuilder {
    env: CompileEnv,
}

impl CompileEnvBuilder {
    /// Hole values; merged when called several times.
    pub fn fillers(mut self, fillers: BTreeMap<String, Value>) -> Self {
        self.env.extend(EnvSlot::Fillers, fillers);
        self
    }

    /// Command lookup, replacing the global registry lookup.
    pub fn lookup(
        mut self,
        f: impl Fn(&[&str]) -> Option<Arc<Command>> + Send + Sync + 'static,
    ) -> Self {
        self.env.lookup = Arc::new(f);
        self
    }

    /// Alias resolver.
    pub fn alias_resolver(
        mut self,
        f: impl Fn(&str, &str, &str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env.alias = Some(Arc::new(f));
        self
    }

    /// Missing-hole prompt.
    pub fn missing_holes(
        mut self,
        f: impl Fn(&str, &[String], bool) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.env.missing_holes = Some(Arc::new(f));
        self
    }

    /// Suggestion mode.
    pub fn suggestion(mut self, mode: SuggestionMode) -> Self {
        self.env.suggestion = mode;
        self
    }

    /// Finish.
    pub fn build(self) -> CompileEnv {
        self.env
    }
}

/// Variable map shared by every context key of a [`RunEnv`].
pub type SharedVars = Arc<RwLock<BTreeMap<String, Value>>>;

/// State visible to commands while a template runs.
#[derive(Clone)]
pub struct RunEnv {
    dry_run: bool,
    cloud: Arc<dyn ControlPlane>,
    variables: SharedVars,
    context: BTreeMap<String, SharedVars>,
}

impl fmt::Debug for RunEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEnv")
            .field("dry_run", &self.dry_run)
            .field("variables", &*self.variables.read())
            .finish()
    }
}

impl RunEnv {
    /// Fresh environment against `cloud`.
    pub fn new(cloud: Arc<dyn ControlPlane>) -> Self {
        let variables: SharedVars = Arc::new(RwLock::new(BTreeMap::new()));
        let context = CONTEXT_KEYS
            .iter()
            .map(|k| (k.to_string(), variables.clone()))
            .collect();
        Self {
            dry_run: false,
            cloud,
            variables,
            context,
        }
    }

    /// Environment seeded with the variables resolved at compile time.
    pub fn from_compile_env(cenv: &CompileEnv, cloud: Arc<dyn ControlPlane>) -> Self {
        let env = Self::new(cloud);
        env.variables.write().extend(cenv.resolved_vars());
        env
    }

    /// Whether commands should only simulate.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Toggle dry-run.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// The control plane commands talk to.
    pub fn cloud(&self) -> &Arc<dyn ControlPlane> {
        &self.cloud
    }

    /// Shared variable map under a context key.
    pub fn context(&self, key: &str) -> Option<SharedVars> {
        self.context.get(key).cloned()
    }

    /// Bind an identifier.
    pub fn bind(&self, ident: impl Into<String>, value: Value) {
        self.variables.write().insert(ident.into(), value);
    }

    /// Value bound to an identifier.
    pub fn lookup(&self, ident: &str) -> Option<Value> {
        self.variables.read().get(ident).cloned()
    }

    /// Copy of every bound variable.
    pub fn variables(&self) -> BTreeMap<String, Value> {
        self.variables.read().clone()
    }

    /// Environment with the same cloud and a fresh variable map.
    pub fn fork(&self) -> Self {
        let mut env = Self::new(self.cloud.clone());
        env.dry_run = self.dry_run;
        env.variables.write().extend(self.variables());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::MemoryCloud;

    #[test]
    fn context_keys_share_one_map() {
        let env = RunEnv::new(Arc::new(MemoryCloud::new("us-east-1")));
        env.bind("sub", Value::from("sub-1"));
        for key in CONTEXT_KEYS {
            let vars = env.context(key).unwrap();
            assert_eq!(vars.read().get("sub"), Some(&Value::from("sub-1")));
        }
        let forked = env.fork();
        forked.bind("other", Value::Int(1));
        assert!(env.lookup("other").is_none());
    }

    #[test]
    fn slots_accumulate() {
        let mut env = CompileEnv::builder()
            .fillers(BTreeMap::from([("a".to_string(), Value::Int(1))]))
            .fillers(BTreeMap::from([("b".to_string(), Value::Int(2))]))
            .build();
        assert_eq!(env.fillers().len(), 2);
        env.push(EnvSlot::ProcessedFillers, "a", Value::Int(1));
        assert_eq!(env.processed_fillers().len(), 1);
        assert!(env.get(EnvSlot::MissingHoles).is_empty());
        assert!(env.resolve_alias("vpc", "id", "main").is_none());
    }
}
