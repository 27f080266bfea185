//! Command objects.
//!
//! A [`Command`] is the runtime counterpart of an `action entity` pair: a
//! parameter [`Spec`] plus an executor closure and optional lifecycle hooks.
//! Commands are built from the declarative tables in [`definitions`] and
//! looked up through the [`registry`].

/// Declarative command tables and the generic executors built from them.
pub mod definitions;
/// Global command catalog and immutable lookup snapshots.
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::cloud::ProviderError;
use crate::template::env::RunEnv;
use crate::template::params::{Spec, Validation};
use crate::template::value::Value;

pub use registry::{CommandCatalog, CommandRegistry, lookup};

/// Resolved parameters handed to an executor.
pub type Params = BTreeMap<String, Value>;

/// Raw provider output of a command.
pub type Output = serde_json::Value;

/// Executes the side effect of a command.
pub type ExecFn = Arc<dyn Fn(&RunEnv, &Params) -> Result<Output, CommandError> + Send + Sync>;
/// Runs before the executor.
pub type BeforeRunFn = Arc<dyn Fn(&RunEnv, &Params) -> Result<(), CommandError> + Send + Sync>;
/// Runs after a successful executor call.
pub type AfterRunFn = Arc<dyn Fn(&RunEnv, &Output) -> Result<(), CommandError> + Send + Sync>;
/// Extracts the string result bound to a declaration.
pub type ExtractFn = Arc<dyn Fn(&Output) -> Option<String> + Send + Sync>;

/// Errors raised while running a command.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The provider rejected the call.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Parameters could not be bound.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A `check` command did not observe the expected state in time.
    #[error("timeout of {secs}s expired {description}")]
    Timeout {
        /// What was being waited for.
        description: String,
        /// Configured timeout in seconds.
        secs: u64,
    },

    /// The output did not contain the declared result.
    #[error("cannot extract result: {0}")]
    Extraction(String),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// Runtime command: specification, executor and lifecycle hooks.
#[derive(Clone)]
pub struct Command {
    /// Action token.
    pub action: String,
    /// Entity token.
    pub entity: String,
    /// Provider api the command talks to.
    pub api: String,
    spec: Spec,
    exec: ExecFn,
    dry_run_supported: bool,
    before_run: Option<BeforeRunFn>,
    after_run: Option<AfterRunFn>,
    extract: Option<ExtractFn>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("action", &self.action)
            .field("entity", &self.entity)
            .field("api", &self.api)
            .field("spec", &self.spec.help())
            .field("dry_run_supported", &self.dry_run_supported)
            .field("extracts_result", &self.extract.is_some())
            .finish()
    }
}

impl Command {
    /// New command with a specification and an executor.
    pub fn new(
        action: impl Into<String>,
        entity: impl Into<String>,
        api: impl Into<String>,
        spec: Spec,
        exec: impl Fn(&RunEnv, &Params) -> Result<Output, CommandError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            action: action.into(),
            entity: entity.into(),
            api: api.into(),
            spec,
            exec: Arc::new(exec),
            dry_run_supported: true,
            before_run: None,
            after_run: None,
            extract: None,
        }
    }

    /// Mark the provider as unable to dry-run this command.
    pub fn without_dry_run(mut self) -> Self {
        self.dry_run_supported = false;
        self
    }

    /// Attach a before-run hook.
    pub fn with_before_run(
        mut self,
        f: impl Fn(&RunEnv, &Params) -> Result<(), CommandError> + Send + Sync + 'static,
    ) -> Self {
        self.before_run = Some(Arc::new(f));
        self
    }

    /// Attach an after-run hook.
    pub fn with_after_run(
        mut self,
        f: impl Fn(&RunEnv, &Output) -> Result<(), CommandError> + Send + Sync + 'static,
    ) -> Self {
        self.after_run = Some(Arc::new(f));
        self
    }

    /// Attach a result extractor.
    pub fn with_extract(mut self, f: impl Fn(&Output) -> Option<String> + Send + Sync + 'static) -> Self {
        self.extract = Some(Arc::new(f));
        self
    }

    /// `action entity`
    pub fn name(&self) -> String {
        format!("{} {}", self.action, self.entity)
    }

    /// Parameter specification.
    pub fn params_spec(&self) -> &Spec {
        &self.spec
    }

    /// Whether a dry-run reaches the provider.
    pub fn supports_dry_run(&self) -> bool {
        self.dry_run_supported
    }

    /// Whether declarations may bind this command's result.
    pub fn extracts_result(&self) -> bool {
        self.extract.is_some()
    }

    /// Validate resolved parameters against the specification.
    pub fn validate_params(&self, params: &Params) -> Validation {
        let keys: BTreeSet<String> = params.keys().cloned().collect();
        self.spec.validate(&keys, params)
    }

    /// Before-run hook, if any.
    pub fn before_run(&self, env: &RunEnv, params: &Params) -> Result<(), CommandError> {
        match &self.before_run {
            Some(f) => f(env, params),
            None => Ok(()),
        }
    }

    /// After-run hook, if any.
    pub fn after_run(&self, env: &RunEnv, output: &Output) -> Result<(), CommandError> {
        match &self.after_run {
            Some(f) => f(env, output),
            None => Ok(()),
        }
    }

    /// Apply reducers then call the executor.
    pub fn run(&self, env: &RunEnv, params: &Params) -> Result<Output, CommandError> {
        let reduced = self
            .spec
            .reduce(params)
            .map_err(CommandError::InvalidParams)?;
        (self.exec)(env, &reduced)
    }

    /// Result string of an output.
    pub fn extract_result(&self, output: &Output) -> Option<String> {
        self.extract.as_ref().and_then(|f| f(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use crate::template::params::{key, opt};
    use serde_json::json;

    #[test]
    fn run_applies_reducers_and_hooks() {
        let spec = Spec::new(key("ids")).reducer(crate::template::params::Reducer::new(
            &["id"],
            &["ids"],
            |values| {
                Ok(BTreeMap::from([(
                    "ids".to_string(),
                    Value::List(values["id"].to_list()),
                )]))
            },
        ));
        let cmd = Command::new("delete", "instance", "ec2", spec, |_, params| {
            Ok(json!({ "received": params["ids"].to_json() }))
        })
        .with_extract(|out| out["received"][0].as_str().map(str::to_string));
        let env = RunEnv::new(Arc::new(MemoryCloud::new("us-east-1")));
        let params = Params::from([("id".to_string(), Value::from("i-1"))]);
        let out = cmd.run(&env, &params).unwrap();
        assert_eq!(cmd.extract_result(&out).as_deref(), Some("i-1"));
        assert!(cmd.extracts_result());
        assert!(cmd.before_run(&env, &params).is_ok());
    }

    #[test]
    fn validation_uses_spec() {
        let cmd = Command::new("create", "vpc", "ec2", Spec::new(opt(&["name"])), |_, _| {
            Ok(json!({}))
        });
        let params = Params::from([("bogus".to_string(), Value::from("x"))]);
        assert_eq!(cmd.validate_params(&params).unexpected, vec!["bogus"]);
        assert_eq!(
            CommandError::Timeout {
                description: "waiting for instance i-1 to be running".into(),
                secs: 0
            }
            .to_string(),
            "timeout of 0s expired waiting for instance i-1 to be running"
        );
    }
}
