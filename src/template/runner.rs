//! Statement execution and the run orchestrator.
//!
//! [`run`] walks a compiled template in textual order against a [`RunEnv`].
//! A failing command records its error on the node and the walk goes on;
//! statements depending on its result then fail on the unbound reference.
//! [`Runner`] chains compile, dry-run, confirmation and the real run.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ast::{CommandNode, DeclarationNode, Expression, Statement, Template};
use super::compile::{CompileMode, compile};
use super::env::{CompileEnv, RunEnv};
use super::record::TemplateExecution;
use super::validate::TemplateValidator;
use super::value::ParamValue;
use crate::cloud::ControlPlane;
use crate::command::{Command, CommandError, Params, registry};

/// A command that failed while running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{action} {entity}: {cause}")]
pub struct RunError {
    /// Action token.
    pub action: String,
    /// Entity token.
    pub entity: String,
    /// What went wrong.
    pub cause: String,
    /// Whether the failure happened during a dry-run.
    pub dry_run: bool,
}

/// Every command failure of one run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct RunErrors(pub Vec<RunError>);

impl fmt::Display for RunErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl RunErrors {
    /// Number of failures.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Run `template` against `env`, returning the executed copy.
///
/// Each executed command node carries its materialised params plus either
/// its result or its error.
pub fn run(template: &Template, env: &mut RunEnv) -> (Template, Result<(), RunErrors>) {
    let mut executed = template.clone();
    let mut errors = Vec::new();
    let dry_run = env.is_dry_run();
    for statement in executed.statements.iter_mut() {
        if let Statement::Declaration(DeclarationNode {
            ident,
            expr: Expression::Value(value),
        }) = statement
        {
            match value.materialize(&env.variables()) {
                Ok(v) => env.bind(ident.clone(), v),
                Err(missing) => debug!(ident = %ident, missing = %missing, "value left unbound"),
            }
            continue;
        }
        let ident = statement.declared_ident().map(str::to_string);
        let Some(node) = statement.command_mut() else {
            continue;
        };
        match run_command(node, env) {
            Ok(result) => {
                if let (Some(ident), Some(result)) = (&ident, &result) {
                    env.bind(ident.clone(), result.as_str().into());
                }
                node.result = result;
            }
            Err(cause) => {
                warn!(command = %node.key(), dry_run, "{}", cause);
                node.error = Some(cause.clone());
                errors.push(RunError {
                    action: node.action.clone(),
                    entity: node.entity.clone(),
                    cause,
                    dry_run,
                });
            }
        }
    }
    let outcome = if errors.is_empty() {
        Ok(())
    } else {
        Err(RunErrors(errors))
    };
    (executed, outcome)
}

/// Run `template` in dry-run mode; `env` keeps its own mode afterwards.
pub fn dry_run(template: &Template, env: &mut RunEnv) -> (Template, Result<(), RunErrors>) {
    let previous = env.is_dry_run();
    env.set_dry_run(true);
    let out = run(template, env);
    env.set_dry_run(previous);
    out
}

impl Template {
    /// See [`run`].
    pub fn run(&self, env: &mut RunEnv) -> (Template, Result<(), RunErrors>) {
        run(self, env)
    }

    /// See [`dry_run`].
    pub fn dry_run(&self, env: &mut RunEnv) -> (Template, Result<(), RunErrors>) {
        dry_run(self, env)
    }
}

fn run_command(node: &mut CommandNode, env: &RunEnv) -> Result<Option<String>, String> {
    let command = node
        .command
        .clone()
        .or_else(|| registry::lookup(&node.action, &node.entity))
        .ok_or_else(|| format!("unknown command '{}'", node.key()))?;
    let params = materialize_params(node, env)?;
    for (k, v) in &params {
        node.params.insert(k.clone(), ParamValue::from_value(v.clone()));
    }
    command.before_run(env, &params).map_err(|e| e.to_string())?;
    if env.is_dry_run() {
        return dry_run_command(&command, node, env, &params);
    }
    let output = command.run(env, &params).map_err(|e| e.to_string())?;
    let result = command.extract_result(&output);
    match &result {
        Some(r) => info!(command = %node.key(), result = %r, "command ok"),
        None => info!(command = %node.key(), "command ok"),
    }
    command.after_run(env, &output).map_err(|e| e.to_string())?;
    Ok(result)
}

fn materialize_params(node: &CommandNode, env: &RunEnv) -> Result<Params, String> {
    let vars = env.variables();
    let mut params = Params::new();
    for (key, value) in &node.params {
        match value.materialize(&vars) {
            Ok(v) => {
                params.insert(key.clone(), v);
            }
            Err(missing) if missing.starts_with('{') || missing.starts_with('@') => {
                return Err(format!("param '{}': unresolved value {}", key, missing));
            }
            Err(missing) => {
                return Err(format!(
                    "reference '${}' is unbound (its command failed or produced no result)",
                    missing
                ));
            }
        }
    }
    Ok(params)
}

fn dry_run_command(
    command: &Command,
    node: &CommandNode,
    env: &RunEnv,
    params: &Params,
) -> Result<Option<String>, String> {
    let validation = command.validate_params(params);
    if !validation.missing.is_empty() {
        return Err(format!(
            "missing required param(s): {}",
            validation.missing.join(", ")
        ));
    }
    if !validation.conflicts.is_empty() {
        return Err(validation.conflicts.join("; "));
    }
    if !validation.type_errors.is_empty() {
        return Err(validation.type_errors.join("; "));
    }
    if command.supports_dry_run() {
        match command.run(env, params) {
            Ok(_) => {}
            Err(CommandError::Provider(e)) if e.is_dry_run_success() || e.is_not_found() => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    if !command.extracts_result() {
        debug!(command = %node.key(), "dry run ok");
        return Ok(None);
    }
    let placeholder = placeholder_id(&node.entity);
    debug!(command = %node.key(), placeholder = %placeholder, "dry run ok");
    Ok(Some(placeholder))
}

/// `<entity>_<3 random digits>`
pub fn placeholder_id(entity: &str) -> String {
    format!("{}_{:03}", entity, rand::thread_rng().gen_range(0..1000))
}

/// Called with the record about to run; `false` cancels the run.
pub type BeforeRunHook = Box<dyn FnMut(&TemplateExecution) -> anyhow::Result<bool> + Send>;
/// Called with the final record.
pub type AfterRunHook = Box<dyn FnMut(&TemplateExecution) -> anyhow::Result<()> + Send>;

/// Compile, dry-run, confirm, run.
pub struct Runner {
    template: Template,
    cloud: Arc<dyn ControlPlane>,
    compile_env: CompileEnv,
    mode: CompileMode,
    author: String,
    message: String,
    path: String,
    validators: Vec<Box<dyn TemplateValidator>>,
    before_run: Option<BeforeRunHook>,
    after_run: Option<AfterRunHook>,
}

impl Runner {
    /// Runner for `template` against `cloud`.
    pub fn new(template: Template, cloud: Arc<dyn ControlPlane>) -> Self {
        Self {
            template,
            cloud,
            compile_env: CompileEnv::default(),
            mode: CompileMode::Runner,
            author: String::new(),
            message: String::new(),
            path: String::new(),
            validators: Vec::new(),
            before_run: None,
            after_run: None,
        }
    }

    /// Compile environment (fillers, callbacks).
    pub fn compile_env(mut self, env: CompileEnv) -> Self {
        self.compile_env = env;
        self
    }

    /// Compile pipeline.
    pub fn mode(mut self, mode: CompileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Author stored on the record.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Message stored on the record.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Source file stored on the record.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Add an advisory validator.
    pub fn validator(mut self, validator: Box<dyn TemplateValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Confirmation hook.
    pub fn before_run(
        mut self,
        hook: impl FnMut(&TemplateExecution) -> anyhow::Result<bool> + Send + 'static,
    ) -> Self {
        self.before_run = Some(Box::new(hook));
        self
    }

    /// Hook receiving the final record.
    pub fn after_run(
        mut self,
        hook: impl FnMut(&TemplateExecution) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.after_run = Some(Box::new(hook));
        self
    }

    /// Go through the whole pipeline.
    ///
    /// Returns `None` when the confirmation hook declined. Command failures
    /// of the real run are on the record, not in the error.
    pub fn run(mut self) -> anyhow::Result<Option<TemplateExecution>> {
        let (compiled, cenv) = compile(&self.template, self.compile_env.clone(), self.mode)?;
        for validator in &self.validators {
            for warning in validator.validate(&compiled) {
                warn!("{}", warning);
            }
        }

        let mut dry_env = RunEnv::from_compile_env(&cenv, self.cloud.clone());
        let (_, checked) = dry_run(&compiled, &mut dry_env);
        if let Err(errors) = checked {
            return Err(anyhow::Error::new(errors).context("dry run failed"));
        }

        let mut record = TemplateExecution::new(compiled.clone());
        record.author = self.author.clone();
        record.source = self.template.to_string();
        record.locale = self.cloud.region();
        record.profile = self.cloud.profile();
        record.path = self.path.clone();
        record.fillers = cenv.processed_fillers();
        record.set_message(&self.message);

        if let Some(hook) = self.before_run.as_mut() {
            if !hook(&record)? {
                info!(template = %compiled.id, "run cancelled");
                return Ok(None);
            }
        }

        let mut env = RunEnv::from_compile_env(&cenv, self.cloud.clone());
        let (executed, outcome) = run(&compiled, &mut env);
        if let Err(errors) = &outcome {
            warn!(template = %compiled.id, failures = errors.len(), "run finished with errors");
        }
        record.template = executed;

        if let Some(hook) = self.after_run.as_mut() {
            hook(&record)?;
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use crate::template::parser::parse;
    use crate::template::value::Value;
    use std::collections::BTreeMap;

    fn cloud() -> Arc<MemoryCloud> {
        Arc::new(MemoryCloud::new("us-east-1"))
    }

    #[test]
    fn failures_do_not_stop_the_run() {
        let cloud = cloud();
        let mut env = RunEnv::new(cloud.clone());
        let tpl = parse(
            "vpc = create vpc cidr=10.0.0.0/16\nsub = create subnet cidr=10.0.0.0/24 vpc=$vpc\ngone = delete subnet id=sub-404\ncreate instance image=ami-1 count=1 type=t2.micro name=x subnet=$missing",
        )
        .unwrap();
        let (executed, outcome) = run(&tpl, &mut env);
        let errors = outcome.unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.0[0].to_string().starts_with("delete subnet: "));
        assert_eq!(
            errors.0[1].to_string(),
            "create instance: reference '$missing' is unbound (its command failed or produced no result)"
        );
        let nodes: Vec<_> = executed.command_nodes().collect();
        let vpc = nodes[0].result.clone().unwrap();
        assert!(vpc.starts_with("vpc-"));
        assert_eq!(nodes[1].params["vpc"].to_string(), vpc);
        assert!(cloud.object("subnet", nodes[1].result.as_deref().unwrap()).is_some());
        assert!(tpl.command_nodes().all(|c| c.result.is_none()));
    }

    #[test]
    fn dry_run_binds_placeholders() {
        let cloud = cloud();
        let mut env = RunEnv::new(cloud.clone());
        let tpl = parse("vpc = create vpc cidr=10.0.0.0/16\ncreate subnet cidr=10.0.0.0/24 vpc=$vpc").unwrap();
        let (executed, outcome) = dry_run(&tpl, &mut env);
        assert!(outcome.is_ok());
        assert!(!env.is_dry_run());
        let placeholder = env.lookup("vpc").unwrap();
        let placeholder = placeholder.as_str().unwrap();
        assert!(placeholder.starts_with("vpc_") && placeholder.len() == 7);
        assert!(executed.command_nodes().nth(1).unwrap().result.is_some());
        assert!(cloud.objects("vpc").is_empty());
    }

    #[test]
    fn dry_run_rejects_bad_params() {
        let mut env = RunEnv::new(cloud());
        let tpl = parse("create elasticip domain=nowhere").unwrap();
        let (_, outcome) = dry_run(&tpl, &mut env);
        let errors = outcome.unwrap_err();
        assert!(errors.0[0].dry_run);
        assert!(errors.to_string().contains("expected any of"));
    }

    #[test]
    fn runner_confirms_then_runs() {
        let cloud = cloud();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let before = seen.clone();
        let after = seen.clone();
        let tpl = parse("create vpc cidr={vpc.cidr}").unwrap();
        let env = CompileEnv::builder()
            .fillers(BTreeMap::from([("vpc.cidr".to_string(), Value::from("10.0.0.0/16"))]))
            .build();
        let record = Runner::new(tpl, cloud.clone())
            .compile_env(env)
            .author("alice")
            .before_run(move |rec| {
                before.lock().push(rec.template.to_string());
                Ok(true)
            })
            .after_run(move |rec| {
                after.lock().push(format!("{}", rec.stats().ok));
                Ok(())
            })
            .run()
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock(), vec!["create vpc cidr=10.0.0.0/16".to_string(), "1".to_string()]);
        assert_eq!(record.author, "alice");
        assert_eq!(record.locale, "us-east-1");
        assert_eq!(record.fillers["vpc.cidr"], Value::from("10.0.0.0/16"));
        assert_eq!(cloud.objects("vpc").len(), 1);
        let result = record.template.command_nodes().next().unwrap().result.clone().unwrap();
        assert!(result.starts_with("vpc-"));
    }

    #[test]
    fn runner_can_be_declined() {
        let cloud = cloud();
        let tpl = parse("create vpc cidr=10.0.0.0/16").unwrap();
        let outcome = Runner::new(tpl, cloud.clone())
            .before_run(|_| Ok(false))
            .run()
            .unwrap();
        assert!(outcome.is_none());
        assert!(cloud.objects("vpc").is_empty());
    }
}
