//! Abstract syntax tree definitions for the template language.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::ulid;
use super::value::{Hole, ParamValue, Value};
use crate::command::Command;

/// Closed set of actions accepted by the parser.
pub const ACTIONS: &[&str] = &[
    "create", "delete", "update", "check", "start", "stop", "attach", "detach", "copy", "none",
];

/// Closed set of entities accepted by the parser.
pub const ENTITIES: &[&str] = &[
    "accesskey",
    "alarm",
    "appscalingpolicy",
    "appscalingtarget",
    "autoscalinggroup",
    "bucket",
    "certificate",
    "classicloadbalancer",
    "containercluster",
    "containertask",
    "database",
    "dbsubnetgroup",
    "distribution",
    "elasticip",
    "function",
    "group",
    "image",
    "instance",
    "instanceprofile",
    "internetgateway",
    "keypair",
    "launchconfiguration",
    "listener",
    "loadbalancer",
    "loginprofile",
    "mfadevice",
    "natgateway",
    "networkinterface",
    "none",
    "policy",
    "queue",
    "record",
    "repository",
    "role",
    "routetable",
    "s3object",
    "scalinggroup",
    "scalingpolicy",
    "securitygroup",
    "snapshot",
    "stack",
    "subnet",
    "subscription",
    "tag",
    "targetgroup",
    "topic",
    "user",
    "volume",
    "vpc",
    "zone",
];

/// Whether `token` is a known action.
pub fn is_action(token: &str) -> bool {
    ACTIONS.contains(&token)
}

/// Whether `token` is a known entity.
pub fn is_entity(token: &str) -> bool {
    ENTITIES.contains(&token)
}

/// A parsed template: an id plus an ordered list of statements.
///
/// Equality compares statements only; two parses of the same text carry
/// different ids but are equal.
#[derive(Debug, Clone)]
pub struct Template {
    /// Time-ordered unique identifier.
    pub id: String,
    /// Statements in textual order.
    pub statements: Vec<Statement>,
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.statements == other.statements
    }
}

/// A single template statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Bare command: `create instance ...`
    Command(CommandNode),
    /// `ident = expression`
    Declaration(DeclarationNode),
}

/// `ident = expression`
#[derive(Debug, Clone, PartialEq)]
pub struct DeclarationNode {
    /// Left-hand identifier.
    pub ident: String,
    /// Right-hand expression.
    pub expr: Expression,
}

/// Right-hand side of a declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Command whose result is bound to the identifier.
    Command(CommandNode),
    /// Pure value expression.
    Value(ParamValue),
}

/// `action entity key=value ...` together with its execution outcome.
#[derive(Clone)]
pub struct CommandNode {
    /// Action token (from [`ACTIONS`]).
    pub action: String,
    /// Entity token (from [`ENTITIES`]).
    pub entity: String,
    /// Parameters, printed in key order.
    pub params: BTreeMap<String, ParamValue>,
    /// Extracted string result after a run.
    pub result: Option<String>,
    /// Run error after a failed run.
    pub error: Option<String>,
    /// Command object attached by the compiler.
    pub command: Option<Arc<Command>>,
}

impl PartialEq for CommandNode {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action
            && self.entity == other.entity
            && self.params == other.params
            && self.result == other.result
            && self.error == other.error
    }
}

impl fmt::Debug for CommandNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandNode")
            .field("action", &self.action)
            .field("entity", &self.entity)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("error", &self.error)
            .field("command", &self.command.is_some())
            .finish()
    }
}

impl CommandNode {
    /// New node without parameters.
    pub fn new(action: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            entity: entity.into(),
            params: BTreeMap::new(),
            result: None,
            error: None,
            command: None,
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_param(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// `action entity`
    pub fn key(&self) -> String {
        format!("{} {}", self.action, self.entity)
    }

    /// Parameter keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    /// Resolved parameters (references, holes and aliases are left out).
    pub fn resolved_params(&self) -> BTreeMap<String, Value> {
        self.params
            .iter()
            .filter_map(|(k, v)| v.to_value().map(|val| (k.clone(), val)))
            .collect()
    }

    /// Keys whose value still contains a reference.
    pub fn keys_with_references(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|(_, v)| !v.references().is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Whether the command ran and failed.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for CommandNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.entity)?;
        for (k, v) in &self.params {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Command(cmd) => write!(f, "{}", cmd),
            Expression::Value(v) => write!(f, "{}", v),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Command(cmd) => write!(f, "{}", cmd),
            Statement::Declaration(decl) => write!(f, "{} = {}", decl.ident, decl.expr),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, st) in self.statements.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", st)?;
        }
        Ok(())
    }
}

impl Statement {
    /// The command carried by this statement, if any.
    pub fn command(&self) -> Option<&CommandNode> {
        match self {
            Statement::Command(cmd) => Some(cmd),
            Statement::Declaration(DeclarationNode {
                expr: Expression::Command(cmd),
                ..
            }) => Some(cmd),
            _ => None,
        }
    }

    /// Mutable access to the command carried by this statement.
    pub fn command_mut(&mut self) -> Option<&mut CommandNode> {
        match self {
            Statement::Command(cmd) => Some(cmd),
            Statement::Declaration(DeclarationNode {
                expr: Expression::Command(cmd),
                ..
            }) => Some(cmd),
            _ => None,
        }
    }

    /// Declared identifier, if this is a declaration.
    pub fn declared_ident(&self) -> Option<&str> {
        match self {
            Statement::Declaration(decl) => Some(&decl.ident),
            _ => None,
        }
    }

    /// References used by this statement.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Statement::Command(cmd) => cmd.params.values().flat_map(|v| v.references()).collect(),
            Statement::Declaration(decl) => match &decl.expr {
                Expression::Command(cmd) => {
                    cmd.params.values().flat_map(|v| v.references()).collect()
                }
                Expression::Value(v) => v.references(),
            },
        }
    }

    /// Visit every parameter value with its owning `(action, entity, key)`.
    ///
    /// Value declarations report empty action, entity and key.
    pub fn visit_values_mut(&mut self, visit: &mut dyn FnMut(&str, &str, &str, &mut ParamValue)) {
        match self {
            Statement::Declaration(DeclarationNode {
                expr: Expression::Value(v),
                ..
            }) => visit("", "", "", v),
            other => {
                if let Some(cmd) = other.command_mut() {
                    let (action, entity) = (cmd.action.clone(), cmd.entity.clone());
                    for (k, v) in cmd.params.iter_mut() {
                        visit(&action, &entity, k, v);
                    }
                }
            }
        }
    }

    /// Read-only counterpart of [`Statement::visit_values_mut`].
    pub fn visit_values(&self, visit: &mut dyn FnMut(&str, &str, &str, &ParamValue)) {
        match self {
            Statement::Declaration(DeclarationNode {
                expr: Expression::Value(v),
                ..
            }) => visit("", "", "", v),
            other => {
                if let Some(cmd) = other.command() {
                    for (k, v) in &cmd.params {
                        visit(&cmd.action, &cmd.entity, k, v);
                    }
                }
            }
        }
    }
}

impl Template {
    /// Template with a fresh id.
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            id: ulid::new_id(),
            statements,
        }
    }

    /// Template with an explicit id.
    pub fn with_id(id: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            id: id.into(),
            statements,
        }
    }

    /// Commands in textual order (bare and declared).
    pub fn command_nodes(&self) -> impl Iterator<Item = &CommandNode> {
        self.statements.iter().filter_map(Statement::command)
    }

    /// Mutable commands in textual order.
    pub fn command_nodes_mut(&mut self) -> impl Iterator<Item = &mut CommandNode> {
        self.statements.iter_mut().filter_map(Statement::command_mut)
    }

    /// Declarations in textual order.
    pub fn declarations(&self) -> impl Iterator<Item = &DeclarationNode> {
        self.statements.iter().filter_map(|st| match st {
            Statement::Declaration(decl) => Some(decl),
            _ => None,
        })
    }

    /// Visit every parameter value in the template.
    pub fn visit_values_mut(&mut self, mut visit: impl FnMut(&str, &str, &str, &mut ParamValue)) {
        for st in self.statements.iter_mut() {
            st.visit_values_mut(&mut visit);
        }
    }

    /// Visit every parameter value in the template (read-only).
    pub fn visit_values(&self, mut visit: impl FnMut(&str, &str, &str, &ParamValue)) {
        for st in &self.statements {
            st.visit_values(&mut visit);
        }
    }

    /// Holes still present, each with the param paths (`action.entity.key`) using it.
    ///
    /// Holes inside value declarations get no path. Keys are sorted.
    pub fn holes(&self) -> BTreeMap<String, (Vec<String>, bool)> {
        let mut out: BTreeMap<String, (Vec<String>, bool)> = BTreeMap::new();
        self.visit_values(|action, entity, key, value| {
            for hole in value.holes() {
                let entry = out
                    .entry(hole.key.clone())
                    .or_insert_with(|| (Vec::new(), true));
                entry.1 &= hole.optional;
                if !action.is_empty() {
                    let path = format!("{}.{}.{}", action, entity, key);
                    if !entry.0.contains(&path) {
                        entry.0.push(path);
                    }
                }
            }
        });
        out
    }

    /// Aliases still present, in order of appearance.
    pub fn aliases(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.visit_values(|_, _, _, value| {
            out.extend(value.aliases().into_iter().map(str::to_string));
        });
        out
    }

    /// Whether any command has a run error.
    pub fn has_errors(&self) -> bool {
        self.command_nodes().any(CommandNode::has_error)
    }
}

/// Hole placeholder node, exported for pass construction.
pub fn hole(key: impl Into<String>) -> ParamValue {
    ParamValue::Hole(Hole::new(key))
}
