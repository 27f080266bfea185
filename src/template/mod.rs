//! Template language: parsing, compilation, execution and revert.
//!
//! A template is a linear list of `action entity key=value` commands and
//! `ident = expression` declarations. Text goes through [`parse`], then through
//! the compiler passes in [`compile`] which resolve declarations, holes,
//! aliases and references against the registered commands, and finally through
//! the [`runner`] which executes each command in order against a
//! [`crate::cloud::ControlPlane`]. Executed templates can be turned back into
//! undo templates with [`revert`].

/// Abstract syntax tree definitions for templates.
pub mod ast;
/// Multi-pass compiler.
pub mod compile;
/// Compile and run environments.
pub mod env;
/// Parameter specification algebra and validators.
pub mod params;
/// Line-oriented template parser.
pub mod parser;
/// Execution records, statistics and printers.
pub mod record;
/// Undo template synthesis.
pub mod revert;
/// Statement execution and the run orchestrator.
pub mod runner;
/// Time-ordered template identifiers.
pub mod ulid;
/// Advisory template validators.
pub mod validate;
/// Parameter value forms.
pub mod value;

pub use ast::{CommandNode, DeclarationNode, Expression, Statement, Template};
pub use compile::{CompileMode, compile};
pub use env::{CompileEnv, EnvSlot, RunEnv, SuggestionMode};
pub use params::{Rule, Spec, Validation, Validator};
pub use parser::{parse, parse_params};
pub use record::{ExecutionStats, TemplateExecution};
pub use revert::{is_revertible, revert};
pub use runner::{RunError, RunErrors, Runner};
pub use validate::TemplateValidator;
pub use value::{Hole, ParamValue, Value};

use thiserror::Error;

/// Convenience result alias for template operations.
pub type Result<T> = std::result::Result<T, TemplateError>;

/// Errors surfaced while parsing or compiling templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Malformed template text.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What went wrong, naming the offending symbol.
        message: String,
    },

    /// `(action, entity)` pair has no registered command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Parameter keys not described by the command specification.
    #[error("{command}: unexpected param(s): {}", .keys.join(", "))]
    UnexpectedParams {
        /// `action entity`
        command: String,
        /// Offending keys.
        keys: Vec<String>,
    },

    /// Required parameters still absent after resolution.
    #[error("{command}: missing required param(s): {}", .keys.join(", "))]
    MissingRequired {
        /// `action entity`
        command: String,
        /// Missing keys.
        keys: Vec<String>,
    },

    /// A validator rejected a parameter value.
    #[error("{command}: {message}")]
    InvalidParam {
        /// `action entity`
        command: String,
        /// Validator message.
        message: String,
    },

    /// Holes left after every resolution attempt.
    #[error("template contains unresolved holes: [{}]", .0.join(", "))]
    UnresolvedHoles(Vec<String>),

    /// Aliases left after every resolution attempt.
    #[error("template contains unresolved alias: [{}]", .0.join(", "))]
    UnresolvedAliases(Vec<String>),

    /// Forward, duplicate or self reference.
    #[error("{0}")]
    InvalidReference(String),

    /// Declaration bound to a command that produces no result.
    #[error("{command}: cannot assign result to '{ident}': command does not return a result")]
    CannotAssign {
        /// Declared identifier.
        ident: String,
        /// `action entity`
        command: String,
    },

    /// Several violations found in the same pass.
    #[error("{}", render_multiple(.0))]
    Multiple(Vec<TemplateError>),

    /// Execution record (de)serialization failed.
    #[error("invalid execution record: {0}")]
    Record(#[from] serde_json::Error),
}

impl TemplateError {
    /// Fold a list of errors: none, one, or [`TemplateError::Multiple`].
    pub fn aggregate(mut errors: Vec<TemplateError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TemplateError::Multiple(errors)),
        }
    }
}

fn render_multiple(errors: &[TemplateError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_keeps_single_errors_flat() {
        assert!(TemplateError::aggregate(Vec::new()).is_ok());
        let one = TemplateError::aggregate(vec![TemplateError::UnknownCommand("foo bar".into())]);
        assert!(matches!(one, Err(TemplateError::UnknownCommand(_))));
        let many = TemplateError::aggregate(vec![
            TemplateError::UnknownCommand("a b".into()),
            TemplateError::UnknownCommand("c d".into()),
        ])
        .unwrap_err();
        assert_eq!(many.to_string(), "unknown command 'a b'\nunknown command 'c d'");
    }

    #[test]
    fn unexpected_params_message() {
        let err = TemplateError::UnexpectedParams {
            command: "create instance".into(),
            keys: vec!["invalid".into()],
        };
        assert_eq!(err.to_string(), "create instance: unexpected param(s): invalid");
    }
}
